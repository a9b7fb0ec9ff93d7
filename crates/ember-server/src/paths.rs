//! Path utilities for locating the inference server.

use std::path::{Path, PathBuf};

/// Name of the bundled server executable.
pub fn server_binary_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "ember-server.exe"
    } else {
        "ember-server"
    }
}

/// Get the application's resource directory.
///
/// On macOS bundles this is `Contents/Resources` next to `Contents/MacOS`;
/// elsewhere it is the directory holding the running executable.
pub fn resources_dir() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    resources_dir_for(&exe_dir)
}

fn resources_dir_for(exe_dir: &Path) -> PathBuf {
    if cfg!(target_os = "macos") && exe_dir.ends_with("Contents/MacOS") {
        if let Some(contents) = exe_dir.parent() {
            return contents.join("Resources");
        }
    }
    exe_dir.to_path_buf()
}

/// Get the path to the packaged server executable inside a resource directory.
pub fn packaged_server_path(resources: &Path) -> PathBuf {
    resources.join("server").join(server_binary_name())
}

/// Get the directory the development server module is run from.
///
/// The shell runs from its own subdirectory, so the server package lives one
/// level up.
pub fn development_root() -> PathBuf {
    PathBuf::from("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packaged_server_path() {
        let path = packaged_server_path(Path::new("/opt/ember"));
        assert_eq!(
            path,
            Path::new("/opt/ember").join("server").join(server_binary_name())
        );
    }

    #[test]
    fn test_plain_exe_dir_is_resources_dir() {
        let dir = Path::new("/usr/lib/ember");
        assert_eq!(resources_dir_for(dir), dir);
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_macos_bundle_resources_dir() {
        let dir = Path::new("/Applications/Ember.app/Contents/MacOS");
        assert_eq!(
            resources_dir_for(dir),
            Path::new("/Applications/Ember.app/Contents/Resources")
        );
    }
}
