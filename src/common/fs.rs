use std::fs::{self, DirBuilder};
use std::io::{self, ErrorKind};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

/// Creates `path` and its missing parents with owner-only permissions.
/// An existing directory is left as is.
pub fn create_private_dir(path: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o700).create(path)
}

/// Removes `path` if it exists. A missing directory is not an error.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Leaves an empty private directory at `path`, wiping whatever was there.
pub fn reset_dir(path: &Path) -> io::Result<()> {
    remove_dir_if_exists(path)?;
    create_private_dir(path)
}
