use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Validates a file name announced by a peer.
///
/// The name must be a single plain path component. Rejects:
/// - Empty names and `.`/`..`
/// - Absolute paths and Windows prefixes (`C:`, `\\server`)
/// - Anything containing a directory separator
pub fn validate_remote_filename(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(TransferError::InvalidPath(format!(
            "file name contains a separator: {name}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir | Component::CurDir), _) => Err(TransferError::InvalidPath(
            format!("directory reference not allowed: {name}"),
        )),
        (Some(Component::Prefix(_) | Component::RootDir), _) => Err(
            TransferError::InvalidPath(format!("absolute path not allowed: {name}")),
        ),
        _ => Err(TransferError::InvalidPath(format!(
            "file name must be a single component: {name}"
        ))),
    }
}

/// Joins a validated remote file name onto a local download directory.
pub fn local_path_for(dir: &Path, name: &str) -> Result<PathBuf, TransferError> {
    validate_remote_filename(name)?;
    Ok(dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty() {
        assert!(validate_remote_filename("").is_err());
    }

    #[test]
    fn rejects_parent_dir() {
        assert!(validate_remote_filename("..").is_err());
        assert!(validate_remote_filename("../passwd").is_err());
    }

    #[test]
    fn rejects_current_dir() {
        assert!(validate_remote_filename(".").is_err());
    }

    #[test]
    fn rejects_absolute() {
        assert!(validate_remote_filename("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_subdirectories() {
        assert!(validate_remote_filename("sub/file.txt").is_err());
        assert!(validate_remote_filename("sub\\file.txt").is_err());
    }

    #[test]
    fn accepts_plain_names() {
        assert!(validate_remote_filename("photo.jpg").is_ok());
        assert!(validate_remote_filename(".bashrc").is_ok());
        assert!(validate_remote_filename("notes v2 (final).txt").is_ok());
    }

    #[test]
    fn local_path_joins_directory() {
        let path = local_path_for(Path::new("/downloads"), "a.txt").unwrap();
        assert_eq!(path, PathBuf::from("/downloads/a.txt"));
        assert!(local_path_for(Path::new("/downloads"), "../a.txt").is_err());
    }
}
