//! Output file writer.
//!
//! The serialized container is written to a temporary file in the destination
//! directory and renamed over the output path, so a failure never leaves a
//! truncated file behind and the input is never opened for writing.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::WriteError;

/// Writes `bytes` to `output`, copying the permission bits of `template` when given.
pub fn write_output(output: &Path, bytes: &[u8], template: Option<&Path>) -> Result<(), WriteError> {
    let io = |source| WriteError::Io {
        path: output.to_owned(),
        source,
    };
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir).map_err(io)?;
    temp.write_all(bytes).map_err(io)?;
    temp.as_file().sync_all().map_err(io)?;

    if let Some(template) = template {
        let permissions = fs::metadata(template).map_err(io)?.permissions();
        copy_mode(temp.as_file(), permissions).map_err(io)?;
    }
    temp.persist(output).map_err(|e| io(e.error))?;
    tracing::debug!(path = %output.display(), bytes = bytes.len(), "output written");
    Ok(())
}

#[cfg(unix)]
fn copy_mode(file: &fs::File, permissions: fs::Permissions) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(permissions.mode() & 0o7777))
}

#[cfg(not(unix))]
fn copy_mode(file: &fs::File, permissions: fs::Permissions) -> std::io::Result<()> {
    file.set_permissions(permissions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_the_output_atomically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("out.bin");
        fs::write(&output, b"old contents").expect("seed");
        write_output(&output, b"new", None).expect("writes");
        assert_eq!(fs::read(&output).expect("reads"), b"new");
        assert_eq!(fs::read_dir(dir.path()).expect("lists").count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn copies_executable_bits() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in");
        fs::write(&input, b"x").expect("seed");
        fs::set_permissions(&input, fs::Permissions::from_mode(0o750)).expect("chmod");
        let output = dir.path().join("out");
        write_output(&output, b"y", Some(&input)).expect("writes");
        let mode = fs::metadata(&output).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("missing").join("out");
        assert!(matches!(write_output(&output, b"y", None), Err(WriteError::Io { .. })));
        assert!(!output.exists());
    }
}
