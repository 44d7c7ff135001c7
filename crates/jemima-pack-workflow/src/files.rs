use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Write `contents` to a new file at `path`. Fails with
/// [`io::ErrorKind::AlreadyExists`] rather than replacing an existing file,
/// and never leaves a partially written file at `path`.
pub(crate) fn write_new(path: &Path, contents: &[u8]) -> io::Result<()> {
    staged(path, contents)?.persist_noclobber(path).map_err(|err| err.error)?;
    Ok(())
}

fn staged(path: &Path, contents: &[u8]) -> io::Result<NamedTempFile> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    Ok(temp)
}

/// Move `from` to `to`, falling back to copy and delete when a rename is
/// not possible (for example across filesystems). An existing `to` is an
/// error.
pub(crate) fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::File::open(to)?.sync_all()?;
    if let Err(err) = fs::remove_file(from) {
        let _ = fs::remove_file(to);
        return Err(err);
    }
    Ok(())
}

/// Final path component as text, for messages and records.
pub(crate) fn file_name(path: &Path) -> String {
    path.file_name().map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_new_refuses_to_clobber() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("QPACK_20240501_100000.sealed");
        write_new(&path, b"first")?;
        let err = match write_new(&path, b"second") {
            Ok(()) => panic!("second write must not replace the first"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&path)?, b"first");
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn move_file_keeps_an_existing_destination() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        fs::write(&from, b"from")?;
        fs::write(&to, b"to")?;
        assert!(move_file(&from, &to).is_err());
        assert_eq!(fs::read(&to)?, b"to");
        assert!(from.exists());

        fs::remove_file(&to)?;
        move_file(&from, &to)?;
        assert!(!from.exists());
        assert_eq!(fs::read(&to)?, b"from");
        Ok(())
    }
}
