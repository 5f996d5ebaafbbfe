//! Utility functions

use crate::error::{KilnError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    env, fs,
    io::Write,
    path::{Component, Path, PathBuf},
};

/// Normalizes `path` into the spelling used for entity identity.
///
/// Relative paths are joined onto `base` (or the process working directory when
/// no base is given), `.` and `..` components are folded away lexically and the
/// platform quirks `dunce` knows about are stripped. The path does not have to
/// exist, so targets can be named before they are produced.
pub fn normalize_path(path: impl AsRef<Path>, base: Option<&Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(KilnError::EmptyName);
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match base {
            Some(base) => base.join(path),
            None => env::current_dir().map_err(|err| KilnError::io(err, path))?.join(path),
        }
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            component => normalized.push(component),
        }
    }

    let normalized = dunce::simplified(&normalized).to_path_buf();

    #[cfg(windows)]
    let normalized = PathBuf::from(normalized.to_string_lossy().to_lowercase());

    Ok(normalized)
}

/// Creates the parent directory of the given file, if it does not exist yet.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| KilnError::io(err, parent))?;
    }
    Ok(())
}

/// Reads and deserializes the json file at `path`.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|err| KilnError::io(err, path))?;
    let value = serde_json::from_reader(std::io::BufReader::new(file))?;
    Ok(value)
}

/// Serializes `value` as json and atomically replaces the file at `path`.
///
/// The content is written to a temporary file in the same directory and
/// renamed over the destination, so readers never observe a half-written file.
pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    create_parent_dir_all(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|err| KilnError::io(err, dir))?;
    let mut writer = std::io::BufWriter::new(&mut file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush().map_err(|err| KilnError::io(err, path))?;
    drop(writer);
    file.persist(path).map_err(|err| KilnError::io(err.error, path))?;
    Ok(())
}
