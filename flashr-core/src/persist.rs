//! Atomic JSON files for the durable stores.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Reads `path` as JSON, or returns `T::default()` when the file is missing.
pub(crate) fn read_json_or_default<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match fs::read_to_string(path) {
        Ok(s) => serde_json::from_str(&s).with_context(|| format!("parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

/// Writes `value` as pretty JSON to a temp file next to `path`, syncs it,
/// then renames it over `path`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut tmp, value).context("serialize JSON")?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all().context("fsync temp file")?;
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_reads_as_default() {
        let dir = tempdir().unwrap();
        let value: Vec<String> = read_json_or_default(&dir.path().join("nope.json")).unwrap();
        assert!(value.is_empty());
    }

    #[test]
    fn writes_replace_previous_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");

        write_json_atomic(&path, &vec!["a".to_string()]).unwrap();
        write_json_atomic(&path, &vec!["b".to_string(), "c".to_string()]).unwrap();

        let value: Vec<String> = read_json_or_default(&path).unwrap();
        assert_eq!(value, vec!["b", "c"]);
        // Only the final file remains, no stray temp files.
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(read_json_or_default::<Vec<String>>(&path).is_err());
    }
}
