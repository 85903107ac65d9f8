//! Small filesystem helpers shared by the file-backed stores.

use std::io;
use std::path::Path;

use serde::Serialize;

/// Write `value` as pretty JSON to `path` atomically.
///
/// Writes `<path>.tmp` first and renames it over `path`, so readers never
/// see a partially written file. Creates the parent directory if needed.
///
/// # Errors
///
/// Returns `io::Error` if serialization, directory creation, writing, or
/// renaming fails.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)
}

/// Read a file, mapping "not found" to `Ok(None)`.
///
/// # Errors
///
/// Returns `io::Error` for any failure other than a missing file.
pub(crate) fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Encode an arbitrary id as a portable file stem.
///
/// ASCII letters, digits, `-` and `_` pass through; every other byte
/// becomes `%XX`. The mapping is injective, so distinct ids never share a
/// file.
pub(crate) fn file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ids_pass_through() {
        assert_eq!(file_stem("acc-42_b"), "acc-42_b");
    }

    #[test]
    fn path_characters_are_escaped() {
        assert_eq!(file_stem("../etc"), "%2E%2E%2Fetc");
        assert_eq!(file_stem("a b"), "a%20b");
        assert_ne!(file_stem("a%20b"), file_stem("a b"));
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("nested").join("doc.json");
        write_json_atomic(&path, &serde_json::json!({"position": 3})).expect("write");

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let bytes = read_if_exists(&path).expect("read").expect("file exists");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("valid json");
        assert_eq!(value["position"], 3);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        assert!(
            read_if_exists(&dir.path().join("absent.json"))
                .expect("read")
                .is_none()
        );
    }
}
