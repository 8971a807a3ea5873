//! File helpers for reading and writing JSON round artifacts.

use crate::error::{Result, RoundError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, create_dir_all};
use std::path::Path;

/// Reads a file into a string, mapping failures to [`RoundError::Io`].
pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|err| RoundError::Io(format!("failed to read {}: {err}", path.display())))
}

/// Decodes a JSON artifact; decoding failures surface as [`RoundError::Decode`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)
        .map_err(|err| RoundError::Io(format!("failed to read {}: {err}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| RoundError::Decode(format!("{}: {err}", path.display())))
}

/// Writes `value` as pretty JSON, creating parent directories as needed.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| RoundError::Decode(format!("failed to encode {}: {err}", path.display())))?;
    write_bytes(path, &data)
}

/// Writes raw bytes, creating parent directories as needed.
pub fn write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent)
            .map_err(|err| RoundError::Io(format!("failed to create {}: {err}", parent.display())))?;
    }
    fs::write(path, data)
        .map_err(|err| RoundError::Io(format!("failed to write {}: {err}", path.display())))
}

#[cfg(test)]
pub(crate) fn temp_path(prefix: &str) -> std::path::PathBuf {
    use std::time::{SystemTime, UNIX_EPOCH};
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("qf_round_{prefix}_{unique}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn json_round_trip_creates_directories() {
        let dir = temp_path("io");
        let path = dir.join("nested").join("value.json");
        let mut value = BTreeMap::new();
        value.insert("pollId".to_string(), 3u64);
        write_json(&path, &value).unwrap();
        let loaded: BTreeMap<String, u64> = read_json(&path).unwrap();
        assert_eq!(loaded, value);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_and_malformed_files() {
        let dir = temp_path("io_err");
        let missing = dir.join("absent.json");
        assert!(matches!(read_json::<u64>(&missing), Err(RoundError::Io(_))));
        write_bytes(&missing, b"{not json").unwrap();
        assert!(matches!(read_json::<u64>(&missing), Err(RoundError::Decode(_))));
        fs::remove_dir_all(&dir).unwrap();
    }
}
