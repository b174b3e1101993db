//! Atomic single-file replacement, the only durability discipline the
//! runtime relies on for JSON state.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

fn sibling_temp(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `path` via a sibling temp file and an atomic rename.
/// The parent directory is created if missing. A crash at any instant
/// leaves either the previous content or the new content on disk.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = sibling_temp(path);
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and [`atomic_write`] it.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("serializing state")?;
    atomic_write(path, &bytes)
}

/// Load a JSON state file, falling back to `T::default()` when the file is
/// missing or unreadable. Field-level defaulting is the caller's concern
/// (`#[serde(default)]` on the state struct), which together with this
/// function implements defaulted-merge on load.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state file unreadable, using defaults");
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct State {
        counter: u64,
        label: String,
    }

    #[test]
    fn write_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = State { counter: 42, label: "x".to_string() };
        atomic_write_json(&path, &state).unwrap();

        let back: State = load_json_or_default(&path);
        assert_eq!(back, state);
    }

    #[test]
    fn overwrite_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write_json(&path, &State { counter: 1, label: "a".into() }).unwrap();
        atomic_write_json(&path, &State { counter: 2, label: "b".into() }).unwrap();

        let back: State = load_json_or_default(&path);
        assert_eq!(back.counter, 2);
        // No temp file left behind.
        assert!(!path.with_file_name("state.json.tmp").exists());
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let back: State = load_json_or_default(&dir.path().join("absent.json"));
        assert_eq!(back, State::default());
    }

    #[test]
    fn corrupt_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let back: State = load_json_or_default(&path);
        assert_eq!(back, State::default());
    }

    #[test]
    fn partial_file_merges_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, br#"{"counter": 7}"#).unwrap();
        let back: State = load_json_or_default(&path);
        assert_eq!(back.counter, 7);
        assert_eq!(back.label, "");
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/nested/state.json");
        atomic_write_json(&path, &State::default()).unwrap();
        assert!(path.exists());
    }
}
