//! Stats accumulation, experiment identity and the persisted stats table.

pub mod combine;
pub mod error;
pub mod stats;
pub mod store;
pub mod table;
pub mod task;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub use combine::combine;
pub use error::{Result, StatsError};
pub use stats::{AnalysisStats, TaskStats};
pub use store::{ensure_table_exists, read_stats_from_csv_files, ExistingData};
pub use task::{strong_id, Exhausted, Targets, Task, WorkDeficit};

/// Compact JSON with object keys in sorted order.
pub fn canonical_json(value: &Value) -> String {
    // serde_json's default map is a BTreeMap, so keys serialize sorted.
    value.to_string()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| StatsError::Persistence {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `bytes` to a sibling temp file, syncs it, then renames it over
/// `path`. Readers see either the old file or the new one.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let persist_err = |source| StatsError::Persistence {
        path: path.to_path_buf(),
        source,
    };
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(persist_err(e));
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_and_is_compact() {
        let v: Value = serde_json::from_str(r#"{ "p": 0.02, "c": "rep", "d": 3 }"#).expect("json");
        assert_eq!(canonical_json(&v), r#"{"c":"rep","d":3,"p":0.02}"#);
        assert_eq!(canonical_json(&json!({"path": "a.dem"})), r#"{"path":"a.dem"}"#);
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let root = std::env::temp_dir().join(format!(
            "shotlab_atomic_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("a").join("file.csv");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_bytes(&path, b"second").expect("second write");
        assert_eq!(fs::read(&path).expect("read"), b"second");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn atomic_write_failure_leaves_target_untouched() {
        let root = std::env::temp_dir().join(format!(
            "shotlab_atomic_fail_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("root");
        // A directory at the target path makes the rename fail.
        let target = root.join("occupied");
        ensure_dir(&target.join("child")).expect("occupied dir");
        let err = atomic_write_bytes(&target, b"data").expect_err("rename onto dir");
        assert!(matches!(err, StatsError::Persistence { .. }));
        let leftovers = fs::read_dir(&root)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
        let _ = fs::remove_dir_all(root);
    }
}
