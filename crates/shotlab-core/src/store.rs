use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Result, StatsError};
use crate::stats::{AnalysisStats, TaskStats};
use crate::table::{parse_numbered_rows, render_table};
use crate::task::Task;
use crate::{atomic_write_bytes, canonical_json};

/// Accumulated stats keyed by strong id.
///
/// Every mutation goes through [`ExistingData::add`], which refuses to fold
/// a row into an identity that was recorded with a different decoder or
/// metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExistingData {
    data: BTreeMap<String, TaskStats>,
}

impl ExistingData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let mut out = Self::new();
        out.load_file(path)?;
        Ok(out)
    }

    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut out = Self::new();
        for path in paths {
            out.load_file(path.as_ref())?;
        }
        Ok(out)
    }

    fn load_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|source| StatsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        for (line, row) in parse_numbered_rows(&text, path)? {
            self.add(row).map_err(|err| match err {
                StatsError::CountOverflow { strong_id } => StatsError::MalformedRecord {
                    path: path.to_path_buf(),
                    line,
                    reason: format!("counts for {} overflow when merged", strong_id),
                },
                other => other,
            })?;
        }
        Ok(())
    }

    /// Folds `row` into the store.
    pub fn add(&mut self, row: TaskStats) -> Result<()> {
        match self.data.get_mut(&row.strong_id) {
            Some(existing) => {
                if existing.decoder != row.decoder || existing.json_metadata != row.json_metadata
                {
                    let first = describe(existing);
                    let second = describe(&row);
                    return Err(StatsError::IdentityCollision {
                        strong_id: row.strong_id,
                        first,
                        second,
                    });
                }
                existing.stats = existing.stats.merge(&row.stats).ok_or_else(|| {
                    StatsError::CountOverflow {
                        strong_id: row.strong_id.clone(),
                    }
                })?;
            }
            None => {
                self.data.insert(row.strong_id.clone(), row);
            }
        }
        Ok(())
    }

    /// Folds a sampling increment for `task` into the store.
    pub fn add_increment(&mut self, task: &Task, increment: AnalysisStats) -> Result<()> {
        self.add(TaskStats {
            strong_id: task.strong_id().to_string(),
            decoder: task.decoder().to_string(),
            json_metadata: task.json_metadata().clone(),
            stats: increment,
        })
    }

    pub fn get(&self, strong_id: &str) -> Option<&TaskStats> {
        self.data.get(strong_id)
    }

    /// Zero when nothing has been recorded for `strong_id`.
    pub fn stats_for(&self, strong_id: &str) -> AnalysisStats {
        self.data
            .get(strong_id)
            .map(|row| row.stats)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskStats> {
        self.data.values()
    }

    /// Rows ordered by shots ascending, ties broken by strong id.
    pub fn sorted_rows(&self) -> Vec<&TaskStats> {
        let mut rows: Vec<&TaskStats> = self.data.values().collect();
        rows.sort_by(|a, b| {
            a.stats
                .shots
                .cmp(&b.stats.shots)
                .then_with(|| a.strong_id.cmp(&b.strong_id))
        });
        rows
    }

    pub fn to_table_string(&self) -> String {
        render_table(self.sorted_rows())
    }

    /// Writes the canonical table to `path` via temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_bytes(path, self.to_table_string().as_bytes())
    }
}

impl IntoIterator for ExistingData {
    type Item = TaskStats;
    type IntoIter = std::collections::btree_map::IntoValues<String, TaskStats>;

    fn into_iter(self) -> Self::IntoIter {
        self.data.into_values()
    }
}

fn describe(row: &TaskStats) -> String {
    format!(
        "decoder={} json_metadata={}",
        row.decoder,
        canonical_json(&row.json_metadata)
    )
}

/// Loads and merges tables, returning one record per strong id.
pub fn read_stats_from_csv_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<TaskStats>> {
    let data = ExistingData::from_files(paths)?;
    Ok(data.sorted_rows().into_iter().cloned().collect())
}

/// Creates a header-only table at `path` unless a file is already there.
pub fn ensure_table_exists(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    ExistingData::new().save(path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_dir;
    use std::path::PathBuf;
    use crate::task::Targets;
    use serde_json::json;

    fn temp_dir_for(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "shotlab_{}_{}_{}",
            label,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ))
    }

    const INPUT: &str = r#"
shots,errors,discards,seconds,decoder,strong_id,json_metadata
300,1,20,1.0,greedy,f256bab362f516ebe4d59a08ae67330ff7771ff738757cd738f4b30605ddccf6,"{""path"":""a.dem""}"
300,100,200,2.0,greedy,f256bab362f516ebe4d59a08ae67330ff7771ff738757cd738f4b30605ddccf6,"{""path"":""a.dem""}"
9,5,4,6.0,greedy,5fe5a6cd4226b1a910d57e5479d1ba6572e0b3115983c9516360916d1670000f,"{""path"":""b.dem""}"
"#;

    #[test]
    fn from_file_folds_rows_by_identity() {
        let root = temp_dir_for("store_fold");
        ensure_dir(&root).expect("temp dir");
        let path = root.join("input.csv");
        fs::write(&path, INPUT.trim()).expect("write");

        let data = ExistingData::from_file(&path).expect("load");
        assert_eq!(data.len(), 2);
        let a = data
            .get("f256bab362f516ebe4d59a08ae67330ff7771ff738757cd738f4b30605ddccf6")
            .expect("row a");
        assert_eq!(a.stats, AnalysisStats::new(600, 101, 220, 3.0));
        assert_eq!(a.json_metadata, json!({"path": "a.dem"}));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn add_rejects_conflicting_metadata() {
        let mut data = ExistingData::new();
        let row = TaskStats {
            strong_id: "abc".to_string(),
            decoder: "greedy".to_string(),
            json_metadata: json!({"d": 3}),
            stats: AnalysisStats::new(10, 1, 0, 0.1),
        };
        data.add(row.clone()).expect("first add");
        let mut clash = row.clone();
        clash.json_metadata = json!({"d": 5});
        let err = data.add(clash).expect_err("collision");
        assert!(matches!(err, StatsError::IdentityCollision { .. }));
        let mut clash = row;
        clash.decoder = "vacuous".to_string();
        assert!(data.add(clash).is_err());
        assert_eq!(data.stats_for("abc"), AnalysisStats::new(10, 1, 0, 0.1));
    }

    #[test]
    fn sorted_rows_order_by_shots_then_id() {
        let mut data = ExistingData::new();
        for (id, shots) in [("b", 5u64), ("a", 5), ("c", 1)] {
            data.add(TaskStats {
                strong_id: id.to_string(),
                decoder: "greedy".to_string(),
                json_metadata: json!(null),
                stats: AnalysisStats::new(shots, 0, 0, 0.0),
            })
            .expect("add");
        }
        let ids: Vec<&str> = data
            .sorted_rows()
            .iter()
            .map(|r| r.strong_id.as_str())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn save_then_load_preserves_store() {
        let root = temp_dir_for("store_save");
        let path = root.join("nested").join("out.csv");
        let task = Task::new(
            "error(0.1) D0 L0\n",
            "greedy",
            json!({"path": "x.dem"}),
            Targets::new(10, None).expect("targets"),
        );
        let mut data = ExistingData::new();
        data.add_increment(&task, AnalysisStats::new(100, 7, 2, 0.75))
            .expect("add");
        data.save(&path).expect("save");
        let loaded = ExistingData::from_file(&path).expect("load");
        assert_eq!(loaded, data);
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn ensure_table_exists_only_creates_once() {
        let root = temp_dir_for("store_ensure");
        let path = root.join("resume.csv");
        assert!(ensure_table_exists(&path).expect("create"));
        let before = fs::read_to_string(&path).expect("read");
        assert_eq!(before.lines().count(), 1);
        assert!(!ensure_table_exists(&path).expect("exists"));
        assert_eq!(fs::read_to_string(&path).expect("read"), before);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn read_stats_returns_folded_sorted_records() {
        let root = temp_dir_for("store_read");
        ensure_dir(&root).expect("temp dir");
        let first = root.join("first.csv");
        let second = root.join("second.csv");
        fs::write(&first, INPUT.trim()).expect("write first");
        fs::write(
            &second,
            "shots,errors,discards,seconds,decoder,strong_id,json_metadata\n\
             0,0,0,0.0,vacuous,00aa,{}\n\
             7,0,7,0.5,greedy,00bb,{}\n",
        )
        .expect("write second");

        let rows = read_stats_from_csv_files(&[&first, &second]).expect("read");
        let shots: Vec<u64> = rows.iter().map(|r| r.stats.shots).collect();
        assert_eq!(shots, vec![0, 7, 9, 600]);
        assert_eq!(rows[0].strong_id, "00aa");
        assert_eq!(rows[0].error_rate(), None);
        assert_eq!(rows[1].error_rate(), None);
        assert_eq!(rows[1].discard_rate(), Some(1.0));
        assert_eq!(rows[2].error_rate(), Some(1.0));
        assert_eq!(rows[3].stats, AnalysisStats::new(600, 101, 220, 3.0));
        assert_eq!(rows[3].error_rate(), Some(101.0 / 380.0));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn overflowing_rows_name_the_file_and_line() {
        let root = temp_dir_for("store_overflow");
        ensure_dir(&root).expect("temp dir");
        let path = root.join("huge.csv");
        fs::write(
            &path,
            "shots,errors,discards,seconds,decoder,strong_id,json_metadata\n\
             18446744073709551615,0,0,1.0,greedy,abc,{}\n",
        )
        .expect("write");
        let err = ExistingData::from_files(&[&path, &path]).expect_err("overflow");
        match err {
            StatsError::MalformedRecord { path: p, line, reason } => {
                assert_eq!(p, path);
                assert_eq!(line, 2);
                assert!(reason.contains("overflow"), "{}", reason);
            }
            other => panic!("unexpected error: {}", other),
        }

        let mut data = ExistingData::new();
        let row = TaskStats {
            strong_id: "abc".to_string(),
            decoder: "greedy".to_string(),
            json_metadata: json!({}),
            stats: AnalysisStats::new(u64::MAX, 0, 0, 1.0),
        };
        data.add(row.clone()).expect("first add");
        assert!(matches!(
            data.add(row),
            Err(StatsError::CountOverflow { .. })
        ));
        assert_eq!(data.stats_for("abc").shots, u64::MAX);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ExistingData::from_file(Path::new("/definitely/not/here.csv"))
            .expect_err("missing");
        assert!(matches!(err, StatsError::Io { .. }));
    }
}
