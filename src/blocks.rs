//! Time-block store: date-scoped windows during which automated playback
//! must stay quiet. Persisted as `{"blocks": [...]}` in a single JSON file.

use crate::error::Result;
use crate::timefmt;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    #[serde(with = "timefmt::date")]
    pub date: NaiveDate,
    #[serde(with = "timefmt::hm")]
    pub start_time: NaiveTime,
    #[serde(with = "timefmt::hm")]
    pub end_time: NaiveTime,
}

impl Block {
    pub fn new(date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime) -> Self {
        Self {
            date,
            start_time,
            end_time,
        }
    }

    /// Build a block from its text form (`YYYY-MM-DD`, `HH:MM`, `HH:MM`).
    pub fn parse(date: &str, start_time: &str, end_time: &str) -> Result<Self> {
        Ok(Self::new(
            timefmt::parse_date(date)?,
            timefmt::parse_time(start_time)?,
            timefmt::parse_time(end_time)?,
        ))
    }

    /// True when `now` falls inside `[start_time, end_time]` on the block's
    /// date, compared at minute resolution. A block whose start is after its
    /// end is never active.
    pub fn is_active_at(&self, now: NaiveDateTime) -> bool {
        if now.date() != self.date {
            return false;
        }
        let minute = timefmt::truncate_to_minute(now.time());
        self.start_time <= minute && minute <= self.end_time
    }

    pub fn start(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }

    pub fn end(&self) -> NaiveDateTime {
        self.date.and_time(self.end_time)
    }

    pub fn is_overnight(&self) -> bool {
        self.start_time > self.end_time
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}-{}",
            timefmt::format_date(self.date),
            timefmt::format_time(self.start_time),
            timefmt::format_time(self.end_time)
        )
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BlockFile {
    #[serde(default)]
    blocks: Vec<Block>,
}

/// JSON-backed block list. Loads from disk on every read and saves after
/// every mutation, so edits made by the CLI while the service runs are seen
/// on the next check.
pub struct BlockStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl BlockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored blocks. A missing file is an empty list; an unreadable or
    /// corrupt file is logged and treated as empty.
    pub fn list(&self) -> Vec<Block> {
        match self.try_load() {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read block file; treating as empty");
                Vec::new()
            }
        }
    }

    fn try_load(&self) -> Result<Vec<Block>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path)?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: BlockFile = serde_json::from_str(&data)?;
        Ok(file.blocks)
    }

    fn save(&self, blocks: Vec<Block>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&BlockFile { blocks })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Add a block. Returns `Ok(false)` if an identical block already exists.
    pub fn add(&self, block: &Block) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut blocks = self.try_load()?;
        if blocks.contains(block) {
            return Ok(false);
        }
        if block.is_overnight() {
            warn!(date = %block.date, start = %block.start_time, end = %block.end_time,
                "Block starts after it ends and will never be active");
        }
        blocks.push(block.clone());
        self.save(blocks)?;
        info!(date = %block.date, start = %block.start_time, end = %block.end_time, "Block added");
        Ok(true)
    }

    /// Remove a block. Returns `Ok(false)` if it was not stored.
    pub fn remove(&self, block: &Block) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut blocks = self.try_load()?;
        let before = blocks.len();
        blocks.retain(|b| b != block);
        if blocks.len() == before {
            return Ok(false);
        }
        self.save(blocks)?;
        info!(date = %block.date, start = %block.start_time, end = %block.end_time, "Block removed");
        Ok(true)
    }

    /// Blocks dated `date`.
    pub fn for_date(&self, date: NaiveDate) -> Vec<Block> {
        self.list().into_iter().filter(|b| b.date == date).collect()
    }

    /// True if any block dated `now`'s day is active at `now`.
    pub fn is_blocked_at(&self, now: NaiveDateTime) -> bool {
        self.for_date(now.date()).iter().any(|b| b.is_active_at(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn block(date: &str, start: &str, end: &str) -> Block {
        Block::parse(date, start, end).unwrap()
    }

    #[test]
    fn parse_rejects_bad_formats() {
        assert!(Block::parse("2024-13-01", "10:00", "11:00").is_err());
        assert!(Block::parse("2024-01-01", "10", "11:00").is_err());
        assert!(Block::parse("2024-01-01", "10:00", "11:00:00").is_err());
    }

    #[test]
    fn active_window_is_inclusive_at_minute_resolution() {
        let b = block("2024-03-04", "10:00", "10:05");
        assert!(!b.is_active_at(dt("2024-03-04 09:59:59")));
        assert!(b.is_active_at(dt("2024-03-04 10:00:00")));
        assert!(b.is_active_at(dt("2024-03-04 10:05:59")));
        assert!(!b.is_active_at(dt("2024-03-04 10:06:00")));
        assert!(!b.is_active_at(dt("2024-03-05 10:02:00")));
    }

    #[test]
    fn overnight_block_is_never_active() {
        let b = block("2024-03-04", "23:00", "01:00");
        assert!(b.is_overnight());
        assert!(!b.is_active_at(dt("2024-03-04 23:30:00")));
        assert!(!b.is_active_at(dt("2024-03-04 00:30:00")));
    }

    #[test]
    fn serializes_in_text_form() {
        let b = block("2024-03-04", "10:00", "10:05");
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["date"], "2024-03-04");
        assert_eq!(json["start_time"], "10:00");
        assert_eq!(json["end_time"], "10:05");
    }

    #[test]
    fn add_rejects_duplicates_and_persists() {
        let dir = tempdir().unwrap();
        let store = BlockStore::new(dir.path().join("blocks.json"));
        let b = block("2024-03-04", "10:00", "10:05");

        assert!(store.add(&b).unwrap());
        assert!(!store.add(&b).unwrap());

        let reopened = BlockStore::new(dir.path().join("blocks.json"));
        assert_eq!(reopened.list(), vec![b]);
    }

    #[test]
    fn remove_reports_missing_block() {
        let dir = tempdir().unwrap();
        let store = BlockStore::new(dir.path().join("blocks.json"));
        let b = block("2024-03-04", "10:00", "10:05");
        assert!(!store.remove(&b).unwrap());
        store.add(&b).unwrap();
        assert!(store.remove(&b).unwrap());
        assert!(store.list().is_empty());
    }

    #[test]
    fn missing_and_corrupt_files_read_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.json");
        let store = BlockStore::new(&path);
        assert!(store.list().is_empty());

        fs::write(&path, "{ not json").unwrap();
        assert!(store.list().is_empty());
        assert!(store.add(&block("2024-03-04", "10:00", "10:05")).is_err());
    }

    #[test]
    fn reads_file_written_by_hand() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.json");
        fs::write(
            &path,
            r#"{"blocks": [{"date": "2024-03-04", "start_time": "08:00", "end_time": "09:00"}]}"#,
        )
        .unwrap();
        let store = BlockStore::new(&path);
        assert!(store.is_blocked_at(dt("2024-03-04 08:30:00")));
        assert!(!store.is_blocked_at(dt("2024-03-04 09:01:00")));
        assert_eq!(store.for_date(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()).len(), 1);
    }
}
