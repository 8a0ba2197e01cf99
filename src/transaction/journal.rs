// src/transaction/journal.rs

//! Append-only swap journal for crash recovery
//!
//! Each record is written as a single line with a CRC32 checksum:
//!
//! Format: `{crc32_hex}|{json}\n`
//!
//! The same line format is used for persisted filesystem snapshots. Phase
//! barriers fsync the journal before the next destructive step.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Encode one record as a checksummed line, newline included
pub(crate) fn encode_record<T: Serialize>(record: &T) -> Result<String> {
    let json = serde_json::to_string(record)?;
    let crc = crc32fast::hash(json.as_bytes());
    Ok(format!("{:08x}|{}\n", crc, json))
}

/// Decode one checksummed line
pub(crate) fn decode_line<T: DeserializeOwned>(line: &str) -> std::result::Result<T, String> {
    let (crc, json) = line
        .split_once('|')
        .ok_or_else(|| "missing delimiter".to_string())?;
    let expected = u32::from_str_radix(crc, 16).map_err(|_| format!("invalid CRC32 {}", crc))?;
    let actual = crc32fast::hash(json.as_bytes());
    if expected != actual {
        return Err(format!(
            "CRC mismatch: expected {:08x}, got {:08x}",
            expected, actual
        ));
    }
    serde_json::from_str(json).map_err(|e| e.to_string())
}

/// A record in the swap journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SwapRecord {
    /// Swap started; names are top-level entries of the installation
    Begin {
        swap_id: String,
        home: PathBuf,
        staged: PathBuf,
        old_entries: Vec<String>,
        new_entries: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// Every old entry sits in the work directory
    OldMoved,
    /// Every staged entry is in place; point of no return
    Committed,
}

/// Journal of one swap
pub struct SwapJournal {
    path: PathBuf,
    file: File,
}

impl SwapJournal {
    /// Journal path for a swap id inside `dir`
    pub fn path_for(dir: &Path, swap_id: &str) -> PathBuf {
        dir.join(format!("swap-{}.journal", swap_id))
    }

    pub fn create(dir: &Path, swap_id: &str) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let path = Self::path_for(dir, swap_id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a record and fsync
    pub fn write_barrier(&mut self, record: &SwapRecord) -> Result<()> {
        let line = encode_record(record)?;
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync_all())
            .map_err(|e| Error::io(&self.path, e))
    }

    /// Delete the journal once the swap is settled
    pub fn delete(self) -> Result<()> {
        delete_journal(&self.path)
    }
}

/// Read every valid record; reading stops at the first torn or corrupted line
pub fn read_records(path: &Path) -> Result<Vec<SwapRecord>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut records = Vec::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| Error::io(path, e))?;
        if line.is_empty() {
            continue;
        }
        match decode_line(&line) {
            Ok(record) => records.push(record),
            Err(reason) => {
                warn!(
                    "Journal {} line {}: {}; ignoring the rest",
                    path.display(),
                    line_num + 1,
                    reason
                );
                break;
            }
        }
    }
    Ok(records)
}

pub(crate) fn delete_journal(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Swap journals left in `dir` by interrupted swaps
pub fn find_journals(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut journals = Vec::new();
    if !dir.exists() {
        return Ok(journals);
    }
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.is_file()
            && path.extension().is_some_and(|e| e == "journal")
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("swap-"))
        {
            journals.push(path);
        }
    }
    journals.sort();
    Ok(journals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn begin() -> SwapRecord {
        SwapRecord::Begin {
            swap_id: "abc".to_string(),
            home: PathBuf::from("/srv/app"),
            staged: PathBuf::from("/srv/app/.installation/tmp/staging-1"),
            old_entries: vec!["bin".to_string()],
            new_entries: vec!["bin".to_string(), "lib".to_string()],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_write_and_read() {
        let temp = TempDir::new().unwrap();
        let mut journal = SwapJournal::create(temp.path(), "abc").unwrap();
        journal.write_barrier(&begin()).unwrap();
        journal.write_barrier(&SwapRecord::OldMoved).unwrap();

        let records = read_records(journal.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], SwapRecord::OldMoved);
        assert_eq!(find_journals(temp.path()).unwrap().len(), 1);

        journal.delete().unwrap();
        assert!(find_journals(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_torn_line_stops_reading() {
        let temp = TempDir::new().unwrap();
        let mut journal = SwapJournal::create(temp.path(), "abc").unwrap();
        journal.write_barrier(&begin()).unwrap();
        let path = journal.path().to_path_buf();
        drop(journal);

        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("deadbeef|{\"type\":\"Comm");
        fs::write(&path, content).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let line = encode_record(&SwapRecord::Committed).unwrap();
        let tampered = line.trim_end().replace("Committed", "OldMoved");
        assert!(decode_line::<SwapRecord>(&tampered).is_err());
        assert_eq!(
            decode_line::<SwapRecord>(line.trim_end()).unwrap(),
            SwapRecord::Committed
        );
    }
}
