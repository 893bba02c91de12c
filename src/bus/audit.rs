//! Append-only audit trail of published messages
//!
//! One newline-delimited file per bus lifetime, write-only; the core
//! never reads it back. Audit failures are reported to the caller and
//! downgraded to warnings by the bus — replication never stalls on disk.

use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Open a fresh log file in `dir`, creating the directory if needed.
    pub fn create(dir: impl AsRef<Path>) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let name = format!("bus_messages_{}.log", Utc::now().format("%Y%m%d_%H%M%S%f"));
        let path = dir.as_ref().join(name);
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one published payload as a record of its own line.
    pub fn append(&self, payload: &[u8]) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(payload)?;
        file.write_all(b"\n")?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_one_line_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::create(dir.path()).unwrap();

        log.append(br#"{"operation_type":"create"}"#).unwrap();
        log.append(br#"{"operation_type":"update"}"#).unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("create"));
        assert!(lines[1].contains("update"));
    }

    #[test]
    fn test_each_log_gets_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = AuditLog::create(dir.path()).unwrap();
        let second = AuditLog::create(dir.path()).unwrap();
        assert_ne!(first.path(), second.path());
    }
}
