//! Log-structured storage engine.
//!
//! One append-only `kv.log` of length-prefixed CBOR records; every mutation
//! is fsynced before it returns. Opening replays the whole log into an
//! in-memory table, detects truncated tails, and rewrites the log when dead
//! records outnumber live ones.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::StoreError;

const LOG_FILE: &str = "kv.log";
const LOG_TMP_FILE: &str = "kv.log.tmp";

#[derive(Debug, Serialize, Deserialize)]
enum Record {
    Set {
        key: String,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    Delete {
        key: String,
    },
}

#[derive(Debug)]
pub struct LogEngine {
    path: PathBuf,
    file: File,
    live: IndexMap<String, Vec<u8>>,
    /// Superseded or deleted records currently sitting in the log.
    dead: usize,
}

impl LogEngine {
    pub fn open(dir: impl AsRef<Path>) -> Result<LogEngine, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        let path = dir.join(LOG_FILE);
        let (live, dead) = replay(&path)?;
        let mut engine = LogEngine {
            file: open_append(&path)?,
            path,
            live,
            dead,
        };
        if engine.dead > engine.live.len() {
            engine.compact()?;
        }
        Ok(engine)
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.live.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.live.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.live.keys().map(String::as_str)
    }

    /// Returns true when the key was newly inserted.
    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<bool, StoreError> {
        self.append(&Record::Set {
            key: key.to_string(),
            value: value.to_vec(),
        })?;
        let previous = self.live.insert(key.to_string(), value.to_vec());
        if previous.is_some() {
            self.dead += 1;
        }
        Ok(previous.is_none())
    }

    /// Returns true when the key existed.
    pub fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        if !self.live.contains_key(key) {
            return Ok(false);
        }
        self.append(&Record::Delete {
            key: key.to_string(),
        })?;
        self.live.shift_remove(key);
        self.dead += 2; // The Set it killed plus the tombstone itself.
        Ok(true)
    }

    fn append(&mut self, record: &Record) -> Result<(), StoreError> {
        let bytes = serde_cbor::to_vec(record)?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| StoreError::Corrupt("record larger than 4GiB".into()))?;
        self.file
            .write_all(&len.to_le_bytes())
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.file
            .write_all(&bytes)
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.file
            .sync_all()
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }

    /// Rewrites the log with only live records, via a temp file and rename.
    fn compact(&mut self) -> Result<(), StoreError> {
        let tmp_path = self
            .path
            .parent()
            .map(|p| p.join(LOG_TMP_FILE))
            .unwrap_or_else(|| PathBuf::from(LOG_TMP_FILE));
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
            for (key, value) in &self.live {
                let record = Record::Set {
                    key: key.clone(),
                    value: value.clone(),
                };
                let bytes = serde_cbor::to_vec(&record)?;
                tmp.write_all(&(bytes.len() as u32).to_le_bytes())
                    .map_err(|e| StoreError::io(&tmp_path, e))?;
                tmp.write_all(&bytes)
                    .map_err(|e| StoreError::io(&tmp_path, e))?;
            }
            tmp.sync_all().map_err(|e| StoreError::io(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        self.file = open_append(&self.path)?;
        self.dead = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))
}

fn replay(path: &Path) -> Result<(IndexMap<String, Vec<u8>>, usize), StoreError> {
    let mut live = IndexMap::new();
    let mut dead = 0usize;
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok((live, dead)),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    loop {
        let mut len_buf = [0u8; 4];
        let read = file
            .read(&mut len_buf)
            .map_err(|e| StoreError::io(path, e))?;
        if read == 0 {
            break;
        }
        if read < len_buf.len() {
            return Err(StoreError::Corrupt(format!(
                "truncated record header (read {read} bytes)"
            )));
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        if let Err(err) = file.read_exact(&mut buf) {
            if err.kind() == ErrorKind::UnexpectedEof {
                return Err(StoreError::Corrupt("truncated record payload".into()));
            }
            return Err(StoreError::io(path, err));
        }
        match serde_cbor::from_slice::<Record>(&buf)? {
            Record::Set { key, value } => {
                if live.insert(key, value).is_some() {
                    dead += 1;
                }
            }
            Record::Delete { key } => {
                if live.shift_remove(&key).is_some() {
                    dead += 2;
                }
            }
        }
    }
    Ok((live, dead))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = LogEngine::open(dir.path()).unwrap();
            assert!(engine.set("alpha", b"one").unwrap());
            assert!(engine.set("beta", b"two").unwrap());
            assert!(!engine.set("alpha", b"uno").unwrap());
        }
        let engine = LogEngine::open(dir.path()).unwrap();
        assert_eq!(engine.len(), 2);
        assert_eq!(engine.get("alpha"), Some(b"uno".as_ref()));
        assert_eq!(engine.get("beta"), Some(b"two".as_ref()));
    }

    #[test]
    fn deletes_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = LogEngine::open(dir.path()).unwrap();
            engine.set("alpha", b"one").unwrap();
            assert!(engine.delete("alpha").unwrap());
            assert!(!engine.delete("alpha").unwrap());
        }
        let engine = LogEngine::open(dir.path()).unwrap();
        assert!(engine.is_empty());
        assert_eq!(engine.get("alpha"), None);
    }

    #[test]
    fn detects_truncated_tail() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = LogEngine::open(dir.path()).unwrap();
            engine.set("alpha", b"payload").unwrap();
        }
        let log_path = dir.path().join(LOG_FILE);
        let len = fs::metadata(&log_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&log_path).unwrap();
        file.set_len(len - 1).unwrap();
        let err = LogEngine::open(dir.path()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn compaction_drops_dead_records() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = LogEngine::open(dir.path()).unwrap();
            for i in 0..10 {
                engine.set("churn", format!("v{i}").as_bytes()).unwrap();
            }
            engine.set("keep", b"stays").unwrap();
        }
        let before = fs::metadata(dir.path().join(LOG_FILE)).unwrap().len();
        {
            // Reopen triggers compaction: nine dead versions of "churn".
            let engine = LogEngine::open(dir.path()).unwrap();
            assert_eq!(engine.len(), 2);
        }
        let after = fs::metadata(dir.path().join(LOG_FILE)).unwrap().len();
        assert!(after < before);
        let engine = LogEngine::open(dir.path()).unwrap();
        assert_eq!(engine.get("churn"), Some(b"v9".as_ref()));
        assert_eq!(engine.get("keep"), Some(b"stays".as_ref()));
    }
}
