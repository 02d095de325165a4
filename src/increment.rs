//! Persisted monotonic part-id counter.

use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::{StorageResult, TracedStorageError};

/// Hands out strictly increasing part ids, persisting the last value to
/// `increment.txt` (ASCII decimal) on every allocation.
pub struct Increment {
    path: PathBuf,
    value: Mutex<u64>,
}

impl Increment {
    pub fn open(path: PathBuf) -> StorageResult<Self> {
        let value = match std::fs::read_to_string(&path) {
            Ok(text) => text
                .trim()
                .parse()
                .map_err(|e| TracedStorageError::decode(format!("bad increment file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            value: Mutex::new(value),
        })
    }

    pub fn next(&self) -> StorageResult<u64> {
        let mut value = self.value.lock();
        *value += 1;
        std::fs::write(&self.path, value.to_string())?;
        Ok(*value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("increment.txt");

        let increment = Increment::open(path.clone()).unwrap();
        assert_eq!(increment.next().unwrap(), 1);
        assert_eq!(increment.next().unwrap(), 2);
        drop(increment);

        let increment = Increment::open(path).unwrap();
        assert_eq!(increment.next().unwrap(), 3);
    }
}
