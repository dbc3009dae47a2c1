//! Persisted metrics snapshots: a JSON-array or NDJSON file trimmed to a
//! snapshot count and byte cap, serialised by an advisory `.lock` sibling.

use super::MetricsSnapshot;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    /// One JSON array holding every snapshot.
    JsonArray,
    /// One snapshot per line.
    Ndjson,
}

pub struct SnapshotStore {
    path: PathBuf,
    format: StoreFormat,
    max_snapshots: usize,
    max_bytes: u64,
}

/// Advisory lock held while the store file is touched. The sibling
/// `<file>.lock` is created exclusively and removed on drop; a stale lock
/// older than the takeover age is broken.
struct FileLock {
    path: PathBuf,
}

const LOCK_RETRY: Duration = Duration::from_millis(10);
const LOCK_TIMEOUT: Duration = Duration::from_millis(500);
const LOCK_STALE_AGE: Duration = Duration::from_secs(5);

impl FileLock {
    fn acquire(target: &Path) -> io::Result<Self> {
        let path = lock_path(target);
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    if let Ok(metadata) = fs::metadata(&path) {
                        if let Ok(modified) = metadata.modified() {
                            if modified.elapsed().unwrap_or_default() > LOCK_STALE_AGE {
                                let _ = fs::remove_file(&path);
                                continue;
                            }
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::WouldBlock,
                            format!("lock file {} held too long", path.display()),
                        ));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    target.with_file_name(name)
}

impl SnapshotStore {
    pub fn new(
        path: impl Into<PathBuf>,
        format: StoreFormat,
        max_snapshots: usize,
        max_bytes: u64,
    ) -> Self {
        Self {
            path: path.into(),
            format,
            max_snapshots: max_snapshots.max(1),
            max_bytes: max_bytes.max(1024),
        }
    }

    /// Appends one snapshot, trimming older snapshots from the front until
    /// both the count and byte caps hold.
    pub fn append(&self, snapshot: &MetricsSnapshot) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _lock = FileLock::acquire(&self.path)?;
        let mut snapshots = self.read_unlocked()?;
        snapshots.push(snapshot.clone());
        while snapshots.len() > self.max_snapshots {
            snapshots.remove(0);
        }
        loop {
            let encoded = self.encode(&snapshots)?;
            if encoded.len() as u64 <= self.max_bytes || snapshots.len() <= 1 {
                return self.write_atomically(&encoded);
            }
            snapshots.remove(0);
        }
    }

    /// Reads every persisted snapshot, oldest first.
    pub fn load(&self) -> io::Result<Vec<MetricsSnapshot>> {
        let _lock = FileLock::acquire(&self.path)?;
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> io::Result<Vec<MetricsSnapshot>> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };
        if contents.is_empty() {
            return Ok(Vec::new());
        }
        match self.format {
            StoreFormat::JsonArray => serde_json::from_slice(&contents)
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error)),
            StoreFormat::Ndjson => {
                let mut snapshots = Vec::new();
                for line in contents.split(|byte| *byte == b'\n') {
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice(line) {
                        Ok(snapshot) => snapshots.push(snapshot),
                        // A torn tail line is dropped, not fatal.
                        Err(_) => continue,
                    }
                }
                Ok(snapshots)
            }
        }
    }

    fn encode(&self, snapshots: &[MetricsSnapshot]) -> io::Result<Vec<u8>> {
        match self.format {
            StoreFormat::JsonArray => serde_json::to_vec(snapshots)
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error)),
            StoreFormat::Ndjson => {
                let mut encoded = Vec::new();
                for snapshot in snapshots {
                    let line = serde_json::to_vec(snapshot)
                        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
                    encoded.extend_from_slice(&line);
                    encoded.push(b'\n');
                }
                Ok(encoded)
            }
        }
    }

    fn write_atomically(&self, contents: &[u8]) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }
}
