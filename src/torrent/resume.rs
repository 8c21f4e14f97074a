use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

const KEY_STARTED: &str = "started";
const KEY_INFO_HASH: &str = "infohash";
const KEY_DEST: &str = "dest";
const KEY_PORT: &str = "port";
const KEY_NAME: &str = "name";
const KEY_TRACKERS: &str = "trackers";
const KEY_INFO: &str = "info";
const KEY_BITFIELD: &str = "bitfield";
const KEY_BYTES_DOWNLOADED: &str = "bytes_downloaded";
const KEY_BYTES_UPLOADED: &str = "bytes_uploaded";
const KEY_BYTES_WASTED: &str = "bytes_wasted";

/// The result type of resume database operations.
pub type ResumeResult<T> = std::result::Result<T, ResumeError>;

#[derive(Debug, Error)]
pub enum ResumeError {
    /// Another process holds the resume database lock.
    #[error("resume database is locked by another process")]
    Locked,
    /// The resume database has been closed.
    #[error("resume database is closed")]
    Closed,
    #[error("bucket \"{0}\" does not exist")]
    UnknownBucket(String),
    #[error("failed to decode resume data, {0}")]
    Decode(String),
    #[error("an io error occurred, {0}")]
    Io(io::Error),
}

impl PartialEq for ResumeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Locked, Self::Locked) => true,
            (Self::Closed, Self::Closed) => true,
            (Self::UnknownBucket(le), Self::UnknownBucket(re)) => le == re,
            (Self::Decode(_), Self::Decode(_)) => true,
            (Self::Io(_), Self::Io(_)) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for ResumeError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Bucket {
    #[serde(default)]
    sequence: u64,
    #[serde(default)]
    values: BTreeMap<String, String>,
    #[serde(default)]
    buckets: BTreeMap<String, Bucket>,
}

#[derive(Debug)]
struct DbState {
    root: Bucket,
    lock: Option<File>,
}

/// A hierarchical key-value store used to persist torrent resume information.
///
/// The store keeps named buckets with nested sub buckets and a per-bucket sequence counter.
/// Every write transaction rewrites the backing file atomically, an advisory file lock
/// prevents two processes from opening the same database.
#[derive(Debug, Clone)]
pub struct ResumeDb {
    inner: Arc<InnerResumeDb>,
}

#[derive(Debug)]
struct InnerResumeDb {
    path: PathBuf,
    state: Mutex<DbState>,
}

impl ResumeDb {
    /// Open the resume database at the given path, creating it when absent.
    /// The database lock is retried until the given timeout elapses.
    ///
    /// # Returns
    ///
    /// It returns [ResumeError::Locked] when the lock could not be acquired in time.
    pub fn open<P: AsRef<Path>>(path: P, timeout: Duration) -> ResumeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = Self::acquire_lock(&path, timeout)?;

        let root = if path.exists() {
            let file = File::open(&path)?;
            serde_json::from_reader(file).map_err(|e| ResumeError::Decode(e.to_string()))?
        } else {
            Bucket::default()
        };

        trace!("Opened resume database {:?}", path);
        Ok(Self {
            inner: Arc::new(InnerResumeDb {
                path,
                state: Mutex::new(DbState {
                    root,
                    lock: Some(lock),
                }),
            }),
        })
    }

    /// Create the given top level bucket when it doesn't exist yet.
    pub fn create_bucket(&self, name: &str) -> ResumeResult<()> {
        self.inner.update(|root| {
            root.buckets.entry(name.to_string()).or_default();
            Ok(())
        })
    }

    /// Get the names of all immediate sub buckets of the given bucket.
    pub fn bucket_names(&self, bucket: &str) -> ResumeResult<Vec<String>> {
        self.inner.view(|root| {
            let bucket = root
                .buckets
                .get(bucket)
                .ok_or_else(|| ResumeError::UnknownBucket(bucket.to_string()))?;
            Ok(bucket.buckets.keys().cloned().collect())
        })
    }

    /// Obtain the next sequence number of the given bucket.
    /// Sequence numbers are monotonic and never reused.
    pub fn next_sequence(&self, bucket: &str) -> ResumeResult<u64> {
        self.inner.update(|root| {
            let bucket = root
                .buckets
                .get_mut(bucket)
                .ok_or_else(|| ResumeError::UnknownBucket(bucket.to_string()))?;
            bucket.sequence += 1;
            Ok(bucket.sequence)
        })
    }

    /// Create the given sub bucket when it doesn't exist yet.
    pub fn create_sub_bucket(&self, bucket: &str, name: &str) -> ResumeResult<()> {
        self.inner.update(|root| {
            let bucket = root
                .buckets
                .get_mut(bucket)
                .ok_or_else(|| ResumeError::UnknownBucket(bucket.to_string()))?;
            bucket.buckets.entry(name.to_string()).or_default();
            Ok(())
        })
    }

    /// Delete the given sub bucket and all data stored within it.
    /// Deleting an unknown sub bucket is a no-op.
    pub fn delete_sub_bucket(&self, bucket: &str, name: &str) -> ResumeResult<()> {
        self.inner.update(|root| {
            let bucket = root
                .buckets
                .get_mut(bucket)
                .ok_or_else(|| ResumeError::UnknownBucket(bucket.to_string()))?;
            bucket.buckets.remove(name);
            Ok(())
        })
    }

    /// Store the given key-value pairs within a sub bucket as a single transaction.
    pub fn put_values(
        &self,
        bucket: &str,
        sub_bucket: &str,
        values: Vec<(String, String)>,
    ) -> ResumeResult<()> {
        self.inner.update(|root| {
            let bucket = Self::sub_bucket_mut(root, bucket, sub_bucket)?;
            for (key, value) in values {
                bucket.values.insert(key, value);
            }
            Ok(())
        })
    }

    /// Get the value of the given key within a sub bucket.
    pub fn get_value(
        &self,
        bucket: &str,
        sub_bucket: &str,
        key: &str,
    ) -> ResumeResult<Option<String>> {
        self.inner.view(|root| {
            let bucket = root
                .buckets
                .get(bucket)
                .and_then(|e| e.buckets.get(sub_bucket))
                .ok_or_else(|| ResumeError::UnknownBucket(sub_bucket.to_string()))?;
            Ok(bucket.values.get(key).cloned())
        })
    }

    /// Check if the given sub bucket exists.
    pub fn contains_sub_bucket(&self, bucket: &str, sub_bucket: &str) -> ResumeResult<bool> {
        self.inner.view(|root| {
            Ok(root
                .buckets
                .get(bucket)
                .map(|e| e.buckets.contains_key(sub_bucket))
                .unwrap_or(false))
        })
    }

    /// Close the resume database, releasing the database lock.
    /// Any operation after closing fails with [ResumeError::Closed].
    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("resume db lock poisoned");
        if let Some(lock) = state.lock.take() {
            #[cfg(unix)]
            unsafe {
                use std::os::unix::io::AsRawFd;
                libc::flock(lock.as_raw_fd(), libc::LOCK_UN);
            }
            drop(lock);
            trace!("Closed resume database {:?}", self.inner.path);
        }
    }

    fn sub_bucket_mut<'a>(
        root: &'a mut Bucket,
        bucket: &str,
        sub_bucket: &str,
    ) -> ResumeResult<&'a mut Bucket> {
        root.buckets
            .get_mut(bucket)
            .and_then(|e| e.buckets.get_mut(sub_bucket))
            .ok_or_else(|| ResumeError::UnknownBucket(sub_bucket.to_string()))
    }

    fn acquire_lock(path: &Path, timeout: Duration) -> ResumeResult<File> {
        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let deadline = Instant::now() + timeout;
            loop {
                let result = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
                if result == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(ResumeError::Locked);
                }
                std::thread::sleep(LOCK_RETRY_INTERVAL);
            }
        }
        #[cfg(not(unix))]
        let _ = timeout;

        Ok(lock)
    }
}

impl InnerResumeDb {
    fn view<T>(&self, f: impl FnOnce(&Bucket) -> ResumeResult<T>) -> ResumeResult<T> {
        let state = self.state.lock().expect("resume db lock poisoned");
        if state.lock.is_none() {
            return Err(ResumeError::Closed);
        }
        f(&state.root)
    }

    fn update<T>(&self, f: impl FnOnce(&mut Bucket) -> ResumeResult<T>) -> ResumeResult<T> {
        let mut state = self.state.lock().expect("resume db lock poisoned");
        if state.lock.is_none() {
            return Err(ResumeError::Closed);
        }

        let result = f(&mut state.root)?;
        self.flush(&state.root)?;
        Ok(result)
    }

    fn flush(&self, root: &Bucket) -> ResumeResult<()> {
        let temp_path = self.path.with_extension("tmp");
        let file = File::create(&temp_path)?;
        serde_json::to_writer(&file, root).map_err(|e| ResumeError::Decode(e.to_string()))?;
        file.sync_all()?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// The persisted state of a torrent, allowing it to continue after a restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeSpec {
    /// The 20 byte info hash of the torrent.
    pub info_hash: Vec<u8>,
    /// The destination directory of the torrent payload.
    pub dest: String,
    /// The listen port assigned to the torrent.
    pub port: u16,
    /// The display name of the torrent.
    pub name: String,
    /// The announce urls of the torrent.
    pub trackers: Vec<String>,
    /// The raw info dictionary bytes, empty for magnets awaiting metadata.
    pub info: Vec<u8>,
    /// The raw bitfield bytes, empty when no piece has completed yet.
    pub bitfield: Vec<u8>,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub bytes_wasted: u64,
}

/// The per-torrent resume persistence handle.
/// Each torrent owns a sub bucket keyed by the decimal form of its id.
#[derive(Debug, Clone)]
pub struct Resumer {
    db: ResumeDb,
    bucket: String,
    sub_bucket: String,
}

impl Resumer {
    /// Create the resume handle for the given torrent id, creating its sub bucket.
    pub fn new(db: &ResumeDb, bucket: &str, id: u64) -> ResumeResult<Self> {
        let sub_bucket = id.to_string();
        db.create_sub_bucket(bucket, &sub_bucket)?;
        Ok(Self {
            db: db.clone(),
            bucket: bucket.to_string(),
            sub_bucket,
        })
    }

    /// Open the resume handle for an existing torrent id.
    ///
    /// # Returns
    ///
    /// It returns [ResumeError::UnknownBucket] when the torrent has no persisted state.
    pub fn open(db: &ResumeDb, bucket: &str, id: u64) -> ResumeResult<Self> {
        let sub_bucket = id.to_string();
        if !db.contains_sub_bucket(bucket, &sub_bucket)? {
            return Err(ResumeError::UnknownBucket(sub_bucket));
        }
        Ok(Self {
            db: db.clone(),
            bucket: bucket.to_string(),
            sub_bucket,
        })
    }

    /// Persist the full resume spec of the torrent.
    pub fn write(&self, spec: &ResumeSpec) -> ResumeResult<()> {
        let trackers = serde_json::to_string(&spec.trackers)
            .map_err(|e| ResumeError::Decode(e.to_string()))?;
        self.db.put_values(
            &self.bucket,
            &self.sub_bucket,
            vec![
                (KEY_INFO_HASH.to_string(), hex::encode(&spec.info_hash)),
                (KEY_DEST.to_string(), spec.dest.clone()),
                (KEY_PORT.to_string(), spec.port.to_string()),
                (KEY_NAME.to_string(), spec.name.clone()),
                (KEY_TRACKERS.to_string(), trackers),
                (KEY_INFO.to_string(), hex::encode(&spec.info)),
                (KEY_BITFIELD.to_string(), hex::encode(&spec.bitfield)),
                (
                    KEY_BYTES_DOWNLOADED.to_string(),
                    spec.bytes_downloaded.to_string(),
                ),
                (
                    KEY_BYTES_UPLOADED.to_string(),
                    spec.bytes_uploaded.to_string(),
                ),
                (KEY_BYTES_WASTED.to_string(), spec.bytes_wasted.to_string()),
            ],
        )
    }

    /// Read the persisted resume spec of the torrent.
    pub fn read(&self) -> ResumeResult<ResumeSpec> {
        Ok(ResumeSpec {
            info_hash: self.read_hex(KEY_INFO_HASH)?,
            dest: self.read_value(KEY_DEST)?.unwrap_or_default(),
            port: self.read_number(KEY_PORT)? as u16,
            name: self.read_value(KEY_NAME)?.unwrap_or_default(),
            trackers: self
                .read_value(KEY_TRACKERS)?
                .map(|e| serde_json::from_str(&e).map_err(|e| ResumeError::Decode(e.to_string())))
                .transpose()?
                .unwrap_or_default(),
            info: self.read_hex(KEY_INFO)?,
            bitfield: self.read_hex(KEY_BITFIELD)?,
            bytes_downloaded: self.read_number(KEY_BYTES_DOWNLOADED)?,
            bytes_uploaded: self.read_number(KEY_BYTES_UPLOADED)?,
            bytes_wasted: self.read_number(KEY_BYTES_WASTED)?,
        })
    }

    /// Persist the started flag of the torrent.
    pub fn write_started(&self, started: bool) -> ResumeResult<()> {
        self.db.put_values(
            &self.bucket,
            &self.sub_bucket,
            vec![(
                KEY_STARTED.to_string(),
                if started { "1" } else { "0" }.to_string(),
            )],
        )
    }

    /// Read the persisted started flag of the torrent.
    pub fn read_started(&self) -> ResumeResult<bool> {
        Ok(self
            .db
            .get_value(&self.bucket, &self.sub_bucket, KEY_STARTED)?
            .map(|e| e == "1")
            .unwrap_or(false))
    }

    /// Persist the bitfield bytes of the torrent.
    pub fn write_bitfield(&self, bitfield: &[u8]) -> ResumeResult<()> {
        self.db.put_values(
            &self.bucket,
            &self.sub_bucket,
            vec![(KEY_BITFIELD.to_string(), hex::encode(bitfield))],
        )
    }

    /// Persist the byte counters of the torrent.
    pub fn write_stats(
        &self,
        bytes_downloaded: u64,
        bytes_uploaded: u64,
        bytes_wasted: u64,
    ) -> ResumeResult<()> {
        self.db.put_values(
            &self.bucket,
            &self.sub_bucket,
            vec![
                (
                    KEY_BYTES_DOWNLOADED.to_string(),
                    bytes_downloaded.to_string(),
                ),
                (KEY_BYTES_UPLOADED.to_string(), bytes_uploaded.to_string()),
                (KEY_BYTES_WASTED.to_string(), bytes_wasted.to_string()),
            ],
        )
    }

    fn read_value(&self, key: &str) -> ResumeResult<Option<String>> {
        self.db.get_value(&self.bucket, &self.sub_bucket, key)
    }

    fn read_hex(&self, key: &str) -> ResumeResult<Vec<u8>> {
        self.read_value(key)?
            .map(|e| hex::decode(&e).map_err(|e| ResumeError::Decode(e.to_string())))
            .transpose()
            .map(|e| e.unwrap_or_default())
    }

    fn read_number(&self, key: &str) -> ResumeResult<u64> {
        self.read_value(key)?
            .map(|e| {
                e.parse::<u64>()
                    .map_err(|e| ResumeError::Decode(e.to_string()))
            })
            .transpose()
            .map(|e| e.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resume_db_locked() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("session.db");

        let _db = ResumeDb::open(&path, Duration::from_millis(100)).unwrap();
        let result = ResumeDb::open(&path, Duration::from_millis(100));

        assert_eq!(Some(ResumeError::Locked), result.err());
    }

    #[test]
    fn test_resume_db_reopen_after_close() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("session.db");

        let db = ResumeDb::open(&path, Duration::from_millis(100)).unwrap();
        db.create_bucket("torrents").unwrap();
        db.close();

        let db = ResumeDb::open(&path, Duration::from_millis(100))
            .expect("expected the database lock to have been released");
        assert_eq!(0, db.bucket_names("torrents").unwrap().len());
    }

    #[test]
    fn test_resume_db_closed() {
        let temp_dir = tempdir().unwrap();
        let db = ResumeDb::open(temp_dir.path().join("session.db"), Duration::from_secs(1)).unwrap();

        db.close();

        assert_eq!(
            Some(ResumeError::Closed),
            db.create_bucket("torrents").err()
        );
    }

    #[test]
    fn test_resume_db_sequence_monotonic() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("session.db");
        let db = ResumeDb::open(&path, Duration::from_secs(1)).unwrap();
        db.create_bucket("torrents").unwrap();

        assert_eq!(1, db.next_sequence("torrents").unwrap());
        assert_eq!(2, db.next_sequence("torrents").unwrap());

        // ids are never reused, even across a reopen of the database
        db.create_sub_bucket("torrents", "2").unwrap();
        db.delete_sub_bucket("torrents", "2").unwrap();
        db.close();

        let db = ResumeDb::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(3, db.next_sequence("torrents").unwrap());
    }

    #[test]
    fn test_resume_db_unknown_bucket() {
        let temp_dir = tempdir().unwrap();
        let db = ResumeDb::open(temp_dir.path().join("session.db"), Duration::from_secs(1)).unwrap();

        let result = db.next_sequence("torrents");

        assert_eq!(
            Some(ResumeError::UnknownBucket("torrents".to_string())),
            result.err()
        );
    }

    #[test]
    fn test_resumer_spec_round_trip() {
        let temp_dir = tempdir().unwrap();
        let db = ResumeDb::open(temp_dir.path().join("session.db"), Duration::from_secs(1)).unwrap();
        db.create_bucket("torrents").unwrap();
        let resumer = Resumer::new(&db, "torrents", 1).unwrap();
        let spec = ResumeSpec {
            info_hash: vec![0xAB; 20],
            dest: "/tmp/data/1".to_string(),
            port: 6881,
            name: "debian.iso".to_string(),
            trackers: vec!["udp://tracker.example.org:1337".to_string()],
            info: vec![1, 2, 3],
            bitfield: vec![],
            bytes_downloaded: 100,
            bytes_uploaded: 20,
            bytes_wasted: 3,
        };

        resumer.write(&spec).unwrap();
        let result = resumer.read().unwrap();

        assert_eq!(spec, result);
    }

    #[test]
    fn test_resumer_started_flag() {
        let temp_dir = tempdir().unwrap();
        let db = ResumeDb::open(temp_dir.path().join("session.db"), Duration::from_secs(1)).unwrap();
        db.create_bucket("torrents").unwrap();
        let resumer = Resumer::new(&db, "torrents", 4).unwrap();

        assert_eq!(false, resumer.read_started().unwrap());

        resumer.write_started(true).unwrap();
        assert_eq!(true, resumer.read_started().unwrap());

        resumer.write_started(false).unwrap();
        assert_eq!(false, resumer.read_started().unwrap());
    }

    #[test]
    fn test_resumer_open_unknown_id() {
        let temp_dir = tempdir().unwrap();
        let db = ResumeDb::open(temp_dir.path().join("session.db"), Duration::from_secs(1)).unwrap();
        db.create_bucket("torrents").unwrap();

        let result = Resumer::open(&db, "torrents", 42);

        assert_eq!(
            Some(ResumeError::UnknownBucket("42".to_string())),
            result.err()
        );
    }

    #[test]
    fn test_resume_db_persists_across_reopen() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("session.db");

        {
            let db = ResumeDb::open(&path, Duration::from_secs(1)).unwrap();
            db.create_bucket("torrents").unwrap();
            let resumer = Resumer::new(&db, "torrents", 7).unwrap();
            resumer.write_started(true).unwrap();
            db.close();
        }

        let db = ResumeDb::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(vec!["7".to_string()], db.bucket_names("torrents").unwrap());
        let resumer = Resumer::open(&db, "torrents", 7).unwrap();
        assert_eq!(true, resumer.read_started().unwrap());
    }
}
