//! Coordinator Document Store
//!
//! Durable key-value record of coordinator state, keyed by transaction id.
//! Every `put` goes through [`CoordinatorDocument::validate_overwrite`], so no
//! implementation can replace a persisted decision or participant list.
//!
//! # File record layout
//!
//! ```text
//! ┌─────────────┬─────────┬──────────────────────────────┐
//! │ payload_len │ 4 bytes │ bincode payload size (LE)    │
//! │ checksum    │ 4 bytes │ CRC32 of payload (LE)        │
//! │ payload     │ N bytes │ bincode(CoordinatorDocument) │
//! └─────────────┴─────────┴──────────────────────────────┘
//! ```

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::document::CoordinatorDocument;
use super::error::CoordinatorError;
use super::types::TxnId;

/// Record header size in bytes
pub const RECORD_HEADER_SIZE: usize = 8;

const DOC_EXTENSION: &str = "doc";
const TMP_PREFIX: &str = ".tmp-";

/// Durable store of coordinator documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Durable all-or-nothing write of one full document
    async fn put(&self, document: &CoordinatorDocument) -> Result<(), CoordinatorError>;

    async fn get(&self, id: TxnId) -> Result<Option<CoordinatorDocument>, CoordinatorError>;

    /// Durable delete; removing an absent document is not an error
    async fn remove(&self, id: TxnId) -> Result<(), CoordinatorError>;

    /// Point-in-time snapshot of every persisted document (recovery only)
    ///
    /// Records that fail to decode are reported in [`StoreScan::unreadable`]
    /// and left in place; they never hide the readable ones.
    async fn scan_all(&self) -> Result<StoreScan, CoordinatorError>;
}

/// Result of [`DocumentStore::scan_all`]
#[derive(Debug, Default)]
pub struct StoreScan {
    pub documents: Vec<CoordinatorDocument>,
    /// (storage key, decode error) per corrupt record
    pub unreadable: Vec<(String, CoordinatorError)>,
}

// ============================================================
// In-memory store
// ============================================================

/// Store that lives as long as its `Arc`
///
/// Shared between successive catalogs it models a store that survives
/// process restart. Supports storage fault injection.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: Mutex<FxHashMap<TxnId, CoordinatorDocument>>,
    fail_puts: AtomicU32,
    fail_removes: AtomicU32,
    put_count: AtomicUsize,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` puts fail with a storage error
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` removes fail with a storage error
    pub fn fail_next_removes(&self, n: u32) {
        self.fail_removes.store(n, Ordering::SeqCst);
    }

    /// Number of successful puts
    pub fn put_count(&self) -> usize {
        self.put_count.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, FxHashMap<TxnId, CoordinatorDocument>>, CoordinatorError>
    {
        self.documents
            .lock()
            .map_err(|_| CoordinatorError::Storage("document map poisoned".to_string()))
    }

    fn take_injected_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn put(&self, document: &CoordinatorDocument) -> Result<(), CoordinatorError> {
        if Self::take_injected_failure(&self.fail_puts) {
            return Err(CoordinatorError::Storage("injected put failure".to_string()));
        }

        let mut docs = self.lock()?;
        match docs.get(&document.id) {
            Some(existing) => document.validate_overwrite(existing)?,
            None => document.validate()?,
        }
        docs.insert(document.id, document.clone());
        self.put_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, id: TxnId) -> Result<Option<CoordinatorDocument>, CoordinatorError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn remove(&self, id: TxnId) -> Result<(), CoordinatorError> {
        if Self::take_injected_failure(&self.fail_removes) {
            return Err(CoordinatorError::Storage(
                "injected remove failure".to_string(),
            ));
        }
        self.lock()?.remove(&id);
        Ok(())
    }

    async fn scan_all(&self) -> Result<StoreScan, CoordinatorError> {
        let mut documents: Vec<_> = self.lock()?.values().cloned().collect();
        documents.sort_by_key(|d| d.id);
        Ok(StoreScan {
            documents,
            unreadable: Vec::new(),
        })
    }
}

// ============================================================
// File-backed store
// ============================================================

/// One checksummed file per transaction, replaced atomically
///
/// Write protocol:
/// 1. Encode + checksum into `.tmp-{key}-{millis}`
/// 2. fsync the temp file
/// 3. Rename over `{key}.doc`
/// 4. fsync the directory
pub struct FileDocumentStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileDocumentStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CoordinatorError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn doc_path(dir: &Path, id: &TxnId) -> PathBuf {
        dir.join(format!("{}.{}", id.storage_key(), DOC_EXTENSION))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, CoordinatorError>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf, Arc<Mutex<()>>) -> Result<T, CoordinatorError> + Send + 'static,
    {
        let dir = self.dir.clone();
        let lock = self.write_lock.clone();
        tokio::task::spawn_blocking(move || f(dir, lock))
            .await
            .map_err(|e| CoordinatorError::Storage(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn put(&self, document: &CoordinatorDocument) -> Result<(), CoordinatorError> {
        let document = document.clone();
        self.blocking(move |dir, lock| {
            let _guard = lock
                .lock()
                .map_err(|_| CoordinatorError::Storage("write lock poisoned".to_string()))?;
            let path = Self::doc_path(&dir, &document.id);
            match read_record(&path)? {
                Some(existing) => document.validate_overwrite(&existing)?,
                None => document.validate()?,
            }
            write_record_atomic(&dir, &path, &document)?;
            debug!(txn = %document.id, "Coordinator document persisted");
            Ok(())
        })
        .await
    }

    async fn get(&self, id: TxnId) -> Result<Option<CoordinatorDocument>, CoordinatorError> {
        self.blocking(move |dir, _| read_record(&Self::doc_path(&dir, &id)))
            .await
    }

    async fn remove(&self, id: TxnId) -> Result<(), CoordinatorError> {
        self.blocking(move |dir, lock| {
            let _guard = lock
                .lock()
                .map_err(|_| CoordinatorError::Storage("write lock poisoned".to_string()))?;
            match fs::remove_file(Self::doc_path(&dir, &id)) {
                Ok(()) => {
                    sync_dir(&dir)?;
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn scan_all(&self) -> Result<StoreScan, CoordinatorError> {
        self.blocking(|dir, lock| {
            let _guard = lock
                .lock()
                .map_err(|_| CoordinatorError::Storage("write lock poisoned".to_string()))?;
            let mut scan = StoreScan::default();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                if name.starts_with(TMP_PREFIX) {
                    // interrupted write, never renamed into place
                    warn!(file = %name, "Removing incomplete coordinator document");
                    let _ = fs::remove_file(&path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some(DOC_EXTENSION) {
                    continue;
                }
                match read_record(&path) {
                    Ok(Some(doc)) => scan.documents.push(doc),
                    // removed between read_dir and read
                    Ok(None) => {}
                    Err(e @ CoordinatorError::Corrupt(_)) => {
                        let key = path
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .unwrap_or_default()
                            .to_string();
                        scan.unreadable.push((key, e));
                    }
                    Err(e) => return Err(e),
                }
            }
            scan.documents.sort_by_key(|d| d.id);
            Ok(scan)
        })
        .await
    }
}

/// Encode a document as `[len][crc32][payload]`
pub fn encode_record(document: &CoordinatorDocument) -> Result<Vec<u8>, CoordinatorError> {
    let payload = bincode::serialize(document)?;
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode and verify a record produced by [`encode_record`]
pub fn decode_record(buf: &[u8]) -> Result<CoordinatorDocument, CoordinatorError> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(CoordinatorError::Corrupt(format!(
            "truncated record header ({} bytes)",
            buf.len()
        )));
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let checksum = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let payload = &buf[RECORD_HEADER_SIZE..];
    if payload.len() != len {
        return Err(CoordinatorError::Corrupt(format!(
            "record length mismatch: header {} payload {}",
            len,
            payload.len()
        )));
    }
    if crc32fast::hash(payload) != checksum {
        return Err(CoordinatorError::Corrupt(
            "record checksum mismatch".to_string(),
        ));
    }
    bincode::deserialize(payload)
        .map_err(|e| CoordinatorError::Corrupt(format!("undecodable payload: {}", e)))
}

fn read_record(path: &Path) -> Result<Option<CoordinatorDocument>, CoordinatorError> {
    match fs::read(path) {
        Ok(buf) => decode_record(&buf).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_record_atomic(
    dir: &Path,
    path: &Path,
    document: &CoordinatorDocument,
) -> Result<(), CoordinatorError> {
    let bytes = encode_record(document)?;
    let tmp_path = dir.join(format!(
        "{}{}-{}",
        TMP_PREFIX,
        document.id.storage_key(),
        chrono::Utc::now().timestamp_millis()
    ));
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    sync_dir(dir)
}

fn sync_dir(dir: &Path) -> Result<(), CoordinatorError> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
