//! Key-value storage backends.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use groupcal_core::{KeyValueStorage, SyncError, SyncResult};

/// Process-local storage. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> R) -> SyncResult<R> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SyncError::Storage("memory storage lock poisoned".into()))?;
        Ok(f(&mut entries))
    }
}

impl KeyValueStorage for MemoryStorage {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        self.with_entries(|entries| entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> SyncResult<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value);
        })
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }

    async fn all_keys(&self) -> SyncResult<Vec<String>> {
        self.with_entries(|entries| entries.keys().cloned().collect())
    }
}

/// Durable storage keeping one file per key under a directory.
///
/// Writes go to a temp file that is renamed over the target, so a crash
/// mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

const TEMP_SUFFIX: &str = ".tmp";

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStorage { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }
}

impl KeyValueStorage for FileStorage {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> SyncResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(key);
        let temp = self.dir.join(encode_key(key) + TEMP_SUFFIX);

        tokio::fs::write(&temp, value).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn all_keys(&self) -> SyncResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut keys = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            if let Some(key) = decode_key(name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Keys become file names: anything outside `[A-Za-z0-9_-]` is `%XX`-escaped.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

/// Memory storage whose writes can be made to fail.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FlakyStorage {
    inner: MemoryStorage,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FlakyStorage {
    pub(crate) fn fail_writes(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> SyncResult<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SyncError::Storage("disk full".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
impl KeyValueStorage for FlakyStorage {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> SyncResult<()> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn all_keys(&self) -> SyncResult<Vec<String>> {
        self.inner.all_keys().await
    }
}
