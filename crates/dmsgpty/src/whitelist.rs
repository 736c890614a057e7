//! Public keys allowed to reach a pty host over dmsg

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use dmsg_protocol::PubKey;

use crate::error::WhitelistError;

/// Authorization set consulted for every dmsg-origin connection
///
/// Adding a present key and removing an absent one both succeed.
#[async_trait]
pub trait Whitelist: Send + Sync {
    async fn get(&self, pk: &PubKey) -> Result<bool, WhitelistError>;

    /// All members in key order
    async fn all(&self) -> Result<Vec<PubKey>, WhitelistError>;

    async fn add(&self, pks: &[PubKey]) -> Result<(), WhitelistError>;

    async fn remove(&self, pks: &[PubKey]) -> Result<(), WhitelistError>;
}

/// In-memory whitelist
#[derive(Debug, Default)]
pub struct MemoryWhitelist {
    keys: RwLock<BTreeSet<PubKey>>,
}

impl MemoryWhitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: impl IntoIterator<Item = PubKey>) -> Self {
        Self {
            keys: RwLock::new(keys.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Whitelist for MemoryWhitelist {
    async fn get(&self, pk: &PubKey) -> Result<bool, WhitelistError> {
        Ok(self.keys.read().await.contains(pk))
    }

    async fn all(&self) -> Result<Vec<PubKey>, WhitelistError> {
        Ok(self.keys.read().await.iter().copied().collect())
    }

    async fn add(&self, pks: &[PubKey]) -> Result<(), WhitelistError> {
        self.keys.write().await.extend(pks.iter().copied());
        Ok(())
    }

    async fn remove(&self, pks: &[PubKey]) -> Result<(), WhitelistError> {
        let mut keys = self.keys.write().await;
        for pk in pks {
            keys.remove(pk);
        }
        Ok(())
    }
}

/// Whitelist persisted as a JSON array of hex keys
///
/// Every operation reads the file afresh so edits made by another process
/// between calls are picked up. Mutations hold an in-process lock for the
/// whole read-modify-write and replace the file through a rename, so a
/// reader never sees a partial write. Concurrent writers in different
/// processes can still lose each other's updates.
#[derive(Debug)]
pub struct FileWhitelist {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileWhitelist {
    /// Open the whitelist at `path`, creating an empty one if missing
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, WhitelistError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if tokio::fs::metadata(&path).await.is_err() {
            write_keys(&path, &BTreeSet::new()).await?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn update(
        &self,
        f: impl FnOnce(&mut BTreeSet<PubKey>),
    ) -> Result<(), WhitelistError> {
        let _guard = self.lock.lock().await;
        let mut keys = read_keys(&self.path).await?;
        let before = keys.clone();
        f(&mut keys);
        if keys != before {
            write_keys(&self.path, &keys).await?;
        }
        Ok(())
    }
}

async fn read_keys(path: &Path) -> Result<BTreeSet<PubKey>, WhitelistError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(e.into()),
    };
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeSet::new());
    }
    let keys: Vec<PubKey> = serde_json::from_slice(&raw)?;
    Ok(keys.into_iter().collect())
}

async fn write_keys(path: &Path, keys: &BTreeSet<PubKey>) -> Result<(), WhitelistError> {
    let body = serde_json::to_vec_pretty(&keys.iter().collect::<Vec<_>>())?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl Whitelist for FileWhitelist {
    async fn get(&self, pk: &PubKey) -> Result<bool, WhitelistError> {
        Ok(read_keys(&self.path).await?.contains(pk))
    }

    async fn all(&self) -> Result<Vec<PubKey>, WhitelistError> {
        Ok(read_keys(&self.path).await?.into_iter().collect())
    }

    async fn add(&self, pks: &[PubKey]) -> Result<(), WhitelistError> {
        self.update(|keys| keys.extend(pks.iter().copied())).await
    }

    async fn remove(&self, pks: &[PubKey]) -> Result<(), WhitelistError> {
        self.update(|keys| {
            for pk in pks {
                keys.remove(pk);
            }
        })
        .await
    }
}
