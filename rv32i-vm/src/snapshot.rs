use crate::memory::{Memory, MemoryError, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Version identifier for snapshot compatibility checks.
pub const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    Version { expected: String, found: String },

    #[error("snapshot page hash mismatch for base {0:#010x}")]
    Hash(u32),

    #[error(transparent)]
    Page(#[from] MemoryError),

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Full machine snapshot: registers, pc, retired-instruction count and
/// every allocated memory page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub cpu: CpuSnapshot,
    pub instret: u64,
    pub pages: Vec<PageSnapshot>,
}

/// Read-only copy of the architectural register state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub pc: u32,
    pub regs: [u32; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub base: u32,
    /// Hex-encoded SHA-256 of `data`.
    pub hash: String,
    pub data: Vec<u8>,
}

fn page_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl PageSnapshot {
    pub fn capture(base: u32, data: &[u8; PAGE_SIZE]) -> Self {
        Self {
            base,
            hash: page_hash(data),
            data: data.to_vec(),
        }
    }
}

/// Capture every allocated page of `memory`.
pub fn capture_pages(memory: &Memory) -> Vec<PageSnapshot> {
    memory
        .pages()
        .map(|(base, data)| PageSnapshot::capture(base, data))
        .collect()
}

/// Replace the contents of `memory` with `pages` after validating each one.
///
/// `memory` is only modified once every page has passed validation.
pub fn restore_pages(memory: &mut Memory, pages: &[PageSnapshot]) -> Result<(), SnapshotError> {
    let mut restored = Memory::new();
    for page in pages {
        if page_hash(&page.data) != page.hash {
            return Err(SnapshotError::Hash(page.base));
        }
        restored.insert_page(page.base, &page.data)?;
    }
    *memory = restored;
    Ok(())
}

impl Snapshot {
    pub fn check_version(&self) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                expected: SNAPSHOT_VERSION.to_string(),
                found: self.version.clone(),
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot = bincode::deserialize(bytes)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }
}
