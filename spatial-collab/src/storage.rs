//! Local persistence of the shared anchor.
//!
//! One record per device, written whole:
//! ```text
//! ┌─────────┬───────────────────────────────────────────────────┐
//! │ bincode │ AnchorRecord { version, id, pose, confidence,     │
//! │         │   timestamp, world_map (LZ4), checksum }          │
//! └─────────┴───────────────────────────────────────────────────┘
//! ```
//!
//! Writes go to a sibling temp file first and are renamed into place, so a
//! crash mid-write leaves the previous record intact. A missing file is a
//! cold start, not an error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use spatial_core::{Matrix4, SharedAnchor};
use thiserror::Error;
use uuid::Uuid;

const RECORD_VERSION: u8 = 1;

/// Upper bound on a decoded record, compressed world map included.
const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

fn record_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_RECORD_BYTES>()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnchorRecord {
    version: u8,
    anchor_id: Uuid,
    /// Column-major pose
    transform: [f32; 16],
    confidence: f32,
    timestamp_ms: u64,
    /// LZ4, size-prepended
    world_map: Option<Vec<u8>>,
    checksum: u32,
}

impl AnchorRecord {
    fn from_anchor(anchor: &SharedAnchor) -> Self {
        let transform = anchor.transform.flatten();
        let world_map = anchor.world_map.as_deref().map(lz4_flex::compress_prepend_size);
        let checksum = checksum(&anchor.id, &transform, world_map.as_deref());
        Self {
            version: RECORD_VERSION,
            anchor_id: anchor.id,
            transform,
            confidence: anchor.confidence,
            timestamp_ms: anchor.timestamp_ms,
            world_map,
            checksum,
        }
    }

    fn into_anchor(self) -> Result<SharedAnchor, PersistError> {
        if self.version != RECORD_VERSION {
            return Err(PersistError::UnsupportedVersion(self.version));
        }
        if checksum(&self.anchor_id, &self.transform, self.world_map.as_deref()) != self.checksum {
            return Err(PersistError::Corrupt("checksum mismatch".into()));
        }
        let world_map = match self.world_map {
            Some(compressed) => Some(
                lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| PersistError::Corrupt(format!("world map: {e}")))?,
            ),
            None => None,
        };
        Ok(SharedAnchor {
            id: self.anchor_id,
            transform: Matrix4::from_flat(&self.transform),
            confidence: self.confidence,
            timestamp_ms: self.timestamp_ms,
            world_map,
        })
    }
}

/// FNV-1a over the identifying fields.
fn checksum(id: &Uuid, transform: &[f32; 16], world_map: Option<&[u8]>) -> u32 {
    let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
    let mut mix = |byte: u8| {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193); // FNV prime
    };
    id.as_bytes().iter().copied().for_each(&mut mix);
    transform
        .iter()
        .flat_map(|v| v.to_bits().to_le_bytes())
        .for_each(&mut mix);
    if let Some(bytes) = world_map {
        bytes.iter().copied().for_each(&mut mix);
    }
    hash
}

/// Persistence errors. Never fatal: the anchor stays in memory.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Anchor store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Anchor serialization error: {0}")]
    Serialization(String),
    #[error("Anchor record corrupt: {0}")]
    Corrupt(String),
    #[error("Unsupported anchor record version {0}")]
    UnsupportedVersion(u8),
}

/// File-backed store for the single shared anchor.
#[derive(Debug, Clone)]
pub struct AnchorStore {
    path: PathBuf,
}

impl AnchorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted anchor. `Ok(None)` when nothing was saved.
    pub fn load(&self) -> Result<Option<SharedAnchor>, PersistError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (record, _): (AnchorRecord, _) =
            bincode::serde::decode_from_slice(&bytes, record_config())
                .map_err(|e| PersistError::Corrupt(e.to_string()))?;
        record.into_anchor().map(Some)
    }

    /// Atomically replace the persisted anchor.
    pub fn save(&self, anchor: &SharedAnchor) -> Result<(), PersistError> {
        let record = AnchorRecord::from_anchor(anchor);
        let bytes = bincode::serde::encode_to_vec(&record, record_config())
            .map_err(|e| PersistError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Delete the persisted anchor (no-op when absent).
    pub fn clear(&self) -> Result<(), PersistError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
