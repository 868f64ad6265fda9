//! Assets
//!
//! The asset pipeline is an external collaborator. The core only needs:
//! - a [`ResourceManager`] it can ask for asset bytes by guid,
//! - an [`AssetSerializer`] to turn bytes into typed objects and back,
//! - a per-frame [`DynamicAssetDb`] for assets created during simulation,
//!   which is part of the deterministic state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::stream::{BitStream, Serializable, StreamError};
use crate::sim::serializer::{gunzip, gzip};

/// Asset identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetGuid(pub u64);

impl AssetGuid {
    /// The null guid.
    pub const INVALID: AssetGuid = AssetGuid(0);

    /// First guid handed out to dynamic assets.
    pub const DYNAMIC_BASE: u64 = 1 << 63;

    /// True unless null.
    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// True for guids allocated by a [`DynamicAssetDb`].
    #[inline]
    pub fn is_dynamic(self) -> bool {
        self.0 >= Self::DYNAMIC_BASE
    }
}

impl fmt::Display for AssetGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serializable for AssetGuid {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_u64(&mut self.0)
    }
}

/// Asset errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssetError {
    /// No asset with this guid.
    #[error("Asset {0} not found")]
    NotFound(AssetGuid),
    /// Object could not be encoded.
    #[error("Failed to encode asset: {0}")]
    Encode(String),
    /// Bytes could not be decoded.
    #[error("Failed to decode asset: {0}")]
    Decode(String),
    /// Resource service failed to load.
    #[error("Failed to load assets: {0}")]
    Load(String),
}

// =============================================================================
// RESOURCE SERVICE
// =============================================================================

/// Read-only asset service shared by every frame of a session.
pub trait ResourceManager: Send + Sync {
    /// Load everything up front. Called once at session start.
    fn load_all_assets(&self) -> Result<(), AssetError> {
        Ok(())
    }

    /// Encoded asset bytes (see [`AssetSerializer`]).
    fn get_asset(&self, guid: AssetGuid) -> Option<Arc<Vec<u8>>>;
}

/// Resource manager backed by a map, for hosts that build assets in code.
#[derive(Debug, Default, Clone)]
pub struct InMemoryResources {
    assets: BTreeMap<AssetGuid, Arc<Vec<u8>>>,
}

impl InMemoryResources {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-encoded bytes.
    pub fn insert_bytes(&mut self, guid: AssetGuid, bytes: Vec<u8>) {
        self.assets.insert(guid, Arc::new(bytes));
    }

    /// Encode and store an object.
    pub fn insert<T: Serialize>(&mut self, guid: AssetGuid, value: &T) -> Result<(), AssetError> {
        let bytes = AssetSerializer.object_to_bytes(value, false)?;
        self.insert_bytes(guid, bytes);
        Ok(())
    }

    /// Stored asset count.
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

impl ResourceManager for InMemoryResources {
    fn get_asset(&self, guid: AssetGuid) -> Option<Arc<Vec<u8>>> {
        self.assets.get(&guid).cloned()
    }
}

// =============================================================================
// ASSET SERIALIZER
// =============================================================================

const FORMAT_RAW: u8 = 0;
const FORMAT_GZIP: u8 = 1;

/// Object ⇄ bytes codec for assets, player payloads and commands data.
///
/// Output is a one-byte format marker followed by bincode, optionally
/// gzip-compressed, so decoding needs no out-of-band flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssetSerializer;

impl AssetSerializer {
    /// Encode an object.
    pub fn object_to_bytes<T: Serialize>(&self, value: &T, compress: bool) -> Result<Vec<u8>, AssetError> {
        let body = bincode::serialize(value).map_err(|e| AssetError::Encode(e.to_string()))?;
        let (marker, body) = if compress {
            (FORMAT_GZIP, gzip(&body).map_err(|e| AssetError::Encode(e.to_string()))?)
        } else {
            (FORMAT_RAW, body)
        };
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(marker);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode an object produced by [`object_to_bytes`](Self::object_to_bytes).
    pub fn bytes_to_object<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, AssetError> {
        let (marker, body) = bytes
            .split_first()
            .ok_or_else(|| AssetError::Decode("empty asset".into()))?;
        match *marker {
            FORMAT_RAW => bincode::deserialize(body).map_err(|e| AssetError::Decode(e.to_string())),
            FORMAT_GZIP => {
                let raw = gunzip(body).map_err(|e| AssetError::Decode(e.to_string()))?;
                bincode::deserialize(&raw).map_err(|e| AssetError::Decode(e.to_string()))
            }
            other => Err(AssetError::Decode(format!("unknown asset format {other}"))),
        }
    }
}

// =============================================================================
// DYNAMIC ASSETS
// =============================================================================

/// Assets created during simulation. Rolled back and checksummed with the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicAssetDb {
    next: u64,
    assets: BTreeMap<AssetGuid, Vec<u8>>,
}

impl Default for DynamicAssetDb {
    fn default() -> Self {
        Self {
            next: AssetGuid::DYNAMIC_BASE,
            assets: BTreeMap::new(),
        }
    }
}

impl DynamicAssetDb {
    /// Store encoded bytes under a fresh guid.
    pub fn add_bytes(&mut self, bytes: Vec<u8>) -> AssetGuid {
        let guid = AssetGuid(self.next);
        self.next += 1;
        self.assets.insert(guid, bytes);
        guid
    }

    /// Encode and store an object.
    pub fn add<T: Serialize>(&mut self, value: &T) -> Result<AssetGuid, AssetError> {
        let bytes = AssetSerializer.object_to_bytes(value, false)?;
        Ok(self.add_bytes(bytes))
    }

    /// Encoded bytes of a dynamic asset.
    pub fn get(&self, guid: AssetGuid) -> Option<&[u8]> {
        self.assets.get(&guid).map(Vec::as_slice)
    }

    /// Drop a dynamic asset.
    pub fn remove(&mut self, guid: AssetGuid) -> bool {
        self.assets.remove(&guid).is_some()
    }

    /// Number of dynamic assets.
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Remove everything and restart guid allocation.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl Serializable for DynamicAssetDb {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_u64(&mut self.next)?;
        let mut count = self.assets.len();
        stream.serialize_len(&mut count)?;
        if stream.is_reading() {
            self.assets.clear();
            for _ in 0..count {
                let mut guid = AssetGuid::INVALID;
                let mut bytes = Vec::new();
                Serializable::serialize(&mut guid, stream)?;
                stream.serialize_bytes(&mut bytes)?;
                self.assets.insert(guid, bytes);
            }
        } else {
            for (guid, bytes) in self.assets.iter_mut() {
                let mut guid = *guid;
                Serializable::serialize(&mut guid, stream)?;
                stream.serialize_bytes(bytes)?;
            }
        }
        Ok(())
    }
}
