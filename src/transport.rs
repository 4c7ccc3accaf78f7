//! Transport abstraction shared by the cloud and the local Modbus path.
//!
//! A transport moves raw register words; it never scales, decodes or caches.

use crate::{
    error::{Error, Result},
    planner::{self, Chunk},
    register::{Category, RegisterKind},
};
use async_trait::async_trait;
use std::fmt;

/// JSON object returned by a fixed whole-record endpoint.
pub type RecordPayload = serde_json::Map<String, serde_json::Value>;

/// Addressing information a transport needs to reach one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub serial: String,
    /// Modbus unit id, ignored by the cloud.
    pub unit_id: u8,
}

impl DeviceAddress {
    pub fn new(serial: impl Into<String>, unit_id: u8) -> Self {
        Self {
            serial: serial.into(),
            unit_id,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.serial, self.unit_id)
    }
}

/// What a transport can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Maximum registers per read or write call.
    pub max_chunk_size: u16,
    pub supports_write: bool,
    pub is_local: bool,
    /// Chunks may be in flight at the same time.
    pub concurrent_reads: bool,
    /// Runtime, energy and battery come from fixed record endpoints.
    pub record_endpoints: bool,
}

/// Words returned for one chunk, validated against the chunk length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRegisterBlock {
    chunk: Chunk,
    words: Vec<u16>,
}

impl RawRegisterBlock {
    /// Fails with a decode error unless exactly `chunk.count` words arrived.
    pub fn new(chunk: Chunk, words: Vec<u16>) -> Result<Self> {
        if words.len() != usize::from(chunk.count) {
            return Err(Error::ProtocolDecode(format!(
                "expected {} register(s) for {chunk}, got {}",
                chunk.count,
                words.len()
            )));
        }
        Ok(Self { chunk, words })
    }

    pub fn chunk(&self) -> Chunk {
        self.chunk
    }

    /// Words in address order.
    pub fn words(&self) -> &[u16] {
        &self.words
    }

    pub fn into_words(self) -> Vec<u16> {
        self.words
    }

    /// `(address, word)` pairs in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.chunk.addresses().zip(self.words.iter().copied())
    }
}

/// A way of reaching devices.
///
/// Implementations must time out instead of blocking forever, and must be
/// shareable between several devices.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn capabilities(&self) -> TransportCapabilities;

    async fn read_chunk(&self, device: &DeviceAddress, chunk: Chunk) -> Result<RawRegisterBlock>;

    async fn write_chunk(&self, device: &DeviceAddress, chunk: Chunk, values: &[u16])
        -> Result<()>;

    /// Fetches a whole category from a fixed endpoint.
    async fn fetch_record(
        &self,
        _device: &DeviceAddress,
        _category: Category,
    ) -> Result<RecordPayload> {
        Err(Error::Unsupported("fixed record endpoints"))
    }

    /// Reads `count` registers from `start`, whatever the chunk ceiling.
    ///
    /// The range is split with [`planner::plan_range`] and the words are
    /// returned in address order.
    async fn read_range(
        &self,
        device: &DeviceAddress,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let capabilities = self.capabilities();
        let chunks =
            planner::plan_range(kind, start, u32::from(count), capabilities.max_chunk_size)?;
        log::debug!("{device}: reading {kind} {start}+{count} in {} chunk(s)", chunks.len());

        let blocks = if capabilities.concurrent_reads {
            let reads = chunks.into_iter().map(|chunk| self.read_chunk(device, chunk));
            futures::future::try_join_all(reads).await?
        } else {
            let mut blocks = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                blocks.push(self.read_chunk(device, chunk).await?);
            }
            blocks
        };
        Ok(blocks.into_iter().flat_map(RawRegisterBlock::into_words).collect())
    }
}
