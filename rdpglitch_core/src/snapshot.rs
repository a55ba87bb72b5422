use crate::target::{TargetError, TargetMemory};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of leading bytes rendered in logs and records.
const PREVIEW_LEN: usize = 32;

/// A contiguous region of target memory.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub address: u32,
    pub length: usize,
}

impl MemoryRange {
    pub fn new(address: u32, length: usize) -> Self {
        Self { address, length }
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}+0x{:X}", self.address, self.length)
    }
}

/// Bytes read from the target at one point in time. Never mutated after capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot {
    range: MemoryRange,
    bytes: Vec<u8>,
    captured_at: SystemTime,
}

impl MemorySnapshot {
    pub fn new(range: MemoryRange, bytes: Vec<u8>) -> Self {
        Self {
            range,
            bytes,
            captured_at: SystemTime::now(),
        }
    }

    /// Reads `range` from the target into a fresh snapshot.
    pub fn capture<T: TargetMemory + ?Sized>(
        target: &mut T,
        range: MemoryRange,
    ) -> Result<Self, TargetError> {
        let bytes = target.read_range(range.address, range.length)?;
        Ok(Self::new(range, bytes))
    }

    pub fn range(&self) -> MemoryRange {
        self.range
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// True when the snapshot is at least as long as `reference` and begins with it.
    pub fn starts_with(&self, reference: &[u8]) -> bool {
        self.bytes.starts_with(reference)
    }

    pub fn is_all_zero(&self) -> bool {
        !self.bytes.is_empty() && self.bytes.iter().all(|b| *b == 0)
    }

    pub fn digest(&self) -> String {
        format!("{:x}", md5::compute(&self.bytes))
    }

    /// Space separated hex of the first bytes, e.g. `53 49 4D 4F`.
    pub fn preview_hex(&self) -> String {
        self.bytes
            .iter()
            .take(PREVIEW_LEN)
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Serialize for MemorySnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let captured_ms = self
            .captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut state = serializer.serialize_struct("MemorySnapshot", 5)?;
        state.serialize_field("address", &self.range.address)?;
        state.serialize_field("length", &self.bytes.len())?;
        state.serialize_field("md5", &self.digest())?;
        state.serialize_field("preview", &self.preview_hex())?;
        state.serialize_field("captured_at_ms", &captured_ms)?;
        state.end()
    }
}
