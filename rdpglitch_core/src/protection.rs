use crate::config::MemoryLayout;
use crate::target::{TargetError, TargetMemory, format_address};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const LEVEL0_BYTE: u8 = 0xAA;
const LEVEL1_BYTE: u8 = 0x33;
const LEVEL2_BYTE: u8 = 0xCC;

#[derive(Error, Debug)]
pub enum ProtectionError {
    #[error("communication error while accessing option bytes: {0}")]
    Communication(#[from] TargetError),
    #[error("malformed option block: expected {expected} bytes, read {actual}")]
    MalformedConfig { expected: usize, actual: usize },
}

/// Read-protection level as reported by the RDP option byte.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionLevel {
    Unprotected,
    Level1,
    /// Irreversible. Never requested by this crate.
    Level2,
    Unknown(u8),
}

impl ProtectionLevel {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            LEVEL0_BYTE => ProtectionLevel::Unprotected,
            LEVEL1_BYTE => ProtectionLevel::Level1,
            LEVEL2_BYTE => ProtectionLevel::Level2,
            other => ProtectionLevel::Unknown(other),
        }
    }
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionLevel::Unprotected => write!(f, "RDP level 0 (unprotected)"),
            ProtectionLevel::Level1 => write!(f, "RDP level 1 (read protection)"),
            ProtectionLevel::Level2 => write!(f, "RDP level 2 (chip protection)"),
            ProtectionLevel::Unknown(byte) => write!(f, "unknown RDP byte 0x{byte:02X}"),
        }
    }
}

/// The levels a caller may ask for. Level 2 bricks the debug port, so it has
/// no representation here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestableLevel {
    Unprotected,
    Level1,
}

impl RequestableLevel {
    /// The RDP byte and its complement, in write order.
    pub fn option_bytes(self) -> [u8; 2] {
        match self {
            RequestableLevel::Unprotected => [LEVEL0_BYTE, !LEVEL0_BYTE],
            RequestableLevel::Level1 => [LEVEL1_BYTE, !LEVEL1_BYTE],
        }
    }

    pub fn as_level(self) -> ProtectionLevel {
        match self {
            RequestableLevel::Unprotected => ProtectionLevel::Unprotected,
            RequestableLevel::Level1 => ProtectionLevel::Level1,
        }
    }
}

/// How much of the level change to carry out after the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Write, reset the device and wait for it to settle.
    Settled,
    /// Write only. Used as the foreground leg of the glitch race.
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelChange {
    AlreadySet,
    Written,
}

/// Reads and changes the RDP level through the option byte block.
#[derive(Debug, Clone)]
pub struct ProtectionTracker {
    option_address: u32,
    block_size: usize,
    settle: Duration,
}

impl ProtectionTracker {
    pub fn new(layout: &MemoryLayout) -> Self {
        Self {
            option_address: layout.option_bytes_address,
            block_size: layout.option_block_size,
            settle: Duration::from_millis(layout.settle_ms),
        }
    }

    /// Reads the option block, insisting on at least `block_size` bytes.
    pub fn read_block<T: TargetMemory + ?Sized>(
        &self,
        target: &mut T,
    ) -> Result<Vec<u8>, ProtectionError> {
        let mut block = target.read_range(self.option_address, self.block_size)?;
        if block.len() < self.block_size {
            return Err(ProtectionError::MalformedConfig {
                expected: self.block_size,
                actual: block.len(),
            });
        }
        block.truncate(self.block_size);
        Ok(block)
    }

    pub fn read_level<T: TargetMemory + ?Sized>(
        &self,
        target: &mut T,
    ) -> Result<ProtectionLevel, ProtectionError> {
        let block = self.read_block(target)?;
        let level = ProtectionLevel::from_byte(block[0]);
        debug!("option bytes at {}: {level}", format_address(self.option_address));
        Ok(level)
    }

    /// Moves the target to `level` unless it is already there.
    ///
    /// The result is not verified here: after a glitched write the level may
    /// legitimately differ from what was asked for.
    pub fn request_level<T: TargetMemory + ?Sized>(
        &self,
        target: &mut T,
        level: RequestableLevel,
        mode: RequestMode,
    ) -> Result<LevelChange, ProtectionError> {
        let current = self.read_block(target)?;
        if ProtectionLevel::from_byte(current[0]) == level.as_level() {
            debug!("{} already set", level.as_level());
            return Ok(LevelChange::AlreadySet);
        }

        let block = compose_block(&current, level);
        target.write_range(self.option_address, &block)?;
        if mode == RequestMode::Settled {
            info!("requested {}, resetting target", level.as_level());
            target.reset()?;
            std::thread::sleep(self.settle);
        }
        Ok(LevelChange::Written)
    }
}

/// Copy of `current` with the RDP byte and its complement replaced.
pub fn compose_block(current: &[u8], level: RequestableLevel) -> Vec<u8> {
    let mut block = current.to_vec();
    let [rdp, complement] = level.option_bytes();
    block[0] = rdp;
    block[1] = complement;
    block
}
