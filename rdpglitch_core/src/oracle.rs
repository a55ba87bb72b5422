use crate::snapshot::MemorySnapshot;
use serde::Serialize;
use std::fmt;

/// Why an attempt counts as "protection held".
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeldEvidence {
    /// Flash still reads as the level 1 protected signature.
    ProtectedSignature,
    /// The downgrade ran its mass erase: flash reads back all zeros.
    ErasedFlash,
}

/// Verdict for one attempt. Exactly one per attempt.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    GlitchSucceeded,
    GlitchFailedProtectionHeld(HeldEvidence),
    GlitchDestroyedData,
    DeviceUnresponsive,
    /// A precondition failed before the race, so nothing was glitched.
    Aborted,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::GlitchSucceeded => "succeeded",
            Outcome::GlitchFailedProtectionHeld(HeldEvidence::ProtectedSignature) => "held",
            Outcome::GlitchFailedProtectionHeld(HeldEvidence::ErasedFlash) => "erased",
            Outcome::GlitchDestroyedData => "destroyed",
            Outcome::DeviceUnresponsive => "unresponsive",
            Outcome::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::GlitchSucceeded => write!(f, "GLITCH SUCCEEDED: protected flash is readable"),
            Outcome::GlitchFailedProtectionHeld(HeldEvidence::ProtectedSignature) => {
                write!(f, "glitch failed: protection held")
            }
            Outcome::GlitchFailedProtectionHeld(HeldEvidence::ErasedFlash) => {
                write!(f, "glitch failed: flash erased by the downgrade")
            }
            Outcome::GlitchDestroyedData => write!(f, "glitch corrupted flash contents"),
            Outcome::DeviceUnresponsive => write!(f, "device unresponsive"),
            Outcome::Aborted => write!(f, "attempt aborted before the race"),
        }
    }
}

/// An `Oracle` labels the memory read back after a glitch.
///
/// Implementations must be total and deterministic: the same inputs always
/// produce the same `Outcome`, and no input makes them fail.
pub trait Oracle: Send + Sync {
    fn classify(
        &self,
        snapshot: &MemorySnapshot,
        known_pattern: &[u8],
        protected_signature: &[u8],
    ) -> Outcome;
}

/// Compares the read-back against the baseline pattern and the protected
/// signature, in that order of precedence.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureOracle;

impl SignatureOracle {
    pub fn new() -> Self {
        SignatureOracle
    }
}

impl Oracle for SignatureOracle {
    fn classify(
        &self,
        snapshot: &MemorySnapshot,
        known_pattern: &[u8],
        protected_signature: &[u8],
    ) -> Outcome {
        if !known_pattern.is_empty() && snapshot.starts_with(known_pattern) {
            Outcome::GlitchSucceeded
        } else if !protected_signature.is_empty() && snapshot.starts_with(protected_signature) {
            Outcome::GlitchFailedProtectionHeld(HeldEvidence::ProtectedSignature)
        } else if snapshot.is_all_zero() {
            Outcome::GlitchFailedProtectionHeld(HeldEvidence::ErasedFlash)
        } else if snapshot.is_empty() {
            Outcome::DeviceUnresponsive
        } else {
            Outcome::GlitchDestroyedData
        }
    }
}
