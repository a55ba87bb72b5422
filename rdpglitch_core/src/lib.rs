pub mod campaign;
pub mod config;
pub mod oracle;
pub mod params;
pub mod probe;
pub mod process;
pub mod protection;
pub mod record;
pub mod scheduler;
pub mod sim;
pub mod snapshot;
pub mod target;

pub use campaign::{Campaign, CampaignError, CampaignSummary, CancellationToken};
pub use config::{GlitcherConfig, RigMode};
pub use oracle::{HeldEvidence, Oracle, Outcome, SignatureOracle};
pub use params::{
    FixedParameters, GlitchParameters, ParameterRange, ParameterSource, ParameterSpace,
    RandomizedParameters,
};
pub use probe::{CommandProbe, ProbeDriver, ProbeError};
pub use protection::{ProtectionLevel, ProtectionTracker, RequestMode, RequestableLevel};
pub use record::{AttemptLog, AttemptRecord, JsonLinesSink, RecordSink, SnapshotArchive};
pub use scheduler::{GlitchTrigger, LegOutcome, RaceReport};
pub use sim::SimulatedRig;
pub use snapshot::{MemoryRange, MemorySnapshot};
pub use target::{StFlashTarget, TargetError, TargetMemory};
