use crate::params::ParameterSpace;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_TEST_PATTERN: &str = "SIMON_SIMON_SIMO";

/// What flash reads back as while RDP level 1 is active on the reference board.
pub const DEFAULT_PROTECTED_SIGNATURE: [u8; 16] = [
    0x80, 0x00, 0x55, 0x01, 0x03, 0x00, 0x03, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF,
];

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RigMode {
    #[default]
    Hardware,
    Simulated,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignSettings {
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    /// Seed for randomized parameters; drawn from the OS when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub parameters: ParameterSpace,
    #[serde(default = "default_test_pattern")]
    pub test_pattern: String,
    #[serde(default = "default_protected_signature")]
    pub protected_signature: Vec<u8>,
    /// Bytes read back for classification; the pattern length when absent.
    #[serde(default)]
    pub readback_length: Option<usize>,
    #[serde(default = "default_race_timeout_ms")]
    pub race_timeout_ms: u64,
    #[serde(default = "default_disarm_attempts")]
    pub disarm_attempts: u32,
    #[serde(default = "default_inter_attempt_delay_ms")]
    pub inter_attempt_delay_ms: u64,
    /// JSON-lines file receiving one record per attempt.
    #[serde(default)]
    pub record_path: Option<PathBuf>,
    /// Directory receiving post-glitch dumps of noteworthy attempts.
    #[serde(default)]
    pub dump_dir: Option<PathBuf>,
}

pub fn default_iterations() -> u64 {
    10
}
fn default_test_pattern() -> String {
    DEFAULT_TEST_PATTERN.to_string()
}
fn default_protected_signature() -> Vec<u8> {
    DEFAULT_PROTECTED_SIGNATURE.to_vec()
}
fn default_race_timeout_ms() -> u64 {
    30_000
}
fn default_disarm_attempts() -> u32 {
    5
}
fn default_inter_attempt_delay_ms() -> u64 {
    1_000
}

impl CampaignSettings {
    pub fn readback_length(&self) -> usize {
        self.readback_length.unwrap_or(self.test_pattern.len())
    }
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            seed: None,
            parameters: ParameterSpace::default(),
            test_pattern: default_test_pattern(),
            protected_signature: default_protected_signature(),
            readback_length: None,
            race_timeout_ms: default_race_timeout_ms(),
            disarm_attempts: default_disarm_attempts(),
            inter_attempt_delay_ms: default_inter_attempt_delay_ms(),
            record_path: None,
            dump_dir: None,
        }
    }
}

/// Where things live on the target and how long to wait after a reset.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MemoryLayout {
    #[serde(default = "default_flash_address")]
    pub flash_address: u32,
    #[serde(default = "default_option_bytes_address")]
    pub option_bytes_address: u32,
    #[serde(default = "default_option_block_size")]
    pub option_block_size: usize,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_flash_address() -> u32 {
    0x0800_0000
}
fn default_option_bytes_address() -> u32 {
    0x1FF8_0000
}
fn default_option_block_size() -> usize {
    0x10
}
fn default_settle_ms() -> u64 {
    100
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            flash_address: default_flash_address(),
            option_bytes_address: default_option_bytes_address(),
            option_block_size: default_option_block_size(),
            settle_ms: default_settle_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StFlashSettings {
    #[serde(default = "default_flash_tool")]
    pub flash_tool: String,
    #[serde(default = "default_info_tool")]
    pub info_tool: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_flash_tool() -> String {
    "st-flash".to_string()
}
fn default_info_tool() -> String {
    "st-info".to_string()
}
fn default_command_timeout_ms() -> u64 {
    10_000
}

impl Default for StFlashSettings {
    fn default() -> Self {
        Self {
            flash_tool: default_flash_tool(),
            info_tool: default_info_tool(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(default)]
    pub layout: MemoryLayout,
    #[serde(default)]
    pub st_flash: StFlashSettings,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProbeCommandSettings {
    pub command: Vec<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_arm_settle_ms")]
    pub arm_settle_ms: u64,
    #[serde(default = "default_fire_settle_ms")]
    pub fire_settle_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_arm_settle_ms() -> u64 {
    100
}
fn default_fire_settle_ms() -> u64 {
    1_000
}

impl Default for ProbeCommandSettings {
    fn default() -> Self {
        Self {
            command: vec!["chipshouter-ctl".to_string()],
            timeout_ms: default_probe_timeout_ms(),
            arm_settle_ms: default_arm_settle_ms(),
            fire_settle_ms: default_fire_settle_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    #[serde(default)]
    pub command_settings: Option<ProbeCommandSettings>,
}

/// Knobs of the in-process device model.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SimulationSettings {
    #[serde(default = "default_sim_seed")]
    pub seed: u64,
    #[serde(default = "default_flash_size")]
    pub flash_size: usize,
    /// Chance that a pulse fired inside the downgrade window lands.
    #[serde(default = "default_hit_rate")]
    pub hit_rate: f64,
    /// Chance that a landed pulse keeps flash intact rather than scrambling it.
    #[serde(default = "default_clean_bypass_rate")]
    pub clean_bypass_rate: f64,
    /// Chance that any single device or probe operation fails.
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_window_us")]
    pub window_us: u64,
    #[serde(default = "default_arm_latency_us")]
    pub arm_latency_us: u64,
}

fn default_sim_seed() -> u64 {
    0x5EED
}
fn default_flash_size() -> usize {
    256
}
fn default_hit_rate() -> f64 {
    0.3
}
fn default_clean_bypass_rate() -> f64 {
    0.5
}
fn default_max_consecutive_failures() -> u32 {
    1
}
fn default_window_us() -> u64 {
    2_000
}
fn default_arm_latency_us() -> u64 {
    500
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            seed: default_sim_seed(),
            flash_size: default_flash_size(),
            hit_rate: default_hit_rate(),
            clean_bypass_rate: default_clean_bypass_rate(),
            failure_rate: 0.0,
            max_consecutive_failures: default_max_consecutive_failures(),
            window_us: default_window_us(),
            arm_latency_us: default_arm_latency_us(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GlitcherConfig {
    #[serde(default)]
    pub mode: RigMode,
    #[serde(default)]
    pub campaign: CampaignSettings,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub simulation: SimulationSettings,
}

impl GlitcherConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config = Self::from_toml(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let campaign = &self.campaign;
        campaign
            .parameters
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid parameter ranges: {e}"))?;
        if campaign.test_pattern.is_empty() {
            anyhow::bail!("test-pattern must not be empty");
        }
        if campaign.protected_signature.is_empty() {
            anyhow::bail!("protected-signature must not be empty");
        }
        if campaign.protected_signature == campaign.test_pattern.as_bytes() {
            anyhow::bail!("test-pattern and protected-signature must differ");
        }
        if campaign.readback_length() < campaign.test_pattern.len() {
            anyhow::bail!(
                "readback-length ({}) is shorter than the test pattern ({})",
                campaign.readback_length(),
                campaign.test_pattern.len()
            );
        }
        if campaign.disarm_attempts == 0 {
            anyhow::bail!("disarm-attempts must be at least 1");
        }
        if self.target.layout.option_block_size < 2 {
            anyhow::bail!("option-block-size must hold the level byte and its complement");
        }
        if self.mode == RigMode::Hardware && self.probe.command_settings.is_none() {
            anyhow::bail!("hardware mode needs [probe.command-settings]");
        }
        let sim = &self.simulation;
        for (name, rate) in [
            ("hit-rate", sim.hit_rate),
            ("clean-bypass-rate", sim.clean_bypass_rate),
            ("failure-rate", sim.failure_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                anyhow::bail!("simulation {name} must be within 0.0..=1.0, got {rate}");
            }
        }
        if sim.failure_rate > 0.0 && sim.max_consecutive_failures >= campaign.disarm_attempts {
            anyhow::bail!(
                "simulation max-consecutive-failures must stay below disarm-attempts"
            );
        }
        Ok(())
    }
}
