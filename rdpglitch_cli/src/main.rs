use rdpglitch_core::campaign::{Campaign, CancellationToken};
use rdpglitch_core::config::{GlitcherConfig, RigMode};
use rdpglitch_core::params::{
    FixedParameters, GlitchParameters, ParameterRange, ParameterSource, RandomizedParameters,
};
use rdpglitch_core::probe::{CommandProbe, ProbeDriver};
use rdpglitch_core::record::{JsonLinesSink, SnapshotArchive};
use rdpglitch_core::sim::SimulatedRig;
use rdpglitch_core::target::{StFlashTarget, TargetMemory};

use clap::Parser;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "rdpglitch.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Voltage-glitch the RDP downgrade of an STM32 target", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Probe voltage, `N` or `MIN:MAX`.
    #[clap(long)]
    voltage: Option<ParameterRange>,
    /// Pulse width, `N` or `MIN:MAX`.
    #[clap(long)]
    width: Option<ParameterRange>,
    #[clap(long)]
    repeat: Option<ParameterRange>,
    #[clap(long)]
    deadtime: Option<ParameterRange>,
    /// Pulses fired per attempt.
    #[clap(long)]
    pulses: Option<ParameterRange>,
    #[clap(long)]
    seed: Option<u64>,
    /// Run against the in-process simulated rig instead of hardware.
    #[clap(long)]
    simulate: bool,
    /// Append one JSON record per attempt to this file.
    #[clap(long)]
    records: Option<PathBuf>,
    #[clap(long)]
    dump_dir: Option<PathBuf>,
    /// Used when RUST_LOG is unset.
    #[clap(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!("loading configuration from {config_path:?}");
            GlitcherConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG);
            if default_config_path.exists() {
                info!("no config file given, loading {default_config_path:?}");
                GlitcherConfig::load_from_file(&default_config_path)?
            } else {
                info!("no config file given and {DEFAULT_CONFIG} not found, using built-in defaults");
                GlitcherConfig::default()
            }
        }
    };
    apply_overrides(&mut config, &cli);
    config.validate()?;

    let seed = config.campaign.seed.unwrap_or_else(|| rand::rng().random());
    info!("parameter seed {seed} (pass --seed {seed} to replay)");
    let space = config.campaign.parameters;
    let mut source: Box<dyn ParameterSource> = if space.is_fixed() {
        let fixed = GlitchParameters {
            voltage: space.voltage.min,
            pulse_width: space.pulse_width.min,
            pulse_repeat: space.pulse_repeat.min,
            deadtime: space.deadtime.min,
            pulse_count: space.pulse_count.min,
        };
        Box::new(FixedParameters(fixed))
    } else {
        Box::new(RandomizedParameters::new(
            space,
            ChaCha8Rng::seed_from_u64(seed),
        )?)
    };

    let (target, probe): (Box<dyn TargetMemory>, Box<dyn ProbeDriver>) = match config.mode {
        RigMode::Hardware => {
            let probe_settings = config.probe.command_settings.as_ref().ok_or_else(|| {
                anyhow::anyhow!("probe command settings missing for hardware mode")
            })?;
            (
                Box::new(StFlashTarget::new(&config.target.st_flash)),
                Box::new(CommandProbe::new(probe_settings)?),
            )
        }
        RigMode::Simulated => {
            warn!("running against the simulated rig, no hardware is touched");
            let rig = SimulatedRig::new(
                &config.simulation,
                &config.target.layout,
                &config.campaign.protected_signature,
            );
            (Box::new(rig.target()), Box::new(rig.probe()))
        }
    };

    let mut campaign = Campaign::new(&config, target, probe);
    if let Some(path) = &config.campaign.record_path {
        info!("recording attempts to {path:?}");
        campaign.add_sink(Box::new(JsonLinesSink::open(path)?));
    }
    if let Some(dir) = &config.campaign.dump_dir {
        info!("archiving interesting read-backs under {dir:?}");
        campaign.add_sink(Box::new(SnapshotArchive::open(dir)?));
    }

    info!(
        "starting campaign: {} attempts, parameters {}/{}/{}/{}/{} (V/width/repeat/deadtime/pulses)",
        config.campaign.iterations,
        space.voltage,
        space.pulse_width,
        space.pulse_repeat,
        space.deadtime,
        space.pulse_count
    );
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupted, stopping after the current attempt");
        interrupt.cancel();
    })?;
    let summary = campaign.run(source.as_mut(), &cancel)?;

    println!("{summary}");
    for index in &summary.successes {
        if let Some(record) = campaign.log().records().get(*index as usize) {
            println!("  success: attempt {index} with {}", record.parameters());
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut GlitcherConfig, cli: &Cli) {
    let campaign = &mut config.campaign;
    if let Some(iterations) = cli.iterations {
        campaign.iterations = iterations;
    }
    if let Some(voltage) = cli.voltage {
        campaign.parameters.voltage = voltage;
    }
    if let Some(width) = cli.width {
        campaign.parameters.pulse_width = width;
    }
    if let Some(repeat) = cli.repeat {
        campaign.parameters.pulse_repeat = repeat;
    }
    if let Some(deadtime) = cli.deadtime {
        campaign.parameters.deadtime = deadtime;
    }
    if let Some(pulses) = cli.pulses {
        campaign.parameters.pulse_count = pulses;
    }
    if cli.seed.is_some() {
        campaign.seed = cli.seed;
    }
    if cli.records.is_some() {
        campaign.record_path = cli.records.clone();
    }
    if cli.dump_dir.is_some() {
        campaign.dump_dir = cli.dump_dir.clone();
    }
    if cli.simulate {
        config.mode = RigMode::Simulated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_and_flags_override_the_file() {
        let cli = Cli::parse_from([
            "rdpglitch",
            "--iterations",
            "3",
            "--width",
            "50:60",
            "--voltage",
            "350",
            "--simulate",
            "--seed",
            "9",
        ]);
        let mut config = GlitcherConfig::default();
        apply_overrides(&mut config, &cli);

        assert_eq!(config.campaign.iterations, 3);
        assert_eq!(
            config.campaign.parameters.pulse_width,
            ParameterRange { min: 50, max: 60 }
        );
        assert!(config.campaign.parameters.voltage.is_fixed());
        assert_eq!(config.campaign.seed, Some(9));
        assert_eq!(config.mode, RigMode::Simulated);
        config.validate().unwrap();
    }

    #[test]
    fn reversed_range_is_rejected_by_the_parser() {
        let result = Cli::try_parse_from(["rdpglitch", "--width", "60:50"]);
        assert!(result.is_err());
    }
}
