//! In-process model of the glitch rig: one STM32-style target with RDP
//! option bytes, and one fault-injection probe, sharing a single device state.
//!
//! The model reproduces what the campaign observes on real hardware:
//!
//! * level 1 flash reads return the protected signature instead of data,
//! * a clean level 1 to level 0 downgrade mass-erases flash (reads as zeros),
//! * a pulse that lands inside the downgrade window either skips the erase
//!   (flash stays readable) or scrambles flash,
//! * any operation can fail, with a cap on consecutive failures per operation.

use crate::config::{MemoryLayout, SimulationSettings};
use crate::params::GlitchParameters;
use crate::probe::{ProbeDriver, ProbeError};
use crate::protection::ProtectionLevel;
use crate::target::{TargetError, TargetMemory, format_address};
use rand::{Rng, RngCore};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const OPTION_TEMPLATE: [u8; 16] = [
    0xAA, 0x55, 0x70, 0x80, 0x8F, 0x7F, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SimOp {
    Read,
    Write,
    Reset,
    Configure,
    Arm,
    Fire,
    Disarm,
    Status,
}

struct FaultInjector {
    rate: f64,
    max_consecutive: u32,
    streaks: HashMap<SimOp, u32>,
}

impl FaultInjector {
    fn should_fail(&mut self, op: SimOp, rng: &mut ChaCha8Rng) -> bool {
        if self.rate <= 0.0 {
            return false;
        }
        let streak = self.streaks.entry(op).or_insert(0);
        if *streak < self.max_consecutive && rng.random_bool(self.rate) {
            *streak += 1;
            true
        } else {
            *streak = 0;
            false
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ProbeState {
    configured: Option<GlitchParameters>,
    armed: bool,
    pulses_fired: u64,
}

struct Device {
    layout: MemoryLayout,
    flash: Vec<u8>,
    options: Vec<u8>,
    signature: Vec<u8>,
    probe: ProbeState,
    window_open: bool,
    glitch_landed: bool,
    hit_rate: f64,
    clean_bypass_rate: f64,
    faults: FaultInjector,
    rng: ChaCha8Rng,
}

impl Device {
    fn level(&self) -> ProtectionLevel {
        ProtectionLevel::from_byte(self.options[0])
    }

    fn inject(&mut self, op: SimOp) -> bool {
        self.faults.should_fail(op, &mut self.rng)
    }

    fn flash_offset(&self, address: u32) -> Option<usize> {
        let start = self.layout.flash_address;
        let offset = address.checked_sub(start)? as usize;
        (offset < self.flash.len()).then_some(offset)
    }

    fn is_option_address(&self, address: u32) -> bool {
        address == self.layout.option_bytes_address
    }
}

/// Shared handle to the simulated device. Hands out the target and probe halves.
#[derive(Clone)]
pub struct SimulatedRig {
    device: Arc<Mutex<Device>>,
    window: Duration,
    arm_latency: Duration,
}

impl SimulatedRig {
    pub fn new(settings: &SimulationSettings, layout: &MemoryLayout, signature: &[u8]) -> Self {
        let mut options = OPTION_TEMPLATE.to_vec();
        options.resize(layout.option_block_size.max(2), 0x00);
        let device = Device {
            layout: *layout,
            flash: vec![0u8; settings.flash_size],
            options,
            signature: signature.to_vec(),
            probe: ProbeState::default(),
            window_open: false,
            glitch_landed: false,
            hit_rate: settings.hit_rate,
            clean_bypass_rate: settings.clean_bypass_rate,
            faults: FaultInjector {
                rate: settings.failure_rate,
                max_consecutive: settings.max_consecutive_failures,
                streaks: HashMap::new(),
            },
            rng: ChaCha8Rng::seed_from_u64(settings.seed),
        };
        Self {
            device: Arc::new(Mutex::new(device)),
            window: Duration::from_micros(settings.window_us),
            arm_latency: Duration::from_micros(settings.arm_latency_us),
        }
    }

    pub fn target(&self) -> SimTarget {
        SimTarget { rig: self.clone() }
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe { rig: self.clone() }
    }

    pub fn probe_armed(&self) -> bool {
        self.lock().probe.armed
    }

    pub fn pulses_fired(&self) -> u64 {
        self.lock().probe.pulses_fired
    }

    pub fn configured(&self) -> Option<GlitchParameters> {
        self.lock().probe.configured
    }

    pub fn level(&self) -> ProtectionLevel {
        self.lock().level()
    }

    pub fn flash(&self) -> Vec<u8> {
        self.lock().flash.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Device> {
        self.device.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_options(&self, bytes: &[u8]) -> Result<(), TargetError> {
        let mut device = self.lock();
        let mut block = device.options.clone();
        let n = bytes.len().min(block.len());
        block[..n].copy_from_slice(&bytes[..n]);
        let requested = ProtectionLevel::from_byte(block[0]);

        if requested == ProtectionLevel::Level2 {
            return Err(TargetError::Rejected(
                "simulator refuses to program RDP level 2".to_string(),
            ));
        }

        let downgrade =
            device.level() != ProtectionLevel::Unprotected && requested == ProtectionLevel::Unprotected;
        if !downgrade {
            device.options = block;
            return Ok(());
        }

        // The erase-then-unlock sequence runs with the device unlocked so a
        // concurrently fired pulse can land inside it.
        device.window_open = true;
        device.glitch_landed = false;
        drop(device);
        std::thread::sleep(self.window);
        let mut device = self.lock();
        device.window_open = false;

        if device.glitch_landed {
            let clean = device.clean_bypass_rate;
            if device.rng.random_bool(clean) {
                debug!("sim: pulse skipped the mass erase");
            } else {
                debug!("sim: pulse scrambled flash");
                let mut scrambled = vec![0u8; device.flash.len()];
                device.rng.fill_bytes(&mut scrambled);
                device.flash = scrambled;
            }
        } else {
            device.flash.iter_mut().for_each(|b| *b = 0);
        }
        device.glitch_landed = false;
        device.options = block;
        Ok(())
    }
}

fn injected(op: &str) -> TargetError {
    TargetError::Rejected(format!("injected {op} failure"))
}

fn injected_probe(op: &str) -> ProbeError {
    ProbeError::Communication(format!("injected {op} failure"))
}

/// Target half of a `SimulatedRig`.
pub struct SimTarget {
    rig: SimulatedRig,
}

impl TargetMemory for SimTarget {
    fn read_range(&mut self, address: u32, length: usize) -> Result<Vec<u8>, TargetError> {
        let mut device = self.rig.lock();
        if device.inject(SimOp::Read) {
            return Err(injected("read"));
        }
        if device.is_option_address(address) {
            let n = length.min(device.options.len());
            return Ok(device.options[..n].to_vec());
        }
        let offset = device.flash_offset(address).ok_or_else(|| {
            TargetError::Rejected(format!("unmapped address {}", format_address(address)))
        })?;
        match device.level() {
            ProtectionLevel::Unprotected => {
                let end = (offset + length).min(device.flash.len());
                Ok(device.flash[offset..end].to_vec())
            }
            ProtectionLevel::Level2 => Err(TargetError::Rejected(
                "debug access disabled by RDP level 2".to_string(),
            )),
            _ => {
                let mut data = device.signature.clone();
                data.resize(length, 0);
                Ok(data)
            }
        }
    }

    fn write_range(&mut self, address: u32, bytes: &[u8]) -> Result<(), TargetError> {
        let mut device = self.rig.lock();
        if device.inject(SimOp::Write) {
            return Err(injected("write"));
        }
        if device.is_option_address(address) {
            drop(device);
            return self.rig.write_options(bytes);
        }
        let offset = device.flash_offset(address).ok_or_else(|| {
            TargetError::Rejected(format!("unmapped address {}", format_address(address)))
        })?;
        if device.level() != ProtectionLevel::Unprotected {
            return Err(TargetError::Rejected(
                "flash write refused: read protection active".to_string(),
            ));
        }
        if offset + bytes.len() > device.flash.len() {
            return Err(TargetError::Rejected("write runs past end of flash".to_string()));
        }
        device.flash[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TargetError> {
        let mut device = self.rig.lock();
        if device.inject(SimOp::Reset) {
            return Err(injected("reset"));
        }
        Ok(())
    }

    fn identify(&mut self) -> Result<Option<String>, TargetError> {
        let device = self.rig.lock();
        Ok(Some(format!(
            "simulated target, {} bytes flash at {}, {}",
            device.flash.len(),
            format_address(device.layout.flash_address),
            device.level()
        )))
    }
}

/// Probe half of a `SimulatedRig`.
pub struct SimProbe {
    rig: SimulatedRig,
}

impl ProbeDriver for SimProbe {
    fn name(&self) -> &'static str {
        "SimProbe"
    }

    fn configure(&mut self, params: &GlitchParameters) -> Result<(), ProbeError> {
        let mut device = self.rig.lock();
        if device.inject(SimOp::Configure) {
            return Err(injected_probe("configure"));
        }
        device.probe.configured = Some(*params);
        Ok(())
    }

    fn arm(&mut self) -> Result<(), ProbeError> {
        std::thread::sleep(self.rig.arm_latency);
        let mut device = self.rig.lock();
        if device.probe.configured.is_none() {
            return Err(ProbeError::Refused {
                operation: "arm",
                reason: "not configured".to_string(),
            });
        }
        device.probe.armed = true;
        // The charge happens even when the acknowledgement is lost.
        if device.inject(SimOp::Arm) {
            return Err(injected_probe("arm"));
        }
        Ok(())
    }

    fn fire(&mut self, pulse_count: u32) -> Result<(), ProbeError> {
        let mut device = self.rig.lock();
        if device.inject(SimOp::Fire) {
            return Err(injected_probe("fire"));
        }
        if !device.probe.armed {
            return Err(ProbeError::Refused {
                operation: "fire",
                reason: "not armed".to_string(),
            });
        }
        device.probe.pulses_fired += u64::from(pulse_count);
        if device.window_open {
            let hit_rate = device.hit_rate;
            if device.rng.random_bool(hit_rate) {
                device.glitch_landed = true;
            }
        }
        Ok(())
    }

    fn disarm(&mut self) -> Result<(), ProbeError> {
        let mut device = self.rig.lock();
        if device.inject(SimOp::Disarm) {
            return Err(injected_probe("disarm"));
        }
        device.probe.armed = false;
        Ok(())
    }

    fn is_armed(&mut self) -> Result<bool, ProbeError> {
        let mut device = self.rig.lock();
        if device.inject(SimOp::Status) {
            return Err(injected_probe("status"));
        }
        Ok(device.probe.armed)
    }

    fn telemetry(&mut self) -> Result<Option<String>, ProbeError> {
        let device = self.rig.lock();
        Ok(Some(format!(
            "armed={} pulses_fired={}",
            device.probe.armed, device.probe.pulses_fired
        )))
    }
}
