use crate::config::StFlashSettings;
use crate::process::{ToolError, ToolRunner};
use std::fs;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Channel-level failure talking to the target through the debug probe.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("debug probe tool failed: {0}")]
    Tool(#[from] ToolError),
    #[error("scratch file error: {0}")]
    Scratch(#[from] std::io::Error),
    #[error("target rejected the operation: {0}")]
    Rejected(String),
}

/// Raw memory access to the target device.
///
/// Implementations own their channel exclusively; the campaign never shares a
/// target between concurrent attempts.
pub trait TargetMemory: Send {
    fn read_range(&mut self, address: u32, length: usize) -> Result<Vec<u8>, TargetError>;
    fn write_range(&mut self, address: u32, bytes: &[u8]) -> Result<(), TargetError>;
    fn reset(&mut self) -> Result<(), TargetError>;

    /// Pre-flight check of the debug link. Returns a human readable device
    /// description when the backend can provide one.
    fn identify(&mut self) -> Result<Option<String>, TargetError> {
        Ok(None)
    }
}

impl<T: TargetMemory + ?Sized> TargetMemory for Box<T> {
    fn read_range(&mut self, address: u32, length: usize) -> Result<Vec<u8>, TargetError> {
        (**self).read_range(address, length)
    }
    fn write_range(&mut self, address: u32, bytes: &[u8]) -> Result<(), TargetError> {
        (**self).write_range(address, bytes)
    }
    fn reset(&mut self) -> Result<(), TargetError> {
        (**self).reset()
    }
    fn identify(&mut self) -> Result<Option<String>, TargetError> {
        (**self).identify()
    }
}

pub fn format_address(address: u32) -> String {
    format!("0x{address:08X}")
}

pub fn format_length(length: usize) -> String {
    format!("0x{length:X}")
}

/// Target access through the `st-flash` / `st-info` command-line tools.
///
/// Payloads are exchanged through scratch files that are removed as soon as
/// the invocation returns.
pub struct StFlashTarget {
    flash_tool: String,
    info_tool: String,
    runner: ToolRunner,
}

impl StFlashTarget {
    pub fn new(settings: &StFlashSettings) -> Self {
        Self {
            flash_tool: settings.flash_tool.clone(),
            info_tool: settings.info_tool.clone(),
            runner: ToolRunner::new(Duration::from_millis(settings.command_timeout_ms)),
        }
    }
}

impl TargetMemory for StFlashTarget {
    fn read_range(&mut self, address: u32, length: usize) -> Result<Vec<u8>, TargetError> {
        let scratch = tempfile::Builder::new()
            .prefix("rdpglitch-read-")
            .suffix(".bin")
            .tempfile()?;
        let path = scratch.path().to_string_lossy().into_owned();
        self.runner.run(
            &self.flash_tool,
            &[
                "--format",
                "binary",
                "read",
                path.as_str(),
                format_address(address).as_str(),
                format_length(length).as_str(),
            ],
        )?;
        let data = fs::read(scratch.path())?;
        debug!("read {} bytes from {}", data.len(), format_address(address));
        Ok(data)
    }

    fn write_range(&mut self, address: u32, bytes: &[u8]) -> Result<(), TargetError> {
        let mut scratch = tempfile::Builder::new()
            .prefix("rdpglitch-write-")
            .suffix(".bin")
            .tempfile()?;
        scratch.write_all(bytes)?;
        scratch.flush()?;
        let path = scratch.path().to_string_lossy().into_owned();
        self.runner.run(
            &self.flash_tool,
            &[
                "--format",
                "binary",
                "write",
                path.as_str(),
                format_address(address).as_str(),
            ],
        )?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TargetError> {
        self.runner.run(&self.flash_tool, &["reset"])?;
        Ok(())
    }

    fn identify(&mut self) -> Result<Option<String>, TargetError> {
        let output = self.runner.run(&self.info_tool, &["--probe"])?;
        let description = output.stdout.trim();
        if description.is_empty() {
            Ok(None)
        } else {
            Ok(Some(description.to_string()))
        }
    }
}
