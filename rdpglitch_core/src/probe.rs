use crate::config::ProbeCommandSettings;
use crate::params::GlitchParameters;
use crate::process::{ToolError, ToolRunner};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure talking to the fault-injection probe.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe communication failed: {0}")]
    Communication(String),
    #[error("probe helper failed: {0}")]
    Tool(#[from] ToolError),
    #[error("probe refused {operation}: {reason}")]
    Refused {
        operation: &'static str,
        reason: String,
    },
}

/// Control surface of the fault-injection probe.
///
/// A pulse sequence is `configure` once per attempt, then `arm` and `fire`.
/// `disarm` must be safe to call in any state.
pub trait ProbeDriver: Send {
    fn name(&self) -> &'static str;
    fn configure(&mut self, params: &GlitchParameters) -> Result<(), ProbeError>;
    fn arm(&mut self) -> Result<(), ProbeError>;
    fn fire(&mut self, pulse_count: u32) -> Result<(), ProbeError>;
    fn disarm(&mut self) -> Result<(), ProbeError>;
    fn is_armed(&mut self) -> Result<bool, ProbeError>;

    /// Health readout (fault flags, temperatures) when the backend has one.
    fn telemetry(&mut self) -> Result<Option<String>, ProbeError> {
        Ok(None)
    }
}

impl<P: ProbeDriver + ?Sized> ProbeDriver for Box<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }
    fn configure(&mut self, params: &GlitchParameters) -> Result<(), ProbeError> {
        (**self).configure(params)
    }
    fn arm(&mut self) -> Result<(), ProbeError> {
        (**self).arm()
    }
    fn fire(&mut self, pulse_count: u32) -> Result<(), ProbeError> {
        (**self).fire(pulse_count)
    }
    fn disarm(&mut self) -> Result<(), ProbeError> {
        (**self).disarm()
    }
    fn is_armed(&mut self) -> Result<bool, ProbeError> {
        (**self).is_armed()
    }
    fn telemetry(&mut self) -> Result<Option<String>, ProbeError> {
        (**self).telemetry()
    }
}

/// Drives the probe through an external helper command.
///
/// The helper is invoked as `<command..> <verb> [flags]` with the verbs
/// `configure`, `arm`, `fire`, `disarm` and `status`; `status` prints
/// `armed` or `disarmed` on stdout, `status --verbose` a health readout.
pub struct CommandProbe {
    program: String,
    base_args: Vec<String>,
    runner: ToolRunner,
    arm_settle: Duration,
    fire_settle: Duration,
}

impl CommandProbe {
    pub fn new(settings: &ProbeCommandSettings) -> Result<Self, ProbeError> {
        let (program, base_args) = settings.command.split_first().ok_or_else(|| {
            ProbeError::Communication("probe helper command is empty".to_string())
        })?;
        Ok(Self {
            program: program.clone(),
            base_args: base_args.to_vec(),
            runner: ToolRunner::new(Duration::from_millis(settings.timeout_ms)),
            arm_settle: Duration::from_millis(settings.arm_settle_ms),
            fire_settle: Duration::from_millis(settings.fire_settle_ms),
        })
    }

    fn invoke(&self, verb: &str, flags: &[String]) -> Result<String, ProbeError> {
        let mut args = self.base_args.clone();
        args.push(verb.to_string());
        args.extend(flags.iter().cloned());
        let output = self.runner.run(&self.program, args.as_slice())?;
        debug!("probe {verb}: {}", output.stdout.trim());
        Ok(output.stdout)
    }
}

impl ProbeDriver for CommandProbe {
    fn name(&self) -> &'static str {
        "CommandProbe"
    }

    fn configure(&mut self, params: &GlitchParameters) -> Result<(), ProbeError> {
        let flags = [
            "--voltage".to_string(),
            params.voltage.to_string(),
            "--width".to_string(),
            params.pulse_width.to_string(),
            "--repeat".to_string(),
            params.pulse_repeat.to_string(),
            "--deadtime".to_string(),
            params.deadtime.to_string(),
        ];
        self.invoke("configure", &flags).map(|_| ())
    }

    fn arm(&mut self) -> Result<(), ProbeError> {
        self.invoke("arm", &[])?;
        std::thread::sleep(self.arm_settle);
        Ok(())
    }

    fn fire(&mut self, pulse_count: u32) -> Result<(), ProbeError> {
        self.invoke("fire", &["--pulses".to_string(), pulse_count.to_string()])?;
        std::thread::sleep(self.fire_settle);
        Ok(())
    }

    fn disarm(&mut self) -> Result<(), ProbeError> {
        self.invoke("disarm", &[]).map(|_| ())
    }

    fn is_armed(&mut self) -> Result<bool, ProbeError> {
        let stdout = self.invoke("status", &[])?;
        parse_status(&stdout)
    }

    fn telemetry(&mut self) -> Result<Option<String>, ProbeError> {
        let stdout = self.invoke("status", &["--verbose".to_string()])?;
        let report = stdout.trim();
        Ok((!report.is_empty()).then(|| report.to_string()))
    }
}

fn parse_status(stdout: &str) -> Result<bool, ProbeError> {
    match stdout.trim().to_ascii_lowercase().as_str() {
        "armed" => Ok(true),
        "disarmed" => Ok(false),
        other => Err(ProbeError::Communication(format!(
            "unexpected status reply '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reply_parsing() {
        assert!(parse_status("armed\n").unwrap());
        assert!(!parse_status("  DISARMED ").unwrap());
        assert!(matches!(
            parse_status("fault: overtemp"),
            Err(ProbeError::Communication(_))
        ));
    }

    #[test]
    fn empty_command_is_rejected() {
        let settings = ProbeCommandSettings {
            command: vec![],
            ..ProbeCommandSettings::default()
        };
        assert!(CommandProbe::new(&settings).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn helper_receives_verbs_and_reports_state() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("probe-helper");
        fs::write(
            &script,
            r#"#!/bin/sh
state="$(dirname "$0")/state"
echo "$@" >> "$(dirname "$0")/calls"
case "$2" in
  arm) echo armed > "$state" ;;
  disarm) echo disarmed > "$state" ;;
  status) if [ "$3" = "--verbose" ]; then echo "temperature=31C faults=0"; fi
          if [ -f "$state" ]; then cat "$state"; else echo disarmed; fi ;;
esac
"#,
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let settings = ProbeCommandSettings {
            command: vec![
                script.to_string_lossy().into_owned(),
                "--port=/dev/null".to_string(),
            ],
            timeout_ms: 5_000,
            arm_settle_ms: 0,
            fire_settle_ms: 0,
        };
        let mut probe = CommandProbe::new(&settings).unwrap();
        let params = GlitchParameters {
            voltage: 400,
            pulse_width: 160,
            pulse_repeat: 10,
            deadtime: 1,
            pulse_count: 1,
        };

        probe.configure(&params).unwrap();
        assert!(!probe.is_armed().unwrap());
        let health = probe.telemetry().unwrap().unwrap();
        assert!(health.contains("temperature=31C"), "Unexpected telemetry: {health}");
        probe.arm().unwrap();
        assert!(probe.is_armed().unwrap());
        probe.fire(3).unwrap();
        probe.disarm().unwrap();
        assert!(!probe.is_armed().unwrap());

        let calls = fs::read_to_string(dir.path().join("calls")).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(
            lines[0],
            "--port=/dev/null configure --voltage 400 --width 160 --repeat 10 --deadtime 1"
        );
        assert!(lines.contains(&"--port=/dev/null fire --pulses 3"));
    }
}
