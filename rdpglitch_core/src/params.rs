use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;

pub const VOLTAGE_BOUNDS: RangeInclusive<u32> = 150..=500;
pub const PULSE_WIDTH_BOUNDS: RangeInclusive<u32> = 1..=960;
pub const PULSE_REPEAT_BOUNDS: RangeInclusive<u32> = 1..=10_000;
pub const DEADTIME_BOUNDS: RangeInclusive<u32> = 1..=1_000;
pub const PULSE_COUNT_BOUNDS: RangeInclusive<u32> = 1..=1_000;

/// Errors raised while building or validating glitch parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("{field} = {value} is outside the accepted range {min}..={max}")]
    OutOfBounds {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("range {min}:{max} is empty (min > max)")]
    EmptyRange { min: u32, max: u32 },
    #[error("could not parse range '{0}', expected N or MIN:MAX")]
    Unparsable(String),
}

/// One set of probe settings for a single attempt.
///
/// Units follow the probe: volts, nanoseconds for the pulse width,
/// milliseconds for the deadtime between repeated pulses.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct GlitchParameters {
    pub voltage: u32,
    pub pulse_width: u32,
    pub pulse_repeat: u32,
    pub deadtime: u32,
    pub pulse_count: u32,
}

impl GlitchParameters {
    /// Rejects any value outside the probe's accepted bounds, including zero.
    pub fn validate(&self) -> Result<(), ParameterError> {
        check("voltage", self.voltage, &VOLTAGE_BOUNDS)?;
        check("pulse-width", self.pulse_width, &PULSE_WIDTH_BOUNDS)?;
        check("pulse-repeat", self.pulse_repeat, &PULSE_REPEAT_BOUNDS)?;
        check("deadtime", self.deadtime, &DEADTIME_BOUNDS)?;
        check("pulse-count", self.pulse_count, &PULSE_COUNT_BOUNDS)?;
        Ok(())
    }
}

impl fmt::Display for GlitchParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "voltage={}V width={}ns repeat={} deadtime={}ms pulses={}",
            self.voltage, self.pulse_width, self.pulse_repeat, self.deadtime, self.pulse_count
        )
    }
}

fn check(field: &'static str, value: u32, bounds: &RangeInclusive<u32>) -> Result<(), ParameterError> {
    if bounds.contains(&value) {
        Ok(())
    } else {
        Err(ParameterError::OutOfBounds {
            field,
            value,
            min: *bounds.start(),
            max: *bounds.end(),
        })
    }
}

/// Inclusive range a randomized parameter is drawn from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ParameterRange {
    pub min: u32,
    pub max: u32,
}

impl ParameterRange {
    pub fn new(min: u32, max: u32) -> Result<Self, ParameterError> {
        if min > max {
            return Err(ParameterError::EmptyRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn fixed(value: u32) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.min == self.max
    }

    /// Checks that both ends lie within `bounds`, so every draw is valid.
    pub fn validate_within(
        &self,
        field: &'static str,
        bounds: &RangeInclusive<u32>,
    ) -> Result<(), ParameterError> {
        if self.min > self.max {
            return Err(ParameterError::EmptyRange {
                min: self.min,
                max: self.max,
            });
        }
        check(field, self.min, bounds)?;
        check(field, self.max, bounds)
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        if self.is_fixed() {
            self.min
        } else {
            rng.random_range(self.min..=self.max)
        }
    }
}

impl FromStr for ParameterRange {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| ParameterError::Unparsable(s.to_string()))
        };
        match s.split_once(':') {
            Some((min, max)) => ParameterRange::new(parse(min)?, parse(max)?),
            None => Ok(ParameterRange::fixed(parse(s)?)),
        }
    }
}

impl fmt::Display for ParameterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_fixed() {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}:{}", self.min, self.max)
        }
    }
}

/// The ranges every parameter of an attempt is drawn from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ParameterSpace {
    pub voltage: ParameterRange,
    pub pulse_width: ParameterRange,
    pub pulse_repeat: ParameterRange,
    pub deadtime: ParameterRange,
    pub pulse_count: ParameterRange,
}

impl ParameterSpace {
    pub fn validate(&self) -> Result<(), ParameterError> {
        self.voltage.validate_within("voltage", &VOLTAGE_BOUNDS)?;
        self.pulse_width
            .validate_within("pulse-width", &PULSE_WIDTH_BOUNDS)?;
        self.pulse_repeat
            .validate_within("pulse-repeat", &PULSE_REPEAT_BOUNDS)?;
        self.deadtime.validate_within("deadtime", &DEADTIME_BOUNDS)?;
        self.pulse_count
            .validate_within("pulse-count", &PULSE_COUNT_BOUNDS)
    }

    pub fn is_fixed(&self) -> bool {
        self.voltage.is_fixed()
            && self.pulse_width.is_fixed()
            && self.pulse_repeat.is_fixed()
            && self.deadtime.is_fixed()
            && self.pulse_count.is_fixed()
    }
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self {
            voltage: ParameterRange::fixed(400),
            pulse_width: ParameterRange { min: 10, max: 200 },
            pulse_repeat: ParameterRange { min: 1, max: 20 },
            deadtime: ParameterRange { min: 1, max: 10 },
            pulse_count: ParameterRange::fixed(1),
        }
    }
}

/// Produces the parameters for the next attempt.
///
/// Campaigns pull one set per attempt and consume it immediately.
pub trait ParameterSource {
    fn next_parameters(&mut self) -> GlitchParameters;
}

/// Replays the same parameters for every attempt.
#[derive(Debug, Clone, Copy)]
pub struct FixedParameters(pub GlitchParameters);

impl ParameterSource for FixedParameters {
    fn next_parameters(&mut self) -> GlitchParameters {
        self.0
    }
}

/// Draws every parameter uniformly from its range.
pub struct RandomizedParameters<R: Rng> {
    space: ParameterSpace,
    rng: R,
}

impl<R: Rng> RandomizedParameters<R> {
    pub fn new(space: ParameterSpace, rng: R) -> Result<Self, ParameterError> {
        space.validate()?;
        Ok(Self { space, rng })
    }
}

impl<R: Rng> ParameterSource for RandomizedParameters<R> {
    fn next_parameters(&mut self) -> GlitchParameters {
        GlitchParameters {
            voltage: self.space.voltage.sample(&mut self.rng),
            pulse_width: self.space.pulse_width.sample(&mut self.rng),
            pulse_repeat: self.space.pulse_repeat.sample(&mut self.rng),
            deadtime: self.space.deadtime.sample(&mut self.rng),
            pulse_count: self.space.pulse_count.sample(&mut self.rng),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn sane() -> GlitchParameters {
        GlitchParameters {
            voltage: 400,
            pulse_width: 160,
            pulse_repeat: 10,
            deadtime: 1,
            pulse_count: 1,
        }
    }

    #[test]
    fn validate_accepts_in_bounds_parameters() {
        assert!(sane().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_width() {
        let params = GlitchParameters {
            pulse_width: 0,
            ..sane()
        };
        match params.validate() {
            Err(ParameterError::OutOfBounds { field, value, .. }) => {
                assert_eq!(field, "pulse-width");
                assert_eq!(value, 0);
            }
            other => panic!("Expected OutOfBounds for zero width, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_overvoltage() {
        let params = GlitchParameters {
            voltage: 501,
            ..sane()
        };
        assert!(params.validate().is_err(), "501V must be rejected");
    }

    #[test]
    fn range_parses_single_value_and_pair() {
        assert_eq!(
            "400".parse::<ParameterRange>().unwrap(),
            ParameterRange::fixed(400)
        );
        assert_eq!(
            "10:200".parse::<ParameterRange>().unwrap(),
            ParameterRange { min: 10, max: 200 }
        );
        assert_eq!(
            " 3 : 7 ".parse::<ParameterRange>().unwrap(),
            ParameterRange { min: 3, max: 7 }
        );
    }

    #[test]
    fn range_rejects_inverted_and_garbage() {
        assert_eq!(
            "9:3".parse::<ParameterRange>(),
            Err(ParameterError::EmptyRange { min: 9, max: 3 })
        );
        assert!(matches!(
            "abc".parse::<ParameterRange>(),
            Err(ParameterError::Unparsable(_))
        ));
        assert!(matches!(
            "1:".parse::<ParameterRange>(),
            Err(ParameterError::Unparsable(_))
        ));
    }

    #[test]
    fn space_rejects_range_reaching_outside_bounds() {
        let space = ParameterSpace {
            pulse_width: ParameterRange { min: 0, max: 50 },
            ..ParameterSpace::default()
        };
        assert!(space.validate().is_err());
    }

    #[test]
    fn randomized_source_stays_within_ranges() {
        let space = ParameterSpace::default();
        let mut source =
            RandomizedParameters::new(space, ChaCha8Rng::seed_from_u64(7)).unwrap();
        for _ in 0..500 {
            let params = source.next_parameters();
            assert_eq!(params.voltage, 400);
            assert!((10..=200).contains(&params.pulse_width));
            assert!((1..=20).contains(&params.pulse_repeat));
            assert!((1..=10).contains(&params.deadtime));
            assert_eq!(params.pulse_count, 1);
            assert!(params.validate().is_ok(), "Drawn params must validate: {params}");
        }
    }

    #[test]
    fn randomized_source_is_reproducible_for_a_seed() {
        let space = ParameterSpace::default();
        let mut a = RandomizedParameters::new(space, ChaCha8Rng::seed_from_u64(42)).unwrap();
        let mut b = RandomizedParameters::new(space, ChaCha8Rng::seed_from_u64(42)).unwrap();
        for _ in 0..20 {
            assert_eq!(a.next_parameters(), b.next_parameters());
        }
    }

    #[test]
    fn fixed_source_repeats() {
        let mut source = FixedParameters(sane());
        assert_eq!(source.next_parameters(), sane());
        assert_eq!(source.next_parameters(), sane());
    }
}
