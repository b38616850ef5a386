//! Stage delay policy: how long after the previous send each stage is due.

use chrono::Duration;
use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::types::Scenario;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;

/// Seconds after the previous fire, indexed by `stage - 1`.
const FUNNEL_DELAYS: [i64; 3] = [0, 24 * HOUR, 48 * HOUR];
const TEASER_DELAYS: [i64; 9] = [
    0,
    HOUR,
    3 * HOUR,
    24 * HOUR,
    48 * HOUR,
    72 * HOUR,
    96 * HOUR,
    120 * HOUR,
    144 * HOUR,
];
const CHECKOUT_DELAYS: [i64; 3] = [0, 2 * HOUR, 6 * HOUR];

/// Pure `(scenario, stage) -> delay` lookup with a uniform scale factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageDelayPolicy {
    scale: f64,
}

impl StageDelayPolicy {
    /// `scale` multiplies every delay; it must be finite and positive so
    /// ordering between stages is preserved.
    pub fn new(scale: f64) -> NurtureResult<Self> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(NurtureError::Config(format!(
                "delay scale must be a positive number, got {scale}"
            )));
        }
        Ok(Self { scale })
    }

    pub fn production() -> Self {
        Self { scale: 1.0 }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    fn table(scenario: Scenario) -> &'static [i64] {
        match scenario {
            Scenario::AbandonedFunnel => &FUNNEL_DELAYS,
            Scenario::ViewedTeaserResult => &TEASER_DELAYS,
            Scenario::AbandonedCheckout => &CHECKOUT_DELAYS,
        }
    }

    /// Number of stages in the scenario's sequence.
    pub fn sequence_len(scenario: Scenario) -> u32 {
        Self::table(scenario).len() as u32
    }

    /// Delay required before `stage` may fire, measured from the previous
    /// fire (or from enrollment for stage 1). `None` means the sequence has
    /// no such stage and nothing is ever sent for it.
    pub fn required_delay(&self, scenario: Scenario, stage: u32) -> Option<Duration> {
        let index = usize::try_from(stage.checked_sub(1)?).ok()?;
        let secs = *Self::table(scenario).get(index)?;
        let millis = (secs as f64 * 1000.0 * self.scale).round() as i64;
        Some(Duration::milliseconds(millis))
    }
}

impl Default for StageDelayPolicy {
    fn default() -> Self {
        Self::production()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_one_fires_on_entry() {
        let policy = StageDelayPolicy::production();
        for scenario in Scenario::ALL {
            assert_eq!(policy.required_delay(scenario, 1), Some(Duration::zero()));
        }
    }

    #[test]
    fn test_delays_are_non_decreasing() {
        for scale in [1.0, 0.001, 3.5] {
            let policy = StageDelayPolicy::new(scale).unwrap();
            for scenario in Scenario::ALL {
                let delays: Vec<Duration> = (1..=StageDelayPolicy::sequence_len(scenario))
                    .map(|s| policy.required_delay(scenario, s).unwrap())
                    .collect();
                assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{scenario} x{scale}");
            }
        }
    }

    #[test]
    fn test_exhausted_sequences_return_none() {
        let policy = StageDelayPolicy::production();
        assert_eq!(policy.required_delay(Scenario::AbandonedFunnel, 4), None);
        assert_eq!(policy.required_delay(Scenario::ViewedTeaserResult, 10), None);
        assert_eq!(policy.required_delay(Scenario::AbandonedCheckout, 4), None);
        assert_eq!(policy.required_delay(Scenario::AbandonedCheckout, 0), None);
        assert_eq!(policy.required_delay(Scenario::AbandonedCheckout, u32::MAX), None);
    }

    #[test]
    fn test_teaser_timings() {
        let policy = StageDelayPolicy::production();
        let teaser = Scenario::ViewedTeaserResult;
        assert_eq!(policy.required_delay(teaser, 2), Some(Duration::hours(1)));
        assert_eq!(policy.required_delay(teaser, 3), Some(Duration::hours(3)));
        assert_eq!(policy.required_delay(teaser, 4), Some(Duration::hours(24)));
        assert_eq!(policy.required_delay(teaser, 9), Some(Duration::hours(144)));
    }

    #[test]
    fn test_scale_keeps_sequence_shape() {
        let fast = StageDelayPolicy::new(1.0 / 60.0).unwrap();
        assert_eq!(
            fast.required_delay(Scenario::AbandonedCheckout, 2),
            Some(Duration::minutes(2))
        );
        assert_eq!(fast.required_delay(Scenario::AbandonedCheckout, 4), None);
    }

    #[test]
    fn test_invalid_scale_rejected() {
        assert!(StageDelayPolicy::new(0.0).is_err());
        assert!(StageDelayPolicy::new(-1.0).is_err());
        assert!(StageDelayPolicy::new(f64::NAN).is_err());
    }
}
