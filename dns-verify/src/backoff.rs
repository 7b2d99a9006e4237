// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Delay policies used between DNS verification attempts

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;
use std::time::Duration;

pub use ::backoff::backoff::Backoff;

/// Default interval between attempts.  DNS providers that export zone data
/// on request typically make it visible within a few seconds.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// How long to wait between consecutive resolution attempts
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Wait the same amount of time before every retry.
    Fixed {
        #[serde(rename = "interval_ms")]
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        interval: Duration,
    },
    /// Start at `initial`, multiply by `multiplier` after every retry, and
    /// never wait longer than `max`.
    Exponential {
        #[serde(rename = "initial_ms")]
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        initial: Duration,
        #[serde(rename = "max_ms")]
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        max: Duration,
        multiplier: f64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed { interval: DEFAULT_INTERVAL }
    }
}

impl BackoffPolicy {
    /// Returns a fresh backoff state machine for one verification run.
    ///
    /// Neither policy ever gives up on its own: the number of attempts is
    /// bounded by the caller, not by elapsed time.
    pub fn build(&self) -> Box<dyn Backoff + Send> {
        match self {
            BackoffPolicy::Fixed { interval } => {
                Box::new(::backoff::backoff::Constant::new(*interval))
            }
            BackoffPolicy::Exponential { initial, max, multiplier } => {
                Box::new(::backoff::ExponentialBackoff {
                    current_interval: *initial,
                    initial_interval: *initial,
                    randomization_factor: 0.0,
                    multiplier: *multiplier,
                    max_interval: *max,
                    max_elapsed_time: None,
                    ..::backoff::ExponentialBackoff::default()
                })
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            BackoffPolicy::Fixed { .. } => Ok(()),
            BackoffPolicy::Exponential { initial, max, multiplier } => {
                if !(*multiplier >= 1.0) {
                    return Err(format!(
                        "exponential backoff multiplier must be at least 1.0 \
                         (found {})",
                        multiplier
                    ));
                }
                if initial > max {
                    return Err(format!(
                        "exponential backoff initial interval ({:?}) exceeds \
                         its maximum ({:?})",
                        initial, max
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_policy_repeats_interval() {
        let policy = BackoffPolicy::Fixed { interval: Duration::from_secs(2) };
        let mut backoff = policy.build();
        for _ in 0..5 {
            assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(2)));
        }
    }

    #[test]
    fn exponential_policy_grows_to_cap() {
        let policy = BackoffPolicy::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            multiplier: 2.0,
        };
        let mut backoff = policy.build();
        let delays: Vec<_> =
            (0..4).map(|_| backoff.next_backoff().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
    }

    #[test]
    fn exponential_policy_rejects_shrinking_multiplier() {
        let policy = BackoffPolicy::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 0.5,
        };
        assert!(policy.validate().is_err());
        assert!(BackoffPolicy::default().validate().is_ok());
    }
}
