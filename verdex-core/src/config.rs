//! Engine tuning knobs.
//!
//! All fields carry defaults so deployments can adopt individual settings
//! without supplying a full configuration payload. Every timing the loops
//! observe lives here; tests set the pacing block near zero.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-space execution configuration served by
/// [`Configer`](crate::infra::Configer).
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ExptExecConf {
    /// Zombie threshold and tick republish delay.
    #[serde(default)]
    pub zombie_interval_secs: ZombieInterval,
    /// Delay applied when the scheduler republishes its own event.
    #[serde(default)]
    pub daemon_interval_secs: DaemonInterval,
    /// Item-loop sizing and cadence.
    #[serde(default)]
    pub item_eval: ExptItemEvalConf,
    /// Explicit sleeps inside the loops.
    #[serde(default)]
    pub pacing: ExecPacingConf,
    /// Distributed lock TTLs and hold caps.
    #[serde(default)]
    pub locks: ExptLockConf,
    /// Backoff policy for the aggregation catch-up step.
    #[serde(default)]
    pub aggregation: AggRetryConf,
    /// Default per-turn evaluator fan-out width when the experiment does
    /// not override it.
    #[serde(default = "default_evaluator_concur")]
    pub evaluator_concur_num: usize,
}

fn default_evaluator_concur() -> usize {
    3
}

/// Newtype wrappers keep the two interval defaults out of each other's way
/// in serde payloads.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZombieInterval(pub i64);

impl Default for ZombieInterval {
    fn default() -> Self {
        Self(600)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaemonInterval(pub u64);

impl Default for DaemonInterval {
    fn default() -> Self {
        Self(10)
    }
}

impl ExptExecConf {
    pub fn zombie_interval(&self) -> Duration {
        Duration::from_secs(self.zombie_interval_secs.0.max(0) as u64)
    }

    pub fn daemon_interval(&self) -> Duration {
        Duration::from_secs(self.daemon_interval_secs.0)
    }

    /// TTL for the `expt_start:*` / `expt_end:*` idempotency markers.
    pub fn marker_ttl(&self) -> Duration {
        self.zombie_interval() * 2
    }
}

/// Sizing and cadence for per-item evaluation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ExptItemEvalConf {
    /// Max items of one run in flight at once, unless the experiment
    /// overrides it.
    pub concur_num: usize,
    /// Publish delay for item events, spreading a submitted batch out.
    pub interval_ms: u64,
    /// An item stuck in Processing longer than this is warn-logged as a
    /// zombie by the scheduler.
    pub zombie_secs: i64,
}

impl Default for ExptItemEvalConf {
    fn default() -> Self {
        Self {
            concur_num: 5,
            interval_ms: 1_000,
            zombie_secs: 600,
        }
    }
}

impl ExptItemEvalConf {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Explicit sleeps inside the loops. Values are the production cadence;
/// tests zero them out without touching semantics.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ExecPacingConf {
    /// After a mode's ExptStart finishes, before the first scan cycle.
    pub start_settle_ms: u64,
    /// Between scheduler ticks, before the event republish.
    pub tick_pause_ms: u64,
    /// Between evaluation-set pages / turn-result batches during start.
    pub page_delay_ms: u64,
    /// Between aggregation posts when catching up completed items.
    pub aggregation_spacing_ms: u64,
    /// Append backoff when a cycle found no work.
    pub append_empty_backoff_ms: u64,
    /// After the last turn of an item, letting logs land.
    pub turn_settle_ms: u64,
}

impl Default for ExecPacingConf {
    fn default() -> Self {
        Self {
            start_settle_ms: 3_000,
            tick_pause_ms: 3_000,
            page_delay_ms: 30,
            aggregation_spacing_ms: 50,
            append_empty_backoff_ms: 60_000,
            turn_settle_ms: 1_000,
        }
    }
}

impl ExecPacingConf {
    /// All-zero pacing for tests.
    pub fn immediate() -> Self {
        Self {
            start_settle_ms: 0,
            tick_pause_ms: 0,
            page_delay_ms: 0,
            aggregation_spacing_ms: 0,
            append_empty_backoff_ms: 0,
            turn_settle_ms: 0,
        }
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }

    pub fn tick_pause(&self) -> Duration {
        Duration::from_millis(self.tick_pause_ms)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn aggregation_spacing(&self) -> Duration {
        Duration::from_millis(self.aggregation_spacing_ms)
    }

    pub fn append_empty_backoff(&self) -> Duration {
        Duration::from_millis(self.append_empty_backoff_ms)
    }

    pub fn turn_settle(&self) -> Duration {
        Duration::from_millis(self.turn_settle_ms)
    }
}

/// Distributed lock tuning for the two lock families.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ExptLockConf {
    /// TTL of one lock grant; renewal extends it until max-hold.
    pub ttl_secs: u64,
    /// Renew when remaining TTL drops below this fraction of the original.
    pub renew_at_fraction: f32,
    /// Hard cap for holding the per-run scheduler lock.
    pub run_max_hold_secs: u64,
    /// Hard cap for holding the per-item eval lock.
    pub item_max_hold_secs: u64,
}

impl Default for ExptLockConf {
    fn default() -> Self {
        Self {
            ttl_secs: 20,
            renew_at_fraction: 0.5,
            run_max_hold_secs: 3 * 60,
            item_max_hold_secs: 30 * 60,
        }
    }
}

impl ExptLockConf {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn run_max_hold(&self) -> Duration {
        Duration::from_secs(self.run_max_hold_secs)
    }

    pub fn item_max_hold(&self) -> Duration {
        Duration::from_secs(self.item_max_hold_secs)
    }
}

/// Exponential backoff for `RecordItemRunLogs` aggregation retries.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AggRetryConf {
    /// Give up (and fail the cycle) once this much time has elapsed.
    pub max_elapsed_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for AggRetryConf {
    fn default() -> Self {
        Self {
            max_elapsed_ms: 5 * 60 * 1_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl AggRetryConf {
    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Retry policy the classifier serves for one `(space, error)` pair.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ErrRetryConf {
    /// Max republishes of one item event.
    pub retry_times: u32,
    /// Delay before the retry republish.
    pub retry_interval_secs: u64,
    /// Quota/benefit exhausted; the experiment must terminate.
    pub is_in_debt: bool,
}

impl Default for ErrRetryConf {
    fn default() -> Self {
        Self {
            retry_times: 3,
            retry_interval_secs: 10,
            is_in_debt: false,
        }
    }
}

impl ErrRetryConf {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// Operator-configured sanitization of user-visible error messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrConvertConf {
    /// Messages are truncated to this many characters.
    pub max_chars: usize,
    /// Regex patterns replaced with `[redacted]` before truncation.
    #[serde(default)]
    pub redact_patterns: Vec<String>,
}

impl Default for ErrConvertConf {
    fn default() -> Self {
        Self {
            max_chars: 1_024,
            redact_patterns: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_production_cadence() {
        let conf = ExptExecConf::default();
        assert_eq!(conf.zombie_interval(), Duration::from_secs(600));
        assert_eq!(conf.marker_ttl(), Duration::from_secs(1_200));
        assert_eq!(conf.pacing.turn_settle_ms, 1_000);
        assert_eq!(conf.locks.ttl_secs, 20);
        assert_eq!(conf.locks.run_max_hold_secs, 180);
        assert_eq!(conf.locks.item_max_hold_secs, 1_800);
    }

    #[test]
    fn immediate_pacing_is_all_zero() {
        let pacing = ExecPacingConf::immediate();
        assert_eq!(pacing.tick_pause(), Duration::ZERO);
        assert_eq!(pacing.append_empty_backoff(), Duration::ZERO);
    }
}
