use std::env;
use std::time::Duration;

use tracing::warn;

/// Tunables for the interpreter and the staleness guard. Defaults match
/// production behavior; tests shrink them to keep runs fast.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on steps per interpreter invocation (runaway/cycle guard).
    pub max_steps_per_run: usize,
    /// Fixed pause between steps so outbound sends read like a human typing.
    pub step_throttle: Duration,
    /// Delays up to this bound block in-process; longer ones suspend as `paused`.
    pub sync_delay_cap: Duration,
    /// A `running` execution older than this indicates a crashed step.
    pub running_stale_after: Duration,
    /// A `waiting_response`/`paused` execution older than this is abandoned.
    pub suspended_stale_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_run: 50,
            step_throttle: Duration::from_millis(400),
            sync_delay_cap: Duration::from_secs(30),
            running_stale_after: Duration::from_secs(5 * 60),
            suspended_stale_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl EngineConfig {
    /// Builds a config from `ZAPFLOW_*` environment variables, falling back to
    /// defaults per key. The binary loads `.env` via dotenvy before calling this.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = read_var("ZAPFLOW_MAX_STEPS") {
            cfg.max_steps_per_run = n as usize;
        }
        if let Some(ms) = read_var("ZAPFLOW_STEP_THROTTLE_MS") {
            cfg.step_throttle = Duration::from_millis(ms);
        }
        if let Some(s) = read_var("ZAPFLOW_SYNC_DELAY_CAP_SECS") {
            cfg.sync_delay_cap = Duration::from_secs(s);
        }
        if let Some(s) = read_var("ZAPFLOW_RUNNING_STALE_SECS") {
            cfg.running_stale_after = Duration::from_secs(s);
        }
        if let Some(s) = read_var("ZAPFLOW_SUSPENDED_STALE_SECS") {
            cfg.suspended_stale_after = Duration::from_secs(s);
        }
        cfg
    }

    /// Zero throttle so test runs do not wait between steps.
    pub fn fast() -> Self {
        Self {
            step_throttle: Duration::ZERO,
            ..Self::default()
        }
    }
}

fn read_var(key: &str) -> Option<u64> {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("ignoring {}: `{}` is not a number", key, raw);
                None
            }
        },
        Err(_) => None,
    }
}
