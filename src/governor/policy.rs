use crate::config::Config;
use serde::Serialize;
use std::fmt::Display;
use std::time::Instant;

/// Smallest chunk the governor shrinks reads to, unless the configured base is smaller.
pub const MIN_CHUNK_ROWS: usize = 500;

const CONSTRAINED_MEMORY: f64 = 0.70;
const CRITICAL_MEMORY: f64 = 0.90;
const CONSTRAINED_CPU: f32 = 80.0;
const CALM_MEMORY: f64 = 0.60;
const CALM_CPU: f32 = 60.0;
const CPU_SAMPLES: usize = 2;
const CALM_SAMPLES: usize = 3;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum GovernorState {
    #[default]
    Normal,
    Constrained,
    Critical,
}

impl Display for GovernorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GovernorState::Normal => "normal",
            GovernorState::Constrained => "constrained",
            GovernorState::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// One measurement of the process.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ResourceSample {
    pub at: Instant,
    pub mem_used_bytes: u64,
    /// Process CPU usage as a share of the whole machine, 0 to 100.
    pub cpu_percent: f32,
    pub net_bytes_per_sec: u64,
}

impl ResourceSample {
    pub fn new(mem_used_bytes: u64, cpu_percent: f32, net_bytes_per_sec: u64) -> Self {
        ResourceSample {
            at: Instant::now(),
            mem_used_bytes,
            cpu_percent,
            net_bytes_per_sec,
        }
    }
}

/// Limits every component reads before doing work.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GovernorPolicy {
    pub state: GovernorState,
    pub max_concurrent_fetches: usize,
    pub max_chunk_rows: usize,
    pub cache_byte_budget: u64,
    pub prefetch_enabled: bool,
}

impl GovernorPolicy {
    pub fn new(state: GovernorState, network_saturated: bool, config: &Config) -> Self {
        let floor = MIN_CHUNK_ROWS.min(config.base_chunk_rows);
        match state {
            GovernorState::Normal => GovernorPolicy {
                state,
                max_concurrent_fetches: config.base_concurrency,
                max_chunk_rows: config.base_chunk_rows,
                cache_byte_budget: config.cache_byte_budget,
                prefetch_enabled: config.prefetch_enabled && !network_saturated,
            },
            GovernorState::Constrained => GovernorPolicy {
                state,
                max_concurrent_fetches: (config.base_concurrency / 2).max(1),
                max_chunk_rows: (config.base_chunk_rows / 2).max(floor),
                cache_byte_budget: config.cache_byte_budget,
                prefetch_enabled: false,
            },
            GovernorState::Critical => GovernorPolicy {
                state,
                max_concurrent_fetches: 1,
                max_chunk_rows: floor,
                cache_byte_budget: config.cache_byte_budget / 2,
                prefetch_enabled: false,
            },
        }
    }
}

/// Next state after `window` gained its latest sample.
///
/// Escalation looks at the newest samples only; de-escalation needs
/// [`CALM_SAMPLES`] calm samples in a row and always goes straight to `Normal`.
pub(crate) fn transition(current: GovernorState, window: &[ResourceSample], ceiling: u64) -> GovernorState {
    let Some(latest) = window.last() else {
        return current;
    };
    let memory = |sample: &ResourceSample| sample.mem_used_bytes as f64 / ceiling as f64;
    let is_critical = memory(latest) >= CRITICAL_MEMORY;
    let is_calm = window.len() >= CALM_SAMPLES
        && window[window.len() - CALM_SAMPLES..]
            .iter()
            .all(|sample| memory(sample) < CALM_MEMORY && sample.cpu_percent < CALM_CPU);

    match current {
        GovernorState::Normal if is_critical => GovernorState::Critical,
        GovernorState::Normal => {
            let cpu_bound = window.len() >= CPU_SAMPLES
                && window[window.len() - CPU_SAMPLES..]
                    .iter()
                    .all(|sample| sample.cpu_percent >= CONSTRAINED_CPU);
            if memory(latest) >= CONSTRAINED_MEMORY || cpu_bound {
                GovernorState::Constrained
            } else {
                GovernorState::Normal
            }
        }
        GovernorState::Constrained if is_critical => GovernorState::Critical,
        GovernorState::Constrained | GovernorState::Critical if is_calm => GovernorState::Normal,
        state => state,
    }
}
