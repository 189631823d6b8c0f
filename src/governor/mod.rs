//! Adaptive resource governor.
//!
//! Resource samples go into a sliding window. Each new sample may move the
//! governor between [`GovernorState`]s, and every state maps to one
//! [`GovernorPolicy`]. Readers take the current policy as a snapshot with
//! [`ResourceGovernor::current_policy`].
use crate::config::Config;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

mod policy;
mod probe;

pub use policy::GovernorPolicy;
pub use policy::GovernorState;
pub use policy::ResourceSample;
pub use policy::MIN_CHUNK_ROWS;
pub use probe::ResourceProbe;
pub use probe::SystemProbe;

/// Callback invoked with every newly published policy.
pub type PolicyListener = Box<dyn Fn(&GovernorPolicy) + Send + Sync>;

struct Window {
    samples: VecDeque<ResourceSample>,
    state: GovernorState,
}

pub struct ResourceGovernor {
    config: Config,
    probe: Mutex<Box<dyn ResourceProbe>>,
    window: Mutex<Window>,
    policy: RwLock<Arc<GovernorPolicy>>,
    listeners: Vec<PolicyListener>,
}

impl ResourceGovernor {
    pub fn new(config: Config, probe: Box<dyn ResourceProbe>, listeners: Vec<PolicyListener>) -> Self {
        let policy = GovernorPolicy::new(GovernorState::Normal, false, &config);
        ResourceGovernor {
            window: Mutex::new(Window {
                samples: VecDeque::with_capacity(config.sample_window),
                state: GovernorState::Normal,
            }),
            config,
            probe: Mutex::new(probe),
            policy: RwLock::new(Arc::new(policy)),
            listeners,
        }
    }

    /// The latest published policy.
    pub fn current_policy(&self) -> GovernorPolicy {
        **self.policy.read()
    }

    pub fn state(&self) -> GovernorState {
        self.current_policy().state
    }

    /// Applies one sample and publishes the resulting policy if it changed.
    pub fn observe(&self, sample: ResourceSample) -> GovernorPolicy {
        let (previous, next) = {
            let mut window = self.window.lock();
            if window.samples.len() == self.config.sample_window {
                window.samples.pop_front();
            }
            window.samples.push_back(sample);
            let previous = window.state;
            let next = policy::transition(
                previous,
                window.samples.make_contiguous(),
                self.config.max_memory_ceiling_bytes,
            );
            window.state = next;
            (previous, next)
        };
        if previous != next {
            info!(
                from = %previous,
                to = %next,
                mem_used_bytes = sample.mem_used_bytes,
                cpu_percent = sample.cpu_percent,
                "Governor state changed"
            );
        }

        let network_saturated = self
            .config
            .max_network_bytes_per_sec
            .is_some_and(|limit| sample.net_bytes_per_sec > limit);
        let policy = GovernorPolicy::new(next, network_saturated, &self.config);
        self.publish(policy);
        policy
    }

    /// Takes a sample from the probe and observes it.
    pub fn tick(&self) -> anyhow::Result<GovernorPolicy> {
        let sample = self.probe.lock().sample()?;
        Ok(self.observe(sample))
    }

    fn publish(&self, policy: GovernorPolicy) {
        {
            let mut current = self.policy.write();
            if **current == policy {
                return;
            }
            *current = Arc::new(policy);
        }
        debug!(?policy, "Publish governor policy");
        for listener in &self.listeners {
            listener(&policy);
        }
    }

    /// Starts the background sampler, `None` when sampling is disabled.
    pub fn start_sampler(self: &Arc<Self>) -> std::io::Result<Option<Sampler>> {
        let Some(interval) = self.config.sampling_interval() else {
            return Ok(None);
        };
        let (shutdown, signal) = mpsc::channel::<()>();
        let governor = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("sheet-slice-governor".to_owned())
            .spawn(move || loop {
                match signal.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(error) = governor.tick() {
                            warn!(%error, "Resource sampling failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        info!(interval_ms = interval.as_millis() as u64, "Resource sampler started");
        Ok(Some(Sampler {
            shutdown: Some(shutdown),
            handle: Some(handle),
        }))
    }
}

/// Handle of the sampling thread. Stopping is idempotent and also happens on drop.
pub struct Sampler {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sampler {
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Resource sampler panicked");
            }
            info!("Resource sampler stopped");
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}
