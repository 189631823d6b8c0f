use crate::governor::ResourceSample;
use anyhow::anyhow;
use anyhow::Result;
use std::time::Instant;
use sysinfo::Networks;
use sysinfo::Pid;
use sysinfo::System;

/// Source of resource samples.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> Result<ResourceSample>;
}

/// Samples the current process with `sysinfo`: resident memory, CPU usage
/// normalized by the number of cores, and the rx+tx rate summed over all
/// network interfaces.
pub struct SystemProbe {
    system: System,
    networks: Networks,
    /// `None` when the platform cannot report the current process id.
    pid: Option<Pid>,
    cores: f32,
    last_network_refresh: Instant,
}

impl SystemProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        let cores = std::thread::available_parallelism().map(|cores| cores.get()).unwrap_or(1);
        let mut system = System::new();
        if let Some(pid) = pid {
            system.refresh_process(pid);
        }
        SystemProbe {
            system,
            networks: Networks::new_with_refreshed_list(),
            pid,
            cores: cores as f32,
            last_network_refresh: Instant::now(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&mut self) -> Result<ResourceSample> {
        let pid = self.pid.ok_or_else(|| anyhow!("current process id is unavailable"))?;
        if !self.system.refresh_process(pid) {
            Err(anyhow!("process {pid} not found in sysinfo snapshot"))?;
        }
        let process = self
            .system
            .process(pid)
            .ok_or_else(|| anyhow!("process {pid} not found in sysinfo snapshot"))?;
        let mem_used_bytes = process.memory();
        let cpu_percent = (process.cpu_usage() / self.cores).clamp(0.0, 100.0);

        // Interface counters are deltas since the previous refresh.
        self.networks.refresh();
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_network_refresh).as_secs_f64();
        self.last_network_refresh = now;
        let transferred: u64 = self
            .networks
            .iter()
            .map(|(_, data)| data.received() + data.transmitted())
            .sum();
        let net_bytes_per_sec = if elapsed > 0.0 { (transferred as f64 / elapsed) as u64 } else { 0 };

        Ok(ResourceSample {
            at: now,
            mem_used_bytes,
            cpu_percent,
            net_bytes_per_sec,
        })
    }
}
