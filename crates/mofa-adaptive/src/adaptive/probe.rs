//! Platform introspection.
//!
//! [`PlatformProbe`] is the single seam through which the crate touches the
//! host: memory, CPU, accelerator, storage and process termination. Two
//! implementations ship with the crate:
//!
//! - [`SystemProbe`]: real introspection via `sysinfo` plus the external
//!   `nvidia-smi` tool for accelerator memory and per-process usage.
//! - [`StaticProbe`]: an in-process, settable hardware description used to
//!   simulate hardware changes (tier migration drills, tests).
//!
//! Probes report failures honestly through [`ProbeError`]; the profiler and
//! resource monitor decide what a failure means (a conservative default or an
//! "unknown" state).
//!
//! ## Blocking
//!
//! `sysinfo` refreshes and the `nvidia-smi` subprocess are blocking calls, so
//! `SystemProbe` runs every query under `tokio::task::spawn_blocking`.

use std::io::ErrorKind;
use std::process::Command;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, Pid, RefreshKind, Signal, System};

use super::types::{ProbeError, TerminationError};

const BYTES_PER_MB: u64 = 1024 * 1024;
const NVIDIA_SMI: &str = "nvidia-smi";
const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Probe data
// ============================================================================

/// Raw totals for one memory pool, in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReading {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
}

impl MemoryReading {
    pub fn new(total_mb: u64, free_mb: u64) -> Self {
        Self {
            total_mb,
            used_mb: total_mb.saturating_sub(free_mb),
            free_mb: free_mb.min(total_mb),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub cores: usize,
    pub freq_mhz: u64,
    pub brand: String,
}

/// Aggregate accelerator state. Multi-GPU hosts report summed memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    pub name: String,
    pub device_count: usize,
    pub memory: MemoryReading,
}

/// One process holding accelerator memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorProcess {
    pub pid: u32,
    pub name: String,
    pub memory_mb: u64,
}

/// How a terminated process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// Exited within the grace period after a polite terminate signal.
    Graceful,
    /// Had to be force-killed after the grace period elapsed.
    Forced,
}

// ============================================================================
// PlatformProbe
// ============================================================================

/// Host introspection used by the profiler and the resource monitor.
///
/// Implementations must be cheap to call repeatedly and must never terminate
/// the calling process: `terminate_process` with the current pid must fail
/// with [`TerminationError::OwnProcess`].
#[async_trait]
pub trait PlatformProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn host_memory(&self) -> Result<MemoryReading, ProbeError>;

    async fn cpu(&self) -> Result<CpuInfo, ProbeError>;

    /// `Ok(None)` means "no accelerator", including when the query tool is
    /// not installed.
    async fn accelerator(&self) -> Result<Option<AcceleratorInfo>, ProbeError>;

    async fn accelerator_processes(&self) -> Result<Vec<AcceleratorProcess>, ProbeError>;

    async fn storage_free_mb(&self) -> Result<u64, ProbeError>;

    /// Politely terminate `pid`, wait up to `grace`, then force-kill.
    async fn terminate_process(
        &self,
        pid: u32,
        grace: Duration,
    ) -> Result<TerminationOutcome, TerminationError>;
}

// ============================================================================
// SystemProbe
// ============================================================================

/// Real host introspection: `sysinfo` for host resources, `nvidia-smi` for
/// the accelerator.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    nvidia_smi: String,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            nvidia_smi: NVIDIA_SMI.to_string(),
        }
    }

    /// Use a different accelerator query binary (e.g. an absolute path).
    pub fn with_nvidia_smi(mut self, binary: impl Into<String>) -> Self {
        self.nvidia_smi = binary.into();
        self
    }

    /// Run the query tool. `Ok(None)` when the tool is missing or the driver
    /// refuses to answer.
    fn run_nvidia_smi(binary: &str, args: &[&str]) -> Result<Option<String>, ProbeError> {
        let output = match Command::new(binary).args(args).output() {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("SystemProbe: '{}' not installed, assuming no accelerator", binary);
                return Ok(None);
            }
            Err(e) => return Err(ProbeError::Io(e)),
        };

        if !output.status.success() {
            tracing::debug!(
                "SystemProbe: '{}' exited with {} ({})",
                binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }

        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ProbeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProbeError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProbeError::Unavailable(format!("probe task failed: {}", e)))?
}

#[async_trait]
impl PlatformProbe for SystemProbe {
    fn name(&self) -> &str {
        "system"
    }

    async fn host_memory(&self) -> Result<MemoryReading, ProbeError> {
        blocking(|| {
            let mut sys = System::new_with_specifics(
                RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
            );
            sys.refresh_memory();

            let total = sys.total_memory();
            if total == 0 {
                return Err(ProbeError::Unavailable(
                    "sysinfo reported zero total memory".to_string(),
                ));
            }
            Ok(MemoryReading::new(
                total / BYTES_PER_MB,
                sys.available_memory() / BYTES_PER_MB,
            ))
        })
        .await
    }

    async fn cpu(&self) -> Result<CpuInfo, ProbeError> {
        blocking(|| {
            let mut sys = System::new_with_specifics(
                RefreshKind::new().with_cpu(CpuRefreshKind::everything()),
            );
            sys.refresh_cpu();

            let cpus = sys.cpus();
            if cpus.is_empty() {
                return Err(ProbeError::Unavailable("no CPUs reported".to_string()));
            }
            Ok(CpuInfo {
                cores: cpus.len(),
                freq_mhz: cpus.iter().map(|c| c.frequency()).max().unwrap_or(0),
                brand: cpus[0].brand().trim().to_string(),
            })
        })
        .await
    }

    async fn accelerator(&self) -> Result<Option<AcceleratorInfo>, ProbeError> {
        let binary = self.nvidia_smi.clone();
        blocking(move || {
            let args = [
                "--query-gpu=name,memory.total,memory.used,memory.free",
                "--format=csv,noheader,nounits",
            ];
            match Self::run_nvidia_smi(&binary, &args)? {
                Some(stdout) => parse_gpu_query(&stdout),
                None => Ok(None),
            }
        })
        .await
    }

    async fn accelerator_processes(&self) -> Result<Vec<AcceleratorProcess>, ProbeError> {
        let binary = self.nvidia_smi.clone();
        blocking(move || {
            let args = [
                "--query-compute-apps=pid,process_name,used_memory",
                "--format=csv,noheader,nounits",
            ];
            match Self::run_nvidia_smi(&binary, &args)? {
                Some(stdout) => parse_compute_apps(&stdout),
                None => Ok(Vec::new()),
            }
        })
        .await
    }

    async fn storage_free_mb(&self) -> Result<u64, ProbeError> {
        blocking(|| {
            let disks = Disks::new_with_refreshed_list();
            if disks.list().is_empty() {
                return Err(ProbeError::Unavailable("no disks reported".to_string()));
            }
            // The disk holding the working directory is what model files use.
            let cwd = std::env::current_dir().ok();
            let best = disks
                .list()
                .iter()
                .filter(|d| {
                    cwd.as_ref()
                        .map(|cwd| cwd.starts_with(d.mount_point()))
                        .unwrap_or(false)
                })
                .max_by_key(|d| d.mount_point().as_os_str().len())
                .or_else(|| disks.list().iter().max_by_key(|d| d.available_space()));

            Ok(best.map(|d| d.available_space() / BYTES_PER_MB).unwrap_or(0))
        })
        .await
    }

    async fn terminate_process(
        &self,
        pid: u32,
        grace: Duration,
    ) -> Result<TerminationOutcome, TerminationError> {
        if pid == std::process::id() {
            return Err(TerminationError::OwnProcess(pid));
        }

        tokio::task::spawn_blocking(move || terminate_blocking(pid, grace))
            .await
            .map_err(|e| TerminationError::Refused {
                pid,
                reason: format!("termination task failed: {}", e),
            })?
    }
}

fn terminate_blocking(pid: u32, grace: Duration) -> Result<TerminationOutcome, TerminationError> {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();

    if !sys.refresh_process(target) {
        return Err(TerminationError::NotFound(pid));
    }

    let signalled = sys
        .process(target)
        .and_then(|p| p.kill_with(Signal::Term))
        .unwrap_or(false);

    if signalled {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            std::thread::sleep(TERMINATION_POLL_INTERVAL);
            if !sys.refresh_process(target) {
                return Ok(TerminationOutcome::Graceful);
            }
        }
        tracing::warn!(
            "SystemProbe: process {} ignored terminate for {:?}, force killing",
            pid,
            grace
        );
    }

    let killed = match sys.process(target) {
        Some(process) => process.kill(),
        None => return Ok(TerminationOutcome::Graceful),
    };
    if !killed {
        return Err(TerminationError::Refused {
            pid,
            reason: "kill signal was rejected".to_string(),
        });
    }

    std::thread::sleep(TERMINATION_POLL_INTERVAL);
    if sys.refresh_process(target) {
        return Err(TerminationError::StillRunning(pid));
    }
    Ok(TerminationOutcome::Forced)
}

/// Parse `nvidia-smi --query-gpu=name,memory.total,memory.used,memory.free`
/// CSV output. Every line is one device; memory is summed across devices.
pub fn parse_gpu_query(stdout: &str) -> Result<Option<AcceleratorInfo>, ProbeError> {
    let mut info: Option<AcceleratorInfo> = None;

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            return Err(ProbeError::Parse(format!("unexpected GPU line '{}'", line)));
        }
        let number = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| ProbeError::Parse(format!("bad memory value '{}' in '{}'", s, line)))
        };
        let total = number(fields[1])?;
        let used = number(fields[2])?;
        let free = number(fields[3])?;

        match info.as_mut() {
            Some(acc) => {
                acc.device_count += 1;
                acc.memory.total_mb += total;
                acc.memory.used_mb += used;
                acc.memory.free_mb += free;
            }
            None => {
                info = Some(AcceleratorInfo {
                    name: fields[0].to_string(),
                    device_count: 1,
                    memory: MemoryReading {
                        total_mb: total,
                        used_mb: used,
                        free_mb: free,
                    },
                })
            }
        }
    }

    Ok(info)
}

/// Parse `nvidia-smi --query-compute-apps=pid,process_name,used_memory` CSV
/// output. Lines whose memory is reported as `[N/A]` count as 0MB.
pub fn parse_compute_apps(stdout: &str) -> Result<Vec<AcceleratorProcess>, ProbeError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 3 {
                return Err(ProbeError::Parse(format!("unexpected process line '{}'", line)));
            }
            let pid = fields[0]
                .parse::<u32>()
                .map_err(|_| ProbeError::Parse(format!("bad pid in '{}'", line)))?;
            Ok(AcceleratorProcess {
                pid,
                name: fields[1].to_string(),
                memory_mb: fields[2].parse::<u64>().unwrap_or(0),
            })
        })
        .collect()
}

// ============================================================================
// StaticProbe
// ============================================================================

#[derive(Debug, Clone)]
struct StaticState {
    host: Option<MemoryReading>,
    cpu: Option<CpuInfo>,
    accelerator: Result<Option<AcceleratorInfo>, String>,
    processes: Vec<AcceleratorProcess>,
    storage_free_mb: Option<u64>,
    terminated: Vec<u32>,
    refuse_termination: Vec<u32>,
}

/// A settable, in-memory hardware description.
///
/// Every reading can be changed at runtime, which is how tier migrations are
/// rehearsed without touching real hardware. A `None` reading makes the
/// corresponding probe fail.
///
/// ```rust
/// use mofa_adaptive::adaptive::probe::StaticProbe;
///
/// let probe = StaticProbe::new()
///     .with_ram_mb(16_384, 12_000)
///     .with_gpu("RTX 4070", 8_192, 7_500);
/// probe.remove_gpu(); // simulate an eGPU being unplugged
/// ```
#[derive(Debug)]
pub struct StaticProbe {
    state: RwLock<StaticState>,
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticProbe {
    /// 8GB RAM, 4 cores at 2.5GHz, no accelerator, 50GB free disk.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StaticState {
                host: Some(MemoryReading::new(8_192, 4_096)),
                cpu: Some(CpuInfo {
                    cores: 4,
                    freq_mhz: 2_500,
                    brand: "static".to_string(),
                }),
                accelerator: Ok(None),
                processes: Vec::new(),
                storage_free_mb: Some(50_000),
                terminated: Vec::new(),
                refuse_termination: Vec::new(),
            }),
        }
    }

    pub fn with_ram_mb(self, total_mb: u64, available_mb: u64) -> Self {
        self.set_ram_mb(total_mb, available_mb);
        self
    }

    pub fn with_cpu(self, cores: usize, freq_mhz: u64) -> Self {
        self.update(|s| {
            s.cpu = Some(CpuInfo {
                cores,
                freq_mhz,
                brand: "static".to_string(),
            })
        });
        self
    }

    pub fn with_gpu(self, name: &str, total_mb: u64, free_mb: u64) -> Self {
        self.set_gpu(name, total_mb, free_mb);
        self
    }

    pub fn with_storage_free_mb(self, mb: u64) -> Self {
        self.update(|s| s.storage_free_mb = Some(mb));
        self
    }

    pub fn set_ram_mb(&self, total_mb: u64, available_mb: u64) {
        self.update(|s| s.host = Some(MemoryReading::new(total_mb, available_mb)));
    }

    pub fn set_gpu(&self, name: &str, total_mb: u64, free_mb: u64) {
        let info = AcceleratorInfo {
            name: name.to_string(),
            device_count: 1,
            memory: MemoryReading::new(total_mb, free_mb),
        };
        self.update(|s| s.accelerator = Ok(Some(info)));
    }

    pub fn remove_gpu(&self) {
        self.update(|s| {
            s.accelerator = Ok(None);
            s.processes.clear();
        });
    }

    pub fn set_processes(&self, processes: Vec<AcceleratorProcess>) {
        self.update(|s| s.processes = processes);
    }

    /// Make the host memory probe fail.
    pub fn fail_host_memory(&self) {
        self.update(|s| s.host = None);
    }

    /// Make the accelerator probe fail (as opposed to reporting no GPU).
    pub fn fail_accelerator(&self, reason: &str) {
        let reason = reason.to_string();
        self.update(|s| s.accelerator = Err(reason));
    }

    pub fn fail_cpu(&self) {
        self.update(|s| s.cpu = None);
    }

    /// Make `terminate_process` fail for `pid`.
    pub fn refuse_termination_of(&self, pid: u32) {
        self.update(|s| s.refuse_termination.push(pid));
    }

    /// Pids terminated so far, in order.
    pub fn terminated_pids(&self) -> Vec<u32> {
        self.read(|s| s.terminated.clone())
    }

    fn update(&self, f: impl FnOnce(&mut StaticState)) {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    fn read<T>(&self, f: impl FnOnce(&StaticState) -> T) -> T {
        let guard = self.state.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }
}

#[async_trait]
impl PlatformProbe for StaticProbe {
    fn name(&self) -> &str {
        "static"
    }

    async fn host_memory(&self) -> Result<MemoryReading, ProbeError> {
        self.read(|s| s.host)
            .ok_or_else(|| ProbeError::Unavailable("host memory probe disabled".to_string()))
    }

    async fn cpu(&self) -> Result<CpuInfo, ProbeError> {
        self.read(|s| s.cpu.clone())
            .ok_or_else(|| ProbeError::Unavailable("cpu probe disabled".to_string()))
    }

    async fn accelerator(&self) -> Result<Option<AcceleratorInfo>, ProbeError> {
        self.read(|s| s.accelerator.clone())
            .map_err(ProbeError::Unavailable)
    }

    async fn accelerator_processes(&self) -> Result<Vec<AcceleratorProcess>, ProbeError> {
        Ok(self.read(|s| s.processes.clone()))
    }

    async fn storage_free_mb(&self) -> Result<u64, ProbeError> {
        self.read(|s| s.storage_free_mb)
            .ok_or_else(|| ProbeError::Unavailable("storage probe disabled".to_string()))
    }

    async fn terminate_process(
        &self,
        pid: u32,
        _grace: Duration,
    ) -> Result<TerminationOutcome, TerminationError> {
        if pid == std::process::id() {
            return Err(TerminationError::OwnProcess(pid));
        }

        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        if guard.refuse_termination.contains(&pid) {
            return Err(TerminationError::Refused {
                pid,
                reason: "operation not permitted".to_string(),
            });
        }

        let Some(index) = guard.processes.iter().position(|p| p.pid == pid) else {
            return Err(TerminationError::NotFound(pid));
        };
        let process = guard.processes.remove(index);
        guard.terminated.push(pid);

        // Freed accelerator memory becomes free again.
        if let Ok(Some(accel)) = guard.accelerator.as_mut() {
            let freed = process.memory_mb.min(accel.memory.used_mb);
            accel.memory.used_mb -= freed;
            accel.memory.free_mb += freed;
        }

        Ok(TerminationOutcome::Graceful)
    }
}

// ============================================================================
// Tests
// ============================================================================
