//! Read-only hardware introspection captured at run start.

use serde::{Deserialize, Serialize};
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accelerator {
    pub index: u32,
    pub name: String,
    pub memory_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub system: String,
    pub arch: String,
    pub release: Option<String>,
    pub cpu: Option<String>,
    pub logical_cores: usize,
    pub ram_gb: Option<f64>,
    #[serde(default)]
    pub accelerators: Vec<Accelerator>,
}

impl HardwareSnapshot {
    /// Resolves the configured compute device against this snapshot.
    ///
    /// `auto` picks the requested accelerator when one exists and falls back to `cpu`.
    #[must_use]
    pub fn resolve_device(&self, requested: &str, gpu_index: u32) -> String {
        match requested.trim().to_ascii_lowercase().as_str() {
            "cpu" => "cpu".to_string(),
            "auto" if self.accelerators.is_empty() => "cpu".to_string(),
            _ => {
                let index = if self.accelerators.iter().any(|a| a.index == gpu_index) {
                    gpu_index
                } else {
                    self.accelerators.first().map_or(gpu_index, |a| a.index)
                };
                format!("cuda:{index}")
            }
        }
    }
}

pub trait HardwareInspector: Send + Sync {
    fn snapshot(&self) -> HardwareSnapshot;
}

/// Inspects the host via `/proc` and `nvidia-smi` where available.
#[derive(Debug, Default)]
pub struct SystemInspector;

impl HardwareInspector for SystemInspector {
    fn snapshot(&self) -> HardwareSnapshot {
        HardwareSnapshot {
            system: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            release: read_trimmed("/proc/sys/kernel/osrelease"),
            cpu: cpu_model(),
            logical_cores: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            ram_gb: total_ram_gb(),
            accelerators: nvidia_accelerators(),
        }
    }
}

/// Returns a fixed snapshot; used where the host must not be probed.
#[derive(Debug, Clone)]
pub struct StaticInspector(pub HardwareSnapshot);

impl StaticInspector {
    #[must_use]
    pub fn cpu_only() -> Self {
        Self(HardwareSnapshot {
            system: "linux".to_string(),
            arch: "x86_64".to_string(),
            release: None,
            cpu: Some("test-cpu".to_string()),
            logical_cores: 4,
            ram_gb: Some(16.0),
            accelerators: Vec::new(),
        })
    }
}

impl HardwareInspector for StaticInspector {
    fn snapshot(&self) -> HardwareSnapshot {
        self.0.clone()
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn cpu_model() -> Option<String> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    cpuinfo
        .lines()
        .find(|line| line.starts_with("model name"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, name)| name.trim().to_string())
}

fn total_ram_gb() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_total_kb(&meminfo).map(|kb| round2(kb as f64 / (1024.0 * 1024.0)))
}

fn parse_mem_total_kb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn nvidia_accelerators() -> Vec<Accelerator> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index,name,memory.total", "--format=csv,noheader,nounits"])
        .output();
    match output {
        Ok(out) if out.status.success() => {
            parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout))
        }
        _ => Vec::new(),
    }
}

fn parse_nvidia_smi(csv: &str) -> Vec<Accelerator> {
    csv.lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let index = fields.next()?.parse().ok()?;
            let name = fields.next()?.to_string();
            let memory_mib: f64 = fields.next()?.parse().ok()?;
            Some(Accelerator { index, name, memory_gb: round2(memory_mib / 1024.0) })
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
