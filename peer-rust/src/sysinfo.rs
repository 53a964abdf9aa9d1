use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const SYSTEM_INFO_FILE: &str = "system_info.txt";

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct GpuInfo {
    pub name: String,
    pub memory_mb: Option<u64>,
    pub driver_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub peer_version: &'static str,
    pub hostname: Option<String>,
    pub os: &'static str,
    pub arch: &'static str,
    pub cpus: usize,
    pub gpus: Vec<GpuInfo>,
}

impl SystemInfo {
    pub fn collect() -> Self {
        let gpus = match detect_gpus() {
            Ok(gpus) => gpus,
            Err(e) => {
                tracing::warn!("GPU detection failed: {e}");
                Vec::new()
            }
        };

        Self {
            peer_version: env!("CARGO_PKG_VERSION"),
            hostname: hostname(),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            cpus: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            gpus,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "swarm-peer: {}", self.peer_version);
        let _ = writeln!(out, "hostname: {}", self.hostname.as_deref().unwrap_or("unknown"));
        let _ = writeln!(out, "os: {} ({})", self.os, self.arch);
        let _ = writeln!(out, "cpus: {}", self.cpus);
        if self.gpus.is_empty() {
            let _ = writeln!(out, "gpus: none");
        }
        for (i, gpu) in self.gpus.iter().enumerate() {
            let _ = writeln!(
                out,
                "gpu{i}: {} memory_mb={} driver={}",
                gpu.name,
                gpu.memory_mb.map(|m| m.to_string()).unwrap_or_else(|| "?".into()),
                gpu.driver_version.as_deref().unwrap_or("?")
            );
        }
        out
    }

    /// Write the report into `log_dir` and return its path.
    pub fn write_to(&self, log_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Cannot create {}", log_dir.display()))?;
        let path = log_dir.join(SYSTEM_INFO_FILE);
        std::fs::write(&path, self.render())
            .with_context(|| format!("Cannot write {}", path.display()))?;
        Ok(path)
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

fn detect_gpus() -> Result<Vec<GpuInfo>> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total,driver_version", "--format=csv,noheader,nounits"])
        .output()?;

    if !output.status.success() {
        anyhow::bail!("nvidia-smi failed");
    }
    Ok(parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout)))
}

/// One GPU per CSV line: `name, memory.total, driver_version`.
fn parse_nvidia_smi(stdout: &str) -> Vec<GpuInfo> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let parts: Vec<&str> = line.split(", ").collect();
            GpuInfo {
                name: parts.first().map(|s| s.trim().to_string()).unwrap_or_default(),
                memory_mb: parts.get(1).and_then(|m| m.trim().parse().ok()),
                driver_version: parts.get(2).map(|d| d.trim().to_string()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi() {
        let gpus = parse_nvidia_smi(
            "NVIDIA GeForce RTX 4090, 24564, 550.54.14\nNVIDIA A100, N/A, 550.54.14\n\n",
        );
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpus[0].memory_mb, Some(24564));
        assert_eq!(gpus[1].memory_mb, None);
        assert_eq!(gpus[1].driver_version.as_deref(), Some("550.54.14"));
    }

    #[test]
    fn test_report_written_to_log_dir() {
        let dir = std::env::temp_dir()
            .join(format!("swarm-sysinfo-{}", uuid::Uuid::new_v4().simple()));
        let info = SystemInfo {
            peer_version: "0.3.0",
            hostname: Some("node-7".into()),
            os: "linux",
            arch: "x86_64",
            cpus: 16,
            gpus: vec![],
        };
        let path = info.write_to(&dir).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("hostname: node-7"));
        assert!(text.contains("gpus: none"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
