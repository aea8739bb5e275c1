//! Accelerator discovery.
//!
//! Probes vendor tools rather than linking vendor libraries: `nvidia-smi`
//! for CUDA, `rocm-smi` for ROCm, `sysctl` for Apple Silicon. Anything that
//! fails to run or parse is treated as "no accelerator".

use std::env;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorKind {
    #[default]
    None,
    Cuda,
    Rocm,
    Metal,
    OpenCl,
}

impl std::fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AcceleratorKind::None => "none",
            AcceleratorKind::Cuda => "cuda",
            AcceleratorKind::Rocm => "rocm",
            AcceleratorKind::Metal => "metal",
            AcceleratorKind::OpenCl => "opencl",
        };
        f.write_str(name)
    }
}

/// Information about a single GPU device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDeviceInfo {
    /// Device index.
    pub id: usize,

    /// Device name (e.g., "NVIDIA GeForce GTX 1070").
    pub name: String,

    /// Total VRAM in bytes.
    pub total_vram: u64,

    /// Free VRAM in bytes (at detection time).
    pub free_vram: u64,

    /// Utilization percentage, when the tool reports it.
    pub utilization: Option<u32>,

    /// False when hidden by a visible-devices mask.
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    pub kind: AcceleratorKind,
    pub devices: Vec<GpuDeviceInfo>,
    pub driver_version: Option<String>,
}

impl AcceleratorInfo {
    pub fn none() -> Self {
        Self {
            kind: AcceleratorKind::None,
            devices: Vec::new(),
            driver_version: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.kind != AcceleratorKind::None && self.devices.iter().any(|d| d.available)
    }

    /// Total VRAM across usable devices.
    pub fn total_memory(&self) -> u64 {
        self.devices
            .iter()
            .filter(|d| d.available)
            .map(|d| d.total_vram)
            .sum()
    }
}

/// Source of accelerator information.
pub trait AcceleratorProbe: Send + Sync {
    fn probe(&self) -> AcceleratorInfo;
}

/// Probes the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl AcceleratorProbe for SystemProbe {
    fn probe(&self) -> AcceleratorInfo {
        detect_accelerators()
    }
}

/// Always reports the same devices.
#[derive(Debug, Clone)]
pub struct FixedProbe(pub AcceleratorInfo);

impl AcceleratorProbe for FixedProbe {
    fn probe(&self) -> AcceleratorInfo {
        self.0.clone()
    }
}

const MIB: u64 = 1024 * 1024;

/// Probe CUDA, then ROCm, then Metal.
pub fn detect_accelerators() -> AcceleratorInfo {
    let detected = detect_cuda()
        .or_else(detect_rocm)
        .or_else(detect_metal)
        .unwrap_or_else(AcceleratorInfo::none);

    if detected.is_available() {
        info!(
            kind = %detected.kind,
            devices = detected.devices.len(),
            total_vram = detected.total_memory(),
            "Accelerator detected"
        );
    } else {
        info!("No accelerator detected, running in CPU-only mode");
    }
    detected
}

fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output() {
        Ok(out) if out.status.success() => String::from_utf8(out.stdout).ok(),
        Ok(out) => {
            debug!(program, status = %out.status, "Probe tool failed");
            None
        }
        Err(e) => {
            debug!(program, error = %e, "Probe tool not available");
            None
        }
    }
}

fn detect_cuda() -> Option<AcceleratorInfo> {
    if env::var_os("CUDA_PATH").is_none() && env::var_os("CUDA_HOME").is_none() {
        return None;
    }

    let output = run_tool(
        "nvidia-smi",
        &[
            "--query-gpu=index,name,memory.total,memory.free,utilization.gpu,driver_version",
            "--format=csv,noheader,nounits",
        ],
    )?;
    let visible = env::var("CUDA_VISIBLE_DEVICES").ok();
    let (devices, driver_version) = parse_nvidia_smi(&output, visible.as_deref());
    if devices.is_empty() {
        return None;
    }

    Some(AcceleratorInfo {
        kind: AcceleratorKind::Cuda,
        devices,
        driver_version,
    })
}

/// Parse `index, name, total MiB, free MiB, util %, driver` rows.
pub fn parse_nvidia_smi(
    output: &str,
    visible: Option<&str>,
) -> (Vec<GpuDeviceInfo>, Option<String>) {
    let mut devices = Vec::new();
    let mut driver = None;

    for line in output.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 6 {
            continue;
        }
        let Ok(id) = fields[0].parse::<usize>() else {
            continue;
        };
        let total_mib = fields[2].parse::<u64>().unwrap_or(0);
        let free_mib = fields[3].parse::<u64>().unwrap_or(0);

        devices.push(GpuDeviceInfo {
            id,
            name: fields[1].to_string(),
            total_vram: total_mib * MIB,
            free_vram: free_mib * MIB,
            utilization: fields[4].parse().ok(),
            available: is_visible(id, visible),
        });
        driver.get_or_insert_with(|| fields[5].to_string());
    }

    (devices, driver)
}

fn detect_rocm() -> Option<AcceleratorInfo> {
    let output = run_tool("rocm-smi", &["--showmeminfo", "vram", "--csv"])?;
    let visible = env::var("ROCR_VISIBLE_DEVICES").ok();
    let devices = parse_rocm_smi(&output, visible.as_deref());
    if devices.is_empty() {
        return None;
    }

    Some(AcceleratorInfo {
        kind: AcceleratorKind::Rocm,
        devices,
        driver_version: None,
    })
}

/// Parse `device,VRAM Total Memory (B),VRAM Total Used Memory (B)` rows.
pub fn parse_rocm_smi(output: &str, visible: Option<&str>) -> Vec<GpuDeviceInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let id = fields.first()?.strip_prefix("card")?.parse::<usize>().ok()?;
            let total = fields.get(1)?.parse::<u64>().ok()?;
            let used = fields.get(2).and_then(|f| f.parse::<u64>().ok()).unwrap_or(0);
            Some(GpuDeviceInfo {
                id,
                name: "AMD GPU".to_string(),
                total_vram: total,
                free_vram: total.saturating_sub(used),
                utilization: None,
                available: is_visible(id, visible),
            })
        })
        .collect()
}

fn detect_metal() -> Option<AcceleratorInfo> {
    if !cfg!(target_os = "macos") {
        return None;
    }
    let arm = run_tool("sysctl", &["-n", "hw.optional.arm64"])?;
    if arm.trim() != "1" {
        return None;
    }

    // Unified memory: report the host's physical memory.
    let memsize = run_tool("sysctl", &["-n", "hw.memsize"])
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);

    Some(AcceleratorInfo {
        kind: AcceleratorKind::Metal,
        devices: vec![GpuDeviceInfo {
            id: 0,
            name: "Apple Silicon GPU".to_string(),
            total_vram: memsize,
            free_vram: memsize,
            utilization: None,
            available: true,
        }],
        driver_version: None,
    })
}

/// `mask` is a comma-separated id list; unset or empty means all visible.
fn is_visible(id: usize, mask: Option<&str>) -> bool {
    match mask.map(str::trim) {
        None | Some("") => true,
        Some(mask) => mask
            .split(',')
            .filter_map(|s| s.trim().parse::<usize>().ok())
            .any(|v| v == id),
    }
}

/// `count` identical CUDA cards, for tests.
pub fn stub_devices(count: usize, vram: u64) -> AcceleratorInfo {
    AcceleratorInfo {
        kind: AcceleratorKind::Cuda,
        devices: (0..count)
            .map(|id| GpuDeviceInfo {
                id,
                name: "NVIDIA GeForce GTX 1070".to_string(),
                total_vram: vram,
                free_vram: vram,
                utilization: None,
                available: true,
            })
            .collect(),
        driver_version: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NVIDIA: &str = "\
0, NVIDIA GeForce GTX 1070, 8192, 7800, 3, 535.104.05
1, NVIDIA GeForce GTX 1070, 8192, 8000, 0, 535.104.05
";

    #[test]
    fn test_parse_nvidia_smi() {
        let (devices, driver) = parse_nvidia_smi(NVIDIA, None);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].total_vram, 8192 * MIB);
        assert_eq!(devices[0].free_vram, 7800 * MIB);
        assert_eq!(devices[0].utilization, Some(3));
        assert_eq!(driver.as_deref(), Some("535.104.05"));
        assert!(devices.iter().all(|d| d.available));
    }

    #[test]
    fn test_visible_devices_mask() {
        let (devices, _) = parse_nvidia_smi(NVIDIA, Some("1"));
        assert!(!devices[0].available);
        assert!(devices[1].available);

        let info = AcceleratorInfo {
            kind: AcceleratorKind::Cuda,
            devices,
            driver_version: None,
        };
        assert_eq!(info.total_memory(), 8192 * MIB);
    }

    #[test]
    fn test_parse_rocm_smi() {
        let output = "\
device,VRAM Total Memory (B),VRAM Total Used Memory (B)
card0,17163091968,10633216
";
        let devices = parse_rocm_smi(output, None);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].total_vram, 17_163_091_968);
        assert_eq!(devices[0].free_vram, 17_163_091_968 - 10_633_216);
    }

    #[test]
    fn test_none_is_unavailable() {
        let info = AcceleratorInfo::none();
        assert!(!info.is_available());
        assert_eq!(info.total_memory(), 0);
    }

    #[test]
    fn test_stub_devices() {
        let info = stub_devices(2, 8 * 1024 * MIB);
        assert!(info.is_available());
        assert_eq!(info.total_memory(), 16 * 1024 * MIB);
    }
}
