use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Disks, ProcessesToUpdate, System};
use tracing::debug;

/// Below this many free bytes a disk counts as full for diagnosis purposes.
const LOW_DISK_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileStat>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<ProcessInfo>,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.permissions.is_none() && self.disk.is_none() && self.file.is_none() && self.processes.is_empty()
    }

    /// True when the evidence points at the environment rather than the payload.
    pub fn indicates_resource_problem(&self) -> bool {
        let denied = self
            .permissions
            .as_ref()
            .is_some_and(|p| !p.writable);
        let full = self.disk.as_ref().is_some_and(DiskInfo::is_low);
        denied || full
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionInfo {
    /// Nearest existing path at or above the checked target.
    pub path: String,
    pub target_exists: bool,
    pub readable: bool,
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    pub mount_point: String,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

impl DiskInfo {
    pub fn is_low(&self) -> bool {
        self.available_bytes < LOW_DISK_BYTES || self.available_bytes.saturating_mul(100) < self.total_bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub path: String,
    pub is_file: bool,
    pub is_dir: bool,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exe: Option<String>,
}

/// Gathers environment evidence after a failed verification.
#[derive(Debug, Clone)]
pub struct DiagnosticsCollector {
    max_processes: usize,
}

impl Default for DiagnosticsCollector {
    fn default() -> Self {
        Self { max_processes: 10 }
    }
}

impl DiagnosticsCollector {
    pub fn new(max_processes: usize) -> Self {
        Self { max_processes }
    }

    pub async fn for_path(&self, target: &Path) -> Diagnostics {
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || path_diagnostics(&target))
            .await
            .unwrap_or_else(|err| {
                debug!(error = %err, "path diagnostics task failed");
                Diagnostics::default()
            })
    }

    /// Permissions and disk of the process working directory.
    pub async fn for_working_dir(&self) -> Diagnostics {
        match std::env::current_dir() {
            Ok(dir) => self.for_path(&dir).await,
            Err(err) => {
                debug!(error = %err, "working directory is unavailable");
                Diagnostics::default()
            }
        }
    }

    /// Working-directory facts plus running processes whose name or executable mentions `name`.
    pub async fn for_process(&self, name: &str) -> Diagnostics {
        let mut diagnostics = self.for_working_dir().await;
        let name = name.to_string();
        let limit = self.max_processes;
        diagnostics.processes = tokio::task::spawn_blocking(move || find_processes(&name, limit))
            .await
            .unwrap_or_default();
        diagnostics
    }
}

pub fn find_processes(name: &str, limit: usize) -> Vec<ProcessInfo> {
    let needle = process_needle(name);
    if needle.is_empty() {
        return Vec::new();
    }
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let mut found: Vec<ProcessInfo> = system
        .processes()
        .iter()
        .filter_map(|(pid, process)| {
            let pname = process.name().to_string_lossy().to_string();
            let exe = process.exe().map(|p| p.to_string_lossy().to_string());
            let hit = pname.to_ascii_lowercase().contains(&needle)
                || exe
                    .as_deref()
                    .and_then(|e| Path::new(e).file_name())
                    .is_some_and(|f| f.to_string_lossy().to_ascii_lowercase().contains(&needle));
            hit.then(|| ProcessInfo {
                pid: pid.as_u32(),
                name: pname,
                exe,
            })
        })
        .collect();
    found.sort_by_key(|p| p.pid);
    found.truncate(limit);
    found
}

fn process_needle(name: &str) -> String {
    let base = Path::new(name.trim())
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    base.to_ascii_lowercase()
}

fn path_diagnostics(target: &Path) -> Diagnostics {
    let existing = nearest_existing(target);
    Diagnostics {
        permissions: existing.as_deref().map(|p| permission_info(p, target)),
        disk: existing.as_deref().and_then(disk_info),
        file: file_stat(target),
        processes: Vec::new(),
    }
}

fn nearest_existing(target: &Path) -> Option<PathBuf> {
    let mut current = Some(target);
    while let Some(p) = current {
        if p.exists() {
            return Some(p.to_path_buf());
        }
        current = p.parent().filter(|parent| !parent.as_os_str().is_empty());
    }
    // Relative targets hang off the working directory.
    if target.is_relative() {
        return std::env::current_dir().ok().filter(|dir| dir.exists());
    }
    None
}

fn permission_info(existing: &Path, target: &Path) -> PermissionInfo {
    let meta = std::fs::metadata(existing).ok();
    let is_dir = meta.as_ref().is_some_and(|m| m.is_dir());
    let readable = if is_dir {
        std::fs::read_dir(existing).is_ok()
    } else {
        std::fs::File::open(existing).is_ok()
    };
    // Writability is probed, not read from mode bits.
    let writable = if is_dir {
        tempfile::tempfile_in(existing).is_ok()
    } else {
        OpenOptions::new().append(true).open(existing).is_ok()
    };
    PermissionInfo {
        path: existing.display().to_string(),
        target_exists: existing == target,
        readable,
        writable,
        mode: meta.as_ref().and_then(mode_string),
    }
}

#[cfg(unix)]
fn mode_string(meta: &std::fs::Metadata) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;
    Some(format!("{:o}", meta.permissions().mode() & 0o7777))
}

#[cfg(not(unix))]
fn mode_string(meta: &std::fs::Metadata) -> Option<String> {
    Some(if meta.permissions().readonly() { "readonly" } else { "rw" }.to_string())
}

fn disk_info(path: &Path) -> Option<DiskInfo> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| DiskInfo {
            mount_point: d.mount_point().display().to_string(),
            available_bytes: d.available_space(),
            total_bytes: d.total_space(),
        })
}

fn file_stat(path: &Path) -> Option<FileStat> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileStat {
        path: path.display().to_string(),
        is_file: meta.is_file(),
        is_dir: meta.is_dir(),
        size: meta.len(),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
    })
}
