use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::{info, warn};

use crate::error::{BatchError, Result};

use super::probe::MB;

/// Usage above this share of the disk is logged as a warning.
pub const DISK_WARNING_PERCENT: f64 = 90.0;

/// Free/total figures of the disk holding a path.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskSpace {
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskSpace {
    pub fn available_mb(&self) -> f64 {
        self.available_bytes as f64 / MB
    }

    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Space a batch of `n_tasks` is expected to need: `base + per_task * n`.
pub fn estimate_required_mb(n_tasks: usize, base_mb: f64, per_task_mb: f64) -> f64 {
    base_mb + per_task_mb * n_tasks as f64
}

/// Pick the disk whose mount point is the longest prefix of `path`.
pub fn select_disk(path: &Path, disks: &[DiskSpace]) -> Option<DiskSpace> {
    disks
        .iter()
        .filter(|d| path.starts_with(&d.mount_point))
        .max_by_key(|d| d.mount_point.components().count())
        .cloned()
}

/// Look up the disk holding `path` (or its nearest existing ancestor).
pub fn disk_space_for(path: &Path) -> Option<DiskSpace> {
    let resolved = nearest_existing(path)?;
    let disks: Vec<DiskSpace> = Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|d| DiskSpace {
            mount_point: d.mount_point().to_path_buf(),
            total_bytes: d.total_space(),
            available_bytes: d.available_space(),
        })
        .collect();
    select_disk(&resolved, &disks)
}

fn nearest_existing(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    absolute
        .ancestors()
        .find(|p| p.exists())
        .and_then(|p| p.canonicalize().ok())
}

/// Compare a disk's free space against the requirement.
pub fn ensure_space(disk: &DiskSpace, required_mb: f64) -> Result<()> {
    let available_mb = disk.available_mb();
    if available_mb < required_mb {
        return Err(BatchError::InsufficientDisk {
            mount: disk.mount_point.display().to_string(),
            required_mb,
            available_mb,
        });
    }
    if disk.used_percent() > DISK_WARNING_PERCENT {
        warn!(
            mount = %disk.mount_point.display(),
            used_percent = disk.used_percent(),
            "Disk is nearly full"
        );
    }
    info!(
        "Disk space check passed: {:.1} MB required, {:.1} MB available",
        required_mb, available_mb
    );
    Ok(())
}

/// Pre-flight check for the output directory of a batch.
///
/// When no disk can be matched to the path the check is skipped with a
/// warning rather than blocking the run.
pub fn check_space_available(path: &Path, required_mb: f64) -> Result<()> {
    match disk_space_for(path) {
        Some(disk) => ensure_space(&disk, required_mb),
        None => {
            warn!(path = %path.display(), "Could not determine free disk space; skipping check");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(mount: &str, total_mb: u64, avail_mb: u64) -> DiskSpace {
        DiskSpace {
            mount_point: PathBuf::from(mount),
            total_bytes: total_mb * 1024 * 1024,
            available_bytes: avail_mb * 1024 * 1024,
        }
    }

    #[test]
    fn estimate_scales_with_tasks() {
        assert_eq!(estimate_required_mb(0, 120.0, 20.0), 120.0);
        assert_eq!(estimate_required_mb(10, 120.0, 20.0), 320.0);
    }

    #[test]
    fn longest_mount_prefix_wins() {
        let disks = vec![disk("/", 1000, 500), disk("/data", 1000, 10), disk("/data/scratch", 1000, 900)];
        let picked = select_disk(Path::new("/data/scratch/run1"), &disks).unwrap();
        assert_eq!(picked.mount_point, PathBuf::from("/data/scratch"));
        let picked = select_disk(Path::new("/data/other"), &disks).unwrap();
        assert_eq!(picked.mount_point, PathBuf::from("/data"));
        let picked = select_disk(Path::new("/home/me"), &disks).unwrap();
        assert_eq!(picked.mount_point, PathBuf::from("/"));
    }

    #[test]
    fn insufficient_space_is_an_error() {
        let d = disk("/", 1000, 100);
        match ensure_space(&d, 320.0) {
            Err(BatchError::InsufficientDisk { required_mb, available_mb, .. }) => {
                assert_eq!(required_mb, 320.0);
                assert!((available_mb - 100.0).abs() < 1e-9);
            }
            other => panic!("expected InsufficientDisk, got {:?}", other),
        }
        assert!(ensure_space(&d, 50.0).is_ok());
    }

    #[test]
    fn used_percent_of_disk() {
        assert!((disk("/", 1000, 50).used_percent() - 95.0).abs() < 1e-9);
    }

    #[test]
    fn live_lookup_of_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        // Containers may expose no disks; either outcome is acceptable here.
        if let Some(space) = disk_space_for(&dir.path().join("not/created/yet")) {
            assert!(space.total_bytes >= space.available_bytes);
        }
    }
}
