//! Cleanup & backup watchdog: a periodic task that keeps the projects
//! directory and session metadata table from growing without bound, and
//! watches disk usage on the volume that backs it.
//!
//! Unlike every other file in this crate, the watchdog does no SQL of its
//! own for the filesystem half of its job - it shells out to
//! `SessionManager::cleanup` for session pruning and to `sysinfo` for disk
//! usage.

use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, SystemTime};

use chrono::Duration;
use oubliette_core::{CleanupConfig, SessionManager};
use sysinfo::Disks;
use tracing::{error, info, warn};

/// Outcome of a single watchdog pass, mostly useful for tests and for the
/// daemon loop's own tracing span.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    pub tmp_files_removed: u32,
    pub sessions_removed: u32,
    pub disk_used_percent: Option<f64>,
}

pub struct CleanupWatchdog {
    config: CleanupConfig,
}

impl CleanupWatchdog {
    pub fn new(config: CleanupConfig) -> Self {
        Self { config }
    }

    /// Runs one pass: orphan `*.tmp` removal, terminal session pruning, and
    /// a disk-usage sample. Never fails outright - each sub-step logs and
    /// degrades independently, since a missing `projects_dir` shouldn't
    /// stop session pruning or vice versa.
    pub async fn run_once(&self, manager: &SessionManager) -> CleanupReport {
        let tmp_files_removed = self.remove_orphan_tmp_files().await;
        let sessions_removed = match manager
            .cleanup(None, Duration::days(self.config.session_retention_days))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "session metadata cleanup failed");
                0
            }
        };
        let disk_used_percent = self.sample_disk_usage();

        CleanupReport {
            tmp_files_removed,
            sessions_removed,
            disk_used_percent,
        }
    }

    async fn remove_orphan_tmp_files(&self) -> u32 {
        let root = PathBuf::from(&self.config.projects_dir);
        let retention = StdDuration::from_secs(self.config.tmp_retention_secs);
        let result =
            tokio::task::spawn_blocking(move || remove_orphan_tmp_files_blocking(&root, retention))
                .await;
        match result {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                warn!(error = %e, "tmp file scan failed");
                0
            }
            Err(e) => {
                error!(error = %e, "tmp file scan task panicked");
                0
            }
        }
    }

    fn sample_disk_usage(&self) -> Option<f64> {
        let root = Path::new(&self.config.projects_dir);
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .iter()
            .filter(|d| root.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;

        let total = disk.total_space();
        if total == 0 {
            return None;
        }
        let used = total.saturating_sub(disk.available_space());
        let percent = used as f64 / total as f64 * 100.0;

        if percent >= self.config.disk_error_percent {
            error!(percent, mount = %disk.mount_point().display(), "disk usage critical");
        } else if percent >= self.config.disk_warn_percent {
            warn!(percent, mount = %disk.mount_point().display(), "disk usage high");
        }
        Some(percent)
    }

    /// Runs `run_once` on `interval_secs` until `shutdown` fires, the way
    /// `oubliette-cli`'s daemon loop drives the scheduler's own tick.
    pub async fn run_forever(
        self,
        manager: std::sync::Arc<SessionManager>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(self.config.interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once(&manager).await;
                    info!(
                        tmp_files_removed = report.tmp_files_removed,
                        sessions_removed = report.sessions_removed,
                        disk_used_percent = report.disk_used_percent,
                        "cleanup pass complete"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cleanup watchdog shutting down");
                        return;
                    }
                }
            }
        }
    }
}

fn remove_orphan_tmp_files_blocking(root: &Path, retention: StdDuration) -> std::io::Result<u32> {
    if !root.exists() {
        return Ok(0);
    }
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;
    walk(root, &mut |path, metadata| {
        if path.extension().map(|ext| ext == "tmp").unwrap_or(false) {
            if let Ok(modified) = metadata.modified() {
                if modified < cutoff {
                    if std::fs::remove_file(path).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
    })?;
    Ok(removed)
}

fn walk(dir: &Path, visit: &mut impl FnMut(&Path, std::fs::Metadata)) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            walk(&entry.path(), visit)?;
        } else {
            visit(&entry.path(), metadata);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(projects_dir: &Path) -> CleanupConfig {
        CleanupConfig {
            projects_dir: projects_dir.display().to_string(),
            interval_secs: 300,
            tmp_retention_secs: 0,
            session_retention_days: 30,
            disk_warn_percent: 80.0,
            disk_error_percent: 95.0,
        }
    }

    #[tokio::test]
    async fn removes_tmp_files_older_than_retention() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("a.tmp");
        fs::write(&stale, b"x").unwrap();
        let keep = dir.path().join("keep.txt");
        fs::write(&keep, b"y").unwrap();

        // A zero-second retention window means "older than right now",
        // which any file written before this call already satisfies.
        let watchdog = CleanupWatchdog::new(config(dir.path()));
        let removed = watchdog.remove_orphan_tmp_files().await;
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(keep.exists());
    }

    #[tokio::test]
    async fn recent_tmp_files_survive_a_nonzero_retention_window() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("fresh.tmp");
        fs::write(&fresh, b"x").unwrap();

        let mut cfg = config(dir.path());
        cfg.tmp_retention_secs = 3600;
        let watchdog = CleanupWatchdog::new(cfg);
        assert_eq!(watchdog.remove_orphan_tmp_files().await, 0);
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn missing_projects_dir_is_not_an_error() {
        let watchdog = CleanupWatchdog::new(config(Path::new("/nonexistent/oubliette-test")));
        assert_eq!(watchdog.remove_orphan_tmp_files().await, 0);
    }
}
