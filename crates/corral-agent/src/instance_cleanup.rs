use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, TimeZone};

use crate::config::Layout;
use crate::groups::{InstanceRecord, group_from_name};
use crate::template_sync;
use crate::workload::{WorkloadKind, valid_instance_name};

const ARCHIVE_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Handles a stopped instance: archives `logs/latest.log` when enabled, then
/// deletes the scratch directory. Static instances keep their directory.
///
/// Returns the archived log path, if any.
pub fn on_workload_stopped<Tz>(
    layout: &Layout,
    save_logs: bool,
    kind: WorkloadKind,
    name: &str,
    record: Option<&InstanceRecord>,
    now: DateTime<Tz>,
) -> Option<PathBuf>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    if !valid_instance_name(name) {
        tracing::warn!(%name, "ignoring stop for invalid instance name");
        return None;
    }
    let group = record
        .map(|r| r.group.as_str())
        .unwrap_or_else(|| group_from_name(name));
    let is_static = record.is_some_and(|r| r.is_static);
    let instance_dir = if is_static {
        layout.group_template_dir(kind, group, true)
    } else {
        layout.temporary_dir(kind).join(name)
    };

    let mut archived = None;
    if save_logs {
        let stamp = now.format(ARCHIVE_TIME_FORMAT).to_string();
        match archive_latest_log(&instance_dir, &layout.logs_dir().join(group), &stamp, name) {
            Ok(Some(path)) => {
                tracing::info!(%name, path = %path.display(), "archived instance log");
                archived = Some(path);
            }
            Ok(None) => tracing::error!(%name, "no log from instance exists"),
            Err(e) => tracing::error!(%name, error = %e, "failed to archive instance log"),
        }
    }

    if is_static {
        tracing::debug!(%name, dir = %instance_dir.display(), "keeping static instance directory");
    } else {
        template_sync::remove_dir(&instance_dir);
    }
    archived
}

fn archive_latest_log(
    instance_dir: &Path,
    archive_dir: &Path,
    stamp: &str,
    name: &str,
) -> anyhow::Result<Option<PathBuf>> {
    let log = instance_dir.join("logs").join("latest.log");
    if !log.is_file() {
        return Ok(None);
    }
    fs::create_dir_all(archive_dir)
        .with_context(|| format!("create {}", archive_dir.display()))?;
    let dst = archive_dir.join(format!("{stamp}_{name}.log"));
    fs::copy(&log, &dst).with_context(|| format!("copy {} -> {}", log.display(), dst.display()))?;
    Ok(Some(dst))
}
