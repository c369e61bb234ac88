//! Discovery and mounting of external (USB) partitions.
//!
//! Partitions are values owned by a [`PartitionSet`]; ROMs refer to them
//! by UUID so the set can be rebuilt by the refresh worker without
//! dangling anything.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;
use rustix::mount::MountFlags;

use crate::mount;
use crate::paths::Paths;
use crate::task::Task;

const EXFAT_OPTS: &str = "big_writes,max_read=131072,max_write=131072,nonempty";

#[derive(Clone, Debug)]
pub(crate) struct Partition {
    /// Kernel block device name, e.g. `sda1`.
    pub(crate) name: String,
    pub(crate) uuid: String,
    pub(crate) fs: String,
    pub(crate) mount_path: Utf8PathBuf,
    /// The selected USB ROM's partition must survive trampoline teardown
    /// so the running system can still see it.
    pub(crate) keep_mounted: bool,
}

#[derive(Debug, Default)]
pub(crate) struct PartitionSet {
    parts: Vec<Partition>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct BlkidRecord {
    pub(crate) name: String,
    pub(crate) uuid: String,
    pub(crate) fs: String,
}

/// Parse the output of `busybox blkid`: one
/// `/dev/<name>: UUID="…" TYPE="…"` line per filesystem.  Internal NAND
/// (`mmcblk*`) is handled through the fstab, not here.
pub(crate) fn parse_blkid(output: &str) -> Vec<BlkidRecord> {
    let uuid_re = Regex::new(r#"UUID="([^"]+)""#).unwrap();
    let type_re = Regex::new(r#"TYPE="([^"]+)""#).unwrap();
    let mut records = Vec::new();
    for line in output.lines() {
        let Some((dev, rest)) = line.split_once(':') else {
            continue;
        };
        if !dev.starts_with("/dev/") {
            tracing::warn!("blkid line does not start with /dev/: {line}");
            continue;
        }
        let name = dev.rsplit('/').next().unwrap_or(dev).to_string();
        if name.contains("mmcblk") {
            continue;
        }
        let Some(uuid) = uuid_re.captures(rest).map(|c| c[1].to_string()) else {
            tracing::warn!("Partition {name} has no UUID, skipping: {line}");
            continue;
        };
        let Some(fs) = type_re.captures(rest).map(|c| c[1].to_string()) else {
            tracing::warn!("Partition {name} has no TYPE, skipping: {line}");
            continue;
        };
        records.push(BlkidRecord { name, uuid, fs });
    }
    records
}

#[context("Mounting partition {name}")]
fn mount_partition(paths: &Paths, name: &str, fs: &str) -> Result<Utf8PathBuf> {
    let _ = std::fs::create_dir("/mnt");
    let target = Utf8PathBuf::from(format!("/mnt/{name}"));
    match std::fs::create_dir(&target) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e).context("Creating mount directory"),
    }
    let source = format!("/dev/block/{name}");
    match fs {
        "ntfs" => Task::new_and_run(
            format!("Mounting {source} (ntfs-3g)"),
            paths.helper("ntfs-3g"),
            [source.as_str(), target.as_str()],
        )?,
        "exfat" => Task::new_and_run(
            format!("Mounting {source} (exfat)"),
            paths.helper("exfat-fuse"),
            ["-o", EXFAT_OPTS, source.as_str(), target.as_str()],
        )?,
        _ => {
            // blkid occasionally misidentifies freshly formatted cards;
            // give the other native filesystems a shot before giving up.
            let mut res = mount::mount(&source, &target, fs, MountFlags::NOATIME, "");
            if res.is_err() {
                for alt in ["ext4", "f2fs", "ext2"] {
                    if alt == fs {
                        continue;
                    }
                    if mount::mount(&source, &target, alt, MountFlags::NOATIME, "").is_ok() {
                        tracing::info!("Mounted {source} as {alt} instead of {fs}");
                        res = Ok(());
                        break;
                    }
                }
            }
            res?
        }
    }
    Ok(target)
}

impl PartitionSet {
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.parts.iter()
    }

    pub(crate) fn by_uuid(&self, uuid: &str) -> Option<&Partition> {
        self.parts.iter().find(|p| p.uuid == uuid)
    }

    pub(crate) fn mark_keep_mounted(&mut self, uuid: &str) {
        if let Some(p) = self.parts.iter_mut().find(|p| p.uuid == uuid) {
            p.keep_mounted = true;
        }
    }

    /// Rebuild the set from a fresh blkid scan.  Partitions marked
    /// `keep_mounted` and partitions that are still present keep their
    /// existing mounts; everything else is unmounted and re-discovered.
    #[context("Refreshing partitions")]
    pub(crate) fn refresh(&mut self, paths: &Paths) -> Result<()> {
        let output = Task::new("Scanning partitions", paths.busybox())
            .args(["blkid"])
            .quiet()
            .read()?;
        let records = parse_blkid(&output);

        // Unmount what disappeared, unless it must stay.
        let mut kept = Vec::new();
        for part in self.parts.drain(..) {
            let still_there = records.iter().any(|r| r.uuid == part.uuid);
            if still_there || part.keep_mounted {
                kept.push(part);
            } else if let Err(e) = mount::unmount(&part.mount_path) {
                tracing::warn!("Failed to unmount stale partition {}: {e:#}", part.name);
            }
        }
        self.parts = kept;

        for rec in records {
            if self.by_uuid(&rec.uuid).is_some() {
                continue;
            }
            match mount_partition(paths, &rec.name, &rec.fs) {
                Ok(mount_path) => {
                    tracing::info!("Found partition {}: {} ({})", rec.name, rec.uuid, rec.fs);
                    self.parts.push(Partition {
                        name: rec.name,
                        uuid: rec.uuid,
                        fs: rec.fs,
                        mount_path,
                        keep_mounted: false,
                    });
                }
                Err(e) => {
                    tracing::warn!("Failed to mount partition {}: {e:#}", rec.name);
                }
            }
        }
        Ok(())
    }

    /// Teardown: unmount everything except keep_mounted partitions.
    pub(crate) fn unmount_all(&mut self) {
        self.parts.retain(|p| {
            if p.keep_mounted {
                return true;
            }
            if let Err(e) = mount::unmount(&p.mount_path) {
                tracing::warn!("Failed to unmount {}: {e:#}", p.mount_path);
            }
            false
        });
    }

    #[cfg(test)]
    pub(crate) fn from_parts(parts: Vec<Partition>) -> Self {
        Self { parts }
    }
}

/// Current ctime of `/dev/block`, used by the refresh worker to notice
/// hotplug events.
pub(crate) fn block_dir_ctime(dir: &Utf8Path) -> Option<i64> {
    use std::os::unix::fs::MetadataExt;
    dir.metadata().ok().map(|m| m.ctime())
}
