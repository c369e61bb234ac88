//! The ROM model: one record per installed system, rebuilt by directory
//! scan at every boot.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::partitions::Partition;
use crate::paths::{Paths, INTERNAL_ROM_NAME};

/// Longer names do not fit the selection list.
pub(crate) const MAX_ROM_NAME_LEN: usize = 26;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RomKind {
    DefaultInternal,
    AndroidInternal,
    AndroidUsbDir,
    AndroidUsbImg,
    LinuxInternal,
    LinuxUsb,
    UnsupportedInt,
    UnsupportedUsb,
    Unknown,
}

impl RomKind {
    pub(crate) fn is_android(self) -> bool {
        matches!(
            self,
            RomKind::AndroidInternal | RomKind::AndroidUsbDir | RomKind::AndroidUsbImg
        )
    }

    pub(crate) fn is_linux(self) -> bool {
        matches!(self, RomKind::LinuxInternal | RomKind::LinuxUsb)
    }

    /// Linux ROMs can only be entered through kexec.
    pub(crate) fn wants_kexec(self) -> bool {
        self.is_linux()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Rom {
    /// Process-unique id, assigned monotonically at scan time.
    pub(crate) id: u32,
    pub(crate) name: String,
    pub(crate) base_path: Utf8PathBuf,
    /// UUID of the owning USB partition; `None` for internal ROMs.
    pub(crate) partition_uuid: Option<String>,
    pub(crate) kind: RomKind,
    pub(crate) has_bootimg: bool,
}

static NEXT_ROM_ID: AtomicU32 = AtomicU32::new(0);

fn next_rom_id() -> u32 {
    NEXT_ROM_ID.fetch_add(1, Ordering::SeqCst)
}

impl Rom {
    pub(crate) fn is_default(&self) -> bool {
        self.kind == RomKind::DefaultInternal
    }

    pub(crate) fn bootimg_path(&self) -> Utf8PathBuf {
        self.base_path.join("boot.img")
    }

    pub(crate) fn icon_path(&self) -> Utf8PathBuf {
        self.base_path.join("icon.png")
    }
}

/// Derive the kind of a ROM from its directory layout.
pub(crate) fn classify(base: &Utf8Path, name: &str, on_usb: bool) -> RomKind {
    if !on_usb && name == INTERNAL_ROM_NAME {
        return RomKind::DefaultInternal;
    }

    let has = |file: &str| base.join(file).exists();

    if has("boot") {
        if has("system") && has("data") && has("cache") {
            return if on_usb {
                RomKind::AndroidUsbDir
            } else {
                RomKind::AndroidInternal
            };
        }
        if has("system.img") && has("data.img") && has("cache.img") {
            return RomKind::AndroidUsbImg;
        }
    }

    if has("rom_info.txt") {
        return if on_usb {
            RomKind::LinuxUsb
        } else {
            RomKind::LinuxInternal
        };
    }

    // Pre-rom_info Linux layouts (Ubuntu Touch era); recognizable but not
    // bootable anymore.
    if has("root") || has("boot.img") {
        return if on_usb {
            RomKind::UnsupportedUsb
        } else {
            RomKind::UnsupportedInt
        };
    }

    RomKind::Unknown
}

fn rom_from_dir(dir: &Utf8Path, name: &str, partition_uuid: Option<&str>) -> Rom {
    let kind = classify(dir, name, partition_uuid.is_some());
    let has_bootimg = dir.join("boot.img").exists();
    Rom {
        id: next_rom_id(),
        name: name.to_string(),
        base_path: dir.to_owned(),
        partition_uuid: partition_uuid.map(ToOwned::to_owned),
        kind,
        has_bootimg,
    }
}

fn scan_dir(dir: &Utf8Path, partition_uuid: Option<&str>) -> Result<Vec<Rom>> {
    let mut roms = Vec::new();
    for entry in dir.read_dir_utf8().with_context(|| format!("Reading {dir}"))? {
        let entry = entry?;
        let name = entry.file_name();
        if name.starts_with('.') || !entry.file_type()?.is_dir() {
            continue;
        }
        if name.len() > MAX_ROM_NAME_LEN {
            tracing::warn!(
                "Skipping ROM {name}, name is too long (max {MAX_ROM_NAME_LEN} chars allowed)"
            );
            continue;
        }
        tracing::info!("Adding ROM {name}");
        roms.push(rom_from_dir(entry.path(), name, partition_uuid));
    }
    sort_roms(&mut roms);
    Ok(roms)
}

/// Default slot first, then case-insensitive name order.
pub(crate) fn sort_roms(roms: &mut [Rom]) {
    roms.sort_by(|a, b| {
        b.is_default()
            .cmp(&a.is_default())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

/// Scan the internal `roms/` directory, creating the default slot on
/// first run.
#[context("Scanning internal ROMs")]
pub(crate) fn scan_internal(paths: &Paths) -> Result<Vec<Rom>> {
    let internal = paths.internal_rom_dir();
    if !internal.is_dir() {
        tracing::info!("Creating default internal ROM directory {internal}");
        std::fs::create_dir_all(&internal).context("Creating Internal dir")?;
    }
    scan_dir(&paths.roms_dir(), None)
}

/// Scan a mounted USB partition's per-device directory, migrating the
/// old unqualified `multirom/` directory if one is found.
#[context("Scanning partition {p}", p = part.name)]
pub(crate) fn scan_partition(paths: &Paths, part: &Partition) -> Result<Vec<Rom>> {
    let dir = part.mount_path.join(paths.usb_dir_name());
    let legacy = part.mount_path.join("multirom");
    if legacy.is_dir() && !dir.exists() {
        tracing::info!("Moving usb dir {legacy} to {dir}");
        std::fs::rename(&legacy, &dir).context("Migrating legacy multirom dir")?;
    }
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    scan_dir(&dir, Some(&part.uuid))
}

/// Find a ROM by name, and when `part_uuid` is given, also by owning
/// partition.
pub(crate) fn find_rom<'a>(
    roms: &'a [Rom],
    name: &str,
    part_uuid: Option<&str>,
) -> Option<&'a Rom> {
    roms.iter().find(|r| {
        r.name == name
            && match part_uuid {
                Some(uuid) => r.partition_uuid.as_deref() == Some(uuid),
                None => true,
            }
    })
}

pub(crate) fn internal_rom(roms: &[Rom]) -> Option<&Rom> {
    roms.iter().find(|r| r.is_default())
}
