//! The process-wide path context.
//!
//! Everything that used to be a file-scope static (the MultiROM data
//! directory, helper binary paths, device switches) lives in a [`Paths`]
//! value constructed once at startup and threaded through the components.

use std::os::unix::fs::PermissionsExt;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

/// Where the trampoline mounts the primary `/data` partition.
pub(crate) const REALDATA: &str = "/realdata";

/// Zero-byte sentinel: when present, the trampoline must leave
/// `/realdata` mounted for the system being booted.
pub(crate) const KEEP_REALDATA: &str = "/dev/.keep_realdata";

/// Name of the default (internal) ROM slot.
pub(crate) const INTERNAL_ROM_NAME: &str = "Internal";

/// Candidate locations of the MultiROM data directory, newest layout
/// first.  The `/data/...` entries cover running inside an already-booted
/// Android (`--boot-rom`, `-apkL`).
const BASE_DIR_CANDIDATES: &[&str] = &[
    "/realdata/media/0/multirom",
    "/realdata/media/multirom",
    "/data/media/0/multirom",
    "/data/media/multirom",
];

const HELPER_BINS: &[&str] = &["busybox", "lz4", "kexec", "ntfs-3g", "exfat-fuse"];

/// Device-specific behavior switches.  These were compile-time `#ifdef`s
/// once; they are runtime state now so one binary can serve several
/// device trees and so every code path stays testable.
#[derive(Clone, Debug)]
pub(crate) struct DeviceConfig {
    /// Device codename, used in `fstab.<device>`, `init.<device>.rc` and
    /// the per-device USB directory name.
    pub(crate) target_device: String,
    /// Value for kexec's `--mem-min=`; must point into System RAM just
    /// above the running kernel.
    pub(crate) kexec_mem_min: String,
    /// Device-tree platform: pass `--dtb` to kexec and probe
    /// `/proc/device-tree` instead of `/proc/atags`.
    pub(crate) kexec_dtb: bool,
    /// Some bootloaders (flo's 03.15, notoriously) eat this many leading
    /// bytes of the boot image cmdline before passing it on.
    pub(crate) cmdline_strip: usize,
    /// Ship `mrom.fstab` into injected ramdisks instead of relying on the
    /// ROM's own fstab.
    pub(crate) use_mrom_fstab: bool,
    /// Force the ramdisk load address on inject, for kernels that ignore
    /// the bootloader-provided one.
    pub(crate) ramdisk_addr: Option<u32>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            target_device: "generic".to_string(),
            kexec_mem_min: "0x90000000".to_string(),
            kexec_dtb: false,
            cmdline_strip: 0,
            use_mrom_fstab: false,
            ramdisk_addr: None,
        }
    }
}

impl DeviceConfig {
    /// Detect the device from the bootloader command line, then apply the
    /// optional `device.cfg` overrides from the MultiROM data directory.
    pub(crate) fn detect() -> Self {
        let mut cfg = Self::default();
        if let Ok(cmdline) = std::fs::read_to_string("/proc/cmdline") {
            if let Some(hw) = find_cmdline_value(&cmdline, "androidboot.hardware") {
                cfg.target_device = hw.to_string();
            }
        }
        cfg
    }

    /// Apply `key=value` overrides from `<mrom>/device.cfg`, if present.
    pub(crate) fn apply_overrides(&mut self, mrom: &Utf8Path) {
        let path = mrom.join("device.cfg");
        let Ok(content) = std::fs::read_to_string(&path) else {
            return;
        };
        tracing::info!("Applying device overrides from {path}");
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "target_device" => self.target_device = val.trim().to_string(),
                "kexec_mem_min" => self.kexec_mem_min = val.trim().to_string(),
                "kexec_dtb" => self.kexec_dtb = val.trim() == "1",
                "cmdline_strip" => self.cmdline_strip = val.trim().parse().unwrap_or(0),
                "use_mrom_fstab" => self.use_mrom_fstab = val.trim() == "1",
                "ramdisk_addr" => {
                    let val = val.trim().trim_start_matches("0x");
                    self.ramdisk_addr = u32::from_str_radix(val, 16).ok();
                }
                other => tracing::warn!("Unknown device.cfg key {other}"),
            }
        }
    }
}

/// Return the value of `key=value` in a kernel command line.
pub(crate) fn find_cmdline_value<'a>(cmdline: &'a str, key: &str) -> Option<&'a str> {
    cmdline.split_ascii_whitespace().find_map(|arg| {
        let (k, v) = arg.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Paths to everything in the MultiROM data directory plus the device
/// configuration.
#[derive(Clone, Debug)]
pub(crate) struct Paths {
    pub(crate) mrom: Utf8PathBuf,
    pub(crate) device: DeviceConfig,
}

impl Paths {
    /// Locate the MultiROM data directory and make the bundled helper
    /// binaries executable.
    #[context("Locating MultiROM data directory")]
    pub(crate) fn discover(mut device: DeviceConfig) -> Result<Self> {
        let base = BASE_DIR_CANDIDATES
            .iter()
            .map(Utf8Path::new)
            .find(|p| p.is_dir())
            .ok_or_else(|| anyhow!("MultiROM data directory not found"))?;
        device.apply_overrides(base);
        let paths = Self {
            mrom: base.to_owned(),
            device,
        };
        for bin in HELPER_BINS {
            let p = paths.mrom.join(bin);
            if p.exists() {
                std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755))
                    .with_context(|| format!("Making {p} executable"))?;
            }
        }
        Ok(paths)
    }

    /// Build a context rooted at an explicit directory (`--mrom_dir`,
    /// tests).
    pub(crate) fn with_base(base: impl Into<Utf8PathBuf>, mut device: DeviceConfig) -> Self {
        let mrom = base.into();
        device.apply_overrides(&mrom);
        Self { mrom, device }
    }

    pub(crate) fn helper(&self, name: &str) -> Utf8PathBuf {
        self.mrom.join(name)
    }

    pub(crate) fn busybox(&self) -> Utf8PathBuf {
        self.helper("busybox")
    }

    pub(crate) fn lz4(&self) -> Utf8PathBuf {
        self.helper("lz4")
    }

    pub(crate) fn kexec(&self) -> Utf8PathBuf {
        self.helper("kexec")
    }

    pub(crate) fn trampoline_bin(&self) -> Utf8PathBuf {
        self.helper("trampoline")
    }

    pub(crate) fn roms_dir(&self) -> Utf8PathBuf {
        self.mrom.join("roms")
    }

    pub(crate) fn internal_rom_dir(&self) -> Utf8PathBuf {
        self.roms_dir().join(INTERNAL_ROM_NAME)
    }

    pub(crate) fn status_file(&self) -> Utf8PathBuf {
        self.mrom.join("multirom.ini")
    }

    pub(crate) fn error_log(&self) -> Utf8PathBuf {
        self.mrom.join("error.txt")
    }

    pub(crate) fn primary_boot_backup(&self) -> Utf8PathBuf {
        self.mrom.join("primary_boot.img")
    }

    /// Name of the per-device directory scanned on USB partitions.
    pub(crate) fn usb_dir_name(&self) -> String {
        format!("multirom-{}", self.device.target_device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_cmdline_value() {
        let cmdline = "console=ttyHSL0,115200,n8 androidboot.hardware=flo androidboot.mode=charger";
        assert_eq!(find_cmdline_value(cmdline, "androidboot.hardware"), Some("flo"));
        assert_eq!(find_cmdline_value(cmdline, "androidboot.mode"), Some("charger"));
        assert_eq!(find_cmdline_value(cmdline, "console"), Some("ttyHSL0,115200,n8"));
        assert_eq!(find_cmdline_value(cmdline, "missing"), None);
    }

    #[test]
    fn test_device_overrides() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        std::fs::write(
            base.join("device.cfg"),
            "# comment\ntarget_device=hammerhead\nkexec_dtb=1\ncmdline_strip=26\nramdisk_addr=0x11000000\n",
        )
        .unwrap();
        let mut cfg = DeviceConfig::default();
        cfg.apply_overrides(base);
        assert_eq!(cfg.target_device, "hammerhead");
        assert!(cfg.kexec_dtb);
        assert_eq!(cfg.cmdline_strip, 26);
        assert_eq!(cfg.ramdisk_addr, Some(0x11000000));
    }

    #[test]
    fn test_usb_dir_name() {
        let mut device = DeviceConfig::default();
        device.target_device = "grouper".into();
        let paths = Paths::with_base("/tmp/mrom", device);
        assert_eq!(paths.usb_dir_name(), "multirom-grouper");
    }
}
