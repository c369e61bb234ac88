//! In-memory model of Android `fstab.*` files.
//!
//! Two column orderings exist in the wild: the legacy
//! `path device …` layout and the fs_mgr `device path …` one.  The parser
//! infers which one it is looking at from the first data row.

use std::fmt::Write as _;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rustix::mount::MountFlags;

use crate::mount::readlink_recursive;

// flag names understood by fs_mgr
const MOUNT_FLAGS: &[(&str, MountFlags)] = &[
    ("noatime", MountFlags::NOATIME),
    ("noexec", MountFlags::NOEXEC),
    ("nosuid", MountFlags::NOSUID),
    ("nodev", MountFlags::NODEV),
    ("nodiratime", MountFlags::NODIRATIME),
    ("ro", MountFlags::RDONLY),
    ("rw", MountFlags::empty()),
    ("remount", MountFlags::from_bits_retain(libc::MS_REMOUNT as u32)),
    ("bind", MountFlags::BIND),
    ("rec", MountFlags::REC),
    ("unbindable", MountFlags::from_bits_retain(libc::MS_UNBINDABLE as u32)),
    ("private", MountFlags::from_bits_retain(libc::MS_PRIVATE as u32)),
    ("slave", MountFlags::from_bits_retain(libc::MS_SLAVE as u32)),
    ("shared", MountFlags::from_bits_retain(libc::MS_SHARED as u32)),
    ("sync", MountFlags::SYNCHRONOUS),
    ("defaults", MountFlags::empty()),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FstabLayout {
    /// `path type device …`
    PathFirst,
    /// `device path type …`
    DeviceFirst,
}

#[derive(Clone, Debug)]
pub(crate) struct FstabEntry {
    pub(crate) path: String,
    pub(crate) device: String,
    pub(crate) fstype: String,
    /// Mount flags recognized from the options column.
    pub(crate) mountflags: MountFlags,
    /// The non-flag remainder of the options column, comma-joined.
    pub(crate) options: Option<String>,
    pub(crate) options_raw: String,
    /// The second, fs_mgr-specific options column (`wait`, `encryptable=…`).
    pub(crate) options2: String,
    pub(crate) disabled: bool,
}

#[derive(Debug)]
pub(crate) struct Fstab {
    pub(crate) path: Utf8PathBuf,
    pub(crate) layout: FstabLayout,
    pub(crate) entries: Vec<FstabEntry>,
}

pub(crate) fn parse_mount_options(raw: &str) -> (MountFlags, Option<String>) {
    let mut flags = MountFlags::empty();
    let mut rest = Vec::new();
    for opt in raw.split(',').filter(|o| !o.is_empty()) {
        match MOUNT_FLAGS.iter().find(|(name, _)| *name == opt) {
            Some((_, flag)) => flags |= *flag,
            None => rest.push(opt),
        }
    }
    let options = (!rest.is_empty()).then(|| rest.join(","));
    (flags, options)
}

impl Fstab {
    #[context("Loading fstab {path}")]
    pub(crate) fn load(path: &Utf8Path, resolve_symlinks: bool) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Reading file")?;
        let mut fstab = Self::parse(&content)?;
        fstab.path = path.to_owned();
        if resolve_symlinks {
            for entry in &mut fstab.entries {
                entry.device = readlink_recursive(Utf8Path::new(&entry.device)).into_string();
            }
        }
        Ok(fstab)
    }

    pub(crate) fn parse(content: &str) -> Result<Self> {
        let mut layout = None;
        let mut entries = Vec::new();
        for (lineno, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_ascii_whitespace().collect();
            if fields.len() < 3 {
                return Err(anyhow!("line {}: expected at least 3 columns", lineno + 1));
            }
            let layout = *layout.get_or_insert_with(|| {
                // If a /dev/ path appears somewhere but not in the first
                // column, this is the legacy path-first layout.
                if line.contains("/dev/") && !fields[0].starts_with("/dev/") {
                    FstabLayout::PathFirst
                } else {
                    FstabLayout::DeviceFirst
                }
            });
            let (path, fstype, device) = match layout {
                FstabLayout::PathFirst => (fields[0], fields[1], fields[2]),
                FstabLayout::DeviceFirst => (fields[1], fields[2], fields[0]),
            };
            let options_raw = fields.get(3).copied().unwrap_or_default();
            let (mountflags, options) = parse_mount_options(options_raw);
            entries.push(FstabEntry {
                path: path.to_string(),
                device: device.to_string(),
                fstype: fstype.to_string(),
                mountflags,
                options,
                options_raw: options_raw.to_string(),
                options2: fields.get(4).copied().unwrap_or_default().to_string(),
                disabled: false,
            });
        }
        Ok(Self {
            path: Utf8PathBuf::new(),
            layout: layout.unwrap_or(FstabLayout::DeviceFirst),
            entries,
        })
    }

    /// Serialize back out; disabled rows are commented.
    pub(crate) fn to_string(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            if e.disabled {
                out.push('#');
            }
            match self.layout {
                FstabLayout::PathFirst => {
                    let _ = write!(out, "{}\t{}\t{}\t", e.path, e.fstype, e.device);
                }
                FstabLayout::DeviceFirst => {
                    let _ = write!(out, "{}\t{}\t{}\t", e.device, e.path, e.fstype);
                }
            }
            let _ = writeln!(out, "{}\t{}", e.options_raw, e.options2);
        }
        out
    }

    #[context("Saving fstab to {path}")]
    pub(crate) fn save(&self, path: &Utf8Path) -> Result<()> {
        std::fs::write(path, self.to_string())?;
        Ok(())
    }

    pub(crate) fn first_by_path(&self, path: &str) -> Option<&FstabEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub(crate) fn entries_by_path<'a>(
        &'a self,
        path: &'a str,
    ) -> impl Iterator<Item = &'a FstabEntry> {
        self.entries.iter().filter(move |e| e.path == path)
    }

    /// Replace every occurrence of a device path; the encryption gate uses
    /// this to splice in the dm-crypt node.
    pub(crate) fn update_device(&mut self, old: &str, new: &str) {
        for e in &mut self.entries {
            if e.device == old {
                e.device = new.to_string();
            }
        }
    }

    /// Pick the fstab to load from `root`: prefer `mrom.fstab`, then
    /// `fstab.<device>`, then any other `fstab.*` that is not the
    /// emulator's.
    #[context("Auto-loading fstab from {root}")]
    pub(crate) fn auto_load(root: &Utf8Path, target_device: &str) -> Result<Self> {
        let path = find_fstab(root, target_device)?
            .ok_or_else(|| anyhow!("no fstab found in {root}"))?;
        tracing::info!("Loading fstab {path}");
        Self::load(&path, true)
    }
}

pub(crate) fn find_fstab(root: &Utf8Path, target_device: &str) -> Result<Option<Utf8PathBuf>> {
    let mrom_fstab = root.join("mrom.fstab");
    if mrom_fstab.exists() {
        return Ok(Some(mrom_fstab));
    }
    let device_name = format!("fstab.{target_device}");
    let mut found = None;
    for entry in root.read_dir_utf8().context("Reading root")? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        // For some reason, CM includes goldfish's fstab, ignore it
        // (goldfish/ranchu are the emulator devices)
        if name == "fstab.goldfish" || name == "fstab.ranchu" {
            continue;
        }
        if name == device_name {
            return Ok(Some(entry.path().to_owned()));
        }
        if name.starts_with("fstab.") {
            found = Some(entry.path().to_owned());
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const MODERN: &str = indoc! {"
        # Android fstab file.
        /dev/block/platform/msm_sdcc.1/by-name/system   /system  ext4  ro,barrier=1  wait
        /dev/block/platform/msm_sdcc.1/by-name/userdata /data    ext4  noatime,nosuid,nodev,barrier=1,noauto_da_alloc  wait,check,encryptable=footer
        /dev/block/platform/msm_sdcc.1/by-name/cache    /cache   ext4  noatime,nosuid,nodev  wait,check
        /dev/block/platform/msm_sdcc.1/by-name/boot     /boot    emmc  defaults  defaults
    "};

    const LEGACY: &str = indoc! {"
        /system  ext4  /dev/block/mmcblk0p3  ro  defaults
        /data    ext4  /dev/block/mmcblk0p8  noatime,nosuid,nodev  defaults
    "};

    #[test]
    fn test_parse_modern() {
        let fstab = Fstab::parse(MODERN).unwrap();
        assert_eq!(fstab.layout, FstabLayout::DeviceFirst);
        assert_eq!(fstab.entries.len(), 4);

        let data = fstab.first_by_path("/data").unwrap();
        assert_eq!(
            data.device,
            "/dev/block/platform/msm_sdcc.1/by-name/userdata"
        );
        assert_eq!(data.fstype, "ext4");
        assert!(data
            .mountflags
            .contains(MountFlags::NOATIME | MountFlags::NOSUID | MountFlags::NODEV));
        assert_eq!(
            data.options.as_deref(),
            Some("barrier=1,noauto_da_alloc")
        );
        assert_eq!(data.options2, "wait,check,encryptable=footer");

        let system = fstab.first_by_path("/system").unwrap();
        assert!(system.mountflags.contains(MountFlags::RDONLY));
    }

    #[test]
    fn test_parse_legacy() {
        let fstab = Fstab::parse(LEGACY).unwrap();
        assert_eq!(fstab.layout, FstabLayout::PathFirst);
        let data = fstab.first_by_path("/data").unwrap();
        assert_eq!(data.device, "/dev/block/mmcblk0p8");
        assert_eq!(data.fstype, "ext4");
    }

    #[test]
    fn test_roundtrip_preserves_layout() {
        for src in [MODERN, LEGACY] {
            let fstab = Fstab::parse(src).unwrap();
            let reparsed = Fstab::parse(&fstab.to_string()).unwrap();
            assert_eq!(reparsed.layout, fstab.layout);
            assert_eq!(reparsed.entries.len(), fstab.entries.len());
            for (a, b) in fstab.entries.iter().zip(&reparsed.entries) {
                assert_eq!(a.path, b.path);
                assert_eq!(a.device, b.device);
                assert_eq!(a.options_raw, b.options_raw);
            }
        }
    }

    #[test]
    fn test_disabled_rows_commented() {
        let mut fstab = Fstab::parse(MODERN).unwrap();
        for e in &mut fstab.entries {
            if e.path == "/data" {
                e.disabled = true;
            }
        }
        let out = fstab.to_string();
        let data_line = out.lines().find(|l| l.contains("/data")).unwrap();
        assert!(data_line.starts_with('#'));
        // Disabled rows vanish from a reparse.
        assert!(Fstab::parse(&out).unwrap().first_by_path("/data").is_none());
    }

    #[test]
    fn test_update_device() {
        let mut fstab = Fstab::parse(MODERN).unwrap();
        let old = fstab.first_by_path("/data").unwrap().device.clone();
        fstab.update_device(&old, "/dev/dm-0");
        assert_eq!(fstab.first_by_path("/data").unwrap().device, "/dev/dm-0");
    }

    #[test]
    fn test_next_by_path() {
        let multi = indoc! {"
            /dev/block/a  /data  ext4  defaults  wait
            /dev/block/b  /data  f2fs  defaults  wait
        "};
        let fstab = Fstab::parse(multi).unwrap();
        let devices: Vec<_> = fstab.entries_by_path("/data").map(|e| e.device.as_str()).collect();
        assert_eq!(devices, ["/dev/block/a", "/dev/block/b"]);
    }

    #[test]
    fn test_find_fstab_preferences() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        std::fs::write(root.join("fstab.goldfish"), "").unwrap();
        std::fs::write(root.join("fstab.other"), "").unwrap();
        std::fs::write(root.join("fstab.flo"), "").unwrap();

        let found = find_fstab(root, "flo").unwrap().unwrap();
        assert_eq!(found.file_name(), Some("fstab.flo"));

        // mrom.fstab wins over everything.
        std::fs::write(root.join("mrom.fstab"), "").unwrap();
        let found = find_fstab(root, "flo").unwrap().unwrap();
        assert_eq!(found.file_name(), Some("mrom.fstab"));

        // Device fstab missing: fall back to any non-emulator fstab.
        std::fs::remove_file(root.join("mrom.fstab")).unwrap();
        std::fs::remove_file(root.join("fstab.flo")).unwrap();
        let found = find_fstab(root, "flo").unwrap().unwrap();
        assert_eq!(found.file_name(), Some("fstab.other"));
    }
}
