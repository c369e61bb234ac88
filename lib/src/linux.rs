//! Linux secondary staging: open the rom_info root, resolve the kernel
//! and initrd, and assemble the kexec invocation.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rustix::mount::MountFlags;

use crate::fstab::Fstab;
use crate::kexec::KexecLoad;
use crate::mount;
use crate::partitions::Partition;
use crate::paths::REALDATA;
use crate::rom::Rom;
use crate::rominfo::{ExpandCtx, RomInfo};

const IMAGE_MOUNT: &str = "/mnt/image";

pub(crate) struct LinuxBoot {
    pub(crate) load: KexecLoad,
    /// The root image was loop-mounted at `/mnt/image` and must be
    /// unmounted after the kexec load.
    pub(crate) loop_mounted: bool,
}

/// Build the macro-expansion inputs for a ROM.
pub(crate) fn expand_ctx(
    rom: &Rom,
    part: Option<&Partition>,
    fstab: Option<&Fstab>,
    bootloader_cmdline: String,
) -> ExpandCtx {
    // Internal ROMs boot from the /data partition; USB ROMs from their
    // own drive, identified by UUID because device names shift.
    let data_entry = match part {
        Some(_) => None,
        None => fstab.and_then(|f| f.first_by_path("/data")),
    };
    let root_device = match (data_entry, part) {
        (Some(e), _) => {
            // Only Android's ueventd creates /dev/block; a real Linux
            // will have the plain /dev node.
            match e.device.strip_prefix("/dev/block/") {
                Some(rest) => format!("/dev/{rest}"),
                None => e.device.clone(),
            }
        }
        (None, Some(p)) => format!("UUID={}", p.uuid),
        (None, None) => {
            tracing::error!("Failed to set root device");
            String::new()
        }
    };
    let root_fstype = match (data_entry, part) {
        (Some(e), _) => e.fstype.clone(),
        (None, Some(p)) if p.fs == "ntfs" => "ntfs-3g".to_string(),
        (None, Some(p)) => p.fs.clone(),
        (None, None) => {
            tracing::error!("Failed to set root fs type");
            String::new()
        }
    };
    let part_root = part
        .map(|p| p.mount_path.as_str())
        .unwrap_or(REALDATA);
    let rom_rel_base = rom
        .base_path
        .as_str()
        .strip_prefix(part_root)
        .unwrap_or(rom.base_path.as_str())
        .to_string();
    ExpandCtx {
        bootloader_cmdline,
        root_device,
        root_fstype,
        rom_rel_base,
    }
}

/// Stage a Linux ROM: open its root, resolve the boot files and
/// assemble the kexec invocation.
#[context("Staging Linux ROM {name}", name = rom.name)]
pub(crate) fn stage_linux(
    rom: &Rom,
    part: Option<&Partition>,
    fstab: Option<&Fstab>,
    bootloader_cmdline: String,
) -> Result<LinuxBoot> {
    let mut info = RomInfo::load(&rom.base_path.join("rom_info.txt"))?;
    info.expand(&expand_ctx(rom, part, fstab, bootloader_cmdline));

    let base_path = part
        .map(|p| p.mount_path.clone())
        .unwrap_or_else(|| Utf8PathBuf::from(REALDATA));

    // Prefer the image root; fall back to the directory root.
    let mut loop_mounted = false;
    let mut root_path = None;
    if let Some(img) = info.get("root_img") {
        let img_path = join_rel(&base_path, img);
        if img_path.exists() {
            let fs = info.get("root_img_fs").unwrap_or("ext4");
            std::fs::create_dir_all(IMAGE_MOUNT)?;
            mount::mount_loop(
                &img_path,
                Utf8Path::new(IMAGE_MOUNT),
                fs,
                MountFlags::NOATIME,
                "",
            )?;
            loop_mounted = true;
            root_path = Some(Utf8PathBuf::from(IMAGE_MOUNT));
        } else {
            tracing::error!("Path {img_path} not found!");
        }
    }
    if root_path.is_none() {
        if let Some(dir) = info.get("root_dir") {
            let dir_path = join_rel(&base_path, dir);
            if dir_path.is_dir() {
                root_path = Some(dir_path);
            } else {
                tracing::error!("Path {dir_path} not found!");
            }
        }
    }
    let root_path = root_path.ok_or_else(|| anyhow!("failed to find root of the ROM"))?;

    let res = build_load(&info, &root_path, &rom.base_path, loop_mounted);
    if res.is_err() && loop_mounted {
        let _ = mount::unmount(Utf8Path::new(IMAGE_MOUNT));
    }
    res
}

fn build_load(
    info: &RomInfo,
    root_path: &Utf8Path,
    rom_base: &Utf8Path,
    loop_mounted: bool,
) -> Result<LinuxBoot> {
    let kernel = find_boot_file(info.get("kernel_path"), root_path, rom_base)?
        .ok_or_else(|| anyhow!("failed to find kernel"))?;
    let initrd = find_boot_file(info.get("initrd_path"), root_path, rom_base)?;

    let mut cmdline = info.get("base_cmdline").unwrap_or_default().to_string();
    let extra = if loop_mounted {
        info.get("img_cmdline")
    } else {
        info.get("dir_cmdline")
    };
    if let Some(extra) = extra {
        cmdline.push(' ');
        cmdline.push_str(extra);
    }

    Ok(LinuxBoot {
        load: KexecLoad {
            kernel,
            initrd,
            cmdline,
        },
        loop_mounted,
    })
}

fn join_rel(base: &Utf8Path, rel: &str) -> Utf8PathBuf {
    base.join(rel.trim_start_matches('/'))
}

/// Resolve a declared kernel/initrd path.  A leading `%r` makes the path
/// relative to the mounted root; the last component supports a trailing
/// `*` wildcard matched by substring against the directory listing.
pub(crate) fn find_boot_file(
    declared: Option<&str>,
    root_path: &Utf8Path,
    base_path: &Utf8Path,
) -> Result<Option<Utf8PathBuf>> {
    let Some(declared) = declared else {
        return Ok(None);
    };
    let full = match declared.strip_prefix("%r") {
        Some(rest) => join_rel(root_path, rest),
        None => join_rel(base_path, declared),
    };
    let dir = full
        .parent()
        .ok_or_else(|| anyhow!("failed to find boot file: {full}"))?;
    let pattern = full
        .file_name()
        .ok_or_else(|| anyhow!("failed to find boot file: {full}"))?;

    let needle = pattern.split('*').next().unwrap_or(pattern);
    let wild = pattern.contains('*');
    for entry in dir
        .read_dir_utf8()
        .with_context(|| format!("failed to find boot file in {dir}"))?
    {
        let entry = entry?;
        let name = entry.file_name();
        if name.starts_with('.') {
            continue;
        }
        let matched = if wild {
            name.contains(needle)
        } else {
            name == pattern
        };
        if matched {
            return Ok(Some(dir.join(name)));
        }
    }
    anyhow::bail!("failed to find boot file: {full}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rom::RomKind;

    fn test_rom(base: &Utf8Path) -> Rom {
        Rom {
            id: 0,
            name: "ubuntu".into(),
            base_path: base.to_owned(),
            partition_uuid: Some("4C53-AA31".into()),
            kind: RomKind::LinuxUsb,
            has_bootimg: false,
        }
    }

    fn test_part(mount: &Utf8Path) -> Partition {
        Partition {
            name: "sda1".into(),
            uuid: "4C53-AA31".into(),
            fs: "ext4".into(),
            mount_path: mount.to_owned(),
            keep_mounted: false,
        }
    }

    #[test]
    fn test_find_boot_file_wildcard() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        std::fs::create_dir_all(root.join("boot")).unwrap();
        std::fs::write(root.join("boot/vmlinuz-4.4.0-31-generic"), b"k").unwrap();
        std::fs::write(root.join("boot/initrd.img-4.4.0-31-generic"), b"i").unwrap();
        std::fs::write(root.join("boot/config-4.4.0-31-generic"), b"c").unwrap();

        let found = find_boot_file(Some("%r/boot/vmlinuz-*"), root, Utf8Path::new("/unused"))
            .unwrap()
            .unwrap();
        assert_eq!(found, root.join("boot/vmlinuz-4.4.0-31-generic"));

        // Exact names need an exact match.
        assert!(find_boot_file(Some("%r/boot/vmlinuz"), root, Utf8Path::new("/unused")).is_err());
        let exact = find_boot_file(
            Some("%r/boot/config-4.4.0-31-generic"),
            root,
            Utf8Path::new("/unused"),
        )
        .unwrap()
        .unwrap();
        assert_eq!(exact, root.join("boot/config-4.4.0-31-generic"));

        // Paths without %r resolve against the ROM base.
        std::fs::write(root.join("zImage"), b"k").unwrap();
        let based = find_boot_file(Some("zImage"), Utf8Path::new("/unused"), root)
            .unwrap()
            .unwrap();
        assert_eq!(based, root.join("zImage"));

        assert_eq!(find_boot_file(None, root, root).unwrap(), None);
    }

    #[test]
    fn test_expand_ctx_usb() {
        let td = tempfile::tempdir().unwrap();
        let mnt = Utf8Path::from_path(td.path()).unwrap();
        let base = mnt.join("multirom-flo/ubuntu");
        let rom = test_rom(&base);
        let part = test_part(mnt);

        let ctx = expand_ctx(&rom, Some(&part), None, "console=tty0".into());
        assert_eq!(ctx.root_device, "UUID=4C53-AA31");
        assert_eq!(ctx.root_fstype, "ext4");
        assert_eq!(ctx.rom_rel_base, "/multirom-flo/ubuntu");
        assert_eq!(ctx.bootloader_cmdline, "console=tty0");
    }

    #[test]
    fn test_expand_ctx_internal_strips_dev_block() {
        let fstab = Fstab::parse(
            "/dev/block/mmcblk0p23 /data ext4 noatime wait\n",
        )
        .unwrap();
        let rom = Rom {
            id: 0,
            name: "arch".into(),
            base_path: "/realdata/media/0/multirom/roms/arch".into(),
            partition_uuid: None,
            kind: RomKind::LinuxInternal,
            has_bootimg: false,
        };
        let ctx = expand_ctx(&rom, None, Some(&fstab), String::new());
        assert_eq!(ctx.root_device, "/dev/mmcblk0p23");
        assert_eq!(ctx.root_fstype, "ext4");
    }

    #[test]
    fn test_expand_ctx_ntfs_maps_to_fuse_type() {
        let td = tempfile::tempdir().unwrap();
        let mnt = Utf8Path::from_path(td.path()).unwrap();
        let rom = test_rom(&mnt.join("multirom-flo/ubuntu"));
        let mut part = test_part(mnt);
        part.fs = "ntfs".into();
        let ctx = expand_ctx(&rom, Some(&part), None, String::new());
        assert_eq!(ctx.root_fstype, "ntfs-3g");
    }
}
