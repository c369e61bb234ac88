//! Android secondary staging: copy the ROM's boot files over `/`,
//! neutralise the fstab the vendor init would mount from, and shadow
//! `/system`, `/data`, `/cache` (and `/firmware`) with the secondary's
//! trees before the real init ever runs.

use std::os::unix::fs::PermissionsExt;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use rustix::mount::MountFlags;

use crate::hooks::device_hooks;
use crate::mount::{self, AID_CACHE, AID_SYSTEM};
use crate::paths::Paths;
use crate::rom::{Rom, RomKind};

const FW_MOUNT_OPTS: &str = "shortname=lower,uid=1000,gid=1000,dmask=227,fmask=337";
const IMG_MOUNT_OPTS: &str = "discard,nomblk_io_submit";

const DUMMY_FSTAB_LINE: &str = "\
# Android considers empty fstab invalid, so MultiROM has to add _something_ to process triggers\n\
tmpfs\t/dummy_tmpfs\ttmpfs\tro,nosuid,nodev\tdefaults\n";

/// Stage an Android ROM onto `root` (always `/` outside of tests).
#[context("Preparing Android mounts for {name}", name = rom.name)]
pub(crate) fn prep_android_mounts(paths: &Paths, rom: &Rom, root: &Utf8Path) -> Result<()> {
    let has_fw = rom.base_path.join("firmware.img").exists();

    let fstab_name = copy_boot_files(paths, rom, root)?;
    let fstab_path = match fstab_name {
        Some(name) => root.join(name.trim_start_matches('/')),
        None => crate::fstab::find_fstab(root, &paths.device.target_device)?
            .ok_or_else(|| anyhow!("failed to find fstab file in {root}"))?,
    };
    process_android_fstab(&fstab_path, has_fw, root)?;

    mount::mkdir_with_perms(&root.join("system"), 0o755, None)?;
    mount::mkdir_with_perms(&root.join("data"), 0o771, Some((AID_SYSTEM, AID_SYSTEM)))?;
    mount::mkdir_with_perms(&root.join("cache"), 0o770, Some((AID_SYSTEM, AID_CACHE)))?;
    if has_fw {
        mount::mkdir_with_perms(&root.join("firmware"), 0o771, Some((AID_SYSTEM, AID_SYSTEM)))?;
    }

    let img = rom.kind == RomKind::AndroidUsbImg;
    for (name, readonly) in [("system", true), ("data", false), ("cache", false)] {
        let to = root.join(name);
        if img {
            let from = rom.base_path.join(format!("{name}.img"));
            let mut flags = MountFlags::NOATIME;
            if readonly {
                flags |= MountFlags::RDONLY;
            }
            mount::mount_loop(&from, &to, "ext4", flags, IMG_MOUNT_OPTS)?;
        } else {
            let from = rom.base_path.join(name);
            if readonly {
                mount::bind_mount_ro(&from, &to)?;
            } else {
                mount::bind_mount(&from, &to)?;
            }
        }
    }

    if has_fw {
        tracing::info!("Mounting ROM's FW image instead of FW partition");
        mount::mount_loop(
            &rom.base_path.join("firmware.img"),
            &root.join("firmware"),
            "vfat",
            MountFlags::RDONLY,
            FW_MOUNT_OPTS,
        )?;
    }

    device_hooks().after_android_mounts(rom.base_path.as_path(), rom.kind)?;
    Ok(())
}

/// Copy every regular file from `<base>/boot/` into the root, rename the
/// new `init` out of the trampoline's way, and return the fstab path a
/// `mount_all` directive names, if any.
fn copy_boot_files(paths: &Paths, rom: &Rom, root: &Utf8Path) -> Result<Option<String>> {
    let boot_dir = rom.base_path.join("boot");
    let mut fstab_name = None;
    let device_rc = format!("init.{}.rc", paths.device.target_device);

    for entry in boot_dir
        .read_dir_utf8()
        .with_context(|| format!("Failed to open rom path {boot_dir}"))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        // The ROM's init goes to /main_init: the trampoline execs that on
        // its way out, and /init itself is the running trampoline binary.
        let out = if name == "init" {
            root.join("main_init")
        } else {
            root.join(name)
        };
        mount::copy_file(entry.path(), &out)?;

        if name.ends_with(".rc") {
            std::fs::set_permissions(&out, std::fs::Permissions::from_mode(0o750))?;
            if fstab_name.is_none() && name == device_rc {
                fstab_name = find_fstab_in_rc(&out)?;
            }
        }
    }
    Ok(fstab_name)
}

/// Find the `mount_all <path>` directive in an init rc file.
pub(crate) fn find_fstab_in_rc(rcfile: &Utf8Path) -> Result<Option<String>> {
    let content =
        std::fs::read_to_string(rcfile).with_context(|| format!("Failed to open rcfile {rcfile}"))?;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("mount_all") {
            let path = rest.trim();
            if !path.is_empty() {
                tracing::info!("Using fstab {path} from rc files");
                return Ok(Some(path.to_string()));
            }
        }
    }
    Ok(None)
}

/// Comment out the rows the vendor init would mount over our bind mounts.
/// More commented rows than expected means the fstab is not what we think
/// it is, and booting it would corrupt the primary system.
#[context("Modifying fstab {path}")]
pub(crate) fn process_android_fstab(path: &Utf8Path, has_fw: bool, root: &Utf8Path) -> Result<()> {
    let content = std::fs::read_to_string(path).context("Reading fstab")?;
    let rewritten = neutralise_fstab(&content, has_fw)?;
    if rewritten.added_dummy {
        tracing::info!("fstab would be empty, adding dummy line");
        let _ = std::fs::create_dir(root.join("dummy_tmpfs"));
    }
    std::fs::write(path, rewritten.content).context("Writing fstab")?;
    Ok(())
}

pub(crate) struct NeutralisedFstab {
    pub(crate) content: String,
    pub(crate) added_dummy: bool,
}

pub(crate) fn neutralise_fstab(content: &str, has_fw: bool) -> Result<NeutralisedFstab> {
    let mut shadowed = vec!["/system", "/cache", "/data"];
    if has_fw {
        shadowed.push("/firmware");
    }
    let limit = shadowed.len();

    let mut out = String::with_capacity(content.len() + 8);
    let mut counter = 0usize;
    let mut has_live_line = false;
    for line in content.lines() {
        if !line.starts_with('#') {
            let hits_shadowed = line
                .split_ascii_whitespace()
                .any(|field| shadowed.contains(&field));
            if hits_shadowed {
                counter += 1;
                if counter > limit {
                    return Err(anyhow!(
                        "commented {counter} lines instead of {limit} in fstab, stopping boot!"
                    ));
                }
                out.push('#');
            } else if !line.trim().is_empty() {
                has_live_line = true;
            }
        }
        out.push_str(line);
        out.push('\n');
    }

    // Android considers an empty fstab invalid.
    let added_dummy = !has_live_line;
    if added_dummy {
        out.push_str(DUMMY_FSTAB_LINE);
    }
    Ok(NeutralisedFstab {
        content: out,
        added_dummy,
    })
}

/// `/data/media` layout fix-up: newer Androids keep user media in
/// `media/0`, older ones directly in `media`.  Bind the right source to
/// the place the staged system expects and stamp the layout version.
#[context("Creating media link")]
pub(crate) fn create_media_link(realdata: &Utf8Path, data_root: &Utf8Path, api_level: i32) -> Result<()> {
    let media_new = realdata.join("media/0").exists();

    let (from, to) = if api_level <= 16 {
        let from = if media_new {
            realdata.join("media/0")
        } else {
            realdata.join("media")
        };
        (from, data_root.join("media"))
    } else {
        let to = if media_new {
            data_root.join("media")
        } else {
            data_root.join("media/0")
        };
        (realdata.join("media"), to)
    };

    tracing::info!("Making media dir: api {api_level}, media_new {media_new}, {from} to {to}");
    std::fs::create_dir_all(&to).context("Failed to make media dir")?;
    mount::bind_mount(&from, &to)?;

    if api_level >= 17 {
        let layout_version = data_root.join(".layout_version");
        std::fs::write(&layout_version, "2").context("Failed to create .layout_version")?;
        std::fs::set_permissions(&layout_version, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Android API level from a build.prop.
pub(crate) fn get_api_level(build_prop: &Utf8Path) -> Result<i32> {
    let content = std::fs::read_to_string(build_prop)
        .with_context(|| format!("Could not open {build_prop} to read api level"))?;
    let level = content
        .lines()
        .find_map(|l| l.strip_prefix("ro.build.version.sdk="))
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(-1);
    if level <= 0 {
        anyhow::bail!("invalid ro.build.version.sdk line in {build_prop}");
    }
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const FSTAB: &str = indoc! {"
        # Android fstab file.
        /dev/block/by-name/system   /system  ext4  ro  wait
        /dev/block/by-name/userdata /data    ext4  noatime  wait,check
        /dev/block/by-name/cache    /cache   ext4  noatime  wait,check
        /dev/block/by-name/modem    /firmware  vfat  ro  wait
        /dev/block/by-name/misc     /misc    emmc  defaults  defaults
    "};

    #[test]
    fn test_neutralise_counts() {
        let out = neutralise_fstab(FSTAB, false).unwrap();
        let commented = out
            .content
            .lines()
            .filter(|l| l.starts_with("#/dev"))
            .count();
        assert_eq!(commented, 3);
        // /firmware and /misc stay live without a firmware image.
        assert!(out.content.contains("\n/dev/block/by-name/modem"));
        assert!(!out.added_dummy);

        let out = neutralise_fstab(FSTAB, true).unwrap();
        let commented = out
            .content
            .lines()
            .filter(|l| l.starts_with("#/dev"))
            .count();
        assert_eq!(commented, 4);
    }

    #[test]
    fn test_neutralise_rejects_extra_rows() {
        let malicious = format!("{FSTAB}/dev/block/evil /data ext4 defaults wait\n");
        assert!(neutralise_fstab(&malicious, false).is_err());
    }

    #[test]
    fn test_neutralise_device_name_not_confused_with_mountpoint() {
        // The device path contains "system" but the mount point is /misc;
        // it must stay untouched.
        let fstab = "/dev/block/by-name/system /misc ext4 defaults wait\n\
                     /dev/block/by-name/sys /system ext4 ro wait\n";
        let out = neutralise_fstab(fstab, false).unwrap();
        assert!(out.content.starts_with("/dev/block/by-name/system /misc"));
        assert!(out.content.contains("#/dev/block/by-name/sys /system"));
    }

    #[test]
    fn test_neutralise_empty_fstab_gets_dummy() {
        let fstab = "/dev/block/a /system ext4 ro wait\n";
        let out = neutralise_fstab(fstab, false).unwrap();
        assert!(out.added_dummy);
        assert!(out.content.contains("/dummy_tmpfs"));
        // The dummy line itself parses as a valid fstab row.
        let reparsed = crate::fstab::Fstab::parse(&out.content).unwrap();
        assert!(reparsed.first_by_path("/dummy_tmpfs").is_some());
    }

    #[test]
    fn test_find_fstab_in_rc() {
        let td = tempfile::tempdir().unwrap();
        let rc = Utf8Path::from_path(td.path()).unwrap().join("init.flo.rc");
        std::fs::write(
            &rc,
            indoc! {"
                on init
                    export PATH /sbin
                # mount_all /fstab.commented
                on fs
                    mount_all /fstab.flo
            "},
        )
        .unwrap();
        assert_eq!(find_fstab_in_rc(&rc).unwrap().as_deref(), Some("/fstab.flo"));

        std::fs::write(&rc, "on fs\n    start something\n").unwrap();
        assert_eq!(find_fstab_in_rc(&rc).unwrap(), None);
    }

    #[test]
    fn test_copy_boot_files() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let root = base.join("root");
        std::fs::create_dir_all(&root).unwrap();

        let rom_base = base.join("roms/CM13");
        std::fs::create_dir_all(rom_base.join("boot")).unwrap();
        std::fs::write(rom_base.join("boot/init"), b"rom-init").unwrap();
        std::fs::write(
            rom_base.join("boot/init.flo.rc"),
            "on fs\n    mount_all /fstab.flo\n",
        )
        .unwrap();
        std::fs::write(rom_base.join("boot/default.prop"), b"ro.secure=0\n").unwrap();

        let mut device = crate::paths::DeviceConfig::default();
        device.target_device = "flo".into();
        let paths = Paths::with_base(base.join("mrom"), device);
        let rom = Rom {
            id: 0,
            name: "CM13".into(),
            base_path: rom_base,
            partition_uuid: None,
            kind: RomKind::AndroidInternal,
            has_bootimg: true,
        };

        let fstab_name = copy_boot_files(&paths, &rom, &root).unwrap();
        assert_eq!(fstab_name.as_deref(), Some("/fstab.flo"));
        // The ROM's init lands at main_init, never at /init.
        assert_eq!(std::fs::read(root.join("main_init")).unwrap(), b"rom-init");
        assert!(!root.join("init").exists());
        assert!(root.join("default.prop").exists());
        let mode = root
            .join("init.flo.rc")
            .metadata()
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o750);
    }

    #[test]
    fn test_get_api_level() {
        let td = tempfile::tempdir().unwrap();
        let prop = Utf8Path::from_path(td.path()).unwrap().join("build.prop");
        std::fs::write(&prop, "ro.build.id=XYZ\nro.build.version.sdk=19\n").unwrap();
        assert_eq!(get_api_level(&prop).unwrap(), 19);

        std::fs::write(&prop, "ro.build.id=XYZ\n").unwrap();
        assert!(get_api_level(&prop).is_err());
    }
}
