//! The replacement `/init`: runs as PID 1, prepares the chosen
//! environment, then execs the real init.
//!
//! Everything mounted here must be unmounted again before the handoff,
//! except what is explicitly kept (`/dev`, and `/realdata` when a USB
//! ROM is booting).

use std::ffi::CString;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use rustix::mount::MountFlags;

use crate::adb::AdbSupervisor;
use crate::encryption::{EncryptionGate, Unlock};
use crate::fstab::{Fstab, FstabEntry};
use crate::hooks::device_hooks;
use crate::klog;
use crate::mount::{self, wait_for_file};
use crate::nokexec;
use crate::paths::{find_cmdline_value, DeviceConfig, Paths, KEEP_REALDATA, REALDATA};
use crate::reboot::{reboot, RebootTarget};
use crate::status::Status;
use crate::task::Task;
use crate::version::{SECOND_BOOT_SENTINEL, VERSION_TRAMPOLINE};

const FB_DEV: &str = "/dev/graphics/fb0";

// Fallback ladder when the fstab-declared filesystem refuses to mount.
const DATA_FS_FALLBACKS: &[(&str, &str)] = &[
    (
        "ext4",
        "barrier=1,data=ordered,nomblk_io_submit,noauto_da_alloc,errors=panic",
    ),
    ("f2fs", "inline_xattr,flush_merge"),
    ("ext3", ""),
    ("ext2", ""),
];

/// The PID-1 path.  Only returns if the final exec of the real init
/// fails.
pub(crate) fn run() -> Result<()> {
    rustix::process::umask(rustix::fs::Mode::empty());
    early_mounts();
    multirom_utils::initialize_tracing("trampoline");
    tracing::info!("Running trampoline v{VERSION_TRAMPOLINE}");

    // /proc is up only now; device detection reads the cmdline.
    let device = DeviceConfig::detect();

    let mut gate = EncryptionGate::default();

    if is_charger_mode() {
        tracing::info!("Charger mode detected, skipping multirom");
    } else {
        device_hooks().before_device_init();

        tracing::info!("Initializing devices...");
        if let Err(e) = init_devices() {
            tracing::error!("Device init failed: {e:#}");
        }
        tracing::info!("Done initializing");

        match Fstab::auto_load(Utf8Path::new("/"), &device.target_device) {
            Ok(mut fstab) => {
                if let Err(e) = boot_multirom(&device, &mut fstab, &mut gate) {
                    tracing::error!("{e:#}");
                    if looks_like_second_boot(&fstab) {
                        tracing::error!(
                            "This is second boot and we couldn't mount /data, reboot!"
                        );
                        rustix::fs::sync();
                        // Favour recovery over a possible bootloop.
                        let _ = reboot(RebootTarget::Recovery);
                    }
                }
            }
            Err(e) => tracing::error!("Failed to load fstab: {e:#}"),
        }
    }

    teardown(&mut gate);
    hand_off()
}

/// The minimum the real init expects, plus `/dev/kmsg` for our own
/// logging.  Runs before tracing exists, so failures go unreported.
fn early_mounts() {
    for dir in ["/dev", "/proc", "/sys"] {
        let _ = std::fs::create_dir(dir);
    }
    let _ = rustix::mount::mount("tmpfs", "/dev", "tmpfs", MountFlags::NOSUID, "mode=0755");
    // These live on the tmpfs, so only after the mount.
    let _ = std::fs::create_dir("/dev/pts");
    let _ = std::fs::create_dir("/dev/socket");
    let _ = rustix::mount::mount("devpts", "/dev/pts", "devpts", MountFlags::empty(), "");
    let _ = rustix::mount::mount("proc", "/proc", "proc", MountFlags::empty(), "");
    let _ = rustix::mount::mount("sysfs", "/sys", "sysfs", MountFlags::empty(), "");
    let _ = rustix::mount::mount(
        "pstore",
        "/sys/fs/pstore",
        "pstore",
        MountFlags::empty(),
        "",
    );
    let _ = std::fs::create_dir("/sys/kernel/debug");
    let _ = rustix::mount::mount(
        "debugfs",
        "/sys/kernel/debug",
        "debugfs",
        MountFlags::empty(),
        "",
    );
    mknod_chr("/dev/kmsg", 1, 11);
    mknod_chr("/dev/null", 1, 3);
}

fn mknod_chr(path: &str, major: u64, minor: u64) {
    let _ = nix::sys::stat::mknod(
        path,
        nix::sys::stat::SFlag::S_IFCHR,
        nix::sys::stat::Mode::from_bits_truncate(0o600),
        nix::sys::stat::makedev(major, minor),
    );
}

fn is_charger_mode() -> bool {
    std::fs::read_to_string("/proc/cmdline")
        .map(|c| find_cmdline_value(&c, "androidboot.mode") == Some("charger"))
        .unwrap_or(false)
}

/// Populate `/dev` from sysfs: block devices under `/dev/block`, the
/// framebuffer and input nodes where Android expects them.  A fraction
/// of ueventd, enough for the selection environment.
#[context("Populating /dev from sysfs")]
fn init_devices() -> Result<()> {
    for dir in ["/dev/block", "/dev/graphics", "/dev/input"] {
        std::fs::create_dir_all(dir)?;
    }
    scan_class("/sys/class/block", "/dev/block", nix::sys::stat::SFlag::S_IFBLK);
    scan_class(
        "/sys/class/graphics",
        "/dev/graphics",
        nix::sys::stat::SFlag::S_IFCHR,
    );
    scan_class(
        "/sys/class/input",
        "/dev/input",
        nix::sys::stat::SFlag::S_IFCHR,
    );
    Ok(())
}

fn scan_class(sys_dir: &str, dev_dir: &str, kind: nix::sys::stat::SFlag) {
    let Ok(entries) = std::fs::read_dir(sys_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((major, minor)) = read_devnum(&format!("{sys_dir}/{name}/dev")) else {
            continue;
        };
        let node = format!("{dev_dir}/{name}");
        let _ = nix::sys::stat::mknod(
            node.as_str(),
            kind,
            nix::sys::stat::Mode::from_bits_truncate(0o600),
            nix::sys::stat::makedev(major, minor),
        );
    }
}

/// Parse a sysfs `dev` file (`MAJOR:MINOR`).
fn read_devnum(path: &str) -> Option<(u64, u64)> {
    let content = std::fs::read_to_string(path).ok()?;
    let (major, minor) = content.trim().split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Mount `/realdata` (decrypting if necessary), find the MultiROM data
/// directory and run the selection process.
fn boot_multirom(
    device: &DeviceConfig,
    fstab: &mut Fstab,
    gate: &mut EncryptionGate,
) -> Result<()> {
    if let Err(e) = wait_for_file(Utf8Path::new(FB_DEV), Duration::from_secs(5)) {
        tracing::error!("Waiting too long for fb0: {e:#}");
        return Ok(());
    }

    match mount_realdata(fstab, gate)? {
        RealdataOutcome::Mounted => {}
        RealdataOutcome::BootInternal => return Ok(()),
    }

    let paths = Paths::discover(device.clone()).context("Could not find multirom folder!")?;

    let status = Status::load(&paths.status_file()).unwrap_or_default();
    let adb = status.enable_adb.then(|| AdbSupervisor::start(&paths));

    let res = run_multirom(&paths);
    drop(adb);

    if let Err(e) = res {
        let _ = klog::dump_kernel_log(&paths.error_log());
        return Err(e);
    }
    Ok(())
}

enum RealdataOutcome {
    Mounted,
    /// The user declined decryption; boot the primary without /realdata.
    BootInternal,
}

#[context("Mounting {REALDATA}")]
fn mount_realdata(fstab: &mut Fstab, gate: &mut EncryptionGate) -> Result<RealdataOutcome> {
    let data = fstab
        .first_by_path("/data")
        .ok_or_else(|| anyhow!("failed to find /data partition in fstab"))?
        .clone();

    if !Utf8Path::new(&data.device).exists() {
        tracing::info!("Waiting for {}", data.device);
        wait_for_file(Utf8Path::new(&data.device), Duration::from_secs(5))
            .with_context(|| format!("waiting too long for dev {}", data.device))?;
    }

    let _ = std::fs::create_dir(REALDATA);

    if try_mount_data_entries(fstab).is_err() {
        tracing::info!("Failed to mount /data, trying encryption...");
        match gate.before_mount(fstab) {
            Ok(Unlock::BootInternal) => return Ok(RealdataOutcome::BootInternal),
            Ok(Unlock::BootRecovery) => {
                rustix::fs::sync();
                let _ = reboot(RebootTarget::Recovery);
                unreachable!("reboot returned");
            }
            Ok(Unlock::Decrypted(_)) => {
                try_mount_data_entries(fstab)
                    .context("failed to mount decrypted /data with all possible filesystems")?;
            }
            Err(e) => return Err(e).context("/data decryption failed"),
        }
    }
    Ok(RealdataOutcome::Mounted)
}

fn mount_one_data_entry(entry: &FstabEntry) -> Result<()> {
    // Remove nosuid, because secondary ROMs have su binaries on /data.
    let flags = entry.mountflags & !MountFlags::NOSUID;
    mount::mount(
        &entry.device,
        Utf8Path::new(REALDATA),
        &entry.fstype,
        flags,
        entry.options.as_deref().unwrap_or(""),
    )
}

/// Try every /data row from the fstab, then walk the fallback ladder on
/// the first row's device.
fn try_mount_data_entries(fstab: &Fstab) -> Result<()> {
    let entries: Vec<&FstabEntry> = fstab.entries_by_path("/data").collect();
    for entry in &entries {
        if mount_one_data_entry(entry).is_ok() {
            return Ok(());
        }
    }
    tracing::error!("Failed to mount /realdata with data from fstab, trying all filesystems");

    let first = entries
        .first()
        .ok_or_else(|| anyhow!("no /data entry in fstab"))?;
    for (fs, opts) in DATA_FS_FALLBACKS {
        if mount::mount(
            &first.device,
            Utf8Path::new(REALDATA),
            fs,
            first.mountflags & !MountFlags::NOSUID,
            opts,
        )
        .is_ok()
        {
            tracing::info!("{REALDATA} successfully mounted with fs {fs}");
            return Ok(());
        }
    }
    Err(anyhow!("failed to mount /data with all possible filesystems"))
}

/// Spawn the selection process, restarting after crashes when the
/// marker file asks for it.
fn run_multirom(paths: &Paths) -> Result<()> {
    let bin = paths.helper("multirom");
    if !bin.exists() {
        return Err(anyhow!("could not find multirom: {bin}"));
    }
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755))?;

    let restart_after_crash = paths.mrom.join("restart_after_crash").exists();
    loop {
        tracing::info!("Running multirom");
        match Task::new("multirom", &bin).run() {
            Ok(()) => return Ok(()),
            Err(e) if restart_after_crash => {
                tracing::error!("MultiROM crashed, restarting: {e:#}");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Second-boot heuristic for the fatal path, before any status exists.
fn looks_like_second_boot(fstab: &Fstab) -> bool {
    if klog::last_kmsg_contains(SECOND_BOOT_SENTINEL) {
        return true;
    }
    fstab
        .first_by_path("/boot")
        .map(|b| {
            nokexec::is_secondary_in_primary(Utf8Path::new(&b.device)).unwrap_or(false)
        })
        .unwrap_or(false)
}

/// Undo every pseudo-filesystem mount, except what the chosen ROM needs
/// to keep.
fn teardown(gate: &mut EncryptionGate) {
    let _ = mount::unmount(Utf8Path::new("/dev/pts"));
    let _ = std::fs::remove_dir("/dev/pts");
    let _ = std::fs::remove_dir("/dev/socket");

    if !Utf8Path::new(KEEP_REALDATA).exists() {
        let _ = mount::unmount(Utf8Path::new(REALDATA));
        let _ = mount::unmount(Utf8Path::new("/dev"));
        let _ = std::fs::remove_dir(REALDATA);
        gate.destroy();
    }
    gate.cleanup();

    let _ = mount::unmount(Utf8Path::new("/sys/kernel/debug"));
    let _ = mount::unmount(Utf8Path::new("/proc"));
    let _ = mount::unmount(Utf8Path::new("/sys/fs/pstore"));
    let _ = mount::unmount(Utf8Path::new("/sys"));
}

/// Replace ourselves with the saved real init.  Only returns on exec
/// failure.
fn hand_off() -> Result<()> {
    tracing::info!("Running main_init");
    fixup_init_symlinks();

    use std::os::unix::fs::PermissionsExt;
    let main_init = Utf8Path::new("/main_init");
    if !main_init.exists() {
        return Err(anyhow!("/main_init is missing, nothing to exec"));
    }
    std::fs::set_permissions(main_init, std::fs::Permissions::from_mode(0o755))?;
    std::fs::rename(main_init, "/init").context("Renaming /main_init to /init")?;

    let init = CString::new("/init")?;
    let err = nix::unistd::execv(&init, &[init.as_c_str()])
        .expect_err("execv returned without error");
    Err(anyhow!("execve /init failed: {err}"))
}

/// ueventd/watchdogd must point at the real init again; the injector
/// (or an older one) may have left them at something else.
fn fixup_init_symlinks() {
    for link in ["/sbin/ueventd", "/sbin/watchdogd"] {
        let Ok(meta) = std::fs::symlink_metadata(link) else {
            continue;
        };
        if !meta.is_symlink() {
            continue;
        }
        if let Ok(target) = std::fs::read_link(link) {
            if target.to_str() == Some("../init") {
                continue;
            }
            tracing::error!("Fixing up symlink {link} -> ../init");
            let _ = std::fs::remove_file(link);
            let _ = std::os::unix::fs::symlink("../init", link);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_devnum() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("dev");
        std::fs::write(&path, "179:32\n").unwrap();
        assert_eq!(read_devnum(path.to_str().unwrap()), Some((179, 32)));
        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(read_devnum(path.to_str().unwrap()), None);
        assert_eq!(read_devnum("/nonexistent/dev"), None);
    }
}
