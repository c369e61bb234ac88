//! # MultiROM command line surface
//!
//! Frontends for the three executables: `multirom` (the selection
//! engine), `trampoline` (PID 1 / ramdisk injector) and `kernel_inject`.

use std::ffi::{CString, OsString};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;

use crate::inject::{inject_kernel, Injector};
use crate::mount::remount_root;
use crate::paths::{DeviceConfig, Paths, KEEP_REALDATA};
use crate::reboot::{reboot, RebootTarget};
use crate::selection::{self, ExitFlags, HeadlessUi, RunMode};
use crate::trampoline;
use crate::version::{VERSION_APKL, VERSION_DEV_FIX, VERSION_MULTIROM, VERSION_TRAMPOLINE};

/// The boot manager process, spawned by the trampoline (or invoked from
/// a running Android for `-apkL` / `--boot-rom`).
#[derive(Debug, Parser)]
#[command(name = "multirom", disable_version_flag = true)]
struct MultiromOpts {
    /// Print version information and exit.
    #[arg(short = 'v')]
    version: bool,

    /// List installed ROMs for the MultiROM Manager app and exit.
    /// External partitions stay mounted under /mnt so the app can reach
    /// them.
    #[arg(long = "apkL")]
    apk_list: bool,

    /// Boot this ROM immediately, skipping UI and auto-boot.
    #[arg(long = "boot-rom", value_name = "NAME")]
    boot_rom: Option<String>,
}

/// The historical flags predate this parser; keep their single-dash
/// spellings working.
fn normalize_legacy_args(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    args.into_iter()
        .map(|a| if a == "-apkL" { OsString::from("--apkL") } else { a })
        .collect()
}

pub fn run_multirom_from_iter(args: impl IntoIterator<Item = OsString>) -> Result<()> {
    let opts = MultiromOpts::parse_from(normalize_legacy_args(args));

    if opts.version {
        println!("{VERSION_MULTIROM}{VERSION_DEV_FIX}\napkL{VERSION_APKL}");
        return Ok(());
    }

    let device = DeviceConfig::detect();

    if opts.apk_list {
        let paths = Paths::discover(device)?;
        print!("{}", selection::list_roms_for_apk(&paths)?);
        return Ok(());
    }

    tracing::info!("Running MultiROM v{VERSION_MULTIROM}{VERSION_DEV_FIX}");

    // When invoked from a running Android the root filesystem is
    // read-only, and we stage temp files on it.
    let forced = opts.boot_rom.is_some();
    if forced {
        if let Err(e) = remount_root(false) {
            tracing::warn!("Could not remount / read-write: {e:#}");
        }
    }

    let mode = match opts.boot_rom {
        Some(name) => RunMode::BootRom(name),
        None => RunMode::Normal,
    };
    let paths = Arc::new(Paths::discover(device)?);
    let exit = selection::run(paths, mode, &mut HeadlessUi)?;

    if forced {
        let _ = remount_root(true);
    }

    act_on_exit(exit)
}

/// Translate the engine's exit flags into process-level actions.  KEXEC
/// comes first; the reboot family never returns.
fn act_on_exit(exit: ExitFlags) -> Result<()> {
    tracing::info!("Exiting with flags {exit:?}");
    if exit.contains(ExitFlags::KEXEC) {
        do_kexec()?;
    }
    if exit.contains(ExitFlags::REBOOT_RECOVERY) {
        reboot(RebootTarget::Recovery)?;
    } else if exit.contains(ExitFlags::REBOOT_BOOTLOADER) {
        reboot(RebootTarget::Bootloader)?;
    } else if exit.contains(ExitFlags::SHUTDOWN) {
        reboot(RebootTarget::Shutdown)?;
    } else if exit.contains(ExitFlags::REBOOT) {
        reboot(RebootTarget::System)?;
    }

    // Returning to the trampoline: tell it whether /realdata must stay.
    if !exit.contains(ExitFlags::UMOUNT) {
        std::fs::File::create(KEEP_REALDATA).context("Creating keep-realdata sentinel")?;
    }
    Ok(())
}

/// Jump into the loaded kernel.  Only returns on error.
fn do_kexec() -> Result<()> {
    rustix::fs::sync();
    let kexec = CString::new("/kexec")?;
    let arg = CString::new("-e")?;
    let err = nix::unistd::execv(&kexec, &[kexec.as_c_str(), arg.as_c_str()])
        .expect_err("execv returned without error");
    anyhow::bail!("kexec -e failed: {err}")
}

/// The replacement /init.  With `--inject` it only refreshes a boot
/// image and exits; without arguments it is PID 1.
#[derive(Debug, Parser)]
#[command(name = "trampoline", disable_version_flag = true)]
struct TrampolineOpts {
    /// Print the trampoline version and exit.
    #[arg(short = 'v')]
    version: bool,

    /// Inject the trampoline into this boot image and exit.
    #[arg(long, value_name = "BOOT_IMG")]
    inject: Option<Utf8PathBuf>,

    /// MultiROM data directory holding the trampoline binary and its
    /// support files.
    #[arg(long = "mrom_dir", value_name = "DIR")]
    mrom_dir: Option<Utf8PathBuf>,

    /// Inject even when the image reports it is up to date.
    #[arg(short = 'f')]
    force: bool,
}

pub fn run_trampoline_from_iter(args: impl IntoIterator<Item = OsString>) -> Result<()> {
    let opts = TrampolineOpts::parse_from(args);

    if opts.version {
        println!("{VERSION_TRAMPOLINE}");
        return Ok(());
    }

    if let Some(img) = opts.inject {
        multirom_utils::initialize_tracing("trampoline_inject");
        let mrom = opts
            .mrom_dir
            .context("--mrom_dir=[path to multirom's data dir] needs to be specified!")?;
        let paths = Paths::with_base(mrom, DeviceConfig::detect());
        Injector::new(&paths, opts.force).inject_boot_image(&img)?;
        return Ok(());
    }

    trampoline::run()
}

/// Replace the kernel inside a boot image.
#[derive(Debug, Parser)]
#[command(name = "kernel_inject")]
struct KernelInjectOpts {
    /// Boot image to patch.
    #[arg(long, value_name = "BOOT_IMG")]
    inject: Utf8PathBuf,

    /// The new kernel (zImage).
    #[arg(long, value_name = "ZIMAGE")]
    kernel: Utf8PathBuf,
}

pub fn run_kernel_inject_from_iter(args: impl IntoIterator<Item = OsString>) -> Result<()> {
    let opts = KernelInjectOpts::parse_from(args);
    inject_kernel(&opts.inject, &opts.kernel)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn osargs(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_multirom_legacy_flags() {
        let opts = MultiromOpts::parse_from(normalize_legacy_args(osargs(&["multirom", "-apkL"])));
        assert!(opts.apk_list);
        assert!(!opts.version);

        let opts = MultiromOpts::parse_from(normalize_legacy_args(osargs(&["multirom", "-v"])));
        assert!(opts.version);

        let opts = MultiromOpts::parse_from(normalize_legacy_args(osargs(&[
            "multirom",
            "--boot-rom=Ubuntu",
        ])));
        assert_eq!(opts.boot_rom.as_deref(), Some("Ubuntu"));
    }

    #[test]
    fn test_trampoline_flags() {
        let opts = TrampolineOpts::parse_from(osargs(&[
            "trampoline",
            "--inject=/tmp/boot.img",
            "--mrom_dir=/data/media/0/multirom",
            "-f",
        ]));
        assert_eq!(opts.inject.as_deref(), Some(camino::Utf8Path::new("/tmp/boot.img")));
        assert_eq!(
            opts.mrom_dir.as_deref(),
            Some(camino::Utf8Path::new("/data/media/0/multirom"))
        );
        assert!(opts.force);

        let opts = TrampolineOpts::parse_from(osargs(&["trampoline", "-v"]));
        assert!(opts.version);
    }

    #[test]
    fn test_kernel_inject_flags() {
        let opts = KernelInjectOpts::parse_from(osargs(&[
            "kernel_inject",
            "--inject=/tmp/boot.img",
            "--kernel=/tmp/zImage",
        ]));
        assert_eq!(opts.inject, Utf8PathBuf::from("/tmp/boot.img"));
        assert_eq!(opts.kernel, Utf8PathBuf::from("/tmp/zImage"));
    }
}
