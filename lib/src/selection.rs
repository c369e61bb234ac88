//! The selection engine: discover installed systems, decide what to
//! boot (forced ROM, second-boot continuation, auto-boot or UI verdict),
//! run the right stager and tell the caller how to leave.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use multirom_bootimg::BootImage;

use crate::android;
use crate::fstab::Fstab;
use crate::inject::{self, Injector};
use crate::kexec::{self, KexecLoad};
use crate::klog;
use crate::linux;
use crate::nokexec::{self, BootMethod, NoKexec};
use crate::partitions::{Partition, PartitionSet};
use crate::paths::{Paths, REALDATA};
use crate::quirks;
use crate::rom::{self, Rom, RomKind};
use crate::status::{AutoBootMode, Status};
use crate::task::Task;
use crate::version::SECOND_BOOT_SENTINEL;
use crate::workers::{countdown, UsbRefresh, Workers};

/// What the main process should do after the engine returns.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitFlags(u32);

impl ExitFlags {
    pub(crate) const NONE: Self = Self(0);
    pub(crate) const REBOOT: Self = Self(1 << 0);
    pub(crate) const REBOOT_RECOVERY: Self = Self(1 << 1);
    pub(crate) const REBOOT_BOOTLOADER: Self = Self(1 << 2);
    pub(crate) const SHUTDOWN: Self = Self(1 << 3);
    /// Exec `/kexec -e` after teardown.
    pub(crate) const KEXEC: Self = Self(1 << 4);
    /// Unmount `/realdata` before handing over.
    pub(crate) const UMOUNT: Self = Self(1 << 5);

    pub(crate) fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub(crate) fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for ExitFlags {
    type Output = Self;
    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::fmt::Debug for ExitFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Self::REBOOT, "REBOOT"),
            (Self::REBOOT_RECOVERY, "REBOOT_RECOVERY"),
            (Self::REBOOT_BOOTLOADER, "REBOOT_BOOTLOADER"),
            (Self::SHUTDOWN, "SHUTDOWN"),
            (Self::KEXEC, "KEXEC"),
            (Self::UMOUNT, "UMOUNT"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// The five ways the selection UI can come back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum UiVerdict {
    BootRom(u32),
    Reboot,
    RebootRecovery,
    RebootBootloader,
    Shutdown,
}

pub(crate) struct UiContext<'a> {
    pub(crate) roms: &'a [Rom],
    pub(crate) status: &'a Status,
    pub(crate) workers: &'a Workers,
    #[allow(dead_code)]
    pub(crate) partitions: &'a Mutex<PartitionSet>,
}

/// Boundary to the replaceable selection UI.  The engine only depends on
/// getting one of the five verdicts back.
pub(crate) trait SelectionUi {
    fn select(&mut self, ctx: &UiContext<'_>) -> Result<UiVerdict>;
}

/// UI-less selection: wait out the auto-boot countdown, then boot the
/// configured target.
pub(crate) struct HeadlessUi;

impl SelectionUi for HeadlessUi {
    fn select(&mut self, ctx: &UiContext<'_>) -> Result<UiVerdict> {
        let target = match ctx.status.auto_boot_mode {
            AutoBootMode::Last => rom::find_rom(
                ctx.roms,
                &ctx.status.current_rom,
                ctx.status.curr_rom_part.as_deref(),
            ),
            AutoBootMode::Name => rom::find_rom(ctx.roms, &ctx.status.auto_boot_rom, None),
        };
        let target = target
            .or_else(|| rom::internal_rom(ctx.roms))
            .ok_or_else(|| anyhow!("no ROM to auto-boot"))?;

        tracing::info!(
            "Auto-booting {} in {}s",
            target.name,
            ctx.status.auto_boot_seconds
        );
        let cancel = Arc::new(AtomicBool::new(false));
        countdown(ctx.workers, ctx.status.auto_boot_seconds, &cancel);
        Ok(UiVerdict::BootRom(target.id))
    }
}

pub(crate) enum RunMode {
    Normal,
    /// `--boot-rom=<name>`.
    BootRom(String),
}

pub(crate) struct Multirom {
    paths: Arc<Paths>,
    pub(crate) status: Status,
    fstab: Fstab,
    roms: Vec<Rom>,
    parts: Arc<Mutex<PartitionSet>>,
    /// Stable for the life of the process.
    second_boot: bool,
}

impl Multirom {
    #[context("Loading MultiROM state")]
    pub(crate) fn load(paths: Arc<Paths>) -> Result<Self> {
        tracing::info!("Loading MultiROM status...");
        let fstab = Fstab::auto_load(Utf8Path::new("/"), &paths.device.target_device)?;
        let mut roms = rom::scan_internal(&paths)?;
        let status = Status::load(&paths.status_file())?;

        let second_boot = status.is_second_boot
            || klog::last_kmsg_contains(SECOND_BOOT_SENTINEL)
            || nokexec::second_boot_from_tag(&paths, Some(&fstab));

        let parts = Arc::new(Mutex::new(PartitionSet::default()));

        // If we are coming back from a USB ROM the drive may need a
        // moment to show up again.
        if second_boot {
            if let Some(uuid) = status.curr_rom_part.clone() {
                for tries in 0..10 {
                    {
                        let mut set = parts.lock().unwrap();
                        if let Err(e) = set.refresh(&paths) {
                            tracing::warn!("partition refresh failed: {e:#}");
                        }
                        if let Some(p) = set.by_uuid(&uuid).cloned() {
                            drop(set);
                            roms.extend(rom::scan_partition(&paths, &p)?);
                            break;
                        }
                    }
                    tracing::error!("part {uuid} not found, waiting 1s ({tries})");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }

        let mut this = Self {
            paths,
            status,
            fstab,
            roms,
            parts,
            second_boot,
        };
        this.resolve_status_roms()?;
        Ok(this)
    }

    /// Turn the persisted names back into ROM references, falling back to
    /// the internal slot when the stored one is gone.
    fn resolve_status_roms(&mut self) -> Result<()> {
        let current = rom::find_rom(
            &self.roms,
            &self.status.current_rom,
            self.status.curr_rom_part.as_deref(),
        );
        match current {
            Some(rom) => {
                self.status.current_rom = rom.name.clone();
            }
            None => {
                tracing::error!(
                    "Failed to select current rom ({}, part {:?}), using Internal!",
                    self.status.current_rom,
                    self.status.curr_rom_part
                );
                let internal = rom::internal_rom(&self.roms)
                    .ok_or_else(|| anyhow!("no internal rom found"))?;
                self.status.current_rom = internal.name.clone();
                self.status.curr_rom_part = None;
            }
        }

        if rom::find_rom(&self.roms, &self.status.auto_boot_rom, None).is_none() {
            tracing::error!(
                "Could not find rom {} to auto-boot",
                self.status.auto_boot_rom
            );
            self.status.auto_boot_mode = AutoBootMode::Last;
        }

        // The default slot can carry a user-visible display name.
        if let Some(name) = self.status.int_display_name.clone() {
            if let Some(internal) = self.roms.iter_mut().find(|r| r.is_default()) {
                if self.status.current_rom == internal.name {
                    self.status.current_rom = name.clone();
                }
                internal.name = name;
            }
        }
        Ok(())
    }

    fn rom_by_id(&self, id: u32) -> Option<&Rom> {
        self.roms.iter().find(|r| r.id == id)
    }

    fn partition_of(&self, rom: &Rom) -> Option<Partition> {
        let uuid = rom.partition_uuid.as_deref()?;
        self.parts.lock().unwrap().by_uuid(uuid).cloned()
    }

    /// Everything that happens once a ROM is chosen.  Returns the exit
    /// flags; a failure here must abort the boot.
    #[context("Preparing to boot {name}", name = rom.name)]
    fn prepare_for_boot(&mut self, rom: &Rom) -> Result<ExitFlags> {
        let mut exit = ExitFlags::UMOUNT;

        if (rom.kind.wants_kexec() || rom.has_bootimg) && !rom.is_default() && !self.second_boot {
            let method = nokexec::select_boot_method(
                self.status.no_kexec,
                kexec::has_kexec(&self.paths),
            )?;
            match method {
                BootMethod::Kexec => {
                    self.load_kexec(rom)?;
                    exit = ExitFlags::REBOOT | ExitFlags::KEXEC;
                }
                BootMethod::NoKexec => {
                    if rom.kind.wants_kexec() {
                        return Err(anyhow!(
                            "Linux ROMs need kexec-hardboot; the boot image swap cannot enter them"
                        ));
                    }
                    NoKexec::new(&self.paths, Some(&self.fstab))?.flash_secondary(rom)?;
                    return Ok(ExitFlags::REBOOT | ExitFlags::UMOUNT);
                }
            }
        }

        match rom.kind {
            RomKind::DefaultInternal | RomKind::LinuxInternal | RomKind::LinuxUsb => {}
            RomKind::AndroidInternal | RomKind::AndroidUsbDir | RomKind::AndroidUsbImg => {
                if !exit.intersects(ExitFlags::REBOOT | ExitFlags::KEXEC) {
                    // Handing straight over to this ROM's init: the bind
                    // mounts need /realdata to stay.
                    exit.remove(ExitFlags::UMOUNT);
                    self.stage_android(rom)?;
                }
                if let Some(uuid) = &rom.partition_uuid {
                    self.parts.lock().unwrap().mark_keep_mounted(uuid);
                }
            }
            RomKind::UnsupportedInt | RomKind::UnsupportedUsb | RomKind::Unknown => {
                return Err(anyhow!("unsupported ROM type {:?}", rom.kind));
            }
        }
        Ok(exit)
    }

    fn stage_android(&mut self, rom: &Rom) -> Result<()> {
        let root = Utf8Path::new("/");
        android::prep_android_mounts(&self.paths, rom, root)?;

        let api_level = android::get_api_level(&root.join("system/build.prop"))?;
        android::create_media_link(Utf8Path::new(REALDATA), &root.join("data"), api_level)?;

        quirks::on_initrd_finalized(root)?;
        match nokexec::find_boot_blockdev(&self.paths, Some(&self.fstab)) {
            Ok(boot_dev) => quirks::patch_build_prop(&boot_dev, rom, false, root)?,
            Err(e) => tracing::warn!("Skipping build.prop patch: {e:#}"),
        }

        // If we got here through the boot-image swap, put the primary
        // back before its init runs.
        if self.second_boot {
            match NoKexec::new(&self.paths, Some(&self.fstab)) {
                Ok(nk) => {
                    if let Err(e) = nk.restore_primary_and_cleanup() {
                        tracing::error!("Failed to restore primary boot image: {e:#}");
                    }
                }
                Err(e) => tracing::warn!("No-kexec restore skipped: {e:#}"),
            }
        }
        Ok(())
    }

    #[context("Loading kexec for {name}", name = rom.name)]
    fn load_kexec(&mut self, rom: &Rom) -> Result<()> {
        let mut loop_mounted = false;
        let boot = match rom.kind {
            RomKind::AndroidInternal | RomKind::AndroidUsbDir | RomKind::AndroidUsbImg => {
                self.fill_kexec_android(rom)?
            }
            RomKind::LinuxInternal | RomKind::LinuxUsb => {
                let part = self.partition_of(rom);
                let bl_cmdline = kexec::bootloader_cmdline(&self.paths, Some(&self.fstab))?;
                let staged =
                    linux::stage_linux(rom, part.as_ref(), Some(&self.fstab), bl_cmdline)?;
                loop_mounted = staged.loop_mounted;
                staged.load
            }
            other => return Err(anyhow!("unsupported rom type to kexec ({other:?})")),
        };

        let res = kexec::load(&self.paths, &boot);
        if loop_mounted {
            let _ = crate::mount::unmount(Utf8Path::new("/mnt/image"));
        }
        // Keep a log trail around; kexec wipes the ring buffer.
        let _ = klog::dump_kernel_log(&self.paths.error_log());
        res
    }

    /// Extract kernel and initrd from the ROM's boot image and build the
    /// command line.  Stale trampolines inside the image are refreshed
    /// first; recovery stamps the version into the header for us.
    fn fill_kexec_android(&self, rom: &Rom) -> Result<KexecLoad> {
        let img_path = rom.bootimg_path();
        if !inject::is_up_to_date(&img_path)? {
            Injector::new(&self.paths, false)
                .inject_boot_image(&img_path)
                .context("Updating trampoline in ROM boot image")?;
        }

        let img = BootImage::load(&img_path)
            .map_err(|e| anyhow!("could not open boot image ({img_path}): {e}"))?;
        img.dump_kernel("/zImage")
            .map_err(|e| anyhow!("failed to dump kernel: {e}"))?;
        img.dump_ramdisk("/initrd.img")
            .map_err(|e| anyhow!("failed to dump ramdisk: {e}"))?;

        let bl_cmdline = kexec::bootloader_cmdline(&self.paths, Some(&self.fstab))?;
        let img_cmdline = img.header.cmdline();
        // Mirror the bootloader's own mangling of the image cmdline.
        let strip = self.paths.device.cmdline_strip.min(img_cmdline.len());
        let cmdline = kexec::android_kexec_cmdline(&img_cmdline[strip..], &bl_cmdline);

        Ok(KexecLoad {
            kernel: "/zImage".into(),
            initrd: Some("/initrd.img".into()),
            cmdline,
        })
    }

    /// `<base>/run-on-boot/*.sh`, each invoked with the busybox path and
    /// the ROM base.
    fn run_boot_scripts(&self, rom: &Rom) {
        let dir = rom.base_path.join("run-on-boot");
        if !dir.is_dir() {
            tracing::info!("No run-on-boot scripts for ROM {}", rom.name);
            return;
        }
        tracing::info!("Running run-on-boot scripts for ROM {}...", rom.name);
        let bb = self.paths.busybox();
        let script = format!(
            "B=\"{bb}\"; P=\"{base}\"; for x in $(\"$B\" ls \"$P/run-on-boot/\"*.sh); do \
             echo Running script $x; \"$B\" sh $x \"$B\" \"$P\" || exit 1; done",
            base = rom.base_path
        );
        if let Err(e) = Task::new("run-on-boot scripts", &bb)
            .args(["sh", "-c", &script])
            .run()
        {
            tracing::error!("Error running scripts: {e:#}");
        }
    }
}

/// Dump the kernel log where the user can find it; the UI half of the
/// emergency screen lives with the UI.
pub(crate) fn emergency_dump(paths: &Paths) {
    tracing::error!("An error occured, dumping kernel log to {}", paths.error_log());
    if let Err(e) = klog::dump_kernel_log(&paths.error_log()) {
        tracing::error!("Could not dump kernel log: {e:#}");
    }
}

/// The whole selection pass.  Returns the exit flags the main process
/// acts on.
pub(crate) fn run(
    paths: Arc<Paths>,
    mode: RunMode,
    ui: &mut dyn SelectionUi,
) -> Result<ExitFlags> {
    let mut m = Multirom::load(paths.clone())?;
    m.status.dump();

    let mut exit = ExitFlags::REBOOT | ExitFlags::UMOUNT;
    let mut to_boot: Option<u32> = None;

    match &mode {
        RunMode::BootRom(name) => match rom::find_rom(&m.roms, name, None) {
            Some(rom)
                if (rom.kind.wants_kexec() || rom.has_bootimg)
                    && !rom.is_default()
                    && kexec::has_kexec(&paths) =>
            {
                // This kernel can kexec straight into the target.
                tracing::info!("Booting ROM {name}...");
                to_boot = Some(rom.id);
                m.second_boot = false;
            }
            Some(rom) => {
                // No direct path; latch the choice and reboot into it.
                tracing::info!("Setting ROM {name} to force autoboot");
                m.status.current_rom = rom.name.clone();
                m.status.curr_rom_part = rom.partition_uuid.clone();
                m.status.force_current = true;
            }
            None => {
                tracing::error!("ROM {name} was not found, force autoboot was not set!");
                exit = ExitFlags::UMOUNT;
            }
        },
        RunMode::Normal if m.second_boot || m.status.force_current => {
            tracing::info!(
                "Skipping ROM selection, second_boot={}, force_current={}",
                m.second_boot,
                m.status.force_current
            );
            to_boot = rom::find_rom(
                &m.roms,
                &m.status.current_rom,
                m.status.curr_rom_part.as_deref(),
            )
            .map(|r| r.id);
        }
        RunMode::Normal => {
            // Cache the probe so the UI doesn't stall on it later.
            kexec::has_kexec(&paths);

            let workers = Workers::start();
            let _usb_refresh = UsbRefresh::start(
                paths.clone(),
                m.parts.clone(),
                Box::new(|| tracing::debug!("partition list changed")),
            );
            let verdict = {
                let ctx = UiContext {
                    roms: &m.roms,
                    status: &m.status,
                    workers: &workers,
                    partitions: &m.parts,
                };
                ui.select(&ctx)?
            };
            match verdict {
                UiVerdict::BootRom(id) => to_boot = Some(id),
                UiVerdict::Reboot => exit = ExitFlags::REBOOT | ExitFlags::UMOUNT,
                UiVerdict::RebootRecovery => {
                    exit = ExitFlags::REBOOT_RECOVERY | ExitFlags::UMOUNT
                }
                UiVerdict::RebootBootloader => {
                    exit = ExitFlags::REBOOT_BOOTLOADER | ExitFlags::UMOUNT
                }
                UiVerdict::Shutdown => exit = ExitFlags::SHUTDOWN | ExitFlags::UMOUNT,
            }
        }
    }

    if let Some(id) = to_boot {
        let rom = m
            .rom_by_id(id)
            .cloned()
            .ok_or_else(|| anyhow!("selected ROM disappeared"))?;
        m.status.force_current = false;

        if matches!(mode, RunMode::Normal) {
            m.run_boot_scripts(&rom);
        }

        match m.prepare_for_boot(&rom) {
            Ok(flags) => {
                exit = flags;
                m.status.current_rom = rom.name.clone();
                m.status.curr_rom_part = rom.partition_uuid.clone();

                if !m.second_boot && rom.kind.is_android() && exit.contains(ExitFlags::KEXEC) {
                    m.status.is_second_boot = true;
                    // The mrom_kexecd= param may get lost if the kernel
                    // lacks the kexec patches; the ring buffer line is the
                    // belt to that suspender.
                    tracing::error!("{SECOND_BOOT_SENTINEL}");
                } else {
                    m.status.is_second_boot = false;
                }
            }
            Err(e) => {
                tracing::error!("Failed to prepare boot: {e:#}");
                match mode {
                    RunMode::Normal => {
                        emergency_dump(&paths);
                        exit = ExitFlags::REBOOT;
                    }
                    RunMode::BootRom(_) => exit = ExitFlags::UMOUNT,
                }
            }
        }
    }

    m.status.save(&paths.status_file())?;
    rustix::fs::sync();
    Ok(exit)
}

/// `multirom -apkL`: one line per installed ROM for the manager app.
/// External partitions end up mounted under /mnt and stay mounted so the
/// app can reach them.
#[context("Listing ROMs")]
pub(crate) fn list_roms_for_apk(paths: &Paths) -> Result<String> {
    let mut roms = rom::scan_internal(paths)?;
    let mut parts = PartitionSet::default();
    if let Err(e) = parts.refresh(paths) {
        tracing::warn!("partition scan failed: {e:#}");
    }
    for part in parts.iter() {
        roms.extend(rom::scan_partition(paths, part)?);
    }
    rom::sort_roms(&mut roms);

    let mut out = String::new();
    for rom in &roms {
        let part = rom
            .partition_uuid
            .as_deref()
            .and_then(|uuid| parts.by_uuid(uuid));
        match part {
            None => out.push_str(&format!(
                "ROM: name={} base={} icon={}\n",
                rom.name,
                rom.base_path,
                rom.icon_path()
            )),
            Some(p) => out.push_str(&format!(
                "ROM: name={} base={} icon={} part_name={} part_mount={} part_uuid={} part_fs={}\n",
                rom.name,
                rom.base_path,
                rom.icon_path(),
                p.name,
                p.mount_path,
                p.uuid,
                p.fs
            )),
        }
    }
    // The app needs the mounts; nothing here unmounts them.
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_flags() {
        let mut flags = ExitFlags::REBOOT | ExitFlags::UMOUNT;
        assert!(flags.contains(ExitFlags::REBOOT));
        assert!(flags.contains(ExitFlags::UMOUNT));
        assert!(!flags.contains(ExitFlags::KEXEC));
        assert!(flags.intersects(ExitFlags::REBOOT | ExitFlags::KEXEC));

        flags.remove(ExitFlags::UMOUNT);
        assert!(!flags.contains(ExitFlags::UMOUNT));
        assert_eq!(flags, ExitFlags::REBOOT);

        assert_eq!(format!("{:?}", ExitFlags::REBOOT | ExitFlags::KEXEC), "REBOOT|KEXEC");
        assert_eq!(format!("{:?}", ExitFlags::NONE), "NONE");
    }

    #[test]
    fn test_headless_ui_picks_auto_boot_rom() {
        let roms = vec![
            Rom {
                id: 100,
                name: "Internal".into(),
                base_path: "/r/Internal".into(),
                partition_uuid: None,
                kind: RomKind::DefaultInternal,
                has_bootimg: false,
            },
            Rom {
                id: 101,
                name: "CM13".into(),
                base_path: "/r/CM13".into(),
                partition_uuid: None,
                kind: RomKind::AndroidInternal,
                has_bootimg: true,
            },
        ];
        let mut status = Status::default();
        status.auto_boot_rom = "CM13".into();
        status.auto_boot_seconds = 0;
        let workers = Workers::start();
        let parts = Mutex::new(PartitionSet::default());
        let ctx = UiContext {
            roms: &roms,
            status: &status,
            workers: &workers,
            partitions: &parts,
        };
        let verdict = HeadlessUi.select(&ctx).unwrap();
        assert_eq!(verdict, UiVerdict::BootRom(101));

        // Mode Last boots the current ROM instead.
        status.auto_boot_mode = AutoBootMode::Last;
        status.current_rom = "Internal".into();
        let ctx = UiContext {
            roms: &roms,
            status: &status,
            workers: &workers,
            partitions: &parts,
        };
        assert_eq!(HeadlessUi.select(&ctx).unwrap(), UiVerdict::BootRom(100));
    }
}
