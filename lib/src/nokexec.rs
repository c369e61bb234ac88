//! The no-kexec fallback: when kexec-hardboot is missing or disabled,
//! temporarily swap the secondary's boot image into the primary boot
//! partition, tag it, reboot, and restore the backup on the way out of
//! the second boot.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::fstab::Fstab;
use crate::inject::{self, Injector};
use crate::mount::copy_file;
use crate::paths::Paths;
use crate::rom::Rom;

// Policy bits persisted in the status file.
pub(crate) const NO_KEXEC_ALLOWED: u32 = 0x01; // use no-kexec only when needed
pub(crate) const NO_KEXEC_CONFIRM: u32 = 0x02; // ... but ask for confirmation
pub(crate) const NO_KEXEC_CHOICE: u32 = 0x04; // ask kexec vs no-kexec every time
pub(crate) const NO_KEXEC_FORCED: u32 = 0x08; // always use the workaround
pub(crate) const NO_KEXEC_PRIMARY: u32 = 0x40; // allow kexec'ing into primary
pub(crate) const NO_KEXEC_RESTORE: u32 = 0x80; // always restore primary

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BootMethod {
    Kexec,
    NoKexec,
}

/// Decide how a secondary with a boot image gets entered.
pub(crate) fn select_boot_method(policy: u32, kexec_available: bool) -> Result<BootMethod> {
    if policy & NO_KEXEC_FORCED != 0 {
        return Ok(BootMethod::NoKexec);
    }
    if kexec_available {
        return Ok(BootMethod::Kexec);
    }
    let enabled =
        policy & (NO_KEXEC_ALLOWED | NO_KEXEC_CONFIRM | NO_KEXEC_CHOICE | NO_KEXEC_FORCED) != 0;
    if enabled {
        Ok(BootMethod::NoKexec)
    } else {
        Err(anyhow!(
            "kernel has no kexec-hardboot and the no-kexec workaround is disabled"
        ))
    }
}

pub(crate) struct NoKexec<'a> {
    paths: &'a Paths,
    boot_dev: Utf8PathBuf,
    backup: Utf8PathBuf,
}

/// Locate the boot partition's block device: the loaded fstab first,
/// `mrom.fstab` from the data directory as fallback.
pub(crate) fn find_boot_blockdev(paths: &Paths, fstab: Option<&Fstab>) -> Result<Utf8PathBuf> {
    tracing::info!("locating boot partition...");
    if let Some(boot) = fstab.and_then(|f| f.first_by_path("/boot")) {
        tracing::info!("found boot at '{}'", boot.device);
        return Ok(Utf8PathBuf::from(&boot.device));
    }
    tracing::info!("not found in fstab, try looking at mrom.fstab...");
    let mrom_fstab = Fstab::load(&paths.mrom.join("mrom.fstab"), true)
        .context("couldn't load mrom.fstab")?;
    let boot = mrom_fstab
        .first_by_path("/boot")
        .ok_or_else(|| anyhow!("no /boot entry in mrom.fstab"))?;
    tracing::info!("found boot (using mrom.fstab) at '{}'", boot.device);
    Ok(Utf8PathBuf::from(&boot.device))
}

/// Is the image in the primary slot tagged as a secondary's?
pub(crate) fn is_secondary_in_primary(boot_dev: &Utf8Path) -> Result<bool> {
    let hdr = multirom_bootimg::load_header(boot_dev)
        .map_err(|e| anyhow!("could not open boot image ({boot_dev}): {e}"))?;
    let res = hdr.is_secondary_tagged();
    tracing::info!("Checking the primary slot bootimg for the secondary tag; res={res}");
    Ok(res)
}

/// Standalone second-boot check from the slot tag, usable before any
/// status is loaded.  Unreadable slots count as "not second boot".
pub(crate) fn second_boot_from_tag(paths: &Paths, fstab: Option<&Fstab>) -> bool {
    match find_boot_blockdev(paths, fstab).and_then(|dev| is_secondary_in_primary(&dev)) {
        Ok(res) => res,
        Err(e) => {
            tracing::warn!("Could not check primary slot tag: {e:#}");
            false
        }
    }
}

impl<'a> NoKexec<'a> {
    pub(crate) fn new(paths: &'a Paths, fstab: Option<&Fstab>) -> Result<Self> {
        let boot_dev = find_boot_blockdev(paths, fstab)?;
        let backup = paths.primary_boot_backup();
        tracing::info!("primary_boot.img location will be={backup}");
        Ok(Self {
            paths,
            boot_dev,
            backup,
        })
    }

    /// The primary is "new" (needs backing up) when there is no backup
    /// yet, or when the current slot holds an untagged image — the user
    /// flashed something since we last looked.
    fn primary_needs_backup(&self) -> Result<bool> {
        if !self.backup.exists() {
            tracing::info!("Checking if primary is new; no backup yet");
            return Ok(true);
        }
        let untagged = !is_secondary_in_primary(&self.boot_dev)?;
        tracing::info!("Checking if primary is new; untagged={untagged}");
        Ok(untagged)
    }

    #[context("Backing up primary boot image")]
    fn backup_primary(&self) -> Result<()> {
        tracing::info!("backing up primary boot.img");
        copy_file(&self.boot_dev, &self.backup)
    }

    /// Write an image to the boot partition, re-injecting it first when
    /// its trampoline or no-kexec version is stale.
    #[context("Flashing {source} to primary slot")]
    fn flash_to_primary(&self, source: &Utf8Path) -> Result<()> {
        if !inject::is_up_to_date(source)? {
            Injector::new(self.paths, true)
                .inject_boot_image(source)
                .context("Failed to inject bootimg")?;
            tracing::info!("Injected bootimg");
        }
        tracing::info!("flashing '{source}' to boot partition");
        copy_file(source, &self.boot_dev)
    }

    /// Tag the image now sitting in the primary slot as a secondary's.
    #[context("Tagging primary slot")]
    fn set_secondary_flag(&self) -> Result<()> {
        tracing::info!("Going to tag the bootimg in primary slot as a secondary");
        let mut img = multirom_bootimg::BootImage::load(&self.boot_dev)
            .map_err(|e| anyhow!("could not open boot image ({}): {e}", self.boot_dev))?;
        img.header.set_secondary_tag(true);
        tracing::info!("Writing boot.img updated with secondary flag set");
        img.write(&self.boot_dev)
            .map_err(|e| anyhow!("failed to write boot image: {e}"))?;
        Ok(())
    }

    /// The whole swap: back up the primary if needed, flash the
    /// secondary's boot.img, tag it.
    #[context("Flashing secondary boot image for {name}", name = rom.name)]
    pub(crate) fn flash_secondary(&self, rom: &Rom) -> Result<()> {
        if self.primary_needs_backup()? {
            self.backup_primary()?;
        }
        self.flash_to_primary(&rom.bootimg_path())?;
        self.set_secondary_flag()
    }

    /// Undo the swap on the way out of the second boot.  Restoring is
    /// keyed off the tag, so running this on an untouched slot is a
    /// no-op.
    #[context("Restoring primary boot image")]
    pub(crate) fn restore_primary_and_cleanup(&self) -> Result<()> {
        if is_secondary_in_primary(&self.boot_dev)? {
            if !self.backup.exists() {
                // Theoretically the secondary image might boot the
                // primary too, but guessing here bricks phones.
                return Err(anyhow!(
                    "no primary boot.img backup found, cannot restore it"
                ));
            }
            self.flash_to_primary(&self.backup)?;
        }
        self.cleanup();
        Ok(())
    }

    fn cleanup(&self) {
        if self.backup.exists() {
            tracing::info!("deleting primary boot.img, the backup is no longer needed");
            if let Err(e) = std::fs::remove_file(&self.backup) {
                tracing::error!("WARNING: error removing backup: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_boot_method() {
        // kexec present, nothing forced: normal boot.
        assert_eq!(
            select_boot_method(NO_KEXEC_ALLOWED, true).unwrap(),
            BootMethod::Kexec
        );
        assert_eq!(select_boot_method(0, true).unwrap(), BootMethod::Kexec);

        // forced wins even with kexec available.
        assert_eq!(
            select_boot_method(NO_KEXEC_FORCED, true).unwrap(),
            BootMethod::NoKexec
        );

        // no kexec: any enabled policy routes to the workaround...
        for policy in [NO_KEXEC_ALLOWED, NO_KEXEC_CONFIRM, NO_KEXEC_CHOICE] {
            assert_eq!(
                select_boot_method(policy, false).unwrap(),
                BootMethod::NoKexec
            );
        }
        // ...but disabled policy means the boot cannot proceed.
        assert!(select_boot_method(0, false).is_err());
        // Sub-options alone don't enable it.
        assert!(select_boot_method(NO_KEXEC_PRIMARY | NO_KEXEC_RESTORE, false).is_err());
    }

    fn write_img(path: &Utf8Path, tagged: bool) {
        use multirom_bootimg::*;
        let mut header = BootHeader {
            kernel_size: 0,
            kernel_addr: 0,
            ramdisk_size: 0,
            ramdisk_addr: 0,
            second_size: 0,
            second_addr: 0,
            tags_addr: 0,
            page_size: 2048,
            dt_size: 0,
            os_version: 0,
            name: [0; BOOT_NAME_SIZE],
            cmdline: [0; BOOT_ARGS_SIZE],
            id: [0; 32],
            extra_cmdline: [0; BOOT_EXTRA_ARGS_SIZE],
        };
        header.set_trampoline_version(crate::version::VERSION_TRAMPOLINE);
        header.set_nokexec_version(crate::version::VERSION_NO_KEXEC);
        header.set_secondary_tag(tagged);
        BootImage {
            header,
            kernel: b"primary-kernel".to_vec(),
            ramdisk: b"primary-rd".to_vec(),
            second: vec![],
            dt: vec![],
        }
        .write(path)
        .unwrap();
    }

    fn test_env() -> (tempfile::TempDir, Paths, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let mrom = base.join("mrom");
        std::fs::create_dir_all(&mrom).unwrap();
        let boot_dev = base.join("boot-part");
        write_img(&boot_dev, false);
        let paths = Paths::with_base(&mrom, crate::paths::DeviceConfig::default());
        (td, paths, boot_dev)
    }

    fn nokexec<'a>(paths: &'a Paths, boot_dev: &Utf8Path) -> NoKexec<'a> {
        NoKexec {
            paths,
            boot_dev: boot_dev.to_owned(),
            backup: paths.primary_boot_backup(),
        }
    }

    #[test]
    fn test_flash_and_restore_roundtrip() {
        let (_td, paths, boot_dev) = test_env();
        let primary_bytes = std::fs::read(&boot_dev).unwrap();

        // A secondary ROM with its own, already-injected boot.img.
        let rom_dir = paths.mrom.join("roms/Secondary");
        std::fs::create_dir_all(&rom_dir).unwrap();
        write_img(&rom_dir.join("boot.img"), false);
        let rom = Rom {
            id: 0,
            name: "Secondary".into(),
            base_path: rom_dir,
            partition_uuid: None,
            kind: crate::rom::RomKind::AndroidInternal,
            has_bootimg: true,
        };

        let nk = nokexec(&paths, &boot_dev);
        nk.flash_secondary(&rom).unwrap();

        // Backup taken, slot tagged.
        assert!(paths.primary_boot_backup().exists());
        assert!(is_secondary_in_primary(&boot_dev).unwrap());
        let hdr = multirom_bootimg::load_header(&boot_dev).unwrap();
        assert_eq!(
            hdr.trampoline_version(),
            crate::version::VERSION_TRAMPOLINE
        );

        // Restore: slot byte-identical to the original, backup gone.
        nk.restore_primary_and_cleanup().unwrap();
        assert_eq!(std::fs::read(&boot_dev).unwrap(), primary_bytes);
        assert!(!paths.primary_boot_backup().exists());

        // Running restore again on the untouched slot is a no-op.
        nk.restore_primary_and_cleanup().unwrap();
        assert_eq!(std::fs::read(&boot_dev).unwrap(), primary_bytes);
    }

    #[test]
    fn test_backup_not_overwritten_while_tagged() {
        let (_td, paths, boot_dev) = test_env();
        let nk = nokexec(&paths, &boot_dev);

        // First flash backs up the real primary.
        nk.backup_primary().unwrap();
        let backup_bytes = std::fs::read(&paths.primary_boot_backup()).unwrap();

        // Simulate a tagged (secondary) image in the slot: a second flash
        // must not replace the backup with the secondary image.
        write_img(&boot_dev, true);
        assert!(!nk.primary_needs_backup().unwrap());

        // Untagged slot with existing backup: the user reflashed, take a
        // fresh backup.
        write_img(&boot_dev, false);
        assert!(nk.primary_needs_backup().unwrap());
        let _ = backup_bytes;
    }

    #[test]
    fn test_restore_without_backup_fails() {
        let (_td, paths, boot_dev) = test_env();
        write_img(&boot_dev, true);
        let nk = nokexec(&paths, &boot_dev);
        assert!(nk.restore_primary_and_cleanup().is_err());
    }

    #[test]
    fn test_second_boot_from_tag() {
        let (_td, paths, boot_dev) = test_env();
        let fstab = Fstab::parse(&format!("{boot_dev} /boot emmc defaults defaults\n")).unwrap();
        assert!(!second_boot_from_tag(&paths, Some(&fstab)));
        write_img(&boot_dev, true);
        assert!(second_boot_from_tag(&paths, Some(&fstab)));
    }
}
