//! Trampoline injection: splice the current trampoline binary and its
//! support files into a boot image's ramdisk, then rewrite the image.
//!
//! The injected image is stamped (`tr_ver<N>` plus the no-kexec version
//! byte) so re-running on an up-to-date image is a no-op.

use std::os::unix::fs::PermissionsExt;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use multirom_bootimg::BootImage;

use crate::mount::{copy_file, copy_tree};
use crate::paths::Paths;
use crate::task::Task;
use crate::version::{VERSION_NO_KEXEC, VERSION_TRAMPOLINE};

/// Name of the nested ramdisk some A/B trees carry.
const NESTED_RD: &str = "sbin/ramdisk.cpio";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RdFormat {
    Gzip,
    Lz4,
}

/// Identify the ramdisk compression from its magic bytes.  `None` means
/// an unknown format we must not touch.
pub(crate) fn sniff_format(magic: &[u8]) -> Option<RdFormat> {
    if magic.len() >= 2 && magic[0] == 0x1f && magic[1] == 0x8b {
        return Some(RdFormat::Gzip);
    }
    if magic.len() >= 4 && u32::from_le_bytes(magic[..4].try_into().unwrap()) == 0x184C2102 {
        return Some(RdFormat::Lz4);
    }
    None
}

pub(crate) struct Injector<'a> {
    paths: &'a Paths,
    /// Scratch space; `/` in the trampoline, a tempdir in tests.
    work_dir: Utf8PathBuf,
    force: bool,
}

impl<'a> Injector<'a> {
    pub(crate) fn new(paths: &'a Paths, force: bool) -> Self {
        Self {
            paths,
            work_dir: Utf8PathBuf::from("/"),
            force,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_work_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    fn unpack_dir(&self) -> Utf8PathBuf {
        self.work_dir.join("mrom_rd")
    }

    fn rd_scratch(&self) -> Utf8PathBuf {
        self.work_dir.join("inject-initrd.img")
    }

    /// Run the full injection pass on the boot image at `img_path`.
    /// Returns `false` when the image was already up to date.
    #[context("Injecting {img_path}")]
    pub(crate) fn inject_boot_image(&self, img_path: &Utf8Path) -> Result<bool> {
        let mut img =
            BootImage::load(img_path).with_context(|| format!("Opening boot image {img_path}"))?;

        let img_ver = img.header.trampoline_version();
        if !self.force
            && img_ver == VERSION_TRAMPOLINE
            && img.header.nokexec_version() == VERSION_NO_KEXEC
        {
            tracing::info!("No need to update trampoline.");
            return Ok(false);
        }
        tracing::info!("Updating trampoline from ver {img_ver} to {VERSION_TRAMPOLINE}");

        let rd = self.rd_scratch();
        img.dump_ramdisk(&rd)
            .with_context(|| format!("Dumping ramdisk to {rd}"))?;
        let res = self.inject_ramdisk(&rd).and_then(|()| {
            img.load_ramdisk(&rd)
                .with_context(|| format!("Loading ramdisk from {rd}"))?;
            img.header.set_trampoline_version(VERSION_TRAMPOLINE);
            img.header.set_nokexec_version(VERSION_NO_KEXEC);
            if let Some(addr) = self.paths.device.ramdisk_addr {
                img.header.ramdisk_addr = addr;
            }

            // Write next to the original first; the target may be a block
            // device we must only overwrite with a finished image.
            let tmp = Utf8PathBuf::from(format!("{img_path}.new"));
            img.write(&tmp)
                .with_context(|| format!("Writing boot image {tmp}"))?;
            tracing::info!("Writing boot.img updated with trampoline v{VERSION_TRAMPOLINE}");
            let copied = copy_file(&tmp, img_path);
            let _ = std::fs::remove_file(&tmp);
            copied
        });
        let _ = std::fs::remove_file(&rd);
        res.map(|()| true)
    }

    /// Unpack the ramdisk in place, splice the trampoline files in,
    /// repack in the original format.
    #[context("Injecting ramdisk {rd}")]
    pub(crate) fn inject_ramdisk(&self, rd: &Utf8Path) -> Result<()> {
        let magic = {
            let mut buf = [0u8; 4];
            use std::io::Read;
            let n = std::fs::File::open(rd)
                .and_then(|mut f| f.read(&mut buf))
                .with_context(|| format!("Reading {rd}"))?;
            buf[..n].to_vec()
        };
        let Some(format) = sniff_format(&magic) else {
            tracing::warn!("Unknown ramdisk magic {magic:02x?}, can't update trampoline");
            return Ok(());
        };

        let unpack = self.unpack_dir();
        let _ = std::fs::remove_dir_all(&unpack);
        std::fs::create_dir_all(&unpack)?;

        let res = self.inject_unpacked(rd, &unpack, format);
        let _ = std::fs::remove_dir_all(&unpack);
        res
    }

    fn inject_unpacked(&self, rd: &Utf8Path, unpack: &Utf8Path, format: RdFormat) -> Result<()> {
        self.decompress(rd, unpack, format)?;

        // Android A/B trees nest a second ramdisk; that one holds the
        // init we need to replace.
        let nested = unpack.join(NESTED_RD);
        let target = if nested.exists() {
            let second = unpack.join("second");
            std::fs::create_dir_all(&second)?;
            self.cpio_unpack(&nested, &second)
                .context("Unpacking nested ramdisk")?;
            second
        } else {
            unpack.to_owned()
        };

        self.copy_rd_files(&target)?;

        if nested.exists() {
            self.cpio_pack(&unpack.join("second"), &nested)
                .context("Repacking nested ramdisk")?;
            std::fs::remove_dir_all(unpack.join("second"))?;
        }
        self.compress(unpack, rd, format)
    }

    /// Place the trampoline and its support files into the unpacked tree.
    fn copy_rd_files(&self, target: &Utf8Path) -> Result<()> {
        let init = target.join("init");
        let init_real = target.join("init.real");
        let main_init = target.join("main_init");

        // Trees that already split their init keep their wrapper at
        // /init; the trampoline takes the init.real slot instead.
        let downstream_init = if init_real.exists() { init_real } else { init };
        if !main_init.exists() {
            std::fs::rename(&downstream_init, &main_init)
                .with_context(|| format!("Moving {downstream_init} to {main_init}"))?;
        }

        copy_file(&self.paths.trampoline_bin(), &downstream_init)
            .context("Copying trampoline into ramdisk")?;
        std::fs::set_permissions(&downstream_init, std::fs::Permissions::from_mode(0o750))?;

        // ueventd/watchdogd must resolve to the real init, not to us.
        for name in ["sbin/ueventd", "sbin/watchdogd"] {
            let link = target.join(name);
            let _ = std::fs::remove_file(&link);
            if link.parent().map(Utf8Path::exists).unwrap_or(false) {
                std::os::unix::fs::symlink("../main_init", &link)
                    .with_context(|| format!("Linking {link}"))?;
            }
        }

        let mrom_fstab = target.join("mrom.fstab");
        if self.paths.device.use_mrom_fstab {
            copy_file(&self.paths.mrom.join("mrom.fstab"), &mrom_fstab)?;
        } else {
            let _ = std::fs::remove_file(&mrom_fstab);
        }

        for name in ["plat_hwservice_contexts", "nonplat_hwservice_contexts"] {
            let src = self.paths.mrom.join(name);
            if src.exists() {
                copy_file(&src, &target.join(name))?;
            }
        }

        let enc = self.paths.mrom.join("enc");
        if enc.is_dir() {
            let dst = target.join("mrom_enc");
            let _ = std::fs::remove_dir_all(&dst);
            copy_tree(&enc, &dst).context("Copying encryption files")?;
        }
        Ok(())
    }

    fn decompress(&self, rd: &Utf8Path, dir: &Utf8Path, format: RdFormat) -> Result<()> {
        let bb = self.paths.busybox();
        let script = match format {
            RdFormat::Gzip => format!(
                "B=\"{bb}\"; cd \"{dir}\"; \"$B\" gzip -d -c \"{rd}\" | \"$B\" cpio -i"
            ),
            RdFormat::Lz4 => format!(
                "cd \"{dir}\"; \"{lz4}\" -d \"{rd}\" stdout | \"{bb}\" cpio -i",
                lz4 = self.paths.lz4()
            ),
        };
        Task::new(format!("Unpacking ramdisk {rd}"), &bb)
            .args(["sh", "-c", &script])
            .run()
    }

    fn compress(&self, dir: &Utf8Path, rd: &Utf8Path, format: RdFormat) -> Result<()> {
        let bb = self.paths.busybox();
        let script = match format {
            RdFormat::Gzip => format!(
                "B=\"{bb}\"; cd \"{dir}\"; \"$B\" find . | \"$B\" cpio -o -H newc | \"$B\" gzip > \"{rd}\""
            ),
            RdFormat::Lz4 => format!(
                "B=\"{bb}\"; cd \"{dir}\"; \"$B\" find . | \"$B\" cpio -o -H newc | \"{lz4}\" stdin \"{rd}\"",
                lz4 = self.paths.lz4()
            ),
        };
        Task::new(format!("Packing ramdisk {rd}"), &bb)
            .args(["sh", "-c", &script])
            .run()
    }

    fn cpio_unpack(&self, archive: &Utf8Path, dir: &Utf8Path) -> Result<()> {
        let bb = self.paths.busybox();
        let script = format!("B=\"{bb}\"; cd \"{dir}\"; \"$B\" cat \"{archive}\" | \"$B\" cpio -i");
        Task::new(format!("Unpacking {archive}"), &bb)
            .args(["sh", "-c", &script])
            .run()
    }

    fn cpio_pack(&self, dir: &Utf8Path, archive: &Utf8Path) -> Result<()> {
        let bb = self.paths.busybox();
        let script =
            format!("B=\"{bb}\"; cd \"{dir}\"; \"$B\" find . | \"$B\" cpio -o -H newc > \"{archive}\"");
        Task::new(format!("Packing {archive}"), &bb)
            .args(["sh", "-c", &script])
            .run()
    }
}

/// `kernel_inject`: swap the kernel of a boot image in place.
#[context("Injecting kernel into {img_path}")]
pub(crate) fn inject_kernel(img_path: &Utf8Path, kernel_path: &Utf8Path) -> Result<()> {
    let mut img =
        BootImage::load(img_path).with_context(|| format!("Opening boot image {img_path}"))?;
    img.load_kernel(kernel_path)
        .with_context(|| format!("Loading kernel from {kernel_path}"))?;

    let tmp = Utf8PathBuf::from(format!("{img_path}.new"));
    img.write(&tmp)
        .with_context(|| format!("Writing boot image {tmp}"))?;
    tracing::info!("Writing boot.img updated with kernel");
    let res = copy_file(&tmp, img_path);
    let _ = std::fs::remove_file(&tmp);
    res
}

/// Check whether the image at `path` needs injection at all; used by the
/// no-kexec flash path to keep secondary boot images in sync.
pub(crate) fn is_up_to_date(img_path: &Utf8Path) -> Result<bool> {
    let hdr = multirom_bootimg::load_header(img_path)
        .map_err(|e| anyhow!("Could not open boot image ({img_path}): {e}"))?;
    Ok(hdr.trampoline_version() == VERSION_TRAMPOLINE
        && hdr.nokexec_version() == VERSION_NO_KEXEC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use multirom_bootimg::{BootHeader, BOOT_ARGS_SIZE, BOOT_EXTRA_ARGS_SIZE, BOOT_NAME_SIZE};

    #[test]
    fn test_sniff_format() {
        assert_eq!(sniff_format(&[0x1f, 0x8b, 0x08, 0x00]), Some(RdFormat::Gzip));
        assert_eq!(sniff_format(&[0x02, 0x21, 0x4c, 0x18]), Some(RdFormat::Lz4));
        assert_eq!(sniff_format(&[0x30, 0x37, 0x30, 0x37]), None); // plain cpio
        assert_eq!(sniff_format(&[0x1f]), None);
    }

    fn write_test_image(path: &Utf8Path, tr_ver: u32, nokexec_ver: u8) {
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
        header.set_trampoline_version(tr_ver);
        header.set_nokexec_version(nokexec_ver);
        let img = BootImage {
            header,
            kernel: b"kernel".to_vec(),
            ramdisk: b"ramdisk".to_vec(),
            second: Vec::new(),
            dt: Vec::new(),
        };
        img.write(path).unwrap();
    }

    #[test]
    fn test_up_to_date_image_is_noop() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let img_path = base.join("boot.img");
        write_test_image(&img_path, VERSION_TRAMPOLINE, VERSION_NO_KEXEC);

        let paths = Paths::with_base(base.join("mrom"), crate::paths::DeviceConfig::default());
        let injector = Injector::new(&paths, false).with_work_dir(base.join("work"));
        let before = std::fs::read(&img_path).unwrap();
        // Would fail if it tried to actually unpack (no busybox in tests),
        // so reaching Ok(false) proves the early exit.
        assert!(!injector.inject_boot_image(&img_path).unwrap());
        assert_eq!(std::fs::read(&img_path).unwrap(), before);

        assert!(is_up_to_date(&img_path).unwrap());
    }

    #[test]
    fn test_stale_image_detected() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let img_path = base.join("boot.img");
        write_test_image(&img_path, VERSION_TRAMPOLINE - 1, VERSION_NO_KEXEC);
        assert!(!is_up_to_date(&img_path).unwrap());

        // Matching trampoline but stale no-kexec byte is stale too.
        write_test_image(&img_path, VERSION_TRAMPOLINE, VERSION_NO_KEXEC - 1);
        assert!(!is_up_to_date(&img_path).unwrap());
    }

    #[test]
    fn test_unknown_ramdisk_format_is_left_alone() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let rd = base.join("rd.img");
        std::fs::write(&rd, b"070701notcompressed").unwrap();

        let paths = Paths::with_base(base.join("mrom"), crate::paths::DeviceConfig::default());
        let injector = Injector::new(&paths, true).with_work_dir(base.join("work"));
        injector.inject_ramdisk(&rd).unwrap();
        assert_eq!(std::fs::read(&rd).unwrap(), b"070701notcompressed");
    }

    #[test]
    fn test_copy_rd_files_layout() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();

        // Fake mrom dir with a trampoline binary.
        let mrom = base.join("mrom");
        std::fs::create_dir_all(&mrom).unwrap();
        std::fs::write(mrom.join("trampoline"), b"trampoline-elf").unwrap();
        std::fs::write(mrom.join("plat_hwservice_contexts"), b"ctx").unwrap();
        std::fs::create_dir_all(mrom.join("enc/res")).unwrap();
        std::fs::write(mrom.join("enc/trampoline_encmnt"), b"enc").unwrap();

        // Fake unpacked ramdisk.
        let rd = base.join("rd");
        std::fs::create_dir_all(rd.join("sbin")).unwrap();
        std::fs::write(rd.join("init"), b"real-init").unwrap();
        std::fs::write(rd.join("sbin/ueventd"), b"ueventd").unwrap();

        let paths = Paths::with_base(&mrom, crate::paths::DeviceConfig::default());
        let injector = Injector::new(&paths, true).with_work_dir(base.join("work"));
        injector.copy_rd_files(&rd).unwrap();

        assert_eq!(std::fs::read(rd.join("main_init")).unwrap(), b"real-init");
        assert_eq!(std::fs::read(rd.join("init")).unwrap(), b"trampoline-elf");
        let ueventd = rd.join("sbin/ueventd");
        assert!(ueventd.symlink_metadata().unwrap().is_symlink());
        assert_eq!(
            std::fs::read_link(&ueventd).unwrap().to_str().unwrap(),
            "../main_init"
        );
        assert_eq!(std::fs::read(rd.join("plat_hwservice_contexts")).unwrap(), b"ctx");
        assert!(rd.join("mrom_enc/trampoline_encmnt").exists());

        // A second pass must not double-rename init.
        injector.copy_rd_files(&rd).unwrap();
        assert_eq!(std::fs::read(rd.join("main_init")).unwrap(), b"real-init");
    }
}
