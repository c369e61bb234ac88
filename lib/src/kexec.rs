//! Kexec-hardboot capability probe and loader.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::fstab::Fstab;
use crate::mount::copy_file;
use crate::paths::Paths;
use crate::task::Task;
use crate::version::KEXECD_CMDLINE_TAG;

/// One kexec invocation: kernel, optional initrd, assembled command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct KexecLoad {
    pub(crate) kernel: camino::Utf8PathBuf,
    pub(crate) initrd: Option<camino::Utf8PathBuf>,
    pub(crate) cmdline: String,
}

/// Does the kernel config prove kexec-hardboot support?
pub(crate) fn config_has_hardboot(config: &str, dtb: bool) -> bool {
    let extra = if dtb {
        "CONFIG_PROC_DEVICETREE=y"
    } else {
        "CONFIG_ATAGS_PROC=y"
    };
    for check in ["CONFIG_KEXEC_HARDBOOT=y", extra] {
        if !config.lines().any(|l| l == check) {
            tracing::error!("{check} not found in /proc/config.gz!");
            return false;
        }
    }
    true
}

fn probe_kexec(paths: &Paths) -> bool {
    if Utf8Path::new("/proc/config.gz").exists() {
        let config = Task::new("Reading kernel config", paths.busybox())
            .args(["gzip", "-d", "-c", "/proc/config.gz"])
            .quiet()
            .read();
        match config {
            Ok(config) => config_has_hardboot(&config, paths.device.kexec_dtb),
            Err(e) => {
                tracing::error!("Failed to read /proc/config.gz: {e:#}");
                false
            }
        }
    } else {
        // Kernel without /proc/config.gz enabled - if the platform's boot
        // data interface exists, there is a good chance kexec-hardboot
        // is patched in too.
        tracing::error!("/proc/config.gz is not available!");
        let checkfile = if paths.device.kexec_dtb {
            "/proc/device-tree"
        } else {
            "/proc/atags"
        };
        let present = Utf8Path::new(checkfile).exists();
        if !present {
            tracing::error!("{checkfile} was not found!");
        }
        present
    }
}

/// Cached per process; the answer cannot change while we are running.
pub(crate) fn has_kexec(paths: &Paths) -> bool {
    static HAS_KEXEC: OnceLock<bool> = OnceLock::new();
    *HAS_KEXEC.get_or_init(|| probe_kexec(paths))
}

/// Read the bootloader's command line, with the boot image's portion
/// stripped out so it is not passed twice.
#[context("Reading bootloader cmdline")]
pub(crate) fn bootloader_cmdline(paths: &Paths, fstab: Option<&Fstab>) -> Result<String> {
    let raw = std::fs::read_to_string("/proc/cmdline").context("Reading /proc/cmdline")?;
    let raw = raw.replace('\n', " ");

    let bootimg_part = fstab
        .and_then(|f| f.first_by_path("/boot"))
        .and_then(|boot| multirom_bootimg::load_header(&boot.device).ok())
        .map(|hdr| hdr.cmdline().to_string());
    Ok(match bootimg_part {
        Some(img_cmdline) => strip_bootimg_part(&raw, &img_cmdline, paths.device.cmdline_strip),
        None => raw.trim().to_string(),
    })
}

/// Remove the boot-image part from a bootloader command line.  Some
/// bootloaders eat a fixed number of leading bytes from the image's
/// cmdline before concatenating (flo's bootloader 03.15 eats 26); the
/// strip offset accounts for that.
pub(crate) fn strip_bootimg_part(bootloader: &str, bootimg: &str, strip: usize) -> String {
    let part = bootimg.get(strip.min(bootimg.len())..).unwrap_or("");
    if part.is_empty() {
        return bootloader.trim().to_string();
    }
    match bootloader.find(part) {
        Some(pos) => {
            let mut out = String::with_capacity(bootloader.len());
            out.push_str(&bootloader[..pos]);
            let mut rest = &bootloader[pos + part.len()..];
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }
            out.push_str(rest);
            out.trim().to_string()
        }
        None => bootloader.trim().to_string(),
    }
}

/// The command line for a kexec'd Android secondary: the image's own
/// cmdline, the bootloader's, and the marker the secondary's init looks
/// for.
pub(crate) fn android_kexec_cmdline(bootimg_cmdline: &str, bootloader_cmdline: &str) -> String {
    let mut out = String::new();
    if !bootimg_cmdline.is_empty() {
        out.push_str(bootimg_cmdline);
        out.push(' ');
    }
    if !bootloader_cmdline.is_empty() {
        out.push_str(bootloader_cmdline);
        out.push(' ');
    }
    out.push_str(KEXECD_CMDLINE_TAG);
    out
}

/// Invoke the kexec helper with `--load-hardboot` and copy it to
/// `/kexec` so the main process can exec it after teardown.
#[context("Loading kexec")]
pub(crate) fn load(paths: &Paths, boot: &KexecLoad) -> Result<()> {
    // --mem-min must be somewhere in System RAM (see /proc/iomem);
    // just above the kernel works.  It must not conflict with vmalloc
    // ram, which is allocated from the top of System RAM.
    let mut args = vec![
        "--load-hardboot".to_string(),
        boot.kernel.to_string(),
        format!("--mem-min={}", paths.device.kexec_mem_min),
    ];
    if let Some(initrd) = &boot.initrd {
        args.push(format!("--initrd={initrd}"));
    }
    args.push(format!("--command-line={}", boot.cmdline));
    if paths.device.kexec_dtb {
        args.push("--dtb".to_string());
    }

    tracing::info!("Loading kexec: {} {}", paths.kexec(), args[..args.len() - 1].join(" "));
    // The cmdline routinely exceeds the kmsg record limit; log in pieces.
    tracing::info!("With cmdline:");
    let bytes = boot.cmdline.as_bytes();
    for chunk in bytes.chunks(450) {
        tracing::info!("  {}", String::from_utf8_lossy(chunk));
    }

    Task::new("kexec --load-hardboot", paths.kexec())
        .args(&args)
        .run()?;

    copy_file(&paths.kexec(), Utf8Path::new("/kexec"))?;
    std::fs::set_permissions("/kexec", {
        use std::os::unix::fs::PermissionsExt;
        std::fs::Permissions::from_mode(0o755)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "CONFIG_KEXEC=y\nCONFIG_KEXEC_HARDBOOT=y\nCONFIG_ATAGS_PROC=y\n";

    #[test]
    fn test_config_probe() {
        assert!(config_has_hardboot(CONFIG, false));
        // DT platform needs the devicetree interface instead of atags.
        assert!(!config_has_hardboot(CONFIG, true));
        assert!(config_has_hardboot(
            "CONFIG_KEXEC_HARDBOOT=y\nCONFIG_PROC_DEVICETREE=y\n",
            true
        ));
        assert!(!config_has_hardboot("CONFIG_KEXEC=y\nCONFIG_ATAGS_PROC=y\n", false));
        // Commented lines don't count.
        assert!(!config_has_hardboot(
            "# CONFIG_KEXEC_HARDBOOT=y\nCONFIG_ATAGS_PROC=y\n",
            false
        ));
    }

    #[test]
    fn test_strip_bootimg_part() {
        let bootloader = "console=ttyHSL0,115200,n8 androidboot.hardware=flo androidboot.serialno=0123";
        let bootimg = "console=ttyHSL0,115200,n8";
        assert_eq!(
            strip_bootimg_part(bootloader, bootimg, 0),
            "androidboot.hardware=flo androidboot.serialno=0123"
        );
        // Image part absent from the bootloader cmdline: nothing stripped.
        assert_eq!(
            strip_bootimg_part(bootloader, "quiet splash", 0),
            bootloader
        );
        // Empty image cmdline: nothing stripped.
        assert_eq!(strip_bootimg_part(bootloader, "", 0), bootloader);
    }

    #[test]
    fn test_strip_bootimg_part_with_offset() {
        // flo's bootloader removes the first 26 characters of the image
        // cmdline ("console=ttyHSL0,115200,n8 ") before appending it.
        let bootimg = "console=ttyHSL0,115200,n8 lpj=67677";
        let bootloader = "lpj=67677 androidboot.hardware=flo";
        assert_eq!(
            strip_bootimg_part(bootloader, bootimg, 26),
            "androidboot.hardware=flo"
        );
    }

    #[test]
    fn test_android_kexec_cmdline() {
        let cmdline = android_kexec_cmdline("lpj=67677", "androidboot.hardware=flo");
        assert_eq!(cmdline, "lpj=67677 androidboot.hardware=flo mrom_kexecd=1");
        assert!(cmdline.ends_with(" mrom_kexecd=1"));

        assert_eq!(android_kexec_cmdline("", ""), "mrom_kexecd=1");
    }
}
