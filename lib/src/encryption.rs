//! The encryption gate: when `/data` will not mount, hand off to the
//! bundled decryption helper, splice the dm-crypt device it reports back
//! into the fstab, and undo everything on teardown so the real init can
//! decrypt again itself.

use std::os::unix::fs::PermissionsExt;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::fstab::Fstab;
use crate::hooks::device_hooks;
use crate::mount;
use crate::task::Task;

const ENC_DIR: &str = "/mrom_enc";
const ENC_HELPER: &str = "/mrom_enc/trampoline_encmnt";
const BOOT_INTERNAL_OUTPUT: &str = "boot-internal-requested";
const BOOT_RECOVERY_OUTPUT: &str = "boot-recovery-requested";

#[cfg(target_pointer_width = "64")]
const LINKER_PATH: &str = "/system/bin/linker64";
#[cfg(not(target_pointer_width = "64"))]
const LINKER_PATH: &str = "/system/bin/linker";

/// What the helper decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Unlock {
    /// `/data` was unlocked; the fstab now points at the dm device.
    Decrypted(String),
    /// The user asked to boot the internal ROM without decrypting.
    BootInternal,
    /// The user asked for recovery.
    BootRecovery,
}

/// Crypto footer location from the fstab `/data` row's fs_mgr options.
pub(crate) fn crypto_footer_location(fstab: &Fstab) -> Option<String> {
    let data = fstab.first_by_path("/data")?;
    data.options2.split(',').find_map(|opt| {
        for key in ["encryptable=", "forceencrypt=", "forcefdeorfbe="] {
            if let Some(loc) = opt.strip_prefix(key) {
                return Some(loc.to_string());
            }
        }
        None
    })
}

#[derive(Default)]
pub(crate) struct EncryptionGate {
    decrypted: bool,
}

impl EncryptionGate {
    /// Stage the helper environment and run it.  On success the fstab's
    /// `/data` device is rewritten to the decrypted dm node.
    #[context("Running encryption gate")]
    pub(crate) fn before_mount(&mut self, fstab: &mut Fstab) -> Result<Unlock> {
        let footer = crypto_footer_location(fstab)
            .ok_or_else(|| anyhow!("no crypto footer declared in the fstab /data row"))?;
        tracing::info!("Crypto footer is at {footer}");

        self.stage_helper_env(fstab)?;
        device_hooks().encryption_setup()?;

        tracing::info!("Running trampoline_encmnt");
        let (output, status) = Task::new("Decrypting /data", ENC_HELPER)
            .args(["decrypt"])
            .env("LD_LIBRARY_PATH", "/mrom_enc/")
            .read_with_status()?;
        if !status.success() {
            anyhow::bail!("Failed to run trampoline_encmnt, {status:?}: {output}");
        }

        let verdict = output.trim();
        if verdict == BOOT_INTERNAL_OUTPUT {
            tracing::info!("trampoline_encmnt requested to boot internal ROM.");
            return Ok(Unlock::BootInternal);
        }
        if verdict == BOOT_RECOVERY_OUTPUT {
            tracing::info!("trampoline_encmnt requested to boot recovery.");
            return Ok(Unlock::BootRecovery);
        }
        if !verdict.starts_with("/dev") {
            anyhow::bail!("Invalid trampoline_encmnt output: {verdict}");
        }

        self.decrypted = true;
        let data = fstab
            .first_by_path("/data")
            .ok_or_else(|| anyhow!("failed to find /data in fstab"))?;
        let old_device = data.device.clone();
        tracing::info!("Updating device {old_device} to {verdict} in fstab due to encryption.");
        fstab.update_device(&old_device, verdict);
        Ok(Unlock::Decrypted(verdict.to_string()))
    }

    /// The helper is a dynamically linked Android binary; give it a
    /// linker, a /vendor and the firmware partition it may need for the
    /// keymaster.
    fn stage_helper_env(&self, fstab: &Fstab) -> Result<()> {
        std::fs::create_dir_all("/system/bin").context("Creating /system/bin")?;
        let _ = std::fs::remove_file(LINKER_PATH);
        std::os::unix::fs::symlink("/mrom_enc/linker", LINKER_PATH)?;
        for bin in ["/mrom_enc/linker", ENC_HELPER] {
            if Utf8Path::new(bin).exists() {
                std::fs::set_permissions(bin, std::fs::Permissions::from_mode(0o775))?;
            }
        }

        let _ = std::fs::remove_file("/vendor");
        std::os::unix::fs::symlink("/mrom_enc/vendor", "/vendor")?;

        let _ = std::fs::create_dir("/firmware");
        if let Some(fw) = fstab.first_by_path("/firmware") {
            if fw.fstype != "emmc" {
                if let Err(e) = mount::mount(
                    &fw.device,
                    Utf8Path::new("/firmware"),
                    &fw.fstype,
                    fw.mountflags,
                    "",
                ) {
                    tracing::error!("Mounting /firmware for encryption failed: {e:#}");
                }
            }
        }
        Ok(())
    }

    /// Detach the dm device so the real init can run its own decryption.
    pub(crate) fn destroy(&mut self) {
        if self.decrypted {
            let res = Task::new("Removing dm-crypt mapping", ENC_HELPER)
                .args(["remove"])
                .env("LD_LIBRARY_PATH", "/mrom_enc/")
                .read_with_status();
            match res {
                Ok((_, status)) if status.success() => {}
                Ok((output, _)) => tracing::error!("Failed to run trampoline_encmnt: {output}"),
                Err(e) => tracing::error!("Failed to run trampoline_encmnt: {e:#}"),
            }
            self.decrypted = false;
        }

        // Make sure we're removing our symlink and not the ROM's linker.
        if let Ok(meta) = std::fs::symlink_metadata(LINKER_PATH) {
            if meta.is_symlink() {
                let _ = std::fs::remove_file(LINKER_PATH);
            }
        }
    }

    /// Remove the rest of the scratch state.  Runs unconditionally on
    /// teardown, even when decryption never happened.
    pub(crate) fn cleanup(&self) {
        device_hooks().encryption_cleanup();
        if let Ok(meta) = std::fs::symlink_metadata("/vendor") {
            if meta.is_symlink() {
                let _ = std::fs::remove_file("/vendor");
            }
        }
        if Utf8Path::new("/firmware").exists() {
            if let Err(e) = mount::unmount(Utf8Path::new("/firmware")) {
                tracing::debug!("encryption cleanup: {e:#}");
            }
            let _ = std::fs::remove_dir("/firmware");
        }
        let _ = std::fs::remove_dir_all(ENC_DIR);
    }
}
