//! Handling of system restarts/reboot
//!
//! There is no init to ask at this stage of boot, so this goes straight
//! to the reboot(2) syscall.  Recovery and bootloader targets need the
//! reason-carrying `RESTART2` command the bootloader understands.

use std::ffi::CString;
use std::io::Write;

use fn_error_context::context;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RebootTarget {
    System,
    Recovery,
    Bootloader,
    Shutdown,
}

// create unsafe syscall wrappers
#[allow(unsafe_code)]
mod sys {
    use std::ffi::CStr;

    pub(super) fn reboot_with_reason(reason: &CStr) -> std::io::Error {
        unsafe {
            libc::syscall(
                libc::SYS_reboot,
                libc::LINUX_REBOOT_MAGIC1,
                libc::LINUX_REBOOT_MAGIC2,
                libc::LINUX_REBOOT_CMD_RESTART2,
                reason.as_ptr(),
            );
        }
        std::io::Error::last_os_error()
    }

    pub(super) fn reboot_plain(cmd: libc::c_int) -> std::io::Error {
        unsafe {
            libc::reboot(cmd);
        }
        std::io::Error::last_os_error()
    }
}

/// Initiate a system reboot.
/// This function will only return in case of error.
#[context("Initiating reboot")]
pub(crate) fn reboot(target: RebootTarget) -> anyhow::Result<()> {
    // Flush output streams and make sure dirty state hits the disk; the
    // reboot syscall does not wait for anyone.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    rustix::fs::sync();

    tracing::info!("Rebooting system ({target:?})");
    let err = match target {
        RebootTarget::System => sys::reboot_plain(libc::LINUX_REBOOT_CMD_RESTART),
        RebootTarget::Shutdown => sys::reboot_plain(libc::LINUX_REBOOT_CMD_POWER_OFF),
        RebootTarget::Recovery => sys::reboot_with_reason(&CString::new("recovery")?),
        RebootTarget::Bootloader => sys::reboot_with_reason(&CString::new("bootloader")?),
    };
    tracing::error!("reboot syscall returned: {err}");
    loop {
        std::thread::park();
    }
}
