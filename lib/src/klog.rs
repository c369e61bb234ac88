//! Kernel ring buffer access: the emergency log dump and the
//! second-boot sentinel search.

use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

// create unsafe klogctl wrappers
#[allow(unsafe_code)]
mod sys {
    const SYSLOG_ACTION_READ_ALL: libc::c_int = 3;
    const SYSLOG_ACTION_SIZE_BUFFER: libc::c_int = 10;

    pub(super) fn read_all() -> Vec<u8> {
        let mut len = unsafe { libc::klogctl(SYSLOG_ACTION_SIZE_BUFFER, std::ptr::null_mut(), 0) };
        len = len.clamp(16 * 1024, 16 * 1024 * 1024);
        let mut buf = vec![0u8; len as usize];
        let got = unsafe { libc::klogctl(SYSLOG_ACTION_READ_ALL, buf.as_mut_ptr().cast(), len) };
        buf.truncate(got.max(0) as usize);
        buf
    }
}

/// Read the whole kernel ring buffer.
pub(crate) fn read_kernel_log() -> Vec<u8> {
    sys::read_all()
}

/// Dump the kernel ring buffer to `path` so it survives the reboot that
/// is about to happen.
#[context("Dumping kernel log to {path}")]
pub(crate) fn dump_kernel_log(path: &Utf8Path) -> Result<()> {
    let log = read_kernel_log();
    if log.is_empty() {
        anyhow::bail!("kernel log is empty or unreadable");
    }
    std::fs::write(path, &log).context("Writing log")?;
    // World-readable so it can be pulled without root once Android is up.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    Ok(())
}

/// Check whether the previous kernel's log contains `needle`.  Absence of
/// `/proc/last_kmsg` just means this kernel was cold-booted.
pub(crate) fn last_kmsg_contains(needle: &str) -> bool {
    match std::fs::read("/proc/last_kmsg") {
        Ok(buf) => String::from_utf8_lossy(&buf).contains(needle),
        Err(_) => false,
    }
}
