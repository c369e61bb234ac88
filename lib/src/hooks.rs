//! Seams for device-specific hooks.
//!
//! Ports of MultiROM to quirky hardware used to patch these call sites
//! directly; keeping them as a trait means a device tree only has to
//! supply its own implementation.

use anyhow::Result;
use camino::Utf8Path;

use crate::rom::RomKind;

pub(crate) trait DeviceHooks {
    /// Runs before the trampoline populates `/dev` from sysfs.
    fn before_device_init(&self) {}

    /// Runs after the Android stager has set up all bind/loop mounts.
    fn after_android_mounts(&self, _base: &Utf8Path, _kind: RomKind) -> Result<()> {
        Ok(())
    }

    /// Runs before the decryption helper is invoked.
    fn encryption_setup(&self) -> Result<()> {
        Ok(())
    }

    /// Runs during trampoline teardown when encryption was staged.
    fn encryption_cleanup(&self) {}
}

struct NoHooks;

impl DeviceHooks for NoHooks {}

pub(crate) fn device_hooks() -> &'static dyn DeviceHooks {
    &NoHooks
}
