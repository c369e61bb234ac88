//! Version constants that are observable in persistent state.

/// Selection engine version, printed by `multirom -v`.
pub(crate) const VERSION_MULTIROM: u32 = 33;

/// Suffix for device-specific fixes ("33a" style); empty on mainline.
pub(crate) const VERSION_DEV_FIX: &str = "";

/// Stamped into boot image name fields as `tr_ver<N>` after injection.
/// Bump whenever the trampoline binary changes behavior.
pub(crate) const VERSION_TRAMPOLINE: u32 = 27;

/// Protocol version of the `-apkL` listing consumed by the manager app.
pub(crate) const VERSION_APKL: u32 = 2;

/// No-kexec feature version, stored in the next-to-last name byte of
/// injected boot images.  Only bump for changes that affect second-boot
/// detection; anything else forces pointless re-injection of every
/// secondary ROM.
pub(crate) const VERSION_NO_KEXEC: u8 = 4;

/// Logged to the kernel ring buffer right before kexec so that
/// `/proc/last_kmsg` in the next kernel proves this is the second boot.
pub(crate) const SECOND_BOOT_SENTINEL: &str = "MultiromSaysNextBootShouldBeSecondMagic108";

/// Appended to the kernel command line of kexec'd Android secondaries so
/// their init can detect it is running under MultiROM.
pub(crate) const KEXECD_CMDLINE_TAG: &str = "mrom_kexecd=1";
