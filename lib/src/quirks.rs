//! Fixups applied after Android staging, before handing over to the
//! real init: vendor scripts that would remount the primary `/system`
//! over our bind, SELinux relabeling that would destroy the shared media
//! tree, and build.prop values the bootloader will contradict.

use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use rustix::mount::MountFlags;

use crate::mount;
use crate::rom::Rom;

/// SELinux contexts entries excluding MultiROM's tree from relabeling.
/// Without these, `restorecon_recursive /data` walks into the secondary
/// ROMs and rewrites the labels of their whole /system trees.
const FILE_CONTEXTS_EXCLUSIONS: &str = "\
/data/media/multirom(/.*)?          <<none>>\n\
/data/media/0/multirom(/.*)?        <<none>>\n\
/realdata/media/multirom(/.*)?      <<none>>\n\
/realdata/media/0/multirom(/.*)?    <<none>>\n";

const CONTEXTS_CANDIDATES: &[&str] = &["file_contexts", "file_contexts.bin", "plat_file_contexts"];

/// Run every quirk over the staged root.
#[context("Applying post-staging quirks")]
pub(crate) fn on_initrd_finalized(root: &Utf8Path) -> Result<()> {
    let mut contexts_present = 0usize;
    let mut contexts_failed = 0usize;

    // plat_file_contexts lives in /system on 8.0+; patch a copy and bind
    // it over the original.
    let plat_in_system = root.join("system/etc/selinux/plat_file_contexts");
    if plat_in_system.exists() {
        let copy = root.join("plat_file_contexts");
        if let Err(e) = mount::copy_file(&plat_in_system, &copy) {
            tracing::error!("Failed to copy plat_file_contexts: {e:#}");
        }
    }

    for entry in root.read_dir_utf8().context("Reading root")? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();

        if CONTEXTS_CANDIDATES.contains(&name) {
            contexts_present += 1;
            if let Err(e) = inject_file_contexts(entry.path()) {
                tracing::warn!("file_contexts injection failed for {name}: {e:#}");
                contexts_failed += 1;
            }
        }

        // franco.Kernel ships init.fk.sh which remounts /system read-only;
        // vendor rc scripts occasionally do the same.
        if name.ends_with(".sh") || name.ends_with(".rc") {
            comment_system_mounts(entry.path());
        }
    }

    if plat_in_system.exists() {
        let copy = root.join("plat_file_contexts");
        match mount::mount(copy.as_str(), &plat_in_system, "ext4", MountFlags::BIND, "") {
            Ok(()) => tracing::info!("file_contexts bind mounted in system"),
            Err(e) => tracing::error!("file_contexts bind mount failed: {e:#}"),
        }
    }

    if contexts_present > 0 && contexts_failed == contexts_present {
        disable_restorecon_recursive(root)?;
    }
    Ok(())
}

/// Append the MultiROM exclusions to a text-format contexts file.  The
/// binary format is not rewritable here; failing makes the caller fall
/// back to neutering restorecon in the rc scripts.
pub(crate) fn inject_file_contexts(path: &Utf8Path) -> Result<()> {
    let content = std::fs::read(path).context("Reading contexts")?;
    if content.starts_with(&[0x8a, 0xff, 0x7c, 0xf9]) || path.as_str().ends_with(".bin") {
        anyhow::bail!("binary file_contexts format");
    }
    let text = String::from_utf8(content).context("Non-UTF8 contexts file")?;
    if text.contains("/multirom(/.*)?") {
        tracing::info!("{path} already carries MultiROM exclusions");
        return Ok(());
    }
    let mut out = text;
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(FILE_CONTEXTS_EXCLUSIONS);
    std::fs::write(path, out).context("Writing contexts")?;
    tracing::info!("Injected MultiROM exclusions into {path}");
    Ok(())
}

/// Comment out lines mounting `/system` in a shell or rc script.
fn comment_system_mounts(path: &Utf8Path) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    let mut changed = false;
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        if !line.trim_start().starts_with('#')
            && line.contains("mount ")
            && line.contains("/system")
        {
            out.push('#');
            changed = true;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !changed {
        return;
    }
    let mode = path
        .metadata()
        .map(|m| m.permissions().mode())
        .unwrap_or(0o750);
    if std::fs::write(path, out).is_ok() {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
        tracing::info!("Commented /system mounts in {path}");
    }
}

/// Backup plan when no contexts file could be patched: comment every
/// recursive restorecon over the trees we shadow.
#[context("Disabling restorecon_recursive")]
fn disable_restorecon_recursive(root: &Utf8Path) -> Result<()> {
    const PROTECTED: &[&str] = &["/data", "/system", "/cache", "/mnt", "/vendor"];
    for entry in root.read_dir_utf8()? {
        let entry = entry?;
        if !entry.file_type()?.is_file() || !entry.file_name().ends_with(".rc") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let mut out = String::with_capacity(content.len());
        for line in content.lines() {
            let is_restorecon = line.contains("restorecon_recursive ")
                || (line.contains("restorecon ") && line.contains("--recursive"));
            if is_restorecon && PROTECTED.iter().any(|p| line.contains(p)) {
                out.push('#');
            }
            out.push_str(line);
            out.push('\n');
        }
        if out != content {
            std::fs::write(entry.path(), out)?;
            std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(0o750))?;
            tracing::info!("Disabled restorecon_recursive in {}", entry.file_name());
        }
    }
    Ok(())
}

fn version_raw(value: &str) -> i64 {
    // "8.1.0" -> 810, "2018-03-01" -> 20180301; single numbers get
    // zero-padded so "8" compares above "7.1".
    let digits: String = value
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if !value.contains('.') && !value.contains('-') {
        format!("{digits}00").parse().unwrap_or(0)
    } else {
        digits.parse().unwrap_or(0)
    }
}

fn prop_value<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content
        .lines()
        .find_map(|l| l.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
}

/// Rewrite `ro.build.version.release` / `security_patch` when the kernel
/// that will actually run attests newer values than the ROM's build.prop
/// claims, and bind the patched copy over `/system/build.prop`.
#[context("Patching build.prop os_version")]
pub(crate) fn patch_build_prop(
    primary_boot_dev: &Utf8Path,
    rom: &Rom,
    use_primary_kernel: bool,
    root: &Utf8Path,
) -> Result<()> {
    let hdr = match multirom_bootimg::load_header(primary_boot_dev) {
        Ok(hdr) => hdr,
        Err(e) => {
            tracing::error!("can't open {primary_boot_dev}: {e}");
            return Ok(());
        }
    };
    let (Some(release), Some(patch)) = (hdr.os_release(), hdr.os_patch_level()) else {
        tracing::info!("primary boot image carries no os_version, skipping build.prop patch");
        return Ok(());
    };

    let prop_path = root.join("system/build.prop");
    let content = std::fs::read_to_string(&prop_path).context("Reading build.prop")?;
    let patched = patch_build_prop_content(&content, &release, &patch, use_primary_kernel || !rom.has_bootimg);
    let Some(patched) = patched else {
        return Ok(());
    };

    let copy = root.join("build.prop");
    std::fs::write(&copy, patched).context("Writing patched build.prop")?;
    std::fs::set_permissions(&copy, std::fs::Permissions::from_mode(0o644))?;
    match mount::mount(copy.as_str(), &prop_path, "ext4", MountFlags::BIND, "") {
        Ok(()) => tracing::info!("build.prop bind mounted in system"),
        Err(e) => tracing::error!("build.prop bind mount failed: {e:#}"),
    }
    Ok(())
}

/// Returns the rewritten build.prop, or `None` when no rewrite is needed.
pub(crate) fn patch_build_prop_content(
    content: &str,
    primary_release: &str,
    primary_patch: &str,
    force: bool,
) -> Option<String> {
    let existing_release = prop_value(content, "ro.build.version.release")?;
    let existing_patch = prop_value(content, "ro.build.version.security_patch")?;

    let newer = version_raw(primary_release) > version_raw(existing_release)
        || version_raw(primary_patch) > version_raw(existing_patch);
    if !newer && !force {
        return None;
    }

    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        if line.starts_with("ro.build.version.release=") {
            out.push_str("ro.build.version.release=");
            out.push_str(primary_release);
        } else if line.starts_with("ro.build.version.security_patch=") {
            out.push_str("ro.build.version.security_patch=");
            out.push_str(primary_patch);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    Some(out)
}
