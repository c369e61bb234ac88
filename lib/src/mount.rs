//! Helpers for mount syscalls, loop devices and a few file utilities the
//! stagers share.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rustix::mount::{MountFlags, UnmountFlags};

/// Android system uid/gid constants used for the staged directories.
pub(crate) const AID_SYSTEM: u32 = 1000;
pub(crate) const AID_CACHE: u32 = 2001;

#[context("Mounting {source} on {target} ({fstype})")]
pub(crate) fn mount(
    source: &str,
    target: &Utf8Path,
    fstype: &str,
    flags: MountFlags,
    data: &str,
) -> Result<()> {
    rustix::mount::mount(source, target.as_std_path(), fstype, flags, data)?;
    Ok(())
}

#[context("Bind-mounting {source} on {target}")]
pub(crate) fn bind_mount(source: &Utf8Path, target: &Utf8Path) -> Result<()> {
    rustix::mount::mount_bind(source.as_std_path(), target.as_std_path())?;
    Ok(())
}

/// Bind-mount and remount the bind read-only; a plain `MS_BIND|MS_RDONLY`
/// mount silently ignores the read-only part.
#[context("Bind-mounting {source} read-only on {target}")]
pub(crate) fn bind_mount_ro(source: &Utf8Path, target: &Utf8Path) -> Result<()> {
    rustix::mount::mount_bind(source.as_std_path(), target.as_std_path())?;
    rustix::mount::mount_remount(
        target.as_std_path(),
        MountFlags::BIND | MountFlags::RDONLY,
        "",
    )?;
    Ok(())
}

pub(crate) fn unmount(target: &Utf8Path) -> Result<()> {
    rustix::mount::unmount(target.as_std_path(), UnmountFlags::empty())
        .with_context(|| format!("Unmounting {target}"))?;
    Ok(())
}

/// Remount the root filesystem read-write or read-only.
pub(crate) fn remount_root(readonly: bool) -> Result<()> {
    let flags = if readonly {
        MountFlags::RDONLY
    } else {
        MountFlags::empty()
    };
    rustix::mount::mount_remount("/", flags, "").context("Remounting /")?;
    Ok(())
}

// create unsafe ioctl wrappers
#[allow(unsafe_code)]
#[allow(clippy::missing_safety_doc)]
mod ioctl {
    use nix::{ioctl_write_int_bad, request_code_none};
    ioctl_write_int_bad!(loop_set_fd, request_code_none!(0x4C, 0));
}

static LOOP_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Loop-mount an image file.  Loop devices are created on demand with
/// monotonic per-process numbering; nothing else in this environment
/// allocates them.
#[context("Loop-mounting {image} on {target}")]
pub(crate) fn mount_loop(
    image: &Utf8Path,
    target: &Utf8Path,
    fstype: &str,
    flags: MountFlags,
    data: &str,
) -> Result<()> {
    let file = File::options()
        .read(true)
        .write(true)
        .open(image)
        .with_context(|| format!("Opening image {image}"))?;

    let n = LOOP_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dev_path = format!("/dev/loop{n}");
    nix::sys::stat::mknod(
        dev_path.as_str(),
        nix::sys::stat::SFlag::S_IFBLK,
        nix::sys::stat::Mode::from_bits_truncate(0o600),
        nix::sys::stat::makedev(7, n as u64),
    )
    .with_context(|| format!("Creating {dev_path}"))?;

    let dev = File::options()
        .read(true)
        .write(true)
        .open(&dev_path)
        .with_context(|| format!("Opening {dev_path}"))?;
    #[allow(unsafe_code)]
    unsafe {
        ioctl::loop_set_fd(dev.as_raw_fd(), file.as_raw_fd())
    }
    .with_context(|| format!("LOOP_SET_FD on {dev_path}"))?;

    rustix::mount::mount(dev_path.as_str(), target.as_std_path(), fstype, flags, data)?;
    Ok(())
}

/// Wait for a device or file node to appear, up to `timeout`.
pub(crate) fn wait_for_file(path: &Utf8Path, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if path.exists() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    anyhow::bail!("Timed out waiting for {path}");
}

/// Create a directory (if missing) with an explicit mode and owner.
#[context("Creating {path}")]
pub(crate) fn mkdir_with_perms(path: &Utf8Path, mode: u32, owner: Option<(u32, u32)>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::create_dir(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    if let Some((uid, gid)) = owner {
        nix::unistd::chown(
            path.as_std_path(),
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )?;
    }
    Ok(())
}

/// Copy a single regular file, preserving nothing but the bytes.
pub(crate) fn copy_file(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    std::fs::copy(from, to).with_context(|| format!("Copying {from} to {to}"))?;
    Ok(())
}

/// Recursively copy a directory tree.
#[context("Copying tree {from} to {to}")]
pub(crate) fn copy_tree(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in from.read_dir_utf8()? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let dst = to.join(entry.file_name());
        if ty.is_dir() {
            copy_tree(entry.path(), &dst)?;
        } else if ty.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            let _ = std::fs::remove_file(&dst);
            std::os::unix::fs::symlink(link, &dst)?;
        } else {
            std::fs::copy(entry.path(), &dst)?;
        }
    }
    Ok(())
}

/// Resolve symlinks until a non-link path is reached, like the kernel
/// would.  Relative link targets resolve against the link's directory.
pub(crate) fn readlink_recursive(path: &Utf8Path) -> Utf8PathBuf {
    let mut cur = path.to_owned();
    for _ in 0..16 {
        match cur.symlink_metadata() {
            Ok(meta) if meta.is_symlink() => match std::fs::read_link(&cur) {
                Ok(next) => {
                    let Ok(next) = Utf8PathBuf::from_path_buf(next) else {
                        break;
                    };
                    cur = if next.is_absolute() {
                        next
                    } else {
                        cur.parent().unwrap_or(Utf8Path::new("/")).join(next)
                    };
                }
                Err(_) => break,
            },
            _ => break,
        }
    }
    cur
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readlink_recursive() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        std::fs::write(base.join("target"), b"x").unwrap();
        std::os::unix::fs::symlink("target", base.join("link1")).unwrap();
        std::os::unix::fs::symlink(base.join("link1"), base.join("link2")).unwrap();
        assert_eq!(readlink_recursive(&base.join("link2")), base.join("target"));
        // Non-links resolve to themselves.
        assert_eq!(readlink_recursive(&base.join("target")), base.join("target"));
    }

    #[test]
    fn test_copy_tree() {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap();
        let src = base.join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a"), b"a").unwrap();
        std::fs::write(src.join("sub/b"), b"b").unwrap();
        std::os::unix::fs::symlink("a", src.join("lnk")).unwrap();

        let dst = base.join("dst");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(std::fs::read(dst.join("a")).unwrap(), b"a");
        assert_eq!(std::fs::read(dst.join("sub/b")).unwrap(), b"b");
        assert!(dst.join("lnk").symlink_metadata().unwrap().is_symlink());
    }
}
