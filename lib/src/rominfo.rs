//! Parser for the per-Linux-ROM `rom_info.txt` descriptor.
//!
//! The file declares how to kexec the ROM: where the kernel and initrd
//! live, what root to pass, and the command line to assemble.  Values are
//! expanded with one-letter `%` macros after load.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

const ROOT_KEYS: &[&str] = &["root_dir", "root_img"];
const CMDLINE_KEYS: &[&str] = &["base_cmdline", "img_cmdline", "dir_cmdline"];

/// Inputs for macro expansion.
#[derive(Clone, Debug, Default)]
pub(crate) struct ExpandCtx {
    /// `%b` — command line from the bootloader, passed through.
    pub(crate) bootloader_cmdline: String,
    /// `%d` — root block device (`/dev/…` internal, `UUID=…` on USB).
    pub(crate) root_device: String,
    /// `%r` — root filesystem type.
    pub(crate) root_fstype: String,
    /// `%m` — ROM base directory relative to its partition root.
    pub(crate) rom_rel_base: String,
}

#[derive(Debug)]
pub(crate) struct RomInfo {
    vals: BTreeMap<String, String>,
}

impl RomInfo {
    #[context("Parsing {path}")]
    pub(crate) fn load(path: &Utf8Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Reading file")?;
        Self::parse(&content)
    }

    pub(crate) fn parse(content: &str) -> Result<Self> {
        let mut vals = BTreeMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else {
                continue;
            };
            match parse_quoted(val.trim()) {
                Some(val) => {
                    vals.insert(key.trim().to_string(), val.to_string());
                }
                None => tracing::error!("Line {}: failed to parse string value", lineno + 1),
            }
        }

        let info = Self { vals };
        info.validate()?;
        Ok(info)
    }

    fn validate(&self) -> Result<()> {
        if !ROOT_KEYS.iter().any(|k| self.vals.contains_key(*k)) {
            return Err(anyhow!("neither root_dir nor root_img is set"));
        }
        for key in ["type", "kernel_path", "base_cmdline"] {
            if !self.vals.contains_key(key) {
                return Err(anyhow!("required key \"{key}\" not found"));
            }
        }
        // Only supported type is kexec; the check keeps older releases
        // from trying to run ROMs meant for some future boot method.
        let ty = &self.vals["type"];
        if ty != "kexec" {
            return Err(anyhow!(
                "only supported rom_info type is \"kexec\", this one has \"{ty}\""
            ));
        }
        Ok(())
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.vals.get(key).map(String::as_str)
    }

    /// Run both macro passes: `%m` in the root path keys, then the
    /// cmdline tokens.
    pub(crate) fn expand(&mut self, ctx: &ExpandCtx) {
        tracing::info!("Replacing aliases in root paths...");
        for key in ROOT_KEYS {
            if let Some(val) = self.vals.get_mut(*key) {
                *val = val.replace("%m", &ctx.rom_rel_base);
            }
        }
        tracing::info!("Replacing aliases in the cmdline...");
        for key in CMDLINE_KEYS {
            if let Some(val) = self.vals.get(*key) {
                let expanded = expand_cmdline(val, ctx, &self.vals);
                self.vals.insert(key.to_string(), expanded);
            }
        }
    }
}

/// Values are double-quoted strings.
fn parse_quoted(val: &str) -> Option<&str> {
    let rest = val.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(&rest[..end])
}

fn expand_cmdline(input: &str, ctx: &ExpandCtx, vals: &BTreeMap<String, String>) -> String {
    let lookup = |key: &str, token: char| -> String {
        match vals.get(key) {
            Some(v) => v.clone(),
            None => {
                tracing::error!("%{token} alias found in cmdline, but {key} key was not found!");
                String::new()
            }
        }
    };
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('b') => out.push_str(&ctx.bootloader_cmdline),
            Some('d') => out.push_str(&ctx.root_device),
            Some('r') => out.push_str(&ctx.root_fstype),
            Some('s') => out.push_str(&lookup("root_dir", 's')),
            Some('i') => out.push_str(&lookup("root_img", 'i')),
            Some('f') => out.push_str(&lookup("root_img_fs", 'f')),
            Some(other) => {
                tracing::warn!("Unknown cmdline alias %{other}, leaving it in place");
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const UBUNTU: &str = indoc! {r#"
        # Ubuntu on a USB drive
        type="kexec"
        kernel_path="%r/boot/vmlinuz-*"
        initrd_path="%r/boot/initrd.img-*"
        root_img="%m/root.img"
        root_img_fs="ext4"
        base_cmdline="%b root=%d rootflags=subvol=@"
        img_cmdline="loop=%i loopfstype=%f"
    "#};

    fn ctx() -> ExpandCtx {
        ExpandCtx {
            bootloader_cmdline: "console=tty0".into(),
            root_device: "UUID=4C53-AA31".into(),
            root_fstype: "ext4".into(),
            rom_rel_base: "/multirom-flo/ubuntu".into(),
        }
    }

    #[test]
    fn test_parse_and_expand() {
        let mut info = RomInfo::parse(UBUNTU).unwrap();
        info.expand(&ctx());
        assert_eq!(info.get("root_img"), Some("/multirom-flo/ubuntu/root.img"));
        assert_eq!(
            info.get("base_cmdline"),
            Some("console=tty0 root=UUID=4C53-AA31 rootflags=subvol=@")
        );
        assert_eq!(
            info.get("img_cmdline"),
            Some("loop=%m/root.img loopfstype=ext4".replace("%m", "/multirom-flo/ubuntu").as_str())
        );
        // kernel_path keeps its %r; that one resolves against the mounted
        // root later.
        assert_eq!(info.get("kernel_path"), Some("%r/boot/vmlinuz-*"));
    }

    #[test]
    fn test_rejects_wrong_type() {
        let bad = UBUNTU.replace("type=\"kexec\"", "type=\"multiboot\"");
        assert!(RomInfo::parse(&bad).is_err());
    }

    #[test]
    fn test_rejects_missing_required_keys() {
        for key in ["type=", "kernel_path=", "base_cmdline="] {
            let without: String = UBUNTU
                .lines()
                .filter(|l| !l.starts_with(key))
                .collect::<Vec<_>>()
                .join("\n");
            assert!(RomInfo::parse(&without).is_err(), "should reject without {key}");
        }
        // Either root key alone is fine; neither is not.
        let without_roots: String = UBUNTU
            .lines()
            .filter(|l| !l.starts_with("root_img="))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(RomInfo::parse(&without_roots).is_err());
        let with_dir = format!("{without_roots}\nroot_dir=\"rootfs\"");
        assert!(RomInfo::parse(&with_dir).is_ok());
    }

    #[test]
    fn test_unknown_token_left_in_place() {
        let src = UBUNTU.replace(
            "base_cmdline=\"%b root=%d rootflags=subvol=@\"",
            "base_cmdline=\"%b quiet %z\"",
        );
        let mut info = RomInfo::parse(&src).unwrap();
        info.expand(&ctx());
        assert_eq!(info.get("base_cmdline"), Some("console=tty0 quiet %z"));
    }

    #[test]
    fn test_comments_and_garbage_ignored() {
        let src = indoc! {r#"
            # comment
            type="kexec"
            not a key value line
            unquoted=value
            kernel_path="vmlinuz"
            base_cmdline="root=/dev/sda1"
            root_dir="rootfs"
        "#};
        let info = RomInfo::parse(src).unwrap();
        assert_eq!(info.get("unquoted"), None);
        assert_eq!(info.get("root_dir"), Some("rootfs"));
    }
}
