//! The `multirom.ini` status store.
//!
//! Line-oriented `key=value`; unknown keys are carried through a
//! load/save cycle verbatim so newer installations can share the file
//! with older ones.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

// Historical encoding of the auto_boot_type bitset.  In memory the
// "how to select" part and the "what to do this boot" latch are separate
// fields; the file keeps the combined number for compatibility.
const AUTOBOOT_NAME: u32 = 0x01;
const AUTOBOOT_LAST: u32 = 0x02;
const AUTOBOOT_FORCE_CURRENT: u32 = 0x04;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum AutoBootMode {
    /// Boot the ROM named by `auto_boot_rom`.
    #[default]
    Name,
    /// Boot whatever booted last.
    Last,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Status {
    /// A kexec into a secondary is pending or in progress.  Also derived
    /// at startup from the kernel-log sentinel and the boot slot tag, in
    /// case this file never hit the disk.
    pub(crate) is_second_boot: bool,
    pub(crate) current_rom: String,
    /// UUID of the partition owning `current_rom`; `None` for internal.
    pub(crate) curr_rom_part: Option<String>,
    pub(crate) auto_boot_seconds: u32,
    pub(crate) auto_boot_rom: String,
    pub(crate) auto_boot_mode: AutoBootMode,
    /// One-shot latch: boot `current_rom` without UI on the next boot.
    pub(crate) force_current: bool,
    pub(crate) colors: i32,
    pub(crate) brightness: i32,
    pub(crate) enable_adb: bool,
    pub(crate) hide_internal: bool,
    pub(crate) int_display_name: Option<String>,
    pub(crate) rotation: i32,
    /// No-kexec policy bitset; see [`crate::nokexec`].
    pub(crate) no_kexec: u32,
    /// Keys this version does not understand, preserved verbatim.
    unknown: Vec<(String, String)>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_second_boot: false,
            current_rom: crate::paths::INTERNAL_ROM_NAME.to_string(),
            curr_rom_part: None,
            auto_boot_seconds: 5,
            auto_boot_rom: crate::paths::INTERNAL_ROM_NAME.to_string(),
            auto_boot_mode: AutoBootMode::Name,
            force_current: false,
            colors: 0,
            brightness: 40,
            enable_adb: false,
            hide_internal: false,
            int_display_name: None,
            rotation: 0,
            no_kexec: 0,
            unknown: Vec::new(),
        }
    }
}

impl Status {
    #[context("Loading status from {path}")]
    pub(crate) fn load(path: &Utf8Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No status file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).context("Reading file"),
        }
    }

    pub(crate) fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let Some((key, val)) = line.split_once('=') else {
                continue;
            };
            match key {
                "is_second_boot" => s.is_second_boot = val != "0",
                "current_rom" => s.current_rom = val.to_string(),
                "auto_boot_seconds" => s.auto_boot_seconds = val.parse().unwrap_or(5),
                "auto_boot_rom" => s.auto_boot_rom = val.to_string(),
                "auto_boot_type" => {
                    let bits: u32 = val.parse().unwrap_or(AUTOBOOT_NAME);
                    s.auto_boot_mode = if bits & AUTOBOOT_LAST != 0 {
                        AutoBootMode::Last
                    } else {
                        AutoBootMode::Name
                    };
                    s.force_current = bits & AUTOBOOT_FORCE_CURRENT != 0;
                }
                "curr_rom_part" => {
                    s.curr_rom_part = (!val.is_empty()).then(|| val.to_string());
                }
                "colors" => s.colors = val.parse().unwrap_or(0),
                "brightness" => s.brightness = val.parse().unwrap_or(40),
                "enable_adb" => s.enable_adb = val != "0",
                "hide_internal" => s.hide_internal = val != "0",
                "int_display_name" => {
                    s.int_display_name = (!val.is_empty()).then(|| val.to_string());
                }
                "rotation" => s.rotation = val.parse().unwrap_or(0),
                "no_kexec" => s.no_kexec = val.parse().unwrap_or(0),
                _ => s.unknown.push((key.to_string(), val.to_string())),
            }
        }
        s
    }

    fn auto_boot_type_bits(&self) -> u32 {
        let mut bits = match self.auto_boot_mode {
            AutoBootMode::Name => AUTOBOOT_NAME,
            AutoBootMode::Last => AUTOBOOT_LAST,
        };
        if self.force_current {
            bits |= AUTOBOOT_FORCE_CURRENT;
        }
        bits
    }

    pub(crate) fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "is_second_boot={}", self.is_second_boot as u8);
        let _ = writeln!(out, "current_rom={}", self.current_rom);
        let _ = writeln!(out, "auto_boot_seconds={}", self.auto_boot_seconds);
        let _ = writeln!(out, "auto_boot_rom={}", self.auto_boot_rom);
        let _ = writeln!(out, "auto_boot_type={}", self.auto_boot_type_bits());
        let _ = writeln!(
            out,
            "curr_rom_part={}",
            self.curr_rom_part.as_deref().unwrap_or("")
        );
        let _ = writeln!(out, "colors={}", self.colors);
        let _ = writeln!(out, "brightness={}", self.brightness);
        let _ = writeln!(out, "enable_adb={}", self.enable_adb as u8);
        let _ = writeln!(out, "hide_internal={}", self.hide_internal as u8);
        let _ = writeln!(
            out,
            "int_display_name={}",
            self.int_display_name.as_deref().unwrap_or("")
        );
        let _ = writeln!(out, "rotation={}", self.rotation);
        let _ = writeln!(out, "no_kexec={}", self.no_kexec);
        for (key, val) in &self.unknown {
            let _ = writeln!(out, "{key}={val}");
        }
        out
    }

    #[context("Saving status to {path}")]
    pub(crate) fn save(&self, path: &Utf8Path) -> Result<()> {
        tracing::info!("Saving multirom status");
        std::fs::write(path, self.render())?;
        Ok(())
    }

    pub(crate) fn dump(&self) {
        tracing::info!("Dumping multirom status:");
        tracing::info!("  is_second_boot={}", self.is_second_boot);
        tracing::info!("  current_rom={}", self.current_rom);
        tracing::info!("  curr_rom_part={:?}", self.curr_rom_part);
        tracing::info!(
            "  auto_boot: rom={} seconds={} mode={:?} force_current={}",
            self.auto_boot_rom,
            self.auto_boot_seconds,
            self.auto_boot_mode,
            self.force_current
        );
        tracing::info!(
            "  colors={} brightness={} enable_adb={} hide_internal={} rotation={}",
            self.colors,
            self.brightness,
            self.enable_adb,
            self.hide_internal,
            self.rotation
        );
        tracing::info!("  no_kexec={:#x}", self.no_kexec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn test_defaults() {
        let s = Status::parse("");
        assert_eq!(s, Status::default());
        assert_eq!(s.current_rom, "Internal");
        assert_eq!(s.auto_boot_seconds, 5);
        assert_eq!(s.brightness, 40);
    }

    #[test]
    fn test_parse_fields() {
        let s = Status::parse(
            "current_rom=CM13\nauto_boot_seconds=10\nauto_boot_rom=Ubuntu\n\
             auto_boot_type=6\ncurr_rom_part=4C53-AA31\ncolors=2\nbrightness=80\n\
             enable_adb=1\nhide_internal=1\nint_display_name=Stock\nrotation=270\n",
        );
        assert_eq!(s.current_rom, "CM13");
        assert_eq!(s.auto_boot_seconds, 10);
        assert_eq!(s.auto_boot_rom, "Ubuntu");
        assert_eq!(s.auto_boot_mode, AutoBootMode::Last);
        assert!(s.force_current);
        assert_eq!(s.curr_rom_part.as_deref(), Some("4C53-AA31"));
        assert!(s.enable_adb);
        assert!(s.hide_internal);
        assert_eq!(s.int_display_name.as_deref(), Some("Stock"));
        assert_eq!(s.rotation, 270);
    }

    #[test]
    fn test_autoboot_bitset_compat() {
        // Old files wrote NAME=1, LAST=2, FORCE_CURRENT=4 combinations.
        let s = Status::parse("auto_boot_type=1\n");
        assert_eq!(s.auto_boot_mode, AutoBootMode::Name);
        assert!(!s.force_current);

        let s = Status::parse("auto_boot_type=5\n");
        assert_eq!(s.auto_boot_mode, AutoBootMode::Name);
        assert!(s.force_current);

        let mut s = Status::default();
        s.auto_boot_mode = AutoBootMode::Last;
        s.force_current = true;
        assert!(s.render().contains("auto_boot_type=6\n"));
    }

    #[test]
    fn test_roundtrip_with_unknown_keys() {
        let mut s = Status::default();
        s.current_rom = "CM13".into();
        s.curr_rom_part = Some("aa-bb".into());
        s.unknown
            .push(("future_key".to_string(), "some value".to_string()));
        let rendered = s.render();
        assert!(rendered.contains("future_key=some value\n"));

        // save(load(x)) == x for a previously-saved file.
        let reloaded = Status::parse(&rendered);
        assert_eq!(reloaded, s);
        assert_eq!(reloaded.render(), rendered);
    }

    #[test]
    fn test_load_missing_file() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().join("multirom.ini");
        let s = Status::load(&path).unwrap();
        assert_eq!(s, Status::default());
    }
}
