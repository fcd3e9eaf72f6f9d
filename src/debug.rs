// Debug-mask gated tracing.  Every device and module owns a mask of enabled
// tags; a trace line is emitted only when its tag is present in the mask.
// Output goes through the `log` facade and, when a DEBUGFILE is configured,
// is appended to one shared file opened at startup.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use chrono::Local;
use once_cell::sync::OnceCell;

bitflags::bitflags! {
    pub struct DebugMask: u32 {
        const CMD    = 0x0001;
        const DATA   = 0x0002;
        const DETAIL = 0x0004;
        const EXP    = 0x0008;
        const POS    = 0x0010;
        const SENSE  = 0x0020;
        const IRQ    = 0x0040;
        const CONN   = 0x0080;
    }
}

impl DebugMask {
    /// Parses one uppercase debug tag, e.g. `CMD` or `DATA`.
    pub fn from_tag(tag: &str) -> Option<DebugMask> {
        match tag.to_ascii_uppercase().as_str() {
            "CMD" => Some(DebugMask::CMD),
            "DATA" => Some(DebugMask::DATA),
            "DETAIL" => Some(DebugMask::DETAIL),
            "EXP" => Some(DebugMask::EXP),
            "POS" => Some(DebugMask::POS),
            "SENSE" => Some(DebugMask::SENSE),
            "IRQ" => Some(DebugMask::IRQ),
            "CONN" => Some(DebugMask::CONN),
            "ALL" => Some(DebugMask::all()),
            _ => None,
        }
    }

    /// Parses a comma-free list of tags as they appear on a DEBUG line.
    pub fn from_tags<'a>(tags: impl Iterator<Item = &'a str>) -> Option<DebugMask> {
        let mut mask = DebugMask::empty();
        for t in tags {
            mask |= DebugMask::from_tag(t)?;
        }
        Some(mask)
    }
}

static DEBUG_FILE: OnceCell<Mutex<File>> = OnceCell::new();

/// Opens the shared debug file.  Called at most once, during configuration.
pub fn open_debug_file(path: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "=== em370 debug log {} ===", Local::now().format("%Y-%m-%d %H:%M:%S"))?;
    let _ = DEBUG_FILE.set(Mutex::new(file));
    Ok(())
}

/// Emits one gated trace line for a device or module.
pub fn trace(enabled: DebugMask, tag: DebugMask, unit: &str, text: &str) {
    if !enabled.intersects(tag) {
        return;
    }
    log::debug!("{}: {}", unit, text);
    if let Some(file) = DEBUG_FILE.get() {
        if let Ok(mut f) = file.lock() {
            let _ = writeln!(f, "{}: {}", unit, text);
        }
    }
}

/// Gated trace with lazy formatting.
#[macro_export]
macro_rules! dev_trace {
    ($enabled:expr, $tag:expr, $unit:expr, $($arg:tt)*) => {
        if $enabled.intersects($tag) {
            $crate::debug::trace($enabled, $tag, $unit, &format!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_parsing() {
        assert_eq!(DebugMask::from_tag("cmd"), Some(DebugMask::CMD));
        assert_eq!(DebugMask::from_tag("DATA"), Some(DebugMask::DATA));
        assert_eq!(DebugMask::from_tag("bogus"), None);
        let m = DebugMask::from_tags(["CMD", "DETAIL"].iter().copied()).unwrap();
        assert!(m.contains(DebugMask::CMD | DebugMask::DETAIL));
        assert!(!m.contains(DebugMask::DATA));
    }
}
