//! Display-level infrastructure and identity constants for the `mercount`
//! command-line tool.

use std::sync::atomic::{AtomicU32, Ordering};

pub const TOOL_NAME: &str = "mercount";

/// Default database filename for `count` when `-o` is not given.
pub const DEFAULT_OUTPUT: &str = "mer_counts.jf";

// ── Display level ─────────────────────────────────────────────────────────────
//
// 0 = silent; 1 = errors only; 2 = normal; 3 = info; 4 = debug.
// Crate-wide atomic so library modules can emit progress lines through the
// same gate as the CLI.
pub static DISPLAY_LEVEL: AtomicU32 = AtomicU32::new(2);

/// Returns the current display level.
#[inline]
pub fn display_level() -> u32 {
    DISPLAY_LEVEL.load(Ordering::Relaxed)
}

/// Sets the display level.
#[inline]
pub fn set_display_level(level: u32) {
    DISPLAY_LEVEL.store(level, Ordering::Relaxed);
}

/// Conditionally print to stderr at or above `level`.
#[macro_export]
macro_rules! displaylevel {
    ($level:expr, $($arg:tt)*) => {
        if $crate::cli::constants::display_level() >= $level {
            eprintln!($($arg)*);
        }
    };
}
