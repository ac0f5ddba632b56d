//! Leveled debug prints, gated by the `PAIO_LOG` environment variable.
//!
//! Levels: 0=off, 1=error, 2=warn, 3=info, 4=debug. Off by default; the
//! variable is read once on first use. Output goes to stderr.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Once;

static LEVEL: AtomicU8 = AtomicU8::new(0);
static INIT: Once = Once::new();

/// Current log level, parsing `PAIO_LOG` on first call.
#[doc(hidden)]
pub fn level() -> u8 {
    INIT.call_once(|| {
        let lv = std::env::var("PAIO_LOG")
            .ok()
            .and_then(|v| v.parse::<u8>().ok())
            .unwrap_or(0);
        LEVEL.store(lv.min(4), Ordering::Relaxed);
    });
    LEVEL.load(Ordering::Relaxed)
}

#[macro_export]
macro_rules! perror {
    ($($arg:tt)*) => {
        if $crate::kprint::level() >= 1 {
            eprintln!("paio [ERROR] {}", format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! pwarn {
    ($($arg:tt)*) => {
        if $crate::kprint::level() >= 2 {
            eprintln!("paio [WARN]  {}", format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! pinfo {
    ($($arg:tt)*) => {
        if $crate::kprint::level() >= 3 {
            eprintln!("paio [INFO]  {}", format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! pdebug {
    ($($arg:tt)*) => {
        if $crate::kprint::level() >= 4 {
            eprintln!("paio [DEBUG] {}", format_args!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_defaults_to_off() {
        // PAIO_LOG is unset in the test environment
        assert!(level() <= 4);
    }
}
