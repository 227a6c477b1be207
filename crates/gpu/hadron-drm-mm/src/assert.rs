//! Contract assertions.
//!
//! Misuse of the allocator (removing a free node, unwinding a scan out of
//! order, structural calls during a scan) is a caller bug, never a
//! recoverable error. Two macros report it:
//!
//! | Macro | Debug build | Release + `hadron_drm_debug_mm` | Release |
//! |-------|-------------|---------------------------------|---------|
//! | [`mm_bug_on!`] | logs + panics | logs + panics | logs + panics |
//! | [`mm_debug_bug_on!`] | logs + panics | logs + panics | compiled away (still type-checked) |
//!
//! `mm_bug_on!` guards O(1) state checks whose violation would corrupt the
//! node lists. `mm_debug_bug_on!` guards consistency checks that only a
//! broken allocator or a misbehaving color strategy can trip.

/// Panics, after logging at error level, when `$cond` holds.
macro_rules! mm_bug_on {
    ($cond:expr $(,)?) => {
        if $cond {
            $crate::log::mm_error!("drm_mm: BUG: {}", stringify!($cond));
            panic!("drm_mm: BUG: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if $cond {
            $crate::log::mm_error!("drm_mm: BUG: {}", format_args!($($arg)+));
            panic!("drm_mm: BUG: {}", format_args!($($arg)+));
        }
    };
}

/// Like [`mm_bug_on!`], but only checked in debug builds or with
/// `--cfg hadron_drm_debug_mm`.
macro_rules! mm_debug_bug_on {
    ($($arg:tt)+) => {
        #[cfg(any(debug_assertions, hadron_drm_debug_mm))]
        {
            $crate::assert::mm_bug_on!($($arg)+);
        }
        #[cfg(not(any(debug_assertions, hadron_drm_debug_mm)))]
        {
            if false {
                $crate::assert::mm_bug_on!($($arg)+);
            }
        }
    };
}

pub(crate) use {mm_bug_on, mm_debug_bug_on};

#[cfg(test)]
mod tests {
    use crate::log::{LogLevel, capture};

    #[test]
    fn bug_on_passes_when_false() {
        mm_bug_on!(1 + 1 == 3);
        mm_debug_bug_on!(false, "never {}", 1);
    }

    #[test]
    fn bug_on_logs_before_panicking() {
        let _guard = capture::install();
        let result = std::panic::catch_unwind(|| {
            mm_bug_on!(true, "node {} not allocated", 7);
        });
        assert!(result.is_err());
        assert!(capture::lines().iter().any(|(level, line)| {
            *level == LogLevel::Error && line == "drm_mm: BUG: node 7 not allocated"
        }));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "drm_mm: BUG")]
    fn debug_bug_on_fires_in_debug_builds() {
        mm_debug_bug_on!(true);
    }
}
