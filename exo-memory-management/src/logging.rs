//! Unified logging support for exo-memory-management
//!
//! Call sites use the `mm_*` macros and never carry `#[cfg]` attributes. With
//! the `log` feature disabled the arguments are still type-checked but nothing
//! is emitted.

/// Unified trace-level logging
macro_rules! mm_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::trace!($($arg)*);
        #[cfg(not(feature = "log"))]
        { if false { let _ = core::format_args!($($arg)*); } }
    }
}

/// Unified debug-level logging
macro_rules! mm_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::debug!($($arg)*);
        #[cfg(not(feature = "log"))]
        { if false { let _ = core::format_args!($($arg)*); } }
    }
}

/// Unified info-level logging
macro_rules! mm_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::info!($($arg)*);
        #[cfg(not(feature = "log"))]
        { if false { let _ = core::format_args!($($arg)*); } }
    }
}

/// Unified warn-level logging
macro_rules! mm_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::warn!($($arg)*);
        #[cfg(not(feature = "log"))]
        { if false { let _ = core::format_args!($($arg)*); } }
    }
}

/// Unified error-level logging
macro_rules! mm_error {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::error!($($arg)*);
        #[cfg(not(feature = "log"))]
        { if false { let _ = core::format_args!($($arg)*); } }
    }
}
