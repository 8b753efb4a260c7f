//! Supporting utility type.
mod bytestr;
pub use bytestr::ByteStr;

/// Trace when `verbose` feature enabled.
///
/// A format string message still type checks its arguments when disabled.
macro_rules! verbose {
    ($fmt:literal $($tt:tt)*) => {{
        #[cfg(not(feature = "verbose"))]
        if false { let _ = format_args!($fmt $($tt)*); }
        #[cfg(feature = "verbose")]
        tracing::trace!($fmt $($tt)*);
    }};
    ($($tt:tt)*) => {{
        #[cfg(feature = "verbose")]
        tracing::trace!($($tt)*);
    }};
}

/// `log::warn` when `log` feature enabled.
macro_rules! log_warn {
    ($($tt:tt)*) => {{
        #[cfg(not(feature = "log"))]
        if false { let _ = format_args!($($tt)*); }
        #[cfg(feature = "log")]
        log::warn!($($tt)*);
    }};
}

/// `log::info` when `log` feature enabled.
macro_rules! log_info {
    ($($tt:tt)*) => {{
        #[cfg(not(feature = "log"))]
        if false { let _ = format_args!($($tt)*); }
        #[cfg(feature = "log")]
        log::info!($($tt)*);
    }};
}

/// `log::debug` when `log` feature enabled.
macro_rules! log_debug {
    ($($tt:tt)*) => {{
        #[cfg(not(feature = "log"))]
        if false { let _ = format_args!($($tt)*); }
        #[cfg(feature = "log")]
        log::debug!($($tt)*);
    }};
}

pub(crate) use verbose;
pub(crate) use log_warn;
pub(crate) use log_info;
pub(crate) use log_debug;

#[cfg(test)]
mod test {
    #[test]
    fn log_macros_as_match_arms() {
        for severity in ["WARNING", "NOTICE", "DEBUG", "LOG"] {
            match severity {
                "WARNING" => log_warn!("{severity}"),
                "NOTICE" => log_info!("{severity}"),
                "DEBUG" => log_debug!("{}", severity),
                _ => verbose!(severity, "other"),
            }
        }
        let () = if cfg!(feature = "verbose") { verbose!("on") } else { verbose!("off") };
    }
}
