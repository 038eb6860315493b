//! Region-tagged logging macros.
//!
//! A collection instance runs one task tree per replication region, and
//! everything it logs belongs to that region. These macros carry the region
//! tag as the `log` target, so one region's stream can be raised, lowered,
//! or silenced independently (`RUST_LOG=primary=debug,remote=warn`) and log
//! lines from the two regions never need untangling by eye.

/// Log at TRACE under a region tag.
#[macro_export]
macro_rules! region_trace {
    ($tag:expr, $($arg:tt)+) => {
        log::trace!(target: $tag, $($arg)+)
    };
}

/// Log at DEBUG under a region tag.
#[macro_export]
macro_rules! region_debug {
    ($tag:expr, $($arg:tt)+) => {
        log::debug!(target: $tag, $($arg)+)
    };
}

/// Log at INFO under a region tag.
#[macro_export]
macro_rules! region_info {
    ($tag:expr, $($arg:tt)+) => {
        log::info!(target: $tag, $($arg)+)
    };
}

/// Log at WARN under a region tag.
#[macro_export]
macro_rules! region_warn {
    ($tag:expr, $($arg:tt)+) => {
        log::warn!(target: $tag, $($arg)+)
    };
}

/// Log at ERROR under a region tag.
#[macro_export]
macro_rules! region_error {
    ($tag:expr, $($arg:tt)+) => {
        log::error!(target: $tag, $($arg)+)
    };
}

/// Log at ERROR under a region tag and produce the matching
/// `Err(BallastError)` in one step. For paths that both report a failure to
/// the region's stream and bubble it to the supervisor.
#[macro_export]
macro_rules! region_fail {
    ($tag:expr, $($arg:tt)+) => {{
        log::error!(target: $tag, $($arg)+);
        Err($crate::utils::BallastError::msg(format!($($arg)+)))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::BallastError;

    #[test]
    fn fail_returns_message_error() {
        let result: Result<(), BallastError> =
            region_fail!("primary", "machine {} vanished", "z3");
        assert_eq!(result, Err(BallastError::msg("machine z3 vanished")));
    }

    #[test]
    fn fail_without_arguments() {
        let result: Result<u32, BallastError> =
            region_fail!("remote", "no healthy machine team");
        assert_eq!(result, Err(BallastError::msg("no healthy machine team")));
    }
}
