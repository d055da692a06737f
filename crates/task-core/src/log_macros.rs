/// Domain-aware logging macros.
///
/// Each macro injects a `domain` field so call sites never need to remember
/// the string literal. The domain is one of: `lifecycle` (state machine,
/// start/cancel/finish paths), `queue` (the per-Task event queue), `exclusivity`
/// (the category registry), `observer` (the observer fabric), `condition`
/// (the condition evaluator).
///
/// # Usage
///
/// ```ignore
/// use crate::log_macros::*;
///
/// tc_info!(lifecycle, task = %id, "task finished");
/// tc_warn!(condition, task = %id, error = %e, "condition evaluation failed");
/// tc_debug!(queue, task = %id, "dispatched block");
/// ```

#[doc(hidden)]
macro_rules! tc_log {
    ($level:ident, $domain:ident, $($field:tt)*) => {
        tracing::$level!(domain = stringify!($domain), $($field)*)
    };
}

/// Log at ERROR level with an automatic `domain` field.
macro_rules! tc_error {
    ($domain:ident, $($rest:tt)*) => {
        tc_log!(error, $domain, $($rest)*)
    };
}

/// Log at WARN level with an automatic `domain` field.
macro_rules! tc_warn {
    ($domain:ident, $($rest:tt)*) => {
        tc_log!(warn, $domain, $($rest)*)
    };
}

/// Log at INFO level with an automatic `domain` field.
macro_rules! tc_info {
    ($domain:ident, $($rest:tt)*) => {
        tc_log!(info, $domain, $($rest)*)
    };
}

/// Log at DEBUG level with an automatic `domain` field.
macro_rules! tc_debug {
    ($domain:ident, $($rest:tt)*) => {
        tc_log!(debug, $domain, $($rest)*)
    };
}

/// Log at TRACE level with an automatic `domain` field.
#[allow(unused_macros)]
macro_rules! tc_trace {
    ($domain:ident, $($rest:tt)*) => {
        tc_log!(trace, $domain, $($rest)*)
    };
}

pub(crate) use tc_debug;
pub(crate) use tc_error;
pub(crate) use tc_info;
pub(crate) use tc_log;
pub(crate) use tc_warn;
