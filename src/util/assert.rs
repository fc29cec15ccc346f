use crate::util::CONSTANTS;

/// Panics with a Firebase-styled internal assertion message when the condition is false.
///
/// Used for invariants whose violation means the sync engine routed something
/// incorrectly; these are never recoverable user errors.
#[track_caller]
pub fn assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

/// Unconditionally raises an internal assertion failure.
#[track_caller]
pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message))
}

/// Builds the string used for internal assertion failures.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "Firebase Database ({}) INTERNAL ASSERT FAILED: {}",
        CONSTANTS.sdk_version,
        message.as_ref()
    )
}
