use crate::util::constants::CONSTANTS;

/// Panic with a Firebase-styled internal assertion message when the condition is false.
///
/// Used for invariants whose violation means the sync core itself is corrupt
/// (for example a tagged operation arriving for a view that does not exist).
pub fn assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        panic!("{}", assertion_error(message));
    }
}

/// Development-only variant of [`assert`].
///
/// Debug builds panic exactly like [`assert`]; release builds log the broken
/// invariant and keep going, leaving the caller to fall back to a total
/// behavior.
pub fn dev_assert(condition: bool, message: impl AsRef<str>) {
    if condition {
        return;
    }
    if cfg!(debug_assertions) {
        panic!("{}", assertion_error(message));
    }
    log::error!("{}", assertion_error(message));
}

/// Build the string used when raising assertion errors to keep parity with the other SDKs.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "Firebase ({}) INTERNAL ASSERT FAILED: {}",
        CONSTANTS.sdk_version,
        message.as_ref()
    )
}
