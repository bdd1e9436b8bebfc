use std::fmt::{Display, Formatter};

/// Error codes surfaced by the sync core.
///
/// The argument/internal codes come from fallible builders; the remaining
/// ones are the reasons a transport reports when it cancels a listen, and
/// reach listeners through `on_cancelled`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DatabaseErrorCode {
    InvalidArgument,
    Internal,
    PermissionDenied,
    Disconnected,
    ExpiredToken,
    InvalidToken,
    MaxRetries,
    NetworkError,
    OperationFailed,
    OverriddenBySet,
    Unavailable,
    WriteCanceled,
    Unknown,
}

impl DatabaseErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseErrorCode::InvalidArgument => "database/invalid-argument",
            DatabaseErrorCode::Internal => "database/internal",
            DatabaseErrorCode::PermissionDenied => "database/permission-denied",
            DatabaseErrorCode::Disconnected => "database/disconnected",
            DatabaseErrorCode::ExpiredToken => "database/expired-token",
            DatabaseErrorCode::InvalidToken => "database/invalid-token",
            DatabaseErrorCode::MaxRetries => "database/max-retries",
            DatabaseErrorCode::NetworkError => "database/network-error",
            DatabaseErrorCode::OperationFailed => "database/operation-failed",
            DatabaseErrorCode::OverriddenBySet => "database/overridden-by-set",
            DatabaseErrorCode::Unavailable => "database/unavailable",
            DatabaseErrorCode::WriteCanceled => "database/write-canceled",
            DatabaseErrorCode::Unknown => "database/unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseError {
    pub code: DatabaseErrorCode,
    message: String,
}

impl DatabaseError {
    pub fn new(code: DatabaseErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for DatabaseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for DatabaseError {}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

pub fn invalid_argument(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::Internal, message)
}

pub fn permission_denied(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::PermissionDenied, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let err = permission_denied("listen revoked");
        assert_eq!(err.to_string(), "listen revoked (database/permission-denied)");
        assert_eq!(err.message(), "listen revoked");
    }

    #[test]
    fn codes_are_namespaced() {
        assert_eq!(
            DatabaseError::new(DatabaseErrorCode::OverriddenBySet, "x").code_str(),
            "database/overridden-by-set"
        );
        assert_eq!(invalid_argument("x").code, DatabaseErrorCode::InvalidArgument);
        assert_eq!(internal_error("x").code_str(), "database/internal");
    }
}
