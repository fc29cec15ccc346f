use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatabaseErrorCode {
    InvalidArgument,
    InvalidPath,
    Internal,
    PermissionDenied,
    Disconnected,
    /// A transaction gave up without committing.
    Aborted,
    /// Any other non-ok status reported by the server.
    ServerError(String),
}

impl DatabaseErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            DatabaseErrorCode::InvalidArgument => "database/invalid-argument",
            DatabaseErrorCode::InvalidPath => "database/invalid-path",
            DatabaseErrorCode::Internal => "database/internal",
            DatabaseErrorCode::PermissionDenied => "database/permission-denied",
            DatabaseErrorCode::Disconnected => "database/disconnected",
            DatabaseErrorCode::Aborted => "database/aborted",
            DatabaseErrorCode::ServerError(_) => "database/server-error",
        }
    }
}

#[derive(Clone, Debug)]
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

    pub fn code_str(&self) -> &str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Maps a status string reported by the transport (for a write or a listen)
    /// to an error, mirroring `errorForServerCode` in the JS SDK.
    pub fn from_server_status(status: &str, reason: Option<&str>) -> Self {
        let (code, default_reason) = match status {
            "permission_denied" => (
                DatabaseErrorCode::PermissionDenied,
                "Client doesn't have permission to access the desired data.",
            ),
            "unavailable" => (DatabaseErrorCode::ServerError(status.to_string()), "The service is unavailable"),
            "disconnect" => (
                DatabaseErrorCode::Disconnected,
                "The operation had to be aborted due to a network disconnect",
            ),
            "too_big" => (
                DatabaseErrorCode::ServerError(status.to_string()),
                "The data requested exceeds the maximum size that can be accessed with a single request.",
            ),
            other => (DatabaseErrorCode::ServerError(other.to_string()), "Unknown error"),
        };
        let mut message = format!("{}: {}", status.to_uppercase(), default_reason);
        if let Some(reason) = reason.filter(|reason| !reason.is_empty()) {
            message.push_str(" (");
            message.push_str(reason);
            message.push(')');
        }
        Self::new(code, message)
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

pub fn invalid_path(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::InvalidPath, message)
}

pub fn internal_error(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::Internal, message)
}

/// A transaction abandoned for `reason` (`set`, `maxretry`, ...).
pub fn aborted(reason: &str) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::Aborted, format!("Transaction aborted: {reason}"))
}

pub fn permission_denied(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::PermissionDenied, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_status_maps_permission_denied() {
        let err = DatabaseError::from_server_status("permission_denied", None);
        assert_eq!(err.code, DatabaseErrorCode::PermissionDenied);
        assert!(err.message().starts_with("PERMISSION_DENIED"));
    }

    #[test]
    fn server_status_keeps_unknown_codes_and_reason() {
        let err = DatabaseError::from_server_status("datastale", Some("retry later"));
        assert_eq!(err.code, DatabaseErrorCode::ServerError("datastale".into()));
        assert!(err.to_string().contains("(retry later)"));
        assert!(err.to_string().ends_with("(database/server-error)"));
    }
}
