use thiserror::Error;

pub type BoxResult<T> = Result<T, BoxError>;

#[derive(Debug, Error)]
pub enum BoxError {
    #[error("name already in use: {0}")]
    NameCollision(String),

    #[error("package not found")]
    NotFound,

    #[error("download limit reached")]
    LimitReached,

    #[error("integrity check failed")]
    IntegrityFailed,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("memory pinning failed: {0}")]
    PinningFailed(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),
}

/// Fieldless discriminant of [`BoxError`], for log fields and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NameCollision,
    NotFound,
    LimitReached,
    IntegrityFailed,
    AuthenticationFailed,
    PinningFailed,
    Io,
    Cancelled,
    Crypto,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NameCollision => "name_collision",
            ErrorKind::NotFound => "not_found",
            ErrorKind::LimitReached => "limit_reached",
            ErrorKind::IntegrityFailed => "integrity_failed",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::PinningFailed => "pinning_failed",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BoxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BoxError::NameCollision(_) => ErrorKind::NameCollision,
            BoxError::NotFound => ErrorKind::NotFound,
            BoxError::LimitReached => ErrorKind::LimitReached,
            BoxError::IntegrityFailed => ErrorKind::IntegrityFailed,
            BoxError::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            BoxError::PinningFailed(_) => ErrorKind::PinningFailed,
            BoxError::Io(_) => ErrorKind::Io,
            BoxError::Cancelled => ErrorKind::Cancelled,
            BoxError::Crypto(_) => ErrorKind::Crypto,
            BoxError::Config(_) => ErrorKind::Config,
        }
    }

    /// Message safe to show to a remote client.
    ///
    /// Never includes names, paths, digests or OS error text; the structured
    /// error itself is for logs only.
    pub fn user_message(&self) -> &'static str {
        match self {
            BoxError::NameCollision(_) => "Could not allocate a link, please try again.",
            BoxError::NotFound => "File not found.",
            BoxError::LimitReached => "Download limit reached.",
            BoxError::IntegrityFailed => "Invalid checksum.",
            BoxError::AuthenticationFailed => "Invalid password.",
            BoxError::PinningFailed(_) => "Error securing memory for your files.",
            BoxError::Io(_) => "Error writing your files to memory.",
            BoxError::Cancelled => "Upload took too long and was cancelled.",
            BoxError::Crypto(_) => "Error encrypting buffer.",
            BoxError::Config(_) => "Server misconfigured.",
        }
    }

    /// True for errors that end a download request with no automatic retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BoxError::IntegrityFailed | BoxError::AuthenticationFailed | BoxError::LimitReached
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(BoxError::NotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            BoxError::NameCollision("x".into()).kind(),
            ErrorKind::NameCollision
        );
        let pin = BoxError::PinningFailed(std::io::Error::from_raw_os_error(12));
        assert_eq!(pin.kind(), ErrorKind::PinningFailed);
        assert_eq!(pin.kind().as_str(), "pinning_failed");
    }

    #[test]
    fn user_messages_do_not_leak_details() {
        let err = BoxError::NameCollision("wobblesnout".into());
        assert!(!err.user_message().contains("wobblesnout"));

        let io = BoxError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "/var/tmp/secret-path",
        ));
        assert!(io.to_string().contains("/var/tmp/secret-path"));
        assert!(!io.user_message().contains("/var/tmp"));
    }

    #[test]
    fn terminal_errors() {
        assert!(BoxError::IntegrityFailed.is_terminal());
        assert!(BoxError::AuthenticationFailed.is_terminal());
        assert!(!BoxError::NotFound.is_terminal());
        assert!(!BoxError::Cancelled.is_terminal());
    }
}
