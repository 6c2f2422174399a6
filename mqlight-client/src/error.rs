use std::fmt;

/// Classification of every failure the client can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed caller input, detected before anything is submitted.
    Argument,
    /// A numeric value is out of its allowed domain (qos, ttl).
    Range,
    /// The operation needs a started client.
    Stopped,
    /// The destination is already subscribed.
    Subscribed,
    /// There is no matching subscription.
    Unsubscribed,
    /// A blocking wait exceeded its deadline.
    Timeout,
    /// Authentication or TLS was rejected by the server.
    Security,
    /// The requested feature or input is not handled by the client.
    Unsupported,
    /// Recoverable transport failure reported by the engine.
    Network,
    /// Unexpected failure inside the client.
    Internal,
}

impl ErrorKind {
    /// Network failures are retried by the connection manager, everything else ends the
    /// connection attempt.
    pub fn is_recoverable(&self) -> bool {
        *self == ErrorKind::Network
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Argument => "ArgumentError",
            ErrorKind::Range => "RangeError",
            ErrorKind::Stopped => "StoppedError",
            ErrorKind::Subscribed => "SubscribedError",
            ErrorKind::Unsubscribed => "UnsubscribedError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Security => "SecurityError",
            ErrorKind::Unsupported => "UnsupportedError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::Internal => "InternalError",
        };

        f.write_str(name)
    }
}

/// Represents an error raised by the client API or reported by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Turn an error coming from the engine into a `ClientError`. Errors which are not
    /// `ClientError`s are treated as network failures, so they will be retried.
    pub fn from_engine(err: anyhow::Error) -> Self {
        match err.downcast::<ClientError>() {
            Ok(ce) => ce,
            Err(other) => ClientError::new(ErrorKind::Network, format!("{:#}", other)),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ClientError {}

/// Get the kind of an error returned by the client API, if it is a `ClientError`.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<ClientError>().map(|e| e.kind)
}

/// Shorthand for returning a `ClientError` wrapped in an `anyhow::Result`.
#[macro_export]
macro_rules! client_error {
    ($kind:ident, $message:expr) => {
        ::std::result::Result::Err(anyhow::Error::new($crate::error::ClientError {
            kind: $crate::error::ErrorKind::$kind,
            message: ::std::string::String::from($message),
        }))
    };
}
