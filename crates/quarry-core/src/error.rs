//! Error types for Quarry driver operations.

use std::fmt;

/// The primary error type for all driver operations.
#[derive(Debug)]
pub enum Error {
    /// Transport-level errors (dial, authentication, lost connection)
    Connection(ConnectionError),
    /// Wire-protocol violations (bad length, bad sequence id, unexpected byte)
    Protocol(ProtocolError),
    /// An error reported by the server in an error packet
    Server(ServerError),
    /// A parameter could not be encoded for the wire
    Encoding(EncodingError),
    /// I/O errors from the underlying byte stream
    Io(std::io::Error),
    /// Configuration errors (malformed DSN, unknown protocol scheme)
    Config(String),
    /// The server returned a result set, so the number of affected rows is unknown
    UnknownRowsAffected,
    /// The server returned a result set, so the last insert id is unknown
    UnknownLastInsertId,
}

/// A transport-level connection error.
#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish the connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during an operation
    Disconnected,
}

/// A wire-protocol violation. The connection is unusable afterwards.
#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
}

/// An error packet decoded from the server. The connection remains usable.
#[derive(Debug, Clone)]
pub struct ServerError {
    /// Server error code, e.g. 1146 for ER_NO_SUCH_TABLE
    pub code: u16,
    /// Five-character SQLSTATE
    pub sql_state: String,
    /// Human-readable message
    pub message: String,
}

/// A bound parameter that could not be encoded. Nothing has been sent,
/// so the connection remains usable.
#[derive(Debug)]
pub struct EncodingError {
    pub message: String,
}

impl Error {
    /// Whether the connection must be discarded after this error.
    ///
    /// Server and encoding errors leave the connection on a packet
    /// boundary; everything else may have left a command half-sent or
    /// half-read.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Server(_) | Error::Encoding(_) | Error::Config(_) => false,
            Error::UnknownRowsAffected | Error::UnknownLastInsertId => false,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_) => true,
        }
    }

    /// The server error code, if this is a server-reported error.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Server(e) => e.fmt(f),
            Error::Encoding(e) => write!(f, "Encoding error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::UnknownRowsAffected => {
                write!(f, "Server did not report the number of rows affected")
            }
            Error::UnknownLastInsertId => {
                write!(f, "Server did not report a last insert id")
            }
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MySQL Server Error. Code={}, SqlState=#{}, Message={:?}",
            self.code, self.sql_state, self.message
        )
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<EncodingError> for Error {
    fn from(err: EncodingError) -> Self {
        Error::Encoding(err)
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_format() {
        let err = Error::Server(ServerError {
            code: 1146,
            sql_state: "42S02".to_string(),
            message: "Table 'test.missing' doesn't exist".to_string(),
        });
        let text = err.to_string();
        assert!(text.contains("Code=1146"));
        assert!(text.contains("SqlState=#42S02"));
        assert!(text.contains("doesn't exist"));
    }

    #[test]
    fn fatality_classification() {
        let protocol = Error::Protocol(ProtocolError {
            message: "bad sequence id".to_string(),
        });
        assert!(protocol.is_fatal());

        let server = Error::Server(ServerError {
            code: 1064,
            sql_state: "42000".to_string(),
            message: "syntax".to_string(),
        });
        assert!(!server.is_fatal());

        assert!(!Error::UnknownRowsAffected.is_fatal());
        assert!(!Error::UnknownLastInsertId.is_fatal());
        assert!(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).is_fatal());
    }

    #[test]
    fn sentinel_messages_are_distinct() {
        assert_ne!(
            Error::UnknownRowsAffected.to_string(),
            Error::UnknownLastInsertId.to_string()
        );
    }

    #[test]
    fn server_code_accessor() {
        let err = Error::Server(ServerError {
            code: 1062,
            sql_state: "23000".to_string(),
            message: "dup".to_string(),
        });
        assert_eq!(err.server_code(), Some(1062));
        assert_eq!(Error::UnknownRowsAffected.server_code(), None);
    }
}
