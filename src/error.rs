use crate::dialog::DialogId;
use crate::message::parser::ParseError;
use crate::transaction::key::TransactionKey;
use crate::transport::SipAddr;

/// Crate-wide error type.
///
/// Variants carry the identifier of the entity they belong to so a caller
/// holding many transactions or dialogs can attribute a failure without
/// string matching.
#[derive(Debug)]
pub enum Error {
    /// Malformed input bytes, with kind and byte offset.
    ParseError(ParseError),
    /// Syntactically valid but semantically illegal message.
    ProtocolError(String),
    /// Digest credential verification failed or a nonce went stale.
    AuthError(String),
    /// Transaction layer failure for a specific transaction.
    TransactionError(String, TransactionKey),
    /// Timer B, F or H expired before a final response.
    TransactionTimeout(TransactionKey),
    /// The transport could not deliver to the given address.
    TransportError(String, SipAddr),
    /// Dialog layer failure for a specific dialog.
    DialogError(String, DialogId),
    /// Registrar rejected the operation.
    RegistrarError(String),
    Io(std::io::Error),
    Error(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ParseError(e) => write!(f, "parse error: {}", e),
            Error::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            Error::AuthError(msg) => write!(f, "auth error: {}", msg),
            Error::TransactionError(msg, key) => {
                write!(f, "transaction error: {} ({})", msg, key)
            }
            Error::TransactionTimeout(key) => write!(f, "transaction timeout ({})", key),
            Error::TransportError(msg, addr) => {
                write!(f, "transport error: {} ({})", msg, addr)
            }
            Error::DialogError(msg, id) => write!(f, "dialog error: {} ({})", msg, id),
            Error::RegistrarError(msg) => write!(f, "registrar error: {}", msg),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Error(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::ParseError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::ParseError(e)
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::Error(format!("invalid address: {}", e))
    }
}
