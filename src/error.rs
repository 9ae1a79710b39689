use std::fmt;

use serde_json::Error as JSONError;
use tokio_tungstenite::tungstenite::Error as WSError;
use url::ParseError;

use crate::messages::Message;

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum ErrorKind {
    WSError(WSError),
    URLError(ParseError),
    /// Malformed WAMP frame or a required field missing from a message.
    Protocol(String),
    /// Peer sent a message type the dispatcher has no processor for.
    Unsupported(u64),
    /// Authorization hook denied the request.
    Unauthorized(String),
    /// `CALL` named a procedure absent from the procedure table.
    UnknownProcedure(String),
    /// Redis publisher or subscriber connection failed.
    BackendUnavailable(redis::RedisError),
    JSONError(JSONError),
    InvalidMessageType(Message),
    InvalidState(&'static str),
    Timeout,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind }
    }

    fn get_description(&self) -> String {
        format!("WAMP error: {}", self.kind.description())
    }

    #[inline]
    pub fn get_kind(self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_description())
    }
}

impl std::error::Error for Error {}

impl ErrorKind {
    pub fn description(&self) -> String {
        match self {
            ErrorKind::WSError(e) => e.to_string(),
            ErrorKind::URLError(e) => e.to_string(),
            ErrorKind::Protocol(s) => s.clone(),
            ErrorKind::Unsupported(code) => format!("Unsupported message {}", code),
            ErrorKind::Unauthorized(s) => s.clone(),
            ErrorKind::UnknownProcedure(name) => {
                format!("The procedure {} doesn't exist", name)
            }
            ErrorKind::BackendUnavailable(e) => format!("Redis backend unavailable: {}", e),
            ErrorKind::JSONError(e) => e.to_string(),
            ErrorKind::InvalidMessageType(t) => format!("Invalid message type: {:?}", t),
            ErrorKind::InvalidState(s) => s.to_string(),
            ErrorKind::Timeout => "Connection timed out".to_string(),
        }
    }
}

impl From<WSError> for Error {
    fn from(e: WSError) -> Error {
        Error::new(ErrorKind::WSError(e))
    }
}

impl From<JSONError> for Error {
    fn from(e: JSONError) -> Error {
        Error::new(ErrorKind::JSONError(e))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Error {
        Error::new(ErrorKind::BackendUnavailable(e))
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Error {
        Error::new(ErrorKind::URLError(e))
    }
}
