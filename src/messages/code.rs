/// Integer discriminant of a WAMP message, used as the first element of its
/// JSON array framing and as the key the dispatcher routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Code {
    Hello = 1,
    Welcome = 2,
    Abort = 3,
    Goodbye = 6,
    Error = 8,
    Publish = 16,
    Published = 17,
    Subscribe = 32,
    Subscribed = 33,
    Unsubscribe = 34,
    Unsubscribed = 35,
    Event = 36,
    Call = 48,
    Result = 50,
}

impl Code {
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Whether a request of this code receives an `ERROR` reply on failure
    /// (§4.2: `build_error_for`).
    pub fn is_error_prone(self) -> bool {
        matches!(
            self,
            Code::Call | Code::Subscribe | Code::Unsubscribe | Code::Publish
        )
    }
}

impl TryFrom<u64> for Code {
    type Error = ();

    fn try_from(value: u64) -> Result<Code, ()> {
        Ok(match value {
            1 => Code::Hello,
            2 => Code::Welcome,
            3 => Code::Abort,
            6 => Code::Goodbye,
            8 => Code::Error,
            16 => Code::Publish,
            17 => Code::Published,
            32 => Code::Subscribe,
            33 => Code::Subscribed,
            34 => Code::Unsubscribe,
            35 => Code::Unsubscribed,
            36 => Code::Event,
            48 => Code::Call,
            50 => Code::Result,
            _ => return Err(()),
        })
    }
}

/// Whether the request-bearing code named by `request_code` is one that
/// receives an `ERROR` reply in this router (§4.2).
pub fn is_error_prone_code(request_code: u64) -> bool {
    matches!(request_code, 48 | 32 | 34 | 16)
}
