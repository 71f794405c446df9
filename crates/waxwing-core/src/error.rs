use std::fmt;
use std::io;

/// Three-digit reply code from RFC 3080 section 8.
///
/// Carried by `<close>` and `<error>` channel-management elements and by
/// the error variants surfaced to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReplyCode(pub u16);

impl ReplyCode {
    /// Success.
    pub const SUCCESS: ReplyCode = ReplyCode(200);
    /// Service not available.
    pub const NOT_AVAILABLE: ReplyCode = ReplyCode(421);
    /// Requested action not taken (e.g. lock already in use).
    pub const ACTION_NOT_TAKEN: ReplyCode = ReplyCode(450);
    /// Requested action aborted (e.g. local error in processing).
    pub const ACTION_ABORTED: ReplyCode = ReplyCode(451);
    /// General syntax error (e.g. poorly-formed XML).
    pub const SYNTAX_ERROR: ReplyCode = ReplyCode(500);
    /// Syntax error in parameters (e.g. non-valid XML).
    pub const PARAMETER_SYNTAX_ERROR: ReplyCode = ReplyCode(501);
    /// Parameter not implemented.
    pub const PARAMETER_NOT_IMPLEMENTED: ReplyCode = ReplyCode(504);
    /// Requested action not taken (e.g. no requested profiles are
    /// acceptable).
    pub const ACTION_NOT_ALLOWED: ReplyCode = ReplyCode(550);
    /// Parameter invalid.
    pub const PARAMETER_INVALID: ReplyCode = ReplyCode(553);
    /// Transaction failed (e.g. policy violation).
    pub const TRANSACTION_FAILED: ReplyCode = ReplyCode(554);

    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Whether this is a positive (2xx) reply.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }

    /// Parse the `code` attribute of a channel-management element.
    /// Accepts exactly three ASCII digits.
    pub fn parse(text: &str) -> Option<ReplyCode> {
        if text.len() != 3 || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        text.parse().ok().map(ReplyCode)
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// Errors produced by the frame codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The header line is not syntactically a BEEP frame header.
    MalformedHeader(&'static str),
    /// A header field is present but carries an out-of-range or
    /// non-canonical value.
    BadFieldValue(&'static str),
    /// The `END\r\n` trailer did not follow the payload.
    TrailerMissing,
    /// The MIME section of a message could not be parsed.
    Mime(&'static str),
    /// The frame type token is not one of MSG/RPY/ERR/ANS/NUL/SEQ.
    UnknownType,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::MalformedHeader(what) => write!(f, "malformed frame header: {}", what),
            FrameError::BadFieldValue(field) => write!(f, "bad value for frame field '{}'", field),
            FrameError::TrailerMissing => write!(f, "frame trailer END missing"),
            FrameError::Mime(what) => write!(f, "MIME section error: {}", what),
            FrameError::UnknownType => write!(f, "unknown frame type"),
        }
    }
}

impl std::error::Error for FrameError {}

/// The crate-wide error type.
///
/// Framing and protocol errors are fatal to the connection; channel-level
/// errors are surfaced to the initiating caller and pushed onto the
/// connection's error stack.
#[derive(Debug)]
pub enum Error {
    /// Wire corruption, unexpected seqno, channel-management violation.
    /// Fatal to the connection.
    Protocol(String),
    /// A frame failed to encode or decode. Fatal to the connection.
    Frame(FrameError),
    /// The peer refused a `<start>` request with `<error>`.
    StartRefused { code: ReplyCode, message: String },
    /// The peer or a local handler declined a `<close>` request; the
    /// channel remains open.
    CloseRefused { code: ReplyCode, message: String },
    /// The peer answered our greeting with `<error>`.
    GreetingFailed { code: ReplyCode, message: String },
    /// An attempt to place octets beyond the advertised window. This is
    /// an internal invariant violation, not a peer-visible condition.
    WindowViolation { channel: u32 },
    /// A synchronous wait exceeded its deadline. Local only.
    Timeout,
    /// The transport saw a clean FIN or an unexpected reset.
    TransportClosed,
    /// A socket, channel-number or queue limit was reached.
    ResourceExhausted(&'static str),
    /// A user handler panicked; the connection continues.
    Handler(String),
    /// The operation targeted a channel that is closed or closing.
    ChannelClosed(u32),
    /// Underlying transport I/O failure.
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(what) => write!(f, "protocol error: {}", what),
            Error::Frame(e) => write!(f, "frame error: {}", e),
            Error::StartRefused { code, message } => {
                write!(f, "channel start refused ({}): {}", code, message)
            }
            Error::CloseRefused { code, message } => {
                write!(f, "channel close refused ({}): {}", code, message)
            }
            Error::GreetingFailed { code, message } => {
                write!(f, "greeting refused ({}): {}", code, message)
            }
            Error::WindowViolation { channel } => {
                write!(f, "window violation on channel {}", channel)
            }
            Error::Timeout => write!(f, "operation timed out"),
            Error::TransportClosed => write!(f, "transport closed"),
            Error::ResourceExhausted(what) => write!(f, "resource exhausted: {}", what),
            Error::Handler(what) => write!(f, "handler failure: {}", what),
            Error::ChannelClosed(num) => write!(f, "channel {} is closed", num),
            Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Frame(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::Frame(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
