//! Command codec for the `;<address>:<keyword>[ <argument>][?]\r` grammar.
//!
//! Outgoing commands are built with [`encode_command`] / [`encode_query`];
//! inbound command frames (emulator side) are parsed with [`parse_incoming`].
//! Responses travel the other way as [`Response`] values, formatted with
//! [`format_response`] and parsed with [`parse_response`].
//!
//! # Wire contract
//!
//! - Responses are `OK`, a bare value, or `?1`..`?8`, terminated by `\r\n`.
//! - Parsing a response accepts `ok` in any case and a bare `\r` terminator.
//! - Every codec failure maps to exactly one [`ErrorCode`].

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::keywords::{self, KeywordKind};

/// Command terminator.
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Response terminator as emitted by the emulator.
pub const RESPONSE_TERMINATOR: &[u8] = b"\r\n";

// =============================================================================
// Error codes
// =============================================================================

/// The closed set of device error codes `?1`..`?8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// `?1`
    NotRecognized = 1,
    /// `?2`
    MissingKeyword = 2,
    /// `?3`
    InvalidKeyword = 3,
    /// `?4`
    MissingParameter = 4,
    /// `?5`
    InvalidParameter = 5,
    /// `?6`
    QueryOnly = 6,
    /// `?7`
    NoQueryForm = 7,
    /// `?8`
    Unavailable = 8,
}

impl ErrorCode {
    /// All codes in numeric order.
    pub const ALL: [ErrorCode; 8] = [
        ErrorCode::NotRecognized,
        ErrorCode::MissingKeyword,
        ErrorCode::InvalidKeyword,
        ErrorCode::MissingParameter,
        ErrorCode::InvalidParameter,
        ErrorCode::QueryOnly,
        ErrorCode::NoQueryForm,
        ErrorCode::Unavailable,
    ];

    /// Numeric part of the code.
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Code for a number in `1..=8`.
    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.get(usize::from(number).checked_sub(1)?).copied()
    }

    /// Fixed human-readable reason for the code.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::NotRecognized => "Command not recognized.",
            ErrorCode::MissingKeyword => "Missing command keyword.",
            ErrorCode::InvalidKeyword => "Invalid command keyword.",
            ErrorCode::MissingParameter => "Missing parameter.",
            ErrorCode::InvalidParameter => "Invalid parameter.",
            ErrorCode::QueryOnly => "Query only. Command needs a question mark.",
            ErrorCode::NoQueryForm => "Invalid query. Command does not have a query function.",
            ErrorCode::Unavailable => "Command unavailable in current system state.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.number())
    }
}

impl FromStr for ErrorCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .strip_prefix('?')
            .and_then(|digits| digits.parse::<u8>().ok())
            .and_then(Self::from_number)
            .ok_or_else(|| ProtocolError::MalformedCommand(format!("not an error code: {s:?}")))
    }
}

// =============================================================================
// Codec errors
// =============================================================================

/// Failures of the command codec. Each maps to one [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame does not follow `;<address>:<payload>`, or an outgoing keyword is empty.
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    /// Frame addressed to another device.
    #[error("address mismatch: expected '{expected}', got '{found}'")]
    AddressMismatch { expected: String, found: String },

    /// No line terminator.
    #[error("incomplete frame: no terminator")]
    Incomplete,

    /// `:` present but nothing after it.
    #[error("missing command keyword")]
    MissingKeyword,

    /// Settable keyword sent without its argument.
    #[error("keyword '{0}' requires a parameter")]
    MissingParameter(String),

    /// Query-only keyword sent as an action.
    #[error("keyword '{0}' is query only")]
    QueryOnly(String),

    /// Single token that is not a known keyword.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Payload does not tokenise into keyword and argument.
    #[error("unrecognized keyword in '{0}'")]
    UnrecognizedKeyword(String),

    /// Frame contains non-ASCII bytes.
    #[error("frame is not ASCII")]
    NotAscii,
}

impl ProtocolError {
    /// Wire error code reported for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::MalformedCommand(_)
            | ProtocolError::AddressMismatch { .. }
            | ProtocolError::Incomplete
            | ProtocolError::UnknownCommand(_)
            | ProtocolError::NotAscii => ErrorCode::NotRecognized,
            ProtocolError::MissingKeyword => ErrorCode::MissingKeyword,
            ProtocolError::UnrecognizedKeyword(_) => ErrorCode::InvalidKeyword,
            ProtocolError::MissingParameter(_) => ErrorCode::InvalidParameter,
            ProtocolError::QueryOnly(_) => ErrorCode::QueryOnly,
        }
    }
}

// =============================================================================
// Command frames
// =============================================================================

/// A parsed inbound command.
///
/// `keyword` never carries the trailing `?`; `query` records it instead, and a
/// query frame never carries an argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Two-character device address.
    pub address: String,
    /// Keyword, including any `:MIN`/`:MAX` suffix.
    pub keyword: String,
    /// Argument text, if any.
    pub argument: Option<String>,
    /// True for `<keyword>?` frames.
    pub query: bool,
}

impl CommandFrame {
    /// Build a query frame (`;AA:KW?`).
    pub fn query(address: impl Into<String>, keyword: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            keyword: keyword.into(),
            argument: None,
            query: true,
        }
    }

    /// Build an action frame (`;AA:KW arg` or `;AA:KW`).
    pub fn action(
        address: impl Into<String>,
        keyword: impl Into<String>,
        argument: Option<String>,
    ) -> Self {
        Self {
            address: address.into(),
            keyword: keyword.into(),
            argument,
            query: false,
        }
    }

    /// Encode the frame for the wire.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.query {
            encode_query(&self.address, &self.keyword)
        } else {
            encode_command(&self.address, &self.keyword, self.argument.as_deref())
        }
    }
}

fn check_token(what: &str, token: &str) -> Result<(), ProtocolError> {
    if token.is_empty() {
        return Err(ProtocolError::MalformedCommand(format!("empty {what}")));
    }
    if !token.is_ascii() {
        return Err(ProtocolError::NotAscii);
    }
    if token
        .bytes()
        .any(|b| b.is_ascii_whitespace() || b.is_ascii_control() || b == b';')
    {
        return Err(ProtocolError::MalformedCommand(format!(
            "{what} contains a separator: {token:?}"
        )));
    }
    Ok(())
}

/// Build `;<address>:<keyword>[ <argument>]\r`.
pub fn encode_command(
    address: &str,
    keyword: &str,
    argument: Option<&str>,
) -> Result<Bytes, ProtocolError> {
    check_token("address", address)?;
    check_token("keyword", keyword)?;

    let mut buf = BytesMut::with_capacity(address.len() + keyword.len() + 16);
    buf.put_u8(b';');
    buf.put_slice(address.as_bytes());
    buf.put_u8(b':');
    buf.put_slice(keyword.as_bytes());
    if let Some(arg) = argument {
        check_token("argument", arg)?;
        buf.put_u8(b' ');
        buf.put_slice(arg.as_bytes());
    }
    buf.put_u8(COMMAND_TERMINATOR);
    Ok(buf.freeze())
}

/// Build `;<address>:<keyword>?\r`.
pub fn encode_query(address: &str, keyword: &str) -> Result<Bytes, ProtocolError> {
    check_token("keyword", keyword)?;
    encode_command(address, &format!("{keyword}?"), None)
}

/// Parse an inbound command frame addressed to `expected_address`.
pub fn parse_incoming(raw: &[u8], expected_address: &str) -> Result<CommandFrame, ProtocolError> {
    if !raw.is_ascii() {
        return Err(ProtocolError::NotAscii);
    }

    let end = raw
        .iter()
        .position(|b| *b == b'\r' || *b == b'\n')
        .ok_or(ProtocolError::Incomplete)?;
    // ASCII was checked above, so this cannot fail.
    let line = std::str::from_utf8(&raw[..end]).map_err(|_| ProtocolError::NotAscii)?;

    let body = line
        .trim_start()
        .strip_prefix(';')
        .ok_or_else(|| ProtocolError::MalformedCommand(format!("missing ';' in {line:?}")))?;
    let (address, payload) = body
        .split_once(':')
        .ok_or_else(|| ProtocolError::MalformedCommand(format!("missing ':' in {line:?}")))?;

    if address != expected_address {
        return Err(ProtocolError::AddressMismatch {
            expected: expected_address.to_string(),
            found: address.to_string(),
        });
    }

    if let Some((keyword, rest)) = payload.split_once('?') {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(ProtocolError::MissingKeyword);
        }
        if !rest.trim().is_empty() || keyword.contains(char::is_whitespace) {
            return Err(ProtocolError::UnrecognizedKeyword(payload.to_string()));
        }
        return Ok(CommandFrame::query(address, keyword));
    }

    let tokens: Vec<&str> = payload.split_whitespace().collect();
    match tokens.as_slice() {
        [] => Err(ProtocolError::MissingKeyword),
        [keyword] => match keywords::lookup(keyword) {
            Some(KeywordKind::ActionOnly) => Ok(CommandFrame::action(address, *keyword, None)),
            Some(KeywordKind::Setting) => Err(ProtocolError::MissingParameter(keyword.to_string())),
            Some(KeywordKind::QueryOnly) => Err(ProtocolError::QueryOnly(keyword.to_string())),
            None => Err(ProtocolError::UnknownCommand(keyword.to_string())),
        },
        [keyword, argument] => Ok(CommandFrame::action(
            address,
            *keyword,
            Some(argument.to_string()),
        )),
        _ => Err(ProtocolError::UnrecognizedKeyword(payload.to_string())),
    }
}

// =============================================================================
// Responses
// =============================================================================

/// One response per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `OK`
    Ok,
    /// A queried value.
    Value(String),
    /// One of the fixed `?N` codes.
    Error(ErrorCode),
}

impl Response {
    /// True for `OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok)
    }
}

impl From<ErrorCode> for Response {
    fn from(code: ErrorCode) -> Self {
        Response::Error(code)
    }
}

impl From<&ProtocolError> for Response {
    fn from(err: &ProtocolError) -> Self {
        Response::Error(err.code())
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => f.write_str("OK"),
            Response::Value(value) => f.write_str(value),
            Response::Error(code) => write!(f, "{code}"),
        }
    }
}

/// Render a response with its `\r\n` terminator.
pub fn format_response(response: &Response) -> Bytes {
    let text = response.to_string();
    let mut buf = BytesMut::with_capacity(text.len() + RESPONSE_TERMINATOR.len());
    buf.put_slice(text.as_bytes());
    buf.put_slice(RESPONSE_TERMINATOR);
    buf.freeze()
}

/// Parse one response line as read from the device.
///
/// Surrounding `\r`/`\n` and whitespace are stripped. `OK` matches in any case.
pub fn parse_response(raw: &[u8]) -> Result<Response, ProtocolError> {
    if !raw.is_ascii() {
        return Err(ProtocolError::NotAscii);
    }
    let text = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::NotAscii)?
        .trim();

    if text.eq_ignore_ascii_case("ok") {
        return Ok(Response::Ok);
    }
    if text.starts_with('?') {
        if let Ok(code) = text.parse::<ErrorCode>() {
            return Ok(Response::Error(code));
        }
    }
    Ok(Response::Value(text.to_string()))
}
