//! NDT control-channel message codec.
//!
//! Every message on the control channel is framed as
//!
//! ```text
//! [type: u8] [body length: u16 BE] [body: UTF-8 JSON]
//! ```
//!
//! Ordinary bodies are `{"msg": "<text>"}`. The extended login message also
//! carries the requested test bitmask: `{"msg": "v3.5.5", "tests": "<int>"}`.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::error::{NdtError, Result};
use crate::params;

/// The twelve message kinds of the NDT control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    CommFailure = 0,
    SrvQueue = 1,
    MsgLogin = 2,
    TestPrepare = 3,
    TestStart = 4,
    TestMsg = 5,
    TestFinalize = 6,
    MsgError = 7,
    MsgResults = 8,
    MsgLogout = 9,
    MsgWaiting = 10,
    MsgExtendedLogin = 11,
}

impl MessageType {
    /// Protocol name of the message kind, e.g. `SRV_QUEUE`.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::CommFailure => "COMM_FAILURE",
            MessageType::SrvQueue => "SRV_QUEUE",
            MessageType::MsgLogin => "MSG_LOGIN",
            MessageType::TestPrepare => "TEST_PREPARE",
            MessageType::TestStart => "TEST_START",
            MessageType::TestMsg => "TEST_MSG",
            MessageType::TestFinalize => "TEST_FINALIZE",
            MessageType::MsgError => "MSG_ERROR",
            MessageType::MsgResults => "MSG_RESULTS",
            MessageType::MsgLogout => "MSG_LOGOUT",
            MessageType::MsgWaiting => "MSG_WAITING",
            MessageType::MsgExtendedLogin => "MSG_EXTENDED_LOGIN",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = NdtError;

    fn try_from(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => MessageType::CommFailure,
            1 => MessageType::SrvQueue,
            2 => MessageType::MsgLogin,
            3 => MessageType::TestPrepare,
            4 => MessageType::TestStart,
            5 => MessageType::TestMsg,
            6 => MessageType::TestFinalize,
            7 => MessageType::MsgError,
            8 => MessageType::MsgResults,
            9 => MessageType::MsgLogout,
            10 => MessageType::MsgWaiting,
            11 => MessageType::MsgExtendedLogin,
            other => {
                return Err(NdtError::violation(format!(
                    "unknown message type {other}"
                )));
            }
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", *self as u8, self.name())
    }
}

/// Sub-tests this client knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    /// Client-to-server throughput.
    C2s,
    /// Server-to-client throughput.
    S2c,
    /// Client metadata exchange.
    Meta,
}

impl TestKind {
    /// Numeric test id used on the wire.
    pub fn id(self) -> u32 {
        match self {
            TestKind::C2s => 2,
            TestKind::S2c => 4,
            TestKind::Meta => 32,
        }
    }

    /// Parse one token of the server's test-id list.
    pub fn from_id(token: &str) -> Option<TestKind> {
        match token {
            "2" => Some(TestKind::C2s),
            "4" => Some(TestKind::S2c),
            "32" => Some(TestKind::Meta),
            _ => None,
        }
    }

    /// Short label used in milestone names, e.g. `c2s`.
    pub fn label(self) -> &'static str {
        match self {
            TestKind::C2s => "c2s",
            TestKind::S2c => "s2c",
            TestKind::Meta => "meta",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TestKind::C2s => "Upload",
            TestKind::S2c => "Download",
            TestKind::Meta => "Meta",
        })
    }
}

/// Bitmask of requested tests, as carried by the login message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TestSet(u32);

impl TestSet {
    pub const C2S: TestSet = TestSet(2);
    pub const S2C: TestSet = TestSet(4);
    /// Status test; every 3.5.5+ client must request it.
    pub const STATUS: TestSet = TestSet(16);
    pub const META: TestSet = TestSet(32);

    pub const fn empty() -> Self {
        TestSet(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        TestSet(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: TestSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// The same set with the status test forced on.
    pub const fn with_status(self) -> Self {
        TestSet(self.0 | Self::STATUS.0)
    }

    /// Tests in `self` that are missing from `requested`.
    pub const fn difference(self, requested: TestSet) -> Self {
        TestSet(self.0 & !requested.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Parse the server's space-separated test-id list, keeping its order.
pub fn parse_test_ids(list: &str) -> Result<Vec<TestKind>> {
    list.split_whitespace()
        .map(|token| {
            TestKind::from_id(token)
                .ok_or_else(|| NdtError::violation(format!("unknown test type: {token}")))
        })
        .collect()
}

impl FromIterator<TestKind> for TestSet {
    fn from_iter<I: IntoIterator<Item = TestKind>>(iter: I) -> Self {
        iter.into_iter()
            .fold(TestSet::empty(), |set, kind| set | TestSet::from(kind))
    }
}

impl From<TestKind> for TestSet {
    fn from(kind: TestKind) -> Self {
        TestSet(kind.id())
    }
}

impl BitOr for TestSet {
    type Output = TestSet;

    fn bitor(self, rhs: TestSet) -> TestSet {
        TestSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for TestSet {
    fn bitor_assign(&mut self, rhs: TestSet) {
        self.0 |= rhs.0;
    }
}

/// A decoded control-channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageType,
    /// Body length announced by the header.
    pub length: u16,
    pub body: Value,
}

impl Message {
    /// The `msg` field of the body, or `""` when the body has none.
    pub fn msg(&self) -> &str {
        self.field("msg").unwrap_or("")
    }

    /// A string field of the body.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }
}

#[derive(Serialize)]
struct MsgBody<'a> {
    msg: &'a str,
}

#[derive(Serialize)]
struct LoginBody<'a> {
    msg: &'a str,
    tests: String,
}

/// Build the extended login message requesting `desired` (plus the status test).
pub fn encode_login(desired: TestSet) -> Result<Bytes> {
    let body = serde_json::to_vec(&LoginBody {
        msg: params::CLIENT_PROTOCOL_VERSION,
        tests: desired.with_status().bits().to_string(),
    })?;
    frame(MessageType::MsgExtendedLogin, &body)
}

/// Wrap `content` as `{"msg": content}` behind a header of the given type.
pub fn encode_message(kind: MessageType, content: &str) -> Result<Bytes> {
    let body = serde_json::to_vec(&MsgBody { msg: content })?;
    frame(kind, &body)
}

fn frame(kind: MessageType, body: &[u8]) -> Result<Bytes> {
    let len = u16::try_from(body.len()).map_err(|_| NdtError::MessageTooLarge(body.len()))?;
    let mut buf = BytesMut::with_capacity(params::HEADER_LEN + body.len());
    buf.put_u8(kind as u8);
    buf.put_u16(len);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Decode one complete control-channel frame.
///
/// An empty body decodes as an empty object; anything else must be JSON.
pub fn decode_message(frame: &[u8]) -> Result<Message> {
    if frame.len() < params::HEADER_LEN {
        return Err(NdtError::violation(format!(
            "frame of {} bytes is shorter than the message header",
            frame.len()
        )));
    }
    let kind = MessageType::try_from(frame[0])?;
    let length = u16::from_be_bytes([frame[1], frame[2]]);
    let raw = &frame[params::HEADER_LEN..];
    if usize::from(length) != raw.len() {
        trace!(%kind, length, actual = raw.len(), "length field does not match body");
    }

    let text = std::str::from_utf8(raw)
        .map_err(|e| NdtError::violation(format!("{kind} body is not UTF-8: {e}")))?;
    let body = if text.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(text)
            .map_err(|e| NdtError::violation(format!("{kind} body is not JSON: {e}")))?
    };

    Ok(Message { kind, length, body })
}
