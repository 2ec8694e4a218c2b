//! Binary wire protocol between timing clients and the lap server.
//!
//! Every connection carries exactly one request and one response.
//! All integers are big-endian.
//!
//! ```text
//! SaveMeasurement: 0x00 | competitor_id i32 | timestamp_millis i64
//! GetScores:       0x01 | count u32 | count * (competitor_id i32, timestamp_millis i64)
//! Response:        count u32 | count * (competitor_id i32, best_lap i64, average_lap i64)
//! ```
//!
//! Decoders never consume partial input: if the buffer does not hold the
//! whole message they report [`ParseResult::Incomplete`] and the caller
//! keeps reading.

use crate::race::{CompetitorId, ScoreEntry};
use bytes::{Buf, BufMut, BytesMut};

/// Tag byte for a single crossing
pub const TAG_SAVE_MEASUREMENT: u8 = 0;
/// Tag byte for a batch of crossings followed by a scoreboard query
pub const TAG_GET_SCORES: u8 = 1;

/// Upper bound on any length prefix
pub const MAX_ENTRIES: u32 = 64 * 1024;

const TAG_LEN: usize = 1;
const COUNT_LEN: usize = 4;
/// competitor_id + timestamp_millis
const CROSSING_LEN: usize = 4 + 8;
/// competitor_id + best_lap + average_lap
const SCORE_ENTRY_LEN: usize = 4 + 8 + 8;

/// A timestamped line crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crossing {
    pub competitor_id: CompetitorId,
    pub timestamp_millis: i64,
}

impl Crossing {
    pub fn new(competitor_id: CompetitorId, timestamp_millis: i64) -> Self {
        Self {
            competitor_id,
            timestamp_millis,
        }
    }
}

/// Decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Register one crossing
    SaveMeasurement(Crossing),
    /// Register every crossing in order, possibly none
    GetScores(Vec<Crossing>),
}

impl Request {
    /// Encode a request into a new buffer
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Encode a request into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Request::SaveMeasurement(crossing) => {
                buf.put_u8(TAG_SAVE_MEASUREMENT);
                put_crossing(buf, crossing);
            }
            Request::GetScores(crossings) => {
                buf.put_u8(TAG_GET_SCORES);
                buf.put_u32(crossings.len() as u32);
                for crossing in crossings {
                    put_crossing(buf, crossing);
                }
            }
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Request::SaveMeasurement(_) => TAG_LEN + CROSSING_LEN,
            Request::GetScores(crossings) => TAG_LEN + COUNT_LEN + crossings.len() * CROSSING_LEN,
        }
    }

    /// Number of crossings carried by this request
    pub fn crossing_count(&self) -> usize {
        match self {
            Request::SaveMeasurement(_) => 1,
            Request::GetScores(crossings) => crossings.len(),
        }
    }
}

/// Protocol decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// First byte is not a known request tag
    UnknownTag(u8),
    /// Length prefix above [`MAX_ENTRIES`]
    TooManyEntries(u32),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::UnknownTag(tag) => write!(f, "Unknown message tag: {}", tag),
            ParseError::TooManyEntries(count) => {
                write!(f, "Too many entries: {} (max {})", count, MAX_ENTRIES)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of decoding a message
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<T> {
    /// Successfully decoded with bytes consumed
    Complete(T, usize),
    /// Need more data
    Incomplete,
    /// Malformed input
    Error(ParseError),
}

/// Decode a request from the start of `buffer`
pub fn parse_request(buffer: &[u8]) -> ParseResult<Request> {
    let Some(&tag) = buffer.first() else {
        return ParseResult::Incomplete;
    };
    let mut body = &buffer[TAG_LEN..];

    match tag {
        TAG_SAVE_MEASUREMENT => {
            if body.len() < CROSSING_LEN {
                return ParseResult::Incomplete;
            }
            let crossing = get_crossing(&mut body);
            ParseResult::Complete(Request::SaveMeasurement(crossing), TAG_LEN + CROSSING_LEN)
        }
        TAG_GET_SCORES => match parse_sequence(body, CROSSING_LEN, get_crossing) {
            ParseResult::Complete(crossings, consumed) => {
                ParseResult::Complete(Request::GetScores(crossings), TAG_LEN + consumed)
            }
            ParseResult::Incomplete => ParseResult::Incomplete,
            ParseResult::Error(e) => ParseResult::Error(e),
        },
        other => ParseResult::Error(ParseError::UnknownTag(other)),
    }
}

/// Encode a scoreboard response
pub fn encode_scoreboard(entries: &[ScoreEntry]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(COUNT_LEN + entries.len() * SCORE_ENTRY_LEN);
    buf.put_u32(entries.len() as u32);
    for entry in entries {
        buf.put_i32(entry.competitor_id);
        buf.put_i64(entry.best_lap_millis);
        buf.put_i64(entry.average_lap_millis);
    }
    buf
}

/// Decode a scoreboard response from the start of `buffer`
pub fn parse_scoreboard(buffer: &[u8]) -> ParseResult<Vec<ScoreEntry>> {
    parse_sequence(buffer, SCORE_ENTRY_LEN, |buf| ScoreEntry {
        competitor_id: buf.get_i32(),
        best_lap_millis: buf.get_i64(),
        average_lap_millis: buf.get_i64(),
    })
}

/// Decode `count u32` followed by `count` fixed-size items
fn parse_sequence<T>(
    buffer: &[u8],
    item_len: usize,
    mut decode_item: impl FnMut(&mut &[u8]) -> T,
) -> ParseResult<Vec<T>> {
    if buffer.len() < COUNT_LEN {
        return ParseResult::Incomplete;
    }
    let mut body = buffer;
    let count = body.get_u32();
    if count > MAX_ENTRIES {
        return ParseResult::Error(ParseError::TooManyEntries(count));
    }

    let total = COUNT_LEN + count as usize * item_len;
    if buffer.len() < total {
        return ParseResult::Incomplete;
    }

    let items = (0..count).map(|_| decode_item(&mut body)).collect();
    ParseResult::Complete(items, total)
}

fn put_crossing(buf: &mut BytesMut, crossing: &Crossing) {
    buf.put_i32(crossing.competitor_id);
    buf.put_i64(crossing.timestamp_millis);
}

fn get_crossing(buf: &mut &[u8]) -> Crossing {
    Crossing {
        competitor_id: buf.get_i32(),
        timestamp_millis: buf.get_i64(),
    }
}
