//! Proactive Announcement (PANN) frame and wire codec (msgpack).
//!
//! A PANN is the single control frame of the mesh path layer: an origin
//! station floods it to announce its reachability, accumulated metric, and
//! gate status. Serialized as a msgpack map with short string keys so field
//! identity stays stable across protocol revisions.

use std::collections::HashMap;

use rmpv::Value;

use crate::error::FrameError;
use crate::types::MacAddr;

/// How many unrecognized map keys the decoder tolerates before rejecting
/// the frame. Allows newer peers to add fields without breaking older nodes.
pub const UNKNOWN_FIELD_TOLERANCE: usize = 2;

// Map keys. Stable wire contract; never reuse a retired key.
const KEY_ORIG_ADDR: &str = "oa";
const KEY_ORIG_SN: &str = "sn";
const KEY_HOP_COUNT: &str = "hc";
const KEY_TTL: &str = "tl";
const KEY_TARGET_ADDR: &str = "ta";
const KEY_METRIC: &str = "me";
const KEY_IS_GATE: &str = "ig";
const KEY_REPLY_REQUESTED: &str = "rr";

/// A decoded Proactive Announcement element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct PannFrame {
    /// Station that originated the announcement.
    pub orig_addr: MacAddr,
    /// Origin-owned monotonic sequence number.
    pub orig_sn: u64,
    /// Hops traversed so far (0 at the origin).
    pub hop_count: u8,
    /// Remaining element TTL; decremented on each forward.
    pub ttl: u8,
    /// Announced target; the broadcast sentinel for proactive floods.
    pub target_addr: MacAddr,
    /// Accumulated path metric from the origin to the transmitter.
    pub metric: u32,
    /// Whether the origin is a mesh gate.
    pub is_gate: bool,
    /// Carried through the codec; emitting replies is not implemented.
    pub reply_requested: bool,
}

impl PannFrame {
    /// Encode this frame to msgpack bytes.
    pub fn encode(&self) -> Vec<u8> {
        let map = Value::Map(vec![
            (
                Value::String(KEY_ORIG_ADDR.into()),
                Value::Binary(self.orig_addr.as_ref().to_vec()),
            ),
            (
                Value::String(KEY_ORIG_SN.into()),
                Value::Integer(self.orig_sn.into()),
            ),
            (
                Value::String(KEY_HOP_COUNT.into()),
                Value::Integer(self.hop_count.into()),
            ),
            (
                Value::String(KEY_TTL.into()),
                Value::Integer(self.ttl.into()),
            ),
            (
                Value::String(KEY_TARGET_ADDR.into()),
                Value::Binary(self.target_addr.as_ref().to_vec()),
            ),
            (
                Value::String(KEY_METRIC.into()),
                Value::Integer(self.metric.into()),
            ),
            (
                Value::String(KEY_IS_GATE.into()),
                Value::Boolean(self.is_gate),
            ),
            (
                Value::String(KEY_REPLY_REQUESTED.into()),
                Value::Boolean(self.reply_requested),
            ),
        ]);

        let mut buf = Vec::new();
        // SAFETY: encoding to a Vec<u8> never fails (infallible Write impl).
        rmpv::encode::write_value(&mut buf, &map).expect("msgpack encoding to Vec never fails");

        tracing::trace!(
            len = buf.len(),
            orig = %self.orig_addr,
            sn = self.orig_sn,
            "pann frame packed"
        );

        buf
    }

    /// Decode a PANN frame from msgpack bytes.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let value = rmpv::decode::read_value(&mut &data[..])
            .map_err(|_| FrameError::Malformed("msgpack decode failed"))?;

        let entries = match value {
            Value::Map(entries) => entries,
            _ => return Err(FrameError::Malformed("expected map")),
        };

        // Build lookup by key for order-tolerant parsing. Non-string keys
        // and unrecognized string keys count against the tolerance.
        let mut lookup: HashMap<&str, &Value> = HashMap::new();
        let mut unknown = 0usize;
        for (k, v) in &entries {
            let Some(key) = k.as_str() else {
                unknown += 1;
                continue;
            };
            match key {
                KEY_ORIG_ADDR | KEY_ORIG_SN | KEY_HOP_COUNT | KEY_TTL | KEY_TARGET_ADDR
                | KEY_METRIC | KEY_IS_GATE | KEY_REPLY_REQUESTED => {
                    lookup.insert(key, v);
                }
                _ => unknown += 1,
            }
        }
        if unknown > UNKNOWN_FIELD_TOLERANCE {
            return Err(FrameError::UnknownFields {
                unknown,
                tolerated: UNKNOWN_FIELD_TOLERANCE,
            });
        }

        Ok(Self {
            orig_addr: get_mac(&lookup, KEY_ORIG_ADDR)?,
            orig_sn: get_u64(&lookup, KEY_ORIG_SN)?,
            hop_count: get_u8(&lookup, KEY_HOP_COUNT)?,
            ttl: get_u8(&lookup, KEY_TTL)?,
            target_addr: get_mac(&lookup, KEY_TARGET_ADDR)?,
            metric: get_u32(&lookup, KEY_METRIC)?,
            is_gate: get_bool(&lookup, KEY_IS_GATE)?,
            reply_requested: get_bool(&lookup, KEY_REPLY_REQUESTED)?,
        })
    }
}

// ------------------------------------------------------------------ //
// Helpers
// ------------------------------------------------------------------ //

fn get_u64(lookup: &HashMap<&str, &Value>, key: &str) -> Result<u64, FrameError> {
    match lookup.get(key) {
        Some(Value::Integer(i)) => i
            .as_u64()
            .ok_or(FrameError::Malformed("integer out of range")),
        Some(_) => Err(FrameError::Malformed("expected integer")),
        None => Err(FrameError::Malformed("missing required key")),
    }
}

fn get_u32(lookup: &HashMap<&str, &Value>, key: &str) -> Result<u32, FrameError> {
    let v = get_u64(lookup, key)?;
    u32::try_from(v).map_err(|_| FrameError::Malformed("integer exceeds u32"))
}

fn get_u8(lookup: &HashMap<&str, &Value>, key: &str) -> Result<u8, FrameError> {
    let v = get_u64(lookup, key)?;
    u8::try_from(v).map_err(|_| FrameError::Malformed("integer exceeds u8"))
}

fn get_bool(lookup: &HashMap<&str, &Value>, key: &str) -> Result<bool, FrameError> {
    match lookup.get(key) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(_) => Err(FrameError::Malformed("expected boolean")),
        None => Err(FrameError::Malformed("missing required key")),
    }
}

fn get_mac(lookup: &HashMap<&str, &Value>, key: &str) -> Result<MacAddr, FrameError> {
    match lookup.get(key) {
        Some(Value::Binary(b)) => {
            MacAddr::try_from(b.as_slice()).map_err(|_| FrameError::Malformed("bad MAC length"))
        }
        Some(_) => Err(FrameError::Malformed("expected binary")),
        None => Err(FrameError::Malformed("missing required key")),
    }
}
