//! Msgpack wire codec for the prefix database and the request channel.
//!
//! The published database is read by other nodes and external tooling, so
//! it uses a self-describing msgpack map with short string keys, the same
//! shape as the PANN codec. The embedding RPC framing stays external; this
//! module only defines the message payloads.

use rmpv::Value;

use crate::types::{
    IpPrefix, PerfEvent, PerfEvents, PrefixCommand, PrefixDatabase, PrefixEntry, PrefixRequest,
    PrefixResponse, PrefixType,
};

/// Errors from prefix message decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed prefix message: {0}")]
    Malformed(&'static str),
}

// Entry keys.
const KEY_PREFIX: &str = "p";
const KEY_TYPE: &str = "t";
const KEY_DATA: &str = "d";
const KEY_EPHEMERAL: &str = "e";

// Database keys.
const KEY_NODE: &str = "n";
const KEY_ENTRIES: &str = "e";
const KEY_PERF: &str = "x";

// Perf event keys.
const KEY_EVENT_NODE: &str = "n";
const KEY_EVENT_NAME: &str = "e";
const KEY_EVENT_TS: &str = "t";

// Request/response keys.
const KEY_COMMAND: &str = "c";
const KEY_SUCCESS: &str = "s";
const KEY_MESSAGE: &str = "m";

/// Encode a prefix database to msgpack bytes.
pub fn encode_prefix_db(db: &PrefixDatabase) -> Vec<u8> {
    let mut map = vec![
        (
            Value::String(KEY_NODE.into()),
            Value::String(db.this_node_name.clone().into()),
        ),
        (Value::String(KEY_ENTRIES.into()), entries_to_value(&db.prefix_entries)),
    ];
    if let Some(perf) = &db.perf_events {
        map.push((
            Value::String(KEY_PERF.into()),
            Value::Array(
                perf.events
                    .iter()
                    .map(|event| {
                        Value::Map(vec![
                            (
                                Value::String(KEY_EVENT_NODE.into()),
                                Value::String(event.node_name.clone().into()),
                            ),
                            (
                                Value::String(KEY_EVENT_NAME.into()),
                                Value::String(event.event_name.clone().into()),
                            ),
                            (
                                Value::String(KEY_EVENT_TS.into()),
                                Value::Integer(event.unix_ts_ms.into()),
                            ),
                        ])
                    })
                    .collect(),
            ),
        ));
    }
    write_to_vec(Value::Map(map))
}

/// Decode a prefix database from msgpack bytes.
pub fn decode_prefix_db(data: &[u8]) -> Result<PrefixDatabase, CodecError> {
    let entries = read_map(data)?;

    let mut this_node_name = None;
    let mut prefix_entries = None;
    let mut perf_events = None;

    for (k, v) in &entries {
        match k.as_str() {
            Some(KEY_NODE) => this_node_name = Some(get_str(v)?.to_string()),
            Some(KEY_ENTRIES) => prefix_entries = Some(entries_from_value(v)?),
            Some(KEY_PERF) => perf_events = Some(perf_from_value(v)?),
            _ => {}
        }
    }

    Ok(PrefixDatabase {
        this_node_name: this_node_name.ok_or(CodecError::Malformed("missing node name"))?,
        prefix_entries: prefix_entries.ok_or(CodecError::Malformed("missing entries"))?,
        perf_events,
    })
}

/// Encode a prefix request to msgpack bytes.
pub fn encode_request(req: &PrefixRequest) -> Vec<u8> {
    let mut map = vec![(
        Value::String(KEY_COMMAND.into()),
        Value::Integer(req.command.as_u8().into()),
    )];
    if let Some(prefix_type) = req.prefix_type {
        map.push((
            Value::String(KEY_TYPE.into()),
            Value::Integer(prefix_type.as_u8().into()),
        ));
    }
    map.push((
        Value::String(KEY_ENTRIES.into()),
        entries_to_value(&req.prefixes),
    ));
    write_to_vec(Value::Map(map))
}

/// Decode a prefix request from msgpack bytes.
///
/// An unrecognized command tag decodes into [`PrefixCommand::Unknown`]; the
/// manager answers those with a structured failure rather than a decode
/// error.
pub fn decode_request(data: &[u8]) -> Result<PrefixRequest, CodecError> {
    let entries = read_map(data)?;

    let mut command = None;
    let mut prefix_type = None;
    let mut prefixes = Vec::new();

    for (k, v) in &entries {
        match k.as_str() {
            Some(KEY_COMMAND) => command = Some(PrefixCommand::from_u8(get_u8(v)?)),
            Some(KEY_TYPE) => {
                prefix_type = Some(
                    PrefixType::from_u8(get_u8(v)?)
                        .ok_or(CodecError::Malformed("unknown prefix type"))?,
                );
            }
            Some(KEY_ENTRIES) => prefixes = entries_from_value(v)?,
            _ => {}
        }
    }

    Ok(PrefixRequest {
        command: command.ok_or(CodecError::Malformed("missing command"))?,
        prefix_type,
        prefixes,
    })
}

/// Encode a prefix response to msgpack bytes.
pub fn encode_response(resp: &PrefixResponse) -> Vec<u8> {
    let mut map = vec![(
        Value::String(KEY_SUCCESS.into()),
        Value::Boolean(resp.success),
    )];
    if let Some(message) = &resp.message {
        map.push((
            Value::String(KEY_MESSAGE.into()),
            Value::String(message.clone().into()),
        ));
    }
    map.push((
        Value::String(KEY_ENTRIES.into()),
        entries_to_value(&resp.prefixes),
    ));
    write_to_vec(Value::Map(map))
}

/// Decode a prefix response from msgpack bytes.
pub fn decode_response(data: &[u8]) -> Result<PrefixResponse, CodecError> {
    let entries = read_map(data)?;

    let mut success = None;
    let mut message = None;
    let mut prefixes = Vec::new();

    for (k, v) in &entries {
        match k.as_str() {
            Some(KEY_SUCCESS) => {
                success = Some(match v {
                    Value::Boolean(b) => *b,
                    _ => return Err(CodecError::Malformed("expected boolean")),
                });
            }
            Some(KEY_MESSAGE) => message = Some(get_str(v)?.to_string()),
            Some(KEY_ENTRIES) => prefixes = entries_from_value(v)?,
            _ => {}
        }
    }

    Ok(PrefixResponse {
        success: success.ok_or(CodecError::Malformed("missing success flag"))?,
        message,
        prefixes,
    })
}

// ------------------------------------------------------------------ //
// Helpers
// ------------------------------------------------------------------ //

fn write_to_vec(value: Value) -> Vec<u8> {
    let mut buf = Vec::new();
    // SAFETY: encoding to a Vec<u8> never fails (infallible Write impl).
    rmpv::encode::write_value(&mut buf, &value).expect("msgpack encoding to Vec never fails");
    buf
}

fn read_map(data: &[u8]) -> Result<Vec<(Value, Value)>, CodecError> {
    let value = rmpv::decode::read_value(&mut &data[..])
        .map_err(|_| CodecError::Malformed("msgpack decode failed"))?;
    match value {
        Value::Map(entries) => Ok(entries),
        _ => Err(CodecError::Malformed("expected map")),
    }
}

fn entries_to_value(entries: &[PrefixEntry]) -> Value {
    Value::Array(entries.iter().map(entry_to_value).collect())
}

fn entry_to_value(entry: &PrefixEntry) -> Value {
    let mut map = vec![
        (
            Value::String(KEY_PREFIX.into()),
            Value::String(entry.prefix.to_string().into()),
        ),
        (
            Value::String(KEY_TYPE.into()),
            Value::Integer(entry.prefix_type.as_u8().into()),
        ),
        (
            Value::String(KEY_DATA.into()),
            Value::Binary(entry.data.clone()),
        ),
    ];
    if let Some(ephemeral) = entry.ephemeral {
        map.push((
            Value::String(KEY_EPHEMERAL.into()),
            Value::Boolean(ephemeral),
        ));
    }
    Value::Map(map)
}

fn entries_from_value(value: &Value) -> Result<Vec<PrefixEntry>, CodecError> {
    match value {
        Value::Array(items) => items.iter().map(entry_from_value).collect(),
        _ => Err(CodecError::Malformed("expected entry array")),
    }
}

fn entry_from_value(value: &Value) -> Result<PrefixEntry, CodecError> {
    let entries = match value {
        Value::Map(entries) => entries,
        _ => return Err(CodecError::Malformed("expected entry map")),
    };

    let mut prefix = None;
    let mut prefix_type = None;
    let mut data = Vec::new();
    let mut ephemeral = None;

    for (k, v) in entries {
        match k.as_str() {
            Some(KEY_PREFIX) => {
                let parsed: IpPrefix = get_str(v)?
                    .parse()
                    .map_err(|_| CodecError::Malformed("bad prefix"))?;
                prefix = Some(parsed);
            }
            Some(KEY_TYPE) => {
                prefix_type = Some(
                    PrefixType::from_u8(get_u8(v)?)
                        .ok_or(CodecError::Malformed("unknown prefix type"))?,
                );
            }
            Some(KEY_DATA) => {
                data = match v {
                    Value::Binary(b) => b.clone(),
                    _ => return Err(CodecError::Malformed("expected binary")),
                };
            }
            Some(KEY_EPHEMERAL) => {
                ephemeral = Some(match v {
                    Value::Boolean(b) => *b,
                    _ => return Err(CodecError::Malformed("expected boolean")),
                });
            }
            _ => {}
        }
    }

    Ok(PrefixEntry {
        prefix: prefix.ok_or(CodecError::Malformed("missing prefix"))?,
        prefix_type: prefix_type.ok_or(CodecError::Malformed("missing prefix type"))?,
        data,
        ephemeral,
    })
}

fn perf_from_value(value: &Value) -> Result<PerfEvents, CodecError> {
    let items = match value {
        Value::Array(items) => items,
        _ => return Err(CodecError::Malformed("expected perf array")),
    };

    let mut events = Vec::with_capacity(items.len());
    for item in items {
        let entries = match item {
            Value::Map(entries) => entries,
            _ => return Err(CodecError::Malformed("expected perf event map")),
        };

        let mut node_name = None;
        let mut event_name = None;
        let mut unix_ts_ms = None;

        for (k, v) in entries {
            match k.as_str() {
                Some(KEY_EVENT_NODE) => node_name = Some(get_str(v)?.to_string()),
                Some(KEY_EVENT_NAME) => event_name = Some(get_str(v)?.to_string()),
                Some(KEY_EVENT_TS) => {
                    unix_ts_ms = Some(match v {
                        Value::Integer(i) => i
                            .as_i64()
                            .ok_or(CodecError::Malformed("timestamp out of range"))?,
                        _ => return Err(CodecError::Malformed("expected integer")),
                    });
                }
                _ => {}
            }
        }

        events.push(PerfEvent {
            node_name: node_name.ok_or(CodecError::Malformed("missing event node"))?,
            event_name: event_name.ok_or(CodecError::Malformed("missing event name"))?,
            unix_ts_ms: unix_ts_ms.ok_or(CodecError::Malformed("missing event timestamp"))?,
        });
    }

    Ok(PerfEvents { events })
}

fn get_str(value: &Value) -> Result<&str, CodecError> {
    value
        .as_str()
        .ok_or(CodecError::Malformed("expected string"))
}

fn get_u8(value: &Value) -> Result<u8, CodecError> {
    match value {
        Value::Integer(i) => i
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or(CodecError::Malformed("integer exceeds u8")),
        _ => Err(CodecError::Malformed("expected integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(s: &str, t: PrefixType) -> PrefixEntry {
        PrefixEntry::new(s.parse().unwrap(), t)
    }

    fn make_db() -> PrefixDatabase {
        PrefixDatabase {
            this_node_name: "node-1".to_string(),
            prefix_entries: vec![
                entry("10.0.0.0/8", PrefixType::Loopback),
                PrefixEntry {
                    data: b"attrs".to_vec(),
                    ephemeral: Some(true),
                    ..entry("fd00::/48", PrefixType::Bgp)
                },
            ],
            perf_events: None,
        }
    }

    #[test]
    fn db_roundtrip() {
        let db = make_db();
        assert_eq!(decode_prefix_db(&encode_prefix_db(&db)).unwrap(), db);
    }

    #[test]
    fn db_roundtrip_with_perf_events() {
        let mut db = make_db();
        db.perf_events = Some(PerfEvents {
            events: vec![PerfEvent {
                node_name: "node-1".to_string(),
                event_name: "PREFIX_DB_UPDATED".to_string(),
                unix_ts_ms: 1_700_000_000_000,
            }],
        });
        assert_eq!(decode_prefix_db(&encode_prefix_db(&db)).unwrap(), db);
    }

    #[test]
    fn db_empty_roundtrip() {
        let db = PrefixDatabase {
            this_node_name: String::new(),
            prefix_entries: vec![],
            perf_events: None,
        };
        assert_eq!(decode_prefix_db(&encode_prefix_db(&db)).unwrap(), db);
    }

    #[test]
    fn request_roundtrip() {
        let req = PrefixRequest {
            command: PrefixCommand::SyncPrefixesByType,
            prefix_type: Some(PrefixType::Loopback),
            prefixes: vec![entry("10.0.0.0/8", PrefixType::Loopback)],
        };
        assert_eq!(decode_request(&encode_request(&req)).unwrap(), req);

        let bare = PrefixRequest::new(PrefixCommand::GetAllPrefixes);
        assert_eq!(decode_request(&encode_request(&bare)).unwrap(), bare);
    }

    #[test]
    fn request_with_unknown_command_tag_decodes() {
        let req = PrefixRequest::new(PrefixCommand::Unknown(250));
        let decoded = decode_request(&encode_request(&req)).unwrap();
        assert_eq!(decoded.command, PrefixCommand::Unknown(250));
    }

    #[test]
    fn response_roundtrip() {
        let resp = PrefixResponse {
            success: false,
            message: Some("No prefix to remove".to_string()),
            prefixes: vec![],
        };
        assert_eq!(decode_response(&encode_response(&resp)).unwrap(), resp);

        let ok = PrefixResponse::ok_with(vec![entry("10.0.0.0/8", PrefixType::Rib)]);
        assert_eq!(decode_response(&encode_response(&ok)).unwrap(), ok);
    }

    #[test]
    fn truncated_input_rejected() {
        let bytes = encode_prefix_db(&make_db());
        assert!(decode_prefix_db(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_prefix_db(&[]).is_err());
    }

    #[test]
    fn non_map_rejected() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::Integer(1.into())).unwrap();
        assert_eq!(
            decode_prefix_db(&buf),
            Err(CodecError::Malformed("expected map"))
        );
        assert_eq!(
            decode_request(&buf),
            Err(CodecError::Malformed("expected map"))
        );
    }

    #[test]
    fn entry_with_unknown_type_rejected() {
        let value = Value::Map(vec![(
            Value::String(KEY_ENTRIES.into()),
            Value::Array(vec![Value::Map(vec![
                (
                    Value::String(KEY_PREFIX.into()),
                    Value::String("10.0.0.0/8".into()),
                ),
                (Value::String(KEY_TYPE.into()), Value::Integer(99.into())),
            ])]),
        )]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        assert_eq!(
            decode_request(&buf),
            Err(CodecError::Malformed("unknown prefix type"))
        );
    }
}
