//! Stream Codec Module
//!
//! Encodes outbound requests and decodes inbound frames for the Kiwoom
//! real-time feed. The codec is stateless.
//!
//! Decoding is all-or-nothing per frame: a `REAL` frame with one bad
//! record is rejected as a whole, so callers never see half a batch.
//!
//! # Decoding
//!
//! ```json
//! {"trnm":"REAL","data":[{"type":"0B","item":"005930","values":{"10":"75000"}}]}
//! ```
//! becomes `Decoded::Events` with one [`RealtimeEvent`]; acks and
//! heartbeats become `Decoded::Control` and never reach user callbacks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::streaming::{DataType, RealtimeEvent};
use crate::domain::subscription::Subscription;
use crate::infrastructure::kiwoom::messages::{
    AckMessage, BareRequest, CONDITION_SYMBOL_FIELD, ConditionListMessage,
    ConditionSearchMessage, ConditionSearchRequest, GroupEntry, GroupRequest, LoginRequest,
    RealMessage, TRNM_CONDITION_LIST, TRNM_CONDITION_SEARCH, TRNM_LOGIN, TRNM_PING, TRNM_PONG,
    TRNM_REAL, TRNM_REG, TRNM_REMOVE,
};

// =============================================================================
// Errors
// =============================================================================

/// Encoding errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON serialization failed.
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons an inbound frame was rejected.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Frame has no `trnm` discriminator.
    #[error("missing trnm discriminator")]
    MissingTrnm,

    /// Discriminator not part of the protocol.
    #[error("unknown trnm: {0}")]
    UnknownTrnm(String),

    /// A required field is absent.
    #[error("{trnm} frame missing field: {field}")]
    MissingField {
        /// Frame discriminator.
        trnm: &'static str,
        /// Missing field name.
        field: &'static str,
    },

    /// A record carried a data type code outside the known set.
    #[error("unknown data type code: {0}")]
    UnknownDataType(String),

    /// A field value was neither a string nor a number.
    #[error("field {field} has non-scalar value")]
    NonScalarValue {
        /// Field code.
        field: String,
    },

    /// Structure did not match the expected shape.
    #[error("malformed {trnm} frame: {reason}")]
    Malformed {
        /// Frame discriminator.
        trnm: &'static str,
        /// What was wrong.
        reason: String,
    },
}

// =============================================================================
// Decoded Output
// =============================================================================

/// Status carried by an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Server return code, if present.
    pub code: Option<i64>,
    /// Server message, possibly empty.
    pub message: String,
}

impl Ack {
    /// Success iff the server returned code `0`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl From<AckMessage> for Ack {
    fn from(msg: AckMessage) -> Self {
        Self {
            code: msg.return_code,
            message: msg.return_msg.unwrap_or_default(),
        }
    }
}

/// Control frames. These never reach user callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Response to `LOGIN`.
    LoginAck(Ack),
    /// Response to `REG`.
    RegisterAck(Ack),
    /// Response to `REMOVE`.
    RemoveAck(Ack),
    /// Non-zero return code on a conditional-search response.
    ConditionRejected(Ack),
    /// Server heartbeat; must be answered.
    Ping,
    /// Heartbeat reply.
    Pong,
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Zero or more events in server order.
    Events(Vec<RealtimeEvent>),
    /// A control message.
    Control(ControlMessage),
}

// =============================================================================
// Codec
// =============================================================================

/// JSON codec for the Kiwoom real-time feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct KiwoomCodec;

impl KiwoomCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encode the `LOGIN` request.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_login(&self, token: &str) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&LoginRequest {
            trnm: TRNM_LOGIN,
            token,
        })?)
    }

    /// Encode a `REG` request for a group.
    ///
    /// A group that is a full symbol × type product goes out as a single
    /// `{"item": [...], "type": [...]}` entry. A group whose pairs are
    /// uneven after ADD merges is sent as one entry per data type, which
    /// the server treats as the union of its entries.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_subscribe(&self, subscription: &Subscription) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&GroupRequest {
            trnm: TRNM_REG,
            grp_no: subscription.group_id(),
            refresh: Some(subscription.refresh_mode().code()),
            data: group_entries(subscription),
        })?)
    }

    /// Encode a bare `REMOVE` request for a group id.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_unsubscribe(&self, group_id: &str) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&GroupRequest {
            trnm: TRNM_REMOVE,
            grp_no: group_id,
            refresh: None,
            data: Vec::new(),
        })?)
    }

    /// Encode a `REMOVE` request that also lists the group's items.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_remove(&self, subscription: &Subscription) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&GroupRequest {
            trnm: TRNM_REMOVE,
            grp_no: subscription.group_id(),
            refresh: Some(subscription.refresh_mode().code()),
            data: group_entries(subscription),
        })?)
    }

    /// Encode a heartbeat `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_ping(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&BareRequest { trnm: TRNM_PING })?)
    }

    /// Encode a heartbeat `PONG`.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_pong(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&BareRequest { trnm: TRNM_PONG })?)
    }

    /// Encode a conditional-search list request.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_condition_list(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&BareRequest {
            trnm: TRNM_CONDITION_LIST,
        })?)
    }

    /// Encode a one-shot conditional-search request.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_condition_search(&self, seq: &str) -> Result<String, CodecError> {
        Ok(serde_json::to_string(&ConditionSearchRequest {
            trnm: TRNM_CONDITION_SEARCH,
            seq,
            search_type: "0",
            stex_tp: "K",
        })?)
    }

    /// Decode one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if the frame is not valid JSON, has no or
    /// an unknown `trnm`, or any record in it is malformed. No partial
    /// output is produced.
    pub fn decode(&self, text: &str) -> Result<Decoded, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let trnm = value
            .get("trnm")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingTrnm)?
            .to_owned();

        let control = match trnm.as_str() {
            TRNM_REAL => return decode_real(value, Utc::now()).map(Decoded::Events),
            TRNM_CONDITION_LIST => return decode_condition_list(value, Utc::now()),
            TRNM_CONDITION_SEARCH => return decode_condition_search(value, Utc::now()),
            TRNM_LOGIN => ControlMessage::LoginAck(decode_ack(value, TRNM_LOGIN)?),
            TRNM_REG => ControlMessage::RegisterAck(decode_ack(value, TRNM_REG)?),
            TRNM_REMOVE => ControlMessage::RemoveAck(decode_ack(value, TRNM_REMOVE)?),
            TRNM_PING => ControlMessage::Ping,
            TRNM_PONG => ControlMessage::Pong,
            _ => return Err(DecodeError::UnknownTrnm(trnm)),
        };

        Ok(Decoded::Control(control))
    }
}

fn group_entries(subscription: &Subscription) -> Vec<GroupEntry<'_>> {
    if subscription.is_cross_product() {
        return vec![GroupEntry {
            item: subscription.symbols(),
            data_type: subscription.data_types().iter().map(|t| t.code()).collect(),
        }];
    }

    subscription
        .entries()
        .into_iter()
        .map(|(data_type, item)| GroupEntry {
            item,
            data_type: vec![data_type.code()],
        })
        .collect()
}

fn decode_ack(value: Value, trnm: &'static str) -> Result<Ack, DecodeError> {
    serde_json::from_value::<AckMessage>(value)
        .map(Ack::from)
        .map_err(|e| DecodeError::Malformed {
            trnm,
            reason: e.to_string(),
        })
}

fn decode_real(value: Value, received_at: DateTime<Utc>) -> Result<Vec<RealtimeEvent>, DecodeError> {
    let records = value
        .get("data")
        .and_then(Value::as_array)
        .ok_or(DecodeError::MissingField {
            trnm: TRNM_REAL,
            field: "data",
        })?;

    for record in records {
        if record.get("type").is_none() {
            return Err(DecodeError::MissingField {
                trnm: TRNM_REAL,
                field: "type",
            });
        }
        if record.get("values").is_none() {
            return Err(DecodeError::MissingField {
                trnm: TRNM_REAL,
                field: "values",
            });
        }
    }

    let message: RealMessage = serde_json::from_value(value).map_err(|e| DecodeError::Malformed {
        trnm: TRNM_REAL,
        reason: e.to_string(),
    })?;

    message
        .data
        .into_iter()
        .map(|record| -> Result<RealtimeEvent, DecodeError> {
            let data_type = DataType::from_code(&record.data_type)
                .ok_or_else(|| DecodeError::UnknownDataType(record.data_type.clone()))?;
            let fields = stringify_fields(record.values)?;
            Ok(
                RealtimeEvent::new(data_type, record.item.unwrap_or_default(), fields)
                    .with_name(record.name.unwrap_or_default())
                    .with_received_at(received_at),
            )
        })
        .collect()
}

fn decode_condition_list(value: Value, received_at: DateTime<Utc>) -> Result<Decoded, DecodeError> {
    let message: ConditionListMessage =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed {
            trnm: TRNM_CONDITION_LIST,
            reason: e.to_string(),
        })?;

    if let Some(code) = message.return_code.filter(|c| *c != 0) {
        return Ok(Decoded::Control(ControlMessage::ConditionRejected(Ack {
            code: Some(code),
            message: message.return_msg.unwrap_or_default(),
        })));
    }

    let events = message
        .data
        .into_iter()
        .map(|entry| -> Result<RealtimeEvent, DecodeError> {
            let [seq, name] = entry.as_slice() else {
                return Err(DecodeError::Malformed {
                    trnm: TRNM_CONDITION_LIST,
                    reason: format!("expected [seq, name], got {} elements", entry.len()),
                });
            };
            let fields = BTreeMap::from([
                ("seq".to_string(), scalar_to_string("seq", seq)?),
                ("name".to_string(), scalar_to_string("name", name)?),
            ]);
            Ok(RealtimeEvent::new(DataType::ConditionList, "", fields).with_received_at(received_at))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Decoded::Events(events))
}

fn decode_condition_search(
    value: Value,
    received_at: DateTime<Utc>,
) -> Result<Decoded, DecodeError> {
    let message: ConditionSearchMessage =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed {
            trnm: TRNM_CONDITION_SEARCH,
            reason: e.to_string(),
        })?;

    if let Some(code) = message.return_code.filter(|c| *c != 0) {
        return Ok(Decoded::Control(ControlMessage::ConditionRejected(Ack {
            code: Some(code),
            message: message.return_msg.unwrap_or_default(),
        })));
    }

    let seq = message.seq.unwrap_or_default();
    let events = message
        .data
        .into_iter()
        .map(|row| -> Result<RealtimeEvent, DecodeError> {
            let mut fields = stringify_fields(row)?;
            let symbol = fields.get(CONDITION_SYMBOL_FIELD).cloned().unwrap_or_default();
            fields.insert("seq".to_string(), seq.clone());
            Ok(RealtimeEvent::new(DataType::ConditionResult, symbol, fields)
                .with_received_at(received_at))
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    Ok(Decoded::Events(events))
}

fn stringify_fields(values: BTreeMap<String, Value>) -> Result<BTreeMap<String, String>, DecodeError> {
    values
        .into_iter()
        .map(|(code, value)| -> Result<(String, String), DecodeError> {
            let text = scalar_to_string(&code, &value)?;
            Ok((code, text))
        })
        .collect()
}

fn scalar_to_string(field: &str, value: &Value) -> Result<String, DecodeError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(DecodeError::NonScalarValue {
            field: field.to_string(),
        }),
    }
}

// =============================================================================
// Tests
// =============================================================================
