//! Kiwoom WebSocket Message Types
//!
//! Wire format types for the Kiwoom real-time feed. Every message is a
//! JSON object with a `trnm` discriminator.
//!
//! # Message Types
//!
//! ## Requests (client → server)
//! - `LOGIN`: Present the access token
//! - `REG` / `REMOVE`: Register or drop a subscription group
//! - `PING` / `PONG`: Application-level heartbeat
//! - `CNSRLST` / `CNSRREQ`: Conditional-search list and execution
//!
//! ## Responses (server → client)
//! - `LOGIN` / `REG` / `REMOVE` acks carrying `return_code` and `return_msg`
//! - `REAL`: Batched real-time records
//! - `CNSRLST` / `CNSRREQ`: Conditional-search results

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Discriminators
// =============================================================================

/// `trnm` value for login.
pub const TRNM_LOGIN: &str = "LOGIN";
/// `trnm` value for subscription registration.
pub const TRNM_REG: &str = "REG";
/// `trnm` value for subscription removal.
pub const TRNM_REMOVE: &str = "REMOVE";
/// `trnm` value for real-time data.
pub const TRNM_REAL: &str = "REAL";
/// `trnm` value for heartbeat ping.
pub const TRNM_PING: &str = "PING";
/// `trnm` value for heartbeat pong.
pub const TRNM_PONG: &str = "PONG";
/// `trnm` value for the conditional-search list.
pub const TRNM_CONDITION_LIST: &str = "CNSRLST";
/// `trnm` value for a conditional-search execution.
pub const TRNM_CONDITION_SEARCH: &str = "CNSRREQ";

/// Field carrying the symbol in conditional-search result rows.
pub const CONDITION_SYMBOL_FIELD: &str = "9001";

// =============================================================================
// Requests
// =============================================================================

/// Login request.
///
/// # Wire Format (JSON)
/// ```json
/// {"trnm": "LOGIN", "token": "<access token>"}
/// ```
#[derive(Clone, Serialize)]
pub struct LoginRequest<'a> {
    /// Always `LOGIN`.
    pub trnm: &'static str,
    /// Bearer access token.
    pub token: &'a str,
}

impl std::fmt::Debug for LoginRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("trnm", &self.trnm)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Subscription group request (`REG` or `REMOVE`).
///
/// # Wire Format (JSON)
/// ```json
/// {"trnm": "REG", "grp_no": "1", "refresh": "1",
///  "data": [{"item": ["005930"], "type": ["0B"]}]}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct GroupRequest<'a> {
    /// `REG` or `REMOVE`.
    pub trnm: &'static str,
    /// Group number.
    pub grp_no: &'a str,
    /// `"0"` replace, `"1"` add.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<&'static str>,
    /// One entry per data type.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<GroupEntry<'a>>,
}

/// One `{"item": [...], "type": [...]}` element of a group request.
#[derive(Debug, Clone, Serialize)]
pub struct GroupEntry<'a> {
    /// Symbols.
    pub item: Vec<&'a str>,
    /// Data type codes.
    #[serde(rename = "type")]
    pub data_type: Vec<&'static str>,
}

/// Request carrying only a discriminator (`PING`, `PONG`, `CNSRLST`).
///
/// # Wire Format (JSON)
/// ```json
/// {"trnm": "PING"}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct BareRequest {
    /// Discriminator.
    pub trnm: &'static str,
}

/// Conditional-search execution request.
///
/// # Wire Format (JSON)
/// ```json
/// {"trnm": "CNSRREQ", "seq": "1", "search_type": "0", "stex_tp": "K"}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ConditionSearchRequest<'a> {
    /// Always `CNSRREQ`.
    pub trnm: &'static str,
    /// Condition sequence number from the list response.
    pub seq: &'a str,
    /// `"0"` for a one-shot search.
    pub search_type: &'static str,
    /// Exchange, `"K"` for KRX.
    pub stex_tp: &'static str,
}

// =============================================================================
// Responses
// =============================================================================

/// Envelope used to read the discriminator before full decoding.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Message discriminator.
    pub trnm: String,
}

/// Acknowledgement for `LOGIN`, `REG` and `REMOVE`.
///
/// # Wire Format (JSON)
/// ```json
/// {"trnm": "LOGIN", "return_code": 0, "return_msg": ""}
/// ```
///
/// A missing `return_code` is treated as failure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AckMessage {
    /// Echoed request discriminator.
    pub trnm: String,
    /// `0` on success.
    #[serde(default)]
    pub return_code: Option<i64>,
    /// Human-readable status.
    #[serde(default)]
    pub return_msg: Option<String>,
}

impl AckMessage {
    /// Check whether the request succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.return_code, Some(0))
    }
}

/// Real-time data frame.
///
/// # Wire Format (JSON)
/// ```json
/// {"trnm": "REAL", "data": [
///   {"type": "0B", "name": "주식체결", "item": "005930",
///    "values": {"10": "-75000", "20": "153000"}}
/// ]}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RealMessage {
    /// Always `REAL`.
    pub trnm: String,
    /// Batched records in server order.
    pub data: Vec<RealRecord>,
}

/// One record of a `REAL` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RealRecord {
    /// Data type code.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Display name of the stream.
    #[serde(default)]
    pub name: Option<String>,
    /// Symbol; empty for account-wide streams.
    #[serde(default)]
    pub item: Option<String>,
    /// Field map keyed by field code.
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Conditional-search list response.
///
/// # Wire Format (JSON)
/// ```json
/// {"trnm": "CNSRLST", "return_code": 0, "data": [["0", "Golden cross"], ["1", "Breakout"]]}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionListMessage {
    /// Always `CNSRLST`.
    pub trnm: String,
    /// `0` on success.
    #[serde(default)]
    pub return_code: Option<i64>,
    /// Human-readable status.
    #[serde(default)]
    pub return_msg: Option<String>,
    /// `[seq, name]` pairs.
    #[serde(default)]
    pub data: Vec<Vec<serde_json::Value>>,
}

/// Conditional-search result response.
///
/// # Wire Format (JSON)
/// ```json
/// {"trnm": "CNSRREQ", "seq": "1", "return_code": 0,
///  "data": [{"9001": "A005930", "302": "삼성전자", "10": "75000"}]}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionSearchMessage {
    /// Always `CNSRREQ`.
    pub trnm: String,
    /// Condition sequence the results belong to.
    #[serde(default)]
    pub seq: Option<String>,
    /// `0` on success.
    #[serde(default)]
    pub return_code: Option<i64>,
    /// Human-readable status.
    #[serde(default)]
    pub return_msg: Option<String>,
    /// Result rows keyed by field code.
    #[serde(default)]
    pub data: Vec<BTreeMap<String, serde_json::Value>>,
}
