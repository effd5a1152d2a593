//! Real-time Streaming Types
//!
//! Core domain types for the real-time feed: the closed set of stream
//! kinds, the decoded event delivered to callbacks, and the session
//! lifecycle state. These types are codec-agnostic.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Data Types
// =============================================================================

/// Kind of real-time stream, identified on the wire by a short code.
///
/// Codes are case-sensitive: `0g` (stock info) and `0G` (ETF NAV) are
/// different streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    /// Order execution (`00`).
    OrderExecution,
    /// Account balance (`04`).
    AccountBalance,
    /// Stock quote tick (`0A`).
    StockPrice,
    /// Stock trade tick (`0B`).
    StockTrade,
    /// Best bid/ask (`0C`).
    BestQuote,
    /// Full order book (`0D`).
    OrderBook,
    /// After-hours quote (`0E`).
    AfterHours,
    /// Daily trader info (`0F`).
    DailyTrader,
    /// ETF NAV (`0G`).
    EtfNav,
    /// Pre-market expected trade (`0H`).
    PreMarket,
    /// Sector index (`0J`).
    SectorIndex,
    /// Sector advance/decline stats (`0U`).
    SectorChange,
    /// Stock info change (`0g`).
    StockInfo,
    /// ELW theoretical price (`0m`).
    ElwTheory,
    /// Market open time (`0s`).
    MarketTime,
    /// ELW indicator (`0u`).
    ElwIndicator,
    /// Program trading (`0w`).
    ProgramTrading,
    /// Volatility interruption trigger/release (`1h`).
    ViTrigger,
    /// Conditional-search list response (`CNSRLST`).
    ConditionList,
    /// Conditional-search result response (`CNSRREQ`).
    ConditionResult,
}

impl DataType {
    /// Get all data types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::OrderExecution,
            Self::AccountBalance,
            Self::StockPrice,
            Self::StockTrade,
            Self::BestQuote,
            Self::OrderBook,
            Self::AfterHours,
            Self::DailyTrader,
            Self::EtfNav,
            Self::PreMarket,
            Self::SectorIndex,
            Self::SectorChange,
            Self::StockInfo,
            Self::ElwTheory,
            Self::MarketTime,
            Self::ElwIndicator,
            Self::ProgramTrading,
            Self::ViTrigger,
            Self::ConditionList,
            Self::ConditionResult,
        ]
    }

    /// Wire code for this data type.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::OrderExecution => "00",
            Self::AccountBalance => "04",
            Self::StockPrice => "0A",
            Self::StockTrade => "0B",
            Self::BestQuote => "0C",
            Self::OrderBook => "0D",
            Self::AfterHours => "0E",
            Self::DailyTrader => "0F",
            Self::EtfNav => "0G",
            Self::PreMarket => "0H",
            Self::SectorIndex => "0J",
            Self::SectorChange => "0U",
            Self::StockInfo => "0g",
            Self::ElwTheory => "0m",
            Self::MarketTime => "0s",
            Self::ElwIndicator => "0u",
            Self::ProgramTrading => "0w",
            Self::ViTrigger => "1h",
            Self::ConditionList => "CNSRLST",
            Self::ConditionResult => "CNSRREQ",
        }
    }

    /// Look up a data type by its wire code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::all().iter().copied().find(|dt| dt.code() == code)
    }

    /// Whether this stream is registered with `REG` frames.
    ///
    /// Condition-search streams are request/response and never appear in a
    /// subscription group.
    #[must_use]
    pub const fn is_subscribable(self) -> bool {
        !matches!(self, Self::ConditionList | Self::ConditionResult)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Error returned when parsing an unknown data type code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown data type code: {0}")]
pub struct UnknownDataType(pub String);

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_code(s).ok_or_else(|| UnknownDataType(s.to_string()))
    }
}

// =============================================================================
// Realtime Event
// =============================================================================

/// Field code carrying the execution time (`HHMMSS`) on tick streams.
pub const TRADE_TIME_FIELD: &str = "20";

/// A decoded real-time record.
///
/// Field maps are kept as raw string pairs keyed by the feed's numeric
/// field codes; their meaning depends on the data type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RealtimeEvent {
    data_type: DataType,
    symbol: String,
    name: Option<String>,
    fields: BTreeMap<String, String>,
    received_at: DateTime<Utc>,
}

impl RealtimeEvent {
    /// Create a new event stamped with the current time.
    #[must_use]
    pub fn new(
        data_type: DataType,
        symbol: impl Into<String>,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Self {
            data_type,
            symbol: symbol.into(),
            name: None,
            fields,
            received_at: Utc::now(),
        }
    }

    /// Attach the feed's display name for the stream.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.name = Some(name);
        }
        self
    }

    /// Override the receive timestamp.
    #[must_use]
    pub const fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Stream kind.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Symbol code; empty for account- or market-wide events.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Display name supplied by the feed, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// All fields keyed by field code.
    #[must_use]
    pub const fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Time the frame carrying this event was decoded.
    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Get a single field value.
    #[must_use]
    pub fn field(&self, code: &str) -> Option<&str> {
        self.fields.get(code).map(String::as_str)
    }

    /// Execution time field (`20`), when present.
    #[must_use]
    pub fn trade_time(&self) -> Option<&str> {
        self.field(TRADE_TIME_FIELD)
    }

    /// Parse a field as a decimal.
    ///
    /// Kiwoom prefixes prices with `+`/`-` to signal direction against the
    /// previous close; the sign is kept, so `"-75000"` parses as `-75000`.
    /// Use [`Decimal::abs`] for the raw price.
    #[must_use]
    pub fn decimal(&self, code: &str) -> Option<Decimal> {
        let raw = self.field(code)?.trim();
        let unsigned = raw.strip_prefix('+').unwrap_or(raw);
        Decimal::from_str(unsigned).ok()
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No connection and none being attempted.
    #[default]
    Disconnected,
    /// Opening the transport and logging in.
    Connecting,
    /// Login acknowledged, subscriptions not yet restored.
    Authenticated,
    /// Live: subscriptions restored and events flowing.
    Streaming,
    /// Connection lost, backing off before the next attempt.
    Reconnecting,
    /// Explicitly disconnected or reconnection budget exhausted.
    Closed,
}

impl SessionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    /// Whether a connection attempt may be started from this state.
    #[must_use]
    pub const fn can_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Closed)
    }

    /// Whether the session currently holds or is acquiring a connection.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticated | Self::Streaming | Self::Reconnecting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
