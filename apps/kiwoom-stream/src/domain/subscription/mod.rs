//! Subscription Management Types
//!
//! Domain types for tracking which `(symbol, data type)` streams the
//! session has asked the server for.
//!
//! # Design
//!
//! Subscriptions are organised in groups, matching Kiwoom's `grp_no`:
//! - A group covers the cross product of its symbols and data types
//! - `REPLACE` overwrites a group, `ADD` unions into it
//! - The registry keeps groups in creation order so a reconnect can
//!   replay exactly one `REG` per group, in the order they were made
//!
//! The registry is the single source of truth. Whatever the server knows
//! about is a projection of it, rebuilt from [`SubscriptionRegistry::snapshot`]
//! after every reconnect.

use std::collections::HashSet;

use parking_lot::RwLock;
use serde::Serialize;

use crate::domain::streaming::DataType;

// =============================================================================
// Types
// =============================================================================

/// Default ceiling on distinct `(symbol, data type)` pairs.
pub const DEFAULT_SUBSCRIPTION_LIMIT: usize = 100;

/// Symbol value that matches every symbol of a data type.
///
/// Account-wide streams (order execution, balance) are registered with an
/// empty item.
pub const WILDCARD_SYMBOL: &str = "";

/// A single `(symbol, data type)` stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StreamKey {
    /// Symbol code, or [`WILDCARD_SYMBOL`].
    pub symbol: String,
    /// Stream kind.
    pub data_type: DataType,
}

impl StreamKey {
    /// Create a new stream key.
    #[must_use]
    pub fn new(symbol: impl Into<String>, data_type: DataType) -> Self {
        Self {
            symbol: symbol.into(),
            data_type,
        }
    }
}

/// How a `REG` request treats an existing group with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RefreshMode {
    /// Drop whatever the group held and register only the new pairs.
    #[default]
    Replace,
    /// Keep the group's existing pairs and add the new ones.
    Add,
}

impl RefreshMode {
    /// Wire value for the `refresh` field.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Replace => "0",
            Self::Add => "1",
        }
    }
}

/// A subscription group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    group_id: String,
    refresh_mode: RefreshMode,
    pairs: Vec<StreamKey>,
}

impl Subscription {
    /// Build a group from the cross product of `symbols` and `data_types`.
    ///
    /// Pairs are ordered data type first, then symbol, in call order.
    /// Duplicates are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the group id is empty, either list is empty,
    /// or a data type cannot be registered.
    pub fn new<S: AsRef<str>>(
        group_id: impl Into<String>,
        symbols: &[S],
        data_types: &[DataType],
        refresh_mode: RefreshMode,
    ) -> Result<Self, SubscribeError> {
        let group_id = group_id.into();
        if group_id.is_empty() {
            return Err(SubscribeError::EmptyGroupId);
        }
        if symbols.is_empty() {
            return Err(SubscribeError::NoSymbols);
        }
        if data_types.is_empty() {
            return Err(SubscribeError::NoDataTypes);
        }
        if let Some(dt) = data_types.iter().find(|dt| !dt.is_subscribable()) {
            return Err(SubscribeError::NotSubscribable(*dt));
        }

        let mut seen = HashSet::new();
        let pairs = data_types
            .iter()
            .flat_map(|dt| symbols.iter().map(|s| StreamKey::new(s.as_ref(), *dt)))
            .filter(|key| seen.insert(key.clone()))
            .collect();

        Ok(Self {
            group_id,
            refresh_mode,
            pairs,
        })
    }

    /// Group identifier.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Refresh mode the group was last registered with.
    #[must_use]
    pub const fn refresh_mode(&self) -> RefreshMode {
        self.refresh_mode
    }

    /// All pairs covered by this group.
    #[must_use]
    pub fn pairs(&self) -> &[StreamKey] {
        &self.pairs
    }

    /// Check whether this group covers a stream, honouring the wildcard.
    #[must_use]
    pub fn covers(&self, symbol: &str, data_type: DataType) -> bool {
        self.pairs.iter().any(|key| {
            key.data_type == data_type
                && (key.symbol == symbol || key.symbol == WILDCARD_SYMBOL)
        })
    }

    /// Distinct symbols in first-seen order.
    #[must_use]
    pub fn symbols(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for key in &self.pairs {
            if !out.contains(&key.symbol.as_str()) {
                out.push(&key.symbol);
            }
        }
        out
    }

    /// Distinct data types in first-seen order.
    #[must_use]
    pub fn data_types(&self) -> Vec<DataType> {
        let mut out = Vec::new();
        for key in &self.pairs {
            if !out.contains(&key.data_type) {
                out.push(key.data_type);
            }
        }
        out
    }

    /// Whether the pairs are exactly `symbols() × data_types()`.
    ///
    /// Always true for a fresh group; an ADD merge can break it.
    #[must_use]
    pub fn is_cross_product(&self) -> bool {
        self.pairs.len() == self.symbols().len() * self.data_types().len()
    }

    /// Pairs grouped by data type, in first-seen order.
    #[must_use]
    pub fn entries(&self) -> Vec<(DataType, Vec<&str>)> {
        let mut out: Vec<(DataType, Vec<&str>)> = Vec::new();
        for key in &self.pairs {
            match out.iter_mut().find(|(dt, _)| *dt == key.data_type) {
                Some((_, symbols)) => symbols.push(&key.symbol),
                None => out.push((key.data_type, vec![key.symbol.as_str()])),
            }
        }
        out
    }

    fn merge(&mut self, other: Self) {
        for key in other.pairs {
            if !self.pairs.contains(&key) {
                self.pairs.push(key);
            }
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Registering a change would exceed the subscription ceiling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("subscription limit exceeded: {requested} pairs requested, limit is {limit}")]
pub struct CapacityError {
    /// Configured ceiling.
    pub limit: usize,
    /// Distinct pairs the registry would hold after the change.
    pub requested: usize,
}

/// Errors from a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// Group id was empty.
    #[error("group id must not be empty")]
    EmptyGroupId,

    /// No symbols were given.
    #[error("at least one symbol is required")]
    NoSymbols,

    /// No data types were given.
    #[error("at least one data type is required")]
    NoDataTypes,

    /// Request/response streams cannot be registered.
    #[error("data type {0} cannot be subscribed")]
    NotSubscribable(DataType),

    /// Ceiling exceeded; the registry is unchanged.
    #[error(transparent)]
    Capacity(#[from] CapacityError),
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe registry of active subscription groups.
///
/// # Example
///
/// ```rust
/// use kiwoom_stream::domain::streaming::DataType;
/// use kiwoom_stream::domain::subscription::{RefreshMode, Subscription, SubscriptionRegistry};
///
/// let registry = SubscriptionRegistry::new(100);
///
/// let sub = Subscription::new("1", &["005930"], &[DataType::StockTrade], RefreshMode::Replace)?;
/// registry.add(sub)?;
/// assert!(registry.covers("005930", DataType::StockTrade));
///
/// // ADD unions into the existing group
/// let more = Subscription::new("1", &["000660"], &[DataType::StockTrade], RefreshMode::Add)?;
/// registry.add(more)?;
/// assert_eq!(registry.pair_count(), 2);
///
/// registry.remove("1");
/// assert!(!registry.covers("005930", DataType::StockTrade));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct SubscriptionRegistry {
    limit: usize,
    groups: RwLock<Vec<Subscription>>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_LIMIT)
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry with the given pair ceiling.
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            limit,
            groups: RwLock::new(Vec::new()),
        }
    }

    /// Configured ceiling.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Record a subscription.
    ///
    /// `REPLACE` overwrites an existing group; `ADD` unions into it. A
    /// group that already exists keeps its creation position.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] if the registry would exceed its ceiling.
    /// The registry is left untouched in that case.
    pub fn add(&self, subscription: Subscription) -> Result<(), CapacityError> {
        let mut groups = self.groups.write();

        let mut next = groups.clone();
        match next
            .iter_mut()
            .find(|g| g.group_id == subscription.group_id)
        {
            Some(existing) => match subscription.refresh_mode {
                RefreshMode::Replace => *existing = subscription,
                RefreshMode::Add => existing.merge(subscription),
            },
            None => next.push(subscription),
        }

        let requested = distinct_pairs(&next);
        if requested > self.limit {
            return Err(CapacityError {
                limit: self.limit,
                requested,
            });
        }

        *groups = next;
        Ok(())
    }

    /// Remove a group.
    pub fn remove(&self, group_id: &str) -> Option<Subscription> {
        let mut groups = self.groups.write();
        let idx = groups.iter().position(|g| g.group_id == group_id)?;
        Some(groups.remove(idx))
    }

    /// Remove every group, returning them in creation order.
    pub fn remove_all(&self) -> Vec<Subscription> {
        std::mem::take(&mut *self.groups.write())
    }

    /// Copy of all groups in creation order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.groups.read().clone()
    }

    /// Get a single group.
    #[must_use]
    pub fn get(&self, group_id: &str) -> Option<Subscription> {
        self.groups
            .read()
            .iter()
            .find(|g| g.group_id == group_id)
            .cloned()
    }

    /// Check whether any group covers a stream.
    #[must_use]
    pub fn covers(&self, symbol: &str, data_type: DataType) -> bool {
        self.groups.read().iter().any(|g| g.covers(symbol, data_type))
    }

    /// Number of distinct pairs across all groups.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        distinct_pairs(&self.groups.read())
    }

    /// Number of groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Check if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let groups = self.groups.read();
        RegistryStats {
            group_count: groups.len(),
            pair_count: distinct_pairs(&groups),
            limit: self.limit,
        }
    }
}

fn distinct_pairs(groups: &[Subscription]) -> usize {
    groups
        .iter()
        .flat_map(|g| g.pairs.iter())
        .collect::<HashSet<_>>()
        .len()
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    /// Number of groups.
    pub group_count: usize,
    /// Distinct `(symbol, data type)` pairs.
    pub pair_count: usize,
    /// Configured ceiling.
    pub limit: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(group: &str, symbols: &[&str], types: &[DataType], mode: RefreshMode) -> Subscription {
        Subscription::new(group, symbols, types, mode).unwrap()
    }

    #[test]
    fn subscription_is_cross_product() {
        let s = sub(
            "1",
            &["005930", "000660"],
            &[DataType::StockTrade, DataType::StockPrice],
            RefreshMode::Replace,
        );

        assert_eq!(s.pairs().len(), 4);
        assert_eq!(s.symbols(), vec!["005930", "000660"]);
        assert_eq!(s.data_types(), vec![DataType::StockTrade, DataType::StockPrice]);
        assert!(s.is_cross_product());
    }

    #[test]
    fn subscription_drops_duplicate_pairs() {
        let s = sub(
            "1",
            &["005930", "005930"],
            &[DataType::StockTrade],
            RefreshMode::Replace,
        );
        assert_eq!(s.pairs().len(), 1);
    }

    #[test]
    fn subscription_entries_group_by_data_type() {
        let s = sub(
            "1",
            &["005930", "000660"],
            &[DataType::OrderBook, DataType::BestQuote],
            RefreshMode::Add,
        );

        let entries = s.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (DataType::OrderBook, vec!["005930", "000660"]));
        assert_eq!(entries[1], (DataType::BestQuote, vec!["005930", "000660"]));
    }

    #[test]
    fn subscription_rejects_invalid_requests() {
        let none: &[&str] = &[];
        assert_eq!(
            Subscription::new("", &["005930"], &[DataType::StockTrade], RefreshMode::Add),
            Err(SubscribeError::EmptyGroupId)
        );
        assert_eq!(
            Subscription::new("1", none, &[DataType::StockTrade], RefreshMode::Add),
            Err(SubscribeError::NoSymbols)
        );
        assert_eq!(
            Subscription::new("1", &["005930"], &[], RefreshMode::Add),
            Err(SubscribeError::NoDataTypes)
        );
        assert_eq!(
            Subscription::new("1", &["005930"], &[DataType::ConditionList], RefreshMode::Add),
            Err(SubscribeError::NotSubscribable(DataType::ConditionList))
        );
    }

    #[test]
    fn refresh_mode_codes() {
        assert_eq!(RefreshMode::Replace.code(), "0");
        assert_eq!(RefreshMode::Add.code(), "1");
    }

    #[test]
    fn replace_is_idempotent() {
        let registry = SubscriptionRegistry::default();
        let s = sub("1", &["005930"], &[DataType::StockTrade], RefreshMode::Replace);

        registry.add(s.clone()).unwrap();
        let first = registry.snapshot();
        registry.add(s).unwrap();

        assert_eq!(registry.snapshot(), first);
        assert_eq!(registry.group_count(), 1);
    }

    #[test]
    fn replace_overwrites_group() {
        let registry = SubscriptionRegistry::default();
        registry
            .add(sub("1", &["005930"], &[DataType::StockTrade], RefreshMode::Replace))
            .unwrap();
        registry
            .add(sub("1", &["000660"], &[DataType::StockTrade], RefreshMode::Replace))
            .unwrap();

        assert!(!registry.covers("005930", DataType::StockTrade));
        assert!(registry.covers("000660", DataType::StockTrade));
    }

    #[test]
    fn add_merges_into_group() {
        let registry = SubscriptionRegistry::default();
        registry
            .add(sub("1", &["005930"], &[DataType::StockTrade], RefreshMode::Add))
            .unwrap();
        registry
            .add(sub("1", &["000660"], &[DataType::StockPrice], RefreshMode::Add))
            .unwrap();

        let group = registry.get("1").unwrap();
        assert_eq!(group.pairs().len(), 2);
        assert!(registry.covers("005930", DataType::StockTrade));
        assert!(registry.covers("000660", DataType::StockPrice));
        assert!(!registry.covers("000660", DataType::StockTrade));
    }

    #[test]
    fn replaced_group_keeps_position() {
        let registry = SubscriptionRegistry::default();
        for g in ["a", "b", "c"] {
            registry
                .add(sub(g, &["005930"], &[DataType::StockTrade], RefreshMode::Replace))
                .unwrap();
        }
        registry
            .add(sub("a", &["000660"], &[DataType::StockTrade], RefreshMode::Replace))
            .unwrap();

        let order: Vec<_> = registry
            .snapshot()
            .iter()
            .map(|g| g.group_id().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn capacity_rejection_leaves_registry_unchanged() {
        let registry = SubscriptionRegistry::new(2);
        registry
            .add(sub("1", &["A", "B"], &[DataType::StockTrade], RefreshMode::Replace))
            .unwrap();
        let before = registry.snapshot();

        let err = registry
            .add(sub("2", &["C"], &[DataType::StockTrade], RefreshMode::Replace))
            .unwrap_err();

        assert_eq!(err, CapacityError { limit: 2, requested: 3 });
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn capacity_counts_distinct_pairs_across_groups() {
        let registry = SubscriptionRegistry::new(1);
        registry
            .add(sub("1", &["A"], &[DataType::StockTrade], RefreshMode::Replace))
            .unwrap();
        registry
            .add(sub("2", &["A"], &[DataType::StockTrade], RefreshMode::Replace))
            .unwrap();

        assert_eq!(registry.pair_count(), 1);
        assert_eq!(registry.group_count(), 2);
    }

    #[test]
    fn replace_can_shrink_under_limit() {
        let registry = SubscriptionRegistry::new(2);
        registry
            .add(sub("1", &["A", "B"], &[DataType::StockTrade], RefreshMode::Replace))
            .unwrap();
        registry
            .add(sub("1", &["C", "D"], &[DataType::StockTrade], RefreshMode::Replace))
            .unwrap();
        assert_eq!(registry.pair_count(), 2);
    }

    #[test]
    fn wildcard_symbol_covers_everything() {
        let registry = SubscriptionRegistry::default();
        registry
            .add(sub(
                "3",
                &[WILDCARD_SYMBOL],
                &[DataType::OrderExecution],
                RefreshMode::Add,
            ))
            .unwrap();

        assert!(registry.covers("", DataType::OrderExecution));
        assert!(registry.covers("005930", DataType::OrderExecution));
        assert!(!registry.covers("005930", DataType::AccountBalance));
    }

    #[test]
    fn remove_and_remove_all() {
        let registry = SubscriptionRegistry::default();
        registry
            .add(sub("1", &["A"], &[DataType::StockTrade], RefreshMode::Replace))
            .unwrap();
        registry
            .add(sub("2", &["B"], &[DataType::StockTrade], RefreshMode::Replace))
            .unwrap();

        assert!(registry.remove("missing").is_none());
        assert_eq!(registry.remove("1").unwrap().group_id(), "1");
        assert!(!registry.covers("A", DataType::StockTrade));

        let removed = registry.remove_all();
        assert_eq!(removed.len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn stats_are_accurate() {
        let registry = SubscriptionRegistry::new(50);
        registry
            .add(sub(
                "1",
                &["A", "B"],
                &[DataType::StockTrade, DataType::StockPrice],
                RefreshMode::Replace,
            ))
            .unwrap();

        let stats = registry.stats();
        assert_eq!(stats.group_count, 1);
        assert_eq!(stats.pair_count, 4);
        assert_eq!(stats.limit, 50);
    }
}
