//! Domain Layer - Core streaming types and subscription state.
//!
//! This layer contains the feed's data types and the subscription
//! registry. Nothing here touches the network.

/// Real-time data types, decoded events, and session state.
pub mod streaming;

/// Subscription groups and the registry replayed on reconnect.
pub mod subscription;
