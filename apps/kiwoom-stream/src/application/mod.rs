//! Application Layer - Port definitions and dispatch services.
//!
//! This layer contains the transport ports the session is written
//! against and the callback dispatcher that fans events out to handlers.

/// Port interfaces for the feed transport.
pub mod ports;

/// Application services (callback dispatch).
pub mod services;
