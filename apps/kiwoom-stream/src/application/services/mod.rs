//! Application Services
//!
//! - `CallbackDispatcher`: maps data types to user callbacks and delivers
//!   events with per-handler failure isolation

mod dispatcher;

pub use dispatcher::{Callback, CallbackDispatcher, CallbackId, DispatchOutcome, HandlerError};
