//! Job and escrow lifecycle engine for a freelance services marketplace
//!
//! This crate implements the state machine taking a job posting from
//! creation through offer negotiation, acceptance, work execution,
//! payment escrow, completion, dispute and expiry:
//! - Version-keyed conditional writes for race safety
//! - Fixed-point money with exact fee splits
//! - Injected store, clock and notification sink
//! - A periodic sweeper for auto-release and expiry

pub mod clock;
pub mod engine;
pub mod error;
pub mod escrow_manager;
pub mod models;
pub mod money;
pub mod notifier;
pub mod offer_manager;
pub mod store;
pub mod sweeper;

use error::EngineError;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
