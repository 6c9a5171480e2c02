//! Trade admissibility engine for a bonding-curve token launchpad.
//!
//! Decides, for every proposed trade, whether it is allowed, at what price,
//! and how it moves the trader's risk and reputation state.

pub mod admission;
pub mod audit;
pub mod curve;
pub mod fault;
pub mod identity;
pub mod locks;
pub mod logging;
pub mod rate_limit;
pub mod reputation;
pub mod risk;
pub mod session;
pub mod state;
pub mod storage;
pub mod types;

pub use admission::{AdmissionError, TradeAdmissionController, ValidationError};
pub use types::{TradeAttempt, TradeDecision};
