//! Shared types and utilities for the perp trading agent.
//!
//! This crate contains:
//! - Common types (Side, Interval, Candle)
//! - Step/tick quantisation helpers for order normalisation

pub mod num;
pub mod types;

pub use num::{floor_to_step, format_step};
pub use types::{Candle, Interval, Side, Trend};
