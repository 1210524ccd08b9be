//! Core types and utilities for the publisher agent
//!
//! This crate provides shared types used across all components:
//! - Asset, oracle and broker identifiers
//! - Value updates and signed price wire types
//! - Exact decimal parsing and 10^18 quantization
//! - Agent configuration and error types

pub mod types;
pub mod decimal;
pub mod settings;
pub mod errors;

pub use types::*;
pub use decimal::*;
pub use settings::*;
pub use errors::*;
