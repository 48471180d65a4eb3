//! Additive decision-tree ensemble scoring for insurance claims.
//!
//! Pipeline: parse conditions, trace claims through every component tree,
//! batch-score a claims table, roll up financial metrics and lay trees out
//! as graphs for rendering.

pub mod claims;
pub mod condition;
pub mod config;
pub mod error;
pub mod financial;
pub mod layout;
pub mod logging;
pub mod trace;
pub mod tree;
