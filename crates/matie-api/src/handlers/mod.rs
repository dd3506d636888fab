//! API handlers

pub mod annotate;
pub mod health;
