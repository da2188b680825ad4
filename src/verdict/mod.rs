//! Outcome classification
//!
//! Derives the terminal status as a pure function of supervision flags and
//! final readings.

pub mod resolver;
