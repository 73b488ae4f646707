//! Physiotherapy sensor link and exercise session engine.
//!
//! - [`infrastructure::bluetooth`] talks to the wearable motion sensor.
//! - [`engine`] runs one timed exercise attempt and scores its readings.
//! - [`domain`] holds the catalog, scoring rules, records and settings.

pub mod domain;
pub mod engine;
pub mod infrastructure;
