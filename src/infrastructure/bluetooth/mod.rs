//! Bluetooth Module
//!
//! Provides the BLE link to the motion sensor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       DeviceLink                         │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┬──────────────┐
//!         │             │             │              │
//!         ▼             ▼             ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │  │ Platform  │
//! │           │  │            │  │          │  │           │
//! │ - Prefix  │  │ - State    │  │ - UUIDs  │  │ - OS BLE  │
//! │   filter  │  │   machine  │  │ - Frame  │  │   stack   │
//! │ - Dedup   │  │ - Config   │  │   codec  │  │ - Events  │
//! └───────────┘  └────────────┘  └──────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Sensor UUIDs and the notification payload codec
//! - [`scanner`] - Discovered-device registry
//! - [`connection`] - Link configuration and connection state machine
//! - [`platform`] - Seam to the operating system BLE stack
//! - [`service`] - Main link coordinator
//! - [`simulated`] - In-process sensor for demos and tests

pub mod connection;
pub mod error;
pub mod platform;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;

#[cfg(feature = "btleplug-backend")]
pub mod btleplug_backend;

// Re-export main service for convenience
pub use connection::LinkConfig;
pub use error::LinkError;
pub use service::DeviceLink;
