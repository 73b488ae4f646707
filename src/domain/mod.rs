pub mod accuracy;
pub mod exercise;
pub mod models;
pub mod progress;
pub mod session;
pub mod settings;
