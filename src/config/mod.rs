//! Client configuration
//!
//! `AppConfig` is the structured options object handed to the controller;
//! `SettingsStore` owns it at runtime and broadcasts changes.

pub mod overrides;
mod schema;
mod store;

pub use schema::*;
pub use store::{SettingChange, SettingsStore};
