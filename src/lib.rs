//! Redfire FXS - analog telephone line controller
//!
//! Drives telephone handsets wired to sound cards and input-event devices:
//! hook and keypad events, dial and progress tones, the ringer, and call
//! audio exchanged with a call host.
//!
//! **Sponsored by [Carrier One Inc](https://carrierone.com) - Professional Telecommunications Solutions**

pub mod config;
pub mod core;
pub mod protocols;
pub mod interfaces;
pub mod services;
pub mod error;
pub mod utils;

pub use error::{Error, Result};

/// Controller version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
