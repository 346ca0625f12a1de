//! # Hexmon Common Library
//!
//! Shared code for the Hexmon signage player:
//! - Domain model (timeline items, playlists, commands, player state)
//! - Event bus and event types
//! - Error taxonomy
//! - Configuration loading and validation
//! - Atomic file persistence helpers

pub mod config;
pub mod error;
pub mod events;
pub mod fsutil;
pub mod model;

pub use error::{Error, Result};
