//! # Hexmon Signage Player (hexmon-player)
//!
//! Device-resident runtime of the Hexmon digital signage player.
//!
//! **Purpose:** Pair the device with the content-management backend over
//! mTLS, poll device snapshots into a local playlist, cache media with
//! integrity checks and LRU eviction, drive playback on a timeline with
//! transitions, and process remote commands, all of it resilient to an
//! intermittent or absent network.
//!
//! **Architecture:** One tokio runtime hosting cancellable service tasks
//! (snapshot manager, command processor, default-media poller, request
//! queue worker) wired once at startup by [`flow::PlayerFlow`]; components
//! communicate over a broadcast [`hexmon_common::events::EventBus`] and
//! internal mpsc channels.

pub mod cache;
pub mod certs;
pub mod commands;
pub mod default_media;
pub mod flow;
pub mod http;
pub mod lock;
pub mod pairing;
pub mod playback;
pub mod renderer;
pub mod request_queue;
pub mod snapshot;
pub mod timeline;

pub use hexmon_common::{Error, Result};
