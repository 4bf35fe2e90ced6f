//! Confab SFU (Selective Forwarding Unit) core
//!
//! The SFU receives media from every participant of a room and selectively
//! forwards it to the other participants. This crate holds the session
//! registry and track-brokering state; the WebRTC transport, signaling and
//! packet I/O live outside and drive it through [`Client`].
//!
//! ## Architecture
//!
//! - **`Manager`**: process-wide registry of rooms, with lifecycle extensions
//! - **`Room`**: the clients of one conference and the tracks they publish
//! - **`Client`**: one participant; publishes and subscribes to tracks
//! - **`MediaTrack`** / **`Subscription`**: a published track and its bindings
//! - **`PacketManager`** / **`RetainablePacket`**: pooled, reference-counted
//!   packet buffers shared between pipeline stages
//! - **`Metadata`**: key/value store whose listeners are bound to a lifetime scope
//!
//! ## Track flow
//!
//! 1. The transport announces inbound tracks with [`Client::add_tracks`]; the
//!    publisher receives one tracks-added event.
//! 2. Every other client in the room receives a tracks-available event.
//! 3. A client subscribes with [`Client::subscribe_tracks`]; packets handed to
//!    [`MediaTrack::forward`] reach its packet receiver.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use confab_sfu::{Manager, NoopTransport, RoomType, SfuConfig, TrackInfo};
//!
//! let manager = Manager::new("sfu", SfuConfig::default());
//! let room = manager.new_room(manager.create_room_id(), "standup", RoomType::Local)?;
//! let client = room.add_client("alice".into(), Box::new(NoopTransport))?;
//! client.add_tracks(vec![TrackInfo::audio("mic")])?;
//! ```

mod client;
mod config;
mod error;
mod logging;
mod manager;
mod metadata;
mod packet;
mod room;
mod track;
mod types;
mod window;

pub use client::{Client, ConnectionState, NoopTransport, SessionTransport};
pub use config::{LoggingConfig, SfuConfig};
pub use error::{ErrorKind, Result, SfuError};
pub use logging::{init_logging, parse_log_level};
pub use manager::{Manager, ManagerExtension, ManagerStats};
pub use metadata::{ListenerId, Metadata};
pub use packet::{
    PacketGuard, PacketManager, PoolStats, RetainablePacket, VoicePacketData, MAX_PAYLOAD_LEN,
};
pub use room::{Room, RoomStats, RoomType};
pub use track::{
    ForwardablePacket, MediaTrack, QualityLayer, Subscription, TrackInfo, TrackKind, TrackSource,
    TrackStats,
};
pub use types::{ClientId, RoomId, SubscribeTrackRequest, TrackId, TrackKey};
pub use window::PacketWindow;
