use crate::types::{ClientId, RoomId, SubscribeTrackRequest, TrackKey};
use thiserror::Error;

/// Coarse error classes surfaced to callers across the transport boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidOperation,
    AlreadyReleased,
    Timeout,
    Capacity,
}

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("room already exists: {0}")]
    RoomAlreadyExists(RoomId),

    #[error("room is closed: {0}")]
    RoomClosed(RoomId),

    #[error("maximum number of rooms reached ({0})")]
    RoomLimitReached(usize),

    #[error("manager is stopped")]
    ManagerStopped,

    #[error("timeout connecting to remote room: {0}")]
    RemoteRoomTimeout(RoomId),

    #[error("client not found: {0}")]
    ClientNotFound(ClientId),

    #[error("client already exists: {0}")]
    ClientAlreadyExists(ClientId),

    #[error("room {room_id} is full ({max_clients} clients)")]
    RoomFull { room_id: RoomId, max_clients: usize },

    #[error("client has no active session: {0}")]
    ClientNotActive(ClientId),

    #[error("track not found: {0}")]
    TrackNotFound(TrackKey),

    #[error("track already published: {0}")]
    DuplicateTrack(TrackKey),

    #[error("client cannot subscribe to its own track: {0}")]
    SelfSubscribe(TrackKey),

    /// First failure of a bulk subscribe. Requests before `index` stay applied.
    #[error("subscribe request #{index} ({request}) failed: {source}")]
    SubscribeFailed {
        index: usize,
        request: SubscribeTrackRequest,
        #[source]
        source: Box<SfuError>,
    },

    #[error("meta: metadata not found: {0}")]
    MetaNotFound(String),

    #[error("packet has been released")]
    PacketAlreadyReleased,

    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

impl SfuError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RoomNotFound(_)
            | Self::ClientNotFound(_)
            | Self::TrackNotFound(_)
            | Self::MetaNotFound(_) => ErrorKind::NotFound,
            Self::RoomAlreadyExists(_)
            | Self::RoomClosed(_)
            | Self::ManagerStopped
            | Self::ClientAlreadyExists(_)
            | Self::ClientNotActive(_)
            | Self::DuplicateTrack(_)
            | Self::SelfSubscribe(_)
            | Self::PayloadTooLarge { .. } => ErrorKind::InvalidOperation,
            Self::RoomLimitReached(_) | Self::RoomFull { .. } => ErrorKind::Capacity,
            Self::PacketAlreadyReleased => ErrorKind::AlreadyReleased,
            Self::RemoteRoomTimeout(_) => ErrorKind::Timeout,
            Self::SubscribeFailed { source, .. } => source.kind(),
        }
    }

    /// The underlying cause for aggregate errors, `self` otherwise
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::SubscribeFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
