//! Common types used throughout the SFU implementation

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a string-backed identifier that serializes as a bare string
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id! {
    /// One participant session in a room
    ClientId
}

string_id! {
    /// Unique within a [`Manager`](crate::Manager)
    RoomId
}

string_id! {
    /// Unique only within its owning client
    TrackId
}

/// Room-wide track identity: track IDs only need to be unique per client,
/// so the room keys its registry by owner and track together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackKey {
    pub client_id: ClientId,
    pub track_id: TrackId,
}

impl TrackKey {
    pub fn new(client_id: impl Into<ClientId>, track_id: impl Into<TrackId>) -> Self {
        Self {
            client_id: client_id.into(),
            track_id: track_id.into(),
        }
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.track_id)
    }
}

/// Transport-independent description of one subscribe intent: the publisher
/// (`client_id`) and the track it published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscribeTrackRequest {
    pub client_id: ClientId,
    pub track_id: TrackId,
}

impl SubscribeTrackRequest {
    pub fn new(client_id: impl Into<ClientId>, track_id: impl Into<TrackId>) -> Self {
        Self {
            client_id: client_id.into(),
            track_id: track_id.into(),
        }
    }

    #[must_use]
    pub fn key(&self) -> TrackKey {
        TrackKey::new(self.client_id.clone(), self.track_id.clone())
    }
}

impl fmt::Display for SubscribeTrackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.track_id)
    }
}
