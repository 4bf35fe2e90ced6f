//! Server-side state of one participant
//!
//! A client publishes tracks (announced by the transport layer through
//! [`Client::add_tracks`]) and subscribes to tracks other clients published.
//! Two observable events are exposed:
//!
//! - **tracks-added**: this client published something new
//! - **tracks-available**: another client in the room published something
//!   this client may subscribe to
//!
//! A track becomes subscribable for a client only once its availability has
//! been recorded for that client, which happens right before the
//! tracks-available listeners run. Subscribing from inside a listener works.

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::metadata::Metadata;
use crate::room::Room;
use crate::track::{
    ForwardablePacket, MediaTrack, QualityLayer, Subscription, TrackInfo, TrackSource,
};
use crate::types::{ClientId, RoomId, SubscribeTrackRequest, TrackId, TrackKey};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Transport resources behind a client session (ICE/DTLS/SRTP, data channels).
/// Implemented by the transport layer; the client calls `close` exactly once.
#[cfg_attr(test, mockall::automock)]
pub trait SessionTransport: Send + Sync {
    fn close(&self);
}

/// Transport for sessions without network resources of their own
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransport;

impl SessionTransport for NoopTransport {
    fn close(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

type TracksListener = Arc<dyn Fn(&[Arc<MediaTrack>]) + Send + Sync>;

pub struct Client {
    id: ClientId,
    room_id: RoomId,
    room: Weak<Room>,
    state: RwLock<ConnectionState>,
    published: RwLock<HashMap<TrackId, Arc<MediaTrack>>>,
    /// Tracks of other clients whose availability was delivered to this client
    available: RwLock<HashMap<TrackKey, Arc<MediaTrack>>>,
    subscriptions: Mutex<HashMap<TrackKey, Arc<Subscription>>>,
    preferred_quality: RwLock<QualityLayer>,
    tracks_added_listeners: RwLock<Vec<TracksListener>>,
    tracks_available_listeners: RwLock<Vec<TracksListener>>,
    transport: Mutex<Option<Box<dyn SessionTransport>>>,
    packet_tx: mpsc::Sender<ForwardablePacket>,
    packet_rx: Mutex<Option<mpsc::Receiver<ForwardablePacket>>>,
    metadata: Metadata,
    context: CancellationToken,
    connected_once: AtomicBool,
    stopped: AtomicBool,
}

impl Client {
    pub(crate) fn new(
        id: ClientId,
        room: &Arc<Room>,
        transport: Box<dyn SessionTransport>,
        config: &SfuConfig,
    ) -> Arc<Self> {
        let (packet_tx, packet_rx) = mpsc::channel(config.client_packet_channel_capacity.max(1));
        let preferred = if config.enable_simulcast {
            config.default_quality
        } else {
            QualityLayer::High
        };

        Arc::new(Self {
            id,
            room_id: room.id().clone(),
            room: Arc::downgrade(room),
            state: RwLock::new(ConnectionState::New),
            published: RwLock::new(HashMap::new()),
            available: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            preferred_quality: RwLock::new(preferred),
            tracks_added_listeners: RwLock::new(Vec::new()),
            tracks_available_listeners: RwLock::new(Vec::new()),
            transport: Mutex::new(Some(transport)),
            packet_tx,
            packet_rx: Mutex::new(Some(packet_rx)),
            metadata: Metadata::new(),
            context: room.context().child_token(),
            connected_once: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &ClientId {
        &self.id
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.upgrade()
    }

    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Lifetime scope of this client, cancelled on stop
    #[must_use]
    pub const fn context(&self) -> &CancellationToken {
        &self.context
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Connected and not stopped
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_stopped() && self.connection_state() == ConnectionState::Connected
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Connection state reported by the transport. The first `Connected`
    /// delivers availability of tracks already published in the room;
    /// `Failed` and `Closed` stop the client.
    pub fn set_connection_state(self: &Arc<Self>, new_state: ConnectionState) {
        if self.is_stopped() {
            return;
        }

        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state == new_state {
            return;
        }
        debug!(
            client_id = %self.id,
            room_id = %self.room_id,
            from = ?old_state,
            to = ?new_state,
            "Client connection state changed"
        );

        match new_state {
            ConnectionState::Connected => {
                if !self.connected_once.swap(true, Ordering::AcqRel) {
                    if let Some(room) = self.room() {
                        room.deliver_existing_tracks(self);
                    }
                }
            }
            ConnectionState::Failed | ConnectionState::Closed => self.stop(),
            _ => {}
        }
    }

    /// Register a tracks-added listener
    pub fn on_tracks_added<F>(&self, listener: F)
    where
        F: Fn(&[Arc<MediaTrack>]) + Send + Sync + 'static,
    {
        self.tracks_added_listeners.write().push(Arc::new(listener));
    }

    /// Register a tracks-available listener
    pub fn on_tracks_available<F>(&self, listener: F)
    where
        F: Fn(&[Arc<MediaTrack>]) + Send + Sync + 'static,
    {
        self.tracks_available_listeners.write().push(Arc::new(listener));
    }

    /// Publish newly announced inbound tracks. Makes the tracks available to
    /// every other client, then fires one tracks-added event on this client.
    /// A rejected announcement rolls the publish back and fires nothing.
    pub fn add_tracks(self: &Arc<Self>, infos: Vec<TrackInfo>) -> Result<Vec<Arc<MediaTrack>>> {
        if self.is_stopped() {
            return Err(SfuError::ClientNotActive(self.id.clone()));
        }
        let room = self
            .room()
            .ok_or_else(|| SfuError::RoomClosed(self.room_id.clone()))?;

        let tracks: Vec<Arc<MediaTrack>> = {
            let mut published = self.published.write();
            let mut seen = HashSet::new();
            for info in &infos {
                if published.contains_key(&info.id) || !seen.insert(info.id.clone()) {
                    return Err(SfuError::DuplicateTrack(TrackKey::new(
                        self.id.clone(),
                        info.id.clone(),
                    )));
                }
            }

            let tracks: Vec<Arc<MediaTrack>> = infos
                .into_iter()
                .map(|info| MediaTrack::new(self.id.clone(), info))
                .collect();
            for track in &tracks {
                published.insert(track.id().clone(), Arc::clone(track));
            }
            tracks
        };

        if tracks.is_empty() {
            return Ok(tracks);
        }

        if let Err(e) = room.announce_tracks(&self.id, &tracks) {
            let mut published = self.published.write();
            for track in &tracks {
                published.remove(track.id());
                track.deactivate();
            }
            return Err(e);
        }

        info!(
            client_id = %self.id,
            room_id = %self.room_id,
            count = tracks.len(),
            "Client published tracks"
        );
        Self::dispatch(&self.id, "tracks_added", &self.tracks_added_listeners, &tracks);

        Ok(tracks)
    }

    /// Withdraw published tracks. Existing subscriptions to them are torn down.
    pub fn unpublish_tracks(&self, track_ids: &[TrackId]) -> Result<()> {
        let removed: Vec<Arc<MediaTrack>> = {
            let mut published = self.published.write();
            if let Some(missing) = track_ids.iter().find(|id| !published.contains_key(*id)) {
                return Err(SfuError::TrackNotFound(TrackKey::new(
                    self.id.clone(),
                    missing.clone(),
                )));
            }
            track_ids
                .iter()
                .filter_map(|id| published.remove(id))
                .collect()
        };

        match self.room() {
            Some(room) => room.retire_tracks(&self.id, &removed),
            None => {
                for track in &removed {
                    track.deactivate();
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn published_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.published.read().values().cloned().collect()
    }

    /// Tracks of other clients this client has been told about
    #[must_use]
    pub fn available_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.available.read().values().cloned().collect()
    }

    /// Label this client's own tracks (camera/screen/media). Advisory only;
    /// fails without changing anything if an ID is not published by this client.
    pub fn set_tracks_source_type(&self, sources: &HashMap<TrackId, TrackSource>) -> Result<()> {
        let published = self.published.read();
        let mut resolved = Vec::with_capacity(sources.len());
        for (track_id, source) in sources {
            let track = published.get(track_id).ok_or_else(|| {
                SfuError::TrackNotFound(TrackKey::new(self.id.clone(), track_id.clone()))
            })?;
            resolved.push((track, *source));
        }
        for (track, source) in resolved {
            track.set_source(source);
        }
        Ok(())
    }

    /// Subscribe to tracks of other clients, in order.
    ///
    /// Not atomic: on the first failing request the call returns
    /// [`SfuError::SubscribeFailed`] naming it, and the subscriptions created
    /// for the requests before it stay in place. Requests after it are not
    /// attempted. Subscribing to an already subscribed track returns the
    /// existing subscription.
    pub fn subscribe_tracks(
        self: &Arc<Self>,
        requests: &[SubscribeTrackRequest],
    ) -> Result<Vec<Arc<Subscription>>> {
        let room = self
            .room()
            .ok_or_else(|| SfuError::RoomClosed(self.room_id.clone()))?;

        let mut subscriptions = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            match room.subscribe(self, request) {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => {
                    warn!(
                        client_id = %self.id,
                        request = %request,
                        applied = index,
                        error = %e,
                        "Subscribe request rejected"
                    );
                    return Err(SfuError::SubscribeFailed {
                        index,
                        request: request.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }

        debug!(
            client_id = %self.id,
            count = subscriptions.len(),
            "Client subscribed to tracks"
        );
        Ok(subscriptions)
    }

    /// Drop subscriptions. Unknown subscriptions fail with TrackNotFound
    /// after the known ones before it were removed.
    pub fn unsubscribe_tracks(&self, requests: &[SubscribeTrackRequest]) -> Result<()> {
        for request in requests {
            let key = request.key();
            let removed = self.subscriptions.lock().remove(&key);
            let Some(subscription) = removed else {
                return Err(SfuError::TrackNotFound(key));
            };
            if let Some(track) = subscription.track() {
                track.unbind(&self.id);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn subscription(&self, key: &TrackKey) -> Option<Arc<Subscription>> {
        self.subscriptions.lock().get(key).cloned()
    }

    #[must_use]
    pub fn preferred_quality(&self) -> QualityLayer {
        *self.preferred_quality.read()
    }

    /// Set the preferred layer and retarget every subscription
    pub fn set_preferred_quality(&self, layer: QualityLayer) {
        *self.preferred_quality.write() = layer;
        for subscription in self.subscriptions() {
            subscription.request_layer(layer);
        }
    }

    /// Feed a bandwidth estimate (kbps). Returns the new preferred layer if it changed.
    pub fn update_bandwidth_estimate(&self, bandwidth_kbps: u32) -> Option<QualityLayer> {
        let layer = QualityLayer::from_bandwidth(bandwidth_kbps);
        if layer == self.preferred_quality() {
            return None;
        }
        debug!(
            client_id = %self.id,
            bandwidth_kbps,
            layer = ?layer,
            "Bandwidth estimate changed preferred layer"
        );
        self.set_preferred_quality(layer);
        Some(layer)
    }

    /// Take the receiver of forwarded packets (can only be called once)
    pub fn take_packet_receiver(&self) -> Option<mpsc::Receiver<ForwardablePacket>> {
        self.packet_rx.lock().take()
    }

    /// Stop the client. Idempotent: the first call makes its published tracks
    /// unavailable, tears down its subscriptions, closes the transport and
    /// cancels its scope; later calls do nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.room() {
            Some(room) => room.remove_client(self),
            None => {
                for track in self.published.read().values() {
                    track.deactivate();
                }
            }
        }

        let subscriptions: Vec<Arc<Subscription>> =
            self.subscriptions.lock().drain().map(|(_, sub)| sub).collect();
        for subscription in &subscriptions {
            if let Some(track) = subscription.track() {
                track.unbind(&self.id);
            }
        }

        self.available.write().clear();
        self.tracks_added_listeners.write().clear();
        self.tracks_available_listeners.write().clear();
        *self.state.write() = ConnectionState::Closed;

        if let Some(transport) = self.transport.lock().take() {
            transport.close();
        }
        self.context.cancel();

        info!(client_id = %self.id, room_id = %self.room_id, "Client stopped");
    }

    pub(crate) fn packet_sender(&self) -> mpsc::Sender<ForwardablePacket> {
        self.packet_tx.clone()
    }

    pub(crate) fn is_available(&self, key: &TrackKey) -> bool {
        self.available.read().contains_key(key)
    }

    pub(crate) fn insert_subscription(&self, key: TrackKey, subscription: Arc<Subscription>) {
        self.subscriptions.lock().insert(key, subscription);
    }

    /// Record availability and notify listeners of the tracks that are new to this client
    pub(crate) fn make_available(&self, tracks: &[Arc<MediaTrack>]) {
        if self.is_stopped() {
            return;
        }
        let fresh: Vec<Arc<MediaTrack>> = {
            let mut available = self.available.write();
            tracks
                .iter()
                .filter(|track| track.client_id() != &self.id && track.is_active())
                .filter(|track| available.insert(track.key(), Arc::clone(track)).is_none())
                .cloned()
                .collect()
        };
        if !fresh.is_empty() {
            Self::dispatch(&self.id, "tracks_available", &self.tracks_available_listeners, &fresh);
        }
    }

    /// Forget tracks that are no longer published
    pub(crate) fn forget_tracks(&self, keys: &[TrackKey]) {
        let mut available = self.available.write();
        let mut subscriptions = self.subscriptions.lock();
        for key in keys {
            available.remove(key);
            subscriptions.remove(key);
        }
    }

    pub(crate) fn take_published(&self) -> Vec<Arc<MediaTrack>> {
        self.published.write().drain().map(|(_, track)| track).collect()
    }

    fn dispatch(
        client_id: &ClientId,
        event: &str,
        listeners: &RwLock<Vec<TracksListener>>,
        tracks: &[Arc<MediaTrack>],
    ) {
        let snapshot: Vec<TracksListener> = listeners.read().clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(tracks))).is_err() {
                error!(client_id = %client_id, event, "Client listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("state", &self.connection_state())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
