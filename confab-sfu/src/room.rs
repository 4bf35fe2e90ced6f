//! Room: the client set of one conference and its track broker

use crate::client::{Client, SessionTransport};
use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::metadata::Metadata;
use crate::track::{MediaTrack, Subscription, TrackKind};
use crate::types::{ClientId, RoomId, SubscribeTrackRequest, TrackKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    /// Hosted by this process
    Local,
    /// Resolved through an extension, hosted elsewhere
    Remote,
}

impl fmt::Display for RoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

type ClientRemovedCallback = Arc<dyn Fn(&Arc<Room>, &ClientId) + Send + Sync>;
type RoomClosedCallback = Arc<dyn Fn(&Arc<Room>) + Send + Sync>;

#[derive(Default)]
struct RoomState {
    clients: HashMap<ClientId, Arc<Client>>,
    /// Every available track in the room
    tracks: HashMap<TrackKey, Arc<MediaTrack>>,
}

pub struct Room {
    id: RoomId,
    name: String,
    room_type: RoomType,
    config: Arc<SfuConfig>,
    state: RwLock<RoomState>,
    metadata: Metadata,
    context: CancellationToken,
    closed: AtomicBool,
    total_clients_joined: AtomicU64,
    client_removed_callbacks: RwLock<Vec<ClientRemovedCallback>>,
    room_closed_callbacks: RwLock<Vec<RoomClosedCallback>>,
    weak_self: Weak<Room>,
}

impl Room {
    /// Create a room whose lifetime scope is `context`
    pub fn new(
        id: RoomId,
        name: impl Into<String>,
        room_type: RoomType,
        config: Arc<SfuConfig>,
        context: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            id,
            name: name.into(),
            room_type,
            config,
            state: RwLock::new(RoomState::default()),
            metadata: Metadata::new(),
            context,
            closed: AtomicBool::new(false),
            total_clients_joined: AtomicU64::new(0),
            client_removed_callbacks: RwLock::new(Vec::new()),
            room_closed_callbacks: RwLock::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn room_type(&self) -> RoomType {
        self.room_type
    }

    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Lifetime scope of this room, cancelled on stop
    #[must_use]
    pub const fn context(&self) -> &CancellationToken {
        &self.context
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn on_client_removed<F>(&self, callback: F)
    where
        F: Fn(&Arc<Room>, &ClientId) + Send + Sync + 'static,
    {
        self.client_removed_callbacks.write().push(Arc::new(callback));
    }

    pub fn on_room_closed<F>(&self, callback: F)
    where
        F: Fn(&Arc<Room>) + Send + Sync + 'static,
    {
        self.room_closed_callbacks.write().push(Arc::new(callback));
    }

    /// Create a client for a newly established session
    pub fn add_client(
        self: &Arc<Self>,
        id: ClientId,
        transport: Box<dyn SessionTransport>,
    ) -> Result<Arc<Client>> {
        let mut state = self.state.write();
        if self.is_closed() {
            return Err(SfuError::RoomClosed(self.id.clone()));
        }
        if state.clients.contains_key(&id) {
            return Err(SfuError::ClientAlreadyExists(id));
        }
        let max_clients = self.config.max_clients_per_room;
        if max_clients > 0 && state.clients.len() >= max_clients {
            return Err(SfuError::RoomFull {
                room_id: self.id.clone(),
                max_clients,
            });
        }

        let client = Client::new(id.clone(), self, transport, &self.config);
        state.clients.insert(id.clone(), Arc::clone(&client));
        self.total_clients_joined.fetch_add(1, Ordering::Relaxed);

        info!(
            room_id = %self.id,
            client_id = %id,
            client_count = state.clients.len(),
            "Client joined room"
        );
        Ok(client)
    }

    pub fn get_client(&self, id: &ClientId) -> Result<Arc<Client>> {
        self.state
            .read()
            .clients
            .get(id)
            .cloned()
            .ok_or_else(|| SfuError::ClientNotFound(id.clone()))
    }

    #[must_use]
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.state.read().clients.values().cloned().collect()
    }

    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.state.read().clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.state.read().clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().clients.is_empty()
    }

    /// Every track currently available in the room
    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.state.read().tracks.values().cloned().collect()
    }

    #[must_use]
    pub fn track(&self, key: &TrackKey) -> Option<Arc<MediaTrack>> {
        self.state.read().tracks.get(key).cloned()
    }

    pub fn stop_client(&self, id: &ClientId) -> Result<()> {
        self.get_client(id)?.stop();
        Ok(())
    }

    /// Stop every client. Calling it on an empty room is a no-op.
    pub fn stop_all_clients(&self) {
        for client in self.clients() {
            client.stop();
        }
    }

    /// Stop all clients, cancel the room scope and fire the closed callbacks.
    /// Only the first call has any effect.
    pub fn stop(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.stop_all_clients();
        self.context.cancel();
        info!(room_id = %self.id, "Room closed");

        let Some(room) = self.weak_self.upgrade() else {
            return;
        };
        let callbacks: Vec<RoomClosedCallback> = self.room_closed_callbacks.read().clone();
        for callback in callbacks {
            callback(&room);
        }
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let state = self.state.read();
        let mut stats = RoomStats {
            client_count: state.clients.len(),
            total_clients_joined: self.total_clients_joined.load(Ordering::Relaxed),
            ..Default::default()
        };
        for track in state.tracks.values() {
            match track.kind() {
                TrackKind::Audio => stats.audio_tracks += 1,
                TrackKind::Video => stats.video_tracks += 1,
            }
            stats.subscriptions += track.subscriber_count();
        }
        stats
    }

    /// Register `tracks` as available and notify every other client
    pub(crate) fn announce_tracks(
        &self,
        publisher: &ClientId,
        tracks: &[Arc<MediaTrack>],
    ) -> Result<()> {
        let recipients: Vec<Arc<Client>> = {
            let mut state = self.state.write();
            if self.is_closed() {
                return Err(SfuError::RoomClosed(self.id.clone()));
            }
            if !state.clients.contains_key(publisher) {
                return Err(SfuError::ClientNotFound(publisher.clone()));
            }
            if let Some(existing) = tracks.iter().find(|t| state.tracks.contains_key(&t.key())) {
                return Err(SfuError::DuplicateTrack(existing.key()));
            }
            for track in tracks {
                state.tracks.insert(track.key(), Arc::clone(track));
            }
            state
                .clients
                .values()
                .filter(|client| client.id() != publisher)
                .cloned()
                .collect()
        };

        debug!(
            room_id = %self.id,
            publisher = %publisher,
            tracks = tracks.len(),
            recipients = recipients.len(),
            "Announcing tracks"
        );
        for client in recipients {
            client.make_available(tracks);
        }
        Ok(())
    }

    /// Make a newly connected client aware of tracks published before it connected
    pub(crate) fn deliver_existing_tracks(&self, client: &Arc<Client>) {
        let existing: Vec<Arc<MediaTrack>> = self
            .state
            .read()
            .tracks
            .values()
            .filter(|track| track.client_id() != client.id())
            .cloned()
            .collect();
        if !existing.is_empty() {
            client.make_available(&existing);
        }
    }

    /// Remove tracks from the registry and tear down their forwarding bindings
    pub(crate) fn retire_tracks(&self, publisher: &ClientId, tracks: &[Arc<MediaTrack>]) {
        if tracks.is_empty() {
            return;
        }
        let (keys, clients) = {
            let mut state = self.state.write();
            let keys = Self::unregister_tracks(&mut state, tracks);
            (keys, state.clients.values().cloned().collect::<Vec<_>>())
        };
        self.teardown_tracks(publisher, tracks, &keys, &clients);
    }

    fn unregister_tracks(state: &mut RoomState, tracks: &[Arc<MediaTrack>]) -> Vec<TrackKey> {
        let keys: Vec<TrackKey> = tracks.iter().map(|t| t.key()).collect();
        for key in &keys {
            state.tracks.remove(key);
        }
        keys
    }

    fn teardown_tracks(
        &self,
        publisher: &ClientId,
        tracks: &[Arc<MediaTrack>],
        keys: &[TrackKey],
        clients: &[Arc<Client>],
    ) {
        for track in tracks {
            let subscribers = track.deactivate();
            debug!(
                room_id = %self.id,
                track = %track.key(),
                subscribers = subscribers.len(),
                "Track retired"
            );
        }
        for client in clients.iter().filter(|c| c.id() != publisher) {
            client.forget_tracks(keys);
        }
    }

    /// Validate and wire one subscribe request.
    ///
    /// Checks in order: the track is available, the subscriber is not its
    /// publisher, the subscriber has an active session, and the subscriber
    /// was told about the track. The room lock is held throughout so a
    /// concurrent unpublish either happens before (TrackNotFound) or tears
    /// the new binding down after.
    pub(crate) fn subscribe(
        &self,
        subscriber: &Arc<Client>,
        request: &SubscribeTrackRequest,
    ) -> Result<Arc<Subscription>> {
        let state = self.state.read();
        let key = request.key();

        let track = state
            .tracks
            .get(&key)
            .cloned()
            .ok_or_else(|| SfuError::TrackNotFound(key.clone()))?;
        if &request.client_id == subscriber.id() {
            return Err(SfuError::SelfSubscribe(key));
        }
        if !subscriber.is_active() || !state.clients.contains_key(subscriber.id()) {
            return Err(SfuError::ClientNotActive(subscriber.id().clone()));
        }
        if !subscriber.is_available(&key) {
            return Err(SfuError::TrackNotFound(key));
        }

        let subscription = track.bind(
            subscriber.id().clone(),
            subscriber.packet_sender(),
            subscriber.preferred_quality(),
        )?;
        subscriber.insert_subscription(key, Arc::clone(&subscription));
        Ok(subscription)
    }

    /// Detach a stopping client: its tracks become unavailable and the
    /// client-removed callbacks run.
    pub(crate) fn remove_client(&self, client: &Client) {
        // The client and its tracks leave the registry together, so no
        // subscribe can find a track whose publisher is already gone.
        let (published, keys, others) = {
            let mut state = self.state.write();
            match state.clients.get(client.id()) {
                Some(current) if std::ptr::eq(Arc::as_ptr(current), client) => {
                    state.clients.remove(client.id());
                }
                _ => return,
            }
            let published = client.take_published();
            let keys = Self::unregister_tracks(&mut state, &published);
            let others: Vec<Arc<Client>> = state.clients.values().cloned().collect();
            (published, keys, others)
        };
        self.teardown_tracks(client.id(), &published, &keys, &others);

        info!(
            room_id = %self.id,
            client_id = %client.id(),
            remaining = self.client_count(),
            "Client left room"
        );

        let Some(room) = self.weak_self.upgrade() else {
            return;
        };
        let callbacks: Vec<ClientRemovedCallback> = self.client_removed_callbacks.read().clone();
        for callback in callbacks {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(&room, client.id())));
            if outcome.is_err() {
                error!(
                    room_id = %self.id,
                    client_id = %client.id(),
                    "Client removed callback panicked"
                );
            }
        }
    }
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("room_type", &self.room_type)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoomStats {
    pub client_count: usize,
    pub total_clients_joined: u64,
    pub audio_tracks: usize,
    pub video_tracks: usize,
    pub subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ConnectionState, NoopTransport};
    use crate::track::TrackInfo;
    use std::sync::atomic::AtomicUsize;

    fn test_room(config: SfuConfig) -> Arc<Room> {
        Room::new(
            RoomId::from("room"),
            "test",
            RoomType::Local,
            Arc::new(config),
            CancellationToken::new(),
        )
    }

    fn join(room: &Arc<Room>, id: &str) -> Arc<Client> {
        let client = room.add_client(ClientId::from(id), Box::new(NoopTransport)).unwrap();
        client.set_connection_state(ConnectionState::Connected);
        client
    }

    #[test]
    fn test_add_client_rejects_duplicates_and_capacity() {
        let room = test_room(SfuConfig {
            max_clients_per_room: 2,
            ..Default::default()
        });
        join(&room, "a");
        assert!(matches!(
            room.add_client(ClientId::from("a"), Box::new(NoopTransport)),
            Err(SfuError::ClientAlreadyExists(_))
        ));
        join(&room, "b");
        assert!(matches!(
            room.add_client(ClientId::from("c"), Box::new(NoopTransport)),
            Err(SfuError::RoomFull { .. })
        ));
        assert_eq!(room.client_ids(), vec![ClientId::from("a"), ClientId::from("b")]);
    }

    #[test]
    fn test_publisher_does_not_receive_own_availability() {
        let room = test_room(SfuConfig::default());
        let alice = join(&room, "alice");
        let bob = join(&room, "bob");
        let alice_seen = Arc::new(AtomicUsize::new(0));
        let bob_seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&alice_seen);
            alice.on_tracks_available(move |t| {
                seen.fetch_add(t.len(), Ordering::SeqCst);
            });
            let seen = Arc::clone(&bob_seen);
            bob.on_tracks_available(move |t| {
                seen.fetch_add(t.len(), Ordering::SeqCst);
            });
        }

        alice.add_tracks(vec![TrackInfo::audio("mic")]).unwrap();

        assert_eq!(alice_seen.load(Ordering::SeqCst), 0);
        assert_eq!(bob_seen.load(Ordering::SeqCst), 1);
        assert_eq!(room.stats().audio_tracks, 1);
    }

    #[test]
    fn test_late_joiner_sees_existing_tracks_on_connect() {
        let room = test_room(SfuConfig::default());
        let alice = join(&room, "alice");
        alice.add_tracks(vec![TrackInfo::audio("mic"), TrackInfo::video("cam")]).unwrap();

        let carol = room.add_client(ClientId::from("carol"), Box::new(NoopTransport)).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            carol.on_tracks_available(move |t| {
                seen.fetch_add(t.len(), Ordering::SeqCst);
            });
        }
        carol.set_connection_state(ConnectionState::Connected);
        carol.set_connection_state(ConnectionState::Disconnected);
        carol.set_connection_state(ConnectionState::Connected);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribe_validation_order() {
        let room = test_room(SfuConfig::default());
        let alice = join(&room, "alice");
        let idle = room.add_client(ClientId::from("idle"), Box::new(NoopTransport)).unwrap();
        alice.add_tracks(vec![TrackInfo::audio("mic")]).unwrap();

        let missing = SubscribeTrackRequest::new("alice", "nope");
        assert!(matches!(room.subscribe(&alice, &missing), Err(SfuError::TrackNotFound(_))));

        let own = SubscribeTrackRequest::new("alice", "mic");
        assert!(matches!(room.subscribe(&alice, &own), Err(SfuError::SelfSubscribe(_))));
        assert!(matches!(room.subscribe(&idle, &own), Err(SfuError::ClientNotActive(_))));
        assert!(idle.subscriptions().is_empty());
    }

    #[test]
    fn test_unannounced_track_not_subscribable() {
        let room = test_room(SfuConfig::default());
        let alice = join(&room, "alice");
        let bob = room.add_client(ClientId::from("bob"), Box::new(NoopTransport)).unwrap();
        alice.add_tracks(vec![TrackInfo::audio("mic")]).unwrap();
        // bob was in the room, so the announcement reached him before he connected.
        bob.set_connection_state(ConnectionState::Connected);
        assert!(room.subscribe(&bob, &SubscribeTrackRequest::new("alice", "mic")).is_ok());

        // A track that sits in the registry without having been announced to dave.
        let dave = join(&room, "dave");
        let hidden = MediaTrack::new(ClientId::from("alice"), TrackInfo::video("hidden"));
        room.state.write().tracks.insert(hidden.key(), hidden);
        assert!(matches!(
            room.subscribe(&dave, &SubscribeTrackRequest::new("alice", "hidden")),
            Err(SfuError::TrackNotFound(_))
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let room = test_room(SfuConfig::default());
        let closed = Arc::new(AtomicUsize::new(0));
        {
            let closed = Arc::clone(&closed);
            room.on_room_closed(move |_| {
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }
        let alice = join(&room, "alice");

        room.stop();
        room.stop();

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(alice.is_stopped());
        assert!(room.context().is_cancelled());
        assert!(matches!(
            room.add_client(ClientId::from("late"), Box::new(NoopTransport)),
            Err(SfuError::RoomClosed(_))
        ));
    }

    #[test]
    fn test_client_removed_callback() {
        let room = test_room(SfuConfig::default());
        let removed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let removed = Arc::clone(&removed);
            room.on_client_removed(move |_, id| removed.lock().push(id.clone()));
        }
        join(&room, "alice");
        room.stop_client(&ClientId::from("alice")).unwrap();

        assert_eq!(*removed.lock(), vec![ClientId::from("alice")]);
        assert!(matches!(
            room.stop_client(&ClientId::from("alice")),
            Err(SfuError::ClientNotFound(_))
        ));
    }

    #[test]
    fn test_departing_publisher_leaves_no_orphan_tracks() {
        let room = test_room(SfuConfig::default());
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    let state = room.state.read();
                    assert!(state
                        .tracks
                        .keys()
                        .all(|key| state.clients.contains_key(&key.client_id)));
                }
            });
            let workers: Vec<_> = (0..4)
                .map(|worker| {
                    let room = &room;
                    scope.spawn(move || {
                        for round in 0..200 {
                            let client = join(room, &format!("c{worker}-{round}"));
                            client
                                .add_tracks(vec![TrackInfo::audio("mic"), TrackInfo::video("cam")])
                                .unwrap();
                            client.stop();
                        }
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });

        assert!(room.is_empty());
        assert!(room.tracks().is_empty());
    }

    #[test]
    fn test_rejected_announcement_fires_no_tracks_added() {
        let room = test_room(SfuConfig::default());
        let alice = join(&room, "alice");
        let added = Arc::new(AtomicUsize::new(0));
        {
            let added = Arc::clone(&added);
            alice.on_tracks_added(move |tracks| {
                added.fetch_add(tracks.len(), Ordering::SeqCst);
            });
        }
        let squatter = MediaTrack::new(alice.id().clone(), TrackInfo::audio("mic"));
        room.state.write().tracks.insert(squatter.key(), squatter);

        let result = alice.add_tracks(vec![TrackInfo::audio("mic")]);

        assert!(matches!(result, Err(SfuError::DuplicateTrack(_))));
        assert_eq!(added.load(Ordering::SeqCst), 0);
        assert!(alice.published_tracks().is_empty());
    }
}
