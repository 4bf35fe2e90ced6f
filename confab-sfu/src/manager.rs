//! SFU Manager - process-wide room registry
//!
//! This module provides:
//! - Room creation, lookup and teardown under one registry lock
//! - Collision-free room ID generation
//! - Pluggable room lifecycle extensions (recording, remote room resolution)
//! - Empty-room cleanup policy
//! - Global statistics collection

use crate::config::SfuConfig;
use crate::error::{ErrorKind, Result, SfuError};
use crate::packet::PacketManager;
use crate::room::{Room, RoomType};
use crate::types::RoomId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Room lifecycle observer.
///
/// Hooks run synchronously, in registration order, on the thread of the
/// owning call. They must not block.
pub trait ManagerExtension: Send + Sync {
    /// A room was created and registered
    fn on_new_room(&self, _manager: &Manager, _room: &Arc<Room>) {}

    /// Resolve a room the manager does not host locally
    fn on_get_room(&self, _manager: &Manager, id: &RoomId) -> Result<Arc<Room>> {
        Err(SfuError::RoomNotFound(id.clone()))
    }

    /// A room was closed and unregistered
    fn on_room_closed(&self, _manager: &Manager, _room: &Arc<Room>) {}
}

/// Global SFU manager statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerStats {
    pub active_rooms: usize,
    pub total_clients: usize,
    pub total_audio_tracks: usize,
    pub total_video_tracks: usize,
    pub total_subscriptions: usize,
}

pub struct Manager {
    name: String,
    config: Arc<SfuConfig>,
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    extensions: RwLock<Vec<Arc<dyn ManagerExtension>>>,
    packet_manager: PacketManager,
    next_room_seq: AtomicU64,
    context: CancellationToken,
    stopped: AtomicBool,
    weak_self: Weak<Manager>,
}

impl Manager {
    /// Create a manager with its own root lifetime scope
    pub fn new(name: impl Into<String>, config: SfuConfig) -> Arc<Self> {
        Self::with_context(name, config, CancellationToken::new())
    }

    /// Create a manager whose lifetime ends with `parent`
    pub fn with_parent(
        name: impl Into<String>,
        config: SfuConfig,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Self::with_context(name, config, parent.child_token())
    }

    fn with_context(
        name: impl Into<String>,
        config: SfuConfig,
        context: CancellationToken,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak_self| Self {
            name: name.into(),
            packet_manager: PacketManager::new(config.packet_pool_capacity),
            config: Arc::new(config),
            rooms: RwLock::new(HashMap::new()),
            extensions: RwLock::new(Vec::new()),
            next_room_seq: AtomicU64::new(0),
            context,
            stopped: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        info!(
            name = %manager.name,
            max_rooms = manager.config.max_rooms,
            max_clients_per_room = manager.config.max_clients_per_room,
            close_empty_rooms = manager.config.close_empty_rooms,
            "SFU Manager initialized"
        );
        manager
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Lifetime scope of the manager; every room scope derives from it
    #[must_use]
    pub const fn context(&self) -> &CancellationToken {
        &self.context
    }

    /// Packet pool shared by the inspection and forwarding stages of all rooms
    #[must_use]
    pub const fn packet_manager(&self) -> &PacketManager {
        &self.packet_manager
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn add_extension(&self, extension: Arc<dyn ManagerExtension>) {
        self.extensions.write().push(extension);
    }

    /// A room ID never handed out before by this manager. A monotonic
    /// sequence guarantees uniqueness; the random prefix keeps IDs unguessable.
    #[must_use]
    pub fn create_room_id(&self) -> RoomId {
        loop {
            let seq = self.next_room_seq.fetch_add(1, Ordering::Relaxed);
            let id = RoomId::new(format!("{}-{seq:x}", nanoid::nanoid!(12)));
            if !self.rooms.read().contains_key(&id) {
                return id;
            }
        }
    }

    /// Create and register a room, then run every extension's `on_new_room`
    pub fn new_room(
        &self,
        id: RoomId,
        name: impl Into<String>,
        room_type: RoomType,
    ) -> Result<Arc<Room>> {
        let room = {
            let mut rooms = self.rooms.write();
            if self.is_stopped() {
                return Err(SfuError::ManagerStopped);
            }
            if rooms.contains_key(&id) {
                return Err(SfuError::RoomAlreadyExists(id));
            }
            if self.config.max_rooms > 0 && rooms.len() >= self.config.max_rooms {
                warn!(
                    current_rooms = rooms.len(),
                    max_rooms = self.config.max_rooms,
                    "Room limit reached"
                );
                return Err(SfuError::RoomLimitReached(self.config.max_rooms));
            }

            let room = Room::new(
                id.clone(),
                name,
                room_type,
                Arc::clone(&self.config),
                self.context.child_token(),
            );
            self.wire_room(&room);
            rooms.insert(id, Arc::clone(&room));
            room
        };

        info!(
            room_id = %room.id(),
            room_type = %room.room_type(),
            total_rooms = self.room_count(),
            "Created new room"
        );

        for extension in self.extensions_snapshot() {
            extension.on_new_room(self, &room);
        }
        Ok(room)
    }

    /// Local room, else the first extension that resolves `id`
    pub fn get_room(&self, id: &RoomId) -> Result<Arc<Room>> {
        if let Some(room) = self.rooms.read().get(id) {
            return Ok(Arc::clone(room));
        }

        for extension in self.extensions_snapshot() {
            match extension.on_get_room(self, id) {
                Ok(room) => {
                    debug!(
                        room_id = %id,
                        room_type = %room.room_type(),
                        "Room resolved by extension"
                    );
                    return Ok(room);
                }
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    warn!(room_id = %id, error = %e, "Extension failed to resolve room");
                }
                Err(_) => {}
            }
        }

        Err(SfuError::RoomNotFound(id.clone()))
    }

    /// Stop every client in the room; the room itself stays registered
    /// unless the empty-room policy closes it.
    pub fn end_room(&self, id: &RoomId) -> Result<()> {
        let room = self.local_room(id)?;
        room.stop_all_clients();
        info!(room_id = %id, "Room ended");
        Ok(())
    }

    /// Close and unregister a room
    pub fn close_room(&self, id: &RoomId) -> Result<()> {
        self.local_room(id)?.stop();
        Ok(())
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    #[must_use]
    pub fn get_stats(&self) -> ManagerStats {
        let rooms: Vec<Arc<Room>> = self.rooms.read().values().cloned().collect();
        let mut stats = ManagerStats {
            active_rooms: rooms.len(),
            ..Default::default()
        };
        for room in rooms {
            let room_stats = room.stats();
            stats.total_clients += room_stats.client_count;
            stats.total_audio_tracks += room_stats.audio_tracks;
            stats.total_video_tracks += room_stats.video_tracks;
            stats.total_subscriptions += room_stats.subscriptions;
        }
        stats
    }

    /// Close every room and cancel the manager scope. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let rooms: Vec<Arc<Room>> = self.rooms.read().values().cloned().collect();
        for room in &rooms {
            room.stop();
        }
        self.context.cancel();
        info!(name = %self.name, rooms = rooms.len(), "SFU Manager stopped");
    }

    fn local_room(&self, id: &RoomId) -> Result<Arc<Room>> {
        self.rooms
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SfuError::RoomNotFound(id.clone()))
    }

    fn extensions_snapshot(&self) -> Vec<Arc<dyn ManagerExtension>> {
        self.extensions.read().clone()
    }

    fn wire_room(&self, room: &Arc<Room>) {
        let manager = self.weak_self.clone();
        room.on_room_closed(move |room| {
            if let Some(manager) = manager.upgrade() {
                manager.handle_room_closed(room);
            }
        });

        if self.config.close_empty_rooms {
            room.on_client_removed(|room, client_id| {
                if room.is_empty() {
                    debug!(room_id = %room.id(), last_client = %client_id, "Closing empty room");
                    room.stop();
                }
            });
        }
    }

    fn handle_room_closed(&self, room: &Arc<Room>) {
        {
            let mut rooms = self.rooms.write();
            match rooms.get(room.id()) {
                Some(current) if Arc::ptr_eq(current, room) => {
                    rooms.remove(room.id());
                }
                _ => return,
            }
        }

        debug!(room_id = %room.id(), remaining = self.room_count(), "Room unregistered");
        for extension in self.extensions_snapshot() {
            extension.on_room_closed(self, room);
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.context.cancel();
    }
}
