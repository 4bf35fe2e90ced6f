//! Published media tracks and their forwarding bindings
//!
//! A [`MediaTrack`] keeps one [`Subscription`] per subscribing client. Packets
//! handed to [`MediaTrack::forward`] are pushed to every subscription whose
//! layer selection accepts them. Deactivating a track drops all bindings while
//! holding the binding lock, so no packet is delivered afterwards.

use crate::error::{Result, SfuError};
use crate::types::{ClientId, TrackId, TrackKey};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<&str> for TrackKind {
    fn from(s: &str) -> Self {
        if s.eq_ignore_ascii_case("audio") {
            Self::Audio
        } else {
            Self::Video
        }
    }
}

/// Advisory label for what a track carries, used by downstream forwarding policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    #[default]
    Media,
    Camera,
    Screen,
}

/// Simulcast quality layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLayer {
    Low,
    Medium,
    High,
}

impl QualityLayer {
    /// Select quality layer based on available bandwidth in kbps
    #[must_use]
    pub const fn from_bandwidth(bandwidth_kbps: u32) -> Self {
        if bandwidth_kbps >= 2000 {
            Self::High
        } else if bandwidth_kbps >= 1000 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// RID (restriction identifier) for this layer
    #[must_use]
    pub const fn rid(&self) -> &'static str {
        match self {
            Self::High => "h",
            Self::Medium => "m",
            Self::Low => "l",
        }
    }

    #[must_use]
    pub fn from_rid(rid: &str) -> Option<Self> {
        match rid {
            "h" => Some(Self::High),
            "m" => Some(Self::Medium),
            "l" => Some(Self::Low),
            _ => None,
        }
    }

    /// Expected bitrate for this layer (kbps)
    #[must_use]
    pub const fn expected_bitrate(&self) -> u32 {
        match self {
            Self::High => 2500,
            Self::Medium => 1200,
            Self::Low => 500,
        }
    }

    #[must_use]
    pub const fn spatial_layer(&self) -> u8 {
        match self {
            Self::High => 2,
            Self::Medium => 1,
            Self::Low => 0,
        }
    }
}

/// Announcement of one track, as delivered by the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: TrackId,
    pub kind: TrackKind,
    #[serde(default)]
    pub source: TrackSource,
    /// Simulcast layers; empty for single-layer tracks
    #[serde(default)]
    pub layers: Vec<QualityLayer>,
}

impl TrackInfo {
    pub fn audio(id: impl Into<TrackId>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Audio,
            source: TrackSource::Media,
            layers: Vec::new(),
        }
    }

    pub fn video(id: impl Into<TrackId>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Video,
            source: TrackSource::Camera,
            layers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_layers(mut self, layers: impl IntoIterator<Item = QualityLayer>) -> Self {
        self.layers = layers.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: TrackSource) -> Self {
        self.source = source;
        self
    }
}

/// RTP packet with metadata for forwarding
#[derive(Debug, Clone)]
pub struct ForwardablePacket {
    pub data: Bytes,
    pub ssrc: u32,
    pub sequence_number: u16,
    pub timestamp: u32,
    /// Simulcast layer the packet belongs to, `None` for single-layer tracks
    pub quality_layer: Option<QualityLayer>,
    /// Starts a frame that decodes without earlier frames
    pub keyframe: bool,
    pub received_at: Instant,
}

impl ForwardablePacket {
    #[must_use]
    pub fn new(data: Bytes, sequence_number: u16, timestamp: u32) -> Self {
        Self {
            data,
            ssrc: 0,
            sequence_number,
            timestamp,
            quality_layer: None,
            keyframe: false,
            received_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_layer(mut self, layer: QualityLayer) -> Self {
        self.quality_layer = Some(layer);
        self
    }

    #[must_use]
    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }
}

/// Internal track statistics with atomic counters
#[derive(Default)]
struct TrackStatsInner {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_lost: AtomicU64,
}

/// Media track published by one client
pub struct MediaTrack {
    id: TrackId,
    client_id: ClientId,
    kind: TrackKind,
    source: RwLock<TrackSource>,
    /// Available simulcast layers; the only part of a track that changes after publish
    layers: RwLock<Vec<QualityLayer>>,
    active: AtomicBool,
    bindings: RwLock<HashMap<ClientId, Arc<Subscription>>>,
    stats: TrackStatsInner,
}

impl MediaTrack {
    #[must_use]
    pub fn new(client_id: ClientId, info: TrackInfo) -> Arc<Self> {
        let mut layers = info.layers;
        layers.sort_unstable();
        layers.dedup();

        debug!(
            track_id = %info.id,
            client_id = %client_id,
            kind = ?info.kind,
            layers = layers.len(),
            "Creating media track"
        );

        Arc::new(Self {
            id: info.id,
            client_id,
            kind: info.kind,
            source: RwLock::new(info.source),
            layers: RwLock::new(layers),
            active: AtomicBool::new(true),
            bindings: RwLock::new(HashMap::new()),
            stats: TrackStatsInner::default(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    /// Owning client
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    #[must_use]
    pub fn key(&self) -> TrackKey {
        TrackKey::new(self.client_id.clone(), self.id.clone())
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }

    #[must_use]
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    #[must_use]
    pub fn source(&self) -> TrackSource {
        *self.source.read()
    }

    pub(crate) fn set_source(&self, source: TrackSource) {
        *self.source.write() = source;
    }

    #[must_use]
    pub fn layers(&self) -> Vec<QualityLayer> {
        self.layers.read().clone()
    }

    #[must_use]
    pub fn is_simulcast(&self) -> bool {
        !self.layers.read().is_empty()
    }

    /// Replace the set of layers the publisher currently sends. Every
    /// subscription is retargeted to the best new layer for its preference;
    /// the switch commits at that layer's next sync point.
    pub fn set_available_layers(&self, layers: impl IntoIterator<Item = QualityLayer>) {
        let mut layers: Vec<QualityLayer> = layers.into_iter().collect();
        layers.sort_unstable();
        layers.dedup();
        debug!(track_id = %self.id, layers = ?layers, "Track layers changed");
        *self.layers.write() = layers;

        for subscription in self.bindings.read().values() {
            subscription.retarget(self);
        }
    }

    /// Best available layer not above `requested`, else the lowest available.
    /// `None` for single-layer tracks.
    #[must_use]
    pub fn resolve_layer(&self, requested: QualityLayer) -> Option<QualityLayer> {
        let layers = self.layers.read();
        layers
            .iter()
            .rev()
            .find(|layer| **layer <= requested)
            .or_else(|| layers.first())
            .copied()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Bind a subscriber. Binding the same subscriber twice returns the existing binding.
    pub(crate) fn bind(
        self: &Arc<Self>,
        subscriber: ClientId,
        sender: mpsc::Sender<ForwardablePacket>,
        preferred: QualityLayer,
    ) -> Result<Arc<Subscription>> {
        let mut bindings = self.bindings.write();
        if !self.is_active() {
            return Err(SfuError::TrackNotFound(self.key()));
        }
        if let Some(existing) = bindings.get(&subscriber) {
            return Ok(Arc::clone(existing));
        }

        let subscription = Arc::new(Subscription {
            subscriber: subscriber.clone(),
            key: self.key(),
            kind: self.kind,
            track: Arc::downgrade(self),
            sender,
            selection: Mutex::new(LayerSelection {
                preferred,
                current: None,
                target: self.resolve_layer(preferred),
            }),
            active: AtomicBool::new(true),
            packets_forwarded: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
        });
        bindings.insert(subscriber, Arc::clone(&subscription));
        Ok(subscription)
    }

    pub(crate) fn unbind(&self, subscriber: &ClientId) -> Option<Arc<Subscription>> {
        let removed = self.bindings.write().remove(subscriber);
        if let Some(subscription) = &removed {
            subscription.active.store(false, Ordering::Release);
        }
        removed
    }

    /// Stop forwarding and drop every binding. Returns the former subscribers.
    pub(crate) fn deactivate(&self) -> Vec<ClientId> {
        let mut bindings = self.bindings.write();
        self.active.store(false, Ordering::Release);
        bindings
            .drain()
            .map(|(subscriber, subscription)| {
                subscription.active.store(false, Ordering::Release);
                subscriber
            })
            .collect()
    }

    #[must_use]
    pub fn subscriber_ids(&self) -> Vec<ClientId> {
        self.bindings.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.bindings.read().len()
    }

    /// Forward a packet to every accepting subscriber. Never blocks; returns
    /// the number of subscribers the packet was queued for.
    pub fn forward(&self, packet: &ForwardablePacket) -> usize {
        let bindings = self.bindings.read();
        if !self.is_active() {
            return 0;
        }

        let size = packet.data.len() as u64;
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(size, Ordering::Relaxed);

        let mut delivered = 0;
        for subscription in bindings.values() {
            if subscription.accept(packet) && subscription.deliver(packet) {
                delivered += 1;
            }
        }

        self.stats.packets_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(size * delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn record_packet_loss(&self, count: u64) {
        self.stats.packets_lost.fetch_add(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_stats(&self) -> TrackStats {
        TrackStats {
            track_id: self.id.clone(),
            kind: self.kind,
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            packets_lost: self.stats.packets_lost.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct LayerSelection {
    /// Layer the subscriber asked for; `target` is its best available match
    preferred: QualityLayer,
    /// Layer currently delivered; `None` until the first sync point
    current: Option<QualityLayer>,
    /// Layer to switch to at the next sync point
    target: Option<QualityLayer>,
}

/// Forwarding binding between one track and one subscribing client
pub struct Subscription {
    subscriber: ClientId,
    key: TrackKey,
    kind: TrackKind,
    track: Weak<MediaTrack>,
    sender: mpsc::Sender<ForwardablePacket>,
    selection: Mutex<LayerSelection>,
    active: AtomicBool,
    packets_forwarded: AtomicU64,
    packets_dropped: AtomicU64,
}

impl Subscription {
    #[must_use]
    pub const fn subscriber(&self) -> &ClientId {
        &self.subscriber
    }

    /// Publisher and track this subscription reads from
    #[must_use]
    pub const fn key(&self) -> &TrackKey {
        &self.key
    }

    #[must_use]
    pub fn track(&self) -> Option<Arc<MediaTrack>> {
        self.track.upgrade()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn current_layer(&self) -> Option<QualityLayer> {
        self.selection.lock().current
    }

    #[must_use]
    pub fn target_layer(&self) -> Option<QualityLayer> {
        self.selection.lock().target
    }

    /// Layer the subscriber asked for, before resolving against the track
    #[must_use]
    pub fn preferred_layer(&self) -> QualityLayer {
        self.selection.lock().preferred
    }

    /// Ask for a layer switch. The switch happens on the next packet of the
    /// resolved layer that starts a clean frame; until then the current layer
    /// keeps flowing. Returns the resolved target.
    pub fn request_layer(&self, layer: QualityLayer) -> Option<QualityLayer> {
        let mut selection = self.selection.lock();
        selection.preferred = layer;
        let resolved = self.track().and_then(|track| track.resolve_layer(layer));
        self.set_target(&mut selection, resolved);
        resolved
    }

    /// Re-resolve the preferred layer after the track's layer set changed
    fn retarget(&self, track: &MediaTrack) {
        let mut selection = self.selection.lock();
        let resolved = track.resolve_layer(selection.preferred);
        self.set_target(&mut selection, resolved);
    }

    fn set_target(&self, selection: &mut LayerSelection, resolved: Option<QualityLayer>) {
        if resolved != selection.target {
            debug!(
                subscriber = %self.subscriber,
                track = %self.key,
                current = ?selection.current,
                target = ?resolved,
                "Layer switch requested"
            );
            selection.target = resolved;
        }
        // Single-layer again: nothing left to switch from
        if resolved.is_none() {
            selection.current = None;
        }
    }

    #[must_use]
    pub fn packets_forwarded(&self) -> u64 {
        self.packets_forwarded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    fn is_sync_point(&self, packet: &ForwardablePacket) -> bool {
        match self.kind {
            TrackKind::Audio => true,
            TrackKind::Video => packet.keyframe,
        }
    }

    /// Layer gate. Commits a pending switch only at a sync point of the target layer.
    fn accept(&self, packet: &ForwardablePacket) -> bool {
        if !self.is_active() {
            return false;
        }
        let Some(layer) = packet.quality_layer else {
            return true;
        };

        let mut selection = self.selection.lock();
        if selection.current != selection.target
            && selection.target == Some(layer)
            && self.is_sync_point(packet)
        {
            selection.current = Some(layer);
            return true;
        }
        selection.current == Some(layer)
    }

    fn deliver(&self, packet: &ForwardablePacket) -> bool {
        match self.sender.try_send(packet.clone()) {
            Ok(()) => {
                self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_) | mpsc::error::TrySendError::Closed(_)) => {
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber", &self.subscriber)
            .field("key", &self.key)
            .field("selection", &*self.selection.lock())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Track statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackStats {
    pub track_id: TrackId,
    pub kind: TrackKind,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_lost: u64,
    pub subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_packet(seq: u16, layer: QualityLayer, keyframe: bool) -> ForwardablePacket {
        ForwardablePacket::new(Bytes::from_static(&[0u8; 100]), seq, u32::from(seq) * 3000)
            .with_layer(layer)
            .with_keyframe(keyframe)
    }

    fn simulcast_track() -> Arc<MediaTrack> {
        MediaTrack::new(
            ClientId::from("pub"),
            TrackInfo::video("cam").with_layers([
                QualityLayer::High,
                QualityLayer::Low,
                QualityLayer::Medium,
            ]),
        )
    }

    #[test]
    fn test_quality_from_bandwidth() {
        assert_eq!(QualityLayer::from_bandwidth(2500), QualityLayer::High);
        assert_eq!(QualityLayer::from_bandwidth(1000), QualityLayer::Medium);
        assert_eq!(QualityLayer::from_bandwidth(300), QualityLayer::Low);
        assert_eq!(QualityLayer::from_rid(QualityLayer::Medium.rid()), Some(QualityLayer::Medium));
    }

    #[test]
    fn test_resolve_layer() {
        let track = simulcast_track();
        assert_eq!(track.resolve_layer(QualityLayer::Medium), Some(QualityLayer::Medium));

        track.set_available_layers([QualityLayer::Low, QualityLayer::High]);
        assert_eq!(track.resolve_layer(QualityLayer::Medium), Some(QualityLayer::Low));

        track.set_available_layers([QualityLayer::High]);
        assert_eq!(track.resolve_layer(QualityLayer::Low), Some(QualityLayer::High));

        let audio = MediaTrack::new(ClientId::from("pub"), TrackInfo::audio("mic"));
        assert_eq!(audio.resolve_layer(QualityLayer::High), None);
    }

    #[test]
    fn test_single_layer_forwarding() {
        let track = MediaTrack::new(ClientId::from("pub"), TrackInfo::audio("mic"));
        let (tx, mut rx) = mpsc::channel(8);
        track.bind(ClientId::from("sub"), tx, QualityLayer::Medium).unwrap();

        let packet = ForwardablePacket::new(Bytes::from_static(b"opus"), 1, 960);
        assert_eq!(track.forward(&packet), 1);
        assert_eq!(rx.try_recv().unwrap().sequence_number, 1);

        let stats = track.get_stats();
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.subscribers, 1);
    }

    #[test]
    fn test_layer_switch_waits_for_keyframe() {
        let track = simulcast_track();
        let (tx, mut rx) = mpsc::channel(64);
        let sub = track.bind(ClientId::from("sub"), tx, QualityLayer::Medium).unwrap();
        assert_eq!(sub.target_layer(), Some(QualityLayer::Medium));

        // Nothing flows before the first key frame of the target layer.
        assert_eq!(track.forward(&video_packet(1, QualityLayer::Medium, false)), 0);
        assert_eq!(track.forward(&video_packet(2, QualityLayer::Medium, true)), 1);
        assert_eq!(track.forward(&video_packet(3, QualityLayer::High, true)), 0);
        assert_eq!(sub.current_layer(), Some(QualityLayer::Medium));

        sub.request_layer(QualityLayer::High);
        // Delta frames of the new layer are skipped, old layer keeps flowing.
        assert_eq!(track.forward(&video_packet(4, QualityLayer::High, false)), 0);
        assert_eq!(track.forward(&video_packet(5, QualityLayer::Medium, false)), 1);
        assert_eq!(track.forward(&video_packet(6, QualityLayer::High, true)), 1);
        assert_eq!(sub.current_layer(), Some(QualityLayer::High));
        assert_eq!(track.forward(&video_packet(7, QualityLayer::Medium, false)), 0);

        let mut layers = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            layers.push((packet.sequence_number, packet.quality_layer));
        }
        assert_eq!(
            layers,
            vec![
                (2, Some(QualityLayer::Medium)),
                (5, Some(QualityLayer::Medium)),
                (6, Some(QualityLayer::High)),
            ]
        );
    }

    #[test]
    fn test_layers_added_after_subscribe() {
        let track = MediaTrack::new(ClientId::from("pub"), TrackInfo::video("cam"));
        let (tx, _rx) = mpsc::channel(64);
        let sub = track.bind(ClientId::from("sub"), tx, QualityLayer::Medium).unwrap();
        assert_eq!(sub.target_layer(), None);

        track.set_available_layers([QualityLayer::Low, QualityLayer::Medium, QualityLayer::High]);
        assert_eq!(sub.target_layer(), Some(QualityLayer::Medium));

        assert_eq!(track.forward(&video_packet(1, QualityLayer::Low, true)), 0);
        assert_eq!(track.forward(&video_packet(2, QualityLayer::Medium, true)), 1);
        assert_eq!(track.forward(&video_packet(3, QualityLayer::Medium, false)), 1);
        assert_eq!(sub.current_layer(), Some(QualityLayer::Medium));
    }

    #[test]
    fn test_withdrawn_layer_falls_back() {
        let track = MediaTrack::new(
            ClientId::from("pub"),
            TrackInfo::video("cam").with_layers([QualityLayer::Low, QualityLayer::Medium]),
        );
        let (tx, _rx) = mpsc::channel(64);
        let sub = track.bind(ClientId::from("sub"), tx, QualityLayer::Medium).unwrap();
        assert_eq!(track.forward(&video_packet(1, QualityLayer::Medium, true)), 1);

        track.set_available_layers([QualityLayer::Low]);
        assert_eq!(sub.target_layer(), Some(QualityLayer::Low));
        assert_eq!(sub.preferred_layer(), QualityLayer::Medium);

        // Delta frames of the fallback wait for its key frame.
        assert_eq!(track.forward(&video_packet(2, QualityLayer::Low, false)), 0);
        assert_eq!(track.forward(&video_packet(3, QualityLayer::Low, true)), 1);
        assert_eq!(track.forward(&video_packet(4, QualityLayer::Low, false)), 1);
        assert_eq!(sub.current_layer(), Some(QualityLayer::Low));

        // The preferred layer comes back once the publisher sends it again.
        track.set_available_layers([QualityLayer::Low, QualityLayer::Medium]);
        assert_eq!(sub.target_layer(), Some(QualityLayer::Medium));
        assert_eq!(track.forward(&video_packet(5, QualityLayer::Medium, true)), 1);
        assert_eq!(sub.current_layer(), Some(QualityLayer::Medium));
    }

    #[test]
    fn test_deactivate_stops_delivery() {
        let track = MediaTrack::new(ClientId::from("pub"), TrackInfo::audio("mic"));
        let (tx, _rx) = mpsc::channel(8);
        let sub = track.bind(ClientId::from("sub"), tx.clone(), QualityLayer::Low).unwrap();

        assert_eq!(track.deactivate(), vec![ClientId::from("sub")]);
        assert!(!sub.is_active());
        assert_eq!(track.forward(&ForwardablePacket::new(Bytes::new(), 1, 0)), 0);
        assert!(matches!(
            track.bind(ClientId::from("other"), tx, QualityLayer::Low),
            Err(SfuError::TrackNotFound(_))
        ));
    }

    #[test]
    fn test_full_channel_counts_drop() {
        let track = MediaTrack::new(ClientId::from("pub"), TrackInfo::audio("mic"));
        let (tx, _rx) = mpsc::channel(1);
        let sub = track.bind(ClientId::from("sub"), tx, QualityLayer::Low).unwrap();

        assert_eq!(track.forward(&ForwardablePacket::new(Bytes::new(), 1, 0)), 1);
        assert_eq!(track.forward(&ForwardablePacket::new(Bytes::new(), 2, 0)), 0);
        assert_eq!(sub.packets_forwarded(), 1);
        assert_eq!(sub.packets_dropped(), 1);
    }
}
