//! Reference-counted packet buffers for the real-time path
//!
//! A producer obtains a [`RetainablePacket`] with one reference. Every consumer
//! that keeps the packet beyond the current call (a voice-activity window, a
//! forwarder queue) calls [`RetainablePacket::retain`] and later exactly one
//! [`RetainablePacket::release`]. The backing buffer goes back to the shared
//! pool when the last reference is released, and the packet then reads as empty.

use crate::error::{Result, SfuError};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Largest payload a pooled buffer carries (Ethernet MTU minus IP/UDP/RTP overhead)
pub const MAX_PAYLOAD_LEN: usize = 1460;

/// Per-packet data held in a pooled buffer
#[derive(Debug, Default)]
pub struct VoicePacketData {
    pub sequence_number: u16,
    pub timestamp: u32,
    /// RFC 6464 audio level in -dBov (0 = loudest, 127 = silence)
    pub audio_level: u8,
    pub payload: Vec<u8>,
}

impl VoicePacketData {
    fn reset(&mut self) {
        self.sequence_number = 0;
        self.timestamp = 0;
        self.audio_level = 0;
        self.payload.clear();
    }
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Buffers allocated because the pool was empty
    pub allocated: u64,
    /// Buffers handed out from the pool
    pub reused: u64,
    /// Buffers returned by a final release
    pub recycled: u64,
    /// Buffers currently idle in the pool
    pub idle: usize,
}

struct BufferPool {
    idle: Mutex<Vec<Box<VoicePacketData>>>,
    capacity: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
}

impl BufferPool {
    fn acquire(&self) -> Box<VoicePacketData> {
        if let Some(buf) = self.idle.lock().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return buf;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Box::new(VoicePacketData {
            payload: Vec::with_capacity(MAX_PAYLOAD_LEN),
            ..Default::default()
        })
    }

    fn recycle(&self, mut buf: Box<VoicePacketData>) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
        buf.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(buf);
        }
    }
}

/// Hands out pooled, reference-counted packets. Cloning shares the pool.
#[derive(Clone)]
pub struct PacketManager {
    pool: Arc<BufferPool>,
}

impl PacketManager {
    /// `capacity` bounds how many idle buffers are kept for reuse
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: Arc::new(BufferPool {
                idle: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
            }),
        }
    }

    /// New packet with a reference count of 1, owned by the caller
    #[must_use]
    pub fn new_packet(
        &self,
        sequence_number: u16,
        timestamp: u32,
        audio_level: u8,
    ) -> Arc<RetainablePacket> {
        let mut data = self.pool.acquire();
        data.sequence_number = sequence_number;
        data.timestamp = timestamp;
        data.audio_level = audio_level;

        Arc::new(RetainablePacket {
            pool: Arc::clone(&self.pool),
            state: RwLock::new(PacketState {
                count: 1,
                data: Some(data),
            }),
            added_time: Instant::now(),
        })
    }

    pub fn new_packet_with_payload(
        &self,
        sequence_number: u16,
        timestamp: u32,
        audio_level: u8,
        payload: &[u8],
    ) -> Result<Arc<RetainablePacket>> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(SfuError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let packet = self.new_packet(sequence_number, timestamp, audio_level);
        if let Some(data) = packet.state.write().data.as_mut() {
            data.payload.extend_from_slice(payload);
        }
        Ok(packet)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.pool.allocated.load(Ordering::Relaxed),
            reused: self.pool.reused.load(Ordering::Relaxed),
            recycled: self.pool.recycled.load(Ordering::Relaxed),
            idle: self.pool.idle.lock().len(),
        }
    }
}

impl Default for PacketManager {
    fn default() -> Self {
        Self::new(1024)
    }
}

struct PacketState {
    count: usize,
    /// `None` once the buffer went back to the pool
    data: Option<Box<VoicePacketData>>,
}

/// A pooled packet shared between independent consumers
pub struct RetainablePacket {
    pool: Arc<BufferPool>,
    state: RwLock<PacketState>,
    added_time: Instant,
}

impl RetainablePacket {
    /// Packet data, or `None` after the final release
    #[must_use]
    pub fn data(&self) -> Option<MappedRwLockReadGuard<'_, VoicePacketData>> {
        RwLockReadGuard::try_map(self.state.read(), |state| state.data.as_deref()).ok()
    }

    #[must_use]
    pub fn audio_level(&self) -> Option<u8> {
        self.data().map(|data| data.audio_level)
    }

    #[must_use]
    pub const fn added_time(&self) -> Instant {
        self.added_time
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.state.read().count
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.state.read().count == 0
    }

    /// Record one more owner. Never resurrects a released packet.
    pub fn retain(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.count == 0 {
            warn!("Retain on released packet");
            return Err(SfuError::PacketAlreadyReleased);
        }
        state.count += 1;
        Ok(())
    }

    /// Drop one owner; the last release returns the buffer to the pool.
    pub fn release(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.count == 0 {
            warn!("Release on released packet");
            return Err(SfuError::PacketAlreadyReleased);
        }
        state.count -= 1;
        if state.count == 0 {
            if let Some(data) = state.data.take() {
                self.pool.recycle(data);
            }
        }
        Ok(())
    }

    /// Retain and get a guard that releases on drop
    pub fn retain_guard(self: &Arc<Self>) -> Result<PacketGuard> {
        self.retain()?;
        Ok(PacketGuard {
            packet: Arc::clone(self),
        })
    }
}

impl Drop for RetainablePacket {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(data) = state.data.take() {
            warn!(
                outstanding = state.count,
                sequence_number = data.sequence_number,
                "Packet dropped with outstanding references"
            );
            self.pool.recycle(data);
        }
    }
}

impl std::fmt::Debug for RetainablePacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RetainablePacket")
            .field("count", &state.count)
            .field("data", &state.data)
            .field("added_time", &self.added_time)
            .finish()
    }
}

/// Scoped reference to a packet, released when dropped
pub struct PacketGuard {
    packet: Arc<RetainablePacket>,
}

impl PacketGuard {
    #[must_use]
    pub fn packet(&self) -> &Arc<RetainablePacket> {
        &self.packet
    }
}

impl std::ops::Deref for PacketGuard {
    type Target = RetainablePacket;

    fn deref(&self) -> &Self::Target {
        &self.packet
    }
}

impl Drop for PacketGuard {
    fn drop(&mut self) {
        if let Err(e) = self.packet.release() {
            warn!(error = %e, "Packet guard released an already released packet");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_packet_has_one_reference() {
        let manager = PacketManager::new(8);
        let packet = manager.new_packet(10, 960, 30);

        assert_eq!(packet.ref_count(), 1);
        let data = packet.data().unwrap();
        assert_eq!(data.sequence_number, 10);
        assert_eq!(data.timestamp, 960);
        assert_eq!(data.audio_level, 30);
    }

    #[test]
    fn test_release_returns_buffer_once() {
        let manager = PacketManager::new(8);
        let packet = manager.new_packet(1, 0, 0);
        packet.retain().unwrap();
        packet.retain().unwrap();

        packet.release().unwrap();
        packet.release().unwrap();
        assert_eq!(manager.stats().recycled, 0);
        assert!(packet.data().is_some());

        packet.release().unwrap();
        assert_eq!(manager.stats().recycled, 1);
        assert!(packet.data().is_none());
        assert!(packet.audio_level().is_none());

        assert!(matches!(packet.retain(), Err(SfuError::PacketAlreadyReleased)));
        assert!(matches!(packet.release(), Err(SfuError::PacketAlreadyReleased)));
        assert_eq!(manager.stats().recycled, 1);
        assert_eq!(manager.stats().idle, 1);
    }

    #[test]
    fn test_buffers_are_reused_and_reset() {
        let manager = PacketManager::new(8);
        let first = manager.new_packet_with_payload(1, 0, 5, &[1, 2, 3]).unwrap();
        first.release().unwrap();

        let second = manager.new_packet(2, 0, 9);
        let stats = manager.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
        assert!(second.data().unwrap().payload.is_empty());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let manager = PacketManager::new(8);
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let result = manager.new_packet_with_payload(1, 0, 0, &payload);
        assert!(matches!(result, Err(SfuError::PayloadTooLarge { .. })));
        assert_eq!(manager.stats().allocated, 0);
    }

    #[test]
    fn test_pool_capacity_bounds_idle_buffers() {
        let manager = PacketManager::new(1);
        let a = manager.new_packet(1, 0, 0);
        let b = manager.new_packet(2, 0, 0);
        a.release().unwrap();
        b.release().unwrap();

        let stats = manager.stats();
        assert_eq!(stats.recycled, 2);
        assert_eq!(stats.idle, 1);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let manager = PacketManager::new(8);
        let packet = manager.new_packet(1, 0, 0);
        {
            let guard = packet.retain_guard().unwrap();
            assert_eq!(guard.ref_count(), 2);
        }
        assert_eq!(packet.ref_count(), 1);
    }

    #[test]
    fn test_leaked_packet_recycled_on_drop() {
        let manager = PacketManager::new(8);
        let packet = manager.new_packet(1, 0, 0);
        packet.retain().unwrap();
        drop(packet);
        assert_eq!(manager.stats().recycled, 1);
    }

    #[test]
    fn test_concurrent_releases_recycle_once() {
        let manager = PacketManager::new(64);
        for _ in 0..50 {
            let packet = manager.new_packet(1, 0, 0);
            for _ in 0..7 {
                packet.retain().unwrap();
            }

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let packet = Arc::clone(&packet);
                    thread::spawn(move || packet.release())
                })
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }
            assert!(packet.is_released());
        }
        assert_eq!(manager.stats().recycled, 50);
    }
}
