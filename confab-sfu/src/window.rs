//! Sliding window of retained packets
//!
//! Used by voice-activity consumers that inspect recent audio levels while the
//! forwarder independently owns the same packets.

use crate::error::Result;
use crate::packet::RetainablePacket;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

pub struct PacketWindow {
    span: Duration,
    packets: VecDeque<Arc<RetainablePacket>>,
}

impl PacketWindow {
    #[must_use]
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            packets: VecDeque::new(),
        }
    }

    /// Retain `packet` and append it to the window
    pub fn push(&mut self, packet: &Arc<RetainablePacket>) -> Result<()> {
        packet.retain()?;
        self.packets.push_back(Arc::clone(packet));
        Ok(())
    }

    /// Release every packet older than the window span. Returns how many left.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some(front) = self.packets.front() {
            if now.saturating_duration_since(front.added_time()) <= self.span {
                break;
            }
            if let Some(packet) = self.packets.pop_front() {
                Self::release(&packet);
                expired += 1;
            }
        }
        expired
    }

    /// Audio levels of the packets still in the window, oldest first
    #[must_use]
    pub fn audio_levels(&self) -> Vec<u8> {
        self.packets.iter().filter_map(|p| p.audio_level()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn clear(&mut self) {
        for packet in self.packets.drain(..) {
            Self::release(&packet);
        }
    }

    fn release(packet: &RetainablePacket) {
        if let Err(e) = packet.release() {
            warn!(error = %e, "Window held a packet without a reference");
        }
    }
}

impl Drop for PacketWindow {
    fn drop(&mut self) {
        self.clear();
    }
}
