//! Frame-ordered reassembly of unreliable-transport delivery. Data only
//! ever leaves the buffer in frame order; skipped frames are dropped
//! silently because nothing retransmits at this layer.

use log::warn;

use super::protocol::{frame_newer, FrameNumber};

#[derive(Debug, Clone)]
struct JitterSlot {
    frame: FrameNumber,
    payload: Vec<u8>,
}

/// Fixed-capacity slot pool plus an index permutation kept sorted by frame
/// (modular ascending). Producer and consumer share one mutex at the usage
/// site; per-operation cost is bounded by the window size, not by packet
/// arrival rate.
#[derive(Debug)]
pub struct PacketJitterBuffer {
    slots: Vec<Option<JitterSlot>>,
    order: Vec<usize>,
    free: Vec<usize>,
    last_read_frame: FrameNumber,
    capacity: usize,
}

impl PacketJitterBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            order: Vec::with_capacity(capacity),
            free: (0..capacity).rev().collect(),
            last_read_frame: 0,
            capacity,
        }
    }

    /// Accepts a packet if its frame falls inside the window
    /// `[last_read_frame, last_read_frame + capacity)`. Stale and
    /// too-far-future frames are discarded without logging; they are
    /// expected under normal jitter.
    pub fn add_packet(&mut self, frame: FrameNumber, payload: &[u8]) -> bool {
        let offset = frame.wrapping_sub(self.last_read_frame) as usize;
        if offset >= self.capacity {
            return false;
        }

        let Some(slot) = self.free.pop() else {
            warn!("jitter buffer full, dropping frame {}", frame);
            return false;
        };
        self.slots[slot] = Some(JitterSlot {
            frame,
            payload: payload.to_vec(),
        });

        // Insert at the newest end and walk backward until ordered; a
        // duplicate frame stops the walk where it stands.
        self.order.push(slot);
        let mut i = self.order.len() - 1;
        while i > 0 {
            let prev = self.slots[self.order[i - 1]]
                .as_ref()
                .map(|s| s.frame)
                .unwrap_or(frame);
            if !frame_newer(prev, frame) {
                break;
            }
            self.order.swap(i - 1, i);
            i -= 1;
        }
        true
    }

    /// Returns the payload for `frame` if buffered, freeing it along with
    /// every older frame scanned on the way. Returns `None` when the frame
    /// has not arrived yet; the caller waits rather than advancing.
    pub fn try_read(&mut self, frame: FrameNumber) -> Option<Vec<u8>> {
        let mut match_pos = None;
        for (pos, &slot) in self.order.iter().enumerate() {
            let slot_frame = self.slots[slot].as_ref()?.frame;
            if slot_frame == frame {
                match_pos = Some(pos);
                break;
            }
            if frame_newer(slot_frame, frame) {
                return None;
            }
        }
        let pos = match_pos?;

        let payload = self.slots[self.order[pos]].take().map(|s| s.payload);
        for &slot in &self.order[..pos] {
            self.slots[slot] = None;
        }
        for slot in self.order.drain(..=pos) {
            self.free.push(slot);
        }
        self.last_read_frame = frame;
        payload
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn last_read_frame(&self) -> FrameNumber {
        self.last_read_frame
    }

    /// Oldest buffered frame, if any.
    pub fn oldest_frame(&self) -> Option<FrameNumber> {
        self.order
            .first()
            .and_then(|&slot| self.slots[slot].as_ref())
            .map(|s| s.frame)
    }

    /// Drops everything buffered and restarts the window at `frame`, e.g.
    /// when the first server frame is learned.
    pub fn reset(&mut self, frame: FrameNumber) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.order.clear();
        self.free = (0..self.capacity).rev().collect();
        self.last_read_frame = frame;
    }
}
