#![forbid(unsafe_code)]

//! Receive-side stream reassembly. Out-of-order packets are held (capped)
//! until the contiguous prefix reaches them; the prefix is delivered to
//! the application in stream-offset order.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::debug;

/// Out-of-order fragments held per stream; arrivals past the cap are
/// dropped and recovered by retransmission.
pub const HOLD_CAP: usize = 1024;

#[derive(Debug)]
pub struct RecvStream {
    pub stream_id: u16,
    /// Total stream length, known once FIN arrives.
    pub size: Option<u64>,
    /// Contiguous prefix received (and delivered).
    pub recv_offset: u64,
    /// Skipped streams drop all further data.
    pub skipped: bool,
    holds: BTreeMap<u64, Bytes>,
}

impl RecvStream {
    pub fn new(stream_id: u16) -> Self {
        Self {
            stream_id,
            size: None,
            recv_offset: 0,
            skipped: false,
            holds: BTreeMap::new(),
        }
    }

    /// Ingest a DATA packet; returns the in-order chunks it unlocked.
    pub fn on_data(&mut self, offset: u64, data: Bytes, fin: bool) -> Vec<Bytes> {
        if self.skipped {
            return Vec::new();
        }
        if fin {
            self.size = Some(offset + data.len() as u64);
        }

        let end = offset + data.len() as u64;
        if end > self.recv_offset && !data.is_empty() {
            match self.holds.get(&offset) {
                Some(held) if held.len() >= data.len() => {}
                _ => {
                    if self.holds.len() >= HOLD_CAP && !self.holds.contains_key(&offset) {
                        debug!(
                            stream_id = self.stream_id,
                            offset, "hold cap reached, dropping fragment"
                        );
                        return Vec::new();
                    }
                    self.holds.insert(offset, data);
                }
            }
        }

        self.drain()
    }

    fn drain(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some((&offset, data)) = self.holds.first_key_value() {
            if offset > self.recv_offset {
                break;
            }
            let end = offset + data.len() as u64;
            if end > self.recv_offset {
                let skip = (self.recv_offset - offset) as usize;
                let data = self.holds.remove(&offset).unwrap_or_default();
                out.push(data.slice(skip..));
                self.recv_offset = end;
            } else {
                // Entirely duplicate.
                self.holds.remove(&offset);
            }
        }
        out
    }

    /// The sender abandoned the stream at `offset`; drop holds and jump
    /// the prefix forward.
    pub fn on_skip(&mut self, offset: u64) {
        self.skipped = true;
        self.holds.clear();
        self.recv_offset = self.recv_offset.max(offset);
        if let Some(size) = self.size {
            self.recv_offset = self.recv_offset.max(size);
        }
    }

    pub fn held_fragments(&self) -> usize {
        self.holds.len()
    }

    pub fn is_done(&self) -> bool {
        self.skipped || self.size.is_some_and(|s| self.recv_offset >= s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn in_order_delivery() {
        let mut stream = RecvStream::new(0);
        let out = stream.on_data(0, bytes_of(10, 1), false);
        assert_eq!(out, vec![bytes_of(10, 1)]);
        assert_eq!(stream.recv_offset, 10);
    }

    #[test]
    fn out_of_order_held_then_released() {
        let mut stream = RecvStream::new(0);
        assert!(stream.on_data(10, bytes_of(10, 2), false).is_empty());
        assert_eq!(stream.held_fragments(), 1);

        let out = stream.on_data(0, bytes_of(10, 1), false);
        assert_eq!(out, vec![bytes_of(10, 1), bytes_of(10, 2)]);
        assert_eq!(stream.recv_offset, 20);
        assert_eq!(stream.held_fragments(), 0);
    }

    #[test]
    fn duplicates_ignored() {
        let mut stream = RecvStream::new(0);
        let _ = stream.on_data(0, bytes_of(10, 1), false);
        assert!(stream.on_data(0, bytes_of(10, 1), false).is_empty());
        assert_eq!(stream.recv_offset, 10);
    }

    #[test]
    fn partial_overlap_trimmed() {
        let mut stream = RecvStream::new(0);
        let _ = stream.on_data(0, bytes_of(10, 1), false);
        let out = stream.on_data(5, bytes_of(10, 2), false);
        assert_eq!(out, vec![bytes_of(5, 2)]);
        assert_eq!(stream.recv_offset, 15);
    }

    #[test]
    fn fin_sets_size_and_done() {
        let mut stream = RecvStream::new(0);
        let _ = stream.on_data(0, bytes_of(10, 1), false);
        assert!(!stream.is_done());
        let _ = stream.on_data(10, bytes_of(5, 2), true);
        assert_eq!(stream.size, Some(15));
        assert!(stream.is_done());
    }

    #[test]
    fn hold_cap_drops_fragments() {
        let mut stream = RecvStream::new(0);
        for i in 0..HOLD_CAP as u64 {
            // Leave a gap at offset 0 so nothing drains.
            let _ = stream.on_data(10 + i * 10, bytes_of(10, 3), false);
        }
        assert_eq!(stream.held_fragments(), HOLD_CAP);

        let over = stream.on_data(10 + HOLD_CAP as u64 * 10, bytes_of(10, 3), false);
        assert!(over.is_empty());
        assert_eq!(stream.held_fragments(), HOLD_CAP);
    }

    #[test]
    fn skip_drops_holds_and_advances() {
        let mut stream = RecvStream::new(0);
        let _ = stream.on_data(10, bytes_of(10, 2), false);
        stream.on_skip(100);

        assert_eq!(stream.held_fragments(), 0);
        assert_eq!(stream.recv_offset, 100);
        assert!(stream.is_done());
        assert!(stream.on_data(100, bytes_of(10, 1), false).is_empty());
    }

    #[test]
    fn delivered_bytes_equal_sent_prefix() {
        // Shuffle-ish arrival order still yields the exact byte sequence.
        let mut stream = RecvStream::new(0);
        let mut delivered = Vec::new();
        for &(off, len, fill) in &[(20u64, 10usize, 3u8), (0, 10, 1), (30, 10, 4), (10, 10, 2)] {
            for chunk in stream.on_data(off, bytes_of(len, fill), false) {
                delivered.extend_from_slice(&chunk);
            }
        }
        let mut expect = Vec::new();
        for fill in 1u8..=4 {
            expect.extend_from_slice(&[fill; 10]);
        }
        assert_eq!(delivered, expect);
    }
}
