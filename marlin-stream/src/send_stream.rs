#![forbid(unsafe_code)]

//! Send-side stream bookkeeping. Data items stay queued until their bytes
//! are acked so lost ranges can be re-read for retransmission; lost
//! ranges are served before fresh data.

use std::collections::{BTreeMap, VecDeque};

use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Ready,
    Send,
    Sent,
    Acked,
}

#[derive(Debug)]
pub struct DataItem {
    pub data: Bytes,
    pub stream_offset: u64,
}

/// A chunk handed to the packetizer.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

#[derive(Debug)]
pub struct SendStream {
    pub stream_id: u16,
    pub state: SendState,
    data_queue: VecDeque<DataItem>,
    /// Total bytes enqueued.
    pub queue_offset: u64,
    /// Next fresh byte to go on the wire.
    pub sent_offset: u64,
    /// Contiguous acked prefix.
    pub acked_offset: u64,
    pub done_queueing: bool,
    /// Ranges declared lost, served before fresh data.
    lost_queue: VecDeque<(u64, u64)>,
    /// Out-of-order acked ranges, offset → end.
    acked_ranges: BTreeMap<u64, u64>,
}

impl SendStream {
    pub fn new(stream_id: u16) -> Self {
        Self {
            stream_id,
            state: SendState::Ready,
            data_queue: VecDeque::new(),
            queue_offset: 0,
            sent_offset: 0,
            acked_offset: 0,
            done_queueing: false,
            lost_queue: VecDeque::new(),
            acked_ranges: BTreeMap::new(),
        }
    }

    pub fn enqueue(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let stream_offset = self.queue_offset;
        self.queue_offset += data.len() as u64;
        self.data_queue.push_back(DataItem {
            data,
            stream_offset,
        });
        self.state = SendState::Send;
    }

    /// No more data will be queued; the final chunk carries FIN.
    pub fn flush(&mut self) {
        self.done_queueing = true;
    }

    pub fn has_pending(&self) -> bool {
        !self.lost_queue.is_empty() || self.sent_offset < self.queue_offset
    }

    /// All queued bytes have been sent at least once.
    pub fn fully_sent(&self) -> bool {
        self.lost_queue.is_empty() && self.sent_offset == self.queue_offset
    }

    pub fn is_complete(&self) -> bool {
        self.done_queueing && self.acked_offset == self.queue_offset
    }

    /// Take the next chunk of at most `max` bytes, lost ranges first.
    pub fn pop_chunk(&mut self, max: usize) -> Option<Chunk> {
        let max = max as u64;

        if let Some((offset, len)) = self.lost_queue.pop_front() {
            let take = len.min(max);
            if take < len {
                self.lost_queue.push_front((offset + take, len - take));
            }
            let data = self.read_range(offset, take);
            let fin = self.done_queueing && offset + take == self.queue_offset;
            return Some(Chunk { offset, data, fin });
        }

        if self.sent_offset < self.queue_offset {
            let offset = self.sent_offset;
            let take = (self.queue_offset - offset).min(max);
            self.sent_offset += take;
            let data = self.read_range(offset, take);
            let fin = self.done_queueing && self.sent_offset == self.queue_offset;
            if self.fully_sent() {
                self.state = SendState::Sent;
            }
            return Some(Chunk { offset, data, fin });
        }

        None
    }

    /// Re-read queued bytes; `offset..offset+len` must be at or above the
    /// acked prefix.
    fn read_range(&self, offset: u64, len: u64) -> Bytes {
        debug_assert!(offset + len <= self.queue_offset);

        // Fast path: range inside a single item.
        let idx = self
            .data_queue
            .partition_point(|item| item.stream_offset + item.data.len() as u64 <= offset);
        let item = &self.data_queue[idx];
        let start = (offset - item.stream_offset) as usize;
        if start + len as usize <= item.data.len() {
            return item.data.slice(start..start + len as usize);
        }

        // Range spans items.
        let mut out = BytesMut::with_capacity(len as usize);
        let mut cursor = offset;
        let mut remaining = len;
        for item in self.data_queue.iter().skip(idx) {
            if remaining == 0 {
                break;
            }
            let start = (cursor - item.stream_offset) as usize;
            let take = (item.data.len() - start).min(remaining as usize);
            out.extend_from_slice(&item.data[start..start + take]);
            cursor += take as u64;
            remaining -= take as u64;
        }
        out.freeze()
    }

    /// Record an acked range; returns the bytes newly added to the acked
    /// set (overlapping acks of retransmissions count once).
    pub fn on_ack(&mut self, offset: u64, len: u64) -> u64 {
        if len == 0 {
            return 0;
        }
        let (start, end) = (offset, offset + len);

        // Merge into acked_ranges, counting only fresh coverage.
        let mut fresh = 0;
        let mut cursor = start.max(self.acked_offset);
        let mut covered: Vec<(u64, u64)> = self
            .acked_ranges
            .range(..end)
            .map(|(&s, &e)| (s, e))
            .collect();
        covered.retain(|&(_, e)| e >= cursor);
        for &(s, e) in &covered {
            if s > cursor {
                fresh += s.min(end).saturating_sub(cursor);
            }
            cursor = cursor.max(e);
        }
        fresh += end.saturating_sub(cursor.max(start));

        let mut new_start = start;
        let mut new_end = end;
        for (s, e) in covered {
            new_start = new_start.min(s);
            new_end = new_end.max(e);
            self.acked_ranges.remove(&s);
        }
        self.acked_ranges.insert(new_start, new_end);

        // Advance the contiguous prefix and drop fully-acked items.
        while let Some((&s, &e)) = self.acked_ranges.first_key_value() {
            if s <= self.acked_offset {
                self.acked_offset = self.acked_offset.max(e);
                self.acked_ranges.remove(&s);
            } else {
                break;
            }
        }
        while let Some(item) = self.data_queue.front() {
            if item.stream_offset + item.data.len() as u64 <= self.acked_offset {
                self.data_queue.pop_front();
            } else {
                break;
            }
        }

        if self.is_complete() {
            self.state = SendState::Acked;
        }
        fresh
    }

    /// Requeue a lost range ahead of fresh data.
    pub fn on_lost(&mut self, offset: u64, len: u64) {
        if offset + len <= self.acked_offset {
            return;
        }
        let offset = offset.max(self.acked_offset);
        let end = offset + len.min(self.queue_offset - offset);
        self.lost_queue.push_back((offset, end - offset));
    }

    /// Abandon everything unacked; nothing further will be sent.
    pub fn skip(&mut self) {
        self.lost_queue.clear();
        self.data_queue.clear();
        self.sent_offset = self.queue_offset;
        self.acked_offset = self.queue_offset;
        self.done_queueing = true;
        self.state = SendState::Acked;
    }

    /// Drop everything below `offset` (reader asked to jump ahead).
    pub fn flush_to(&mut self, offset: u64) {
        let offset = offset.min(self.queue_offset);
        if offset <= self.acked_offset {
            return;
        }
        self.on_ack(self.acked_offset, offset - self.acked_offset);
        self.sent_offset = self.sent_offset.max(offset);
        self.lost_queue.retain(|&(s, _)| s >= offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn chunks_come_out_in_order() {
        let mut stream = SendStream::new(1);
        stream.enqueue(bytes_of(100, 0xaa));
        stream.enqueue(bytes_of(100, 0xbb));

        let a = stream.pop_chunk(64).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(a.data.len(), 64);

        let b = stream.pop_chunk(200).unwrap();
        assert_eq!(b.offset, 64);
        assert_eq!(b.data.len(), 136);
        assert_eq!(&b.data[..36], &[0xaa; 36][..]);
        assert_eq!(&b.data[36..], &[0xbb; 100][..]);

        assert!(stream.pop_chunk(64).is_none());
    }

    #[test]
    fn fin_set_on_last_chunk_after_flush() {
        let mut stream = SendStream::new(1);
        stream.enqueue(bytes_of(100, 1));
        stream.flush();

        let a = stream.pop_chunk(60).unwrap();
        assert!(!a.fin);
        let b = stream.pop_chunk(60).unwrap();
        assert!(b.fin);
        assert_eq!(stream.state, SendState::Sent);
    }

    #[test]
    fn acks_advance_prefix_and_complete() {
        let mut stream = SendStream::new(1);
        stream.enqueue(bytes_of(100, 1));
        stream.flush();
        while stream.pop_chunk(40).is_some() {}

        assert_eq!(stream.on_ack(40, 40), 40);
        assert_eq!(stream.acked_offset, 0);

        assert_eq!(stream.on_ack(0, 40), 40);
        assert_eq!(stream.acked_offset, 80);

        assert_eq!(stream.on_ack(80, 20), 20);
        assert!(stream.is_complete());
        assert_eq!(stream.state, SendState::Acked);
    }

    #[test]
    fn duplicate_acks_count_once() {
        let mut stream = SendStream::new(1);
        stream.enqueue(bytes_of(100, 1));
        while stream.pop_chunk(50).is_some() {}

        assert_eq!(stream.on_ack(0, 50), 50);
        assert_eq!(stream.on_ack(0, 50), 0);
        assert_eq!(stream.on_ack(25, 50), 25);
    }

    #[test]
    fn lost_ranges_are_retransmitted_first() {
        let mut stream = SendStream::new(1);
        stream.enqueue(bytes_of(300, 7));
        let _ = stream.pop_chunk(100).unwrap();
        let _ = stream.pop_chunk(100).unwrap();

        stream.on_lost(0, 100);
        let rtx = stream.pop_chunk(100).unwrap();
        assert_eq!(rtx.offset, 0);
        assert_eq!(rtx.data.len(), 100);

        let fresh = stream.pop_chunk(100).unwrap();
        assert_eq!(fresh.offset, 200);
    }

    #[test]
    fn lost_range_larger_than_mtu_is_split() {
        let mut stream = SendStream::new(1);
        stream.enqueue(bytes_of(300, 7));
        let _ = stream.pop_chunk(300).unwrap();

        stream.on_lost(0, 300);
        assert_eq!(stream.pop_chunk(120).unwrap().offset, 0);
        let second = stream.pop_chunk(120).unwrap();
        assert_eq!(second.offset, 120);
        assert_eq!(stream.pop_chunk(120).unwrap().offset, 240);
        assert!(stream.pop_chunk(120).is_none());
    }

    #[test]
    fn retransmit_reads_original_bytes() {
        let mut stream = SendStream::new(1);
        let payload: Bytes = (0u8..=99).collect::<Vec<u8>>().into();
        stream.enqueue(payload.clone());
        let _ = stream.pop_chunk(100).unwrap();

        stream.on_lost(10, 20);
        let rtx = stream.pop_chunk(100).unwrap();
        assert_eq!(rtx.data, payload.slice(10..30));
    }

    #[test]
    fn skip_abandons_everything() {
        let mut stream = SendStream::new(1);
        stream.enqueue(bytes_of(200, 1));
        let _ = stream.pop_chunk(50);
        stream.on_lost(0, 50);

        stream.skip();
        assert!(stream.pop_chunk(100).is_none());
        assert!(stream.is_complete());
    }

    #[test]
    fn flush_to_discards_below_offset() {
        let mut stream = SendStream::new(1);
        stream.enqueue(bytes_of(200, 1));
        let _ = stream.pop_chunk(50);
        stream.on_lost(0, 50);

        stream.flush_to(120);
        let next = stream.pop_chunk(100).unwrap();
        assert_eq!(next.offset, 120);
        assert_eq!(stream.acked_offset, 120);
    }
}
