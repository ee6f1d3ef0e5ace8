#![forbid(unsafe_code)]

//! Sentinel framing: frames end at (and include) a sentinel byte.
//! Used for line-oriented protocol headers, composed with length framing
//! for bodies.

use bytes::Bytes;

use crate::{Error, Result};

pub struct SentinelFramer {
    sentinel: u8,
    acc: Vec<u8>,
    max_frame: usize,
}

impl SentinelFramer {
    pub fn new(sentinel: u8, max_frame: usize) -> Self {
        Self {
            sentinel,
            acc: Vec::new(),
            max_frame,
        }
    }

    /// Feed a chunk; returns completed frames, sentinel included.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        for &b in bytes {
            self.acc.push(b);
            if b == self.sentinel {
                frames.push(Bytes::from(std::mem::take(&mut self.acc)));
            } else if self.acc.len() > self.max_frame {
                return Err(Error::FrameTooLarge {
                    got: self.acc.len() as u64,
                    cap: self.max_frame as u64,
                });
            }
        }
        Ok(frames)
    }

    /// Bytes accumulated past the last sentinel. Handed over when the
    /// framing mode switches mid-stream (header → body).
    pub fn take_partial(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_include_sentinel() {
        let mut framer = SentinelFramer::new(b'\n', 1024);
        let frames = framer.push(b"one\ntwo\n").unwrap();
        assert_eq!(
            frames,
            vec![Bytes::from_static(b"one\n"), Bytes::from_static(b"two\n")]
        );
    }

    #[test]
    fn partial_line_held_back() {
        let mut framer = SentinelFramer::new(b'\n', 1024);
        assert!(framer.push(b"par").unwrap().is_empty());
        let frames = framer.push(b"tial\nrest").unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"partial\n")]);
        assert_eq!(framer.take_partial(), b"rest");
    }

    #[test]
    fn unterminated_overflow_rejected() {
        let mut framer = SentinelFramer::new(b'\n', 4);
        assert!(framer.push(b"too long without newline").is_err());
    }
}
