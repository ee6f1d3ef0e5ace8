#![forbid(unsafe_code)]

//! Length-prefixed framing: every frame is `length (8 BE) | payload`.
//! Inbound bytes are stored until the whole frame arrives, then the frame
//! is forwarded in one piece.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

enum State {
    /// Accumulating the 8-byte prefix.
    Prefix(Vec<u8>),
    /// Accumulating `remaining` payload bytes.
    Body { remaining: u64, acc: BytesMut },
}

pub struct LengthFramer {
    state: State,
    max_frame: u64,
}

impl LengthFramer {
    pub fn new(max_frame: u64) -> Self {
        Self {
            state: State::Prefix(Vec::with_capacity(8)),
            max_frame,
        }
    }

    /// Framer primed to collect `length` bytes with no prefix, for
    /// lengths carried out of band (e.g. an HTTP `Content-Length`
    /// header). Subsequent frames revert to prefixed form.
    pub fn expecting(length: u64, max_frame: u64) -> Result<Self> {
        if length > max_frame {
            return Err(Error::FrameTooLarge {
                got: length,
                cap: max_frame,
            });
        }
        Ok(Self {
            state: State::Body {
                remaining: length,
                acc: BytesMut::with_capacity(length as usize),
            },
            max_frame,
        })
    }

    /// Feed a chunk; returns every frame completed by it, in order.
    pub fn push(&mut self, mut bytes: &[u8]) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            match &mut self.state {
                State::Prefix(acc) => {
                    let take = (8 - acc.len()).min(bytes.len());
                    acc.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if acc.len() == 8 {
                        let mut prefix = [0u8; 8];
                        prefix.copy_from_slice(acc);
                        let length = u64::from_be_bytes(prefix);
                        if length > self.max_frame {
                            return Err(Error::FrameTooLarge {
                                got: length,
                                cap: self.max_frame,
                            });
                        }
                        self.state = State::Body {
                            remaining: length,
                            acc: BytesMut::with_capacity(length as usize),
                        };
                    }
                }
                State::Body { remaining, acc } => {
                    let take = (*remaining).min(bytes.len() as u64) as usize;
                    acc.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        frames.push(std::mem::take(acc).freeze());
                        self.state = State::Prefix(Vec::with_capacity(8));
                    }
                }
            }
        }
        Ok(frames)
    }

    /// Prefix a frame for the wire.
    pub fn encode(frame: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(8 + frame.len());
        out.put_u64(frame.len() as u64);
        out.put_slice(frame);
        out.to_vec()
    }
}
