#![forbid(unsafe_code)]

//! Binary spam-check protocol. Requests are
//! `request_id (8 BE) | block_len (8 BE) | block`, responses are
//! `request_id (8 BE) | verdict (1)`. Blocks stay pending with an opaque
//! per-request metadata value until their verdict arrives.

use std::collections::HashMap;

use bytes::Bytes;
use marlin_core::SocketAddress;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict(pub u8);

impl Verdict {
    pub fn is_ok(&self) -> bool {
        self.0 != 0
    }
}

pub struct SpamCheckBridge<M> {
    stream: TcpStream,
    next_request_id: u64,
    pending: HashMap<u64, (Bytes, M)>,
}

impl<M> SpamCheckBridge<M> {
    pub async fn connect(addr: SocketAddress) -> Result<Self> {
        let stream = TcpStream::connect(std::net::SocketAddr::from(addr)).await?;
        debug!(%addr, "spam-check bridge connected");
        Ok(Self {
            stream,
            next_request_id: 1,
            pending: HashMap::new(),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Submit a block for checking; the block and `metadata` are held
    /// until the verdict pairs them up again.
    pub async fn submit(&mut self, block: Bytes, metadata: M) -> Result<u64> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut header = [0u8; 16];
        header[0..8].copy_from_slice(&request_id.to_be_bytes());
        header[8..16].copy_from_slice(&(block.len() as u64).to_be_bytes());
        self.stream.write_all(&header).await?;
        self.stream.write_all(&block).await?;

        self.pending.insert(request_id, (block, metadata));
        Ok(request_id)
    }

    /// Wait for the next verdict and hand back the block it judged.
    pub async fn next_verdict(&mut self) -> Result<(u64, Verdict, Bytes, M)> {
        loop {
            let mut response = [0u8; 9];
            self.stream.read_exact(&mut response).await?;
            let request_id = u64::from_be_bytes(
                response[0..8]
                    .try_into()
                    .map_err(|_| Error::protocol("short verdict"))?,
            );
            let verdict = Verdict(response[8]);

            match self.pending.remove(&request_id) {
                Some((block, metadata)) => return Ok((request_id, verdict, block, metadata)),
                None => {
                    warn!(request_id, "verdict for unknown request dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Analyzer double: accepts one block, verdicts it ok.
    async fn fake_analyzer() -> SocketAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = SocketAddress::try_from(listener.local_addr().unwrap()).unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            loop {
                let mut header = [0u8; 16];
                if sock.read_exact(&mut header).await.is_err() {
                    break;
                }
                let len = u64::from_be_bytes(header[8..16].try_into().unwrap());
                let mut block = vec![0u8; len as usize];
                sock.read_exact(&mut block).await.unwrap();

                let mut response = [0u8; 9];
                response[0..8].copy_from_slice(&header[0..8]);
                response[8] = u8::from(!block.is_empty());
                sock.write_all(&response).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn verdict_pairs_block_and_metadata() {
        let addr = fake_analyzer().await;
        let mut bridge: SpamCheckBridge<&'static str> =
            SpamCheckBridge::connect(addr).await.unwrap();

        let id1 = bridge.submit(Bytes::from_static(b"block one"), "m1").await.unwrap();
        let id2 = bridge.submit(Bytes::from_static(b"block two"), "m2").await.unwrap();
        assert_ne!(id1, id2);
        assert_eq!(bridge.pending_count(), 2);

        let (rid, verdict, block, meta) = bridge.next_verdict().await.unwrap();
        assert_eq!(rid, id1);
        assert!(verdict.is_ok());
        assert_eq!(block, Bytes::from_static(b"block one"));
        assert_eq!(meta, "m1");

        let (rid, _, _, meta) = bridge.next_verdict().await.unwrap();
        assert_eq!(rid, id2);
        assert_eq!(meta, "m2");
        assert_eq!(bridge.pending_count(), 0);
    }
}
