#![forbid(unsafe_code)]

//! HTTP/1.1 JSON-RPC bridge. One `POST /` per block; the response is
//! parsed with a newline-sentinel framer for the header lines and a
//! length framer (primed from `Content-Length`) for the body.

use marlin_core::SocketAddress;
use marlin_lpf::{LengthFramer, SentinelFramer};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{Error, Result};

/// Largest response body accepted from the analyzer.
const MAX_BODY: u64 = 16 << 20;
/// Largest single header line.
const MAX_HEADER_LINE: usize = 8 << 10;

/// Analyzer output for one block.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockAnalysis {
    pub hash: String,
    #[serde(rename = "headerOffset")]
    pub header_offset: u64,
    #[serde(rename = "headerLength")]
    pub header_length: u64,
    pub coinbase: String,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<BlockAnalysis>,
    #[serde(default)]
    error: Option<RpcError>,
}

pub struct JsonRpcBridge {
    stream: TcpStream,
    method: String,
    next_id: u64,
}

impl JsonRpcBridge {
    pub async fn connect(addr: SocketAddress, method: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(std::net::SocketAddr::from(addr)).await?;
        debug!(%addr, "json-rpc bridge connected");
        Ok(Self {
            stream,
            method: method.into(),
            next_id: 1,
        })
    }

    /// Submit a block and wait for its analysis.
    pub async fn analyze_block(&mut self, block: &[u8]) -> Result<BlockAnalysis> {
        let id = self.next_id;
        self.next_id += 1;

        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": self.method,
            "id": id,
            "params": [format!("0x{}", hex::encode(block))],
        })
        .to_string();
        let request = format!(
            "POST / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        self.stream.write_all(request.as_bytes()).await?;

        let body = self.read_response_body().await?;
        let response: RpcResponse = serde_json::from_slice(&body)?;
        if response.id != id {
            return Err(Error::protocol(format!(
                "response id {} does not match request {id}",
                response.id
            )));
        }
        if let Some(error) = response.error {
            return Err(Error::Analyzer(error.message));
        }
        response
            .result
            .ok_or_else(|| Error::protocol("response carries neither result nor error"))
    }

    /// Header lines through the sentinel framer until the blank line,
    /// then exactly `Content-Length` bytes through a primed length
    /// framer.
    async fn read_response_body(&mut self) -> Result<Vec<u8>> {
        let mut headers = SentinelFramer::new(b'\n', MAX_HEADER_LINE);
        let mut content_length: Option<u64> = None;
        let mut chunk = [0u8; 4096];

        // Header phase.
        let mut body_prefix: Vec<u8> = loop {
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::protocol("analyzer closed mid-headers"));
            }
            let lines = headers.push(&chunk[..n])?;

            let mut header_end = None;
            for (i, line) in lines.iter().enumerate() {
                let text = std::str::from_utf8(line)
                    .map_err(|_| Error::protocol("non-utf8 header line"))?
                    .trim_end_matches(['\r', '\n']);
                if text.is_empty() {
                    header_end = Some(i);
                    break;
                }
                if let Some((name, value)) = text.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        let parsed = value
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| Error::protocol("bad content-length"))?;
                        content_length = Some(parsed);
                    }
                }
            }

            if let Some(end) = header_end {
                // Everything after the blank line is body.
                let mut prefix = Vec::new();
                for line in &lines[end + 1..] {
                    prefix.extend_from_slice(line);
                }
                prefix.extend_from_slice(&headers.take_partial());
                break prefix;
            }
        };

        let content_length =
            content_length.ok_or_else(|| Error::protocol("missing content-length"))?;
        if content_length == 0 {
            return Ok(Vec::new());
        }

        // Body phase.
        let mut body = LengthFramer::expecting(content_length, MAX_BODY)?;
        if body_prefix.len() as u64 > content_length {
            body_prefix.truncate(content_length as usize);
        }
        if let Some(frame) = body.push(&body_prefix)?.pop() {
            return Ok(frame.to_vec());
        }
        loop {
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::protocol("analyzer closed mid-body"));
            }
            if let Some(frame) = body.push(&chunk[..n])?.pop() {
                return Ok(frame.to_vec());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_analyzer(response_body: String, write_in_pieces: bool) -> SocketAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = SocketAddress::try_from(listener.local_addr().unwrap()).unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // Read until the end of the request body.
            let mut seen = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                seen.extend_from_slice(&chunk[..n]);
                if let Some(at) = seen.windows(4).position(|w| w == b"\r\n\r\n") {
                    let headers = String::from_utf8_lossy(&seen[..at]).to_string();
                    let want: usize = headers
                        .lines()
                        .find_map(|l| l.strip_prefix("Content-Length: "))
                        .unwrap()
                        .parse()
                        .unwrap();
                    if seen.len() >= at + 4 + want {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                response_body.len(),
                response_body
            );
            if write_in_pieces {
                for piece in response.as_bytes().chunks(7) {
                    sock.write_all(piece).await.unwrap();
                    tokio::task::yield_now().await;
                }
            } else {
                sock.write_all(response.as_bytes()).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn parses_result_response() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"hash":"0xabc","headerOffset":10,"headerLength":500,"coinbase":"0xdef"}}"#;
        let addr = fake_analyzer(body.to_string(), false).await;

        let mut bridge = JsonRpcBridge::connect(addr, "analyze_block").await.unwrap();
        let analysis = bridge.analyze_block(b"raw block").await.unwrap();
        assert_eq!(
            analysis,
            BlockAnalysis {
                hash: "0xabc".into(),
                header_offset: 10,
                header_length: 500,
                coinbase: "0xdef".into(),
            }
        );
    }

    #[tokio::test]
    async fn parses_response_split_across_reads() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"hash":"0x1","headerOffset":0,"headerLength":1,"coinbase":"0x2"}}"#;
        let addr = fake_analyzer(body.to_string(), true).await;

        let mut bridge = JsonRpcBridge::connect(addr, "analyze_block").await.unwrap();
        let analysis = bridge.analyze_block(b"raw block").await.unwrap();
        assert_eq!(analysis.hash, "0x1");
    }

    #[tokio::test]
    async fn surfaces_analyzer_errors() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"message":"bad block"}}"#;
        let addr = fake_analyzer(body.to_string(), false).await;

        let mut bridge = JsonRpcBridge::connect(addr, "analyze_block").await.unwrap();
        let err = bridge.analyze_block(b"raw block").await.unwrap_err();
        assert!(matches!(err, Error::Analyzer(m) if m == "bad block"));
    }

    #[tokio::test]
    async fn mismatched_id_rejected() {
        let body = r#"{"jsonrpc":"2.0","id":9,"result":{"hash":"0x1","headerOffset":0,"headerLength":1,"coinbase":"0x2"}}"#;
        let addr = fake_analyzer(body.to_string(), false).await;

        let mut bridge = JsonRpcBridge::connect(addr, "analyze_block").await.unwrap();
        assert!(bridge.analyze_block(b"raw block").await.is_err());
    }
}
