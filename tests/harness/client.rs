//! Hixie-76 client speaking to a relay over plain TCP.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use wsrelay::protocol::frame::{CLOSE_FRAME, encode};
use wsrelay::protocol::FrameDecoder;

pub const KEY1: &str = "4 @1  46546xW%0l 1 5";
pub const KEY2: &str = "12998 5 Y3 1  .P00";
pub const KEY3: &[u8; 8] = b"^n:ds[4U";
pub const EXPECTED_DIGEST: &[u8; 16] = b"8jKS'y:G*Co,Wxa-";

/// Build a Hixie-76 upgrade request offering `base64`.
pub fn upgrade_request(path: &str) -> Vec<u8> {
    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: relay.test\r\n\
         Upgrade: WebSocket\r\n\
         Connection: Upgrade\r\n\
         Origin: http://app.test\r\n\
         Sec-WebSocket-Protocol: base64\r\n\
         Sec-WebSocket-Key1: {}\r\n\
         Sec-WebSocket-Key2: {}\r\n\
         \r\n",
        path, KEY1, KEY2
    )
    .into_bytes();
    request.extend_from_slice(KEY3);
    request
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Test client wrapping any byte stream, usually a `TcpStream`.
pub struct TestClient<S = TcpStream> {
    stream: S,
    id: usize,
    decoder: FrameDecoder,
    inbox: VecDeque<Bytes>,
    response: String,
    closed: bool,
}

impl TestClient<TcpStream> {
    /// Connect and upgrade on path `/`.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        Self::connect_with_path(addr, "/", 0).await
    }

    /// Connect with an identifier for debugging.
    pub async fn connect_with_id(addr: SocketAddr, id: usize) -> io::Result<Self> {
        Self::connect_with_path(addr, &format!("/client/{}", id), id).await
    }

    /// Connect and upgrade on a specific path.
    pub async fn connect_with_path(addr: SocketAddr, path: &str, id: usize) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, path, id).await
    }
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Upgrade an already connected stream.
    pub async fn handshake(mut stream: S, path: &str, id: usize) -> io::Result<Self> {
        stream.write_all(&upgrade_request(path)).await?;
        Self::read_response(stream, id).await
    }

    /// Finish an upgrade whose request the caller already wrote.
    pub async fn from_upgraded(stream: S) -> io::Result<Self> {
        Self::read_response(stream, 0).await
    }

    async fn read_response(mut stream: S, id: usize) -> io::Result<Self> {
        let mut buf = BytesMut::with_capacity(1024);
        let head_len = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head_len = pos + 4;
                if buf.len() >= head_len + EXPECTED_DIGEST.len() {
                    break head_len;
                }
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(invalid(format!(
                    "connection closed during handshake after {} bytes",
                    buf.len()
                )));
            }
        };

        let response = String::from_utf8_lossy(&buf[..head_len]).into_owned();
        if !response.starts_with("HTTP/1.1 101") {
            return Err(invalid(format!("unexpected response: {:?}", response)));
        }
        buf.advance(head_len);
        let digest = buf.split_to(EXPECTED_DIGEST.len());
        if &digest[..] != EXPECTED_DIGEST {
            return Err(invalid(format!("wrong digest {:?}", digest)));
        }

        let mut client = Self {
            stream,
            id,
            decoder: FrameDecoder::new(),
            inbox: VecDeque::new(),
            response,
            closed: false,
        };
        if !buf.is_empty() {
            client.absorb(&buf)?;
        }
        Ok(client)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The response head, up to and including the blank line.
    pub fn response(&self) -> &str {
        &self.response
    }

    /// Whether the relay sent a close frame.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn absorb(&mut self, chunk: &[u8]) -> io::Result<()> {
        let frames = self
            .decoder
            .push(chunk)
            .map_err(|e| invalid(e.to_string()))?;
        self.inbox
            .extend(frames.payloads.into_iter().filter(|p| !p.is_empty()));
        if frames.closed {
            self.closed = true;
        }
        Ok(())
    }

    /// Send one payload as a base64 frame.
    pub async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.stream.write_all(&encode(payload)).await
    }

    pub async fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.send(text.as_bytes()).await
    }

    /// Write raw bytes, bypassing the framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    /// Next payload, or `None` once the relay closed.
    ///
    /// The relay forwards whatever each target read returned, so payload
    /// boundaries follow the target's TCP segments, not the sender's.
    pub async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            if let Some(payload) = self.inbox.pop_front() {
                return Ok(Some(payload));
            }
            if self.closed {
                return Ok(None);
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.absorb(&chunk[..n])?;
        }
    }

    /// Exactly `len` payload bytes, joined across frames.
    pub async fn recv_exact(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let Some(mut payload) = self.recv().await? else {
                return Err(io::ErrorKind::UnexpectedEof.into());
            };
            let wanted = len - out.len();
            if payload.len() > wanted {
                let rest = payload.split_off(wanted);
                self.inbox.push_front(rest);
            }
            out.extend_from_slice(&payload);
        }
        Ok(out)
    }

    /// Exactly `len` bytes of UTF-8 text.
    pub async fn recv_text(&mut self, len: usize) -> io::Result<String> {
        let bytes = self.recv_exact(len).await?;
        String::from_utf8(bytes).map_err(|e| invalid(e.to_string()))
    }

    /// Send a close frame and wait for the relay to hang up.
    ///
    /// Returns whether the relay answered with a close frame of its own.
    pub async fn close(mut self) -> io::Result<bool> {
        self.stream.write_all(&CLOSE_FRAME).await?;
        let mut rest = Vec::new();
        self.stream.read_to_end(&mut rest).await?;
        self.absorb(&rest)?;
        Ok(self.closed)
    }

    /// Read until EOF, returning the remaining payloads.
    pub async fn drain(mut self) -> io::Result<(Vec<Bytes>, bool)> {
        let mut rest = Vec::new();
        self.stream.read_to_end(&mut rest).await?;
        self.absorb(&rest)?;
        let closed = self.closed;
        Ok((self.inbox.into_iter().collect(), closed))
    }

    /// Drop the connection without a close frame.
    pub async fn abort(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
