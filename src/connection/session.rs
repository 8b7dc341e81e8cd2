use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::config::{Config, Limits};
use crate::connection::{ChunkQueue, Role};
use crate::error::{Error, Result};
use crate::protocol::frame::{CLOSE_FRAME, FrameDecoder, encode_into};

const TRAFFIC: &str = "wsrelay::traffic";

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// The first terminal condition observed.
    pub reason: Error,
    /// Payload bytes written to the target.
    pub client_to_target: u64,
    /// Raw bytes read from the target.
    pub target_to_client: u64,
}

impl SessionReport {
    /// Whether the session ended by a peer closing rather than a failure.
    #[must_use]
    pub const fn is_orderly(&self) -> bool {
        self.reason.is_orderly()
    }
}

enum ClientInput {
    Data,
    Close,
}

/// First terminal condition plus which sockets are still worth writing to.
struct Terminal {
    reason: Error,
    client_open: bool,
    target_open: bool,
}

impl Terminal {
    fn client_gone(reason: Error) -> Self {
        Self {
            reason,
            client_open: false,
            target_open: true,
        }
    }

    fn target_gone(reason: Error) -> Self {
        Self {
            reason,
            client_open: true,
            target_open: false,
        }
    }

    fn both_open(reason: Error) -> Self {
        Self {
            reason,
            client_open: true,
            target_open: true,
        }
    }
}

fn socket_error(role: Role, err: &std::io::Error) -> Error {
    Error::SocketException(format!("{}: {}", role, err))
}

/// Queues and codec state of one session, independent of the sockets.
#[derive(Debug)]
struct Relay {
    decoder: FrameDecoder,
    /// Decoded client payloads bound for the target.
    target_queue: ChunkQueue,
    /// Raw target reads not yet encoded for the client.
    client_queue: ChunkQueue,
    /// Encoded frames a previous client write did not finish.
    pending: BytesMut,
    limits: Limits,
    client_to_target: u64,
    target_to_client: u64,
}

impl Relay {
    fn new(config: &Config) -> Self {
        Self {
            decoder: FrameDecoder::new()
                .with_legacy_partial_sentinel(config.legacy_partial_sentinel)
                .with_max_carry(config.limits.max_carry_size),
            target_queue: ChunkQueue::new(),
            client_queue: ChunkQueue::new(),
            pending: BytesMut::new(),
            limits: config.limits.clone(),
            client_to_target: 0,
            target_to_client: 0,
        }
    }

    /// Decode client bytes into the target queue.
    ///
    /// Payloads that precede a bad frame in the same read are queued before
    /// the error is returned.
    fn on_client_data(&mut self, data: &[u8]) -> Result<ClientInput> {
        let mut payloads = Vec::new();
        let pushed = self.decoder.push_into(data, &mut payloads);
        for payload in payloads {
            if payload.is_empty() {
                continue;
            }
            tracing::trace!(target: TRAFFIC, bytes = payload.len(), "client frame");
            self.target_queue.push(payload);
        }
        if pushed? {
            return Ok(ClientInput::Close);
        }
        if !self.decoder.carry().is_empty() {
            tracing::trace!(target: TRAFFIC, carried = self.decoder.carry().len(), "partial client frame");
        }
        Ok(ClientInput::Data)
    }

    fn on_target_data(&mut self, data: Bytes) {
        tracing::trace!(target: TRAFFIC, bytes = data.len(), "target recv");
        self.target_to_client += data.len() as u64;
        self.client_queue.push(data);
    }

    /// Encode queued target data, unless an earlier write is unfinished.
    fn stage_client_write(&mut self) {
        if !self.pending.is_empty() {
            return;
        }
        for payload in self.client_queue.drain() {
            encode_into(&payload, &mut self.pending);
        }
    }

    fn pending_client_write(&self) -> bool {
        !self.pending.is_empty()
    }

    fn client_wrote(&mut self, n: usize) {
        if n < self.pending.len() {
            tracing::trace!(target: TRAFFIC, sent = n, left = self.pending.len() - n, "short client write");
        }
        self.pending.advance(n);
    }

    fn target_wrote(&mut self, n: usize, offered: usize) {
        if n < offered {
            tracing::trace!(target: TRAFFIC, sent = n, left = offered - n, "short target write");
        }
        self.target_queue.consume(n);
        self.client_to_target += n as u64;
    }

    fn read_client_paused(&self) -> bool {
        self.limits.is_saturated(self.target_queue.bytes())
    }

    fn read_target_paused(&self) -> bool {
        self.limits
            .is_saturated(self.client_queue.bytes() + self.pending.len())
    }
}

/// Relays one client connection to one target connection.
///
/// Client bytes are decoded into payloads and written to the target in
/// arrival order; target bytes are encoded as frames for the client. The
/// session owns both streams, so [`ProxySession::run`] closes each of them
/// exactly once whatever ends it.
///
/// Both queues are bounded by [`Limits::max_queued_bytes`]: once a queue is
/// saturated, reads from the side feeding it pause until it drains.
pub struct ProxySession<C, T> {
    client: C,
    target: T,
    relay: Relay,
    leftover: Bytes,
    read_buffer_size: usize,
    close_timeout: Duration,
}

impl<C, T> ProxySession<C, T> {
    /// Create a session over an upgraded client stream and a connected target.
    pub fn new(client: C, target: T, config: &Config) -> Self {
        Self {
            client,
            target,
            relay: Relay::new(config),
            leftover: Bytes::new(),
            read_buffer_size: config.read_buffer_size.max(1),
            close_timeout: config.timeouts.close,
        }
    }

    /// Client bytes received together with the handshake.
    ///
    /// They are decoded before the first read from the client.
    #[must_use]
    pub fn with_leftover(mut self, leftover: Bytes) -> Self {
        self.leftover = leftover;
        self
    }
}

impl<C, T> ProxySession<C, T>
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Relay until either side terminates, then close both connections.
    ///
    /// On every ending except a vanished client, a close frame is sent to
    /// the client after any queued frames. Payloads the client sent before
    /// closing are still written to the target. The final flush is bounded
    /// by `timeouts.close`.
    pub async fn run(self) -> SessionReport {
        let ProxySession {
            client,
            target,
            mut relay,
            leftover,
            read_buffer_size,
            close_timeout,
        } = self;

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut target_rd, mut target_wr) = tokio::io::split(target);

        let terminal = match relay.on_client_data(&leftover) {
            Ok(ClientInput::Data) => {
                pump(
                    &mut relay,
                    &mut client_rd,
                    &mut client_wr,
                    &mut target_rd,
                    &mut target_wr,
                    read_buffer_size,
                )
                .await
            }
            Ok(ClientInput::Close) => Terminal::both_open(Error::ClientClosed),
            Err(e) => Terminal::both_open(e),
        };

        tracing::debug!(reason = %terminal.reason, "session closing");

        let flush = finish(&mut relay, &mut client_wr, &mut target_wr, &terminal);
        match tokio::time::timeout(close_timeout, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "final flush failed"),
            Err(_) => tracing::debug!("final flush timed out"),
        }

        drop((client_rd, client_wr, target_rd, target_wr));

        SessionReport {
            reason: terminal.reason,
            client_to_target: relay.client_to_target,
            target_to_client: relay.target_to_client,
        }
    }
}

/// The relay loop. Returns on the first terminal condition.
async fn pump<C, T>(
    relay: &mut Relay,
    client_rd: &mut ReadHalf<C>,
    client_wr: &mut WriteHalf<C>,
    target_rd: &mut ReadHalf<T>,
    target_wr: &mut WriteHalf<T>,
    read_buffer_size: usize,
) -> Terminal
where
    C: AsyncRead + AsyncWrite,
    T: AsyncRead + AsyncWrite,
{
    let mut client_buf = vec![0u8; read_buffer_size];
    let mut target_buf = BytesMut::with_capacity(read_buffer_size);

    loop {
        relay.stage_client_write();
        target_buf.reserve(read_buffer_size);
        let target_head = relay.target_queue.front().cloned().unwrap_or_default();

        tokio::select! {
            res = client_rd.read(&mut client_buf), if !relay.read_client_paused() => match res {
                Ok(0) => return Terminal::client_gone(Error::ClientClosed),
                Ok(n) => {
                    tracing::trace!(target: TRAFFIC, bytes = n, "client recv");
                    match relay.on_client_data(&client_buf[..n]) {
                        Ok(ClientInput::Data) => {}
                        Ok(ClientInput::Close) => return Terminal::both_open(Error::ClientClosed),
                        Err(e) => return Terminal::both_open(e),
                    }
                }
                Err(e) => return Terminal::client_gone(socket_error(Role::Client, &e)),
            },
            res = target_rd.read_buf(&mut target_buf), if !relay.read_target_paused() => match res {
                Ok(0) => return Terminal::target_gone(Error::TargetClosed),
                Ok(_) => relay.on_target_data(target_buf.split().freeze()),
                Err(e) => return Terminal::target_gone(socket_error(Role::Target, &e)),
            },
            res = target_wr.write(&target_head), if !target_head.is_empty() => match res {
                Ok(0) => return Terminal::target_gone(Error::SocketException("target: write returned zero".into())),
                Ok(n) => {
                    relay.target_wrote(n, target_head.len());
                    if let Err(e) = target_wr.flush().await {
                        return Terminal::target_gone(socket_error(Role::Target, &e));
                    }
                }
                Err(e) => return Terminal::target_gone(socket_error(Role::Target, &e)),
            },
            res = client_wr.write(&relay.pending), if relay.pending_client_write() => match res {
                Ok(0) => return Terminal::client_gone(Error::SocketException("client: write returned zero".into())),
                Ok(n) => {
                    tracing::trace!(target: TRAFFIC, bytes = n, "client send");
                    relay.client_wrote(n);
                    if let Err(e) = client_wr.flush().await {
                        return Terminal::client_gone(socket_error(Role::Client, &e));
                    }
                }
                Err(e) => return Terminal::client_gone(socket_error(Role::Client, &e)),
            },
            else => return Terminal::both_open(Error::SocketException("relay stalled".into())),
        }
    }
}

/// Best-effort drain of both directions, the close frame, and shutdown.
async fn finish<C, T>(
    relay: &mut Relay,
    client_wr: &mut WriteHalf<C>,
    target_wr: &mut WriteHalf<T>,
    terminal: &Terminal,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite,
    T: AsyncRead + AsyncWrite,
{
    if terminal.target_open {
        while let Some(head) = relay.target_queue.front().cloned() {
            let n = target_wr.write(&head).await?;
            if n == 0 {
                break;
            }
            relay.target_wrote(n, head.len());
        }
        target_wr.flush().await?;
    }
    let _ = target_wr.shutdown().await;

    if terminal.client_open {
        relay.stage_client_write();
        let mut tail = std::mem::take(&mut relay.pending);
        for payload in relay.client_queue.drain() {
            encode_into(&payload, &mut tail);
        }
        tail.extend_from_slice(&CLOSE_FRAME);
        client_wr.write_all(&tail).await?;
        client_wr.flush().await?;
        tracing::trace!(target: TRAFFIC, "close frame sent");
    }
    client_wr.shutdown().await
}
