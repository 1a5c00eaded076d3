//! Transport: one inbound ROUTER socket plus a keyed map of outbound
//! DEALER sockets, one per peer.
//!
//! ZeroMQ sockets may only be touched from the thread that created them.
//! Rather than fighting that constraint, each socket gets a dedicated OS
//! thread running a small event loop (poll for inbound traffic, drain a
//! command queue for outbound sends) and is bridged into async Rust with
//! channels — a dedicated thread plus a channel bridge, the same shape
//! used to run ROUTER/DEALER sockets from an async control loop.

use crate::error::PeerError;
use crate::message::Frames;
use crate::peer::Peer;
use crate::registry::OutboundSocketHandle;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

enum RouterCmd {
    Reply(Frames),
    Shutdown,
}

/// The inbound multiplexed socket.
pub struct Router {
    cmd_tx: std::sync::mpsc::Sender<RouterCmd>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frames>>,
    port: u16,
    _thread: Option<std::thread::JoinHandle<()>>,
}

impl Router {
    /// Bind to `port` (0 = let the OS choose) and start the background
    /// poll loop. Returns the router plus the actual bound port.
    pub fn bind(ctx: &zmq::Context, port: u16) -> Result<Self, PeerError> {
        let socket = ctx.socket(zmq::ROUTER).map_err(zmq_io_err)?;
        let endpoint = format!("tcp://0.0.0.0:{port}");
        socket.bind(&endpoint).map_err(zmq_io_err)?;
        let bound = socket.get_last_endpoint().map_err(zmq_io_err)?.map_err(|_| {
            PeerError::Io(std::io::Error::other("non-utf8 bound endpoint"))
        })?;
        let bound_port: u16 = bound
            .rsplit(':')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PeerError::Io(std::io::Error::other("could not parse bound port")))?;

        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<RouterCmd>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name("swarm-router".into())
            .spawn(move || router_loop(socket, cmd_rx, inbound_tx))
            .map_err(|e| PeerError::Io(std::io::Error::other(e.to_string())))?;

        tracing::info!(port = bound_port, "Router socket bound");

        Ok(Router {
            cmd_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            port: bound_port,
            _thread: Some(thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Receive the next inbound frame set, polling with a 100 ms
    /// granularity so callers can observe cancellation promptly. Returns
    /// `None` on timeout (caller loops).
    pub async fn recv_frames(&self) -> Option<Frames> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.ok().flatten()
    }

    /// Route a reply back through the ROUTER, prefixed with the
    /// connection identity the triggering request carried.
    pub fn enqueue_reply(&self, connection_identity: Vec<u8>, mut frames: Frames) -> Result<(), PeerError> {
        let mut out = Vec::with_capacity(frames.len() + 1);
        out.push(connection_identity);
        out.append(&mut frames);
        self.cmd_tx
            .send(RouterCmd::Reply(out))
            .map_err(|_| PeerError::Io(std::io::Error::other("router thread gone")))
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(RouterCmd::Shutdown);
    }
}

fn router_loop(socket: zmq::Socket, cmd_rx: std::sync::mpsc::Receiver<RouterCmd>, inbound_tx: mpsc::UnboundedSender<Frames>) {
    loop {
        let mut items = [socket.as_poll_item(zmq::POLLIN)];
        if zmq::poll(&mut items, 100).is_ok() && items[0].is_readable() {
            match socket.recv_multipart(0) {
                Ok(frames) => {
                    if inbound_tx.send(frames).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("router recv error: {e}"),
            }
        }
        loop {
            match cmd_rx.try_recv() {
                Ok(RouterCmd::Reply(frames)) => {
                    if let Err(e) = socket.send_multipart(frames, 0) {
                        tracing::warn!("router send error: {e}");
                    }
                }
                Ok(RouterCmd::Shutdown) => return,
                Err(std::sync::mpsc::TryRecvError::Empty) => break,
                Err(std::sync::mpsc::TryRecvError::Disconnected) => return,
            }
        }
    }
}

enum DealerCmd {
    Send(Frames, oneshot::Sender<Result<(), PeerError>>),
    Recv { timeout_ms: i64, reply: oneshot::Sender<Result<Frames, PeerError>> },
    Shutdown,
}

/// An outbound socket to one peer.
pub struct Dealer {
    cmd_tx: std::sync::mpsc::Sender<DealerCmd>,
    _thread: Option<std::thread::JoinHandle<()>>,
}

impl Dealer {
    /// Create and connect a DEALER socket to `endpoint`, with `identity`
    /// set as its ZeroMQ routing id so the remote ROUTER can address
    /// replies back to us.
    pub fn connect(ctx: &zmq::Context, endpoint: &str, identity: &[u8]) -> Result<Self, PeerError> {
        let socket = ctx.socket(zmq::DEALER).map_err(zmq_io_err)?;
        socket.set_identity(identity).map_err(zmq_io_err)?;
        socket.connect(endpoint).map_err(zmq_io_err)?;

        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<DealerCmd>();
        let thread = std::thread::Builder::new()
            .name("swarm-dealer".into())
            .spawn(move || dealer_loop(socket, cmd_rx))
            .map_err(|e| PeerError::Io(std::io::Error::other(e.to_string())))?;

        Ok(Dealer { cmd_tx, _thread: Some(thread) })
    }

    pub async fn send(&self, frames: Frames) -> Result<(), PeerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(DealerCmd::Send(frames, tx))
            .map_err(|_| PeerError::Io(std::io::Error::other("dealer thread gone")))?;
        rx.await.map_err(|_| PeerError::Io(std::io::Error::other("dealer thread gone")))?
    }

    pub async fn send_timeout(&self, frames: Frames, timeout: Duration) -> Result<(), PeerError> {
        tokio::time::timeout(timeout, self.send(frames)).await.map_err(|_| PeerError::Timeout)?
    }

    pub async fn recv(&self, timeout: Duration) -> Result<Frames, PeerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(DealerCmd::Recv { timeout_ms: timeout.as_millis() as i64, reply: tx })
            .map_err(|_| PeerError::Io(std::io::Error::other("dealer thread gone")))?;
        rx.await.map_err(|_| PeerError::Io(std::io::Error::other("dealer thread gone")))?
    }
}

#[async_trait::async_trait]
impl OutboundSocketHandle for Dealer {
    fn close(&self) {
        let _ = self.cmd_tx.send(DealerCmd::Shutdown);
    }

    async fn send(&self, frames: Frames, timeout: Duration) -> Result<(), PeerError> {
        self.send_timeout(frames, timeout).await
    }

    async fn recv(&self, timeout: Duration) -> Result<Frames, PeerError> {
        Dealer::recv(self, timeout).await
    }
}

fn dealer_loop(socket: zmq::Socket, cmd_rx: std::sync::mpsc::Receiver<DealerCmd>) {
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            DealerCmd::Send(frames, reply) => {
                let result = socket.send_multipart(frames, 0).map_err(zmq_io_err);
                let _ = reply.send(result);
            }
            DealerCmd::Recv { timeout_ms, reply } => {
                let result = recv_with_timeout(&socket, timeout_ms);
                let _ = reply.send(result);
            }
            DealerCmd::Shutdown => return,
        }
    }
}

fn recv_with_timeout(socket: &zmq::Socket, timeout_ms: i64) -> Result<Frames, PeerError> {
    let mut items = [socket.as_poll_item(zmq::POLLIN)];
    match zmq::poll(&mut items, timeout_ms) {
        Ok(n) if n > 0 && items[0].is_readable() => {
            socket.recv_multipart(0).map_err(zmq_io_err)
        }
        Ok(_) => Err(PeerError::Timeout),
        Err(e) => Err(zmq_io_err(e)),
    }
}

fn zmq_io_err(e: zmq::Error) -> PeerError {
    PeerError::Io(std::io::Error::other(e.to_string()))
}

/// The dial procedure: connect, Ping/Pong handshake, protocol-version
/// check. Disposes the socket on any failure path.
pub async fn dial(
    ctx: &zmq::Context,
    peer: &Peer,
    local_identity: &[u8],
    signing_key: &ed25519_dalek::SigningKey,
    local_protocol_version: i32,
    dial_timeout: Duration,
) -> Result<Dealer, PeerError> {
    use crate::message::{Message, MessageKind};

    let dealer = Dealer::connect(ctx, &peer.zmq_endpoint(), local_identity)?;

    let ping_frames = Message::encode(signing_key, b"", &MessageKind::Ping);
    if let Err(e) = dealer.send_timeout(ping_frames, dial_timeout).await {
        dealer.close();
        return Err(e);
    }

    let frames = match dealer.recv(dial_timeout).await {
        Ok(frames) => frames,
        Err(e) => {
            dealer.close();
            return Err(e);
        }
    };

    let message = match Message::parse(frames, true) {
        Ok(m) => m,
        Err(_) => {
            dealer.close();
            return Err(PeerError::Timeout);
        }
    };

    match message.kind {
        MessageKind::Pong { app_protocol_version } => {
            if app_protocol_version != local_protocol_version {
                dealer.close();
                return Err(PeerError::DifferentAppProtocolVersion {
                    local: local_protocol_version,
                    remote: app_protocol_version,
                });
            }
        }
        _ => {
            dealer.close();
            return Err(PeerError::Timeout);
        }
    }

    Ok(dealer)
}

pub fn socket_addr(peer: &Peer) -> SocketAddr {
    peer.endpoint()
}
