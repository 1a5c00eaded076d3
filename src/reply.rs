//! Reply queue + writer.
//!
//! Handlers enqueue replies carrying the reply-identity preserved from
//! the originating request; a single writer task drains the queue and
//! writes onto the inbound ROUTER socket, preserving the "router socket
//! is single-threaded-writer" invariant while letting many concurrent
//! handler tasks produce replies.

use crate::message::Frames;
use crate::transport::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct OutgoingReply {
    pub connection_identity: Vec<u8>,
    pub frames: Frames,
}

#[derive(Clone)]
pub struct ReplyQueue {
    tx: mpsc::UnboundedSender<OutgoingReply>,
}

impl ReplyQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutgoingReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReplyQueue { tx }, rx)
    }

    pub fn enqueue(&self, connection_identity: Vec<u8>, frames: Frames) {
        if self.tx.send(OutgoingReply { connection_identity, frames }).is_err() {
            tracing::warn!("reply queue writer has shut down, dropping reply");
        }
    }
}

/// Drains the queue every 100 ms and writes each pending
/// reply onto the router socket.
pub async fn writer_loop(
    router: Arc<Router>,
    mut rx: mpsc::UnboundedReceiver<OutgoingReply>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("reply writer loop cancelled");
                return;
            }
            _ = tick.tick() => {
                while let Ok(reply) = rx.try_recv() {
                    if let Err(e) = router.enqueue_reply(reply.connection_identity, reply.frames) {
                        tracing::warn!("failed to write reply: {e}");
                    }
                }
            }
        }
    }
}
