//! One outbound connection per peer.
//!
//! A link owns the socket to a single peer and drains that peer's send
//! queue. Connection outcomes feed the [`FailureDetector`]: a successful
//! connect marks the peer alive; a failed connect, a write failure or the
//! peer closing the connection marks it down. Whatever is queued when the
//! peer goes down is discarded, and the link keeps reconnecting with
//! exponential backoff. When the peer is seen alive again (typically because
//! it dialed us) the link reconnects at once and delivers anything queued
//! since.

use futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::codec::MessageCodec;
use crate::peers::{FailureDetector, PeerTable};
use crate::protocol::{Message, NodeId};

#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub max_frame_length: usize,
}

/// Doubling reconnect delay, capped at `max`.
#[derive(Debug)]
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, current: min }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.min;
    }
}

enum LinkExit {
    Shutdown,
    Failed { unsent: Option<Message>, reason: String },
}

enum Pause {
    Elapsed,
    Revived,
    Shutdown,
}

type Writer = FramedWrite<OwnedWriteHalf, MessageCodec>;

pub(crate) struct Link {
    self_id: NodeId,
    peer: NodeId,
    addr: String,
    rx: mpsc::Receiver<Message>,
    peers: Arc<PeerTable>,
    detector: FailureDetector,
    revived: Arc<Notify>,
    settings: LinkSettings,
    cancel: CancellationToken,
}

impl Link {
    pub(crate) fn new(
        peer: NodeId,
        addr: String,
        rx: mpsc::Receiver<Message>,
        peers: Arc<PeerTable>,
        detector: FailureDetector,
        settings: LinkSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            self_id: peers.self_id(),
            peer,
            addr,
            rx,
            revived: detector.revival(peer),
            peers,
            detector,
            settings,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut backoff = Backoff::new(self.settings.backoff_min, self.settings.backoff_max);
        // A message whose write failed gets one more try on the next connection
        let mut resend: Option<Message> = None;
        // Set when this attempt was triggered by the peer coming back
        let mut after_revival = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let stream = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connect() => result,
            };

            let delay = match stream {
                Ok(stream) => {
                    self.detector.peer_up(self.peer);
                    let (reader, writer) = stream.into_split();
                    let writer = FramedWrite::new(writer, MessageCodec::new(self.settings.max_frame_length));
                    match self.serve(reader, writer, resend.take(), &mut backoff).await {
                        LinkExit::Shutdown => break,
                        LinkExit::Failed { unsent, reason } => {
                            debug!(node = self.self_id, peer = self.peer, "Link dropped: {}", reason);
                            self.detector.peer_down(self.peer, &reason);
                            // The queue and the failed message get one reconnect attempt
                            resend = unsent;
                            backoff.next_delay()
                        }
                    }
                }
                Err(reason) => {
                    self.detector.peer_down(self.peer, &reason);
                    // Messages queued after a revival were meant for the
                    // returning peer; keep them for one more attempt.
                    if !after_revival {
                        if resend.take().is_some() {
                            debug!(node = self.self_id, peer = self.peer, "Dropping unsent message");
                        }
                        self.discard_queued();
                    }
                    backoff.next_delay()
                }
            };

            after_revival = match self.pause(delay).await {
                Pause::Shutdown => break,
                Pause::Elapsed => false,
                Pause::Revived => true,
            };
        }
        trace!(node = self.self_id, peer = self.peer, "Link task stopped");
    }

    async fn connect(&self) -> Result<TcpStream, String> {
        match timeout(self.settings.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                info!(node = self.self_id, peer = self.peer, "Connected to {}", self.addr);
                Ok(stream)
            }
            Ok(Err(e)) => Err(format!("connect to {} failed: {}", self.addr, e)),
            Err(_) => Err(format!("connect to {} timed out", self.addr)),
        }
    }

    async fn serve(
        &mut self,
        mut reader: OwnedReadHalf,
        mut writer: Writer,
        first: Option<Message>,
        backoff: &mut Backoff,
    ) -> LinkExit {
        if let Some(message) = first {
            debug!(node = self.self_id, peer = self.peer, "Resending {} after reconnect", message.kind);
            if let Err(reason) = self.write(&mut writer, message).await {
                return LinkExit::Failed { unsent: None, reason };
            }
        }

        // Peers never write on this connection, so any read result is
        // either EOF or an error.
        let mut probe = [0u8; 64];
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return LinkExit::Shutdown,
                next = self.rx.recv() => match next {
                    Some(message) => message,
                    None => return LinkExit::Shutdown,
                },
                read = reader.read(&mut probe) => match read {
                    Ok(0) => {
                        return LinkExit::Failed {
                            unsent: None,
                            reason: "connection closed by peer".to_string(),
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => return LinkExit::Failed { unsent: None, reason: e.to_string() },
                },
            };

            let retry = message.clone();
            if let Err(reason) = self.write(&mut writer, message).await {
                return LinkExit::Failed {
                    unsent: Some(retry),
                    reason,
                };
            }
            backoff.reset();
        }
    }

    async fn write(&self, writer: &mut Writer, message: Message) -> Result<(), String> {
        let kind = message.kind;
        match timeout(self.settings.write_timeout, writer.send(message)).await {
            Ok(Ok(())) => {
                trace!(node = self.self_id, peer = self.peer, "Sent {}", kind);
                Ok(())
            }
            Ok(Err(e)) => Err(format!("write failed: {}", e)),
            Err(_) => Err("write timed out".to_string()),
        }
    }

    /// Drop everything queued for a peer that just went down.
    fn discard_queued(&mut self) {
        let mut dropped = 0usize;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(
                node = self.self_id,
                peer = self.peer,
                "Discarded {} queued messages for unreachable peer",
                dropped
            );
        }
    }

    /// Wait out a reconnect delay, cut short when the peer is marked alive
    /// again.
    async fn pause(&self, delay: Duration) -> Pause {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Pause::Shutdown,
                _ = &mut sleep => return Pause::Elapsed,
                // A permit left over from an earlier revival is ignored
                // unless the peer is actually alive now.
                _ = self.revived.notified() => {
                    if self.peers.is_alive(self.peer) {
                        debug!(node = self.self_id, peer = self.peer, "Peer is back, reconnecting");
                        return Pause::Revived;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_millis(1000));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![250, 500, 1000, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }
}
