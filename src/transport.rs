//! Outbound message channel between the consensus core and the (external)
//! network transport.

use std::net::SocketAddr;

use crate::palf::{PalfId, PalfRequest};
use crate::utils::PalfError;

use tokio::sync::mpsc;

/// One message a handle wants delivered to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMsg {
    /// Destination server address.
    pub dst: SocketAddr,

    /// Target partition on the destination.
    pub palf_id: PalfId,

    /// The message itself.
    pub req: PalfRequest,
}

/// Sender side of the outbound channel, shared by every handle of an env.
#[derive(Debug, Clone)]
pub struct Outbox {
    /// My server address, stamped as sender by the transport layer.
    me: SocketAddr,

    /// Sender side of the outbound channel.
    tx_send: mpsc::UnboundedSender<OutboundMsg>,
}

/// Receiver side of the outbound channel, drained by the transport layer.
#[derive(Debug)]
pub struct OutboxReceiver {
    /// Receiver side of the outbound channel.
    rx_send: mpsc::UnboundedReceiver<OutboundMsg>,
}

impl Outbox {
    /// Creates a new outbound channel pair.
    pub fn new_pair(me: SocketAddr) -> (Outbox, OutboxReceiver) {
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        (Outbox { me, tx_send }, OutboxReceiver { rx_send })
    }

    /// My server address.
    #[inline]
    pub fn me(&self) -> SocketAddr {
        self.me
    }

    /// Queues a message to a peer. Messages addressed to myself are a bug in
    /// the caller and get rejected.
    pub fn send_msg(
        &self,
        dst: SocketAddr,
        palf_id: PalfId,
        req: PalfRequest,
    ) -> Result<(), PalfError> {
        if dst == self.me {
            return logged_err!(
                "palf {} sending {} to myself",
                palf_id,
                req.name()
            );
        }
        self.tx_send.send(OutboundMsg { dst, palf_id, req })?;
        Ok(())
    }

    /// Queues a copy of a message to every given peer except myself.
    pub fn bcast_msg<'a>(
        &self,
        dsts: impl IntoIterator<Item = &'a SocketAddr>,
        palf_id: PalfId,
        req: PalfRequest,
    ) -> Result<(), PalfError> {
        for &dst in dsts {
            if dst != self.me {
                self.send_msg(dst, palf_id, req.clone())?;
            }
        }
        Ok(())
    }
}

impl OutboxReceiver {
    /// Waits for the next outbound message. Returns `None` once every sender
    /// has been dropped.
    pub async fn recv_msg(&mut self) -> Option<OutboundMsg> {
        self.rx_send.recv().await
    }

    /// Takes the next outbound message if one is ready.
    pub fn try_recv_msg(&mut self) -> Option<OutboundMsg> {
        self.rx_send.try_recv().ok()
    }

    /// Takes every currently queued outbound message.
    pub fn drain(&mut self) -> Vec<OutboundMsg> {
        let mut msgs = Vec::new();
        while let Some(msg) = self.try_recv_msg() {
            msgs.push(msg);
        }
        msgs
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use crate::palf::LogPrepareReq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_and_bcast() -> Result<(), PalfError> {
        let me: SocketAddr = "127.0.0.1:7001".parse()?;
        let p1: SocketAddr = "127.0.0.1:7002".parse()?;
        let p2: SocketAddr = "127.0.0.1:7003".parse()?;
        let (outbox, mut rx) = Outbox::new_pair(me);
        let req = PalfRequest::Prepare(LogPrepareReq { log_proposal_id: 3 });

        assert!(outbox.send_msg(me, 1, req.clone()).is_err());
        outbox.bcast_msg(&[me, p1, p2], 1, req.clone())?;
        let first = rx.recv_msg().await.expect("queued message");
        assert_eq!(first.dst, p1);
        let rest = rx.drain();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].dst, p2);
        assert_eq!(rest[0].req, req);
        Ok(())
    }
}
