// External Session Shims
//
// The miner talks to its full node through a channel pair: inbound
// BlockAccepted notifications, outbound proof submissions and block
// broadcasts. The wire/framing layer lives outside this crate; what the
// core needs is only the message contract and a way to (re)establish a
// session. The loopback connector wires the channels to an in-process
// chain store, which is how `spacetime-miner start` runs self-contained
// and how the integration tests close the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};

use crate::consensus::chain::{AcceptOutcome, ChainStore};
use crate::crypto::hash::Hash;
use crate::crypto::keys::PublicKey;
use crate::primitives::block::Block;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    BlockAccepted { height: u64, hash: Hash },
}

#[derive(Debug, Clone)]
pub enum OutboundMessage {
    ProofSubmission {
        proof: Vec<u8>,
        miner_id: PublicKey,
        epoch: u64,
    },
    BlockBroadcast {
        block: Vec<u8>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("session closed")]
    Closed,
}

/// One established session: the stream of chain events and the sink for
/// miner messages. Dropping either side ends the session.
pub struct Session {
    pub events: mpsc::Receiver<SessionEvent>,
    pub outbound: mpsc::Sender<OutboundMessage>,
}

pub trait NodeConnector: Send + Sync {
    fn connect(&self) -> impl Future<Output = Result<Session, SessionError>> + Send;
}

/// In-process "full node": broadcast blocks feed the local chain store,
/// acceptances flow back as BlockAccepted events. Proof submissions are
/// counted so operators (and tests) can observe them.
pub struct LoopbackConnector {
    chain: Arc<ChainStore>,
    pub submissions: Arc<AtomicU64>,
}

impl LoopbackConnector {
    pub fn new(chain: Arc<ChainStore>) -> Self {
        LoopbackConnector {
            chain,
            submissions: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl NodeConnector for LoopbackConnector {
    async fn connect(&self) -> Result<Session, SessionError> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel::<OutboundMessage>(64);
        let chain = self.chain.clone();
        let submissions = self.submissions.clone();

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    OutboundMessage::ProofSubmission { .. } => {
                        submissions.fetch_add(1, Ordering::Relaxed);
                    }
                    OutboundMessage::BlockBroadcast { block } => {
                        let Ok(block) = Block::from_bytes(&block) else {
                            eprintln!("[session] dropping undecodable block broadcast");
                            continue;
                        };
                        let height = block.header.height;
                        let hash = block.hash();
                        let accepted = {
                            let chain = chain.clone();
                            tokio::task::spawn_blocking(move || chain.accept_block(block)).await
                        };
                        match accepted {
                            Ok(Ok(AcceptOutcome::Connected))
                            | Ok(Ok(AcceptOutcome::Reorged { .. })) => {
                                if event_tx
                                    .send(SessionEvent::BlockAccepted { height, hash })
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => eprintln!("[session] block rejected: {e}"),
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Ok(Session {
            events: event_rx,
            outbound: out_tx,
        })
    }
}

/// Hands out pre-built sessions, one per connect call. Lets tests script
/// both sides of the wire and simulate connect failures.
pub struct ChannelConnector {
    sessions: Mutex<Vec<Session>>,
}

impl ChannelConnector {
    pub fn new(sessions: Vec<Session>) -> Self {
        ChannelConnector {
            sessions: Mutex::new(sessions),
        }
    }

    /// A connector plus the far ends of its single session.
    pub fn single() -> (
        Self,
        mpsc::Sender<SessionEvent>,
        mpsc::Receiver<OutboundMessage>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let session = Session {
            events: event_rx,
            outbound: out_tx,
        };
        (Self::new(vec![session]), event_tx, out_rx)
    }
}

impl NodeConnector for ChannelConnector {
    async fn connect(&self) -> Result<Session, SessionError> {
        self.sessions
            .lock()
            .await
            .pop()
            .ok_or_else(|| SessionError::ConnectFailed("no session available".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_connector_exhausts() {
        let (connector, _events, _outbound) = ChannelConnector::single();
        assert!(connector.connect().await.is_ok());
        assert!(matches!(
            connector.connect().await,
            Err(SessionError::ConnectFailed(_))
        ));
    }
}
