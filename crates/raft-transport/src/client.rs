//! # client
//!
//! why: every peer call needs the same story: connect lazily, time out,
//!      retry with backoff, and never surface a transport error to the core
//! relations: runtime.rs keeps one of these per peer; wire.rs frames the
//!            bytes; discovery.rs supplies the address on each reconnect
//! what: RpcClient with a cached connection and the call() retry loop

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use raft_core::{NodeId, RaftMessage};

use crate::discovery::Discovery;
use crate::wire;
use crate::TransportError;

/// how long a single request/response exchange may take
const CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// attempts per call, each on a fresh connection
const CALL_ATTEMPTS: u32 = 3;
/// backoff before the second attempt, doubling per retry
const BACKOFF_BASE: Duration = Duration::from_millis(100);

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// a request/response channel to one peer
///
/// connections are opened on first use and dropped on any failure; the next
/// call re-resolves the address and reconnects. call() itself is total: when
/// every attempt fails it hands back the neutral negative reply, which the
/// core discards as stale.
pub struct RpcClient {
    target: NodeId,
    discovery: Arc<dyn Discovery>,
    connection: Option<Connection>,
    next_id: u64,
}

impl RpcClient {
    pub fn new(target: NodeId, discovery: Arc<dyn Discovery>) -> Self {
        Self {
            target,
            discovery,
            connection: None,
            next_id: 0,
        }
    }

    /// send `message` and wait for the peer's reply
    pub async fn call(&mut self, message: &RaftMessage) -> RaftMessage {
        for attempt in 0..CALL_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }
            match timeout(CALL_TIMEOUT, self.try_call(message)).await {
                Ok(Ok(reply)) => return reply,
                Ok(Err(err)) => {
                    debug!(target = self.target, attempt, %err, "rpc attempt failed");
                    self.connection = None;
                }
                Err(_) => {
                    debug!(target = self.target, attempt, "rpc attempt timed out");
                    self.connection = None;
                }
            }
        }
        warn!(
            target = self.target,
            method = wire::method_name(message),
            "peer unreachable, returning neutral reply"
        );
        wire::neutral_reply(self.target, message)
    }

    async fn try_call(&mut self, message: &RaftMessage) -> Result<RaftMessage, TransportError> {
        let connection = match self.connection.take() {
            Some(open) => self.connection.insert(open),
            None => {
                let addr = self
                    .discovery
                    .resolve(self.target)
                    .ok_or(TransportError::UnknownPeer(self.target))?;
                let (read, write) = TcpStream::connect(addr).await?.into_split();
                self.connection.insert(Connection {
                    reader: BufReader::new(read),
                    writer: write,
                })
            }
        };

        let id = self.next_id;
        self.next_id += 1;
        let line = wire::encode_request(id, message)?;
        connection.writer.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        if connection.reader.read_line(&mut reply).await? == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        wire::decode_response(reply.trim_end(), id)
    }
}
