//! # runtime
//!
//! why: raft-core only answers "given this message, what happens"; someone
//!      has to own the node, run its clocks and carry out its actions
//! relations: one NodeWorker per hosted node owns a RaftNode and a Storage;
//!            listeners feed it from tcp via wire.rs, RpcClient carries its
//!            outbound calls, NodeHandle is the in-process control surface
//! what: NodeConfig, ClusterRuntime start/stop lifecycle, the worker event
//!       loop with randomized election timer and heartbeat interval
//!
//! the worker is deliberately single-threaded over its node: every message,
//! timeout and client request funnels through one mpsc inbox, so the core
//! sees the same one-at-a-time world the simulator gives it. outbound rpcs
//! run on spawned tasks and feed their replies back through the same inbox.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use raft_core::{
    LogEntry, LogIndex, NodeId, RaftAction, RaftMessage, RaftNode, RaftOptions, RaftRole, Term,
};
use raft_storage::{load_into, Snapshot, Storage, StorageError};

use crate::client::RpcClient;
use crate::discovery::{Discovery, StaticDiscovery};
use crate::wire;
use crate::TransportError;

const INBOX_DEPTH: usize = 256;

/// identity and tunables for one hosted node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    /// address to listen on; port 0 picks a free port and discovery learns
    /// the bound address
    pub listen_addr: SocketAddr,
    pub options: RaftOptions,
}

impl NodeConfig {
    pub fn new(id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            id,
            listen_addr,
            options: RaftOptions::default(),
        }
    }
}

/// a point-in-time view of one node, answered by its worker
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    /// command payloads handed to the state machine, in apply order
    pub applied_commands: Vec<Vec<u8>>,
}

enum WorkerRequest {
    Message {
        message: RaftMessage,
        reply: Option<oneshot::Sender<RaftMessage>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Compact {
        up_to: LogIndex,
        data: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// the in-process control surface for one running node
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    inbox: mpsc::Sender<WorkerRequest>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// feed a raw message to the node, exactly like the network would
    pub async fn deliver(&self, message: RaftMessage) -> Result<(), TransportError> {
        self.inbox
            .send(WorkerRequest::Message {
                message,
                reply: None,
            })
            .await
            .map_err(|_| TransportError::WorkerClosed)
    }

    /// hand a client command to the node; dropped unless it currently leads
    pub async fn submit(&self, command: Vec<u8>) -> Result<(), TransportError> {
        self.deliver(RaftMessage::ClientCommand { command }).await
    }

    /// force an election round without waiting for the timer
    pub async fn trigger_election(&self) -> Result<(), TransportError> {
        self.deliver(RaftMessage::ElectionTimeout).await
    }

    pub async fn add_node(&self, node_id: NodeId) -> Result<(), TransportError> {
        self.deliver(RaftMessage::AddNode { node_id }).await
    }

    pub async fn remove_node(&self, node_id: NodeId) -> Result<(), TransportError> {
        self.deliver(RaftMessage::RemoveNode { node_id }).await
    }

    /// fold the committed log prefix up to `up_to` into a snapshot
    pub async fn compact(&self, up_to: LogIndex, data: Vec<u8>) -> Result<bool, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(WorkerRequest::Compact {
                up_to,
                data,
                reply: tx,
            })
            .await
            .map_err(|_| TransportError::WorkerClosed)?;
        rx.await.map_err(|_| TransportError::WorkerClosed)
    }

    pub async fn status(&self) -> Result<NodeStatus, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(WorkerRequest::Status { reply: tx })
            .await
            .map_err(|_| TransportError::WorkerClosed)?;
        rx.await.map_err(|_| TransportError::WorkerClosed)
    }

    async fn shutdown(&self) {
        let _ = self.inbox.send(WorkerRequest::Shutdown).await;
    }
}

/// a set of locally hosted nodes with their listeners and workers
pub struct ClusterRuntime {
    handles: HashMap<NodeId, NodeHandle>,
    addresses: HashMap<NodeId, SocketAddr>,
    workers: HashMap<NodeId, JoinHandle<()>>,
    listeners: HashMap<NodeId, JoinHandle<()>>,
}

impl ClusterRuntime {
    /// bind, recover and start every configured node
    ///
    /// all listeners bind before any worker starts, so discovery hands out
    /// the real (possibly ephemeral) addresses and no node races a peer that
    /// has not bound yet.
    pub async fn start<S, F>(
        configs: Vec<NodeConfig>,
        make_storage: F,
    ) -> Result<Self, TransportError>
    where
        S: Storage + Send + 'static,
        F: Fn(NodeId) -> Result<S, StorageError>,
    {
        let members: Vec<NodeId> = configs.iter().map(|c| c.id).collect();

        let mut bound = Vec::new();
        let mut addresses = HashMap::new();
        for config in &configs {
            let listener = TcpListener::bind(config.listen_addr).await?;
            addresses.insert(config.id, listener.local_addr()?);
            bound.push(listener);
        }
        let discovery: Arc<dyn Discovery> = Arc::new(StaticDiscovery::new(addresses.clone()));

        let mut handles = HashMap::new();
        let mut workers = HashMap::new();
        let mut listeners = HashMap::new();
        for (config, listener) in configs.into_iter().zip(bound) {
            let storage = make_storage(config.id)?;
            let mut node = RaftNode::with_options(config.id, members.clone(), config.options);
            load_into(&storage, &mut node)?;

            let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_DEPTH);
            let worker = NodeWorker {
                last_snapshot_index: node.log.snapshot_index(),
                node,
                storage,
                discovery: discovery.clone(),
                clients: HashMap::new(),
                inbox: inbox_rx,
                inbox_tx: inbox_tx.clone(),
                applied: Vec::new(),
                election_deadline: Instant::now(),
            };
            workers.insert(config.id, tokio::spawn(worker.run()));
            listeners.insert(config.id, tokio::spawn(serve(listener, inbox_tx.clone())));
            handles.insert(
                config.id,
                NodeHandle {
                    id: config.id,
                    inbox: inbox_tx,
                },
            );
        }
        info!(nodes = handles.len(), "cluster started");
        Ok(Self {
            handles,
            addresses,
            workers,
            listeners,
        })
    }

    pub fn handle(&self, id: NodeId) -> Option<&NodeHandle> {
        self.handles.get(&id)
    }

    pub fn address(&self, id: NodeId) -> Option<SocketAddr> {
        self.addresses.get(&id).copied()
    }

    /// stop one node: worker first, then its listener; peers see it as dead
    pub async fn stop_node(&mut self, id: NodeId) -> bool {
        let Some(handle) = self.handles.remove(&id) else {
            return false;
        };
        handle.shutdown().await;
        if let Some(worker) = self.workers.remove(&id) {
            let _ = worker.await;
        }
        if let Some(listener) = self.listeners.remove(&id) {
            listener.abort();
        }
        info!(node = id, "node stopped");
        true
    }

    /// stop every node, workers before listeners
    pub async fn stop(mut self) {
        let ids: Vec<NodeId> = self.handles.keys().copied().collect();
        for id in ids {
            self.stop_node(id).await;
        }
        info!("cluster stopped");
    }
}

/// accept loop for one node's listener
async fn serve(listener: TcpListener, inbox: mpsc::Sender<WorkerRequest>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let inbox = inbox.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, inbox).await {
                        debug!(%peer, %err, "connection ended");
                    }
                });
            }
            Err(err) => warn!(%err, "accept failed"),
        }
    }
}

/// serve one inbound connection: a request line in, a response line out
async fn handle_connection(
    stream: TcpStream,
    inbox: mpsc::Sender<WorkerRequest>,
) -> Result<(), TransportError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let request = wire::decode_request(&line)?;
        let (tx, rx) = oneshot::channel();
        inbox
            .send(WorkerRequest::Message {
                message: request.params,
                reply: Some(tx),
            })
            .await
            .map_err(|_| TransportError::WorkerClosed)?;
        let result = rx.await.map_err(|_| TransportError::WorkerClosed)?;
        let line = wire::encode_response(request.id, &result)?;
        write.write_all(line.as_bytes()).await?;
    }
    Ok(())
}

/// owns one RaftNode: the event loop, its timers and its action execution
struct NodeWorker<S> {
    node: RaftNode,
    storage: S,
    discovery: Arc<dyn Discovery>,
    clients: HashMap<NodeId, Arc<Mutex<RpcClient>>>,
    inbox: mpsc::Receiver<WorkerRequest>,
    inbox_tx: mpsc::Sender<WorkerRequest>,
    applied: Vec<LogEntry>,
    election_deadline: Instant,
    last_snapshot_index: LogIndex,
}

impl<S: Storage + Send + 'static> NodeWorker<S> {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(Duration::from_millis(
            self.node.options.heartbeat_interval,
        ));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.reset_election_deadline();
        info!(node = self.node.id, "worker started");

        loop {
            let election = tokio::time::sleep_until(self.election_deadline);
            tokio::select! {
                request = self.inbox.recv() => match request {
                    Some(WorkerRequest::Message { message, reply }) => {
                        self.step(message, reply);
                    }
                    Some(WorkerRequest::Status { reply }) => {
                        let _ = reply.send(self.status());
                    }
                    Some(WorkerRequest::Compact { up_to, data, reply }) => {
                        let _ = reply.send(self.compact(up_to, data));
                    }
                    Some(WorkerRequest::Shutdown) | None => break,
                },
                _ = election => {
                    self.reset_election_deadline();
                    self.step(RaftMessage::ElectionTimeout, None);
                }
                _ = heartbeat.tick() => {
                    self.step(RaftMessage::HeartbeatTimeout, None);
                }
            }
        }
        info!(node = self.node.id, "worker stopped");
    }

    /// run one message through the core and carry out what it asked for
    fn step(&mut self, message: RaftMessage, mut reply: Option<oneshot::Sender<RaftMessage>>) {
        let origin = wire::origin(&message);
        let fallback = reply
            .as_ref()
            .map(|_| wire::neutral_reply(self.node.id, &message));

        let actions = self.node.handle(message);
        if let Err(err) = self.persist_snapshot_if_changed() {
            error!(node = self.node.id, %err, "snapshot persistence failed");
        }
        if let Err(err) = self.run_actions(actions, origin, &mut reply) {
            error!(node = self.node.id, %err, "action execution failed");
        }
        // the core produced no response for this request (duplicate or
        // stale); unblock the caller with a neutral one
        if let (Some(reply), Some(fallback)) = (reply.take(), fallback) {
            let _ = reply.send(fallback);
        }
    }

    fn run_actions(
        &mut self,
        actions: Vec<RaftAction>,
        origin: Option<NodeId>,
        reply: &mut Option<oneshot::Sender<RaftMessage>>,
    ) -> Result<(), TransportError> {
        for action in actions {
            match action {
                RaftAction::PersistHardState { term, voted_for } => {
                    self.storage.save_hard_state(term, voted_for)?;
                }
                RaftAction::PersistEntries { first_index } => {
                    self.persist_entries(first_index)?;
                }
                RaftAction::ApplyEntries { up_to } => {
                    let entries = self.node.entries_to_apply();
                    debug!(node = self.node.id, up_to, count = entries.len(), "applying entries");
                    self.applied.extend(entries);
                }
                RaftAction::ResetElectionTimer => self.reset_election_deadline(),
                RaftAction::SendMessage { to, message } => {
                    let answers_request =
                        reply.is_some() && Some(to) == origin && wire::is_response(&message);
                    if answers_request {
                        if let Some(reply) = reply.take() {
                            let _ = reply.send(message);
                        }
                    } else {
                        self.dispatch(to, message);
                    }
                }
            }
        }
        Ok(())
    }

    /// mirror the in-memory log from `first_index` on into storage
    fn persist_entries(&mut self, first_index: LogIndex) -> Result<(), TransportError> {
        let entries = self.node.log.entries_from(first_index, usize::MAX);
        if entries.is_empty() {
            self.storage.truncate_from(first_index)?;
        } else {
            self.storage.append_entries(&entries)?;
        }
        Ok(())
    }

    fn persist_snapshot_if_changed(&mut self) -> Result<(), TransportError> {
        let current = self.node.log.snapshot_index();
        if current == self.last_snapshot_index {
            return Ok(());
        }
        self.storage.save_snapshot(&Snapshot {
            last_included_index: current,
            last_included_term: self.node.log.snapshot_term(),
            data: self.node.log.snapshot_data().to_vec(),
        })?;
        self.last_snapshot_index = current;
        Ok(())
    }

    /// send `message` to `to` on a spawned task; the reply comes back
    /// through our own inbox like any other message
    fn dispatch(&mut self, to: NodeId, message: RaftMessage) {
        let client = self
            .clients
            .entry(to)
            .or_insert_with(|| Arc::new(Mutex::new(RpcClient::new(to, self.discovery.clone()))))
            .clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let response = client.lock().await.call(&message).await;
            let _ = inbox
                .send(WorkerRequest::Message {
                    message: response,
                    reply: None,
                })
                .await;
        });
    }

    fn reset_election_deadline(&mut self) {
        let min = self.node.options.election_timeout_min;
        let max = self.node.options.election_timeout_max;
        let jitter = rand::thread_rng().gen_range(min..=max);
        self.election_deadline = Instant::now() + Duration::from_millis(jitter);
    }

    fn compact(&mut self, up_to: LogIndex, data: Vec<u8>) -> bool {
        if !self.node.compact(up_to, data) {
            return false;
        }
        if let Err(err) = self.persist_snapshot_if_changed() {
            error!(node = self.node.id, %err, "snapshot persistence failed");
            return false;
        }
        true
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.node.id,
            role: self.node.role,
            term: self.node.current_term,
            leader_id: self.node.leader_id,
            commit_index: self.node.commit_index,
            last_applied: self.node.last_applied,
            last_log_index: self.node.last_log_index(),
            applied_commands: self
                .applied
                .iter()
                .filter_map(|e| e.command_bytes().map(<[u8]>::to_vec))
                .collect(),
        }
    }
}
