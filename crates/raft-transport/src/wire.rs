//! # wire
//!
//! why: peers need an agreed framing before they can disagree about terms
//! relations: client.rs writes requests and reads responses, runtime.rs does
//!            the reverse on the listener side
//! what: newline-delimited json-rpc frames around RaftMessage, plus the
//!       neutral negative replies the rest of the crate leans on

use serde::{Deserialize, Serialize};

use raft_core::{NodeId, RaftMessage};

use crate::TransportError;

/// one request frame: a raft message addressed at the receiving node
///
/// `method` names the message kind for humans reading a wire capture; the
/// receiver decodes `params` and ignores it.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: RaftMessage,
}

/// one response frame, paired to a request by `id`
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub result: RaftMessage,
}

pub(crate) fn method_name(message: &RaftMessage) -> &'static str {
    match message {
        RaftMessage::ElectionTimeout => "election_timeout",
        RaftMessage::HeartbeatTimeout => "heartbeat_timeout",
        RaftMessage::ClientCommand { .. } => "client_command",
        RaftMessage::AddNode { .. } => "add_node",
        RaftMessage::RemoveNode { .. } => "remove_node",
        RaftMessage::PreVoteRequest { .. } => "pre_vote_request",
        RaftMessage::PreVoteResponse { .. } => "pre_vote_response",
        RaftMessage::VoteRequest { .. } => "vote_request",
        RaftMessage::VoteResponse { .. } => "vote_response",
        RaftMessage::AppendEntries { .. } => "append_entries",
        RaftMessage::AppendEntriesResponse { .. } => "append_entries_response",
        RaftMessage::InstallSnapshot { .. } => "install_snapshot",
        RaftMessage::InstallSnapshotResponse { .. } => "install_snapshot_response",
    }
}

pub(crate) fn encode_request(id: u64, message: &RaftMessage) -> Result<String, TransportError> {
    let request = RpcRequest {
        id,
        method: method_name(message).to_string(),
        params: message.clone(),
    };
    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    Ok(line)
}

pub(crate) fn decode_request(line: &str) -> Result<RpcRequest, TransportError> {
    Ok(serde_json::from_str(line)?)
}

pub(crate) fn encode_response(id: u64, result: &RaftMessage) -> Result<String, TransportError> {
    let response = RpcResponse {
        id,
        result: result.clone(),
    };
    let mut line = serde_json::to_string(&response)?;
    line.push('\n');
    Ok(line)
}

pub(crate) fn decode_response(line: &str, want: u64) -> Result<RaftMessage, TransportError> {
    let response: RpcResponse = serde_json::from_str(line)?;
    if response.id != want {
        return Err(TransportError::IdMismatch {
            want,
            got: response.id,
        });
    }
    Ok(response.result)
}

/// the node a request came from, read off the message itself
pub(crate) fn origin(message: &RaftMessage) -> Option<NodeId> {
    match message {
        RaftMessage::PreVoteRequest { candidate_id, .. }
        | RaftMessage::VoteRequest { candidate_id, .. } => Some(*candidate_id),
        RaftMessage::AppendEntries { leader_id, .. }
        | RaftMessage::InstallSnapshot { leader_id, .. } => Some(*leader_id),
        RaftMessage::PreVoteResponse { from, .. }
        | RaftMessage::VoteResponse { from, .. }
        | RaftMessage::AppendEntriesResponse { from, .. }
        | RaftMessage::InstallSnapshotResponse { from, .. } => Some(*from),
        _ => None,
    }
}

pub(crate) fn is_response(message: &RaftMessage) -> bool {
    matches!(
        message,
        RaftMessage::PreVoteResponse { .. }
            | RaftMessage::VoteResponse { .. }
            | RaftMessage::AppendEntriesResponse { .. }
            | RaftMessage::InstallSnapshotResponse { .. }
    )
}

/// the reply a caller gets when the peer is unreachable or silent
///
/// term 0 with everything denied: old enough that the core discards it as
/// stale, so an exhausted rpc looks exactly like a dead peer and never
/// surfaces as an error inside the consensus logic.
pub(crate) fn neutral_reply(from: NodeId, request: &RaftMessage) -> RaftMessage {
    match request {
        RaftMessage::PreVoteRequest { .. } => RaftMessage::PreVoteResponse {
            term: 0,
            from,
            vote_granted: false,
        },
        RaftMessage::VoteRequest { .. } => RaftMessage::VoteResponse {
            term: 0,
            from,
            vote_granted: false,
        },
        RaftMessage::InstallSnapshot { .. } => RaftMessage::InstallSnapshotResponse {
            term: 0,
            from,
            last_included_index: 0,
        },
        _ => RaftMessage::AppendEntriesResponse {
            term: 0,
            from,
            success: false,
            match_index: 0,
        },
    }
}
