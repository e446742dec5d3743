//! # election
//!
//! why: implement leader election, from vote solicitation and vote granting to
//!      the optional non-binding pre-vote round
//! relations: impl block on node.rs::RaftNode, reached only through handle();
//!            replication.rs takes over once a leader exists
//! what: election timeout handling, pre-vote round, RequestVote rpc pair,
//!       majority tally and promotion to leader

use tracing::debug;

use crate::message::{RaftAction, RaftMessage};
use crate::node::{RaftNode, RaftRole};
use crate::{LogIndex, NodeId, Term};

impl RaftNode {
    /// the election timer fired: campaign (or pre-campaign) unless leading
    pub(crate) fn on_election_timeout(&mut self) -> Vec<RaftAction> {
        match self.role {
            RaftRole::Leader => Vec::new(),
            RaftRole::Follower | RaftRole::Candidate => {
                if self.options.enable_pre_vote {
                    self.start_pre_vote()
                } else {
                    self.start_election()
                }
            }
        }
    }

    /// open a non-binding pre-vote round for term current_term + 1
    ///
    /// no state is persisted and the term is not bumped; a healed node that
    /// cannot win a majority stays quiet instead of disrupting a live leader.
    pub fn start_pre_vote(&mut self) -> Vec<RaftAction> {
        let prospective = self.current_term + 1;
        self.pre_votes_received.clear();
        self.pre_votes_received.insert(self.id);
        if self.pre_votes_received.len() >= self.quorum_size() {
            // single-node cluster: the round is already won
            return self.start_election();
        }
        debug!(node = self.id, term = prospective, "starting pre-vote round");
        let request = RaftMessage::PreVoteRequest {
            term: prospective,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        self.peers()
            .map(|to| RaftAction::SendMessage {
                to,
                message: request.clone(),
            })
            .collect()
    }

    /// become Candidate: bump the term, vote for self, solicit binding votes
    pub fn start_election(&mut self) -> Vec<RaftAction> {
        self.current_term += 1;
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        self.pre_votes_received.clear();
        debug!(node = self.id, term = self.current_term, "starting election");

        let mut actions = vec![
            RaftAction::PersistHardState {
                term: self.current_term,
                voted_for: self.voted_for,
            },
            RaftAction::ResetElectionTimer,
        ];
        if self.has_quorum() {
            // single-node cluster wins on its own vote
            actions.extend(self.become_leader());
            return actions;
        }
        let request = RaftMessage::VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        actions.extend(self.peers().map(|to| RaftAction::SendMessage {
            to,
            message: request.clone(),
        }));
        actions
    }

    /// true when a candidate log at `(last_log_term, last_log_index)` is at
    /// least as up to date as ours, compared lexicographically
    pub(crate) fn log_up_to_date(&self, last_log_term: Term, last_log_index: LogIndex) -> bool {
        (last_log_term, last_log_index) >= (self.last_log_term(), self.last_log_index())
    }

    /// answer a non-binding pre-vote solicitation
    ///
    /// grants change no local state at all: no term adoption, no voted_for,
    /// no timer reset. the reply echoes the prospective term so the candidate
    /// can match responses to its round.
    pub fn handle_pre_vote_request(
        &mut self,
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Vec<RaftAction> {
        let granted = term > self.current_term && self.log_up_to_date(last_log_term, last_log_index);
        vec![RaftAction::SendMessage {
            to: candidate_id,
            message: RaftMessage::PreVoteResponse {
                term,
                from: self.id,
                vote_granted: granted,
            },
        }]
    }

    /// tally a pre-vote response; a majority converts to a real candidacy
    pub fn handle_pre_vote_response(
        &mut self,
        term: Term,
        vote_granted: bool,
        from: NodeId,
    ) -> Vec<RaftAction> {
        // an open round for exactly the next term is the only thing that
        // cares; a split candidate re-running the round counts too, since
        // start_election clears the tally when a real candidacy begins
        if self.role == RaftRole::Leader
            || self.pre_votes_received.is_empty()
            || term != self.current_term + 1
            || !vote_granted
        {
            return Vec::new();
        }
        self.pre_votes_received.insert(from);
        if self.pre_votes_received.len() >= self.quorum_size() {
            return self.start_election();
        }
        Vec::new()
    }

    /// answer a binding vote request
    ///
    /// grant iff voted_for is unset or already this candidate for the term,
    /// and the candidate's log is at least as up to date as ours. the persist
    /// action precedes the reply: the vote must be durable before it is seen.
    pub fn handle_vote_request(
        &mut self,
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Vec<RaftAction> {
        let mut persist_needed = false;
        if term > self.current_term {
            self.become_follower(term);
            persist_needed = true;
        }

        let vote_available = match self.voted_for {
            None => true,
            Some(id) => id == candidate_id,
        };
        let granted = term == self.current_term
            && vote_available
            && self.log_up_to_date(last_log_term, last_log_index);

        let mut actions = Vec::new();
        if granted {
            self.voted_for = Some(candidate_id);
            persist_needed = true;
            actions.push(RaftAction::ResetElectionTimer);
        }
        if persist_needed {
            actions.push(RaftAction::PersistHardState {
                term: self.current_term,
                voted_for: self.voted_for,
            });
        }
        actions.push(RaftAction::SendMessage {
            to: candidate_id,
            message: RaftMessage::VoteResponse {
                term: self.current_term,
                from: self.id,
                vote_granted: granted,
            },
        });
        actions
    }

    /// tally a binding vote response; a majority promotes to Leader
    pub fn handle_vote_response(
        &mut self,
        term: Term,
        vote_granted: bool,
        from: NodeId,
    ) -> Vec<RaftAction> {
        if term > self.current_term {
            self.become_follower(term);
            return vec![RaftAction::PersistHardState {
                term: self.current_term,
                voted_for: self.voted_for,
            }];
        }
        if self.role != RaftRole::Candidate || term < self.current_term || !vote_granted {
            return Vec::new();
        }
        self.votes_received.insert(from);
        if self.has_quorum() {
            return self.become_leader();
        }
        Vec::new()
    }
}
