//! Wire messages exchanged with peers and clients.
//!
//! Every datagram is one JSON object with `src`, `dst`, and `leader` routing
//! fields plus a `type` tag selecting the payload. Field names are fixed by
//! the simulator protocol, so the serde renames below are load-bearing.

use super::{Entry, Index, Term};

use serde_derive::{Deserialize, Serialize};

/// A replica identifier: an opaque 4-character id assigned by the simulator.
/// Clients are identified the same way, but are anonymous to the protocol.
pub type ReplicaID = String;

/// The reserved id denoting broadcast as a destination, and "no leader
/// known" in the `leader` field.
pub const BROADCAST: &str = "FFFF";

/// A routed message. `dst` may be a replica id or the broadcast id. `leader`
/// always carries the sender's current view of the leader (BROADCAST if
/// none), so clients can re-address and stale peers can catch up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: ReplicaID,
    pub dst: ReplicaID,
    pub leader: ReplicaID,
    #[serde(flatten)]
    pub message: Message,
}

/// A message payload, tagged on the wire by the `type` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// The one-shot boot announcement, broadcast before serving.
    #[serde(rename = "hello")]
    Hello,

    /// A client read of a single key.
    #[serde(rename = "get")]
    Get {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
    },

    /// A client write of a single key.
    #[serde(rename = "put")]
    Put {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
        value: String,
    },

    /// A successful client reply. `value` is present only for gets.
    #[serde(rename = "ok")]
    Ok {
        #[serde(rename = "MID")]
        mid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    /// A temporary client failure; the client should retry or re-address.
    #[serde(rename = "fail")]
    Fail {
        #[serde(rename = "MID")]
        mid: String,
    },

    /// Points a client at the current leader (the envelope's `leader`).
    #[serde(rename = "redirect")]
    Redirect {
        #[serde(rename = "MID")]
        mid: String,
    },

    /// A candidate solicits a vote. Grants require the candidate's log to be
    /// at least as up-to-date as the recipient's.
    RequestVote {
        term: Term,
        #[serde(rename = "candidateId")]
        candidate_id: ReplicaID,
        #[serde(rename = "lastLogIndex")]
        last_log_index: Index,
        #[serde(rename = "lastLogTerm")]
        last_log_term: Term,
    },

    /// A vote reply. `term` lets a stale candidate catch up.
    RequestVoteResponse { term: Term, granted: bool },

    /// Log replication from the leader. With no entries this is a heartbeat,
    /// still carrying `leaderCommit` and asserting leadership. The leader id
    /// travels in the envelope's `leader` field.
    AppendEntries {
        term: Term,
        #[serde(rename = "prevLogIndex")]
        prev_log_index: Index,
        #[serde(rename = "prevLogTerm")]
        prev_log_term: Term,
        entries: Vec<Entry>,
        #[serde(rename = "leaderCommit")]
        leader_commit: Index,
    },

    /// An append reply. On success, `matchIndex` is the highest index this
    /// reply proves identical to the leader's log. On rejection the conflict
    /// hint lets the leader skip most next-index probing: a conflicting term
    /// of -1 means the follower's log was shorter than `prevLogIndex` and
    /// the hint index is its log length, otherwise the hint index is the
    /// first index of the conflicting term in the follower's log.
    AppendEntriesResponse {
        term: Term,
        success: bool,
        #[serde(rename = "matchIndex")]
        match_index: Index,
        #[serde(
            rename = "conflictingTerm",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        conflicting_term: Option<i64>,
        #[serde(
            rename = "conflictingFirstIndex",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        conflicting_first_index: Option<Index>,
    },
}

impl Message {
    /// Returns the term of a peer protocol message. Client traffic carries
    /// no term.
    pub fn term(&self) -> Option<Term> {
        match self {
            Message::RequestVote { term, .. }
            | Message::RequestVoteResponse { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendEntriesResponse { term, .. } => Some(*term),
            Message::Hello
            | Message::Get { .. }
            | Message::Put { .. }
            | Message::Ok { .. }
            | Message::Fail { .. }
            | Message::Redirect { .. } => None,
        }
    }

    /// Returns true if this is a peer protocol message rather than client
    /// traffic or boot noise.
    pub fn is_from_peer(&self) -> bool {
        self.term().is_some()
    }
}
