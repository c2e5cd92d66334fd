use super::{
    Entry, Envelope, Index, KvStore, Log, Message, ReplicaID, Term, BROADCAST,
    ELECTION_TIMEOUT_RANGE, HEARTBEAT_INTERVAL, MAX_APPEND_ENTRIES, MAX_BATCH_PUTS, QUORUM_WINDOW,
};
use crate::error::Result;

use itertools::Itertools as _;
use log::{debug, info, warn};
use rand::Rng as _;
use std::collections::{HashMap, HashSet};

/// A logical clock interval as a number of ticks.
pub type Ticks = u8;

/// Extracts the MID of a client request.
fn client_mid(request: &Message) -> String {
    match request {
        Message::Get { mid, .. } | Message::Put { mid, .. } => mid.clone(),
        request => panic!("not a client request: {request:?}"),
    }
}

/// Consensus node tuning options.
pub struct Options {
    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The range of randomized election timeouts for followers and candidates.
    pub election_timeout_range: std::ops::Range<Ticks>,
    /// The length of the leader's quorum watchdog window.
    pub quorum_window: Ticks,
    /// Maximum number of entries in a single append message.
    pub max_append_entries: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout_range: ELECTION_TIMEOUT_RANGE,
            quorum_window: QUORUM_WINDOW,
            max_append_entries: MAX_APPEND_ENTRIES,
        }
    }
}

/// A consensus node with a dynamic role. The node is driven synchronously by
/// processing inbound envelopes via step() or by advancing time via tick().
/// These methods consume the current node and return a new one with a
/// possibly different role. Outbound envelopes are emitted via the node_tx
/// channel; the server writes them to the network.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new node, starting as a leaderless follower, or as leader
    /// if there are no peers.
    pub fn new(
        id: ReplicaID,
        peers: HashSet<ReplicaID>,
        log: Log,
        state: KvStore,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let node = RawNode::new(id, peers, log, state, node_tx, opts)?;
        if node.peers.is_empty() {
            // If there are no peers, become leader immediately.
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> &ReplicaID {
        match self {
            Node::Candidate(n) => &n.id,
            Node::Follower(n) => &n.id,
            Node::Leader(n) => &n.id,
        }
    }

    /// Returns the node's current term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    /// Returns the leader the node currently recognizes (BROADCAST if none).
    pub fn leader(&self) -> &ReplicaID {
        match self {
            Node::Candidate(n) => &n.leader,
            Node::Follower(n) => &n.leader,
            Node::Leader(n) => &n.leader,
        }
    }

    /// Processes an inbound envelope.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by one tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A node role: leader, follower, or candidate.
pub trait Role {}

/// A consensus node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>, so that role-specific state and
/// behavior only exist while the role does.
pub struct RawNode<R: Role = Follower> {
    id: ReplicaID,
    peers: HashSet<ReplicaID>,
    term: Term,
    /// The leader we currently recognize; BROADCAST if none.
    leader: ReplicaID,
    /// True while stranded in a minority partition: client requests are
    /// failed rather than parked, until some leader is recognized again.
    in_minority: bool,
    log: Log,
    state: KvStore,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            term: self.term,
            leader: self.leader,
            in_minority: self.in_minority,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            role,
        }
    }

    /// Returns the cluster size as a number of replicas.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The vector must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message, stamping the envelope with our current leader view.
    fn send(&self, to: &ReplicaID, message: Message) -> Result<()> {
        let msg = Envelope {
            src: self.id.clone(),
            dst: to.clone(),
            leader: self.leader.clone(),
            message,
        };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to all peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        // Sort for test determinism.
        for id in self.peers.iter().sorted() {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(self.opts.election_timeout_range.clone())
    }

    /// Checks whether an inbound envelope should be processed at all: it
    /// must be addressed to us (or broadcast), must not be our own echo, and
    /// peer protocol messages must come from a known peer. Anything else is
    /// logged and dropped, never answered.
    fn accept(&self, msg: &Envelope) -> bool {
        if msg.src == self.id {
            warn!("Dropping own echoed message: {msg:?}");
            return false;
        }
        if msg.dst != self.id && msg.dst != BROADCAST {
            warn!("Dropping message addressed to {}: {msg:?}", msg.dst);
            return false;
        }
        if msg.message.is_from_peer() && !self.peers.contains(&msg.src) {
            warn!("Dropping protocol message from unknown peer {}", msg.src);
            return false;
        }
        true
    }

    /// Answers a request from a past term so the stale sender can catch up
    /// on the current term. Responses from past terms are simply dropped.
    fn reject_stale(&self, msg: &Envelope) -> Result<()> {
        debug!("Rejecting message from past term: {msg:?}");
        match &msg.message {
            Message::AppendEntries { .. } => self.send(
                &msg.src,
                Message::AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index: -1,
                    conflicting_term: None,
                    conflicting_first_index: None,
                },
            ),
            Message::RequestVote { .. } => {
                self.send(&msg.src, Message::RequestVoteResponse { term: self.term, granted: false })
            }
            _ => Ok(()),
        }
    }

    /// Applies any committed but unapplied log entries to the state machine.
    fn maybe_apply(&mut self) {
        while self.state.applied_index() < self.log.commit_index() {
            let index = self.state.applied_index() + 1;
            let entry = self.log.get(index).expect("missing committed entry");
            debug!("Applying {entry:?}");
            self.state.apply(index, entry);
        }
    }
}

/// A candidate is campaigning to become a leader.
pub struct Candidate {
    /// Votes received, including our own.
    votes: HashSet<ReplicaID>,
    /// Ticks elapsed since election start.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
    /// Client requests parked until the election resolves.
    buffer: Vec<(ReplicaID, Message)>,
}

impl Candidate {
    fn new(election_timeout: Ticks, buffer: Vec<(ReplicaID, Message)>) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout, buffer }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Transitions the candidate to a follower: either we lost the election
    /// and follow the winner, or we discovered a new term and step into it
    /// as a leaderless follower.
    fn into_follower(mut self, term: Term, leader: Option<ReplicaID>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression {} → {term}", self.term);

        let election_timeout = self.gen_election_timeout();
        let buffer = std::mem::take(&mut self.role.buffer);
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term, "can't follow leader in a different term");
            info!("Lost election, following leader {leader} in term {term}");
            let voted_for = Some(self.id.clone());
            let mut node = self.into_role(Follower::new(election_timeout, voted_for));
            node.role.buffer = buffer;
            node.follow(leader)?;
            Ok(node)
        } else {
            // We discovered a new term, but don't know who the leader is
            // yet. We'll find out when we step a message from it.
            assert_ne!(term, self.term, "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.leader = BROADCAST.into();
            let mut node = self.into_role(Follower::new(election_timeout, None));
            node.role.buffer = buffer;
            Ok(node)
        }
    }

    /// Transitions the candidate to a leader: we won the election. Asserts
    /// leadership with an immediate heartbeat, then serves any client
    /// requests parked during the election.
    fn into_leader(mut self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let buffer = std::mem::take(&mut self.role.buffer);
        let peers = self.peers.clone();
        // The previous commit index is inherited; it only advances once an
        // entry from this term reaches a quorum.
        let next_index = self.log.len();
        let mut node = self.into_role(Leader::new(peers, next_index));
        node.leader = node.id.clone();
        node.in_minority = false;
        node.heartbeat()?;
        for (client, message) in buffer {
            node.client_request(client, message)?;
        }
        Ok(node)
    }

    /// Processes an inbound envelope.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        if !self.accept(&msg) {
            return Ok(self.into());
        }
        if let Some(term) = msg.message.term() {
            // If we receive a message from a future term, become a
            // leaderless follower in it and step the message.
            if term > self.term {
                return self.into_follower(term, None)?.step(msg);
            }
            if term < self.term {
                self.reject_stale(&msg)?;
                return Ok(self.into());
            }
        }

        match msg.message {
            // If we receive append entries in this term, we lost the
            // election and have a new leader. Follow it and step the
            // message.
            Message::AppendEntries { .. } => {
                let term = self.term;
                return self.into_follower(term, Some(msg.src.clone()))?.step(msg);
            }

            // Don't grant votes to other candidates; we voted for ourself.
            Message::RequestVote { .. } => {
                self.send(&msg.src, Message::RequestVoteResponse { term: self.term, granted: false })?;
            }

            // If a vote gives us quorum, assume leadership.
            Message::RequestVoteResponse { granted: true, .. } => {
                self.role.votes.insert(msg.src);
                if self.role.votes.len() >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }

            // We didn't get the vote.
            Message::RequestVoteResponse { granted: false, .. } => {}

            // Client requests are parked until the election resolves, unless
            // we're stranded in a minority, in which case they fail at once.
            request @ (Message::Get { .. } | Message::Put { .. }) => {
                if self.in_minority {
                    let mid = client_mid(&request);
                    self.send(&msg.src, Message::Fail { mid })?;
                } else {
                    self.role.buffer.push((msg.src, request));
                }
            }

            Message::Hello => debug!("Ignoring boot announcement from {}", msg.src),

            // We were never leader in this term, so nobody can be answering
            // our appends.
            Message::AppendEntriesResponse { .. } => {
                panic!("unexpected append response as candidate: {msg:?}")
            }

            Message::Ok { .. } | Message::Fail { .. } | Message::Redirect { .. } => {
                warn!("Dropping client reply addressed to a replica: {msg:?}")
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
        }
        Ok(self.into())
    }

    /// Campaigns for leadership by bumping the term, voting for ourself, and
    /// soliciting votes from all peers.
    fn campaign(&mut self) -> Result<()> {
        self.term += 1;
        self.leader = BROADCAST.into();
        self.role.votes = HashSet::from([self.id.clone()]); // vote for ourself
        self.role.election_duration = 0;
        self.role.election_timeout = self.gen_election_timeout();
        info!("Starting election for term {}", self.term);
        self.broadcast(Message::RequestVote {
            term: self.term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }
}

/// A follower replicates the log from a leader.
pub struct Follower {
    /// Ticks since the last message from the leader.
    leader_seen: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
    /// The candidate we voted for in this term, if any.
    voted_for: Option<ReplicaID>,
    /// Client requests parked until a leader is known.
    buffer: Vec<(ReplicaID, Message)>,
}

impl Follower {
    fn new(election_timeout: Ticks, voted_for: Option<ReplicaID>) -> Self {
        Self { leader_seen: 0, election_timeout, voted_for, buffer: Vec::new() }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower.
    fn new(
        id: ReplicaID,
        peers: HashSet<ReplicaID>,
        log: Log,
        state: KvStore,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        assert_ne!(id, BROADCAST, "replica can't use the broadcast id");
        assert!(!peers.contains(&id), "replica can't be its own peer");
        let role = Follower::new(0, None);
        let mut node = Self {
            id,
            peers,
            term: 0,
            leader: BROADCAST.into(),
            in_minority: false,
            log,
            state,
            node_tx,
            opts,
            role,
        };
        node.role.election_timeout = node.gen_election_timeout();
        Ok(node)
    }

    /// Recognizes a leader in the current term. Clears the minority flag and
    /// redirects any parked client requests to the new leader.
    fn follow(&mut self, leader: ReplicaID) -> Result<()> {
        assert_ne!(leader, self.id, "can't follow self");
        assert!(self.peers.contains(&leader), "leader {leader} is not a peer");
        info!("Following leader {leader} in term {}", self.term);
        self.leader = leader;
        self.in_minority = false;
        self.role.leader_seen = 0;
        for (client, message) in std::mem::take(&mut self.role.buffer) {
            let mid = match message {
                Message::Get { mid, .. } | Message::Put { mid, .. } => mid,
                message => panic!("non-client request in buffer: {message:?}"),
            };
            self.send(&client, Message::Redirect { mid })?;
        }
        Ok(())
    }

    /// Transitions the follower into a candidate, campaigning for leadership
    /// in a new term.
    fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        // Parked requests move to the candidate; they're answered when the
        // election resolves.
        let buffer = std::mem::take(&mut self.role.buffer);
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout, buffer));
        node.campaign()?;
        Ok(node)
    }

    /// Transitions the follower into a follower: either following a leader
    /// discovered in the current term, or stepping leaderless into a new
    /// term.
    fn into_follower(mut self, term: Term, leader: Option<ReplicaID>) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression {} → {term}", self.term);

        if let Some(leader) = leader {
            assert_eq!(term, self.term, "can't follow leader in a different term");
            assert_eq!(self.leader, BROADCAST, "already have a leader in this term");
            self.follow(leader)?;
        } else {
            assert_ne!(term, self.term, "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.leader = BROADCAST.into();
            let buffer = std::mem::take(&mut self.role.buffer);
            self.role = Follower::new(self.gen_election_timeout(), None);
            self.role.buffer = buffer;
        }
        Ok(self)
    }

    /// Processes an inbound envelope.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        if !self.accept(&msg) {
            return Ok(self.into());
        }
        if let Some(term) = msg.message.term() {
            if term > self.term {
                return self.into_follower(term, None)?.step(msg);
            }
            if term < self.term {
                self.reject_stale(&msg)?;
                return Ok(self.into());
            }
        }

        match msg.message {
            // Replication from the leader. An empty entries vector is a
            // heartbeat and takes the same path; splicing a matching prefix
            // is a no-op, so duplicated and reordered appends are harmless.
            Message::AppendEntries { prev_log_index, prev_log_term, entries, leader_commit, .. } => {
                // The sender is the leader of this term; follow it if we
                // haven't already.
                if self.leader == BROADCAST {
                    let term = self.term;
                    self = self.into_follower(term, Some(msg.src.clone()))?;
                } else {
                    assert_eq!(self.leader, msg.src, "multiple leaders in term {}", self.term);
                }
                self.role.leader_seen = 0;

                if !self.log.matches_at(prev_log_index, prev_log_term) {
                    // Reject, with a hint that lets the leader skip the
                    // divergent region instead of probing one entry at a
                    // time.
                    let (conflicting_term, conflicting_first_index) =
                        if self.log.last_index() < prev_log_index {
                            (-1, self.log.len())
                        } else {
                            let term = self.log.term_at(prev_log_index);
                            let first = self
                                .log
                                .first_index_of_term(term)
                                .expect("own log entry term not found");
                            (term as i64, first)
                        };
                    self.send(
                        &msg.src,
                        Message::AppendEntriesResponse {
                            term: self.term,
                            success: false,
                            match_index: -1,
                            conflicting_term: Some(conflicting_term),
                            conflicting_first_index: Some(conflicting_first_index),
                        },
                    )?;
                    return Ok(self.into());
                }

                // The confirmed match is exactly what this message proved,
                // not our own last index, which may hold a stale suffix the
                // leader knows nothing about.
                let match_index = self.log.splice(prev_log_index, entries);
                if leader_commit > self.log.commit_index() {
                    let commit = leader_commit.min(self.log.last_index());
                    if commit > self.log.commit_index() {
                        self.log.commit(commit);
                        self.maybe_apply();
                    }
                }
                self.send(
                    &msg.src,
                    Message::AppendEntriesResponse {
                        term: self.term,
                        success: true,
                        match_index,
                        conflicting_term: None,
                        conflicting_first_index: None,
                    },
                )?;
            }

            // A candidate is requesting our vote.
            Message::RequestVote { candidate_id, last_log_index, last_log_term, .. } => {
                debug_assert_eq!(candidate_id, msg.src, "candidate id does not match sender");

                // Only one vote per term.
                if let Some(voted_for) = &self.role.voted_for {
                    if *voted_for != candidate_id {
                        self.send(
                            &msg.src,
                            Message::RequestVoteResponse { term: self.term, granted: false },
                        )?;
                        return Ok(self.into());
                    }
                }

                // Only vote for candidates whose log is at least as
                // up-to-date as ours.
                let (our_index, our_term) = (self.log.last_index(), self.log.last_term());
                if last_log_term < our_term
                    || (last_log_term == our_term && last_log_index < our_index)
                {
                    self.send(
                        &msg.src,
                        Message::RequestVoteResponse { term: self.term, granted: false },
                    )?;
                    return Ok(self.into());
                }

                info!("Voting for {candidate_id} in term {} election", self.term);
                self.role.voted_for = Some(candidate_id);
                self.role.leader_seen = 0; // granting a vote resets the election timer
                self.send(&msg.src, Message::RequestVoteResponse { term: self.term, granted: true })?;
            }

            // A vote may arrive after we lost an election and followed a
            // leader. Ignore it.
            Message::RequestVoteResponse { .. } => {}

            // Client requests are redirected to the leader if we know one,
            // failed if we're stranded in a minority, and parked otherwise.
            request @ (Message::Get { .. } | Message::Put { .. }) => {
                if self.leader != BROADCAST {
                    let mid = client_mid(&request);
                    self.send(&msg.src, Message::Redirect { mid })?;
                } else if self.in_minority {
                    let mid = client_mid(&request);
                    self.send(&msg.src, Message::Fail { mid })?;
                } else {
                    self.role.buffer.push((msg.src, request));
                }
            }

            Message::Hello => debug!("Ignoring boot announcement from {}", msg.src),

            // We were never leader in this term, so nobody can be answering
            // our appends.
            Message::AppendEntriesResponse { .. } => {
                panic!("unexpected append response as follower: {msg:?}")
            }

            Message::Ok { .. } | Message::Fail { .. } | Message::Redirect { .. } => {
                warn!("Dropping client reply addressed to a replica: {msg:?}")
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            return Ok(self.into_candidate()?.into());
        }
        Ok(self.into())
    }
}

/// Replication progress of a single follower, tracked by the leader.
struct Progress {
    /// The next index to replicate to the follower.
    next_index: Index,
    /// The last index confirmed identical to our log; -1 if none yet.
    match_index: Index,
}

impl Progress {
    /// Attempts to advance the follower's match index, returning true if it
    /// did. next_index is pulled along but never regressed here.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = self.next_index.max(match_index + 1);
        true
    }

    /// Regresses the next index to the given index, if it's currently
    /// greater. Can't regress below match_index + 1. Returns true if
    /// next_index changed.
    fn regress_next(&mut self, next_index: Index) -> bool {
        if next_index >= self.next_index || self.next_index <= self.match_index + 1 {
            return false;
        }
        self.next_index = next_index.max(self.match_index + 1);
        true
    }
}

/// A client put accepted by the leader but not yet appended to the log.
struct PendingPut {
    client: ReplicaID,
    mid: String,
    key: String,
    value: String,
}

/// A client awaiting the commit of a log index.
struct Waiter {
    client: ReplicaID,
    mid: String,
}

/// A client read parked until the write at `index` commits, so the reply
/// never reflects a value older than a write the leader has already
/// accepted.
struct PendingRead {
    index: Index,
    client: ReplicaID,
    mid: String,
    key: String,
}

/// A leader serves client requests and replicates its log to followers.
pub struct Leader {
    /// Per-follower replication progress.
    progress: HashMap<ReplicaID, Progress>,
    /// Client puts awaiting the next batch flush.
    batch: Vec<PendingPut>,
    /// Write waiters keyed by log index, answered when the entry commits.
    writes: HashMap<Index, Vec<Waiter>>,
    /// In-flight put MIDs and the index carrying them. Retransmissions
    /// attach a second waiter instead of appending a duplicate entry.
    in_flight: HashMap<String, Index>,
    /// MIDs of committed puts. Retransmissions are acknowledged again
    /// without touching the log.
    answered: HashSet<String>,
    /// Reads parked behind uncommitted writes to their key.
    reads: Vec<PendingRead>,
    /// Peers heard from during the current quorum window.
    responded: HashSet<ReplicaID>,
    /// Ticks since the last periodic heartbeat.
    since_heartbeat: Ticks,
    /// Ticks since the last batch flush.
    since_batch: Ticks,
    /// Ticks since the quorum window started.
    window: Ticks,
}

impl Leader {
    fn new(peers: HashSet<ReplicaID>, next_index: Index) -> Self {
        let progress = peers
            .into_iter()
            .map(|p| (p, Progress { next_index, match_index: -1 }))
            .collect();
        Self {
            progress,
            batch: Vec::new(),
            writes: HashMap::new(),
            in_flight: HashMap::new(),
            answered: HashSet::new(),
            reads: Vec::new(),
            responded: HashSet::new(),
            since_heartbeat: 0,
            since_batch: 0,
            window: 0,
        }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Transitions the leader into a follower after discovering a new term.
    /// All pending client work is failed; the clients retry against whoever
    /// won.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term, "leader can only step down to a later term");
        info!("Discovered new term {term}, stepping down");
        self.term = term;
        self.leader = BROADCAST.into();
        self.fail_pending_requests()?;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(election_timeout, None)))
    }

    /// Steps down after a full quorum window without contact from a
    /// majority: we're stranded in a minority partition. Fails all pending
    /// client work, then calls an election in case the partition has healed.
    fn into_minority_candidate(mut self) -> Result<RawNode<Candidate>> {
        warn!(
            "Heard from only {} of {} replicas in a full quorum window, stepping down",
            self.role.responded.len() + 1,
            self.cluster_size()
        );
        self.in_minority = true;
        self.leader = BROADCAST.into();
        self.fail_pending_requests()?;
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout, Vec::new()));
        node.campaign()?;
        Ok(node)
    }

    /// Fails all buffered, uncommitted, and parked client work. Called when
    /// losing leadership; the envelopes carry our (cleared) leader view so
    /// clients know to re-address.
    fn fail_pending_requests(&mut self) -> Result<()> {
        for put in std::mem::take(&mut self.role.batch) {
            self.send(&put.client, Message::Fail { mid: put.mid })?;
        }
        // Sort by index for deterministic output.
        for (_, waiters) in
            std::mem::take(&mut self.role.writes).into_iter().sorted_by_key(|(index, _)| *index)
        {
            for waiter in waiters {
                self.send(&waiter.client, Message::Fail { mid: waiter.mid })?;
            }
        }
        for read in std::mem::take(&mut self.role.reads) {
            self.send(&read.client, Message::Fail { mid: read.mid })?;
        }
        self.role.in_flight.clear();
        Ok(())
    }

    /// Processes an inbound envelope.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        if !self.accept(&msg) {
            return Ok(self.into());
        }
        if let Some(term) = msg.message.term() {
            if term > self.term {
                return self.into_follower(term)?.step(msg);
            }
            if term < self.term {
                self.reject_stale(&msg)?;
                return Ok(self.into());
            }
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::AppendEntries { .. } => {
                panic!("saw other leader {} in term {}", msg.src, self.term);
            }

            // Don't grant votes in a term we already lead.
            Message::RequestVote { .. } => {
                self.send(&msg.src, Message::RequestVoteResponse { term: self.term, granted: false })?;
            }

            // Votes may come in after we won the election. Ignore them.
            Message::RequestVoteResponse { .. } => {}

            // A follower confirmed or rejected an append. Either way it's
            // alive, which the quorum watchdog wants to know.
            Message::AppendEntriesResponse {
                success,
                match_index,
                conflicting_term,
                conflicting_first_index,
                ..
            } => {
                self.role.responded.insert(msg.src.clone());
                if success {
                    assert!(
                        match_index <= self.log.last_index(),
                        "follower {} confirmed unknown index {match_index}",
                        msg.src
                    );
                    if self.progress(&msg.src).advance(match_index) {
                        self.maybe_commit_and_apply()?;
                    }
                    // Keep feeding a follower that's catching up in chunks.
                    self.maybe_send_append(&msg.src)?;
                } else {
                    self.handle_reject(&msg.src, conflicting_term, conflicting_first_index)?;
                }
            }

            Message::Get { .. } | Message::Put { .. } => {
                self.client_request(msg.src, msg.message)?;
            }

            Message::Hello => debug!("Ignoring boot announcement from {}", msg.src),

            Message::Ok { .. } | Message::Fail { .. } | Message::Redirect { .. } => {
                warn!("Dropping client reply addressed to a replica: {msg:?}")
            }
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.role.since_heartbeat += 1;
        self.role.since_batch += 1;
        self.role.window += 1;

        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }
        if self.role.since_batch >= super::BATCH_INTERVAL {
            self.flush_batch()?;
            self.role.since_batch = 0;
        }
        if self.role.window >= self.opts.quorum_window {
            if self.role.responded.len() + 1 < self.quorum_size() {
                return Ok(self.into_minority_candidate()?.into());
            }
            self.role.responded.clear();
            self.role.window = 0;
        }
        Ok(self.into())
    }

    /// Returns a mutable borrow of a peer's progress.
    fn progress(&mut self, id: &ReplicaID) -> &mut Progress {
        self.role.progress.get_mut(id).expect("unknown peer")
    }

    /// Sends a heartbeat to all peers. Each peer gets an append based at its
    /// own next index, so a heartbeat doubles as the retransmission path for
    /// entries lost on the wire.
    fn heartbeat(&mut self) -> Result<()> {
        for peer in self.peers.iter().cloned().sorted() {
            self.send_append(&peer)?;
        }
        Ok(())
    }

    /// Sends the pending log suffix to a peer if there is one; stays silent
    /// for a caught-up peer. Used after appends and accepts, where an empty
    /// message would add nothing over the next heartbeat.
    fn maybe_send_append(&mut self, peer: &ReplicaID) -> Result<()> {
        if self.progress(peer).next_index <= self.log.last_index() {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// Sends an append to a peer from its next index, empty if the peer has
    /// everything. Sent entries are assumed delivered and not resent until a
    /// rejection or heartbeat-driven probe regresses the next index.
    fn send_append(&mut self, peer: &ReplicaID) -> Result<()> {
        let next = self.progress(peer).next_index;
        assert!((0..=self.log.len()).contains(&next), "invalid next index {next}");
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index);
        let entries = self.log.entries_from(next, self.opts.max_append_entries);
        debug!("Replicating {} entries with base {prev_log_index} to {peer}", entries.len());
        self.progress(peer).next_index = next + entries.len() as Index;
        self.send(
            peer,
            Message::AppendEntries {
                term: self.term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.log.commit_index(),
            },
        )
    }

    /// Computes a new next index for a peer from a rejection's conflict
    /// hint, and resends from there. Stale or duplicated rejections are
    /// ignored.
    fn handle_reject(
        &mut self,
        peer: &ReplicaID,
        conflicting_term: Option<i64>,
        conflicting_first_index: Option<Index>,
    ) -> Result<()> {
        let hint_index = match conflicting_first_index {
            Some(index) => index,
            // A reject without a hint shouldn't happen; fall back to
            // stepping back one entry.
            None => self.progress(peer).next_index - 1,
        };
        let next = match conflicting_term {
            // The follower holds the conflicting term: skip to just past our
            // last entry of that term, or to the follower's first entry of
            // it, whichever comes first.
            Some(term) if term > 0 => match self.log.last_index_of_term(term as Term) {
                Some(last_of_term) => (last_of_term + 1).min(hint_index),
                None => hint_index,
            },
            // The follower's log is shorter than the probe; the hint is its
            // log length.
            _ => hint_index,
        };
        let next = next.clamp(0, self.log.len());
        if self.progress(peer).regress_next(next) {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// Handles a client request as leader.
    fn client_request(&mut self, client: ReplicaID, message: Message) -> Result<()> {
        match message {
            Message::Get { mid, key } => {
                if let Some(index) = self.log.uncommitted_index_of_key(&key) {
                    // A write to this key is in flight; answer once it
                    // commits so the reply never precedes an accepted write.
                    self.role.reads.push(PendingRead { index, client, mid, key });
                } else {
                    let value = self.state.get(&key).to_string();
                    self.send(&client, Message::Ok { mid, value: Some(value) })?;
                }
            }
            Message::Put { mid, key, value } => {
                if self.role.answered.contains(&mid) {
                    // A retransmission of a committed put: acknowledge again
                    // without re-applying.
                    self.send(&client, Message::Ok { mid, value: None })?;
                } else if let Some(&index) = self.role.in_flight.get(&mid) {
                    // Already appended and awaiting commit: register another
                    // reply, don't append a duplicate entry.
                    self.role.writes.entry(index).or_default().push(Waiter { client, mid });
                } else {
                    self.role.batch.push(PendingPut { client, mid, key, value });
                    if self.role.batch.len() >= MAX_BATCH_PUTS {
                        self.flush_batch()?;
                    }
                }
            }
            message => panic!("not a client request: {message:?}"),
        }
        Ok(())
    }

    /// Appends the batched client puts to the log as one suffix and
    /// replicates it to all peers. Client replies wait for the commit.
    fn flush_batch(&mut self) -> Result<()> {
        if self.role.batch.is_empty() {
            return Ok(());
        }
        for put in std::mem::take(&mut self.role.batch) {
            let entry = Entry {
                term: self.term,
                key: put.key,
                value: put.value,
                client: put.client.clone(),
                mid: put.mid.clone(),
            };
            let index = self.log.append(entry);
            self.role.in_flight.insert(put.mid.clone(), index);
            self.role.writes.entry(index).or_default().push(Waiter {
                client: put.client,
                mid: put.mid,
            });
        }
        for peer in self.peers.iter().cloned().sorted() {
            self.maybe_send_append(&peer)?;
        }
        // A cluster of one commits by itself.
        self.maybe_commit_and_apply()?;
        Ok(())
    }

    /// Commits any entries replicated on a quorum, applies them, and answers
    /// the waiting clients.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        // The quorum value over everyone's confirmed position (ours is the
        // log end) is the highest index replicated on a majority.
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.last_index()))
                .collect(),
        );
        if quorum_index <= self.log.commit_index() {
            return Ok(self.log.commit_index());
        }
        // Never count replicas to commit an entry from a prior term: only an
        // entry from our own term commits, carrying older ones with it.
        if self.log.term_at(quorum_index) != self.term {
            return Ok(self.log.commit_index());
        }
        self.log.commit(quorum_index);

        while self.state.applied_index() < self.log.commit_index() {
            let index = self.state.applied_index() + 1;
            let entry = self.log.get(index).expect("missing committed entry");
            debug!("Applying {entry:?}");
            self.state.apply(index, entry);
            let mid = entry.mid.clone();
            self.role.in_flight.remove(&mid);
            self.role.answered.insert(mid);
            if let Some(waiters) = self.role.writes.remove(&index) {
                for waiter in waiters {
                    self.send(&waiter.client, Message::Ok { mid: waiter.mid, value: None })?;
                }
            }
        }

        self.maybe_read()?;
        Ok(quorum_index)
    }

    /// Answers parked reads whose gating write has been applied.
    fn maybe_read(&mut self) -> Result<()> {
        let applied = self.state.applied_index();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.role.reads)
            .into_iter()
            .partition(|read| read.index <= applied);
        self.role.reads = waiting;
        for read in ready {
            let value = self.state.get(&read.key).to_string();
            self.send(&read.client, Message::Ok { mid: read.mid, value: Some(value) })?;
        }
        Ok(())
    }
}
