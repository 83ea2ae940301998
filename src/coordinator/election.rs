//! Leader election / log catch-up voting
//!
//! When a node joins or leadership is lost, an election collects every
//! member's last known log position for a database. Replies are term-scoped:
//! a reply tagged with any other term is dropped silently so votes from a
//! superseded attempt can never pollute the current one. Once more than
//! `quorum` replies are in, the reply carrying the most advanced position
//! (highest term, then highest id; an absent position loses to any present
//! one) wins and becomes the position to synchronize from.
//!
//! Terms are monotonic per database: each new election gets the previous
//! term plus one, so a node receiving traffic for an old term can always
//! tell it is stale.

use crate::common::NodeId;
use crate::coordinator::log::LogId;
use std::collections::HashMap;
use std::sync::Mutex;

/// One member's vote: its identity and its last known log position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionReply {
    pub sender: NodeId,
    pub log_id: Option<LogId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Open,
    Decided,
}

/// One election attempt for one database.
pub struct Election {
    term: i64,
    quorum: usize,
    replies: Vec<ElectionReply>,
    state: ElectionState,
    winner: Option<ElectionReply>,
}

impl Election {
    pub fn new(term: i64, quorum: usize) -> Self {
        Self {
            term,
            quorum,
            replies: Vec::new(),
            state: ElectionState::Open,
            winner: None,
        }
    }

    /// Record a reply if and only if its term matches this election's term.
    pub fn add_reply(&mut self, sender: NodeId, term: i64, log_id: Option<LogId>) {
        if self.term != term {
            tracing::debug!(
                election_term = self.term,
                reply_term = term,
                sender = %sender,
                "dropping election reply for non-matching term"
            );
            return;
        }
        self.replies.push(ElectionReply { sender, log_id });
    }

    /// Decide once strictly more than `quorum` replies are in: the most
    /// advanced log position wins. `Decided` is terminal; later calls return
    /// `None`, but the winner stays queryable through [`Election::winner`].
    pub fn check_election(&mut self) -> Option<ElectionReply> {
        if self.state == ElectionState::Decided || self.replies.len() <= self.quorum {
            return None;
        }

        let winner = self
            .replies
            .iter()
            .max_by_key(|reply| reply.log_id.map(|id| (id.term, id.id)))
            .cloned();

        self.state = ElectionState::Decided;
        self.winner = winner.clone();
        winner
    }

    /// The decided winner, if this election has reached a decision.
    pub fn winner(&self) -> Option<&ElectionReply> {
        self.winner.as_ref()
    }

    pub fn term(&self) -> i64 {
        self.term
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn replies_len(&self) -> usize {
        self.replies.len()
    }
}

#[derive(Default)]
struct ElectionSlot {
    last_term: i64,
    election: Option<Election>,
}

/// Election table for all databases on a node.
///
/// Guarded by its own mutex: election triggers (join, leader loss) and
/// incoming network replies touch it concurrently.
#[derive(Default)]
pub struct ElectionContext {
    slots: Mutex<HashMap<String, ElectionSlot>>,
}

impl ElectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh election for a database, replacing any prior one.
    /// Replies still in flight for the replaced election are orphaned and
    /// will never be counted. Returns the new (monotonic) term.
    pub fn start_election(&self, database: &str, quorum: usize) -> i64 {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(database.to_string()).or_default();
        slot.last_term += 1;
        let term = slot.last_term;
        slot.election = Some(Election::new(term, quorum));
        tracing::info!(database, term, quorum, "election started");
        term
    }

    /// Route an incoming reply to the database's live election and evaluate
    /// the decision rule. Replies for an unknown database or a non-matching
    /// term are dropped silently.
    pub fn received(
        &self,
        sender: NodeId,
        database: &str,
        term: i64,
        log_id: Option<LogId>,
    ) -> Option<ElectionReply> {
        let mut slots = self.slots.lock().unwrap();
        let Some(election) = slots.get_mut(database).and_then(|s| s.election.as_mut()) else {
            tracing::debug!(database, sender = %sender, "election reply for unknown database, ignoring");
            return None;
        };

        election.add_reply(sender, term, log_id);
        let decided = election.check_election();
        if let Some(winner) = &decided {
            tracing::info!(
                database,
                term,
                winner = %winner.sender,
                position = ?winner.log_id,
                "election decided"
            );
        }
        decided
    }

    /// Number of counted replies for the live election, if any.
    pub fn replies(&self, database: &str) -> usize {
        self.slots
            .lock()
            .unwrap()
            .get(database)
            .and_then(|s| s.election.as_ref())
            .map(|e| e.replies_len())
            .unwrap_or(0)
    }

    /// State of the live election, if any.
    pub fn state(&self, database: &str) -> Option<ElectionState> {
        self.slots
            .lock()
            .unwrap()
            .get(database)
            .and_then(|s| s.election.as_ref())
            .map(|e| e.state())
    }

    /// Winner of the database's decided election: the member holding the
    /// most advanced log position, the node to synchronize from. `None`
    /// while the election is still open or after a newer one replaced it.
    pub fn winner(&self, database: &str) -> Option<ElectionReply> {
        self.slots
            .lock()
            .unwrap()
            .get(database)
            .and_then(|s| s.election.as_ref())
            .and_then(|e| e.winner().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_id(id: i64, term: i64) -> LogId {
        LogId {
            id,
            term,
            previous_term: term,
        }
    }

    #[test]
    fn test_first_election_term_is_one() {
        let elections = ElectionContext::new();
        assert_eq!(elections.start_election("db1", 1), 1);
    }

    #[test]
    fn test_terms_are_monotonic_per_database() {
        let elections = ElectionContext::new();
        assert_eq!(elections.start_election("db1", 1), 1);
        assert_eq!(elections.start_election("db1", 1), 2);
        // independent counter per database
        assert_eq!(elections.start_election("db2", 1), 1);
    }

    #[test]
    fn test_term_isolation() {
        let mut election = Election::new(5, 1);
        election.add_reply(NodeId::from("n1"), 4, Some(log_id(10, 4)));
        election.add_reply(NodeId::from("n2"), 6, None);
        assert_eq!(election.replies_len(), 0);

        election.add_reply(NodeId::from("n3"), 5, Some(log_id(3, 5)));
        assert_eq!(election.replies_len(), 1);
    }

    #[test]
    fn test_stale_vote_scenario() {
        let elections = ElectionContext::new();
        let term = elections.start_election("db1", 1);
        assert_eq!(term, 1);

        // stale reply tagged with term 0: ignored
        elections.received(NodeId::from("n1"), "db1", 0, Some(log_id(9, 0)));
        assert_eq!(elections.replies("db1"), 0);

        // current-term reply is counted
        elections.received(NodeId::from("n1"), "db1", 1, Some(log_id(9, 1)));
        assert_eq!(elections.replies("db1"), 1);
    }

    #[test]
    fn test_most_advanced_position_wins() {
        let mut election = Election::new(1, 1);
        election.add_reply(NodeId::from("behind"), 1, Some(log_id(5, 1)));
        assert_eq!(election.check_election(), None); // not past quorum yet

        election.add_reply(NodeId::from("ahead"), 1, Some(log_id(9, 2)));
        let winner = election.check_election().unwrap();
        assert_eq!(winner.sender, NodeId::from("ahead"));
        assert_eq!(winner.log_id, Some(log_id(9, 2)));
        assert_eq!(election.state(), ElectionState::Decided);
    }

    #[test]
    fn test_higher_term_beats_higher_id() {
        let mut election = Election::new(1, 1);
        election.add_reply(NodeId::from("long-old"), 1, Some(log_id(100, 1)));
        election.add_reply(NodeId::from("short-new"), 1, Some(log_id(3, 2)));
        let winner = election.check_election().unwrap();
        assert_eq!(winner.sender, NodeId::from("short-new"));
    }

    #[test]
    fn test_absent_position_loses() {
        let mut election = Election::new(1, 1);
        election.add_reply(NodeId::from("empty"), 1, None);
        election.add_reply(NodeId::from("has-log"), 1, Some(log_id(0, 1)));
        let winner = election.check_election().unwrap();
        assert_eq!(winner.sender, NodeId::from("has-log"));
    }

    #[test]
    fn test_decision_is_terminal() {
        let mut election = Election::new(1, 0);
        election.add_reply(NodeId::from("n1"), 1, Some(log_id(1, 1)));
        assert!(election.check_election().is_some());

        election.add_reply(NodeId::from("n2"), 1, Some(log_id(50, 9)));
        assert_eq!(election.check_election(), None);
        // the original decision is retained, not overwritten
        assert_eq!(election.winner().unwrap().sender, NodeId::from("n1"));
    }

    #[test]
    fn test_winner_queryable_after_decision() {
        let elections = ElectionContext::new();
        elections.start_election("db1", 1);
        assert_eq!(elections.winner("db1"), None);

        elections.received(NodeId::from("behind"), "db1", 1, Some(log_id(2, 1)));
        assert_eq!(elections.winner("db1"), None);

        elections.received(NodeId::from("ahead"), "db1", 1, Some(log_id(7, 1)));
        let winner = elections.winner("db1").unwrap();
        assert_eq!(winner.sender, NodeId::from("ahead"));
        assert_eq!(winner.log_id, Some(log_id(7, 1)));

        // a fresh attempt clears the previous decision
        elections.start_election("db1", 1);
        assert_eq!(elections.winner("db1"), None);
    }

    #[test]
    fn test_replacing_election_orphans_replies() {
        let elections = ElectionContext::new();
        elections.start_election("db1", 1);
        elections.received(NodeId::from("n1"), "db1", 1, Some(log_id(1, 1)));
        assert_eq!(elections.replies("db1"), 1);

        // new attempt discards the old election and its replies
        let term = elections.start_election("db1", 1);
        assert_eq!(term, 2);
        assert_eq!(elections.replies("db1"), 0);

        // a straggler for the old term is never counted
        elections.received(NodeId::from("n2"), "db1", 1, Some(log_id(2, 1)));
        assert_eq!(elections.replies("db1"), 0);
    }

    #[test]
    fn test_unknown_database_ignored() {
        let elections = ElectionContext::new();
        // must not panic, must not create state
        elections.received(NodeId::from("n1"), "ghost", 1, None);
        assert_eq!(elections.replies("ghost"), 0);
    }
}
