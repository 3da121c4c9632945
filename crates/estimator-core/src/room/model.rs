// Room, user and vote types plus the pure mutation rules.
//
// Everything here is synchronous and storage-free. `RoomRepository::update`
// hands a loaded `RoomState` to these methods and persists the result.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::RoomError;

// ---------------------------------------------------------------------------
// Room identifiers
// ---------------------------------------------------------------------------

/// A room id restricted to `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Strip every character outside `[A-Za-z0-9_-]`. Never fails; the
    /// result may be empty.
    pub fn sanitize(raw: &str) -> Self {
        RoomId(
            raw.chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                .collect(),
        )
    }

    /// Sanitize `raw` and reject it if nothing usable is left.
    pub fn parse(raw: &str) -> Result<Self, RoomError> {
        let id = Self::sanitize(raw);
        if id.0.is_empty() {
            return Err(RoomError::MissingField { field: "room" });
        }
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Votes
// ---------------------------------------------------------------------------

/// The coffee-break card.
pub const COFFEE_BREAK: &str = "☕";

/// Numeric cards of the canonical deck, in display order.
pub const DECK_POINTS: [i64; 9] = [1, 2, 3, 5, 8, 13, 21, 40, 100];

/// A cast vote: a point value or a marker card such as coffee-break.
///
/// Serialized untagged so the wire form is a bare number or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Vote {
    Points(i64),
    Marker(String),
}

impl Vote {
    pub fn coffee_break() -> Self {
        Vote::Marker(COFFEE_BREAK.to_string())
    }

    /// Whether this card is part of the canonical deck. Advisory only; the
    /// server stores off-deck votes as-is.
    pub fn is_on_deck(&self) -> bool {
        match self {
            Vote::Points(n) => DECK_POINTS.contains(n),
            Vote::Marker(m) => m == COFFEE_BREAK,
        }
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vote::Points(n) => write!(f, "{n}"),
            Vote::Marker(m) => f.write_str(m),
        }
    }
}

/// The full canonical deck: Fibonacci 1..=21, then 40, 100 and coffee-break.
pub fn canonical_deck() -> Vec<Vote> {
    DECK_POINTS
        .iter()
        .map(|&n| Vote::Points(n))
        .chain(std::iter::once(Vote::coffee_break()))
        .collect()
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// A room member as stored in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub vote: Option<Vote>,
}

impl User {
    /// A new member with a fresh id and no vote.
    pub fn new(name: impl Into<String>, is_admin: bool) -> Self {
        User {
            id: format!("user_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            is_admin,
            vote: None,
        }
    }

    pub fn has_voted(&self) -> bool {
        self.vote.is_some()
    }

    /// Project this user for `viewer`: the vote is visible once revealed,
    /// and a user always sees their own vote.
    pub fn view_for(&self, revealed: bool, viewer: &str) -> VoteView {
        let visible = revealed || self.name == viewer;
        VoteView {
            id: self.id.clone(),
            name: self.name.clone(),
            is_admin: self.is_admin,
            vote: if visible { self.vote.clone() } else { None },
            has_voted: self.has_voted(),
        }
    }
}

/// One row of the votes table as a particular member is allowed to see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteView {
    pub id: String,
    pub name: String,
    pub is_admin: bool,
    pub vote: Option<Vote>,
    pub has_voted: bool,
}

// ---------------------------------------------------------------------------
// Room state
// ---------------------------------------------------------------------------

/// Authoritative membership and reveal state of one room.
///
/// Invariant: when `users` is non-empty exactly one of them is admin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomState {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub revealed: bool,
}

impl RoomState {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn user_by_id(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    pub fn admin(&self) -> Option<&User> {
        self.users.iter().find(|u| u.is_admin)
    }

    pub fn admin_count(&self) -> usize {
        self.users.iter().filter(|u| u.is_admin).count()
    }

    /// Whether the first member named `name` is the admin.
    pub fn is_admin_name(&self, name: &str) -> bool {
        self.user_by_name(name).is_some_and(|u| u.is_admin)
    }

    /// Fail with `NotAdmin` unless `name` resolves to the current admin.
    pub fn require_admin(&self, name: &str, action: &'static str) -> Result<(), RoomError> {
        if self.is_admin_name(name) {
            Ok(())
        } else {
            Err(RoomError::NotAdmin { action })
        }
    }

    /// Append a user with a fresh id and no vote.
    pub fn add_user(&mut self, name: &str, is_admin: bool) -> User {
        let user = User::new(name, is_admin);
        self.users.push(user.clone());
        user
    }

    /// Set (or clear, with `None`) a user's vote.
    pub fn set_vote(&mut self, id: &str, vote: Option<Vote>) -> Result<(), RoomError> {
        let user = self
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| RoomError::UserNotFound { id: id.to_string() })?;
        user.vote = vote;
        Ok(())
    }

    /// Remove a user. If they were admin, the earliest remaining joiner
    /// takes over.
    pub fn remove_user(&mut self, id: &str) -> Result<User, RoomError> {
        let idx = self
            .users
            .iter()
            .position(|u| u.id == id)
            .ok_or_else(|| RoomError::UserNotFound { id: id.to_string() })?;
        let removed = self.users.remove(idx);

        if removed.is_admin && self.admin().is_none() {
            if let Some(first) = self.users.first_mut() {
                first.is_admin = true;
            }
        }
        Ok(removed)
    }

    /// Hand admin to `new_admin_id`. `current_admin_id` is demoted whether or
    /// not it is really the admin, and any other admin is demoted too, so
    /// exactly one admin remains.
    ///
    /// Returns whether `current_admin_id` was the admin before the change.
    pub fn promote(&mut self, new_admin_id: &str, current_admin_id: &str) -> Result<bool, RoomError> {
        if self.user_by_id(new_admin_id).is_none() {
            return Err(RoomError::UserNotFound {
                id: new_admin_id.to_string(),
            });
        }
        let was_admin = self
            .user_by_id(current_admin_id)
            .is_some_and(|u| u.is_admin);
        for user in &mut self.users {
            user.is_admin = user.id == new_admin_id;
        }
        Ok(was_admin)
    }

    pub fn reveal(&mut self) {
        self.revealed = true;
    }

    /// Hide votes and clear them all.
    pub fn reset(&mut self) {
        self.revealed = false;
        for user in &mut self.users {
            user.vote = None;
        }
    }

    /// Every user as `viewer` may see them.
    pub fn votes_view(&self, viewer: &str) -> Vec<VoteView> {
        self.users
            .iter()
            .map(|u| u.view_for(self.revealed, viewer))
            .collect()
    }

    /// Encode as the durable, human-readable record.
    pub fn to_snapshot(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_snapshot(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn room_with(names: &[&str]) -> RoomState {
        let mut room = RoomState::default();
        for (i, name) in names.iter().enumerate() {
            room.add_user(name, i == 0);
        }
        room
    }

    // -----------------------------------------------------------------------
    // Room ids
    // -----------------------------------------------------------------------

    #[test]
    fn sanitize_strips_disallowed_characters() {
        assert_eq!(RoomId::sanitize("abc 123/../x").as_str(), "abc123x");
        assert_eq!(RoomId::sanitize("team_a-1").as_str(), "team_a-1");
        assert_eq!(RoomId::sanitize("ümlaut!").as_str(), "mlaut");
    }

    #[test]
    fn parse_rejects_id_that_sanitizes_to_nothing() {
        assert!(matches!(
            RoomId::parse("../!!"),
            Err(RoomError::MissingField { field: "room" })
        ));
        assert_eq!(RoomId::parse(" abc ").unwrap().as_str(), "abc");
    }

    // -----------------------------------------------------------------------
    // Votes
    // -----------------------------------------------------------------------

    #[test]
    fn vote_wire_form_is_bare_value() {
        assert_eq!(serde_json::to_string(&Vote::Points(5)).unwrap(), "5");
        assert_eq!(
            serde_json::to_string(&Vote::coffee_break()).unwrap(),
            "\"☕\""
        );
        assert_eq!(
            serde_json::from_str::<Vote>("13").unwrap(),
            Vote::Points(13)
        );
        assert_eq!(
            serde_json::from_str::<Vote>("\"?\"").unwrap(),
            Vote::Marker("?".into())
        );
    }

    #[test]
    fn canonical_deck_matches_cards() {
        let deck: Vec<String> = canonical_deck().iter().map(|v| v.to_string()).collect();
        assert_eq!(
            deck,
            vec!["1", "2", "3", "5", "8", "13", "21", "40", "100", "☕"]
        );
        assert!(Vote::Points(8).is_on_deck());
        assert!(!Vote::Points(4).is_on_deck());
        assert!(!Vote::Marker("?".into()).is_on_deck());
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    #[test]
    fn add_user_assigns_unique_ids_and_no_vote() {
        let mut room = RoomState::default();
        let a = room.add_user("sam", true);
        let b = room.add_user("sam", false);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("user_"));
        assert_eq!(b.vote, None);
        assert_eq!(room.users.len(), 2);
    }

    #[test]
    fn lookups_return_first_match() {
        let mut room = RoomState::default();
        let first = room.add_user("sam", true);
        room.add_user("sam", false);
        assert_eq!(room.user_by_name("sam").unwrap().id, first.id);
        assert!(room.user_by_name("nobody").is_none());
        assert!(room.user_by_id("user_missing").is_none());
    }

    #[test]
    fn removing_admin_promotes_earliest_remaining() {
        let mut room = room_with(&["alice", "bob", "carol"]);
        let alice = room.user_by_name("alice").unwrap().id.clone();

        let removed = room.remove_user(&alice).unwrap();
        assert_eq!(removed.name, "alice");
        assert!(room.user_by_name("bob").unwrap().is_admin);
        assert!(!room.user_by_name("carol").unwrap().is_admin);
        assert_eq!(room.admin_count(), 1);
    }

    #[test]
    fn removing_non_admin_keeps_admin() {
        let mut room = room_with(&["alice", "bob", "carol"]);
        let bob = room.user_by_name("bob").unwrap().id.clone();
        room.remove_user(&bob).unwrap();
        assert_eq!(room.admin().unwrap().name, "alice");
    }

    #[test]
    fn removing_last_user_leaves_empty_room() {
        let mut room = room_with(&["alice"]);
        let alice = room.users[0].id.clone();
        room.remove_user(&alice).unwrap();
        assert!(room.is_empty());
        assert!(room.admin().is_none());
    }

    #[test]
    fn removing_unknown_user_is_not_found() {
        let mut room = room_with(&["alice"]);
        let before = room.clone();
        assert!(matches!(
            room.remove_user("user_nope"),
            Err(RoomError::UserNotFound { .. })
        ));
        assert_eq!(room, before);
    }

    #[test]
    fn promote_moves_admin_flag() {
        let mut room = room_with(&["alice", "bob"]);
        let alice = room.users[0].id.clone();
        let bob = room.users[1].id.clone();

        assert!(room.promote(&bob, &alice).unwrap());
        assert!(!room.user_by_id(&alice).unwrap().is_admin);
        assert!(room.user_by_id(&bob).unwrap().is_admin);
    }

    #[test]
    fn promote_with_stale_current_admin_still_leaves_one_admin() {
        let mut room = room_with(&["alice", "bob", "carol"]);
        let bob = room.users[1].id.clone();
        let carol = room.users[2].id.clone();

        // bob is not the admin, alice is.
        assert!(!room.promote(&carol, &bob).unwrap());
        assert_eq!(room.admin_count(), 1);
        assert_eq!(room.admin().unwrap().name, "carol");
    }

    #[test]
    fn promote_unknown_target_changes_nothing() {
        let mut room = room_with(&["alice", "bob"]);
        let alice = room.users[0].id.clone();
        let before = room.clone();

        assert!(matches!(
            room.promote("user_ghost", &alice),
            Err(RoomError::UserNotFound { .. })
        ));
        assert_eq!(room, before);
    }

    // -----------------------------------------------------------------------
    // Voting and reveal
    // -----------------------------------------------------------------------

    #[test]
    fn set_vote_unknown_user_is_not_found() {
        let mut room = room_with(&["alice"]);
        assert!(matches!(
            room.set_vote("user_nope", Some(Vote::Points(3))),
            Err(RoomError::UserNotFound { .. })
        ));
    }

    #[test]
    fn votes_hidden_from_others_until_reveal() {
        let mut room = room_with(&["alice", "bob"]);
        let bob = room.users[1].id.clone();
        room.set_vote(&bob, Some(Vote::Points(5))).unwrap();

        let bob_view = room.votes_view("bob");
        assert_eq!(bob_view[1].vote, Some(Vote::Points(5)));

        let alice_view = room.votes_view("alice");
        assert_eq!(alice_view[1].vote, None);
        assert!(alice_view[1].has_voted);
        assert!(!alice_view[0].has_voted);

        room.reveal();
        assert_eq!(room.votes_view("alice")[1].vote, Some(Vote::Points(5)));
    }

    #[test]
    fn reveal_is_idempotent() {
        let mut room = room_with(&["alice"]);
        room.reveal();
        let once = room.clone();
        room.reveal();
        assert_eq!(room, once);
    }

    #[test]
    fn reset_clears_votes_and_reveal() {
        let mut room = room_with(&["alice", "bob"]);
        let ids: Vec<String> = room.users.iter().map(|u| u.id.clone()).collect();
        room.set_vote(&ids[0], Some(Vote::coffee_break())).unwrap();
        room.set_vote(&ids[1], Some(Vote::Points(8))).unwrap();
        room.reveal();

        room.reset();
        assert!(!room.revealed);
        assert!(room.users.iter().all(|u| u.vote.is_none()));
    }

    #[test]
    fn require_admin_checks_stored_flag() {
        let room = room_with(&["alice", "bob"]);
        assert!(room.require_admin("alice", "reveal votes").is_ok());
        assert!(matches!(
            room.require_admin("bob", "reveal votes"),
            Err(RoomError::NotAdmin { .. })
        ));
        assert!(room.require_admin("stranger", "reveal votes").is_err());
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    #[test]
    fn snapshot_round_trip_preserves_room() {
        let mut room = room_with(&["alice", "bob", "carol"]);
        let bob = room.users[1].id.clone();
        room.set_vote(&bob, Some(Vote::coffee_break())).unwrap();
        room.reveal();

        let text = room.to_snapshot().unwrap();
        assert_eq!(RoomState::from_snapshot(&text).unwrap(), room);
    }

    #[test]
    fn snapshot_uses_camel_case_fields() {
        let room = room_with(&["alice"]);
        let value: serde_json::Value = serde_json::from_str(&room.to_snapshot().unwrap()).unwrap();
        assert_eq!(value["users"][0]["isAdmin"], serde_json::json!(true));
        assert_eq!(value["users"][0]["vote"], serde_json::Value::Null);
        assert_eq!(value["revealed"], serde_json::json!(false));
    }

    #[test]
    fn snapshot_with_missing_fields_uses_defaults() {
        let room = RoomState::from_snapshot(r#"{"users":[{"id":"u1","name":"x"}]}"#).unwrap();
        assert!(!room.revealed);
        assert!(!room.users[0].is_admin);
        assert_eq!(room.users[0].vote, None);
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    #[derive(Debug, Clone)]
    enum Op {
        Add,
        Remove(usize),
        Vote(usize, i64),
        Reveal,
        Reset,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Add),
            any::<usize>().prop_map(Op::Remove),
            (any::<usize>(), 0i64..200).prop_map(|(i, v)| Op::Vote(i, v)),
            Just(Op::Reveal),
            Just(Op::Reset),
        ]
    }

    /// Apply an op the way the membership layer does: only the first user of
    /// an empty room joins as admin.
    fn apply(room: &mut RoomState, op: &Op, counter: &mut usize) {
        match op {
            Op::Add => {
                *counter += 1;
                let first = room.is_empty();
                room.add_user(&format!("u{counter}"), first);
            }
            Op::Remove(i) if !room.is_empty() => {
                let id = room.users[i % room.users.len()].id.clone();
                room.remove_user(&id).unwrap();
            }
            Op::Vote(i, v) if !room.is_empty() => {
                let id = room.users[i % room.users.len()].id.clone();
                room.set_vote(&id, Some(Vote::Points(*v))).unwrap();
            }
            Op::Reveal => room.reveal(),
            Op::Reset => room.reset(),
            _ => {}
        }
    }

    proptest! {
        #[test]
        fn non_empty_room_always_has_exactly_one_admin(ops in prop::collection::vec(op_strategy(), 0..64)) {
            let mut room = RoomState::default();
            let mut counter = 0;
            for op in &ops {
                apply(&mut room, op, &mut counter);
                if room.is_empty() {
                    prop_assert_eq!(room.admin_count(), 0);
                } else {
                    prop_assert_eq!(room.admin_count(), 1);
                }
            }
        }

        #[test]
        fn removing_admin_hands_over_to_earliest_joiner(n in 2usize..10) {
            let names: Vec<String> = (0..n).map(|i| format!("u{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut room = room_with(&refs);
            let admin = room.users[0].id.clone();
            let expected = room.users[1].id.clone();

            room.remove_user(&admin).unwrap();
            prop_assert_eq!(&room.admin().unwrap().id, &expected);
        }

        #[test]
        fn reset_always_clears(ops in prop::collection::vec(op_strategy(), 0..32)) {
            let mut room = RoomState::default();
            let mut counter = 0;
            for op in &ops {
                apply(&mut room, op, &mut counter);
            }
            room.reset();
            prop_assert!(!room.revealed);
            prop_assert!(room.users.iter().all(|u| u.vote.is_none()));
        }

        #[test]
        fn hidden_votes_never_leak(ops in prop::collection::vec(op_strategy(), 0..32), viewer in 0usize..8) {
            let mut room = RoomState::default();
            let mut counter = 0;
            for op in &ops {
                apply(&mut room, op, &mut counter);
            }
            let viewer = format!("u{viewer}");
            for row in room.votes_view(&viewer) {
                let stored = room.user_by_id(&row.id).unwrap();
                if row.name == viewer || room.revealed {
                    prop_assert_eq!(&row.vote, &stored.vote);
                } else {
                    prop_assert_eq!(&row.vote, &None);
                }
                prop_assert_eq!(row.has_voted, stored.vote.is_some());
            }
        }

        #[test]
        fn snapshot_round_trip(ops in prop::collection::vec(op_strategy(), 0..32)) {
            let mut room = RoomState::default();
            let mut counter = 0;
            for op in &ops {
                apply(&mut room, op, &mut counter);
            }
            let text = room.to_snapshot().unwrap();
            prop_assert_eq!(RoomState::from_snapshot(&text).unwrap(), room);
        }
    }
}
