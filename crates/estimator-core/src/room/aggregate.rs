// Async handle for one room. Every call is a locked read-modify-write (or a
// locked read) against the room's durable snapshot.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::model::{RoomId, RoomState, User, Vote, VoteView};
use super::RoomError;
use crate::store::RoomRepository;

/// One room, addressed by sanitized id.
///
/// The handle holds no state of its own, so it is cheap to build per
/// request and always sees the latest persisted snapshot.
#[derive(Clone)]
pub struct Room {
    id: RoomId,
    repo: Arc<RoomRepository>,
}

impl Room {
    /// Open `raw_id` after sanitizing it. Fails only if nothing is left of
    /// the id.
    pub fn open(repo: Arc<RoomRepository>, raw_id: &str) -> Result<Self, RoomError> {
        Ok(Self {
            id: RoomId::parse(raw_id)?,
            repo,
        })
    }

    pub fn with_id(repo: Arc<RoomRepository>, id: RoomId) -> Self {
        Self { id, repo }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub(crate) async fn update<T, F>(&self, apply: F) -> Result<T, RoomError>
    where
        F: FnOnce(&mut RoomState) -> Result<T, RoomError>,
    {
        self.repo.update(&self.id, apply).await
    }

    /// Latest persisted state.
    pub async fn state(&self) -> Result<RoomState, RoomError> {
        Ok(self.repo.read(&self.id).await?)
    }

    pub async fn users(&self) -> Result<Vec<User>, RoomError> {
        Ok(self.state().await?.users)
    }

    pub async fn is_revealed(&self) -> Result<bool, RoomError> {
        Ok(self.state().await?.revealed)
    }

    pub async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, RoomError> {
        Ok(self.state().await?.user_by_id(id).cloned())
    }

    pub async fn get_user_by_name(&self, name: &str) -> Result<Option<User>, RoomError> {
        Ok(self.state().await?.user_by_name(name).cloned())
    }

    /// Append a user. No name uniqueness check; the caller decides admin.
    pub async fn add_user(&self, name: &str, is_admin: bool) -> Result<User, RoomError> {
        let user = self
            .update(|state| Ok(state.add_user(name, is_admin)))
            .await?;
        info!(room = %self.id, user = %user.name, id = %user.id, admin = is_admin, "user added");
        Ok(user)
    }

    /// Set or clear a vote. Off-deck values are stored unchanged.
    pub async fn update_vote(&self, id: &str, vote: Option<Vote>) -> Result<(), RoomError> {
        if let Some(v) = vote.as_ref().filter(|v| !v.is_on_deck()) {
            debug!(room = %self.id, id, vote = %v, "storing off-deck vote");
        }
        self.update(|state| state.set_vote(id, vote)).await
    }

    /// Remove a user, promoting the earliest remaining joiner if the admin
    /// left.
    pub async fn remove_user_by_id(&self, id: &str) -> Result<User, RoomError> {
        let (removed, new_admin) = self
            .update(|state| {
                let removed = state.remove_user(id)?;
                let new_admin = state.admin().map(|u| u.name.clone());
                Ok((removed, new_admin))
            })
            .await?;

        info!(room = %self.id, user = %removed.name, id, "user removed");
        if removed.is_admin {
            if let Some(name) = new_admin {
                info!(room = %self.id, admin = %name, "admin handed to earliest remaining user");
            }
        }
        Ok(removed)
    }

    /// Make `new_admin_id` the only admin. There is no ownership check on
    /// `current_admin_id`.
    pub async fn promote_to_admin(
        &self,
        new_admin_id: &str,
        current_admin_id: &str,
    ) -> Result<(), RoomError> {
        let was_admin = self
            .update(|state| state.promote(new_admin_id, current_admin_id))
            .await?;
        if !was_admin {
            warn!(
                room = %self.id,
                current_admin_id,
                "promotion requested by a user who was not the admin"
            );
        }
        info!(room = %self.id, new_admin_id, "admin promoted");
        Ok(())
    }

    pub async fn reveal(&self) -> Result<(), RoomError> {
        self.update(|state| {
            state.reveal();
            Ok(())
        })
        .await
    }

    /// Clear every vote and hide them, as one write.
    pub async fn reset(&self) -> Result<(), RoomError> {
        self.update(|state| {
            state.reset();
            Ok(())
        })
        .await
    }

    /// Reveal on behalf of `actor`, who must be the stored admin. The check
    /// and the write happen under the same lock.
    pub async fn reveal_as(&self, actor: &str) -> Result<(), RoomError> {
        self.update(|state| {
            state.require_admin(actor, "reveal votes")?;
            state.reveal();
            Ok(())
        })
        .await
    }

    /// Reset on behalf of `actor`, who must be the stored admin.
    pub async fn reset_as(&self, actor: &str) -> Result<(), RoomError> {
        self.update(|state| {
            state.require_admin(actor, "reset the round")?;
            state.reset();
            Ok(())
        })
        .await
    }

    /// Fail unless `actor` is the stored admin.
    pub async fn ensure_admin(&self, actor: &str, action: &'static str) -> Result<(), RoomError> {
        self.state().await?.require_admin(actor, action)
    }

    /// Votes as `viewer` may see them.
    pub async fn votes_view(&self, viewer: &str) -> Result<Vec<VoteView>, RoomError> {
        Ok(self.state().await?.votes_view(viewer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RetryPolicy, SqliteRoomStore};

    fn test_room(id: &str) -> Room {
        let store = Arc::new(SqliteRoomStore::open(":memory:").unwrap());
        let repo = Arc::new(RoomRepository::new(store, RetryPolicy::default()));
        Room::open(repo, id).unwrap()
    }

    #[tokio::test]
    async fn open_sanitizes_room_id() {
        let room = test_room("abc 123!");
        assert_eq!(room.id().as_str(), "abc123");
    }

    #[tokio::test]
    async fn open_rejects_empty_id() {
        let store = Arc::new(SqliteRoomStore::open(":memory:").unwrap());
        let repo = Arc::new(RoomRepository::new(store, RetryPolicy::default()));
        assert!(matches!(
            Room::open(repo, "%%%"),
            Err(RoomError::MissingField { field: "room" })
        ));
    }

    #[tokio::test]
    async fn nonexistent_room_reads_as_empty() {
        let room = test_room("fresh");
        assert!(room.users().await.unwrap().is_empty());
        assert!(!room.is_revealed().await.unwrap());
        assert!(room.votes_view("anyone").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mutations_are_persisted() {
        let room = test_room("abc123");
        let alice = room.add_user("alice", true).await.unwrap();
        room.update_vote(&alice.id, Some(Vote::Points(3))).await.unwrap();
        room.reveal().await.unwrap();

        let state = room.state().await.unwrap();
        assert_eq!(state.users[0].vote, Some(Vote::Points(3)));
        assert!(state.revealed);
    }

    #[tokio::test]
    async fn off_deck_vote_is_accepted() {
        let room = test_room("r");
        let alice = room.add_user("alice", true).await.unwrap();
        room.update_vote(&alice.id, Some(Vote::Points(7))).await.unwrap();
        assert_eq!(
            room.get_user_by_id(&alice.id).await.unwrap().unwrap().vote,
            Some(Vote::Points(7))
        );
    }

    #[tokio::test]
    async fn vote_for_unknown_user_is_not_found() {
        let room = test_room("r");
        room.add_user("alice", true).await.unwrap();
        let err = room
            .update_vote("user_nope", Some(Vote::Points(1)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn reveal_as_requires_stored_admin() {
        let room = test_room("r");
        room.add_user("alice", true).await.unwrap();
        room.add_user("bob", false).await.unwrap();

        let err = room.reveal_as("bob").await.unwrap_err();
        assert!(matches!(err, RoomError::NotAdmin { .. }));
        assert!(!room.is_revealed().await.unwrap());

        room.reveal_as("alice").await.unwrap();
        assert!(room.is_revealed().await.unwrap());
    }

    #[tokio::test]
    async fn reset_as_rejects_demoted_admin() {
        let room = test_room("r");
        let alice = room.add_user("alice", true).await.unwrap();
        let bob = room.add_user("bob", false).await.unwrap();
        room.update_vote(&bob.id, Some(Vote::Points(2))).await.unwrap();

        room.promote_to_admin(&bob.id, &alice.id).await.unwrap();

        assert!(room.reset_as("alice").await.is_err());
        room.reset_as("bob").await.unwrap();
        assert_eq!(room.get_user_by_id(&bob.id).await.unwrap().unwrap().vote, None);
    }

    #[tokio::test]
    async fn remove_admin_promotes_next_joiner() {
        let room = test_room("r");
        let alice = room.add_user("alice", true).await.unwrap();
        room.add_user("bob", false).await.unwrap();
        room.add_user("carol", false).await.unwrap();

        room.remove_user_by_id(&alice.id).await.unwrap();
        let bob = room.get_user_by_name("bob").await.unwrap().unwrap();
        assert!(bob.is_admin);
    }

    #[tokio::test]
    async fn concurrent_votes_are_not_lost() {
        let room = test_room("r");
        let alice = room.add_user("alice", true).await.unwrap();
        let bob = room.add_user("bob", false).await.unwrap();

        let mut handles = Vec::new();
        for (id, points) in [(alice.id.clone(), 3), (bob.id.clone(), 5)] {
            let room = room.clone();
            handles.push(tokio::spawn(async move {
                room.update_vote(&id, Some(Vote::Points(points))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let state = room.state().await.unwrap();
        assert_eq!(state.user_by_id(&alice.id).unwrap().vote, Some(Vote::Points(3)));
        assert_eq!(state.user_by_id(&bob.id).unwrap().vote, Some(Vote::Points(5)));
    }
}
