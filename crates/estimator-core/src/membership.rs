// Join/leave rules on top of the room aggregate.
//
// The membership token handed out at join time is the user's id. The service
// keeps no state of its own; callers present the token on later requests.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::room::{require, Room, RoomError, RoomId, User};
use crate::store::RoomRepository;

/// Opaque token that re-associates a returning client with its user record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembershipToken(String);

impl MembershipToken {
    pub fn new(token: impl Into<String>) -> Self {
        MembershipToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&User> for MembershipToken {
    fn from(user: &User) -> Self {
        MembershipToken(user.id.clone())
    }
}

impl fmt::Display for MembershipToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Characters after the `room-` prefix of a generated room id.
const GENERATED_ROOM_SUFFIX: usize = 9;

/// Outcome of a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Joined {
    pub room: RoomId,
    pub user: User,
    pub token: MembershipToken,
    /// False when an existing membership was resumed.
    pub created: bool,
}

/// Creates, resumes and removes room memberships.
#[derive(Clone)]
pub struct Membership {
    repo: Arc<RoomRepository>,
}

impl Membership {
    pub fn new(repo: Arc<RoomRepository>) -> Self {
        Self { repo }
    }

    pub fn room(&self, raw_room_id: &str) -> Result<Room, RoomError> {
        Room::open(Arc::clone(&self.repo), raw_room_id)
    }

    /// Join `room_id` as `name`, or resume an existing membership.
    ///
    /// A presented token that matches a user id wins; otherwise an existing
    /// user with the same name is resumed; otherwise a new user is created.
    /// The first user in an empty room is always admin, and a later
    /// `is_admin` request is ignored because a room has a single admin.
    pub async fn join(
        &self,
        room_id: &str,
        name: &str,
        is_admin: bool,
        token: Option<&MembershipToken>,
    ) -> Result<Joined, RoomError> {
        let name = require(Some(name), "name")?;
        let room = self.room(room_id)?;

        let (user, created) = room
            .update(|state| {
                let existing = token
                    .and_then(|t| state.user_by_id(t.as_str()))
                    .or_else(|| state.user_by_name(name));
                if let Some(user) = existing {
                    return Ok((user.clone(), false));
                }
                let admin = state.is_empty();
                Ok((state.add_user(name, admin), true))
            })
            .await?;

        if created {
            info!(
                room = %room.id(),
                user = %user.name,
                id = %user.id,
                admin = user.is_admin,
                requested_admin = is_admin,
                "user joined"
            );
        } else {
            info!(room = %room.id(), user = %user.name, id = %user.id, "user rejoined");
        }

        let token = MembershipToken::from(&user);
        Ok(Joined {
            room: room.id().clone(),
            user,
            token,
            created,
        })
    }

    /// Open a new room under a generated id with `name` as its admin.
    ///
    /// A generated id that already holds users is discarded and another one
    /// drawn, so the creator never lands in someone else's room.
    pub async fn create_room(&self, name: &str) -> Result<Joined, RoomError> {
        let name = require(Some(name), "name")?;
        loop {
            let room = self.room(&generate_room_id())?;
            let user = room
                .update(|state| {
                    if !state.is_empty() {
                        return Ok(None);
                    }
                    Ok(Some(state.add_user(name, true)))
                })
                .await?;

            let Some(user) = user else {
                debug!(room = %room.id(), "generated room id already taken, drawing another");
                continue;
            };
            info!(room = %room.id(), user = %user.name, id = %user.id, "room created");
            return Ok(Joined {
                room: room.id().clone(),
                token: MembershipToken::from(&user),
                user,
                created: true,
            });
        }
    }

    /// Remove the user. Dropping any client-side copy of the token is the
    /// caller's business.
    pub async fn leave(&self, room_id: &str, id: &str) -> Result<User, RoomError> {
        let id = require(Some(id), "id")?;
        self.room(room_id)?.remove_user_by_id(id).await
    }

    /// Resolve a presented token to its user, if it still belongs to the room.
    pub async fn session_user(
        &self,
        room_id: &str,
        token: Option<&MembershipToken>,
    ) -> Result<Option<User>, RoomError> {
        let Some(token) = token else {
            return Ok(None);
        };
        self.room(room_id)?.get_user_by_id(token.as_str()).await
    }
}

fn generate_room_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("room-{}", &suffix[..GENERATED_ROOM_SUFFIX])
}
