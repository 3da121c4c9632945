// Request/response facade over membership and the room aggregate.
//
// Every state-changing call asks the broadcaster to push the new room state,
// so clients on either transport end up with the same view.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::broadcaster::{Broadcaster, RoomEvent};
use crate::membership::{Joined, Membership, MembershipToken};
use crate::room::{Room, RoomError, User, Vote, VoteView};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub token: Option<MembershipToken>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomRequest {
    #[serde(default)]
    pub room: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoteRequest {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub vote: Option<Vote>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VotesRequest {
    #[serde(default)]
    pub room: String,
    /// Name the votes are projected for. Without one, no hidden vote shows.
    #[serde(default)]
    pub viewer: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionRequest {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub token: Option<MembershipToken>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteRequest {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub new_admin_id: String,
    #[serde(default)]
    pub current_admin_id: String,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Status code plus JSON body, ready for whatever transport carries it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(mut body: Value) -> Self {
        if let Value::Object(map) = &mut body {
            map.insert("success".into(), Value::Bool(true));
        }
        ApiResponse { status: 200, body }
    }

    pub fn failure(error: impl Into<String>, status: u16) -> Self {
        ApiResponse {
            status,
            body: json!({"success": false, "error": error.into(), "status": status}),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

impl From<RoomError> for ApiResponse {
    fn from(err: RoomError) -> Self {
        ApiResponse::failure(err.to_string(), err.status())
    }
}

fn respond<T>(result: Result<T, RoomError>, body: impl FnOnce(T) -> Value) -> ApiResponse {
    match result {
        Ok(value) => ApiResponse::ok(body(value)),
        Err(e) => e.into(),
    }
}

// ---------------------------------------------------------------------------
// RequestApi
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RequestApi {
    membership: Membership,
    broadcaster: Arc<Broadcaster>,
}

impl RequestApi {
    pub fn new(membership: Membership, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            membership,
            broadcaster,
        }
    }

    fn room(&self, raw: &str) -> Result<Room, RoomError> {
        self.membership.room(raw)
    }

    async fn push(&self, room: &Room, event: RoomEvent) {
        self.broadcaster.publish(room.id(), event).await;
    }

    pub async fn login(&self, req: &LoginRequest) -> Result<Joined, RoomError> {
        let room = self.room(&req.room)?;
        let joined = self
            .membership
            .join(&req.room, &req.name, req.is_admin, req.token.as_ref())
            .await?;
        if joined.created {
            self.push(&room, RoomEvent::VotesChanged).await;
        }
        Ok(joined)
    }

    /// Open a room under a generated id with the caller as admin.
    pub async fn create_room(&self, req: &CreateRoomRequest) -> Result<Joined, RoomError> {
        self.membership.create_room(&req.name).await
    }

    pub async fn users(&self, req: &RoomRequest) -> Result<Vec<User>, RoomError> {
        self.room(&req.room)?.users().await
    }

    pub async fn logout(&self, req: &LogoutRequest) -> Result<User, RoomError> {
        let room = self.room(&req.room)?;
        let removed = self.membership.leave(&req.room, &req.id).await?;
        self.push(&room, RoomEvent::VotesChanged).await;
        Ok(removed)
    }

    pub async fn vote(&self, req: &VoteRequest) -> Result<(), RoomError> {
        let room = self.room(&req.room)?;
        let id = crate::room::require(Some(&req.id), "id")?;
        room.update_vote(id, req.vote.clone()).await?;
        self.push(&room, RoomEvent::VotesChanged).await;
        Ok(())
    }

    pub async fn flip(&self, req: &RoomRequest) -> Result<(), RoomError> {
        let room = self.room(&req.room)?;
        room.reveal().await?;
        self.push(&room, RoomEvent::Revealed).await;
        Ok(())
    }

    pub async fn votes(&self, req: &VotesRequest) -> Result<Vec<VoteView>, RoomError> {
        self.room(&req.room)?.votes_view(&req.viewer).await
    }

    pub async fn flip_state(&self, req: &RoomRequest) -> Result<bool, RoomError> {
        self.room(&req.room)?.is_revealed().await
    }

    pub async fn reset_flip(&self, req: &RoomRequest) -> Result<(), RoomError> {
        let room = self.room(&req.room)?;
        room.reset().await?;
        self.push(&room, RoomEvent::Reset).await;
        Ok(())
    }

    pub async fn session_user(&self, req: &SessionRequest) -> Result<Option<User>, RoomError> {
        self.membership
            .session_user(&req.room, req.token.as_ref())
            .await
    }

    pub async fn promote_user(&self, req: &PromoteRequest) -> Result<(), RoomError> {
        let room = self.room(&req.room)?;
        let new_admin = crate::room::require(Some(&req.new_admin_id), "newAdminId")?;
        let current_admin = crate::room::require(Some(&req.current_admin_id), "currentAdminId")?;
        room.promote_to_admin(new_admin, current_admin).await?;
        self.push(&room, RoomEvent::VotesChanged).await;
        Ok(())
    }

    /// Dispatch a named action with a JSON body and shape the response.
    pub async fn handle(&self, action: &str, body: &str) -> ApiResponse {
        debug!(action, "api request");
        match action {
            "login" => match parse::<LoginRequest>(body) {
                Ok(req) => respond(self.login(&req).await, |j| {
                    json!({"user": j.user, "token": j.token, "created": j.created})
                }),
                Err(resp) => resp,
            },
            "createRoom" => match parse::<CreateRoomRequest>(body) {
                Ok(req) => respond(self.create_room(&req).await, |j| {
                    json!({"room": j.room, "user": j.user, "token": j.token})
                }),
                Err(resp) => resp,
            },
            "users" => match parse::<RoomRequest>(body) {
                Ok(req) => respond(self.users(&req).await, |users| json!({ "users": users })),
                Err(resp) => resp,
            },
            "logout" => match parse::<LogoutRequest>(body) {
                Ok(req) => respond(self.logout(&req).await, |user| json!({ "user": user })),
                Err(resp) => resp,
            },
            "vote" => match parse::<VoteRequest>(body) {
                Ok(req) => respond(self.vote(&req).await, |()| json!({})),
                Err(resp) => resp,
            },
            "flip" => match parse::<RoomRequest>(body) {
                Ok(req) => respond(self.flip(&req).await, |()| json!({})),
                Err(resp) => resp,
            },
            "votes" => match parse::<VotesRequest>(body) {
                Ok(req) => respond(self.votes(&req).await, |votes| json!({ "votes": votes })),
                Err(resp) => resp,
            },
            "flipstate" => match parse::<RoomRequest>(body) {
                Ok(req) => respond(self.flip_state(&req).await, |revealed| {
                    json!({ "revealed": revealed })
                }),
                Err(resp) => resp,
            },
            "resetflip" => match parse::<RoomRequest>(body) {
                Ok(req) => respond(self.reset_flip(&req).await, |()| json!({})),
                Err(resp) => resp,
            },
            "sessionUser" => match parse::<SessionRequest>(body) {
                Ok(req) => respond(self.session_user(&req).await, |user| json!({ "user": user })),
                Err(resp) => resp,
            },
            "promoteUser" => match parse::<PromoteRequest>(body) {
                Ok(req) => respond(self.promote_user(&req).await, |()| json!({})),
                Err(resp) => resp,
            },
            other => ApiResponse::failure(format!("unknown action `{other}`"), 400),
        }
    }
}

fn parse<T: for<'de> Deserialize<'de> + Default>(body: &str) -> Result<T, ApiResponse> {
    if body.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(body)
        .map_err(|e| ApiResponse::failure(format!("malformed request: {e}"), 400))
}
