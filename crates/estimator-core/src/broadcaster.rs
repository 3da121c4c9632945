// Realtime broadcaster: owns every live connection and the room-grouping
// index, answers client commands by mutating the room aggregate, and fans the
// resulting state out to the room.
//
// The registry has a single writer (this type). Fan-out copies the recipient
// list under the lock and sends after releasing it, so a send never races a
// detach.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::protocol::{now_timestamp, ClientMessage, ProtocolError, ServerMessage};
use crate::room::{Room, RoomError, RoomId, Vote};
use crate::store::RoomRepository;

// ---------------------------------------------------------------------------
// Connection types
// ---------------------------------------------------------------------------

pub type ConnectionId = u64;

/// Depth of each connection's outbound queue. A client that falls this far
/// behind is treated as a failed send and dropped.
pub const OUTBOUND_QUEUE: usize = 64;

/// How often expired probes and idle connections are looked for.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

pub type OutboundSender = mpsc::Sender<Outbound>;

/// Room and user named in the handshake query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeParams {
    pub room: Option<String>,
    pub user: Option<String>,
}

impl HandshakeParams {
    /// Parse `room=...&user=...` from a request query string.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = HandshakeParams::default();
        let query = query.unwrap_or_default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match &*key {
                "room" => params.room = Some(value.into_owned()),
                "user" => params.user = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }

    /// Both parts are required to join a room group.
    fn member(&self) -> Option<Member> {
        let room = RoomId::parse(self.room.as_deref()?).ok()?;
        let user_name = self.user.as_deref()?.trim();
        if user_name.is_empty() {
            return None;
        }
        Some(Member {
            room,
            user_name: user_name.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
    room: RoomId,
    user_name: String,
}

struct Connection {
    state: ConnectionState,
    sender: OutboundSender,
    member: Option<Member>,
    pings: u64,
    last_activity: Instant,
    /// Set when a heartbeat goes out, cleared by any inbound traffic.
    probe_sent_at: Option<Instant>,
    /// Dropped with the connection, which wakes every `closed_signal`.
    closed: watch::Sender<()>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    groups: HashMap<RoomId, BTreeSet<ConnectionId>>,
}

impl Registry {
    /// Remove a connection from the global set and its room group.
    fn detach(&mut self, id: ConnectionId) -> Option<Connection> {
        let mut conn = self.connections.remove(&id)?;
        if let Some(member) = &conn.member {
            if let Some(group) = self.groups.get_mut(&member.room) {
                group.remove(&id);
                if group.is_empty() {
                    self.groups.remove(&member.room);
                }
            }
        }
        conn.state = ConnectionState::Closed;
        Some(conn)
    }

    /// Open connections in `room`, with the user name each one views as.
    fn recipients(
        &self,
        room: &RoomId,
        exclude: Option<ConnectionId>,
    ) -> Vec<(ConnectionId, String, OutboundSender)> {
        let Some(group) = self.groups.get(room) else {
            return Vec::new();
        };
        group
            .iter()
            .filter(|id| Some(**id) != exclude)
            .filter_map(|id| {
                let conn = self.connections.get(id)?;
                if conn.state != ConnectionState::Open {
                    return None;
                }
                let member = conn.member.as_ref()?;
                Some((*id, member.user_name.clone(), conn.sender.clone()))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("connection is not joined to a room")]
    NotJoined,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Room(#[from] RoomError),
}

impl CommandError {
    pub fn code(&self) -> u16 {
        match self {
            CommandError::NotJoined | CommandError::Protocol(_) => 400,
            CommandError::Room(e) => e.status(),
        }
    }
}

/// Which state change a room push reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent {
    VotesChanged,
    Revealed,
    Reset,
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

/// Live connection registry and command handler. Build one at startup and
/// share it by `Arc`.
pub struct Broadcaster {
    repo: Arc<RoomRepository>,
    heartbeat: HeartbeatConfig,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new(repo: Arc<RoomRepository>, heartbeat: HeartbeatConfig) -> Self {
        Self {
            repo,
            heartbeat,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Panics if the registry mutex is poisoned, which only happens if a
    /// thread panicked mid-update.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("connection registry poisoned")
    }

    fn room(&self, id: &RoomId) -> Room {
        Room::with_id(Arc::clone(&self.repo), id.clone())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register a connection that completed its handshake.
    ///
    /// With both `room` and `user` present it joins the room group, gets
    /// `connection_established`, and the rest of the room gets `user_joined`.
    /// Otherwise it stays outside every group and receives no broadcasts.
    pub async fn connect(&self, params: HandshakeParams, sender: OutboundSender) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let member = params.member();

        {
            let mut reg = self.registry();
            reg.connections.insert(
                id,
                Connection {
                    state: ConnectionState::Connecting,
                    sender,
                    member: member.clone(),
                    pings: 0,
                    last_activity: Instant::now(),
                    probe_sent_at: None,
                    closed: watch::channel(()).0,
                },
            );
            if let Some(member) = &member {
                reg.groups.entry(member.room.clone()).or_default().insert(id);
            }
            if let Some(conn) = reg.connections.get_mut(&id) {
                conn.state = ConnectionState::Open;
            }
        }

        let Some(member) = member else {
            debug!(connection = id, ?params, "connection opened without room membership");
            return id;
        };
        info!(connection = id, room = %member.room, user = %member.user_name, "connection joined room");

        self.send_to(
            id,
            &ServerMessage::ConnectionEstablished {
                message: "Connected successfully".into(),
                timestamp: now_timestamp(),
                heartbeat_interval: self.heartbeat.interval_secs,
            },
        );

        let announced = self.repo.inspect(&member.room, |state| {
            self.broadcast(&member.room, Some(id), &|viewer| ServerMessage::UserJoined {
                user_name: member.user_name.clone(),
                users: state.votes_view(viewer),
            });
        });
        if let Err(e) = announced.await {
            warn!(room = %member.room, "could not load room for join notice: {e}");
        }
        id
    }

    /// Detach a connection and tell its room. Safe to call more than once.
    ///
    /// This only ends the live connection; the user stays a room member.
    pub fn disconnect(&self, id: ConnectionId) {
        let Some(conn) = self.registry().detach(id) else {
            return;
        };
        info!(connection = id, "connection closed");
        if let Some(member) = conn.member {
            self.notify_left(&member);
        }
    }

    /// Close a connection from the server side, optionally with a final
    /// message.
    fn close_connection(&self, id: ConnectionId, farewell: Option<&ServerMessage>) {
        let sender = {
            let mut reg = self.registry();
            let Some(conn) = reg.connections.get_mut(&id) else {
                return;
            };
            conn.state = ConnectionState::Closing;
            conn.sender.clone()
        };
        if let Some(text) = farewell.and_then(|msg| encode(msg)) {
            let _ = sender.try_send(Outbound::Text(text));
        }
        let _ = sender.try_send(Outbound::Close);
        self.disconnect(id);
    }

    /// Record inbound traffic: refreshes idle time and answers any probe.
    pub fn touch(&self, id: ConnectionId) {
        if let Some(conn) = self.registry().connections.get_mut(&id) {
            conn.last_activity = Instant::now();
            conn.probe_sent_at = None;
        }
    }

    pub fn connection_state(&self, id: ConnectionId) -> ConnectionState {
        self.registry()
            .connections
            .get(&id)
            .map_or(ConnectionState::Closed, |c| c.state)
    }

    pub fn connection_count(&self) -> usize {
        self.registry().connections.len()
    }

    /// Resolves once `id` leaves the registry, whoever removed it. `None`
    /// when it is already gone.
    ///
    /// The transport waits on this alongside the socket so a server-side
    /// close tears the socket down even if the peer never answers.
    pub fn closed_signal(&self, id: ConnectionId) -> Option<watch::Receiver<()>> {
        self.registry()
            .connections
            .get(&id)
            .map(|conn| conn.closed.subscribe())
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Handle one text frame from a connection. Failures are reported to
    /// that connection only.
    pub async fn handle_message(&self, id: ConnectionId, text: &str) {
        let member = {
            let mut reg = self.registry();
            let Some(conn) = reg.connections.get_mut(&id) else {
                return;
            };
            conn.last_activity = Instant::now();
            conn.probe_sent_at = None;
            conn.member.clone()
        };

        let result = match ClientMessage::parse(text) {
            Ok(msg) => self.dispatch(id, member, msg).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            debug!(connection = id, "command rejected: {e}");
            self.send_to(id, &ServerMessage::error(e.to_string(), e.code()));
        }
    }

    async fn dispatch(
        &self,
        id: ConnectionId,
        member: Option<Member>,
        msg: ClientMessage,
    ) -> Result<(), CommandError> {
        match msg {
            ClientMessage::Ping => {
                let count = self.bump_pings(id);
                self.send_to(
                    id,
                    &ServerMessage::Pong {
                        timestamp: now_timestamp(),
                        heartbeat_count: count,
                    },
                );
            }
            ClientMessage::Keepalive => {
                self.send_to(
                    id,
                    &ServerMessage::KeepaliveAck {
                        timestamp: now_timestamp(),
                    },
                );
            }
            ClientMessage::Pong => {}
            ClientMessage::Vote { user_id, vote } => {
                let member = member.ok_or(CommandError::NotJoined)?;
                self.cast_vote(&member, user_id, vote).await?;
            }
            ClientMessage::Flip => {
                let member = member.ok_or(CommandError::NotJoined)?;
                self.room(&member.room).reveal_as(&member.user_name).await?;
                info!(room = %member.room, by = %member.user_name, "votes revealed");
                self.publish(&member.room, RoomEvent::Revealed).await;
            }
            ClientMessage::Reset => {
                let member = member.ok_or(CommandError::NotJoined)?;
                self.room(&member.room).reset_as(&member.user_name).await?;
                info!(room = %member.room, by = %member.user_name, "round reset");
                self.publish(&member.room, RoomEvent::Reset).await;
            }
            ClientMessage::RemoveUser { user_name, user_id } => {
                let member = member.ok_or(CommandError::NotJoined)?;
                self.room(&member.room)
                    .ensure_admin(&member.user_name, "remove users")
                    .await?;
                let user_name = non_blank(user_name);
                let user_id = non_blank(user_id);
                if user_name.is_empty() && user_id.is_empty() {
                    return Err(RoomError::MissingField { field: "userName" }.into());
                }
                self.evict(&member.room, &user_name, &user_id);
            }
        }
        Ok(())
    }

    async fn cast_vote(
        &self,
        member: &Member,
        user_id: Option<String>,
        vote: Option<Vote>,
    ) -> Result<(), RoomError> {
        let room = self.room(&member.room);
        let user_id = match user_id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id,
            None => room
                .get_user_by_name(&member.user_name)
                .await?
                .map(|u| u.id)
                .ok_or(RoomError::MissingField { field: "userId" })?,
        };
        room.update_vote(&user_id, vote).await?;
        self.publish(&member.room, RoomEvent::VotesChanged).await;
        Ok(())
    }

    fn bump_pings(&self, id: ConnectionId) -> u64 {
        let mut reg = self.registry();
        match reg.connections.get_mut(&id) {
            Some(conn) => {
                conn.pings += 1;
                conn.pings
            }
            None => 0,
        }
    }

    /// Tell the room a user was removed, then close that user's
    /// connections. Membership itself is left to the caller.
    fn evict(&self, room: &RoomId, user_name: &str, user_id: &str) {
        let removed = ServerMessage::UserRemoved {
            user_name: user_name.to_string(),
            user_id: user_id.to_string(),
        };
        self.broadcast(room, None, &|_| removed.clone());

        if user_name.is_empty() {
            return;
        }
        let targets: Vec<ConnectionId> = self
            .registry()
            .recipients(room, None)
            .into_iter()
            .filter(|(_, name, _)| name == user_name)
            .map(|(id, _, _)| id)
            .collect();
        for id in targets {
            info!(connection = id, room = %room, user = user_name, "closing removed user's connection");
            self.close_connection(id, None);
        }
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Push the room's current state to every member, each projected for
    /// its own viewer so hidden votes stay hidden.
    ///
    /// The room stays locked from the read until every queue has the
    /// message, so pushes reach each member in the order the states were
    /// committed.
    pub async fn publish(&self, room: &RoomId, event: RoomEvent) {
        let pushed = self.repo.inspect(room, |state| {
            let revealed = state.revealed;
            self.broadcast(room, None, &|viewer| {
                let votes = state.votes_view(viewer);
                match event {
                    RoomEvent::VotesChanged => ServerMessage::VotesUpdate { votes, revealed },
                    RoomEvent::Revealed => ServerMessage::VoteRevealed { votes, revealed },
                    RoomEvent::Reset => ServerMessage::VoteReset { votes, revealed },
                }
            });
        });
        if let Err(e) = pushed.await {
            warn!(room = %room, "could not load room state for broadcast: {e}");
        }
    }

    fn notify_left(&self, member: &Member) {
        let left = ServerMessage::UserLeft {
            user_name: member.user_name.clone(),
        };
        self.broadcast(&member.room, None, &|_| left.clone());
    }

    fn broadcast(
        &self,
        room: &RoomId,
        exclude: Option<ConnectionId>,
        build: &dyn Fn(&str) -> ServerMessage,
    ) {
        let failed = self.deliver(room, exclude, build);
        self.drop_failed(failed);
    }

    /// Send to each open member of `room`. Returns the connections whose
    /// queue rejected the message.
    fn deliver(
        &self,
        room: &RoomId,
        exclude: Option<ConnectionId>,
        build: &dyn Fn(&str) -> ServerMessage,
    ) -> Vec<ConnectionId> {
        let recipients = self.registry().recipients(room, exclude);
        let mut failed = Vec::new();
        for (id, viewer, sender) in recipients {
            let Some(text) = encode(&build(&viewer)) else {
                continue;
            };
            if let Err(e) = sender.try_send(Outbound::Text(text)) {
                debug!(connection = id, "send failed: {e}");
                failed.push(id);
            }
        }
        failed
    }

    /// Detach connections whose sends failed and tell their rooms. Those
    /// notices can fail in turn, so this works through a queue.
    fn drop_failed(&self, mut failed: Vec<ConnectionId>) {
        while let Some(id) = failed.pop() {
            let Some(conn) = self.registry().detach(id) else {
                continue;
            };
            warn!(connection = id, "dropping connection after failed send");
            if let Some(member) = conn.member {
                let left = ServerMessage::UserLeft {
                    user_name: member.user_name,
                };
                failed.extend(self.deliver(&member.room, None, &|_| left.clone()));
            }
        }
    }

    /// Direct reply to one connection.
    fn send_to(&self, id: ConnectionId, msg: &ServerMessage) {
        let Some(sender) = self.registry().connections.get(&id).map(|c| c.sender.clone()) else {
            return;
        };
        let Some(text) = encode(msg) else {
            return;
        };
        if sender.try_send(Outbound::Text(text)).is_err() {
            self.drop_failed(vec![id]);
        }
    }

    // -----------------------------------------------------------------------
    // Heartbeat
    // -----------------------------------------------------------------------

    /// Probe every open connection with a `heartbeat` message and a
    /// transport ping. Returns how many were probed successfully.
    pub fn heartbeat(&self, now: Instant) -> usize {
        let targets: Vec<(ConnectionId, OutboundSender)> = {
            let mut reg = self.registry();
            reg.connections
                .iter_mut()
                .filter(|(_, c)| c.state == ConnectionState::Open)
                .map(|(id, c)| {
                    c.probe_sent_at.get_or_insert(now);
                    (*id, c.sender.clone())
                })
                .collect()
        };

        let message = ServerMessage::Heartbeat {
            timestamp: now_timestamp(),
            server_time: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        let Some(text) = encode(&message) else {
            return 0;
        };

        let mut failed = Vec::new();
        for (id, sender) in &targets {
            let ok = sender.try_send(Outbound::Text(text.clone())).is_ok()
                && sender.try_send(Outbound::Ping).is_ok();
            if !ok {
                failed.push(*id);
            }
        }
        let probed = targets.len() - failed.len();
        self.drop_failed(failed);
        probed
    }

    /// Close connections that left a probe unanswered past the timeout or
    /// have been idle too long. Returns the closed ids.
    pub fn sweep(&self, now: Instant) -> Vec<ConnectionId> {
        let timeout = self.heartbeat.timeout();
        let max_idle = self.heartbeat.max_idle();

        let expired: Vec<(ConnectionId, &'static str)> = {
            let reg = self.registry();
            reg.connections
                .iter()
                .filter(|(_, c)| c.state == ConnectionState::Open)
                .filter_map(|(id, c)| {
                    if c.probe_sent_at
                        .is_some_and(|sent| now.saturating_duration_since(sent) >= timeout)
                    {
                        Some((*id, "Connection closed: heartbeat not answered"))
                    } else if now.saturating_duration_since(c.last_activity) >= max_idle {
                        Some((*id, "Connection closed due to inactivity"))
                    } else {
                        None
                    }
                })
                .collect()
        };

        let mut closed = Vec::with_capacity(expired.len());
        for (id, reason) in expired {
            info!(connection = id, "{reason}");
            let notice = ServerMessage::ConnectionTimeout {
                message: reason.to_string(),
                timestamp: now_timestamp(),
            };
            self.close_connection(id, Some(&notice));
            closed.push(id);
        }
        closed
    }

    /// Probe on the configured interval and sweep for dead connections until
    /// the task is cancelled.
    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut probe = tokio::time::interval(self.heartbeat.interval());
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        // The first tick completes immediately; consume it so the first
        // probe goes out after one full interval.
        probe.tick().await;

        loop {
            tokio::select! {
                _ = probe.tick() => {
                    let probed = self.heartbeat(Instant::now());
                    debug!(probed, "heartbeat sent");
                }
                _ = sweep.tick() => {
                    let closed = self.sweep(Instant::now());
                    if !closed.is_empty() {
                        info!(count = closed.len(), "closed unresponsive connections");
                    }
                }
            }
        }
    }
}

fn encode(msg: &ServerMessage) -> Option<String> {
    match msg.to_json() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(kind = msg.kind(), "failed to encode message: {e}");
            None
        }
    }
}

fn non_blank(value: Option<String>) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_default()
}
