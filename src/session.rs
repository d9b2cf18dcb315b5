use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use crate::config::GameSettings;
use crate::error::{ErrorKind, GameError};
use crate::store::RoomStore;
use crate::tournament::BracketEngine;
use crate::types::*;

/// Commands the WebSocket handler (and the bracket engine) send to a session task.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Join {
        conn_id: String,
        user_id: String,
        username: String,
    },
    Ready {
        conn_id: String,
    },
    Start {
        conn_id: String,
    },
    PaddleMove {
        conn_id: String,
        position: f64,
        rotation: f64,
    },
    SetBallVelocity {
        conn_id: String,
        x: f64,
        y: f64,
    },
    UpdateScore {
        conn_id: String,
        side: Side,
    },
    ResetRound {
        conn_id: String,
        last_winner: Option<Side>,
        last_loser: Option<Side>,
    },
    EndGame {
        conn_id: String,
    },
    Disconnect {
        conn_id: String,
    },
    /// Bracket-driven forfeit: the named user loses their live match.
    Forfeit {
        user_id: String,
    },
}

/// Events fanned out from a session to its room's connections.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Send a message to a specific connection.
    SendTo { conn_id: String, msg: ServerMsg },
    /// Broadcast a message to all connections in the room.
    Broadcast { msg: ServerMsg },
    /// Ask the hub to drop a connection.
    CloseConn { conn_id: String },
}

#[derive(Clone)]
pub struct SessionHandle {
    pub room: String,
    pub cmd_tx: mpsc::Sender<SessionCommand>,
    pub event_tx: broadcast::Sender<SessionEvent>,
}

/// Process-wide map from room name to its single live session.
///
/// Creation happens under the map entry lock, so no two callers ever
/// observe different sessions for the same room.
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, SessionHandle>>,
    store: Arc<dyn RoomStore>,
    bracket: Arc<BracketEngine>,
    settings: GameSettings,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn RoomStore>,
        bracket: Arc<BracketEngine>,
        settings: GameSettings,
        sessions: Arc<DashMap<String, SessionHandle>>,
    ) -> Self {
        Self {
            sessions,
            store,
            bracket,
            settings,
        }
    }

    pub fn get_or_create(&self, room: &str) -> Result<SessionHandle, GameError> {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(room.to_string()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let config = self.store.get_room_config(room)?;
                if self.store.room_status(room)? != RoomStatus::Waiting {
                    return Err(GameError::RoomNotJoinable);
                }
                let tournament = self.store.room_tournament(room)?;

                let (cmd_tx, cmd_rx) = mpsc::channel(256);
                let (event_tx, _) = broadcast::channel(256);
                let handle = SessionHandle {
                    room: room.to_string(),
                    cmd_tx,
                    event_tx: event_tx.clone(),
                };
                e.insert(handle.clone());

                let state = SessionState {
                    room: room.to_string(),
                    config,
                    settings: self.settings.clone(),
                    store: self.store.clone(),
                    bracket: self.bracket.clone(),
                    tournament,
                    roster: Vec::new(),
                    conn_users: HashMap::new(),
                    user_conns: HashMap::new(),
                    paddles: HashMap::new(),
                    scores: HashMap::new(),
                    ball: BallState::default(),
                    is_playing: false,
                    completed: false,
                };
                tokio::spawn(session_task(state, cmd_rx, event_tx, self.sessions.clone()));

                tracing::info!("Session created for room {}", room);
                Ok(handle)
            }
        }
    }

    pub fn get(&self, room: &str) -> Option<SessionHandle> {
        self.sessions.get(room).map(|h| h.value().clone())
    }
}

/// The authoritative in-memory state of one room's game.
struct SessionState {
    room: String,
    config: RoomConfig,
    settings: GameSettings,
    store: Arc<dyn RoomStore>,
    bracket: Arc<BracketEngine>,
    /// Set when this room backs a tournament match.
    tournament: Option<String>,

    roster: Vec<PlayerInfo>,
    /// conn_id -> user_id
    conn_users: HashMap<String, String>,
    /// user_id -> conn_id
    user_conns: HashMap<String, String>,

    paddles: HashMap<Side, PaddleState>,
    scores: HashMap<Side, u32>,
    ball: BallState,
    is_playing: bool,
    completed: bool,
}

impl SessionState {
    fn send_to(&self, tx: &broadcast::Sender<SessionEvent>, conn_id: &str, msg: ServerMsg) {
        let _ = tx.send(SessionEvent::SendTo {
            conn_id: conn_id.to_string(),
            msg,
        });
    }

    fn broadcast(&self, tx: &broadcast::Sender<SessionEvent>, msg: ServerMsg) {
        let _ = tx.send(SessionEvent::Broadcast { msg });
    }

    fn send_error(&self, tx: &broadcast::Sender<SessionEvent>, conn_id: &str, err: &GameError) {
        self.send_to(
            tx,
            conn_id,
            ServerMsg::Error {
                message: err.to_string(),
            },
        );
    }

    /// The single start-eligibility predicate: full room, everyone ready.
    fn start_eligible(&self) -> bool {
        self.roster.len() == self.config.capacity && self.roster.iter().all(|p| p.is_ready)
    }

    fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            players: self.roster.clone(),
            paddles: self.paddles.clone(),
            scores: self.scores.clone(),
            ball: self.ball,
            is_playing: self.is_playing,
        }
    }

    fn broadcast_snapshot(&self, tx: &broadcast::Sender<SessionEvent>) {
        self.broadcast(
            tx,
            ServerMsg::GameStateUpdate {
                state: self.snapshot(),
            },
        );
    }

    fn broadcast_players(&self, tx: &broadcast::Sender<SessionEvent>) {
        self.broadcast(
            tx,
            ServerMsg::PlayerUpdate {
                players: self.roster.clone(),
                all_ready: self.start_eligible(),
            },
        );
    }

    fn refresh_roster(&mut self) {
        match self.store.room_players(&self.room) {
            Ok(mut players) => {
                for p in &mut players {
                    p.connected = self.user_conns.contains_key(&p.id);
                }
                self.roster = players;
            }
            Err(e) => tracing::warn!("Room {}: roster refresh failed: {}", self.room, e),
        }
    }

    fn user_of_conn(&self, conn_id: &str) -> Option<String> {
        self.conn_users.get(conn_id).cloned()
    }

    fn player(&self, user_id: &str) -> Option<&PlayerInfo> {
        self.roster.iter().find(|p| p.id == user_id)
    }

    fn player_on_side(&self, side: Side) -> Option<String> {
        self.roster.iter().find(|p| p.side == side).map(|p| p.id.clone())
    }

    fn score_of(&self, side: Side) -> u32 {
        self.scores.get(&side).copied().unwrap_or(0)
    }

    /// Remaining participant with the highest score (ties go to the lowest
    /// seat), excluding `exclude` when given.
    fn leader_among(&self, exclude: Option<&str>) -> Option<PlayerInfo> {
        self.roster
            .iter()
            .filter(|p| Some(p.id.as_str()) != exclude)
            .max_by(|a, b| {
                self.score_of(a.side)
                    .cmp(&self.score_of(b.side))
                    .then(b.seat_number.cmp(&a.seat_number))
            })
            .cloned()
    }

    fn scores_by_user(&self) -> HashMap<String, u32> {
        self.roster
            .iter()
            .map(|p| (p.id.clone(), self.score_of(p.side)))
            .collect()
    }

    /// One simulation step: advance the ball by its velocity.
    fn step(&mut self) {
        self.ball.pos.x += self.ball.vel.x;
        self.ball.pos.y += self.ball.vel.y;
    }
}

/// Per-session actor: consumes commands and drives the tick loop.
///
/// All mutation of the session state happens on this task, so client events
/// and the simulation never race. The tick branch is armed only while the
/// game is playing and disarms itself the moment `is_playing` flips false.
async fn session_task(
    mut state: SessionState,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
    sessions: Arc<DashMap<String, SessionHandle>>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(state.settings.tick_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                if handle_command(&mut state, &event_tx, cmd).await {
                    break;
                }
            }
            _ = ticker.tick(), if state.is_playing => {
                state.step();
                state.broadcast_snapshot(&event_tx);
            }
        }
    }

    sessions.remove(&state.room);
    tracing::info!("Session for room {} ended", state.room);
}

/// Returns true when the session is done and the task should exit.
async fn handle_command(
    state: &mut SessionState,
    tx: &broadcast::Sender<SessionEvent>,
    cmd: SessionCommand,
) -> bool {
    match cmd {
        SessionCommand::Join {
            conn_id,
            user_id,
            username,
        } => handle_join(state, tx, conn_id, user_id, username),
        SessionCommand::Ready { conn_id } => handle_ready(state, tx, conn_id),
        SessionCommand::Start { conn_id } => handle_start(state, tx, conn_id),
        SessionCommand::PaddleMove {
            conn_id,
            position,
            rotation,
        } => handle_paddle_move(state, tx, conn_id, position, rotation),
        SessionCommand::SetBallVelocity { conn_id, x, y } => {
            handle_set_ball_velocity(state, conn_id, x, y)
        }
        SessionCommand::UpdateScore { conn_id, side } => {
            return handle_update_score(state, tx, conn_id, side).await;
        }
        SessionCommand::ResetRound {
            conn_id,
            last_winner,
            last_loser,
        } => handle_reset_round(state, tx, conn_id, last_winner, last_loser),
        SessionCommand::EndGame { conn_id } => {
            return handle_end_game(state, tx, conn_id).await;
        }
        SessionCommand::Disconnect { conn_id } => {
            return handle_disconnect(state, tx, conn_id).await;
        }
        SessionCommand::Forfeit { user_id } => {
            return handle_forfeit(state, tx, &user_id).await;
        }
    }
    false
}

fn handle_join(
    state: &mut SessionState,
    tx: &broadcast::Sender<SessionEvent>,
    conn_id: String,
    user_id: String,
    username: String,
) {
    match state.store.join_room(&state.room, &user_id, &username) {
        Ok(outcome) => {
            let assignment = outcome.assignment();
            if matches!(outcome, JoinOutcome::Joined(_)) {
                tracing::info!("Player {} joined room {} on side {}", user_id, state.room, assignment.side);
            }

            // Bind the connection, replacing any stale one for the same user.
            if let Some(old) = state.user_conns.insert(user_id.clone(), conn_id.clone()) {
                state.conn_users.remove(&old);
            }
            state.conn_users.insert(conn_id.clone(), user_id.clone());
            state.refresh_roster();
            state.paddles.entry(assignment.side).or_default();
            state.scores.entry(assignment.side).or_insert(0);

            state.send_to(
                tx,
                &conn_id,
                ServerMsg::WhichPaddle {
                    side: assignment.side,
                },
            );
            state.broadcast_players(tx);
            state.broadcast_snapshot(tx);
        }
        Err(err) => {
            state.send_error(tx, &conn_id, &err);
            let _ = tx.send(SessionEvent::CloseConn { conn_id });
        }
    }
}

fn handle_ready(state: &mut SessionState, tx: &broadcast::Sender<SessionEvent>, conn_id: String) {
    let Some(user_id) = state.user_of_conn(&conn_id) else {
        return;
    };
    match state.store.set_ready(&state.room, &user_id) {
        Ok(_) => {
            state.refresh_roster();
            state.broadcast_players(tx);
        }
        Err(err) => state.send_error(tx, &conn_id, &err),
    }
}

fn handle_start(state: &mut SessionState, tx: &broadcast::Sender<SessionEvent>, conn_id: String) {
    let Some(user_id) = state.user_of_conn(&conn_id) else {
        return;
    };
    if state.is_playing {
        // Duplicate start is a no-op, not an error.
        return;
    }
    let Some(me) = state.player(&user_id) else {
        return;
    };
    if !me.is_host {
        state.send_error(tx, &conn_id, &GameError::NotHost);
        return;
    }
    if !state.start_eligible() {
        state.send_error(tx, &conn_id, &GameError::NotAllReady);
        return;
    }
    if let Err(err) = state
        .store
        .set_room_status(&state.room, RoomStatus::InProgress)
    {
        state.send_error(tx, &conn_id, &err);
        return;
    }

    state.is_playing = true;
    state.ball = BallState::default();

    for p in &state.roster {
        if let Some(conn) = state.user_conns.get(&p.id) {
            state.send_to(tx, conn, ServerMsg::StartedGame { side: p.side });
        }
    }
    state.broadcast_snapshot(tx);
    tracing::info!("Game started in room {}", state.room);
}

fn handle_paddle_move(
    state: &mut SessionState,
    tx: &broadcast::Sender<SessionEvent>,
    conn_id: String,
    position: f64,
    rotation: f64,
) {
    let Some(user_id) = state.user_of_conn(&conn_id) else {
        return;
    };
    let Some(side) = state.player(&user_id).map(|p| p.side) else {
        return;
    };
    // Out-of-range positions are clamped to the playable field, not rejected.
    let limit = state.settings.field_half_extent;
    let position = position.clamp(-limit, limit);
    state.paddles.insert(side, PaddleState { position, rotation });
    state.broadcast_snapshot(tx);
}

fn handle_set_ball_velocity(state: &mut SessionState, conn_id: String, x: f64, y: f64) {
    if state.user_of_conn(&conn_id).is_none() {
        return;
    }
    state.ball.vel = Vec2 { x, y };
}

async fn handle_update_score(
    state: &mut SessionState,
    tx: &broadcast::Sender<SessionEvent>,
    conn_id: String,
    side: Side,
) -> bool {
    if state.user_of_conn(&conn_id).is_none() || !state.is_playing {
        return false;
    }

    let score = {
        let entry = state.scores.entry(side).or_insert(0);
        *entry += 1;
        *entry
    };

    if score >= state.settings.win_score {
        if let Some(winner) = state.player_on_side(side) {
            return complete(state, tx, &winner).await;
        }
    }
    state.broadcast_snapshot(tx);
    false
}

fn handle_reset_round(
    state: &mut SessionState,
    tx: &broadcast::Sender<SessionEvent>,
    conn_id: String,
    last_winner: Option<Side>,
    last_loser: Option<Side>,
) {
    if state.user_of_conn(&conn_id).is_none() {
        return;
    }
    state.ball.pos = Vec2::default();
    state.ball.vel = Vec2::default();
    state.broadcast(
        tx,
        ServerMsg::ResetRound {
            last_winner,
            last_loser,
        },
    );
    state.broadcast_snapshot(tx);
}

async fn handle_end_game(
    state: &mut SessionState,
    tx: &broadcast::Sender<SessionEvent>,
    conn_id: String,
) -> bool {
    if state.user_of_conn(&conn_id).is_none() {
        return false;
    }
    if !state.is_playing {
        tracing::warn!("Room {}: game_over ignored, game not in progress", state.room);
        return false;
    }
    match state.leader_among(None) {
        Some(winner) => complete(state, tx, &winner.id).await,
        None => false,
    }
}

async fn handle_disconnect(
    state: &mut SessionState,
    tx: &broadcast::Sender<SessionEvent>,
    conn_id: String,
) -> bool {
    let Some(user_id) = state.user_of_conn(&conn_id) else {
        return false;
    };
    state.conn_users.remove(&conn_id);
    if state.user_conns.get(&user_id).map(String::as_str) != Some(conn_id.as_str()) {
        // A newer connection replaced this one; nothing else to do.
        return false;
    }
    state.user_conns.remove(&user_id);

    if state.is_playing {
        // An unclean drop mid-game forfeits to the remaining highest scorer.
        tracing::info!("Player {} disconnected mid-game in room {}", user_id, state.room);
        match state.leader_among(Some(&user_id)) {
            Some(winner) => return complete(state, tx, &winner.id).await,
            None => return true,
        }
    }

    let departed_side = state.player(&user_id).map(|p| p.side);
    match state.store.leave_room(&state.room, &user_id) {
        Ok(()) => {
            tracing::info!("Player {} left room {}", user_id, state.room);
        }
        Err(err) => tracing::warn!("Room {}: leave failed for {}: {}", state.room, user_id, err),
    }
    if let Some(side) = departed_side {
        state.paddles.remove(&side);
        state.scores.remove(&side);
    }
    state.refresh_roster();

    if state.roster.is_empty() {
        tracing::info!("Room {} emptied, destroying session", state.room);
        return true;
    }
    state.broadcast_players(tx);
    state.broadcast_snapshot(tx);
    false
}

async fn handle_forfeit(
    state: &mut SessionState,
    tx: &broadcast::Sender<SessionEvent>,
    user_id: &str,
) -> bool {
    if state.completed {
        return false;
    }
    match state.leader_among(Some(user_id)) {
        Some(winner) => complete(state, tx, &winner.id).await,
        None => false,
    }
}

/// Idempotent terminal transition: records the result, notifies the bracket
/// when the room backs a match, and tears the session down.
async fn complete(
    state: &mut SessionState,
    tx: &broadcast::Sender<SessionEvent>,
    winner_id: &str,
) -> bool {
    if state.completed {
        tracing::warn!("Room {}: completion ignored, game already over", state.room);
        return false;
    }
    state.completed = true;
    state.is_playing = false;

    match state
        .store
        .record_result(&state.room, winner_id, &state.scores)
    {
        Ok(result) => {
            // Advance the bracket before announcing, like the result recording
            // itself, so a client reacting to game_over sees the new round.
            if let Some(tournament) = state.tournament.clone() {
                let scores = state.scores_by_user();
                if let Err(err) = state
                    .bracket
                    .on_match_complete(&tournament, &state.room, winner_id, &scores)
                    .await
                {
                    match err.kind() {
                        ErrorKind::Conflict => tracing::warn!(
                            "Room {}: bracket already advanced: {}",
                            state.room,
                            err
                        ),
                        _ => tracing::error!(
                            "Room {}: bracket advancement failed: {}",
                            state.room,
                            err
                        ),
                    }
                }
            }

            let winner = result.players.iter().find(|p| p.is_winner).cloned();
            let tournament = state
                .tournament
                .clone()
                .map(|name| TournamentRef { name });
            state.broadcast(
                tx,
                ServerMsg::GameOver {
                    winner,
                    result,
                    tournament,
                },
            );
            tracing::info!("Game over in room {}, winner {}", state.room, winner_id);
        }
        Err(err) if err.kind() == ErrorKind::Conflict => {
            tracing::warn!("Room {}: result already recorded", state.room);
        }
        Err(err) => {
            tracing::error!("Room {}: failed to record result: {}", state.room, err);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::LobbyHandle;
    use crate::store::MemoryStore;

    fn harness() -> (Arc<MemoryStore>, Arc<SessionRegistry>) {
        let store = Arc::new(MemoryStore::new());
        let lobby = LobbyHandle::new();
        let sessions: Arc<DashMap<String, SessionHandle>> = Arc::new(DashMap::new());
        let bracket = Arc::new(BracketEngine::new(
            store.clone(),
            store.clone(),
            lobby,
            sessions.clone(),
        ));
        let registry = Arc::new(SessionRegistry::new(
            store.clone(),
            bracket,
            GameSettings::default(),
            sessions,
        ));
        (store, registry)
    }

    fn versus_room(store: &MemoryStore, name: &str) {
        store.create_room(name, RoomConfig::versus(), None).unwrap();
    }

    async fn expect_msg<F>(rx: &mut broadcast::Receiver<SessionEvent>, pred: F) -> ServerMsg
    where
        F: Fn(&ServerMsg) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::SendTo { msg, .. } | SessionEvent::Broadcast { msg }) => {
                        if pred(&msg) {
                            return msg;
                        }
                    }
                    Ok(SessionEvent::CloseConn { .. }) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn join(handle: &SessionHandle, conn: &str, user: &str) {
        handle
            .cmd_tx
            .send(SessionCommand::Join {
                conn_id: conn.to_string(),
                user_id: user.to_string(),
                username: user.to_string(),
            })
            .await
            .unwrap();
    }

    async fn wait_for_removal(registry: &SessionRegistry, room: &str) {
        for _ in 0..100 {
            if registry.get(room).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session for {} was not destroyed", room);
    }

    #[tokio::test]
    async fn get_or_create_yields_one_session_per_room() {
        let (store, registry) = harness();
        versus_room(&store, "arena");

        let r1 = registry.clone();
        let r2 = registry.clone();
        let (a, b) = tokio::join!(
            async move { r1.get_or_create("arena").unwrap() },
            async move { r2.get_or_create("arena").unwrap() },
        );
        assert!(a.cmd_tx.same_channel(&b.cmd_tx));
    }

    #[tokio::test]
    async fn get_or_create_requires_existing_waiting_room() {
        let (store, registry) = harness();

        assert!(matches!(
            registry.get_or_create("ghost"),
            Err(GameError::RoomNotFound(_))
        ));

        versus_room(&store, "arena");
        store
            .set_room_status("arena", RoomStatus::InProgress)
            .unwrap();
        assert!(matches!(
            registry.get_or_create("arena"),
            Err(GameError::RoomNotJoinable)
        ));
    }

    #[tokio::test]
    async fn full_match_flow_assigns_sides_and_ticks_the_ball() {
        let (store, registry) = harness();
        versus_room(&store, "arena");

        let handle = registry.get_or_create("arena").unwrap();
        let mut rx = handle.event_tx.subscribe();

        join(&handle, "c1", "alice").await;
        let msg = expect_msg(&mut rx, |m| matches!(m, ServerMsg::WhichPaddle { .. })).await;
        assert!(matches!(msg, ServerMsg::WhichPaddle { side: Side::Left }));

        join(&handle, "c2", "bob").await;
        let msg = expect_msg(&mut rx, |m| {
            matches!(m, ServerMsg::WhichPaddle { side: Side::Right })
        })
        .await;
        assert!(matches!(msg, ServerMsg::WhichPaddle { side: Side::Right }));

        for conn in ["c1", "c2"] {
            handle
                .cmd_tx
                .send(SessionCommand::Ready {
                    conn_id: conn.to_string(),
                })
                .await
                .unwrap();
        }
        let msg = expect_msg(&mut rx, |m| {
            matches!(m, ServerMsg::PlayerUpdate { all_ready: true, .. })
        })
        .await;
        if let ServerMsg::PlayerUpdate { players, .. } = msg {
            let alice = players.iter().find(|p| p.id == "alice").unwrap();
            assert!(alice.is_host);
        }

        handle
            .cmd_tx
            .send(SessionCommand::Start {
                conn_id: "c1".to_string(),
            })
            .await
            .unwrap();
        expect_msg(&mut rx, |m| matches!(m, ServerMsg::StartedGame { .. })).await;

        // The tick loop advances the ball without further client input.
        let msg = expect_msg(&mut rx, |m| {
            matches!(m, ServerMsg::GameStateUpdate { state }
                if state.is_playing && state.ball.pos.x > 0.0)
        })
        .await;
        assert!(matches!(msg, ServerMsg::GameStateUpdate { .. }));
        assert_eq!(store.room_status("arena").unwrap(), RoomStatus::InProgress);
    }

    #[tokio::test]
    async fn start_requires_host_and_full_ready_room() {
        let (store, registry) = harness();
        versus_room(&store, "arena");
        let handle = registry.get_or_create("arena").unwrap();
        let mut rx = handle.event_tx.subscribe();

        join(&handle, "c1", "alice").await;
        join(&handle, "c2", "bob").await;

        // Not everyone ready yet.
        handle
            .cmd_tx
            .send(SessionCommand::Start {
                conn_id: "c1".to_string(),
            })
            .await
            .unwrap();
        expect_msg(&mut rx, |m| {
            matches!(m, ServerMsg::Error { message } if message.contains("not ready"))
        })
        .await;

        for conn in ["c1", "c2"] {
            handle
                .cmd_tx
                .send(SessionCommand::Ready {
                    conn_id: conn.to_string(),
                })
                .await
                .unwrap();
        }

        // Non-host cannot start.
        handle
            .cmd_tx
            .send(SessionCommand::Start {
                conn_id: "c2".to_string(),
            })
            .await
            .unwrap();
        expect_msg(&mut rx, |m| {
            matches!(m, ServerMsg::Error { message } if message.contains("host"))
        })
        .await;
        assert_eq!(store.room_status("arena").unwrap(), RoomStatus::Waiting);
    }

    #[tokio::test]
    async fn scoring_to_threshold_completes_and_destroys_the_session() {
        let (store, registry) = harness();
        versus_room(&store, "arena");
        let handle = registry.get_or_create("arena").unwrap();
        let mut rx = handle.event_tx.subscribe();

        join(&handle, "c1", "alice").await;
        join(&handle, "c2", "bob").await;
        for conn in ["c1", "c2"] {
            handle
                .cmd_tx
                .send(SessionCommand::Ready {
                    conn_id: conn.to_string(),
                })
                .await
                .unwrap();
        }
        handle
            .cmd_tx
            .send(SessionCommand::Start {
                conn_id: "c1".to_string(),
            })
            .await
            .unwrap();

        for _ in 0..5 {
            handle
                .cmd_tx
                .send(SessionCommand::UpdateScore {
                    conn_id: "c2".to_string(),
                    side: Side::Left,
                })
                .await
                .unwrap();
        }

        let msg = expect_msg(&mut rx, |m| matches!(m, ServerMsg::GameOver { .. })).await;
        if let ServerMsg::GameOver { winner, result, .. } = msg {
            assert_eq!(winner.unwrap().id, "alice");
            assert_eq!(result.winner, "alice");
        }

        wait_for_removal(&registry, "arena").await;
        assert_eq!(store.room_status("arena").unwrap(), RoomStatus::Completed);
        assert!(store.room_result("arena").unwrap().is_some());
    }

    #[tokio::test]
    async fn mid_game_disconnect_forfeits_to_the_remaining_player() {
        let (store, registry) = harness();
        versus_room(&store, "arena");
        let handle = registry.get_or_create("arena").unwrap();
        let mut rx = handle.event_tx.subscribe();

        join(&handle, "c1", "alice").await;
        join(&handle, "c2", "bob").await;
        for conn in ["c1", "c2"] {
            handle
                .cmd_tx
                .send(SessionCommand::Ready {
                    conn_id: conn.to_string(),
                })
                .await
                .unwrap();
        }
        handle
            .cmd_tx
            .send(SessionCommand::Start {
                conn_id: "c1".to_string(),
            })
            .await
            .unwrap();

        // Alice leads 3-1, then drops.
        for _ in 0..3 {
            handle
                .cmd_tx
                .send(SessionCommand::UpdateScore {
                    conn_id: "c1".to_string(),
                    side: Side::Left,
                })
                .await
                .unwrap();
        }
        handle
            .cmd_tx
            .send(SessionCommand::UpdateScore {
                conn_id: "c1".to_string(),
                side: Side::Right,
            })
            .await
            .unwrap();
        handle
            .cmd_tx
            .send(SessionCommand::Disconnect {
                conn_id: "c1".to_string(),
            })
            .await
            .unwrap();

        let msg = expect_msg(&mut rx, |m| matches!(m, ServerMsg::GameOver { .. })).await;
        if let ServerMsg::GameOver { winner, result, .. } = msg {
            assert_eq!(winner.unwrap().id, "bob");
            let alice = result.players.iter().find(|p| p.id == "alice").unwrap();
            assert_eq!(alice.score, 3);
            assert!(!alice.is_winner);
        }
        wait_for_removal(&registry, "arena").await;
    }

    #[tokio::test]
    async fn waiting_room_leave_promotes_a_new_host() {
        let (store, registry) = harness();
        versus_room(&store, "arena");
        let handle = registry.get_or_create("arena").unwrap();
        let mut rx = handle.event_tx.subscribe();

        join(&handle, "c1", "alice").await;
        join(&handle, "c2", "bob").await;
        handle
            .cmd_tx
            .send(SessionCommand::Disconnect {
                conn_id: "c1".to_string(),
            })
            .await
            .unwrap();

        let msg = expect_msg(&mut rx, |m| {
            matches!(m, ServerMsg::PlayerUpdate { players, .. }
                if players.len() == 1 && players[0].id == "bob")
        })
        .await;
        if let ServerMsg::PlayerUpdate { players, .. } = msg {
            assert!(players[0].is_host);
            assert_eq!(players[0].seat_number, 1);
        }

        // Last participant out destroys the session.
        handle
            .cmd_tx
            .send(SessionCommand::Disconnect {
                conn_id: "c2".to_string(),
            })
            .await
            .unwrap();
        wait_for_removal(&registry, "arena").await;
    }

    #[tokio::test]
    async fn paddle_positions_are_clamped_to_the_field() {
        let (store, registry) = harness();
        versus_room(&store, "arena");
        let handle = registry.get_or_create("arena").unwrap();
        let mut rx = handle.event_tx.subscribe();

        join(&handle, "c1", "alice").await;
        handle
            .cmd_tx
            .send(SessionCommand::PaddleMove {
                conn_id: "c1".to_string(),
                position: 999.0,
                rotation: 0.5,
            })
            .await
            .unwrap();

        let msg = expect_msg(&mut rx, |m| {
            matches!(m, ServerMsg::GameStateUpdate { state }
                if state.paddles.get(&Side::Left).is_some_and(|p| p.rotation == 0.5))
        })
        .await;
        if let ServerMsg::GameStateUpdate { state } = msg {
            let paddle = state.paddles.get(&Side::Left).unwrap();
            assert_eq!(paddle.position, GameSettings::default().field_half_extent);
        }
    }
}
