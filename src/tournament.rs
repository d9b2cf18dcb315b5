use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;

use crate::error::{ErrorKind, GameError};
use crate::lobby::LobbyHandle;
use crate::session::{SessionCommand, SessionHandle};
use crate::store::{BracketStore, RoomStore};
use crate::types::*;

/// A tournament entrant tracked by the engine.
#[derive(Debug, Clone)]
struct Participant {
    user_id: String,
    username: String,
    eliminated: bool,
}

struct TournamentState {
    name: String,
    status: TournamentStatus,
    creator: String,
    max_participants: usize,
    participants: Vec<Participant>,
    champion: Option<String>,
}

/// Single-elimination bracket state machine.
///
/// Each tournament's state sits behind its own mutex; round advancement reads
/// "are all matches in this round complete" across matches, so that check and
/// the creation of the next round share one critical section per tournament.
/// Lock order is always bracket -> session: the engine never awaits a session
/// while holding a tournament lock.
pub struct BracketEngine {
    store: Arc<dyn BracketStore>,
    rooms: Arc<dyn RoomStore>,
    lobby: LobbyHandle,
    sessions: Arc<DashMap<String, SessionHandle>>,
    tournaments: DashMap<String, Arc<Mutex<TournamentState>>>,
}

impl BracketEngine {
    pub fn new(
        store: Arc<dyn BracketStore>,
        rooms: Arc<dyn RoomStore>,
        lobby: LobbyHandle,
        sessions: Arc<DashMap<String, SessionHandle>>,
    ) -> Self {
        Self {
            store,
            rooms,
            lobby,
            sessions,
            tournaments: DashMap::new(),
        }
    }

    /// Registers a new tournament and announces it on the discovery channel.
    pub fn create(
        &self,
        name: &str,
        max_participants: usize,
        creator: &str,
    ) -> Result<(), GameError> {
        if !matches!(max_participants, 4 | 8) {
            return Err(GameError::BadBracketSize(max_participants));
        }

        use dashmap::mapref::entry::Entry;
        match self.tournaments.entry(name.to_string()) {
            Entry::Occupied(_) => Err(GameError::TournamentExists(name.to_string())),
            Entry::Vacant(e) => {
                let state = TournamentState {
                    name: name.to_string(),
                    status: TournamentStatus::Waiting,
                    creator: creator.to_string(),
                    max_participants,
                    participants: Vec::new(),
                    champion: None,
                };
                let data = self.tournament_data(&state);
                e.insert(Arc::new(Mutex::new(state)));
                self.lobby.send(LobbyMsg::TournamentUpdate {
                    tournament_data: data,
                });
                tracing::info!("Tournament {} created by {}", name, creator);
                Ok(())
            }
        }
    }

    /// Adds a participant; a full bracket auto-starts the tournament.
    pub async fn join(&self, name: &str, user_id: &str, username: &str) -> Result<(), GameError> {
        let state_arc = self.state_arc(name)?;
        let mut state = state_arc.lock().await;

        if state.status != TournamentStatus::Waiting {
            return Err(GameError::TournamentNotJoinable);
        }
        if state.participants.iter().any(|p| p.user_id == user_id) {
            // Re-joining is harmless; keep the existing entry.
            return Ok(());
        }
        if state.participants.len() >= state.max_participants {
            return Err(GameError::TournamentFull);
        }

        state.participants.push(Participant {
            user_id: user_id.to_string(),
            username: username.to_string(),
            eliminated: false,
        });
        self.store.init_standing(name, user_id, username);
        tracing::info!("Player {} joined tournament {}", username, name);

        if state.participants.len() == state.max_participants {
            self.start_tournament(&mut state)?;
        }
        self.broadcast_update(&state);
        Ok(())
    }

    /// Seeds the bracket and creates round 1. Caller holds the tournament lock.
    fn start_tournament(&self, state: &mut TournamentState) -> Result<(), GameError> {
        if state.status != TournamentStatus::Waiting {
            return Err(GameError::TournamentAlreadyStarted);
        }
        if state.participants.len() < 2 {
            return Err(GameError::NotEnoughParticipants);
        }

        let mut seeded = state.participants.clone();
        seeded.shuffle(&mut rand::rng());

        self.create_round_matches(&state.name, 1, &seeded)?;
        state.status = TournamentStatus::InProgress;
        tracing::info!(
            "Tournament {} started with {} players",
            state.name,
            state.participants.len()
        );
        Ok(())
    }

    /// Pairs consecutive entries into matches, each backed by a 2-player room
    /// with both players pre-seated.
    fn create_round_matches(
        &self,
        tournament: &str,
        round: u32,
        players: &[Participant],
    ) -> Result<(), GameError> {
        for (i, pair) in players.chunks(2).enumerate() {
            let [p1, p2] = pair else {
                // Power-of-two bracket sizes leave no byes.
                continue;
            };
            let match_id =
                self.store
                    .create_match(tournament, round, i as u32, &p1.user_id, &p2.user_id)?;
            self.rooms
                .create_room(&match_id, RoomConfig::versus(), Some(tournament))?;
            self.rooms.join_room(&match_id, &p1.user_id, &p1.username)?;
            self.rooms.join_room(&match_id, &p2.user_id, &p2.username)?;
            self.store.activate_match(tournament, &match_id)?;
            tracing::info!(
                "Tournament {}: match {} paired {} vs {}",
                tournament,
                match_id,
                p1.username,
                p2.username
            );
        }
        Ok(())
    }

    /// Records a finished match and advances the bracket.
    ///
    /// The whole check-and-advance runs under the tournament lock, so two
    /// matches of the same round completing concurrently create the next
    /// round exactly once. An already-completed match is a conflict the
    /// caller treats as a no-op.
    pub async fn on_match_complete(
        &self,
        tournament: &str,
        match_id: &str,
        winner_id: &str,
        scores_by_user: &HashMap<String, u32>,
    ) -> Result<(), GameError> {
        let state_arc = self.state_arc(tournament)?;
        let mut state = state_arc.lock().await;

        let record = self
            .store
            .match_record(tournament, match_id)
            .ok_or_else(|| GameError::MatchNotFound(match_id.to_string()))?;
        if record.status == MatchStatus::Completed {
            return Err(GameError::MatchAlreadyCompleted);
        }
        let loser = record
            .opponent_of(winner_id)
            .ok_or(GameError::ParticipantNotFound)?
            .to_string();

        self.store.complete_match(tournament, match_id, winner_id)?;
        self.store.record_standing(
            tournament,
            winner_id,
            StandingDelta {
                won: true,
                points: scores_by_user.get(winner_id).copied().unwrap_or(0),
            },
        )?;
        self.store.record_standing(
            tournament,
            &loser,
            StandingDelta {
                won: false,
                points: scores_by_user.get(&loser).copied().unwrap_or(0),
            },
        )?;
        if let Some(p) = state.participants.iter_mut().find(|p| p.user_id == loser) {
            p.eliminated = true;
        }

        let round_matches = self.store.get_round_matches(tournament, record.round);
        if round_matches
            .iter()
            .all(|m| m.status == MatchStatus::Completed)
        {
            // Winners advance in original match order.
            let winners: Vec<Participant> = round_matches
                .iter()
                .filter_map(|m| m.winner.clone())
                .filter_map(|id| {
                    state
                        .participants
                        .iter()
                        .find(|p| p.user_id == id)
                        .cloned()
                })
                .collect();

            if winners.len() == 1 {
                state.status = TournamentStatus::Completed;
                state.champion = Some(winners[0].user_id.clone());
                tracing::info!(
                    "Tournament {} completed, champion {}",
                    tournament,
                    winners[0].username
                );
            } else {
                self.create_round_matches(&state.name, record.round + 1, &winners)?;
                tracing::info!(
                    "Tournament {}: round {} created with {} players",
                    tournament,
                    record.round + 1,
                    winners.len()
                );
            }
        }

        self.broadcast_update(&state);
        Ok(())
    }

    /// Removes a waiting participant, or eliminates an active one and
    /// forfeits their live match to the opponent.
    pub async fn leave(&self, name: &str, user_id: &str) -> Result<(), GameError> {
        let state_arc = self.state_arc(name)?;

        let forfeit = {
            let mut state = state_arc.lock().await;
            match state.status {
                TournamentStatus::Waiting => {
                    let idx = state
                        .participants
                        .iter()
                        .position(|p| p.user_id == user_id)
                        .ok_or(GameError::ParticipantNotFound)?;
                    let departed = state.participants.remove(idx);
                    self.store.remove_standing(name, user_id);
                    tracing::info!("Player {} left tournament {}", departed.username, name);
                    self.broadcast_update(&state);
                    None
                }
                TournamentStatus::InProgress => {
                    let already = {
                        let p = state
                            .participants
                            .iter_mut()
                            .find(|p| p.user_id == user_id)
                            .ok_or(GameError::ParticipantNotFound)?;
                        let already = p.eliminated;
                        p.eliminated = true;
                        already
                    };
                    self.broadcast_update(&state);
                    if already {
                        None
                    } else {
                        self.store
                            .active_match_for(name, user_id)
                            .and_then(|m| {
                                m.opponent_of(user_id)
                                    .map(|o| (m.id.clone(), o.to_string()))
                            })
                    }
                }
                TournamentStatus::Completed => return Err(GameError::TournamentOver),
            }
        };

        if let Some((match_id, opponent)) = forfeit {
            // The tournament lock is released before touching the session.
            if let Some(handle) = self.sessions.get(&match_id).map(|h| h.value().clone()) {
                let sent = handle
                    .cmd_tx
                    .send(SessionCommand::Forfeit {
                        user_id: user_id.to_string(),
                    })
                    .await;
                if sent.is_ok() {
                    return Ok(());
                }
            }
            self.forfeit_without_session(name, &match_id, &opponent).await?;
        }
        Ok(())
    }

    /// Completes a match nobody is playing: record a 1-0 result on the
    /// backing room, then advance the bracket through the usual path.
    async fn forfeit_without_session(
        &self,
        tournament: &str,
        match_id: &str,
        winner: &str,
    ) -> Result<(), GameError> {
        let players = self.rooms.room_players(match_id)?;
        let mut scores_by_side = HashMap::new();
        let mut scores_by_user = HashMap::new();
        for p in &players {
            let score = if p.id == winner { 1 } else { 0 };
            scores_by_side.insert(p.side, score);
            scores_by_user.insert(p.id.clone(), score);
        }

        match self.rooms.record_result(match_id, winner, &scores_by_side) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Conflict => {
                tracing::warn!("Match {}: result already recorded", match_id);
            }
            Err(err) => return Err(err),
        }

        match self
            .on_match_complete(tournament, match_id, winner, &scores_by_user)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::Conflict => {
                tracing::warn!("Match {}: bracket already advanced", match_id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn data(&self, name: &str) -> Result<TournamentData, GameError> {
        let state_arc = self.state_arc(name)?;
        let state = state_arc.lock().await;
        Ok(self.tournament_data(&state))
    }

    /// Overview of every tournament, for lobby snapshots.
    pub async fn snapshot_all(&self) -> Vec<TournamentData> {
        let arcs: Vec<Arc<Mutex<TournamentState>>> = self
            .tournaments
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let state = arc.lock().await;
            out.push(self.tournament_data(&state));
        }
        out
    }

    fn state_arc(&self, name: &str) -> Result<Arc<Mutex<TournamentState>>, GameError> {
        self.tournaments
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| GameError::TournamentNotFound(name.to_string()))
    }

    fn tournament_data(&self, state: &TournamentState) -> TournamentData {
        TournamentData {
            name: state.name.clone(),
            status: state.status,
            creator: state.creator.clone(),
            participants_max: state.max_participants,
            participants: state
                .participants
                .iter()
                .map(|p| ParticipantInfo {
                    id: p.user_id.clone(),
                    username: p.username.clone(),
                    eliminated: p.eliminated,
                })
                .collect(),
            matches: self.store.tournament_matches(&state.name),
            standings: self.store.standings(&state.name),
            champion: state.champion.clone(),
        }
    }

    fn broadcast_update(&self, state: &TournamentState) {
        self.lobby.send(LobbyMsg::TournamentUpdate {
            tournament_data: self.tournament_data(state),
        });
    }
}
