use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::GameError;

/// A named seat a participant occupies and controls a paddle for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
    Top,
    Bottom,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
            Self::Top => write!(f, "top"),
            Self::Bottom => write!(f, "bottom"),
        }
    }
}

/// Room lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    Waiting,
    InProgress,
    Completed,
}

/// Bracket match lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Scheduled,
    InProgress,
    Completed,
}

/// Tournament lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TournamentStatus {
    Waiting,
    InProgress,
    Completed,
}

/// Fixed configuration of a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    #[serde(rename = "playerCount")]
    pub capacity: usize,
    #[serde(rename = "playerSides")]
    pub sides: Vec<Side>,
    #[serde(rename = "mapStyle", default = "default_map_style")]
    pub map_style: String,
    #[serde(rename = "powerupsEnabled", default)]
    pub powerups_enabled: bool,
}

fn default_map_style() -> String {
    "classic".to_string()
}

impl RoomConfig {
    /// Standard two-player head-to-head layout, used for tournament matches.
    pub fn versus() -> Self {
        Self {
            capacity: 2,
            sides: vec![Side::Left, Side::Right],
            map_style: default_map_style(),
            powerups_enabled: false,
        }
    }

    pub fn validate(&self) -> Result<(), GameError> {
        if !(2..=4).contains(&self.capacity) {
            return Err(GameError::BadRoomConfig(format!(
                "player count must be between 2 and 4, got {}",
                self.capacity
            )));
        }
        if self.sides.len() != self.capacity {
            return Err(GameError::BadRoomConfig(format!(
                "number of sides ({}) must match player count ({})",
                self.sides.len(),
                self.capacity
            )));
        }
        for (i, side) in self.sides.iter().enumerate() {
            if self.sides[..i].contains(side) {
                return Err(GameError::BadRoomConfig(format!("duplicate side: {}", side)));
            }
        }
        Ok(())
    }
}

/// Seat assignment handed back on a successful join.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Assignment {
    pub side: Side,
    #[serde(rename = "seatNumber")]
    pub seat_number: usize,
    #[serde(rename = "isHost")]
    pub is_host: bool,
}

/// Outcome of a join: a fresh seat, or the seat the user already holds.
#[derive(Debug, Clone, Copy)]
pub enum JoinOutcome {
    Joined(Assignment),
    AlreadyJoined(Assignment),
}

impl JoinOutcome {
    pub fn assignment(&self) -> Assignment {
        match self {
            Self::Joined(a) | Self::AlreadyJoined(a) => *a,
        }
    }
}

/// A participant as broadcast to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: String,
    pub username: String,
    pub side: Side,
    #[serde(rename = "seatNumber")]
    pub seat_number: usize,
    #[serde(rename = "isHost")]
    pub is_host: bool,
    #[serde(rename = "isReady")]
    pub is_ready: bool,
    pub connected: bool,
}

/// Paddle offset along its wall plus rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PaddleState {
    pub position: f64,
    pub rotation: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

/// Ball position and velocity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BallState {
    pub pos: Vec2,
    pub vel: Vec2,
}

impl Default for BallState {
    fn default() -> Self {
        Self {
            pos: Vec2 { x: 0.0, y: 0.0 },
            vel: Vec2 { x: 0.2, y: 0.1 },
        }
    }
}

/// Full game-state payload broadcast to a room after a state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub players: Vec<PlayerInfo>,
    pub paddles: HashMap<Side, PaddleState>,
    pub scores: HashMap<Side, u32>,
    pub ball: BallState,
    #[serde(rename = "isPlaying")]
    pub is_playing: bool,
}

/// One participant's line in a recorded result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerResult {
    pub id: String,
    pub username: String,
    pub side: Side,
    pub score: u32,
    #[serde(rename = "isWinner")]
    pub is_winner: bool,
}

/// Immutable record of a completed game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameResult {
    pub id: String,
    pub room: String,
    pub winner: String,
    pub players: Vec<PlayerResult>,
    #[serde(rename = "recordedAt")]
    pub recorded_at: u64,
}

/// Summary of a joinable room for the discovery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub name: String,
    pub status: RoomStatus,
    pub config: RoomConfig,
    pub players: Vec<PlayerInfo>,
}

/// A bracket match as persisted and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: String,
    pub round: u32,
    #[serde(rename = "matchNumber")]
    pub match_number: u32,
    pub player1: String,
    pub player2: String,
    pub status: MatchStatus,
    pub winner: Option<String>,
}

impl MatchRecord {
    pub fn opponent_of(&self, user_id: &str) -> Option<&str> {
        if self.player1 == user_id {
            Some(&self.player2)
        } else if self.player2 == user_id {
            Some(&self.player1)
        } else {
            None
        }
    }
}

/// Win/loss/points line for one tournament participant.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Standing {
    #[serde(rename = "matchesPlayed")]
    pub matches_played: u32,
    pub wins: u32,
    pub losses: u32,
    pub points: u32,
}

/// Standing delta applied when a match completes.
#[derive(Debug, Clone, Copy)]
pub struct StandingDelta {
    pub won: bool,
    pub points: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandingEntry {
    pub player: String,
    #[serde(flatten)]
    pub standing: Standing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: String,
    pub username: String,
    pub eliminated: bool,
}

/// Tournament overview broadcast on the discovery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentData {
    pub name: String,
    pub status: TournamentStatus,
    pub creator: String,
    #[serde(rename = "participantsMax")]
    pub participants_max: usize,
    pub participants: Vec<ParticipantInfo>,
    pub matches: Vec<MatchRecord>,
    pub standings: Vec<StandingEntry>,
    pub champion: Option<String>,
}

/// Reference attached to a game-over payload when the room backs a bracket match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentRef {
    pub name: String,
}

/// Messages sent from game clients via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    PaddleMove {
        position: f64,
        rotation: f64,
    },
    PlayerReady,
    StartGame,
    UpdateScore {
        side: Side,
    },
    SetBallVelocity {
        x: f64,
        y: f64,
    },
    ResetRound {
        #[serde(rename = "lastWinner", default)]
        last_winner: Option<Side>,
        #[serde(rename = "lastLoser", default)]
        last_loser: Option<Side>,
    },
    GameOver,
}

/// Messages sent to game clients via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    WhichPaddle {
        side: Side,
    },
    GameStateUpdate {
        state: GameSnapshot,
    },
    PlayerUpdate {
        players: Vec<PlayerInfo>,
        #[serde(rename = "allReady")]
        all_ready: bool,
    },
    StartedGame {
        side: Side,
    },
    ResetRound {
        #[serde(rename = "lastWinner")]
        last_winner: Option<Side>,
        #[serde(rename = "lastLoser")]
        last_loser: Option<Side>,
    },
    GameOver {
        winner: Option<PlayerResult>,
        result: GameResult,
        tournament: Option<TournamentRef>,
    },
    Error {
        message: String,
    },
}

/// Messages sent from lobby clients via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyClientMsg {
    CreateRoom {
        name: String,
        config: RoomConfig,
    },
    CreateTournament {
        name: String,
        #[serde(rename = "maxParticipants")]
        max_participants: usize,
    },
    JoinTournament {
        name: String,
    },
    LeaveTournament {
        name: String,
    },
}

/// Messages sent to lobby clients browsing for matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyMsg {
    RoomList {
        rooms: Vec<RoomSummary>,
    },
    RoomCreated {
        room: RoomSummary,
    },
    TournamentList {
        tournaments: Vec<TournamentData>,
    },
    TournamentUpdate {
        #[serde(rename = "tournamentData")]
        tournament_data: TournamentData,
    },
    Error {
        message: String,
    },
}
