use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use uuid::Uuid;

use crate::error::GameError;
use crate::types::*;

/// Durable record of room membership, configuration and final results.
///
/// The match engine consumes this as a narrow interface; the in-memory
/// implementation below stands in for the relational store.
pub trait RoomStore: Send + Sync + 'static {
    fn create_room(
        &self,
        name: &str,
        config: RoomConfig,
        tournament: Option<&str>,
    ) -> Result<(), GameError>;
    fn get_room_config(&self, room: &str) -> Result<RoomConfig, GameError>;
    fn room_status(&self, room: &str) -> Result<RoomStatus, GameError>;
    fn set_room_status(&self, room: &str, status: RoomStatus) -> Result<(), GameError>;
    /// The tournament this room's match belongs to, if any.
    fn room_tournament(&self, room: &str) -> Result<Option<String>, GameError>;
    fn join_room(&self, room: &str, user_id: &str, username: &str)
        -> Result<JoinOutcome, GameError>;
    fn leave_room(&self, room: &str, user_id: &str) -> Result<(), GameError>;
    /// Marks the participant ready. Returns the start-eligibility predicate:
    /// joined count meets capacity and every joined participant is ready.
    fn set_ready(&self, room: &str, user_id: &str) -> Result<bool, GameError>;
    fn room_players(&self, room: &str) -> Result<Vec<PlayerInfo>, GameError>;
    /// Records the final result exactly once; a second completion is a conflict.
    fn record_result(
        &self,
        room: &str,
        winner_id: &str,
        scores_by_side: &HashMap<Side, u32>,
    ) -> Result<GameResult, GameError>;
    fn room_result(&self, room: &str) -> Result<Option<GameResult>, GameError>;
    fn room_summary(&self, room: &str) -> Result<RoomSummary, GameError>;
    /// Waiting, non-tournament rooms for the discovery channel.
    fn available_rooms(&self) -> Vec<RoomSummary>;
}

/// Bracket persistence collaborator: matches and standings per tournament.
pub trait BracketStore: Send + Sync + 'static {
    /// Creates a scheduled match and returns its id (also the backing room name).
    fn create_match(
        &self,
        tournament: &str,
        round: u32,
        match_number: u32,
        player1: &str,
        player2: &str,
    ) -> Result<String, GameError>;
    /// SCHEDULED -> IN_PROGRESS once both slots are filled.
    fn activate_match(&self, tournament: &str, match_id: &str) -> Result<(), GameError>;
    /// Marks the match completed with its winner; a second completion is a conflict.
    fn complete_match(&self, tournament: &str, match_id: &str, winner: &str)
        -> Result<(), GameError>;
    fn match_record(&self, tournament: &str, match_id: &str) -> Option<MatchRecord>;
    fn get_round_matches(&self, tournament: &str, round: u32) -> Vec<MatchRecord>;
    fn tournament_matches(&self, tournament: &str) -> Vec<MatchRecord>;
    /// The not-yet-completed match the user is seated in, if any.
    fn active_match_for(&self, tournament: &str, user_id: &str) -> Option<MatchRecord>;
    fn init_standing(&self, tournament: &str, user_id: &str, username: &str);
    fn remove_standing(&self, tournament: &str, user_id: &str);
    fn record_standing(
        &self,
        tournament: &str,
        user_id: &str,
        delta: StandingDelta,
    ) -> Result<(), GameError>;
    /// Standings ordered by wins, then points, descending.
    fn standings(&self, tournament: &str) -> Vec<StandingEntry>;
}

struct SeatRecord {
    user_id: String,
    username: String,
    side: Side,
    seat_number: usize,
    ready: bool,
}

impl SeatRecord {
    fn assignment(&self) -> Assignment {
        Assignment {
            side: self.side,
            seat_number: self.seat_number,
            is_host: self.seat_number == 1,
        }
    }

    fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.user_id.clone(),
            username: self.username.clone(),
            side: self.side,
            seat_number: self.seat_number,
            is_host: self.seat_number == 1,
            is_ready: self.ready,
            connected: false,
        }
    }
}

struct RoomRecord {
    name: String,
    config: RoomConfig,
    status: RoomStatus,
    tournament: Option<String>,
    active: bool,
    seats: Vec<SeatRecord>,
    result: Option<GameResult>,
}

impl RoomRecord {
    fn summary(&self) -> RoomSummary {
        RoomSummary {
            name: self.name.clone(),
            status: self.status,
            config: self.config.clone(),
            players: self.seats.iter().map(SeatRecord::info).collect(),
        }
    }
}

#[derive(Default)]
struct StandingRecord {
    username: String,
    standing: Standing,
}

#[derive(Default)]
struct BracketRecord {
    matches: Vec<MatchRecord>,
    standings: HashMap<String, StandingRecord>,
}

/// In-memory store backing both collaborator traits.
#[derive(Default)]
pub struct MemoryStore {
    rooms: DashMap<String, RoomRecord>,
    brackets: DashMap<String, BracketRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RoomStore for MemoryStore {
    fn create_room(
        &self,
        name: &str,
        config: RoomConfig,
        tournament: Option<&str>,
    ) -> Result<(), GameError> {
        if name.is_empty() {
            return Err(GameError::BadRoomConfig("room name cannot be empty".to_string()));
        }
        config.validate()?;

        use dashmap::mapref::entry::Entry;
        match self.rooms.entry(name.to_string()) {
            Entry::Occupied(_) => Err(GameError::RoomExists(name.to_string())),
            Entry::Vacant(e) => {
                e.insert(RoomRecord {
                    name: name.to_string(),
                    config,
                    status: RoomStatus::Waiting,
                    tournament: tournament.map(str::to_string),
                    active: true,
                    seats: Vec::new(),
                    result: None,
                });
                Ok(())
            }
        }
    }

    fn get_room_config(&self, room: &str) -> Result<RoomConfig, GameError> {
        self.rooms
            .get(room)
            .map(|r| r.config.clone())
            .ok_or_else(|| GameError::RoomNotFound(room.to_string()))
    }

    fn room_status(&self, room: &str) -> Result<RoomStatus, GameError> {
        self.rooms
            .get(room)
            .map(|r| r.status)
            .ok_or_else(|| GameError::RoomNotFound(room.to_string()))
    }

    fn set_room_status(&self, room: &str, status: RoomStatus) -> Result<(), GameError> {
        let mut record = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| GameError::RoomNotFound(room.to_string()))?;
        record.status = status;
        Ok(())
    }

    fn room_tournament(&self, room: &str) -> Result<Option<String>, GameError> {
        self.rooms
            .get(room)
            .map(|r| r.tournament.clone())
            .ok_or_else(|| GameError::RoomNotFound(room.to_string()))
    }

    fn join_room(
        &self,
        room: &str,
        user_id: &str,
        username: &str,
    ) -> Result<JoinOutcome, GameError> {
        let mut record = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| GameError::RoomNotFound(room.to_string()))?;
        if !record.active {
            return Err(GameError::RoomNotFound(room.to_string()));
        }

        if let Some(seat) = record.seats.iter().find(|s| s.user_id == user_id) {
            return Ok(JoinOutcome::AlreadyJoined(seat.assignment()));
        }
        if record.status != RoomStatus::Waiting {
            return Err(GameError::RoomNotJoinable);
        }
        if record.seats.len() >= record.config.capacity {
            return Err(GameError::RoomFull);
        }

        let taken: Vec<Side> = record.seats.iter().map(|s| s.side).collect();
        let side = record
            .config
            .sides
            .iter()
            .copied()
            .find(|s| !taken.contains(s))
            .ok_or(GameError::NoAvailableSide)?;

        let seat = SeatRecord {
            user_id: user_id.to_string(),
            username: username.to_string(),
            side,
            seat_number: record.seats.len() + 1,
            ready: false,
        };
        let assignment = seat.assignment();
        record.seats.push(seat);
        Ok(JoinOutcome::Joined(assignment))
    }

    fn leave_room(&self, room: &str, user_id: &str) -> Result<(), GameError> {
        let mut record = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| GameError::RoomNotFound(room.to_string()))?;

        let idx = record
            .seats
            .iter()
            .position(|s| s.user_id == user_id)
            .ok_or(GameError::NotInRoom)?;
        let departed = record.seats.remove(idx);

        // Seats compact down so seat 1 (the host) is always occupied.
        for seat in &mut record.seats {
            if seat.seat_number > departed.seat_number {
                seat.seat_number -= 1;
            }
        }

        if record.seats.is_empty() {
            record.active = false;
        }
        Ok(())
    }

    fn set_ready(&self, room: &str, user_id: &str) -> Result<bool, GameError> {
        let mut record = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| GameError::RoomNotFound(room.to_string()))?;

        let seat = record
            .seats
            .iter_mut()
            .find(|s| s.user_id == user_id)
            .ok_or(GameError::NotInRoom)?;
        seat.ready = true;

        Ok(record.seats.len() == record.config.capacity
            && record.seats.iter().all(|s| s.ready))
    }

    fn room_players(&self, room: &str) -> Result<Vec<PlayerInfo>, GameError> {
        self.rooms
            .get(room)
            .map(|r| r.seats.iter().map(SeatRecord::info).collect())
            .ok_or_else(|| GameError::RoomNotFound(room.to_string()))
    }

    fn record_result(
        &self,
        room: &str,
        winner_id: &str,
        scores_by_side: &HashMap<Side, u32>,
    ) -> Result<GameResult, GameError> {
        let mut record = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| GameError::RoomNotFound(room.to_string()))?;

        if record.status == RoomStatus::Completed {
            return Err(GameError::NotInProgress);
        }
        if !record.seats.iter().any(|s| s.user_id == winner_id) {
            return Err(GameError::NotInRoom);
        }

        let players: Vec<PlayerResult> = record
            .seats
            .iter()
            .map(|s| PlayerResult {
                id: s.user_id.clone(),
                username: s.username.clone(),
                side: s.side,
                score: scores_by_side.get(&s.side).copied().unwrap_or(0),
                is_winner: s.user_id == winner_id,
            })
            .collect();

        let result = GameResult {
            id: Uuid::new_v4().to_string(),
            room: room.to_string(),
            winner: winner_id.to_string(),
            players,
            recorded_at: unix_now(),
        };

        record.status = RoomStatus::Completed;
        record.result = Some(result.clone());
        Ok(result)
    }

    fn room_result(&self, room: &str) -> Result<Option<GameResult>, GameError> {
        self.rooms
            .get(room)
            .map(|r| r.result.clone())
            .ok_or_else(|| GameError::RoomNotFound(room.to_string()))
    }

    fn room_summary(&self, room: &str) -> Result<RoomSummary, GameError> {
        self.rooms
            .get(room)
            .map(|r| r.summary())
            .ok_or_else(|| GameError::RoomNotFound(room.to_string()))
    }

    fn available_rooms(&self) -> Vec<RoomSummary> {
        self.rooms
            .iter()
            .filter(|r| r.active && r.status == RoomStatus::Waiting && r.tournament.is_none())
            .map(|r| r.summary())
            .collect()
    }
}

impl BracketStore for MemoryStore {
    fn create_match(
        &self,
        tournament: &str,
        round: u32,
        match_number: u32,
        player1: &str,
        player2: &str,
    ) -> Result<String, GameError> {
        let match_id = format!("{}_r{}m{}", tournament, round, match_number);
        let mut bracket = self.brackets.entry(tournament.to_string()).or_default();

        if bracket.matches.iter().any(|m| m.id == match_id) {
            return Err(GameError::RoomExists(match_id));
        }
        bracket.matches.push(MatchRecord {
            id: match_id.clone(),
            round,
            match_number,
            player1: player1.to_string(),
            player2: player2.to_string(),
            status: MatchStatus::Scheduled,
            winner: None,
        });
        Ok(match_id)
    }

    fn activate_match(&self, tournament: &str, match_id: &str) -> Result<(), GameError> {
        let mut bracket = self
            .brackets
            .get_mut(tournament)
            .ok_or_else(|| GameError::TournamentNotFound(tournament.to_string()))?;
        let record = bracket
            .matches
            .iter_mut()
            .find(|m| m.id == match_id)
            .ok_or_else(|| GameError::MatchNotFound(match_id.to_string()))?;
        if record.status == MatchStatus::Completed {
            return Err(GameError::MatchAlreadyCompleted);
        }
        record.status = MatchStatus::InProgress;
        Ok(())
    }

    fn complete_match(
        &self,
        tournament: &str,
        match_id: &str,
        winner: &str,
    ) -> Result<(), GameError> {
        let mut bracket = self
            .brackets
            .get_mut(tournament)
            .ok_or_else(|| GameError::TournamentNotFound(tournament.to_string()))?;
        let record = bracket
            .matches
            .iter_mut()
            .find(|m| m.id == match_id)
            .ok_or_else(|| GameError::MatchNotFound(match_id.to_string()))?;
        if record.status == MatchStatus::Completed {
            return Err(GameError::MatchAlreadyCompleted);
        }
        record.status = MatchStatus::Completed;
        record.winner = Some(winner.to_string());
        Ok(())
    }

    fn match_record(&self, tournament: &str, match_id: &str) -> Option<MatchRecord> {
        self.brackets
            .get(tournament)
            .and_then(|b| b.matches.iter().find(|m| m.id == match_id).cloned())
    }

    fn get_round_matches(&self, tournament: &str, round: u32) -> Vec<MatchRecord> {
        let mut matches: Vec<MatchRecord> = self
            .brackets
            .get(tournament)
            .map(|b| {
                b.matches
                    .iter()
                    .filter(|m| m.round == round)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matches.sort_by_key(|m| m.match_number);
        matches
    }

    fn tournament_matches(&self, tournament: &str) -> Vec<MatchRecord> {
        let mut matches: Vec<MatchRecord> = self
            .brackets
            .get(tournament)
            .map(|b| b.matches.clone())
            .unwrap_or_default();
        matches.sort_by_key(|m| (m.round, m.match_number));
        matches
    }

    fn active_match_for(&self, tournament: &str, user_id: &str) -> Option<MatchRecord> {
        self.brackets.get(tournament).and_then(|b| {
            b.matches
                .iter()
                .find(|m| {
                    m.status != MatchStatus::Completed
                        && (m.player1 == user_id || m.player2 == user_id)
                })
                .cloned()
        })
    }

    fn init_standing(&self, tournament: &str, user_id: &str, username: &str) {
        let mut bracket = self.brackets.entry(tournament.to_string()).or_default();
        bracket
            .standings
            .entry(user_id.to_string())
            .or_insert_with(|| StandingRecord {
                username: username.to_string(),
                standing: Standing::default(),
            });
    }

    fn remove_standing(&self, tournament: &str, user_id: &str) {
        if let Some(mut bracket) = self.brackets.get_mut(tournament) {
            bracket.standings.remove(user_id);
        }
    }

    fn record_standing(
        &self,
        tournament: &str,
        user_id: &str,
        delta: StandingDelta,
    ) -> Result<(), GameError> {
        let mut bracket = self
            .brackets
            .get_mut(tournament)
            .ok_or_else(|| GameError::TournamentNotFound(tournament.to_string()))?;
        let record = bracket
            .standings
            .get_mut(user_id)
            .ok_or(GameError::ParticipantNotFound)?;

        record.standing.matches_played += 1;
        if delta.won {
            record.standing.wins += 1;
        } else {
            record.standing.losses += 1;
        }
        record.standing.points += delta.points;
        Ok(())
    }

    fn standings(&self, tournament: &str) -> Vec<StandingEntry> {
        let mut entries: Vec<StandingEntry> = self
            .brackets
            .get(tournament)
            .map(|b| {
                b.standings
                    .values()
                    .map(|r| StandingEntry {
                        player: r.username.clone(),
                        standing: r.standing,
                    })
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            (b.standing.wins, b.standing.points).cmp(&(a.standing.wins, a.standing.points))
        });
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_player_config() -> RoomConfig {
        RoomConfig {
            capacity: 4,
            sides: vec![Side::Left, Side::Right, Side::Top, Side::Bottom],
            map_style: "classic".to_string(),
            powerups_enabled: false,
        }
    }

    fn store_with_room(config: RoomConfig) -> MemoryStore {
        let store = MemoryStore::new();
        store.create_room("arena", config, None).unwrap();
        store
    }

    #[test]
    fn join_assigns_sides_in_configured_order() {
        let store = store_with_room(four_player_config());

        let a = store.join_room("arena", "u1", "alice").unwrap().assignment();
        assert_eq!(a.side, Side::Left);
        assert_eq!(a.seat_number, 1);
        assert!(a.is_host);

        let b = store.join_room("arena", "u2", "bob").unwrap().assignment();
        assert_eq!(b.side, Side::Right);
        assert_eq!(b.seat_number, 2);
        assert!(!b.is_host);

        let c = store.join_room("arena", "u3", "carol").unwrap().assignment();
        assert_eq!(c.side, Side::Top);
    }

    #[test]
    fn no_two_players_share_a_side() {
        let store = store_with_room(four_player_config());
        for i in 0..4 {
            store
                .join_room("arena", &format!("u{}", i), &format!("p{}", i))
                .unwrap();
        }
        let players = store.room_players("arena").unwrap();
        for (i, p) in players.iter().enumerate() {
            for other in &players[..i] {
                assert_ne!(p.side, other.side);
            }
        }
    }

    #[test]
    fn duplicate_join_returns_existing_assignment() {
        let store = store_with_room(RoomConfig::versus());
        let first = store.join_room("arena", "u1", "alice").unwrap();
        assert!(matches!(first, JoinOutcome::Joined(_)));

        let again = store.join_room("arena", "u1", "alice").unwrap();
        match again {
            JoinOutcome::AlreadyJoined(a) => {
                assert_eq!(a.side, first.assignment().side);
                assert_eq!(a.seat_number, first.assignment().seat_number);
            }
            JoinOutcome::Joined(_) => panic!("second join must report AlreadyJoined"),
        }
    }

    #[test]
    fn join_rejects_full_and_started_rooms() {
        let store = store_with_room(RoomConfig::versus());
        store.join_room("arena", "u1", "alice").unwrap();
        store.join_room("arena", "u2", "bob").unwrap();

        assert!(matches!(
            store.join_room("arena", "u3", "carol"),
            Err(GameError::RoomFull)
        ));

        store.set_room_status("arena", RoomStatus::InProgress).unwrap();
        assert!(matches!(
            store.join_room("arena", "u3", "carol"),
            Err(GameError::RoomNotJoinable)
        ));
    }

    #[test]
    fn ready_predicate_requires_full_room_in_any_order() {
        let store = store_with_room(RoomConfig::versus());
        store.join_room("arena", "u1", "alice").unwrap();

        // Ready before the room is full never satisfies the predicate.
        assert!(!store.set_ready("arena", "u1").unwrap());

        store.join_room("arena", "u2", "bob").unwrap();
        assert!(!store.set_ready("arena", "u1").unwrap());
        assert!(store.set_ready("arena", "u2").unwrap());
    }

    #[test]
    fn leave_renumbers_seats_and_promotes_new_host() {
        let store = store_with_room(four_player_config());
        store.join_room("arena", "u1", "alice").unwrap();
        store.join_room("arena", "u2", "bob").unwrap();
        store.join_room("arena", "u3", "carol").unwrap();

        store.leave_room("arena", "u1").unwrap();
        let players = store.room_players("arena").unwrap();
        let bob = players.iter().find(|p| p.id == "u2").unwrap();
        let carol = players.iter().find(|p| p.id == "u3").unwrap();
        assert_eq!(bob.seat_number, 1);
        assert!(bob.is_host);
        assert_eq!(carol.seat_number, 2);
        assert!(!carol.is_host);
    }

    #[test]
    fn record_result_is_idempotent() {
        let store = store_with_room(RoomConfig::versus());
        store.join_room("arena", "u1", "alice").unwrap();
        store.join_room("arena", "u2", "bob").unwrap();
        store.set_room_status("arena", RoomStatus::InProgress).unwrap();

        let mut scores = HashMap::new();
        scores.insert(Side::Left, 5);
        scores.insert(Side::Right, 2);

        let result = store.record_result("arena", "u1", &scores).unwrap();
        assert_eq!(result.winner, "u1");
        let alice = result.players.iter().find(|p| p.id == "u1").unwrap();
        assert!(alice.is_winner);
        assert_eq!(alice.score, 5);

        let second = store.record_result("arena", "u1", &scores);
        assert!(matches!(second, Err(GameError::NotInProgress)));
        // Stored result is unchanged.
        assert_eq!(store.room_result("arena").unwrap().unwrap().id, result.id);
    }

    #[test]
    fn available_rooms_excludes_tournament_matches() {
        let store = MemoryStore::new();
        store.create_room("open", RoomConfig::versus(), None).unwrap();
        store
            .create_room("cup_r1m0", RoomConfig::versus(), Some("cup"))
            .unwrap();

        let rooms = store.available_rooms();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "open");
    }

    #[test]
    fn match_lifecycle_and_double_completion() {
        let store = MemoryStore::new();
        let id = store.create_match("cup", 1, 0, "u1", "u2").unwrap();
        assert_eq!(id, "cup_r1m0");
        assert_eq!(
            store.match_record("cup", &id).unwrap().status,
            MatchStatus::Scheduled
        );

        store.activate_match("cup", &id).unwrap();
        assert_eq!(
            store.match_record("cup", &id).unwrap().status,
            MatchStatus::InProgress
        );

        store.complete_match("cup", &id, "u1").unwrap();
        assert!(matches!(
            store.complete_match("cup", &id, "u2"),
            Err(GameError::MatchAlreadyCompleted)
        ));
        assert_eq!(store.match_record("cup", &id).unwrap().winner.as_deref(), Some("u1"));
    }

    #[test]
    fn standings_accumulate_and_sort() {
        let store = MemoryStore::new();
        store.init_standing("cup", "u1", "alice");
        store.init_standing("cup", "u2", "bob");

        store
            .record_standing("cup", "u1", StandingDelta { won: true, points: 5 })
            .unwrap();
        store
            .record_standing("cup", "u2", StandingDelta { won: false, points: 2 })
            .unwrap();
        store
            .record_standing("cup", "u1", StandingDelta { won: true, points: 5 })
            .unwrap();

        let standings = store.standings("cup");
        assert_eq!(standings[0].player, "alice");
        assert_eq!(standings[0].standing.wins, 2);
        assert_eq!(standings[0].standing.points, 10);
        assert_eq!(standings[1].player, "bob");
        assert_eq!(standings[1].standing.losses, 1);
    }
}
