use thiserror::Error;

/// Coarse classification used to decide how a failure is surfaced:
/// validation and authorization failures go back to the originating client,
/// conflicts are logged no-ops, not-found may close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotAuthorized,
    NotFound,
    Conflict,
}

/// Everything that can go wrong in the match engine and bracket machinery.
#[derive(Debug, Clone, Error)]
pub enum GameError {
    #[error("room `{0}` not found")]
    RoomNotFound(String),
    #[error("room `{0}` already exists")]
    RoomExists(String),
    #[error("room is not open for joining")]
    RoomNotJoinable,
    #[error("room is full")]
    RoomFull,
    #[error("no available side in this room")]
    NoAvailableSide,
    #[error("player is not in this room")]
    NotInRoom,
    #[error("only the host can start the game")]
    NotHost,
    #[error("cannot start: players missing or not ready")]
    NotAllReady,
    #[error("game is not in progress")]
    NotInProgress,
    #[error("invalid room configuration: {0}")]
    BadRoomConfig(String),

    #[error("tournament `{0}` not found")]
    TournamentNotFound(String),
    #[error("tournament `{0}` already exists")]
    TournamentExists(String),
    #[error("tournament is not open for joining")]
    TournamentNotJoinable,
    #[error("tournament is full")]
    TournamentFull,
    #[error("tournament has already started")]
    TournamentAlreadyStarted,
    #[error("cannot leave a completed tournament")]
    TournamentOver,
    #[error("not enough participants to start")]
    NotEnoughParticipants,
    #[error("unsupported bracket size {0}")]
    BadBracketSize(usize),
    #[error("participant not found")]
    ParticipantNotFound,
    #[error("match `{0}` not found")]
    MatchNotFound(String),
    #[error("match already completed")]
    MatchAlreadyCompleted,
}

impl GameError {
    pub fn kind(&self) -> ErrorKind {
        use GameError::*;
        match self {
            RoomNotFound(_) | TournamentNotFound(_) | MatchNotFound(_) => ErrorKind::NotFound,
            NotHost => ErrorKind::NotAuthorized,
            NotInProgress | MatchAlreadyCompleted | TournamentAlreadyStarted => ErrorKind::Conflict,
            RoomExists(_) | RoomNotJoinable | RoomFull | NoAvailableSide | NotInRoom
            | NotAllReady | BadRoomConfig(_) | TournamentExists(_) | TournamentNotJoinable
            | TournamentFull | TournamentOver | NotEnoughParticipants | BadBracketSize(_)
            | ParticipantNotFound => ErrorKind::Validation,
        }
    }
}
