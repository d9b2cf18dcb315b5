use tokio::sync::broadcast;

use crate::types::LobbyMsg;

/// Discovery channel: fans room/tournament events out to browsing clients.
///
/// Delivery is best-effort; a subscriber that lags simply skips ahead.
#[derive(Clone)]
pub struct LobbyHandle {
    tx: broadcast::Sender<LobbyMsg>,
}

impl LobbyHandle {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn send(&self, msg: LobbyMsg) {
        let _ = self.tx.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LobbyMsg> {
        self.tx.subscribe()
    }
}

impl Default for LobbyHandle {
    fn default() -> Self {
        Self::new()
    }
}
