use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{GameEvent, GameId};

const CHANNEL_CAPACITY: usize = 256;

/// Fire-and-forget sink for game notifications.
pub trait EventBroadcaster: Send + Sync {
    fn publish(&self, event: GameEvent);
}

/// In-process broadcast hub: one firehose plus one channel per game.
pub struct NotifyHub {
    all: broadcast::Sender<GameEvent>,
    games: DashMap<GameId, broadcast::Sender<GameEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            games: DashMap::new(),
        }
    }

    /// Every game event, e.g. for a lobby listing.
    pub fn subscribe_all(&self) -> broadcast::Receiver<GameEvent> {
        self.all.subscribe()
    }

    /// Events for a single game. Creates the channel if needed.
    pub fn subscribe(&self, game_id: GameId) -> broadcast::Receiver<GameEvent> {
        self.games
            .entry(game_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn remove(&self, game_id: &GameId) {
        self.games.remove(game_id);
    }
}

/// JSON payload for subscribers outside the process.
pub fn payload(event: &GameEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

impl EventBroadcaster for NotifyHub {
    /// No-op for channels nobody listens on.
    fn publish(&self, event: GameEvent) {
        let game_id = event.game_id();
        let deleted = matches!(event, GameEvent::GameDeleted(_));
        if let Some(sender) = self.games.get(&game_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
        if deleted {
            self.remove(&game_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn per_game_and_firehose_receive() {
        let hub = NotifyHub::new();
        let gid = Ulid::new();
        let mut game_rx = hub.subscribe(gid);
        let mut all_rx = hub.subscribe_all();

        hub.publish(GameEvent::GameDeleted(gid));

        assert_eq!(game_rx.recv().await.unwrap(), GameEvent::GameDeleted(gid));
        assert_eq!(all_rx.recv().await.unwrap(), GameEvent::GameDeleted(gid));
    }

    #[tokio::test]
    async fn other_games_are_not_delivered() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let mut rx = hub.subscribe(mine);

        hub.publish(GameEvent::GameDeleted(Ulid::new()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(GameEvent::GameDeleted(Ulid::new()));
    }

    #[test]
    fn deleted_game_drops_its_channel() {
        let hub = NotifyHub::new();
        let gid = Ulid::new();
        let _rx = hub.subscribe(gid);
        hub.publish(GameEvent::GameDeleted(gid));
        assert!(hub.games.get(&gid).is_none());
    }

    #[test]
    fn payload_is_tagged_json() {
        let gid = Ulid::new();
        let json = payload(&GameEvent::GameDeleted(gid)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], "GameDeleted");
        assert_eq!(parsed["game"], gid.to_string());
    }
}
