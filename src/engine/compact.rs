use tokio::sync::oneshot;

use crate::model::*;

use super::{CoreError, Engine, WalCommand};

impl Engine {
    /// Rewrite the WAL as the minimal event list that recreates current state:
    /// one `BucketGenerated` per bucket (carrying live slot statuses), one
    /// `IntentRestored` per intent and one `GameCreated` per game.
    ///
    /// Every aggregate stays locked until the writer has swapped files, so no
    /// append can land in the old log after the snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), CoreError> {
        let _gate = self.creation_gate.write().await;

        let mut buckets: Vec<_> = self.buckets.iter().map(|e| e.value().clone()).collect();
        let mut bucket_guards = Vec::with_capacity(buckets.len());
        for bucket in buckets.drain(..) {
            bucket_guards.push(bucket.read_owned().await);
        }
        bucket_guards.sort_by_key(|b| b.key);

        let intents: Vec<_> = self.intents.iter().map(|e| e.value().clone()).collect();
        let mut intent_guards = Vec::with_capacity(intents.len());
        for intent in intents {
            intent_guards.push(intent.lock_owned().await);
        }
        intent_guards.sort_by_key(|i| i.id);

        let games: Vec<_> = self.games.iter().map(|e| e.value().clone()).collect();
        let mut game_guards = Vec::with_capacity(games.len());
        for game in games {
            game_guards.push(game.read_owned().await);
        }
        game_guards.sort_by_key(|g| g.id);

        let mut events = Vec::with_capacity(bucket_guards.len() + intent_guards.len() + game_guards.len());
        for bucket in &bucket_guards {
            events.push(Event::BucketGenerated {
                key: bucket.key,
                owner: bucket.owner,
                slots: bucket.slots.clone(),
            });
        }
        for intent in &intent_guards {
            events.push(Event::IntentRestored {
                intent: (**intent).clone(),
            });
        }
        for game in &game_guards {
            events.push(Event::GameCreated {
                game: (**game).clone(),
            });
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| CoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| CoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| CoreError::WalError(e.to_string()))?;
        tracing::info!(events = count, "compacted WAL");
        Ok(())
    }
}
