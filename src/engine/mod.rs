mod compact;
mod error;
mod games;
mod reservations;
mod slots;

pub use error::CoreError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::model::*;
use crate::notify::EventBroadcaster;
use crate::payment::PaymentGateway;
use crate::wal::Wal;

pub type SharedBucket = Arc<RwLock<SlotBucket>>;
pub type SharedIntent = Arc<Mutex<ReservationIntent>>;
pub type SharedGame = Arc<RwLock<Game>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then flushes the batch with a single fsync and acks every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        // Non-append commands observe every append queued before them.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so the partial bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Collaborators ────────────────────────────────────────

/// External capabilities and tunables the engine is built with.
#[derive(Clone)]
pub struct Environment {
    pub gateway: Arc<dyn PaymentGateway>,
    pub broadcaster: Arc<dyn EventBroadcaster>,
    pub clock: Arc<dyn Clock>,
    pub hold_ttl_ms: Ms,
    pub currency: String,
}

impl Environment {
    pub fn new(gateway: Arc<dyn PaymentGateway>, broadcaster: Arc<dyn EventBroadcaster>) -> Self {
        let defaults = Config::default();
        Self {
            gateway,
            broadcaster,
            clock: Arc::new(SystemClock),
            hold_ttl_ms: defaults.hold_ttl_ms,
            currency: defaults.currency,
        }
    }

    pub fn from_config(
        config: &Config,
        gateway: Arc<dyn PaymentGateway>,
        broadcaster: Arc<dyn EventBroadcaster>,
    ) -> Self {
        Self {
            hold_ttl_ms: config.hold_ttl_ms,
            currency: config.currency.clone(),
            ..Self::new(gateway, broadcaster)
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hold_ttl(mut self, hold_ttl_ms: Ms) -> Self {
        self.hold_ttl_ms = hold_ttl_ms;
        self
    }
}

/// The reservation core: slot buckets, reservation intents and pooled games.
///
/// Every aggregate sits behind its own async lock. A mutation takes the lock,
/// validates against the stored state, appends one event to the WAL and only
/// then applies it, so the check and the write form one indivisible step.
/// Lock order is bucket → intent; games are locked alone. No lock is held
/// across a payment-gateway call.
pub struct Engine {
    pub(super) buckets: DashMap<BucketKey, SharedBucket>,
    /// Reverse lookup: slot id → owning bucket.
    pub(super) slot_index: DashMap<SlotId, BucketKey>,
    pub(super) intents: DashMap<IntentId, SharedIntent>,
    /// Payment session reference → intent.
    pub(super) sessions: DashMap<String, IntentId>,
    pub(super) games: DashMap<GameId, SharedGame>,
    /// Slot → the open or full game claiming it.
    pub(super) slot_games: DashMap<SlotId, GameId>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes bucket generation and deletion.
    pub(super) admin_lock: Mutex<()>,
    /// Aggregate creation holds this shared; compaction holds it exclusively.
    pub(super) creation_gate: RwLock<()>,
    pub(super) env: Environment,
}

// ── Event application (caller holds the aggregate locks) ─

/// Slot side of an event. Statuses move through `compare_and_set`; the caller
/// already validated the transition under the same lock, so a mismatch here
/// means the log disagrees with memory and the event is skipped.
pub(super) fn apply_to_bucket(bucket: &mut SlotBucket, event: &Event) {
    let (slot_id, expected, next) = match event {
        Event::SlotBlocked { slot_id } => (*slot_id, SlotState::Available, SlotStatus::Blocked),
        Event::SlotUnblocked { slot_id } => (*slot_id, SlotState::Blocked, SlotStatus::Available),
        Event::ReservationStarted { intent } => (
            intent.slot_id,
            SlotState::Available,
            SlotStatus::Held {
                actor: intent.actor,
                intent_id: intent.id,
                activity: intent.activity.clone(),
                expires_at: intent.hold_expires_at,
            },
        ),
        Event::ReservationRetried {
            intent_id,
            slot_id,
            actor,
            activity,
            hold_expires_at,
        } => (
            *slot_id,
            SlotState::Available,
            SlotStatus::Held {
                actor: *actor,
                intent_id: *intent_id,
                activity: activity.clone(),
                expires_at: *hold_expires_at,
            },
        ),
        Event::ReservationConfirmed { intent_id, slot_id } => {
            let Some(slot) = bucket.slot_mut(slot_id) else { return };
            let SlotStatus::Held { actor, activity, .. } = slot.status.clone() else {
                tracing::error!(%slot_id, %intent_id, "confirm applied to a slot that is not held");
                return;
            };
            (
                *slot_id,
                SlotState::Held,
                SlotStatus::Booked {
                    actor,
                    intent_id: *intent_id,
                    activity,
                },
            )
        }
        Event::ReservationFailed { intent_id, slot_id, .. }
        | Event::ReservationCancelled { intent_id, slot_id } => {
            // Only release what this intent actually occupies.
            let Some(slot) = bucket.slot_mut(slot_id) else { return };
            if slot.status.intent_id() != Some(*intent_id) {
                return;
            }
            (*slot_id, slot.state(), SlotStatus::Available)
        }
        _ => return,
    };
    if let Some(slot) = bucket.slot_mut(&slot_id)
        && let Err(found) = slot.compare_and_set(expected, next)
    {
        tracing::error!(%slot_id, %expected, %found, "slot transition skipped");
    }
}

pub(super) fn apply_to_intent(intent: &mut ReservationIntent, event: &Event) {
    match event {
        Event::PaymentSessionAttached { session, .. } => {
            intent.session = Some(session.clone());
        }
        Event::ReservationConfirmed { .. } => intent.status = IntentStatus::Confirmed,
        Event::ReservationFailed { reason, .. } => {
            intent.status = IntentStatus::Failed(reason.clone());
        }
        Event::ReservationCancelled { .. } => intent.status = IntentStatus::Cancelled,
        Event::ReservationRetried { hold_expires_at, .. } => {
            intent.status = IntentStatus::Pending;
            intent.hold_expires_at = *hold_expires_at;
            intent.session = None;
            intent.attempts += 1;
        }
        _ => {}
    }
}

pub(super) fn apply_to_game(game: &mut Game, event: &Event) {
    match event {
        Event::JoinRequested { actor, at, .. } => {
            game.join_requests.insert(
                *actor,
                JoinRequest {
                    actor: *actor,
                    status: JoinStatus::Pending,
                    requested_at: *at,
                },
            );
        }
        Event::JoinApproved { actor, .. } => {
            if let Some(req) = game.join_requests.get_mut(actor) {
                req.status = JoinStatus::Approved;
            }
            game.approved_players.insert(*actor);
            game.recompute_status();
        }
        Event::JoinRejected { actor, .. } => {
            if let Some(req) = game.join_requests.get_mut(actor) {
                req.status = JoinStatus::Rejected;
            }
        }
        Event::PlayerLeft { actor, .. } => {
            game.approved_players.remove(actor);
            game.join_requests.remove(actor);
            game.recompute_status();
        }
        Event::GameReservationAttached { intent_id, .. } => game.reservation = Some(*intent_id),
        Event::GameBooked { intent_id, .. } => {
            game.reservation = Some(*intent_id);
            game.booking_status = BookingStatus::Booked;
        }
        Event::GameCompleted { .. } => game.status = GameStatus::Completed,
        Event::GameCancelled { .. } => {
            game.status = GameStatus::Cancelled;
            game.booking_status = BookingStatus::Unbooked;
        }
        Event::VenueRated { actor, rating, .. } => {
            game.ratings.insert(*actor, *rating);
        }
        _ => return,
    }
    game.version += 1;
}

/// Plain collections rebuilt from the log before they are wrapped in locks.
#[derive(Default)]
struct Replayed {
    buckets: HashMap<BucketKey, SlotBucket>,
    slot_index: HashMap<SlotId, BucketKey>,
    intents: HashMap<IntentId, ReservationIntent>,
    games: HashMap<GameId, Game>,
}

impl Replayed {
    fn bucket_of(&mut self, slot_id: &SlotId) -> Option<&mut SlotBucket> {
        let key = self.slot_index.get(slot_id)?;
        self.buckets.get_mut(key)
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::BucketGenerated { key, owner, slots } => {
                for slot in slots {
                    self.slot_index.insert(slot.id, *key);
                }
                self.buckets.insert(
                    *key,
                    SlotBucket {
                        key: *key,
                        owner: *owner,
                        slots: slots.clone(),
                    },
                );
            }
            Event::BucketDeleted { key } => {
                if let Some(bucket) = self.buckets.remove(key) {
                    for slot in &bucket.slots {
                        self.slot_index.remove(&slot.id);
                    }
                }
            }
            Event::SlotBlocked { slot_id } | Event::SlotUnblocked { slot_id } => {
                if let Some(bucket) = self.bucket_of(slot_id) {
                    apply_to_bucket(bucket, event);
                }
            }
            Event::ReservationStarted { intent } => {
                if let Some(bucket) = self.bucket_of(&intent.slot_id) {
                    apply_to_bucket(bucket, event);
                }
                self.intents.insert(intent.id, intent.clone());
            }
            Event::IntentRestored { intent } => {
                self.intents.insert(intent.id, intent.clone());
            }
            Event::PaymentSessionAttached { intent_id, .. } => {
                if let Some(intent) = self.intents.get_mut(intent_id) {
                    apply_to_intent(intent, event);
                }
            }
            Event::ReservationConfirmed { intent_id, slot_id }
            | Event::ReservationFailed { intent_id, slot_id, .. }
            | Event::ReservationCancelled { intent_id, slot_id }
            | Event::ReservationRetried { intent_id, slot_id, .. } => {
                if let Some(bucket) = self.bucket_of(slot_id) {
                    apply_to_bucket(bucket, event);
                }
                if let Some(intent) = self.intents.get_mut(intent_id) {
                    apply_to_intent(intent, event);
                }
            }
            Event::GameCreated { game } => {
                self.games.insert(game.id, game.clone());
            }
            other => {
                if let Some(game) = other.game_id().and_then(|id| self.games.get_mut(&id)) {
                    apply_to_game(game, other);
                }
            }
        }
    }
}

impl Engine {
    /// Open the engine on a WAL file, replaying whatever it already holds.
    /// Must be called inside a tokio runtime (spawns the WAL writer).
    pub fn new(wal_path: PathBuf, env: Environment) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replayed = Replayed::default();
        for event in &events {
            replayed.apply(event);
        }

        let engine = Self {
            buckets: DashMap::new(),
            slot_index: DashMap::new(),
            intents: DashMap::new(),
            sessions: DashMap::new(),
            games: DashMap::new(),
            slot_games: DashMap::new(),
            wal_tx,
            admin_lock: Mutex::new(()),
            creation_gate: RwLock::new(()),
            env,
        };

        for (key, bucket) in replayed.buckets {
            engine.buckets.insert(key, Arc::new(RwLock::new(bucket)));
        }
        for (slot_id, key) in replayed.slot_index {
            engine.slot_index.insert(slot_id, key);
        }
        for (id, intent) in replayed.intents {
            if let Some(session) = intent.session_ref() {
                engine.sessions.insert(session.to_string(), id);
            }
            engine.intents.insert(id, Arc::new(Mutex::new(intent)));
        }
        for (id, game) in replayed.games {
            if !game.status.is_terminal() {
                engine.slot_games.insert(game.slot_id, id);
            }
            engine.games.insert(id, Arc::new(RwLock::new(game)));
        }
        engine.update_active_games_gauge();

        if !events.is_empty() {
            tracing::info!(
                events = events.len(),
                buckets = engine.buckets.len(),
                intents = engine.intents.len(),
                games = engine.games.len(),
                "replayed WAL"
            );
        }
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), CoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| CoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| CoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| CoreError::WalError(e.to_string()))
    }

    pub fn now(&self) -> Ms {
        self.env.clock.now_ms()
    }

    pub fn hold_ttl_ms(&self) -> Ms {
        self.env.hold_ttl_ms
    }

    pub(super) fn bucket_for_slot(&self, slot_id: &SlotId) -> Result<SharedBucket, CoreError> {
        let key = self
            .slot_index
            .get(slot_id)
            .map(|e| *e.value())
            .ok_or(CoreError::NotFound(*slot_id))?;
        self.buckets
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or(CoreError::NotFound(*slot_id))
    }

    pub(super) fn shared_intent(&self, id: &IntentId) -> Result<SharedIntent, CoreError> {
        self.intents
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(CoreError::NotFound(*id))
    }

    pub(super) fn shared_game(&self, id: &GameId) -> Result<SharedGame, CoreError> {
        self.games
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(CoreError::NotFound(*id))
    }

    pub(super) fn publish(&self, event: GameEvent) {
        self.env.broadcaster.publish(event);
    }

    pub(super) fn update_active_games_gauge(&self) {
        metrics::gauge!(crate::observability::GAMES_ACTIVE).set(self.slot_games.len() as f64);
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
