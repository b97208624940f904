use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

pub type SlotId = Ulid;
pub type IntentId = Ulid;
pub type GameId = Ulid;
pub type ActorId = Ulid;
pub type FacilityId = Ulid;
pub type CourtId = Ulid;

/// Sport or activity a slot can be booked for ("football", "badminton", ...).
pub type Activity = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    pub fn has_ended(&self, now: Ms) -> bool {
        self.end <= now
    }
}

/// Calendar day as a count of days since the Unix epoch (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Day(pub i64);

impl Day {
    pub fn from_ms(t: Ms) -> Self {
        Day(t.div_euclid(DAY_MS))
    }

    pub fn start_ms(&self) -> Ms {
        self.0 * DAY_MS
    }

    pub fn succ(&self) -> Self {
        Day(self.0 + 1)
    }
}

/// One (facility, court, day) bucket of slot instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub facility_id: FacilityId,
    pub court_id: CourtId,
    pub day: Day,
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/day{}", self.facility_id, self.court_id, self.day.0)
    }
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Player,
    Owner,
    Admin,
}

/// Authenticated caller identity, as handed over by the request layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub role: Role,
}

impl Actor {
    pub fn player(id: ActorId) -> Self {
        Self { id, role: Role::Player }
    }

    pub fn owner(id: ActorId) -> Self {
        Self { id, role: Role::Owner }
    }

    pub fn admin(id: ActorId) -> Self {
        Self { id, role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Slots ────────────────────────────────────────────────────────

/// Status of a slot instance. Occupied states carry their occupant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Held {
        actor: ActorId,
        intent_id: IntentId,
        activity: Activity,
        expires_at: Ms,
    },
    Booked {
        actor: ActorId,
        intent_id: IntentId,
        activity: Activity,
    },
    Blocked,
}

/// Field-less discriminant of [`SlotStatus`], used as the compare side of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Available,
    Held,
    Booked,
    Blocked,
}

impl SlotState {
    pub fn label(&self) -> &'static str {
        match self {
            SlotState::Available => "available",
            SlotState::Held => "held",
            SlotState::Booked => "booked",
            SlotState::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl SlotStatus {
    pub fn state(&self) -> SlotState {
        match self {
            SlotStatus::Available => SlotState::Available,
            SlotStatus::Held { .. } => SlotState::Held,
            SlotStatus::Booked { .. } => SlotState::Booked,
            SlotStatus::Blocked => SlotState::Blocked,
        }
    }

    /// Intent currently occupying the slot, if any.
    pub fn intent_id(&self) -> Option<IntentId> {
        match self {
            SlotStatus::Held { intent_id, .. } | SlotStatus::Booked { intent_id, .. } => {
                Some(*intent_id)
            }
            SlotStatus::Available | SlotStatus::Blocked => None,
        }
    }
}

/// One bookable interval on one court on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInstance {
    pub id: SlotId,
    pub bucket: BucketKey,
    pub span: Span,
    pub status: SlotStatus,
    /// Price per activity in minor currency units.
    pub prices: BTreeMap<Activity, u64>,
    /// Bumped on every status transition.
    pub version: u64,
}

impl SlotInstance {
    pub fn new(bucket: BucketKey, span: Span, prices: BTreeMap<Activity, u64>) -> Self {
        Self {
            id: Ulid::new(),
            bucket,
            span,
            status: SlotStatus::Available,
            prices,
            version: 0,
        }
    }

    pub fn state(&self) -> SlotState {
        self.status.state()
    }

    pub fn price_for(&self, activity: &str) -> Option<u64> {
        self.prices.get(activity).copied()
    }

    /// Conditional transition: swaps in `next` only if the stored state is `expected`.
    /// On mismatch the slot is untouched and the observed state is returned.
    pub fn compare_and_set(&mut self, expected: SlotState, next: SlotStatus) -> Result<(), SlotState> {
        let current = self.state();
        if current != expected {
            return Err(current);
        }
        self.status = next;
        self.version += 1;
        Ok(())
    }
}

/// All slot instances of one bucket plus the owner allowed to administer them.
#[derive(Debug, Clone)]
pub struct SlotBucket {
    pub key: BucketKey,
    pub owner: ActorId,
    /// Sorted by `span.start`.
    pub slots: Vec<SlotInstance>,
}

impl SlotBucket {
    pub fn slot(&self, id: &SlotId) -> Option<&SlotInstance> {
        self.slots.iter().find(|s| s.id == *id)
    }

    pub fn slot_mut(&mut self, id: &SlotId) -> Option<&mut SlotInstance> {
        self.slots.iter_mut().find(|s| s.id == *id)
    }

    /// True if any slot is held or booked.
    pub fn has_occupied(&self) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(s.state(), SlotState::Held | SlotState::Booked))
    }
}

/// Proof that a slot moved `available → held` for a particular intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationHandle {
    pub slot_id: SlotId,
    pub intent_id: IntentId,
    pub expires_at: Ms,
}

// ── Reservation intents ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Gateway reported the session unpaid.
    PaymentDeclined(String),
    /// Gateway could not create a checkout session.
    SessionCreationFailed(String),
    /// Paid amount differs from the intent amount.
    AmountMismatch { expected: u64, paid: u64 },
    /// Hold lifetime elapsed before payment was confirmed.
    HoldExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    Pending,
    Confirmed,
    Failed(FailureReason),
    Cancelled,
}

impl IntentStatus {
    pub fn label(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Confirmed => "confirmed",
            IntentStatus::Failed(_) => "failed",
            IntentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub session_ref: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationIntent {
    pub id: IntentId,
    pub slot_id: SlotId,
    pub actor: ActorId,
    pub activity: Activity,
    pub amount: u64,
    pub currency: String,
    pub session: Option<PaymentSession>,
    pub status: IntentStatus,
    pub created_at: Ms,
    pub hold_expires_at: Ms,
    /// Set when the reservation pays for a pooled game's venue.
    pub game_id: Option<GameId>,
    /// Number of `reserve` attempts, including retries.
    pub attempts: u32,
}

impl ReservationIntent {
    pub fn is_pending(&self) -> bool {
        self.status == IntentStatus::Pending
    }

    pub fn hold_expired(&self, now: Ms) -> bool {
        self.is_pending() && self.hold_expires_at <= now
    }

    pub fn session_ref(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.session_ref.as_str())
    }
}

// ── Games ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayersNeeded {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub actor: ActorId,
    pub status: JoinStatus,
    pub requested_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameStatus {
    Open,
    Full,
    Completed,
    Cancelled,
}

impl GameStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GameStatus::Completed | GameStatus::Cancelled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            GameStatus::Open => "open",
            GameStatus::Full => "full",
            GameStatus::Completed => "completed",
            GameStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Unbooked,
    Booked,
}

/// Venue rating, 1 to 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rating(u8);

impl Rating {
    pub fn new(value: u8) -> Option<Self> {
        (1..=5).contains(&value).then_some(Rating(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// A pooled game hosted against one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    pub activity: Activity,
    pub slot_id: SlotId,
    pub host: ActorId,
    pub players_needed: PlayersNeeded,
    pub approved_players: BTreeSet<ActorId>,
    /// Keyed by actor: one request per actor.
    pub join_requests: BTreeMap<ActorId, JoinRequest>,
    pub status: GameStatus,
    pub booking_status: BookingStatus,
    /// Latest venue reservation started by the host.
    pub reservation: Option<IntentId>,
    pub ratings: BTreeMap<ActorId, Rating>,
    pub created_at: Ms,
    /// Optimistic-concurrency version; bumped on every applied event.
    pub version: u64,
}

impl Game {
    pub fn is_host(&self, actor: &ActorId) -> bool {
        self.host == *actor
    }

    pub fn roster_len(&self) -> u32 {
        self.approved_players.len() as u32
    }

    /// Re-derive Open/Full from roster size. Terminal states are left alone.
    pub fn recompute_status(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = if self.roster_len() >= self.players_needed.max {
            GameStatus::Full
        } else {
            GameStatus::Open
        };
    }
}

/// Notifications handed to the [`EventBroadcaster`](crate::notify::EventBroadcaster).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "game")]
pub enum GameEvent {
    GameCreated(Game),
    GameUpdated(Game),
    GameDeleted(GameId),
}

impl GameEvent {
    pub fn game_id(&self) -> GameId {
        match self {
            GameEvent::GameCreated(g) | GameEvent::GameUpdated(g) => g.id,
            GameEvent::GameDeleted(id) => *id,
        }
    }
}

/// Flat event records, one per committed mutation. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BucketGenerated {
        key: BucketKey,
        owner: ActorId,
        slots: Vec<SlotInstance>,
    },
    BucketDeleted {
        key: BucketKey,
    },
    SlotBlocked {
        slot_id: SlotId,
    },
    SlotUnblocked {
        slot_id: SlotId,
    },
    /// Slot `available → held` plus a new pending intent, in one record.
    ReservationStarted {
        intent: ReservationIntent,
    },
    PaymentSessionAttached {
        intent_id: IntentId,
        session: PaymentSession,
    },
    ReservationConfirmed {
        intent_id: IntentId,
        slot_id: SlotId,
    },
    ReservationFailed {
        intent_id: IntentId,
        slot_id: SlotId,
        reason: FailureReason,
    },
    ReservationCancelled {
        intent_id: IntentId,
        slot_id: SlotId,
    },
    /// Slot `available → held` again for a failed intent.
    ReservationRetried {
        intent_id: IntentId,
        slot_id: SlotId,
        actor: ActorId,
        activity: Activity,
        hold_expires_at: Ms,
    },
    /// Compaction snapshot of an intent; touches no slot.
    IntentRestored {
        intent: ReservationIntent,
    },
    GameCreated {
        game: Game,
    },
    JoinRequested {
        game_id: GameId,
        actor: ActorId,
        at: Ms,
    },
    JoinApproved {
        game_id: GameId,
        actor: ActorId,
    },
    JoinRejected {
        game_id: GameId,
        actor: ActorId,
    },
    PlayerLeft {
        game_id: GameId,
        actor: ActorId,
    },
    GameReservationAttached {
        game_id: GameId,
        intent_id: IntentId,
    },
    GameBooked {
        game_id: GameId,
        intent_id: IntentId,
    },
    GameCompleted {
        game_id: GameId,
    },
    GameCancelled {
        game_id: GameId,
        by: ActorId,
    },
    VenueRated {
        game_id: GameId,
        actor: ActorId,
        rating: Rating,
    },
}

impl Event {
    pub fn game_id(&self) -> Option<GameId> {
        match self {
            Event::GameCreated { game } => Some(game.id),
            Event::JoinRequested { game_id, .. }
            | Event::JoinApproved { game_id, .. }
            | Event::JoinRejected { game_id, .. }
            | Event::PlayerLeft { game_id, .. }
            | Event::GameReservationAttached { game_id, .. }
            | Event::GameBooked { game_id, .. }
            | Event::GameCompleted { game_id }
            | Event::GameCancelled { game_id, .. }
            | Event::VenueRated { game_id, .. } => Some(*game_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> BucketKey {
        BucketKey {
            facility_id: Ulid::new(),
            court_id: Ulid::new(),
            day: Day(20_000),
        }
    }

    fn game(min: u32, max: u32) -> Game {
        Game {
            id: Ulid::new(),
            activity: "football".into(),
            slot_id: Ulid::new(),
            host: Ulid::new(),
            players_needed: PlayersNeeded { min, max },
            approved_players: BTreeSet::new(),
            join_requests: BTreeMap::new(),
            status: GameStatus::Open,
            booking_status: BookingStatus::Unbooked,
            reservation: None,
            ratings: BTreeMap::new(),
            created_at: 0,
            version: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
        assert!(!s.has_ended(199));
        assert!(s.has_ended(200));
    }

    #[test]
    fn day_boundaries() {
        let d = Day::from_ms(DAY_MS * 3 + 5);
        assert_eq!(d, Day(3));
        assert_eq!(d.start_ms(), DAY_MS * 3);
        assert_eq!(d.succ(), Day(4));
        assert_eq!(Day::from_ms(-1), Day(-1));
    }

    #[test]
    fn compare_and_set_only_from_expected_state() {
        let mut slot = SlotInstance::new(bucket(), Span::new(0, HOUR_MS), BTreeMap::new());
        let held = SlotStatus::Held {
            actor: Ulid::new(),
            intent_id: Ulid::new(),
            activity: "tennis".into(),
            expires_at: 10,
        };
        assert!(slot.compare_and_set(SlotState::Available, held.clone()).is_ok());
        assert_eq!(slot.version, 1);

        // Second taker observes `held` and nothing changes.
        let err = slot.compare_and_set(SlotState::Available, held).unwrap_err();
        assert_eq!(err, SlotState::Held);
        assert_eq!(slot.version, 1);

        slot.compare_and_set(SlotState::Held, SlotStatus::Available).unwrap();
        assert_eq!(slot.state(), SlotState::Available);
        assert_eq!(slot.version, 2);
    }

    #[test]
    fn slot_status_exposes_occupying_intent() {
        let intent_id = Ulid::new();
        let booked = SlotStatus::Booked {
            actor: Ulid::new(),
            intent_id,
            activity: "cricket".into(),
        };
        assert_eq!(booked.intent_id(), Some(intent_id));
        assert_eq!(SlotStatus::Blocked.intent_id(), None);
    }

    #[test]
    fn recompute_status_tracks_roster() {
        let mut g = game(1, 2);
        g.approved_players.insert(Ulid::new());
        g.recompute_status();
        assert_eq!(g.status, GameStatus::Open);

        g.approved_players.insert(Ulid::new());
        g.recompute_status();
        assert_eq!(g.status, GameStatus::Full);

        let first = *g.approved_players.iter().next().unwrap();
        g.approved_players.remove(&first);
        g.recompute_status();
        assert_eq!(g.status, GameStatus::Open);
    }

    #[test]
    fn recompute_status_leaves_terminal_states() {
        let mut g = game(1, 1);
        g.status = GameStatus::Cancelled;
        g.approved_players.insert(Ulid::new());
        g.recompute_status();
        assert_eq!(g.status, GameStatus::Cancelled);
    }

    #[test]
    fn rating_range() {
        assert!(Rating::new(0).is_none());
        assert_eq!(Rating::new(1).map(|r| r.value()), Some(1));
        assert_eq!(Rating::new(5).map(|r| r.value()), Some(5));
        assert!(Rating::new(6).is_none());
    }

    #[test]
    fn game_event_json_payload_is_tagged() {
        let id = Ulid::new();
        let json = serde_json::to_string(&GameEvent::GameDeleted(id)).unwrap();
        assert!(json.contains("\"type\":\"GameDeleted\""));
        assert!(json.contains(&id.to_string()));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let key = bucket();
        let event = Event::BucketGenerated {
            key,
            owner: Ulid::new(),
            slots: vec![SlotInstance::new(key, Span::new(0, HOUR_MS), BTreeMap::from([("football".to_string(), 1500)]))],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
