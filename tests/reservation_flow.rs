use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use courtside::clock::ManualClock;
use courtside::engine::{CoreError, Engine, Environment};
use courtside::model::*;
use courtside::notify::NotifyHub;
use courtside::payment::MockPaymentGateway;

const TTL: Ms = 5 * 60_000;

// ── Test infrastructure ──────────────────────────────────────

struct Venue {
    engine: Arc<Engine>,
    gateway: Arc<MockPaymentGateway>,
    hub: Arc<NotifyHub>,
    clock: Arc<ManualClock>,
    slots: Vec<SlotInstance>,
}

impl Venue {
    async fn slot_state(&self, slot_id: SlotId) -> SlotState {
        assert_ok!(self.engine.get_slot(&slot_id).await).state()
    }

    async fn pay(&self, intent: &ReservationIntent) -> ReservationIntent {
        let session = intent.session_ref().unwrap();
        assert!(self.gateway.mark_paid(session));
        assert_ok!(self.engine.settle_session(session).await)
    }
}

async fn open_venue() -> Venue {
    let dir = std::env::temp_dir().join(format!("courtside_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let gateway = Arc::new(MockPaymentGateway::new());
    let hub = Arc::new(NotifyHub::new());
    let clock = Arc::new(ManualClock::new(0));
    let env = Environment::new(gateway.clone(), hub.clone())
        .with_clock(clock.clone())
        .with_hold_ttl(TTL);
    let engine = Arc::new(Engine::new(dir.join("courtside.wal"), env).unwrap());

    let key = BucketKey {
        facility_id: Ulid::new(),
        court_id: Ulid::new(),
        day: Day(3),
    };
    let prices = BTreeMap::from([("football".to_string(), 4_000), ("badminton".to_string(), 1_200)]);
    let slots = assert_ok!(engine.generate(Actor::owner(Ulid::new()), key, prices).await);

    Venue {
        engine,
        gateway,
        hub,
        clock,
        slots,
    }
}

// ── Properties ───────────────────────────────────────────────

#[tokio::test]
async fn concurrent_reservations_yield_one_winner() {
    let venue = open_venue().await;
    let slot_id = venue.slots[10].id;

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let engine = venue.engine.clone();
            tokio::spawn(async move { engine.reserve_slot(Ulid::new(), slot_id, "badminton").await })
        })
        .collect();
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let losers = results.iter().filter(|r| matches!(r, Err(CoreError::SlotUnavailable(id)) if *id == slot_id));
    assert_eq!(losers.count(), 31);

    let slot = assert_ok!(venue.engine.get_slot(&slot_id).await);
    assert_eq!(slot.state(), SlotState::Held);
    assert_eq!(slot.version, 1);
    assert_eq!(slot.status.intent_id(), Some(winners[0].id));
    assert_eq!(venue.gateway.sessions_created(), 1);
}

#[tokio::test]
async fn raw_reserve_race_on_every_slot() {
    let venue = open_venue().await;
    let mut tasks = Vec::new();
    for slot in &venue.slots {
        for _ in 0..4 {
            let engine = venue.engine.clone();
            let slot_id = slot.id;
            tasks.push(tokio::spawn(async move { engine.reserve(slot_id, Ulid::new(), "football").await }));
        }
    }
    let won = join_all(tasks)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(won, venue.slots.len());
}

#[tokio::test]
async fn approvals_stop_at_capacity() {
    let venue = open_venue().await;
    let host = Ulid::new();
    let game = assert_ok!(
        venue
            .engine
            .create_game(host, venue.slots[12].id, "football", PlayersNeeded { min: 2, max: 3 })
            .await
    );
    let players: Vec<ActorId> = (0..4).map(|_| Ulid::new()).collect();
    for p in &players {
        assert_ok!(venue.engine.request_join(game.id, *p).await);
    }
    for p in &players[..3] {
        let g = assert_ok!(venue.engine.approve(game.id, *p, host).await);
        assert!(g.roster_len() <= 3);
    }
    let before = assert_ok!(venue.engine.get_game(&game.id).await);
    let err = assert_err!(venue.engine.approve(game.id, players[3], host).await);
    assert_eq!(err, CoreError::CapacityExceeded(3));
    assert_eq!(assert_ok!(venue.engine.get_game(&game.id).await), before);
}

#[tokio::test]
async fn failed_payment_frees_slot_for_someone_else() {
    let venue = open_venue().await;
    let slot_id = venue.slots[14].id;
    let intent = assert_ok!(venue.engine.start_reservation(slot_id, Ulid::new(), "badminton").await);
    assert_ok!(
        venue
            .engine
            .fail_payment(intent.session_ref().unwrap(), FailureReason::PaymentDeclined("card declined".into()))
            .await
    );
    assert_eq!(venue.slot_state(slot_id).await, SlotState::Available);
    assert_ok!(venue.engine.reserve(slot_id, Ulid::new(), "badminton").await);
}

#[tokio::test]
async fn duplicate_confirmation_changes_nothing() {
    let venue = open_venue().await;
    let slot_id = venue.slots[15].id;
    let intent = assert_ok!(venue.engine.reserve_slot(Ulid::new(), slot_id, "badminton").await);
    let session = intent.session_ref().unwrap();

    let first = assert_ok!(venue.engine.confirm_payment(session).await);
    let slot = assert_ok!(venue.engine.get_slot(&slot_id).await);
    let second = assert_ok!(venue.engine.confirm_payment(session).await);
    assert_eq!(first, second);
    assert_eq!(assert_ok!(venue.engine.get_slot(&slot_id).await), slot);
    assert!(venue.gateway.refunds().is_empty());
}

#[tokio::test]
async fn roster_moves_between_open_and_full() {
    let venue = open_venue().await;
    let host = Ulid::new();
    let game = assert_ok!(
        venue
            .engine
            .create_game(host, venue.slots[16].id, "football", PlayersNeeded { min: 1, max: 2 })
            .await
    );
    let (a, b) = (Ulid::new(), Ulid::new());
    for p in [a, b] {
        assert_ok!(venue.engine.request_join(game.id, p).await);
    }
    assert_eq!(assert_ok!(venue.engine.approve(game.id, a, host).await).status, GameStatus::Open);
    assert_eq!(assert_ok!(venue.engine.approve(game.id, b, host).await).status, GameStatus::Full);
    assert_eq!(assert_ok!(venue.engine.leave_game(game.id, a).await).status, GameStatus::Open);
}

#[tokio::test]
async fn delayed_callback_after_expiry_is_refused() {
    let venue = open_venue().await;
    let slot_id = venue.slots[17].id;
    let slow = assert_ok!(venue.engine.reserve_slot(Ulid::new(), slot_id, "badminton").await);

    venue.clock.advance(TTL);
    assert_eq!(venue.engine.expire_stale_holds().await, 1);
    assert_eq!(venue.slot_state(slot_id).await, SlotState::Available);

    let fast = assert_ok!(venue.engine.reserve_slot(Ulid::new(), slot_id, "badminton").await);
    venue.pay(&fast).await;

    let err = assert_err!(venue.engine.confirm_payment(slow.session_ref().unwrap()).await);
    assert!(matches!(
        err,
        CoreError::SlotUnavailable(_) | CoreError::InvalidTransition { .. }
    ));
    let slot = assert_ok!(venue.engine.get_slot(&slot_id).await);
    assert_eq!(slot.status.intent_id(), Some(fast.id));
    assert_eq!(slot.state(), SlotState::Booked);
}

// ── Walkthroughs ─────────────────────────────────────────────

#[tokio::test]
async fn race_lost_then_won_after_failed_payment() {
    let venue = open_venue().await;
    let s1 = venue.slots[9].id;
    let (a, b) = (Ulid::new(), Ulid::new());

    let intent_a = assert_ok!(venue.engine.reserve_slot(a, s1, "badminton").await);
    assert_eq!(venue.slot_state(s1).await, SlotState::Held);
    let err = assert_err!(venue.engine.reserve_slot(b, s1, "badminton").await);
    assert_eq!(err, CoreError::SlotUnavailable(s1));

    let failed = assert_ok!(
        venue
            .engine
            .fail_payment(intent_a.session_ref().unwrap(), FailureReason::PaymentDeclined("insufficient funds".into()))
            .await
    );
    assert!(matches!(failed.status, IntentStatus::Failed(_)));
    assert_eq!(venue.slot_state(s1).await, SlotState::Available);

    let intent_b = assert_ok!(venue.engine.reserve_slot(b, s1, "badminton").await);
    let booked = venue.pay(&intent_b).await;
    assert_eq!(booked.status, IntentStatus::Confirmed);
    assert_eq!(venue.slot_state(s1).await, SlotState::Booked);
}

#[tokio::test]
async fn pooled_game_books_and_keeps_filling() {
    let venue = open_venue().await;
    let mut events = venue.hub.subscribe_all();
    let host = Ulid::new();
    let slot_id = venue.slots[18].id;
    let game = assert_ok!(
        venue
            .engine
            .create_game(host, slot_id, "football", PlayersNeeded { min: 4, max: 6 })
            .await
    );
    for _ in 0..4 {
        let p = Ulid::new();
        assert_ok!(venue.engine.request_join(game.id, p).await);
        assert_ok!(venue.engine.approve(game.id, p, host).await);
    }

    let intent = assert_ok!(venue.engine.start_booking_payment(game.id, host).await);
    assert_eq!(intent.amount, 4_000);
    venue.pay(&intent).await;
    let booked = assert_ok!(venue.engine.get_game(&game.id).await);
    assert_eq!(booked.booking_status, BookingStatus::Booked);
    assert_eq!(venue.slot_state(slot_id).await, SlotState::Booked);

    let fifth = Ulid::new();
    assert_ok!(venue.engine.request_join(game.id, fifth).await);
    let game = assert_ok!(venue.engine.approve(game.id, fifth, host).await);
    assert_eq!(game.roster_len(), 5);
    assert_eq!(game.status, GameStatus::Open);
    assert_eq!(game.booking_status, BookingStatus::Booked);

    // Every change reached subscribers; the last one is the fifth approval.
    let mut last = None;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.game_id(), game.id);
        last = Some(event);
    }
    assert_eq!(last, Some(GameEvent::GameUpdated(game)));
}
