use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

use courtside::config::Config;
use courtside::engine::{CoreError, Engine, Environment};
use courtside::model::*;
use courtside::notify::{self, NotifyHub};
use courtside::payment::MockPaymentGateway;
use courtside::reaper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    courtside::observability::init(config.metrics_port)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let gateway = Arc::new(MockPaymentGateway::new());
    let hub = Arc::new(NotifyHub::new());
    let env = Environment::from_config(&config, gateway.clone(), hub.clone());
    let engine = Arc::new(Engine::new(config.wal_path(), env)?);
    info!("courtside started");
    info!("  wal: {}", config.wal_path().display());
    info!("  hold ttl: {}s", config.hold_ttl_ms / 1000);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let mut events = hub.subscribe_all();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match notify::payload(&event) {
                Ok(json) => info!(target: "courtside::events", "{json}"),
                Err(e) => warn!("unserializable game event: {e}"),
            }
        }
    });
    tokio::spawn(reaper::run_sweeper(engine.clone(), config.sweep_interval));
    tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.sweep_interval,
    ));

    tokio::select! {
        result = run_scenarios(&engine, &gateway) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    info!("courtside stopped");
    Ok(())
}

async fn run_scenarios(engine: &Engine, gateway: &MockPaymentGateway) -> Result<(), CoreError> {
    let owner = Actor::owner(Ulid::new());
    let key = BucketKey {
        facility_id: Ulid::new(),
        court_id: Ulid::new(),
        day: Day::from_ms(engine.now()).succ(),
    };
    let prices = BTreeMap::from([("football".to_string(), 4_000), ("badminton".to_string(), 1_200)]);
    let slots = engine.generate(owner, key, prices).await?;
    info!(bucket = %key, slots = slots.len(), "court opened for tomorrow");

    race_then_retry(engine, gateway, slots[9].id).await?;
    pooled_game(engine, gateway, slots[18].id).await
}

/// A and B race for one slot; A's payment fails and B gets it on retry.
async fn race_then_retry(engine: &Engine, gateway: &MockPaymentGateway, slot_id: SlotId) -> Result<(), CoreError> {
    let (a, b) = (Ulid::new(), Ulid::new());
    let (first, second) = tokio::join!(
        engine.reserve_slot(a, slot_id, "badminton"),
        engine.reserve_slot(b, slot_id, "badminton"),
    );
    let (winner, loser) = match (first, second) {
        (Ok(intent), Err(e)) | (Err(e), Ok(intent)) if e.is_slot_unavailable() => (intent, e),
        (first, second) => {
            warn!(?first, ?second, "unexpected race outcome");
            return Err(CoreError::Conflict("race produced no single winner"));
        }
    };
    info!(winner = %winner.actor, "slot held; other player saw: {loser}");

    let session = winner.session_ref().unwrap_or_default().to_string();
    let failed = engine.settle_session(&session).await?;
    info!(status = failed.status.label(), "winner left checkout without paying");

    let retry_actor = if winner.actor == a { b } else { a };
    let intent = engine.reserve_slot(retry_actor, slot_id, "badminton").await?;
    let session = intent.session_ref().unwrap_or_default().to_string();
    gateway.mark_paid(&session);
    let confirmed = engine.settle_session(&session).await?;
    let slot = engine.get_slot(&slot_id).await?;
    info!(status = confirmed.status.label(), slot = %slot.state(), "second player booked the slot");
    Ok(())
}

/// Four approved players, host pays, a fifth player still joins afterwards.
async fn pooled_game(engine: &Engine, gateway: &MockPaymentGateway, slot_id: SlotId) -> Result<(), CoreError> {
    let host = Ulid::new();
    let game = engine
        .create_game(host, slot_id, "football", PlayersNeeded { min: 4, max: 6 })
        .await?;
    for _ in 0..4 {
        let player = Ulid::new();
        engine.request_join(game.id, player).await?;
        engine.approve(game.id, player, host).await?;
    }

    let intent = engine.start_booking_payment(game.id, host).await?;
    let session = intent.session_ref().unwrap_or_default().to_string();
    gateway.mark_paid(&session);
    engine.settle_session(&session).await?;

    let fifth = Ulid::new();
    engine.request_join(game.id, fifth).await?;
    let game = engine.approve(game.id, fifth, host).await?;
    info!(
        game_id = %game.id,
        roster = game.roster_len(),
        status = game.status.label(),
        booking = ?game.booking_status,
        "pooled game booked"
    );
    Ok(())
}
