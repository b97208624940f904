use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{self, GAME_CAS_RETRIES_TOTAL};

use super::{CoreError, Engine, apply_to_game};

fn join_label(status: JoinStatus) -> &'static str {
    match status {
        JoinStatus::Pending => "pending",
        JoinStatus::Approved => "approved",
        JoinStatus::Rejected => "rejected",
    }
}

fn require_active(game: &Game, op: &'static str) -> Result<(), CoreError> {
    if game.status.is_terminal() {
        return Err(CoreError::InvalidTransition {
            entity: game.id,
            from: game.status.label(),
            op,
        });
    }
    Ok(())
}

fn require_host(game: &Game, actor: ActorId) -> Result<(), CoreError> {
    if !game.is_host(&actor) {
        return Err(CoreError::Unauthorized(actor));
    }
    Ok(())
}

/// A game's venue can be paid for: still active, not yet booked, and with
/// enough approved players.
pub(super) fn require_bookable(game: &Game) -> Result<(), CoreError> {
    if game.status.is_terminal() {
        return Err(CoreError::PreconditionFailed("game is completed or cancelled"));
    }
    if game.booking_status == BookingStatus::Booked {
        return Err(CoreError::PreconditionFailed("venue is already booked"));
    }
    if game.roster_len() < game.players_needed.min {
        return Err(CoreError::PreconditionFailed("not enough approved players"));
    }
    Ok(())
}

/// The join request of `actor`, which must still be pending.
fn pending_request(game: &Game, actor: ActorId, op: &'static str) -> Result<(), CoreError> {
    let request = game
        .join_requests
        .get(&actor)
        .ok_or(CoreError::NotFound(actor))?;
    if request.status != JoinStatus::Pending {
        return Err(CoreError::InvalidTransition {
            entity: actor,
            from: join_label(request.status),
            op,
        });
    }
    Ok(())
}

impl Engine {
    /// Inbound: host a pooled game against an available, priced slot.
    /// At most one open or full game may claim a slot.
    pub async fn create_game(
        &self,
        host: ActorId,
        slot_id: SlotId,
        activity: &str,
        players_needed: PlayersNeeded,
    ) -> Result<Game, CoreError> {
        observability::timed("create_game", async {
            let PlayersNeeded { min, max } = players_needed;
            if min == 0 || min > max {
                return Err(CoreError::InvalidInput("players needed must satisfy 1 <= min <= max"));
            }
            if max > MAX_PLAYERS_PER_GAME {
                return Err(CoreError::LimitExceeded("too many players per game"));
            }
            if activity.is_empty() || activity.len() > MAX_ACTIVITY_LEN {
                return Err(CoreError::InvalidInput("activity name must be 1-64 bytes"));
            }
            if self.games.len() >= MAX_GAMES {
                return Err(CoreError::LimitExceeded("too many games"));
            }

            let _gate = self.creation_gate.read().await;
            let bucket = self.bucket_for_slot(&slot_id)?;
            // Held shared until the game is indexed so a bucket delete cannot slip in.
            let guard = bucket.read().await;
            let now = self.now();
            let slot = guard.slot(&slot_id).ok_or(CoreError::NotFound(slot_id))?;
            if slot.state() != SlotState::Available {
                return Err(CoreError::SlotUnavailable(slot_id));
            }
            if slot.span.start <= now {
                return Err(CoreError::PreconditionFailed("slot has already started"));
            }
            if slot.price_for(activity).is_none() {
                return Err(CoreError::PriceNotSet {
                    slot_id,
                    activity: activity.to_string(),
                });
            }

            let game = Game {
                id: Ulid::new(),
                activity: activity.to_string(),
                slot_id,
                host,
                players_needed,
                approved_players: BTreeSet::new(),
                join_requests: BTreeMap::new(),
                status: GameStatus::Open,
                booking_status: BookingStatus::Unbooked,
                reservation: None,
                ratings: BTreeMap::new(),
                created_at: now,
                version: 0,
            };
            match self.slot_games.entry(slot_id) {
                Entry::Occupied(_) => return Err(CoreError::Conflict("slot already has an active game")),
                Entry::Vacant(v) => {
                    v.insert(game.id);
                }
            }
            let event = Event::GameCreated { game: game.clone() };
            if let Err(e) = self.wal_append(&event).await {
                self.slot_games.remove(&slot_id);
                return Err(e);
            }
            self.games.insert(game.id, Arc::new(RwLock::new(game.clone())));
            drop(guard);

            self.update_active_games_gauge();
            tracing::info!(game_id = %game.id, %slot_id, %host, min, max, "game created");
            self.publish(GameEvent::GameCreated(game.clone()));
            Ok(game)
        })
        .await
    }

    /// Optimistic commit: decide against a snapshot without holding the lock,
    /// then apply only if nobody committed in between. On a version mismatch
    /// the decision is re-made against the fresh state.
    async fn commit_game<F>(&self, game_id: GameId, op: &'static str, decide: F) -> Result<Game, CoreError>
    where
        F: Fn(&Game) -> Result<Option<Event>, CoreError>,
    {
        let shared = self.shared_game(&game_id)?;
        for _ in 0..MAX_CAS_RETRIES {
            let snapshot = shared.read().await.clone();
            let Some(event) = decide(&snapshot)? else {
                return Ok(snapshot);
            };

            let mut game = shared.write().await;
            if game.version != snapshot.version {
                metrics::counter!(GAME_CAS_RETRIES_TOTAL, "op" => op).increment(1);
                continue;
            }
            self.wal_append(&event).await?;
            apply_to_game(&mut game, &event);
            let updated = game.clone();
            drop(game);

            self.after_game_event(&updated, &event);
            return Ok(updated);
        }
        tracing::warn!(%game_id, op, "giving up after repeated version conflicts");
        Err(CoreError::LimitExceeded("game contention"))
    }

    fn after_game_event(&self, game: &Game, event: &Event) {
        if game.status.is_terminal() {
            self.slot_games.remove_if(&game.slot_id, |_, id| *id == game.id);
            self.update_active_games_gauge();
        }
        match event {
            Event::GameCancelled { .. } => self.publish(GameEvent::GameDeleted(game.id)),
            _ => self.publish(GameEvent::GameUpdated(game.clone())),
        }
    }

    /// Inbound: ask to join an open game. One live request per actor.
    pub async fn request_join(&self, game_id: GameId, actor: ActorId) -> Result<JoinRequest, CoreError> {
        observability::timed("request_join", async {
            let now = self.now();
            let game = self
                .commit_game(game_id, "request_join", |game| {
                    if game.status != GameStatus::Open {
                        return Err(CoreError::Conflict("game is not open"));
                    }
                    if game.is_host(&actor) {
                        return Err(CoreError::Conflict("host cannot join their own game"));
                    }
                    if game.approved_players.contains(&actor) {
                        return Err(CoreError::Conflict("already approved"));
                    }
                    if game
                        .join_requests
                        .get(&actor)
                        .is_some_and(|r| r.status == JoinStatus::Pending)
                    {
                        return Err(CoreError::Conflict("join request already pending"));
                    }
                    let pending = game
                        .join_requests
                        .values()
                        .filter(|r| r.status == JoinStatus::Pending)
                        .count();
                    if pending >= MAX_PENDING_JOIN_REQUESTS {
                        return Err(CoreError::LimitExceeded("too many pending join requests"));
                    }
                    Ok(Some(Event::JoinRequested {
                        game_id,
                        actor,
                        at: now,
                    }))
                })
                .await?;
            game.join_requests
                .get(&actor)
                .cloned()
                .ok_or(CoreError::NotFound(actor))
        })
        .await
    }

    /// Inbound: host approves a pending request. Never pushes the roster past max.
    pub async fn approve(&self, game_id: GameId, actor: ActorId, host: ActorId) -> Result<Game, CoreError> {
        observability::timed("approve", async {
            let game = self
                .commit_game(game_id, "approve", |game| {
                    require_host(game, host)?;
                    require_active(game, "approve")?;
                    pending_request(game, actor, "approve")?;
                    if game.roster_len() >= game.players_needed.max {
                        return Err(CoreError::CapacityExceeded(game.players_needed.max));
                    }
                    Ok(Some(Event::JoinApproved { game_id, actor }))
                })
                .await?;
            tracing::info!(%game_id, %actor, roster = game.roster_len(), status = game.status.label(), "player approved");
            Ok(game)
        })
        .await
    }

    pub async fn reject(&self, game_id: GameId, actor: ActorId, host: ActorId) -> Result<Game, CoreError> {
        observability::timed(
            "reject",
            self.commit_game(game_id, "reject", |game| {
                require_host(game, host)?;
                require_active(game, "reject")?;
                pending_request(game, actor, "reject")?;
                Ok(Some(Event::JoinRejected { game_id, actor }))
            }),
        )
        .await
    }

    /// Inbound: leave the roster, or withdraw a pending request. Not allowed
    /// for approved players once the venue is paid.
    pub async fn leave_game(&self, game_id: GameId, actor: ActorId) -> Result<Game, CoreError> {
        observability::timed(
            "leave_game",
            self.commit_game(game_id, "leave_game", |game| {
                require_active(game, "leave")?;
                if game.approved_players.contains(&actor) {
                    if game.booking_status == BookingStatus::Booked {
                        return Err(CoreError::PreconditionFailed(
                            "venue is already paid; leaving is a cancellation",
                        ));
                    }
                    return Ok(Some(Event::PlayerLeft { game_id, actor }));
                }
                match game.join_requests.get(&actor) {
                    Some(r) if r.status == JoinStatus::Pending => Ok(Some(Event::PlayerLeft { game_id, actor })),
                    _ => Err(CoreError::NotFound(actor)),
                }
            }),
        )
        .await
    }

    /// Inbound: host starts paying for the venue once enough players are in.
    /// A still-live pending reservation is returned instead of opening a new one.
    pub async fn start_booking_payment(
        &self,
        game_id: GameId,
        host: ActorId,
    ) -> Result<ReservationIntent, CoreError> {
        observability::timed("start_booking_payment", async {
            let game = self.get_game(&game_id).await?;
            require_host(&game, host)?;
            require_bookable(&game)?;
            if let Some(intent_id) = game.reservation
                && let Ok(existing) = self.get_intent(&intent_id).await
                && existing.is_pending()
                && !existing.hold_expired(self.now())
                && existing.session.is_some()
            {
                return Ok(existing);
            }

            let intent = self
                .start_reservation_for(game.slot_id, host, &game.activity, Some(game_id))
                .await?;
            let intent = self.attach_game_reservation(game_id, intent).await?;
            tracing::info!(%game_id, intent_id = %intent.id, amount = intent.amount, "booking payment started");
            Ok(intent)
        })
        .await
    }

    /// Record `intent` as the game's current venue reservation. If the game
    /// stopped being bookable meanwhile, the reservation is cancelled instead.
    pub(super) async fn attach_game_reservation(
        &self,
        game_id: GameId,
        intent: ReservationIntent,
    ) -> Result<ReservationIntent, CoreError> {
        let attached = self
            .commit_game(game_id, "attach_reservation", |game| {
                require_bookable(game)?;
                Ok(Some(Event::GameReservationAttached {
                    game_id,
                    intent_id: intent.id,
                }))
            })
            .await;
        if let Err(e) = attached {
            tracing::warn!(%game_id, intent_id = %intent.id, error = %e, "game not bookable after checkout opened, cancelling reservation");
            if let Err(cancel_err) = self.cancel_intent(intent.id, true).await {
                tracing::error!(intent_id = %intent.id, error = %cancel_err, "compensating cancel failed");
            }
            return Err(e);
        }
        Ok(intent)
    }

    /// Payment for the game's venue went through. Repeated calls are no-ops.
    pub(super) async fn mark_game_booked(&self, game_id: GameId, intent_id: IntentId) -> Result<(), CoreError> {
        let game = self
            .commit_game(game_id, "mark_game_booked", |game| {
                if game.status.is_terminal()
                    || (game.booking_status == BookingStatus::Booked && game.reservation == Some(intent_id))
                {
                    return Ok(None);
                }
                Ok(Some(Event::GameBooked { game_id, intent_id }))
            })
            .await?;
        if game.booking_status == BookingStatus::Booked {
            tracing::info!(%game_id, %intent_id, "game venue booked");
        }
        Ok(())
    }

    /// Inbound: host closes the game after the slot's end time.
    pub async fn complete_game(&self, game_id: GameId, host: ActorId) -> Result<Game, CoreError> {
        observability::timed("complete_game", async {
            let current = self.get_game(&game_id).await?;
            require_host(&current, host)?;
            require_active(&current, "complete")?;
            let slot_end = self.get_slot(&current.slot_id).await?.span.end;
            let now = self.now();
            let game = self
                .commit_game(game_id, "complete_game", |game| {
                    require_host(game, host)?;
                    require_active(game, "complete")?;
                    if now < slot_end {
                        return Err(CoreError::PreconditionFailed("slot has not ended yet"));
                    }
                    Ok(Some(Event::GameCompleted { game_id }))
                })
                .await?;
            tracing::info!(%game_id, "game completed");

            // A checkout still open for the venue can no longer book anything.
            if game.booking_status == BookingStatus::Unbooked
                && let Some(intent_id) = game.reservation
                && let Err(e) = self.cancel_intent(intent_id, false).await
            {
                tracing::error!(%game_id, %intent_id, error = %e, "failed to cancel game reservation");
            }
            Ok(game)
        })
        .await
    }

    /// Host or admin cancels an open or full game. Any pending or confirmed
    /// venue reservation is cancelled afterwards, refunding a payment.
    pub async fn cancel_game(&self, game_id: GameId, actor: Actor) -> Result<Game, CoreError> {
        observability::timed("cancel_game", async {
            let game = self
                .commit_game(game_id, "cancel_game", |game| {
                    if !game.is_host(&actor.id) && !actor.is_admin() {
                        return Err(CoreError::Unauthorized(actor.id));
                    }
                    require_active(game, "cancel")?;
                    Ok(Some(Event::GameCancelled {
                        game_id,
                        by: actor.id,
                    }))
                })
                .await?;
            tracing::info!(%game_id, by = %actor.id, "game cancelled");

            if let Some(intent_id) = game.reservation
                && let Err(e) = self.cancel_intent(intent_id, true).await
            {
                tracing::error!(%game_id, %intent_id, error = %e, "failed to cancel game reservation");
            }
            Ok(game)
        })
        .await
    }

    /// Inbound: an approved player rates the venue of a completed game.
    /// Rating again overwrites.
    pub async fn rate_venue(&self, game_id: GameId, actor: ActorId, rating: u8) -> Result<Game, CoreError> {
        observability::timed("rate_venue", async {
            let rating = Rating::new(rating).ok_or(CoreError::InvalidInput("rating must be 1-5"))?;
            self.commit_game(game_id, "rate_venue", |game| {
                if game.status != GameStatus::Completed {
                    return Err(CoreError::PreconditionFailed("game is not completed"));
                }
                if !game.approved_players.contains(&actor) {
                    return Err(CoreError::Unauthorized(actor));
                }
                Ok(Some(Event::VenueRated {
                    game_id,
                    actor,
                    rating,
                }))
            })
            .await
        })
        .await
    }

    // ── Queries ──────────────────────────────────────────────

    pub async fn get_game(&self, game_id: &GameId) -> Result<Game, CoreError> {
        let shared = self.shared_game(game_id)?;
        let game = shared.read().await;
        Ok(game.clone())
    }

    /// Open games, oldest first, optionally for one activity only.
    pub async fn list_open_games(&self, activity: Option<&str>) -> Vec<Game> {
        let shared: Vec<_> = self.games.iter().map(|e| e.value().clone()).collect();
        let mut open = Vec::new();
        for game in shared {
            let game = game.read().await;
            if game.status == GameStatus::Open && activity.is_none_or(|a| game.activity == a) {
                open.push(game.clone());
            }
        }
        open.sort_by_key(|g| (g.created_at, g.id));
        open
    }
}
