use std::time::Instant;

use crate::model::*;
use crate::observability::{self, COMPENSATIONS_TOTAL, HOLDS_EXPIRED_TOTAL, REFUNDS_FAILED_TOTAL, SLOT_RACES_LOST_TOTAL};

use super::games::require_bookable;
use super::{CoreError, Engine, apply_to_bucket, apply_to_intent};

fn released(intent: &ReservationIntent, reason: FailureReason) -> Event {
    Event::ReservationFailed {
        intent_id: intent.id,
        slot_id: intent.slot_id,
        reason,
    }
}

/// A callback may only act on the session currently attached to the intent;
/// a retry replaces the session and orphans the old one.
fn check_session(intent: &ReservationIntent, session_ref: Option<&str>, op: &'static str) -> Result<(), CoreError> {
    match session_ref {
        Some(s) if intent.session_ref() != Some(s) => Err(CoreError::InvalidTransition {
            entity: intent.id,
            from: "superseded",
            op,
        }),
        _ => Ok(()),
    }
}

impl Engine {
    /// Inbound: hold the slot and open a checkout session for it.
    pub async fn reserve_slot(
        &self,
        actor: ActorId,
        slot_id: SlotId,
        activity: &str,
    ) -> Result<ReservationIntent, CoreError> {
        let started = Instant::now();
        let result = self.start_reservation(slot_id, actor, activity).await;
        observability::record("reserve_slot", started, &result);
        result
    }

    pub async fn start_reservation(
        &self,
        slot_id: SlotId,
        actor: ActorId,
        activity: &str,
    ) -> Result<ReservationIntent, CoreError> {
        self.start_reservation_for(slot_id, actor, activity, None).await
    }

    pub(super) async fn start_reservation_for(
        &self,
        slot_id: SlotId,
        actor: ActorId,
        activity: &str,
        game_id: Option<GameId>,
    ) -> Result<ReservationIntent, CoreError> {
        let intent = self.hold_slot(slot_id, actor, activity, game_id).await?;
        self.open_checkout(intent).await
    }

    /// Ask the gateway for a checkout session. No lock is held during the
    /// call. On failure the hold is released before the error is returned.
    async fn open_checkout(&self, intent: ReservationIntent) -> Result<ReservationIntent, CoreError> {
        let created = self
            .env
            .gateway
            .create_session(intent.amount, &intent.currency, intent.id)
            .await;
        match created {
            Ok(session) => self.attach_session(intent.id, session).await,
            Err(e) => {
                metrics::counter!(COMPENSATIONS_TOTAL).increment(1);
                tracing::warn!(
                    intent_id = %intent.id,
                    slot_id = %intent.slot_id,
                    error = %e,
                    "checkout session failed, releasing hold"
                );
                let reason = FailureReason::SessionCreationFailed(e.to_string());
                if let Err(release_err) = self.fail_intent(intent.id, None, reason).await {
                    tracing::error!(intent_id = %intent.id, error = %release_err, "compensating release failed");
                }
                Err(CoreError::PaymentError(e.to_string()))
            }
        }
    }

    async fn attach_session(
        &self,
        intent_id: IntentId,
        session: PaymentSession,
    ) -> Result<ReservationIntent, CoreError> {
        let shared = self.shared_intent(&intent_id)?;
        let mut intent = shared.lock().await;
        if !intent.is_pending() {
            // Expired or cancelled while the gateway call was in flight.
            return Err(CoreError::SlotUnavailable(intent.slot_id));
        }
        let event = Event::PaymentSessionAttached {
            intent_id,
            session: session.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_intent(&mut intent, &event);
        self.sessions.insert(session.session_ref, intent_id);
        Ok(intent.clone())
    }

    /// Payment succeeded for `session_ref`. Duplicate confirmations are no-ops.
    pub async fn confirm_payment(&self, session_ref: &str) -> Result<ReservationIntent, CoreError> {
        let started = Instant::now();
        let result = match self.session_intent_id(session_ref) {
            Ok(intent_id) => self.confirm_intent_checked(intent_id, Some(session_ref)).await,
            Err(e) => Err(e),
        };
        observability::record("confirm_payment", started, &result);
        result
    }

    /// Payment failed for `session_ref`: the intent fails and the slot is released.
    pub async fn fail_payment(
        &self,
        session_ref: &str,
        reason: FailureReason,
    ) -> Result<ReservationIntent, CoreError> {
        let started = Instant::now();
        let result = match self.session_intent_id(session_ref) {
            Ok(intent_id) => self.fail_intent(intent_id, Some(session_ref), reason).await,
            Err(e) => Err(e),
        };
        observability::record("fail_payment", started, &result);
        result
    }

    /// Verify a returning checkout session with the gateway and settle the
    /// intent either way. Money that arrives for an intent that can no longer
    /// be confirmed is refunded.
    pub async fn settle_session(&self, session_ref: &str) -> Result<ReservationIntent, CoreError> {
        let intent_id = self.session_intent_id(session_ref)?;
        let verification = self
            .env
            .gateway
            .verify_session(session_ref)
            .await
            .map_err(|e| CoreError::PaymentError(e.to_string()))?;
        if verification.reservation_ref != intent_id {
            tracing::warn!(
                session_ref,
                %intent_id,
                reported = %verification.reservation_ref,
                "gateway reports session for another reservation"
            );
            let reason = FailureReason::PaymentDeclined("session issued for another reservation".into());
            let result = self.fail_payment(session_ref, reason).await;
            if verification.paid {
                self.refund(session_ref, verification.amount).await;
            }
            return result;
        }
        if !verification.paid {
            return self
                .fail_payment(session_ref, FailureReason::PaymentDeclined("session not paid".into()))
                .await;
        }

        let expected = self.get_intent(&intent_id).await?.amount;
        if verification.amount != expected {
            let reason = FailureReason::AmountMismatch {
                expected,
                paid: verification.amount,
            };
            let result = self.fail_payment(session_ref, reason).await;
            self.refund(session_ref, verification.amount).await;
            return result;
        }

        match self.confirm_payment(session_ref).await {
            Err(e @ (CoreError::SlotUnavailable(_) | CoreError::InvalidTransition { .. })) => {
                tracing::warn!(session_ref, %intent_id, error = %e, "late payment, refunding");
                self.refund(session_ref, verification.amount).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Inbound: re-attempt a failed reservation against the same slot.
    pub async fn retry_reservation(
        &self,
        actor: Actor,
        intent_id: IntentId,
    ) -> Result<ReservationIntent, CoreError> {
        let started = Instant::now();
        let result = self.retry(actor, intent_id).await;
        observability::record("retry_reservation", started, &result);
        result
    }

    async fn retry(&self, actor: Actor, intent_id: IntentId) -> Result<ReservationIntent, CoreError> {
        let current = self.get_intent(&intent_id).await?;
        if current.actor != actor.id && !actor.is_admin() {
            return Err(CoreError::Unauthorized(actor.id));
        }
        if let Some(game_id) = current.game_id {
            require_bookable(&self.get_game(&game_id).await?)?;
        }
        self.expire_lapsed_hold(&current.slot_id).await?;

        let now = self.now();
        let hold_expires_at = now + self.hold_ttl_ms();
        let (intent, _) = self
            .transition_reservation(intent_id, |intent, bucket| {
                if !matches!(intent.status, IntentStatus::Failed(_)) {
                    return Err(CoreError::InvalidTransition {
                        entity: intent.id,
                        from: intent.status.label(),
                        op: "retry",
                    });
                }
                let slot = bucket
                    .slot(&intent.slot_id)
                    .ok_or(CoreError::NotFound(intent.slot_id))?;
                let claimed_by = self.slot_games.get(&slot.id).map(|e| *e.value());
                if slot.state() != SlotState::Available || (claimed_by.is_some() && claimed_by != intent.game_id) {
                    metrics::counter!(SLOT_RACES_LOST_TOTAL).increment(1);
                    return Err(CoreError::SlotUnavailable(slot.id));
                }
                if slot.span.start <= now {
                    return Err(CoreError::PreconditionFailed("slot has already started"));
                }
                Ok(Some(Event::ReservationRetried {
                    intent_id: intent.id,
                    slot_id: intent.slot_id,
                    actor: intent.actor,
                    activity: intent.activity.clone(),
                    hold_expires_at,
                }))
            })
            .await?;
        tracing::info!(%intent_id, attempts = intent.attempts, "reservation retried");
        let intent = self.open_checkout(intent).await?;
        match intent.game_id {
            Some(game_id) => self.attach_game_reservation(game_id, intent).await,
            None => Ok(intent),
        }
    }

    /// Inbound: cancel a pending or confirmed reservation. A confirmed one
    /// gets its booked slot released and its payment refunded.
    pub async fn cancel_reservation(
        &self,
        actor: Actor,
        intent_id: IntentId,
    ) -> Result<ReservationIntent, CoreError> {
        let started = Instant::now();
        let result = async {
            let current = self.get_intent(&intent_id).await?;
            if current.actor != actor.id && !actor.is_admin() {
                return Err(CoreError::Unauthorized(actor.id));
            }
            if current.game_id.is_some() {
                return Err(CoreError::PreconditionFailed(
                    "reservation pays for a game; cancel the game instead",
                ));
            }
            self.cancel_intent(intent_id, true).await
        }
        .await;
        observability::record("cancel_reservation", started, &result);
        result
    }

    /// Release every pending hold whose expiry has passed. Returns how many
    /// were released.
    pub async fn expire_stale_holds(&self) -> usize {
        let now = self.now();
        // Intents locked right now are mid-transition; the next sweep sees them.
        let candidates: Vec<(IntentId, SlotId)> = self
            .intents
            .iter()
            .filter_map(|entry| {
                let intent = entry.value().try_lock().ok()?;
                intent
                    .hold_expired(now)
                    .then_some((intent.id, intent.slot_id))
            })
            .collect();

        let mut expired = 0;
        for (intent_id, slot_id) in candidates {
            let Ok(bucket) = self.bucket_for_slot(&slot_id) else {
                continue;
            };
            let mut guard = bucket.write().await;
            match self.expire_under_lock(&mut guard, intent_id, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(%intent_id, error = %e, "failed to expire hold"),
            }
        }
        if expired > 0 {
            tracing::info!(expired, "released stale holds");
        }
        expired
    }

    pub async fn get_intent(&self, intent_id: &IntentId) -> Result<ReservationIntent, CoreError> {
        let shared = self.shared_intent(intent_id)?;
        let intent = shared.lock().await;
        Ok(intent.clone())
    }

    pub async fn intent_for_session(&self, session_ref: &str) -> Result<ReservationIntent, CoreError> {
        let intent_id = self.session_intent_id(session_ref)?;
        self.get_intent(&intent_id).await
    }

    // ── Transitions ──────────────────────────────────────────

    fn session_intent_id(&self, session_ref: &str) -> Result<IntentId, CoreError> {
        self.sessions
            .get(session_ref)
            .map(|e| *e.value())
            .ok_or_else(|| CoreError::UnknownSession(session_ref.to_string()))
    }

    /// Decide and apply one reservation event under the bucket → intent locks.
    /// `decide` returning `None` means the intent is already where the caller
    /// wants it. Returns the resulting intent and whether an event was applied.
    async fn transition_reservation<F>(
        &self,
        intent_id: IntentId,
        decide: F,
    ) -> Result<(ReservationIntent, bool), CoreError>
    where
        F: FnOnce(&ReservationIntent, &SlotBucket) -> Result<Option<Event>, CoreError>,
    {
        let shared = self.shared_intent(&intent_id)?;
        let slot_id = shared.lock().await.slot_id;
        let bucket = self.bucket_for_slot(&slot_id)?;
        let mut bucket_guard = bucket.write().await;
        let mut intent = shared.lock().await;

        let Some(event) = decide(&*intent, &*bucket_guard)? else {
            return Ok((intent.clone(), false));
        };
        self.wal_append(&event).await?;
        apply_to_bucket(&mut bucket_guard, &event);
        apply_to_intent(&mut intent, &event);
        Ok((intent.clone(), true))
    }

    /// `held → booked`. Used by the payment callback and by `confirm_slot`.
    pub(super) async fn confirm_intent(&self, intent_id: IntentId) -> Result<ReservationIntent, CoreError> {
        self.confirm_intent_checked(intent_id, None).await
    }

    async fn confirm_intent_checked(
        &self,
        intent_id: IntentId,
        session_ref: Option<&str>,
    ) -> Result<ReservationIntent, CoreError> {
        let now = self.now();
        let (intent, applied) = self
            .transition_reservation(intent_id, |intent, bucket| {
                check_session(intent, session_ref, "confirm")?;
                match &intent.status {
                    IntentStatus::Confirmed => Ok(None),
                    IntentStatus::Pending if intent.hold_expires_at <= now => {
                        Ok(Some(released(intent, FailureReason::HoldExpired)))
                    }
                    IntentStatus::Pending => {
                        let holds = bucket
                            .slot(&intent.slot_id)
                            .is_some_and(|s| matches!(&s.status, SlotStatus::Held { intent_id, .. } if *intent_id == intent.id));
                        if !holds {
                            return Err(CoreError::SlotUnavailable(intent.slot_id));
                        }
                        Ok(Some(Event::ReservationConfirmed {
                            intent_id: intent.id,
                            slot_id: intent.slot_id,
                        }))
                    }
                    IntentStatus::Failed(FailureReason::HoldExpired) => {
                        Err(CoreError::SlotUnavailable(intent.slot_id))
                    }
                    other => Err(CoreError::InvalidTransition {
                        entity: intent.id,
                        from: other.label(),
                        op: "confirm",
                    }),
                }
            })
            .await?;

        if intent.status == IntentStatus::Failed(FailureReason::HoldExpired) {
            // The callback arrived after the hold lapsed; the slot is free again.
            metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(1);
            tracing::info!(%intent_id, slot_id = %intent.slot_id, "confirmation after hold expiry");
            return Err(CoreError::SlotUnavailable(intent.slot_id));
        }
        if applied {
            tracing::info!(%intent_id, slot_id = %intent.slot_id, "reservation confirmed");
        }
        if let Some(game_id) = intent.game_id {
            self.mark_game_booked(game_id, intent.id).await?;
        }
        Ok(intent)
    }

    /// `pending → failed`, releasing the slot. Failing twice is a no-op.
    async fn fail_intent(
        &self,
        intent_id: IntentId,
        session_ref: Option<&str>,
        reason: FailureReason,
    ) -> Result<ReservationIntent, CoreError> {
        let (intent, applied) = self
            .transition_reservation(intent_id, |intent, _| {
                check_session(intent, session_ref, "fail")?;
                match &intent.status {
                    IntentStatus::Pending => Ok(Some(released(intent, reason))),
                    IntentStatus::Failed(_) => Ok(None),
                    other => Err(CoreError::InvalidTransition {
                        entity: intent.id,
                        from: other.label(),
                        op: "fail",
                    }),
                }
            })
            .await?;
        if applied {
            tracing::info!(%intent_id, slot_id = %intent.slot_id, status = ?intent.status, "reservation failed");
        }
        Ok(intent)
    }

    /// Cancel an intent and free whatever slot it occupies. `include_booked`
    /// also allows cancelling a confirmed intent, which is then refunded.
    pub(super) async fn cancel_intent(
        &self,
        intent_id: IntentId,
        include_booked: bool,
    ) -> Result<ReservationIntent, CoreError> {
        let mut refund_due = false;
        let (intent, applied) = self
            .transition_reservation(intent_id, |intent, _| {
                let cancelled = Event::ReservationCancelled {
                    intent_id: intent.id,
                    slot_id: intent.slot_id,
                };
                match &intent.status {
                    IntentStatus::Pending | IntentStatus::Failed(_) => Ok(Some(cancelled)),
                    IntentStatus::Confirmed if include_booked => {
                        refund_due = true;
                        Ok(Some(cancelled))
                    }
                    IntentStatus::Cancelled => Ok(None),
                    other => Err(CoreError::InvalidTransition {
                        entity: intent.id,
                        from: other.label(),
                        op: "cancel",
                    }),
                }
            })
            .await?;
        if applied {
            tracing::info!(%intent_id, slot_id = %intent.slot_id, refund_due, "reservation cancelled");
        }
        if refund_due && let Some(session_ref) = intent.session_ref() {
            self.refund(session_ref, intent.amount).await;
        }
        Ok(intent)
    }

    /// Release the hold on `slot_id` if its expiry has passed.
    async fn expire_lapsed_hold(&self, slot_id: &SlotId) -> Result<(), CoreError> {
        let bucket = self.bucket_for_slot(slot_id)?;
        let mut guard = bucket.write().await;
        let now = self.now();
        let lapsed = guard.slot(slot_id).and_then(|s| match &s.status {
            SlotStatus::Held { intent_id, expires_at, .. } if *expires_at <= now => Some(*intent_id),
            _ => None,
        });
        if let Some(intent_id) = lapsed {
            self.expire_under_lock(&mut guard, intent_id, now).await?;
        }
        Ok(())
    }

    /// Caller holds the bucket write lock for the intent's slot.
    pub(super) async fn expire_under_lock(
        &self,
        bucket: &mut SlotBucket,
        intent_id: IntentId,
        now: Ms,
    ) -> Result<bool, CoreError> {
        let shared = self.shared_intent(&intent_id)?;
        let mut intent = shared.lock().await;
        if !intent.hold_expired(now) {
            return Ok(false);
        }
        let event = released(&intent, FailureReason::HoldExpired);
        self.wal_append(&event).await?;
        apply_to_bucket(bucket, &event);
        apply_to_intent(&mut intent, &event);
        metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(1);
        tracing::debug!(%intent_id, slot_id = %intent.slot_id, "hold expired");
        Ok(true)
    }

    /// Best effort: a failed refund is logged and counted, never surfaced.
    async fn refund(&self, session_ref: &str, amount: u64) {
        match self.env.gateway.refund_session(session_ref, amount).await {
            Ok(()) => tracing::info!(session_ref, amount, "refund issued"),
            Err(e) => {
                metrics::counter!(REFUNDS_FAILED_TOTAL).increment(1);
                tracing::warn!(session_ref, amount, error = %e, "refund failed");
            }
        }
    }
}
