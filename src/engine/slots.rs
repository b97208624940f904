use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{CoreError, Engine, apply_to_bucket};

fn validate_prices(prices: &BTreeMap<Activity, u64>) -> Result<(), CoreError> {
    if prices.len() > MAX_ACTIVITIES_PER_SLOT {
        return Err(CoreError::LimitExceeded("too many activities per slot"));
    }
    if prices
        .keys()
        .any(|a| a.is_empty() || a.len() > MAX_ACTIVITY_LEN)
    {
        return Err(CoreError::InvalidInput("activity name must be 1-64 bytes"));
    }
    Ok(())
}

/// Hourly slots covering the whole day of `key`, all available.
fn day_slots(key: BucketKey, prices: &BTreeMap<Activity, u64>) -> Vec<SlotInstance> {
    let day_start = key.day.start_ms();
    (0..SLOTS_PER_DAY)
        .map(|i| {
            let start = day_start + i as Ms * SLOT_DURATION_MS;
            SlotInstance::new(key, Span::new(start, start + SLOT_DURATION_MS), prices.clone())
        })
        .collect()
}

fn may_administer(actor: &Actor, owner: ActorId) -> bool {
    actor.is_admin() || actor.id == owner
}

impl Engine {
    /// Create the slot bucket for one court and day. Fails if it already exists.
    pub async fn generate(
        &self,
        actor: Actor,
        key: BucketKey,
        prices: BTreeMap<Activity, u64>,
    ) -> Result<Vec<SlotInstance>, CoreError> {
        if actor.role == Role::Player {
            return Err(CoreError::Unauthorized(actor.id));
        }
        validate_prices(&prices)?;
        let _admin = self.admin_lock.lock().await;
        self.generate_locked(actor.id, key, &prices).await
    }

    /// Delete and recreate a bucket with new prices. Refused while any slot
    /// is held, booked or claimed by an active game.
    pub async fn regenerate(
        &self,
        actor: Actor,
        key: BucketKey,
        prices: BTreeMap<Activity, u64>,
    ) -> Result<Vec<SlotInstance>, CoreError> {
        validate_prices(&prices)?;
        let _admin = self.admin_lock.lock().await;
        let owner = self.delete_bucket_locked(actor, key).await?;
        self.generate_locked(owner, key, &prices).await
    }

    pub async fn delete_bucket(&self, actor: Actor, key: BucketKey) -> Result<(), CoreError> {
        let _admin = self.admin_lock.lock().await;
        self.delete_bucket_locked(actor, key).await.map(|_| ())
    }

    async fn generate_locked(
        &self,
        owner: ActorId,
        key: BucketKey,
        prices: &BTreeMap<Activity, u64>,
    ) -> Result<Vec<SlotInstance>, CoreError> {
        if self.buckets.contains_key(&key) {
            return Err(CoreError::AlreadyExists(format!("bucket {key}")));
        }
        if self.buckets.len() >= MAX_BUCKETS {
            return Err(CoreError::LimitExceeded("too many buckets"));
        }
        let _gate = self.creation_gate.read().await;

        let slots = day_slots(key, prices);
        let event = Event::BucketGenerated {
            key,
            owner,
            slots: slots.clone(),
        };
        self.wal_append(&event).await?;
        for slot in &slots {
            self.slot_index.insert(slot.id, key);
        }
        self.buckets.insert(
            key,
            Arc::new(RwLock::new(SlotBucket {
                key,
                owner,
                slots: slots.clone(),
            })),
        );
        tracing::info!(bucket = %key, slots = slots.len(), "generated slots");
        Ok(slots)
    }

    /// Returns the owner of the deleted bucket.
    async fn delete_bucket_locked(&self, actor: Actor, key: BucketKey) -> Result<ActorId, CoreError> {
        let bucket = self
            .buckets
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or(CoreError::NoSuchBucket(key))?;
        let _gate = self.creation_gate.read().await;
        let guard = bucket.write().await;
        if !may_administer(&actor, guard.owner) {
            return Err(CoreError::Unauthorized(actor.id));
        }
        if guard.has_occupied() {
            return Err(CoreError::Conflict("bucket has held or booked slots"));
        }
        if guard.slots.iter().any(|s| self.slot_games.contains_key(&s.id)) {
            return Err(CoreError::Conflict("an active game is scheduled in this bucket"));
        }

        let event = Event::BucketDeleted { key };
        self.wal_append(&event).await?;
        for slot in &guard.slots {
            self.slot_index.remove(&slot.id);
        }
        self.buckets.remove(&key);
        tracing::info!(bucket = %key, "deleted slots");
        Ok(guard.owner)
    }

    /// Owner-only: take an available slot out of circulation.
    pub async fn block_slot(&self, actor: Actor, slot_id: SlotId) -> Result<(), CoreError> {
        self.set_blocked(actor, slot_id, true).await
    }

    pub async fn unblock_slot(&self, actor: Actor, slot_id: SlotId) -> Result<(), CoreError> {
        self.set_blocked(actor, slot_id, false).await
    }

    async fn set_blocked(&self, actor: Actor, slot_id: SlotId, block: bool) -> Result<(), CoreError> {
        let bucket = self.bucket_for_slot(&slot_id)?;
        let mut guard = bucket.write().await;
        if !may_administer(&actor, guard.owner) {
            return Err(CoreError::Unauthorized(actor.id));
        }
        let slot = guard.slot(&slot_id).ok_or(CoreError::NotFound(slot_id))?;
        let (expected, op, event) = if block {
            (SlotState::Available, "block", Event::SlotBlocked { slot_id })
        } else {
            (SlotState::Blocked, "unblock", Event::SlotUnblocked { slot_id })
        };
        if slot.state() != expected {
            return Err(CoreError::InvalidTransition {
                entity: slot_id,
                from: slot.state().label(),
                op,
            });
        }
        self.wal_append(&event).await?;
        apply_to_bucket(&mut guard, &event);
        tracing::info!(%slot_id, op, "slot administration");
        Ok(())
    }

    /// Claim an available slot: `available → held` plus a pending intent
    /// without a payment session. Exactly one of any number of concurrent
    /// callers wins; the rest get `SlotUnavailable`.
    pub async fn reserve(
        &self,
        slot_id: SlotId,
        actor: ActorId,
        activity: &str,
    ) -> Result<ReservationHandle, CoreError> {
        let intent = self.hold_slot(slot_id, actor, activity, None).await?;
        Ok(ReservationHandle {
            slot_id,
            intent_id: intent.id,
            expires_at: intent.hold_expires_at,
        })
    }

    /// `held → booked` for whichever intent holds the slot.
    pub async fn confirm_slot(&self, slot_id: SlotId) -> Result<ReservationIntent, CoreError> {
        let intent_id = self.holding_intent(&slot_id, "confirm").await?;
        self.confirm_intent(intent_id).await
    }

    /// `held → available`, cancelling the holding intent.
    pub async fn release_slot(&self, slot_id: SlotId) -> Result<ReservationIntent, CoreError> {
        let intent_id = self.holding_intent(&slot_id, "release").await?;
        self.cancel_intent(intent_id, false).await
    }

    async fn holding_intent(&self, slot_id: &SlotId, op: &'static str) -> Result<IntentId, CoreError> {
        let bucket = self.bucket_for_slot(slot_id)?;
        let guard = bucket.read().await;
        let slot = guard.slot(slot_id).ok_or(CoreError::NotFound(*slot_id))?;
        match &slot.status {
            SlotStatus::Held { intent_id, .. } => Ok(*intent_id),
            other => Err(CoreError::InvalidTransition {
                entity: *slot_id,
                from: other.state().label(),
                op,
            }),
        }
    }

    /// The conditional `available → held` write. Check, log and apply all
    /// happen under the bucket's write lock. A hold whose expiry has passed
    /// is released first, so a lagging sweeper never blocks a new taker.
    pub(super) async fn hold_slot(
        &self,
        slot_id: SlotId,
        actor: ActorId,
        activity: &str,
        game_id: Option<GameId>,
    ) -> Result<ReservationIntent, CoreError> {
        let bucket = self.bucket_for_slot(&slot_id)?;
        let mut guard = bucket.write().await;
        let now = self.now();

        let slot = guard.slot(&slot_id).ok_or(CoreError::NotFound(slot_id))?;
        let lapsed = match &slot.status {
            SlotStatus::Held { intent_id, expires_at, .. } if *expires_at <= now => Some(*intent_id),
            _ => None,
        };
        if let Some(intent_id) = lapsed {
            self.expire_under_lock(&mut guard, intent_id, now).await?;
        }

        let slot = guard.slot(&slot_id).ok_or(CoreError::NotFound(slot_id))?;
        if slot.state() != SlotState::Available {
            metrics::counter!(crate::observability::SLOT_RACES_LOST_TOTAL).increment(1);
            return Err(CoreError::SlotUnavailable(slot_id));
        }
        // A slot claimed by an active game is only bookable through that game.
        let claimed_by = self.slot_games.get(&slot_id).map(|e| *e.value());
        if claimed_by.is_some() && claimed_by != game_id {
            metrics::counter!(crate::observability::SLOT_RACES_LOST_TOTAL).increment(1);
            return Err(CoreError::SlotUnavailable(slot_id));
        }
        if slot.span.start <= now {
            return Err(CoreError::PreconditionFailed("slot has already started"));
        }
        let amount = slot.price_for(activity).ok_or_else(|| CoreError::PriceNotSet {
            slot_id,
            activity: activity.to_string(),
        })?;

        let intent = ReservationIntent {
            id: Ulid::new(),
            slot_id,
            actor,
            activity: activity.to_string(),
            amount,
            currency: self.env.currency.clone(),
            session: None,
            status: IntentStatus::Pending,
            created_at: now,
            hold_expires_at: now + self.hold_ttl_ms(),
            game_id,
            attempts: 1,
        };
        let event = Event::ReservationStarted {
            intent: intent.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_bucket(&mut guard, &event);
        self.intents
            .insert(intent.id, Arc::new(Mutex::new(intent.clone())));
        tracing::debug!(%slot_id, intent_id = %intent.id, %actor, "slot held");
        Ok(intent)
    }

    // ── Queries ──────────────────────────────────────────────

    pub async fn get_slot(&self, slot_id: &SlotId) -> Result<SlotInstance, CoreError> {
        let bucket = self.bucket_for_slot(slot_id)?;
        let guard = bucket.read().await;
        guard
            .slot(slot_id)
            .cloned()
            .ok_or(CoreError::NotFound(*slot_id))
    }

    pub async fn list_bucket(&self, key: &BucketKey) -> Result<Vec<SlotInstance>, CoreError> {
        let bucket = self
            .buckets
            .get(key)
            .map(|e| e.value().clone())
            .ok_or(CoreError::NoSuchBucket(*key))?;
        let guard = bucket.read().await;
        Ok(guard.slots.clone())
    }

    /// Slots that can still be reserved for `activity`: available, priced and
    /// not yet started.
    pub async fn available_slots(
        &self,
        key: &BucketKey,
        activity: &str,
    ) -> Result<Vec<SlotInstance>, CoreError> {
        let now = self.now();
        Ok(self
            .list_bucket(key)
            .await?
            .into_iter()
            .filter(|s| {
                s.state() == SlotState::Available
                    && s.span.start > now
                    && s.price_for(activity).is_some()
            })
            .collect())
    }
}
