use crate::domain::types::IntentEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An intent published but not yet resolved by a fill, reject or timeout.
///
/// While one is outstanding the evaluator is silent for the symbol, so a
/// decision in flight can never be emitted twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingIntent {
    pub intent: IntentEvent,
    pub expires_ts_ms: i64,
}

/// Per-symbol timers gating re-emission of scale actions, plus the single
/// pending-intent slot. Owned by the symbol's lane; timestamps are epoch ms.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CooldownRegistry {
    scale_in_until_ms: Option<i64>,
    scale_out_until_ms: Option<i64>,
    pending: Option<PendingIntent>,
}

impl CooldownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scale_in_active(&self, now_ms: i64) -> bool {
        self.scale_in_until_ms.is_some_and(|until| now_ms < until)
    }

    pub fn scale_out_active(&self, now_ms: i64) -> bool {
        self.scale_out_until_ms.is_some_and(|until| now_ms < until)
    }

    /// Arm the scale-in cooldown from a fill timestamp.
    pub fn arm_scale_in(&mut self, fill_ts_ms: i64, cooldown_ms: i64) {
        self.scale_in_until_ms = Some(fill_ts_ms + cooldown_ms);
    }

    /// Arm the scale-out cooldown from a fill timestamp.
    pub fn arm_scale_out(&mut self, fill_ts_ms: i64, cooldown_ms: i64) {
        self.scale_out_until_ms = Some(fill_ts_ms + cooldown_ms);
    }

    pub fn install_pending(&mut self, intent: IntentEvent, now_ms: i64, timeout_ms: i64) {
        self.pending = Some(PendingIntent {
            intent,
            expires_ts_ms: now_ms + timeout_ms,
        });
    }

    /// The outstanding intent, if it has not expired at `now_ms`.
    pub fn pending(&self, now_ms: i64) -> Option<&PendingIntent> {
        self.pending
            .as_ref()
            .filter(|p| now_ms < p.expires_ts_ms)
    }

    /// Remove and return the pending intent if its timeout has elapsed.
    /// The evaluator is free to re-propose afterwards.
    pub fn take_expired(&mut self, now_ms: i64) -> Option<PendingIntent> {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| now_ms >= p.expires_ts_ms)
        {
            return self.pending.take();
        }
        None
    }

    /// Clear the pending slot when a fill or reject for `intent_id` arrives.
    /// Returns false when the slot is empty or holds a different intent
    /// (a late fill after timeout, for example).
    pub fn resolve_pending(&mut self, intent_id: Uuid) -> bool {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.intent.event_id == intent_id)
        {
            self.pending = None;
            return true;
        }
        false
    }
}
