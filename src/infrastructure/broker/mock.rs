use crate::domain::ports::BrokerGateway;
use crate::domain::types::{FillEvent, FillStatus, IntentEvent};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// In-process broker that fills every order at the intent's reference price.
///
/// Executions are remembered by intent id, so a re-delivered intent returns
/// the original fill instead of placing a second order. Tests flip
/// `reject_all` / `fail_transient` to exercise the rejection and retry
/// paths.
#[derive(Clone, Default)]
pub struct MockBroker {
    executed: Arc<Mutex<HashMap<Uuid, FillEvent>>>,
    reject_all: Arc<AtomicBool>,
    fail_transient: Arc<AtomicBool>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent order comes back REJECTED.
    pub fn set_reject_all(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::SeqCst);
    }

    /// Every subsequent execute errors, as a dead broker session would.
    pub fn set_fail_transient(&self, fail: bool) {
        self.fail_transient.store(fail, Ordering::SeqCst);
    }

    pub async fn executed_count(&self) -> usize {
        self.executed.lock().await.len()
    }
}

#[async_trait]
impl BrokerGateway for MockBroker {
    async fn execute(&self, intent: &IntentEvent) -> Result<FillEvent> {
        if self.fail_transient.load(Ordering::SeqCst) {
            anyhow::bail!("broker session unavailable");
        }

        let mut executed = self.executed.lock().await;
        if let Some(previous) = executed.get(&intent.event_id) {
            info!(intent_id = %intent.event_id, "duplicate execute, returning original fill");
            return Ok(previous.clone());
        }

        let status = if self.reject_all.load(Ordering::SeqCst) {
            FillStatus::Rejected
        } else {
            FillStatus::Filled
        };

        // Entry fills mint the lot id; single-target exits echo theirs.
        let lot_id = if status == FillStatus::Rejected {
            None
        } else if intent.action.is_entry() {
            Some(Uuid::new_v4())
        } else {
            let targets = intent.action.target_lots();
            (targets.len() == 1).then(|| targets[0])
        };

        let fill = FillEvent {
            event_id: Uuid::new_v4(),
            intent_id: intent.event_id,
            symbol: intent.symbol.clone(),
            action: intent.action.clone(),
            direction: intent.direction,
            lot_id,
            fill_price: intent.reference_price,
            filled_size: intent.size,
            ts_ms: chrono::Utc::now().timestamp_millis(),
            status,
            ma_thr_at_entry: intent.ma_thr_at_entry,
        };
        executed.insert(intent.event_id, fill.clone());
        Ok(fill)
    }

    async fn disconnect(&self) -> Result<()> {
        info!("mock broker session released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Direction, IntentAction};
    use rust_decimal_macros::dec;

    fn intent() -> IntentEvent {
        IntentEvent {
            event_id: Uuid::new_v4(),
            symbol: "USDJPY".to_string(),
            action: IntentAction::Init,
            direction: Direction::Long,
            reference_price: dec!(98.9),
            ts_ms: 0,
            size: dec!(1),
            ma_thr_at_entry: dec!(0.01),
            dedupe_key: "k".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fill_at_reference_price() {
        let broker = MockBroker::new();
        let fill = broker.execute(&intent()).await.unwrap();
        assert_eq!(fill.status, FillStatus::Filled);
        assert_eq!(fill.fill_price, dec!(98.9));
        assert!(fill.lot_id.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_execute_returns_original_fill() {
        let broker = MockBroker::new();
        let i = intent();
        let first = broker.execute(&i).await.unwrap();
        let second = broker.execute(&i).await.unwrap();
        assert_eq!(first.event_id, second.event_id);
        assert_eq!(first.lot_id, second.lot_id);
        assert_eq!(broker.executed_count().await, 1);
    }

    #[tokio::test]
    async fn test_reject_all() {
        let broker = MockBroker::new();
        broker.set_reject_all(true);
        let fill = broker.execute(&intent()).await.unwrap();
        assert_eq!(fill.status, FillStatus::Rejected);
        assert!(fill.lot_id.is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_is_an_error() {
        let broker = MockBroker::new();
        broker.set_fail_transient(true);
        assert!(broker.execute(&intent()).await.is_err());

        broker.set_fail_transient(false);
        assert!(broker.execute(&intent()).await.is_ok());
    }
}
