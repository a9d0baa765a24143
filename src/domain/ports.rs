use crate::domain::types::{FillEvent, IntentEvent, Tick};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;

/// Push source of market ticks. The real adapter lives outside this repo;
/// mock mode and tests use the channel-backed implementation in
/// `infrastructure::feed`.
#[async_trait]
pub trait MarketDataService: Send + Sync {
    async fn subscribe(&self, symbols: Vec<String>) -> Result<Receiver<Tick>>;
}

/// Broker-side order sink. Translating an intent into a broker order and
/// observing the outcome is the executor's whole job; everything past the
/// session boundary (MT5 etc.) hides behind this trait.
///
/// Implementations must be idempotent per `intent.event_id`: executing the
/// same intent twice returns the original outcome without placing a second
/// order.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn execute(&self, intent: &IntentEvent) -> Result<FillEvent>;

    /// Release the broker session. Called on every executor exit path.
    async fn disconnect(&self) -> Result<()>;
}
