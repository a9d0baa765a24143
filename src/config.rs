use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Mock,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Mode::Mock),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'mock'", s),
        }
    }
}

/// Strategy parameters, immutable for a run. All rules in the evaluator read
/// from here; per-lot SL/TP widths use the threshold frozen on the lot.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub ma_period: usize,
    pub candle_period_secs: i64,
    pub momentum_window: usize,
    pub momentum_threshold: Decimal,
    pub ma_thr_eff: Decimal,
    pub max_lots: usize,
    pub init_window_secs: i64,
    pub scale_in_cooldown_secs: i64,
    pub scaleout_cooldown_secs: i64,
    pub near_touch_window_secs: i64,
    pub near_touch_eps: Decimal,
    pub risk_control_threshold: Decimal,
    pub intent_pending_timeout_secs: i64,
    pub order_size: Decimal,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            ma_period: 100,
            candle_period_secs: 60,
            momentum_window: 3,
            momentum_threshold: Decimal::new(3, 3), // 0.003
            ma_thr_eff: Decimal::new(1, 2),         // 0.01
            max_lots: 4,
            init_window_secs: 900,
            scale_in_cooldown_secs: 1800,
            scaleout_cooldown_secs: 900,
            near_touch_window_secs: 300,
            near_touch_eps: Decimal::new(1, 3), // 0.001
            risk_control_threshold: Decimal::new(3, 3),
            intent_pending_timeout_secs: 60,
            order_size: Decimal::ONE,
        }
    }
}

impl StrategyConfig {
    pub fn candle_period_ms(&self) -> i64 {
        self.candle_period_secs * 1000
    }

    pub fn init_window_ms(&self) -> i64 {
        self.init_window_secs * 1000
    }

    pub fn scale_in_cooldown_ms(&self) -> i64 {
        self.scale_in_cooldown_secs * 1000
    }

    pub fn scaleout_cooldown_ms(&self) -> i64 {
        self.scaleout_cooldown_secs * 1000
    }

    pub fn near_touch_window_ms(&self) -> i64 {
        self.near_touch_window_secs * 1000
    }

    pub fn intent_pending_timeout_ms(&self) -> i64 {
        self.intent_pending_timeout_secs * 1000
    }

    fn validate(&self) -> Result<()> {
        if self.ma_period == 0 {
            anyhow::bail!("MA_PERIOD must be positive");
        }
        if self.candle_period_secs <= 0 {
            anyhow::bail!("CANDLE_PERIOD must be positive");
        }
        if self.momentum_window == 0 || self.momentum_window >= self.ma_period {
            anyhow::bail!(
                "MOMENTUM_WINDOW must be in 1..MA_PERIOD, got {}",
                self.momentum_window
            );
        }
        if self.momentum_threshold <= Decimal::ZERO {
            anyhow::bail!("MOMENTUM_THRESHOLD must be positive");
        }
        if self.ma_thr_eff <= Decimal::ZERO {
            anyhow::bail!("MA_THR_EFF must be positive");
        }
        if self.max_lots == 0 {
            anyhow::bail!("MAX_LOTS must be positive");
        }
        if self.order_size <= Decimal::ZERO {
            anyhow::bail!("ORDER_SIZE must be positive");
        }
        if self.intent_pending_timeout_secs <= 0 {
            anyhow::bail!("INTENT_PENDING_TIMEOUT must be positive");
        }
        Ok(())
    }
}

/// Process configuration: role-independent runtime knobs plus the strategy
/// parameters. Loaded once at startup; invalid values abort the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub database_url: String,
    pub symbols: Vec<String>,
    pub consumer_group: String,
    pub consumer_name: String,
    pub read_batch_size: usize,
    pub read_block_ms: u64,
    pub claim_interval_secs: u64,
    pub claim_idle_threshold_secs: u64,
    pub snapshot_interval_secs: u64,
    pub strategy: StrategyConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mode_str = env::var("MODE").unwrap_or_else(|_| "mock".to_string());
        let mode = Mode::from_str(&mode_str)?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://meanrev.db".to_string());

        let symbols_str = env::var("SYMBOLS").unwrap_or_else(|_| "USDJPY".to_string());
        let symbols: Vec<String> = symbols_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            anyhow::bail!("SYMBOLS must name at least one symbol");
        }

        let consumer_group =
            env::var("CONSUMER_GROUP").unwrap_or_else(|_| "executors".to_string());
        let consumer_name = env::var("CONSUMER_NAME").unwrap_or_else(|_| "executor-1".to_string());

        let read_batch_size = parse_env("READ_BATCH_SIZE", "16")?;
        let read_block_ms = parse_env("READ_BLOCK_MS", "2000")?;
        let claim_interval_secs: u64 = parse_env("CLAIM_INTERVAL", "30")?;
        let claim_idle_threshold_secs =
            parse_env("CLAIM_IDLE_THRESHOLD", &(claim_interval_secs * 2).to_string())?;
        let snapshot_interval_secs = parse_env("SNAPSHOT_INTERVAL", "60")?;

        let strategy = StrategyConfig {
            ma_period: parse_env("MA_PERIOD", "100")?,
            candle_period_secs: parse_env("CANDLE_PERIOD", "60")?,
            momentum_window: parse_env("MOMENTUM_WINDOW", "3")?,
            momentum_threshold: parse_env("MOMENTUM_THRESHOLD", "0.003")?,
            ma_thr_eff: parse_env("MA_THR_EFF", "0.01")?,
            max_lots: parse_env("MAX_LOTS", "4")?,
            init_window_secs: parse_env("INIT_WINDOW", "900")?,
            scale_in_cooldown_secs: parse_env("SCALE_IN_COOLDOWN", "1800")?,
            scaleout_cooldown_secs: parse_env("SCALEOUT_COOLDOWN", "900")?,
            near_touch_window_secs: parse_env("NEAR_TOUCH_WINDOW_SEC", "300")?,
            near_touch_eps: parse_env("NEAR_TOUCH_EPS", "0.001")?,
            risk_control_threshold: parse_env("RISK_CONTROL_THRESHOLD", "0.003")?,
            intent_pending_timeout_secs: parse_env("INTENT_PENDING_TIMEOUT", "60")?,
            order_size: parse_env("ORDER_SIZE", "1")?,
        };
        strategy.validate()?;

        Ok(Self {
            mode,
            database_url,
            symbols,
            consumer_group,
            consumer_name,
            read_batch_size,
            read_block_ms,
            claim_interval_secs,
            claim_idle_threshold_secs,
            snapshot_interval_secs,
            strategy,
        })
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .with_context(|| format!("Failed to parse {}", key))
}
