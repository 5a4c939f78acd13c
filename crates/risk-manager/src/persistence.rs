//! Durable risk state.
//!
//! The engine writes one JSON snapshot per trading day. Writes go to a
//! temporary file that is renamed over the live one, so a crash mid-write
//! leaves the previous snapshot intact.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use market_core::config::PersistenceConfig;
use market_core::types::{Position, TradeRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::state::RiskState;

/// Snapshot layout version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Everything needed to resume a trading day after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub schema_version: u32,
    /// Trading date the snapshot belongs to.
    pub date: NaiveDate,
    pub saved_at: DateTime<Utc>,
    pub risk_state: RiskState,
    #[serde(default)]
    pub open_positions: Vec<Position>,
    #[serde(default)]
    pub closed_trades: Vec<TradeRecord>,
}

impl StateSnapshot {
    pub fn capture(state: &RiskState, closed_trades: &[TradeRecord], now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            date: state.trading_date,
            saved_at: now,
            risk_state: state.clone(),
            open_positions: state.open_positions.values().cloned().collect(),
            closed_trades: closed_trades.to_vec(),
        }
    }
}

/// Storage backend for [`StateSnapshot`]s and the emergency log.
#[async_trait]
pub trait StatePersistence: Send + Sync {
    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// Latest snapshot, or `None` if nothing has been saved yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Keep a copy of the current snapshot for `date` before a new day
    /// overwrites it.
    async fn archive(&self, date: NaiveDate) -> Result<()>;

    /// Append a line to the emergency log.
    async fn record_emergency(&self, event: &str, details: &str) -> Result<()>;
}

/// Rebuild the in-memory state from `snapshot` for `today`.
///
/// A snapshot from today is restored exactly. An older one yields a fresh
/// day: weekly counters survive within the same ISO week, and the kill
/// switch, breaker, and symbol blocks carry over. Positions from an earlier
/// day are dropped.
pub fn reconcile_on_load(snapshot: &StateSnapshot, today: NaiveDate) -> RiskState {
    let mut state = snapshot.risk_state.clone();
    state.open_positions = snapshot
        .open_positions
        .iter()
        .map(|position| (position.symbol.clone(), position.clone()))
        .collect();

    if snapshot.date == today {
        state.trading_date = today;
        return state;
    }

    if !snapshot.open_positions.is_empty() {
        warn!(
            snapshot_date = %snapshot.date,
            count = snapshot.open_positions.len(),
            "Dropping positions from a previous trading day"
        );
    }
    state.reset_daily(today);
    if snapshot.date.iso_week() != today.iso_week() {
        state.reset_weekly();
    }
    state
}

/// JSON file store with atomic replace.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    emergency_log: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let emergency_log = path
            .parent()
            .map(|dir| dir.join("emergency_log.txt"))
            .unwrap_or_else(|| PathBuf::from("emergency_log.txt"));
        Self {
            path,
            emergency_log,
        }
    }

    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self::new(config.state_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn emergency_log_path(&self) -> &Path {
        &self.emergency_log
    }

    fn archive_path(&self, date: NaiveDate) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("risk_state");
        self.path.with_file_name(format!("{}_{}.json", stem, date))
    }

    async fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StatePersistence for JsonFileStore {
    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.ensure_parent(&self.path).await?;
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp)
            .await
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        debug!(path = %self.path.display(), bytes = body.len(), "Risk state saved");
        Ok(())
    }

    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let body = match fs::read(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        let snapshot: StateSnapshot = serde_json::from_slice(&body)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        if snapshot.schema_version > SCHEMA_VERSION {
            bail!(
                "{} has schema version {}, this build reads up to {}",
                self.path.display(),
                snapshot.schema_version,
                SCHEMA_VERSION
            );
        }
        Ok(Some(snapshot))
    }

    async fn archive(&self, date: NaiveDate) -> Result<()> {
        if fs::metadata(&self.path).await.is_err() {
            return Ok(());
        }
        let target = self.archive_path(date);
        fs::copy(&self.path, &target)
            .await
            .with_context(|| format!("archiving to {}", target.display()))?;
        info!(path = %target.display(), "Archived previous day's risk state");
        Ok(())
    }

    async fn record_emergency(&self, event: &str, details: &str) -> Result<()> {
        self.ensure_parent(&self.emergency_log).await?;
        let line = format!("{} | {} | {}\n", Utc::now().to_rfc3339(), event, details);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.emergency_log)
            .await
            .with_context(|| format!("opening {}", self.emergency_log.display()))?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// In-memory store for tests and paper sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<StateSnapshot>>,
    archived: Mutex<Vec<NaiveDate>>,
    emergencies: Mutex<Vec<String>>,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            ..Default::default()
        }
    }

    /// Make every subsequent save fail.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> Option<StateSnapshot> {
        self.snapshot.lock().await.clone()
    }

    pub async fn archived(&self) -> Vec<NaiveDate> {
        self.archived.lock().await.clone()
    }

    pub async fn emergencies(&self) -> Vec<String> {
        self.emergencies.lock().await.clone()
    }
}

#[async_trait]
impl StatePersistence for MemoryStore {
    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            bail!("simulated write failure");
        }
        *self.snapshot.lock().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<StateSnapshot>> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn archive(&self, date: NaiveDate) -> Result<()> {
        self.archived.lock().await.push(date);
        Ok(())
    }

    async fn record_emergency(&self, event: &str, details: &str) -> Result<()> {
        self.emergencies
            .lock()
            .await
            .push(format!("{} | {}", event, details));
        Ok(())
    }
}
