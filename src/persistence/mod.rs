use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::BotError;
use crate::models::InstrumentState;
use crate::Result;

pub type InstrumentMap = BTreeMap<String, InstrumentState>;

/// Durable home for instrument records and the cumulative PnL counter
///
/// No transaction spans `save` and `save_pnl`; a crash between them can lose
/// the latest change.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<InstrumentMap>;
    async fn save(&self, state: &InstrumentMap) -> Result<()>;
    async fn load_pnl(&self) -> Result<f64>;
    async fn save_pnl(&self, cumulative_pnl_pct: f64) -> Result<()>;
    /// Reject every later write
    fn close(&self);
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredPnl {
    count: f64,
}

/// JSON files in a directory: `instruments.json` and `stats.json`
pub struct JsonStateStore {
    dir: PathBuf,
    closed: AtomicBool,
    /// Serializes writers so two saves never interleave on the temp file
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonStateStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| persistence(format!("cannot create {}: {}", dir.display(), e)))?;

        tracing::info!("State store at {}", dir.display());

        Ok(Self {
            dir,
            closed: AtomicBool::new(false),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn instruments_path(&self) -> PathBuf {
        self.dir.join("instruments.json")
    }

    fn stats_path(&self) -> PathBuf {
        self.dir.join("stats.json")
    }

    async fn read_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| persistence(format!("corrupt {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(persistence(format!("cannot read {}: {}", path.display(), e))),
        }
    }

    /// Write to a temp file then rename over the target
    async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(persistence("store is closed".to_string()));
        }
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| persistence(format!("serialize failed: {}", e)))?;

        let _guard = self.write_lock.lock().await;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| persistence(format!("cannot write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| persistence(format!("cannot replace {}: {}", path.display(), e)))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<InstrumentMap> {
        let state: InstrumentMap = Self::read_json(&self.instruments_path()).await?;
        tracing::info!("Loaded {} instrument records", state.len());
        Ok(state)
    }

    async fn save(&self, state: &InstrumentMap) -> Result<()> {
        self.write_json(&self.instruments_path(), state).await?;
        tracing::debug!("Saved {} instrument records", state.len());
        Ok(())
    }

    async fn load_pnl(&self) -> Result<f64> {
        let stored: StoredPnl = Self::read_json(&self.stats_path()).await?;
        Ok(stored.count)
    }

    async fn save_pnl(&self, cumulative_pnl_pct: f64) -> Result<()> {
        self.write_json(
            &self.stats_path(),
            &StoredPnl {
                count: cumulative_pnl_pct,
            },
        )
        .await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!("✅ State store closed for writes");
    }
}

/// Volatile store, nothing survives a restart
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<InstrumentMap>,
    pnl: Mutex<f64>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(persistence("store is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<InstrumentMap> {
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, state: &InstrumentMap) -> Result<()> {
        self.check_open()?;
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state.clone();
        Ok(())
    }

    async fn load_pnl(&self) -> Result<f64> {
        Ok(*self.pnl.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn save_pnl(&self, cumulative_pnl_pct: f64) -> Result<()> {
        self.check_open()?;
        *self.pnl.lock().unwrap_or_else(|e| e.into_inner()) = cumulative_pnl_pct;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn persistence(msg: String) -> BotError {
    BotError::Persistence(msg)
}
