use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::BotError;
use crate::models::InstrumentState;
use crate::persistence::InstrumentMap;
use crate::Result;

/// Thread-safe map of instrument records with one lock per instrument
///
/// The outer map is only written at construction, so lookups never contend.
/// Mutation goes through [`InstrumentRepository::update`], which holds the
/// instrument's own lock for the duration of a synchronous closure.
#[derive(Clone, Default)]
pub struct InstrumentRepository {
    data: Arc<RwLock<HashMap<String, Arc<Mutex<InstrumentState>>>>>,
}

impl InstrumentRepository {
    /// Build records for `universe`, reusing whatever was persisted for those symbols
    pub fn new(universe: &[String], mut loaded: InstrumentMap) -> Self {
        let mut data = HashMap::new();

        for symbol in universe {
            let state = match loaded.remove(symbol) {
                Some(mut restored) => {
                    restored.symbol = symbol.clone();
                    restored
                }
                None => InstrumentState::new(symbol.clone()),
            };
            data.insert(symbol.clone(), Arc::new(Mutex::new(state)));
        }

        if !loaded.is_empty() {
            tracing::info!(
                "Ignoring {} stored instruments outside the universe",
                loaded.len()
            );
        }

        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    fn entry(&self, symbol: &str) -> Result<Arc<Mutex<InstrumentState>>> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(symbol)
            .cloned()
            .ok_or_else(|| BotError::UnknownInstrument(symbol.to_string()))
    }

    /// Copy of one instrument's current state
    pub fn get(&self, symbol: &str) -> Option<InstrumentState> {
        let entry = self.entry(symbol).ok()?;
        let state = entry.lock().unwrap_or_else(|e| e.into_inner());
        Some(state.clone())
    }

    /// Run `mutator` with exclusive access to one instrument
    pub fn update<R>(&self, symbol: &str, mutator: impl FnOnce(&mut InstrumentState) -> R) -> Result<R> {
        let entry = self.entry(symbol)?;
        let mut state = entry.lock().unwrap_or_else(|e| e.into_inner());
        Ok(mutator(&mut state))
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entry(symbol).is_ok()
    }

    pub fn symbols(&self) -> Vec<String> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let mut symbols: Vec<String> = data.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Consistent per-instrument copies, for persistence
    pub fn snapshot(&self) -> InstrumentMap {
        self.symbols()
            .into_iter()
            .filter_map(|symbol| self.get(&symbol).map(|state| (symbol, state)))
            .collect()
    }

    /// Instruments currently holding an upside / downside break
    pub fn breadth(&self) -> (usize, usize) {
        self.snapshot().values().fold((0, 0), |(up, down), state| {
            (
                up + state.extremum.max_break_time.is_some() as usize,
                down + state.extremum.min_break_time.is_some() as usize,
            )
        })
    }

    pub fn open_positions(&self) -> Vec<String> {
        self.snapshot()
            .into_values()
            .filter(|state| state.has_open_position())
            .map(|state| state.symbol)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn universe(symbols: &[&str]) -> Vec<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_repository() {
        let repo = InstrumentRepository::new(&universe(&["BTCUSDT", "ETHUSDT"]), InstrumentMap::new());
        assert_eq!(repo.symbols(), vec!["BTCUSDT", "ETHUSDT"]);
        assert!(repo.get("BTCUSDT").unwrap().avg_volume.is_none());
        assert!(repo.get("DOGEUSDT").is_none());
    }

    #[test]
    fn test_restores_loaded_state_within_universe() {
        let mut loaded = InstrumentMap::new();
        let mut btc = InstrumentState::new("BTCUSDT");
        btc.avg_volume = Some(42.0);
        loaded.insert("BTCUSDT".into(), btc);
        loaded.insert("OLDUSDT".into(), InstrumentState::new("OLDUSDT"));

        let repo = InstrumentRepository::new(&universe(&["BTCUSDT"]), loaded);

        assert_eq!(repo.get("BTCUSDT").unwrap().avg_volume, Some(42.0));
        assert!(!repo.contains("OLDUSDT"));
    }

    #[test]
    fn test_update_unknown_symbol() {
        let repo = InstrumentRepository::new(&universe(&["BTCUSDT"]), InstrumentMap::new());
        let result = repo.update("XRPUSDT", |s| s.avg_volume = Some(1.0));
        assert!(matches!(result, Err(BotError::UnknownInstrument(_))));
    }

    #[test]
    fn test_update_returns_closure_value() {
        let repo = InstrumentRepository::new(&universe(&["BTCUSDT"]), InstrumentMap::new());
        let previous = repo
            .update("BTCUSDT", |s| s.avg_volume.replace(10.0))
            .unwrap();
        assert_eq!(previous, None);
        assert_eq!(repo.get("BTCUSDT").unwrap().avg_volume, Some(10.0));
    }

    #[test]
    fn test_breadth() {
        let repo = InstrumentRepository::new(&universe(&["A", "B", "C"]), InstrumentMap::new());
        let now = Utc::now();
        repo.update("A", |s| s.extremum.max_break_time = Some(now)).unwrap();
        repo.update("B", |s| s.extremum.max_break_time = Some(now)).unwrap();
        repo.update("B", |s| s.extremum.min_break_time = Some(now)).unwrap();

        assert_eq!(repo.breadth(), (2, 1));
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let repo = InstrumentRepository::new(&universe(&["BTCUSDT"]), InstrumentMap::new());
        let repo_clone = repo.clone();

        let handle = thread::spawn(move || {
            for _ in 0..500 {
                repo_clone
                    .update("BTCUSDT", |s| {
                        *s.avg_volume.get_or_insert(0.0) += 1.0;
                    })
                    .unwrap();
            }
        });

        for _ in 0..500 {
            repo.update("BTCUSDT", |s| {
                *s.avg_volume.get_or_insert(0.0) += 1.0;
            })
            .unwrap();
        }

        handle.join().unwrap();

        assert_eq!(repo.get("BTCUSDT").unwrap().avg_volume, Some(1000.0));
    }
}
