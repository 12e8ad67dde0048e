//! Database the loader applies incoming changes to.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::EventType;
use crate::{Error, Result};

#[async_trait]
pub trait TargetDatabase: Send + Sync {
    /// Opens a transaction with change capture suppressed until it ends.
    async fn begin(&self) -> Result<Box<dyn TargetTransaction>>;
}

/// One open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait TargetTransaction: Send {
    /// Inserts `row`. Returns `false` when a row with the same key exists.
    async fn insert(&mut self, table: &str, pk: &Value, row: &Value) -> Result<bool>;

    /// Replaces the row identified by `pk`. Returns the number of rows changed.
    async fn update(&mut self, table: &str, pk: &Value, row: &Value) -> Result<u64>;

    async fn delete(&mut self, table: &str, pk: &Value) -> Result<u64>;

    async fn execute_sql(&mut self, sql: &str) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

type Tables = HashMap<String, BTreeMap<String, Value>>;

#[derive(Default)]
struct MemoryState {
    tables: Tables,
    /// Writes observed by the simulated capture triggers.
    captured: Vec<(String, EventType)>,
    executed_sql: Vec<String>,
}

/// Clears the capture-suppression flag when the transaction ends, on every path.
struct CaptureSuppression {
    flag: Arc<AtomicBool>,
}

impl CaptureSuppression {
    fn acquire(flag: Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { flag }
    }
}

impl Drop for CaptureSuppression {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// In-memory target with trigger-style capture and injectable constraint
/// failures. Transactions are serialized.
#[derive(Clone, Default)]
pub struct MemoryTarget {
    state: Arc<Mutex<MemoryState>>,
    suppressed: Arc<AtomicBool>,
    rejected: Arc<std::sync::RwLock<Vec<(String, Value)>>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails any insert or update whose row has `column == value`.
    pub fn reject_value(&self, column: &str, value: Value) {
        if let Ok(mut rejected) = self.rejected.write() {
            rejected.push((column.to_string(), value));
        }
    }

    pub fn clear_rejections(&self) {
        if let Ok(mut rejected) = self.rejected.write() {
            rejected.clear();
        }
    }

    pub async fn row(&self, table: &str, pk: &Value) -> Option<Value> {
        let state = self.state.lock().await;
        state.tables.get(table)?.get(&pk.to_string()).cloned()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Writes made outside the loader, as a capture trigger would record them.
    pub async fn write_captured(&self, table: &str, pk: &Value, row: Value) {
        let mut state = self.state.lock().await;
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(pk.to_string(), row);
        if !self.suppressed.load(Ordering::SeqCst) {
            state.captured.push((table.to_string(), EventType::Insert));
        }
    }

    pub async fn captured(&self) -> Vec<(String, EventType)> {
        self.state.lock().await.captured.clone()
    }

    pub async fn executed_sql(&self) -> Vec<String> {
        self.state.lock().await.executed_sql.clone()
    }

    pub fn capture_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetDatabase for MemoryTarget {
    async fn begin(&self) -> Result<Box<dyn TargetTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.tables.clone();
        Ok(Box::new(MemoryTransaction {
            _capture: CaptureSuppression::acquire(self.suppressed.clone()),
            state: guard,
            snapshot: Some(snapshot),
            rejected: self.rejected.clone(),
            suppressed: self.suppressed.clone(),
        }))
    }
}

struct MemoryTransaction {
    // Declared first so suppression ends before the state lock is released.
    _capture: CaptureSuppression,
    state: OwnedMutexGuard<MemoryState>,
    /// Table contents at BEGIN; `None` once the transaction has ended.
    snapshot: Option<Tables>,
    rejected: Arc<std::sync::RwLock<Vec<(String, Value)>>>,
    suppressed: Arc<AtomicBool>,
}

impl MemoryTransaction {
    fn check(&self, row: &Value) -> Result<()> {
        let rejected = match self.rejected.read() {
            Ok(rejected) => rejected,
            Err(_) => return Ok(()),
        };
        for (column, value) in rejected.iter() {
            if row.get(column) == Some(value) {
                return Err(Error::Statement {
                    sql_state: Some("23514".to_string()),
                    sql_code: None,
                    message: format!("check constraint violated on column {}", column),
                });
            }
        }
        Ok(())
    }

    fn capture(&mut self, table: &str, event: EventType) {
        if !self.suppressed.load(Ordering::SeqCst) {
            self.state.captured.push((table.to_string(), event));
        }
    }

    fn table(&mut self, table: &str) -> &mut BTreeMap<String, Value> {
        self.state.tables.entry(table.to_string()).or_default()
    }
}

#[async_trait]
impl TargetTransaction for MemoryTransaction {
    async fn insert(&mut self, table: &str, pk: &Value, row: &Value) -> Result<bool> {
        self.check(row)?;
        let key = pk.to_string();
        if self.table(table).contains_key(&key) {
            return Ok(false);
        }
        self.table(table).insert(key, row.clone());
        self.capture(table, EventType::Insert);
        Ok(true)
    }

    async fn update(&mut self, table: &str, pk: &Value, row: &Value) -> Result<u64> {
        self.check(row)?;
        match self.table(table).get_mut(&pk.to_string()) {
            Some(existing) => *existing = row.clone(),
            None => return Ok(0),
        }
        self.capture(table, EventType::Update);
        Ok(1)
    }

    async fn delete(&mut self, table: &str, pk: &Value) -> Result<u64> {
        if self.table(table).remove(&pk.to_string()).is_none() {
            return Ok(0);
        }
        self.capture(table, EventType::Delete);
        Ok(1)
    }

    async fn execute_sql(&mut self, sql: &str) -> Result<()> {
        self.state.executed_sql.push(sql.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(snapshot) = self.snapshot.take() {
            self.state.tables = snapshot;
        }
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.state.tables = snapshot;
        }
    }
}
