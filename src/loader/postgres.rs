//! PostgreSQL target. Rows travel as JSON and are mapped onto the table with
//! `json_populate_record`, so the loader needs no per-table column metadata.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use super::target::{TargetDatabase, TargetTransaction};
use crate::{Error, Result};

pub struct PgTarget {
    client: Arc<Mutex<Client>>,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PgTarget {
    pub async fn connect(config: &tokio_postgres::Config) -> Result<Self> {
        info!("Connecting loader to target PostgreSQL");
        let (client, connection_task) = crate::store::postgres::connect(config).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            connection_task,
        })
    }
}

impl Drop for PgTarget {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

#[async_trait]
impl TargetDatabase for PgTarget {
    async fn begin(&self) -> Result<Box<dyn TargetTransaction>> {
        let client = self.client.clone().lock_owned().await;
        begin_with(&client, REPLICA_ROLE).await?;
        Ok(Box::new(PgTransaction {
            client: Some(client),
        }))
    }
}

/// Capture triggers do not fire for replica sessions; SET LOCAL ends with the transaction.
const REPLICA_ROLE: &str = "SET LOCAL session_replication_role = replica";

/// Opens a transaction and runs `setup` in it. A failed setup is rolled back
/// so the connection is never left inside an aborted transaction.
async fn begin_with(client: &Client, setup: &str) -> Result<()> {
    client.batch_execute("BEGIN").await?;
    if let Err(e) = client.batch_execute(setup).await {
        if let Err(rollback) = client.batch_execute("ROLLBACK").await {
            warn!("Rollback after failed transaction setup failed: {}", rollback);
        }
        return Err(e.into());
    }
    Ok(())
}

struct PgTransaction {
    /// `None` once committed or rolled back.
    client: Option<OwnedMutexGuard<Client>>,
}

fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn column_list(values: &Value) -> Result<String> {
    let object = values
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| Error::statement("row image is not a non-empty JSON object"))?;
    Ok(object
        .keys()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", "))
}

impl PgTransaction {
    fn client(&self) -> Result<&Client> {
        self.client
            .as_deref()
            .ok_or_else(|| Error::statement("transaction already finished"))
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        if let Some(client) = self.client.take() {
            client
                .batch_execute(statement)
                .await
                .map_err(Error::from_statement_failure)?;
        }
        Ok(())
    }
}

#[async_trait]
impl TargetTransaction for PgTransaction {
    async fn insert(&mut self, table: &str, _pk: &Value, row: &Value) -> Result<bool> {
        let table = quote_ident(table);
        let columns = column_list(row)?;
        let sql = format!(
            "INSERT INTO {table} ({columns}) \
             SELECT {columns} FROM json_populate_record(NULL::{table}, $1::json) \
             ON CONFLICT DO NOTHING"
        );
        let rows = self
            .client()?
            .execute(&sql, &[row])
            .await
            .map_err(Error::from_statement_failure)?;
        Ok(rows == 1)
    }

    async fn update(&mut self, table: &str, pk: &Value, row: &Value) -> Result<u64> {
        let table = quote_ident(table);
        let columns = column_list(row)?;
        let keys = column_list(pk)?;
        let sql = format!(
            "UPDATE {table} SET ({columns}) = \
             (SELECT {columns} FROM json_populate_record(NULL::{table}, $1::json)) \
             WHERE ({keys}) = (SELECT {keys} FROM json_populate_record(NULL::{table}, $2::json))"
        );
        self.client()?
            .execute(&sql, &[row, pk])
            .await
            .map_err(Error::from_statement_failure)
    }

    async fn delete(&mut self, table: &str, pk: &Value) -> Result<u64> {
        let table = quote_ident(table);
        let keys = column_list(pk)?;
        let sql = format!(
            "DELETE FROM {table} \
             WHERE ({keys}) = (SELECT {keys} FROM json_populate_record(NULL::{table}, $1::json))"
        );
        self.client()?
            .execute(&sql, &[pk])
            .await
            .map_err(Error::from_statement_failure)
    }

    async fn execute_sql(&mut self, sql: &str) -> Result<()> {
        debug!(sql, "Executing replicated statement");
        self.client()?
            .batch_execute(sql)
            .await
            .map_err(Error::from_statement_failure)
    }

    async fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        let client = match self.client.take() {
            Some(client) => client,
            None => return,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        warn!("Rollback of abandoned transaction failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("Transaction dropped outside a runtime; connection left in transaction"),
        }
    }
}
