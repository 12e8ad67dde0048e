//! PostgreSQL backend for the change log, batch stores and router lock.
//!
//! Tables share a configurable prefix (default `sym`):
//!
//! | Table | Key | Purpose |
//! |-------|-----|---------|
//! | `<p>_data` | data_id | captured changes, written by capture triggers |
//! | `<p>_outgoing_batch` | batch_id | outbound delivery state |
//! | `<p>_data_event` | batch_id, data_id | fixed batch membership |
//! | `<p>_incoming_batch` | batch_id, node_id | inbound dedup and outcome |
//! | `<p>_router_state` | id | router watermark |
//! | `<p>_lock` | lock_name | time-boxed cluster locks |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::{Client, Config as PgConfig, NoTls, Row};
use tracing::{debug, error, info};

use super::{ChangeLog, ClusterLock, IncomingBatchStore, OutgoingBatchStore};
use crate::batch::{
    BatchFailure, BatchStatus, IncomingBatch, InsertOutcome, NewBatch, OutgoingBatch,
};
use crate::checkpoint::Watermark;
use crate::model::{BatchId, ChangeRecord, DataId};
use crate::{Error, Result};

const OUTGOING_COLUMNS: &str = "batch_id, node_id, channel_id, status, data_event_count, \
     byte_count, extract_count, sent_count, ignore_count, router_millis, extract_millis, \
     network_millis, load_millis, failed_data_id, failed_line_number, sql_state, sql_code, \
     sql_message, last_update_hostname, create_time, last_update_time";

const INCOMING_COLUMNS: &str = "batch_id, node_id, channel_id, status, statement_count, \
     fallback_insert_count, fallback_update_count, missing_delete_count, byte_count, \
     load_millis, skip_count, retry, failed_data_id, failed_line_number, sql_state, sql_code, \
     sql_message, last_update_hostname, create_time, last_update_time";

const DATA_COLUMNS: &str = "data_id, channel_id, table_name, event_type, row_data, old_data, \
     pk_data, transaction_id, schema_version, create_time";

pub struct PgStore {
    client: Mutex<Client>,
    connection_task: tokio::task::JoinHandle<()>,
    prefix: String,
}

/// Opens a client and drives its connection on a background task.
pub(crate) async fn connect(
    config: &PgConfig,
) -> Result<(Client, tokio::task::JoinHandle<()>)> {
    let (client, connection) = config.connect(NoTls).await?;
    let connection_task = tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Connection error: {}", e);
        }
    });
    Ok((client, connection_task))
}

impl PgStore {
    pub async fn connect(config: &PgConfig, table_prefix: &str) -> Result<Self> {
        info!("Connecting batch store to PostgreSQL");
        let (client, connection_task) = connect(config).await?;
        Ok(Self {
            client: Mutex::new(client),
            connection_task,
            prefix: table_prefix.to_string(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }

    /// Creates the pipeline tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = format!(
            r#"
CREATE TABLE IF NOT EXISTS {data} (
    data_id BIGSERIAL PRIMARY KEY,
    channel_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    event_type TEXT NOT NULL,
    row_data TEXT,
    old_data TEXT,
    pk_data TEXT,
    transaction_id TEXT,
    schema_version TEXT,
    create_time TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS {outgoing} (
    batch_id BIGSERIAL PRIMARY KEY,
    node_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    status CHAR(2) NOT NULL,
    data_event_count BIGINT NOT NULL DEFAULT 0,
    byte_count BIGINT NOT NULL DEFAULT 0,
    extract_count INT NOT NULL DEFAULT 0,
    sent_count INT NOT NULL DEFAULT 0,
    ignore_count INT NOT NULL DEFAULT 0,
    router_millis BIGINT NOT NULL DEFAULT 0,
    extract_millis BIGINT NOT NULL DEFAULT 0,
    network_millis BIGINT NOT NULL DEFAULT 0,
    load_millis BIGINT NOT NULL DEFAULT 0,
    failed_data_id BIGINT,
    failed_line_number INT,
    sql_state TEXT,
    sql_code INT,
    sql_message TEXT,
    last_update_hostname TEXT NOT NULL,
    create_time TIMESTAMPTZ NOT NULL,
    last_update_time TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS {outgoing}_node_status_idx ON {outgoing} (node_id, status);
CREATE TABLE IF NOT EXISTS {data_event} (
    batch_id BIGINT NOT NULL,
    data_id BIGINT NOT NULL,
    PRIMARY KEY (batch_id, data_id)
);
CREATE TABLE IF NOT EXISTS {incoming} (
    batch_id BIGINT NOT NULL,
    node_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    status CHAR(2) NOT NULL,
    statement_count BIGINT NOT NULL DEFAULT 0,
    fallback_insert_count BIGINT NOT NULL DEFAULT 0,
    fallback_update_count BIGINT NOT NULL DEFAULT 0,
    missing_delete_count BIGINT NOT NULL DEFAULT 0,
    byte_count BIGINT NOT NULL DEFAULT 0,
    load_millis BIGINT NOT NULL DEFAULT 0,
    skip_count INT NOT NULL DEFAULT 0,
    retry BOOLEAN NOT NULL DEFAULT false,
    failed_data_id BIGINT,
    failed_line_number INT,
    sql_state TEXT,
    sql_code INT,
    sql_message TEXT,
    last_update_hostname TEXT NOT NULL,
    create_time TIMESTAMPTZ NOT NULL,
    last_update_time TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (batch_id, node_id)
);
CREATE TABLE IF NOT EXISTS {router_state} (
    id INT PRIMARY KEY,
    last_data_id BIGINT NOT NULL,
    routed_count BIGINT NOT NULL,
    update_time TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS {lock} (
    lock_name TEXT PRIMARY KEY,
    owner TEXT,
    lock_time TIMESTAMPTZ
);
"#,
            data = self.table("data"),
            outgoing = self.table("outgoing_batch"),
            data_event = self.table("data_event"),
            incoming = self.table("incoming_batch"),
            router_state = self.table("router_state"),
            lock = self.table("lock"),
        );
        self.client.lock().await.batch_execute(&ddl).await?;
        info!(prefix = %self.prefix, "Batch store schema ready");
        Ok(())
    }

    /// Writes a captured change the way a capture trigger would.
    pub async fn insert_change(&self, record: &ChangeRecord) -> Result<DataId> {
        let sql = format!(
            "INSERT INTO {} (channel_id, table_name, event_type, row_data, old_data, pk_data, \
             transaction_id, schema_version, create_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING data_id",
            self.table("data")
        );
        let client = self.client.lock().await;
        let row = client
            .query_one(
                &sql,
                &[
                    &record.channel_id,
                    &record.table_name,
                    &record.event_type.as_str(),
                    &record.row_data,
                    &record.old_data,
                    &record.pk_data,
                    &record.transaction_id,
                    &record.schema_version,
                    &record.created_at,
                ],
            )
            .await?;
        Ok(row.try_get("data_id")?)
    }

    async fn insert_outgoing(
        &self,
        tx: &tokio_postgres::Transaction<'_>,
        batch: NewBatch,
        hostname: &str,
    ) -> Result<OutgoingBatch> {
        let sql = format!(
            "INSERT INTO {} (node_id, channel_id, status, data_event_count, byte_count, \
             router_millis, last_update_hostname, create_time, last_update_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) RETURNING batch_id",
            self.table("outgoing_batch")
        );
        let now = Utc::now();
        let row = tx
            .query_one(
                &sql,
                &[
                    &batch.node_id,
                    &batch.channel_id,
                    &batch.status.code(),
                    &(batch.data_ids.len() as i64),
                    &(batch.byte_count as i64),
                    &(batch.router_millis as i64),
                    &hostname,
                    &now,
                ],
            )
            .await?;
        let batch_id: i64 = row.try_get("batch_id")?;

        let members = format!(
            "INSERT INTO {} (batch_id, data_id) SELECT $1, unnest($2::bigint[])",
            self.table("data_event")
        );
        tx.execute(&members, &[&batch_id, &batch.data_ids]).await?;

        debug!(batch_id, node_id = %batch.node_id, channel_id = %batch.channel_id, "Created outgoing batch");
        Ok(batch.into_outgoing(batch_id, hostname))
    }
}

fn outgoing_from_row(row: &Row) -> Result<OutgoingBatch> {
    let status: String = row.try_get("status")?;
    Ok(OutgoingBatch {
        batch_id: row.try_get("batch_id")?,
        node_id: row.try_get("node_id")?,
        channel_id: row.try_get("channel_id")?,
        status: status.parse()?,
        data_event_count: row.try_get::<_, i64>("data_event_count")? as u64,
        byte_count: row.try_get::<_, i64>("byte_count")? as u64,
        extract_count: row.try_get::<_, i32>("extract_count")? as u32,
        sent_count: row.try_get::<_, i32>("sent_count")? as u32,
        ignore_count: row.try_get::<_, i32>("ignore_count")? as u32,
        router_millis: row.try_get::<_, i64>("router_millis")? as u64,
        extract_millis: row.try_get::<_, i64>("extract_millis")? as u64,
        network_millis: row.try_get::<_, i64>("network_millis")? as u64,
        load_millis: row.try_get::<_, i64>("load_millis")? as u64,
        failure: failure_from_row(row)?,
        last_update_hostname: row.try_get("last_update_hostname")?,
        created_at: row.try_get::<_, DateTime<Utc>>("create_time")?,
        updated_at: row.try_get::<_, DateTime<Utc>>("last_update_time")?,
    })
}

fn incoming_from_row(row: &Row) -> Result<IncomingBatch> {
    let status: String = row.try_get("status")?;
    Ok(IncomingBatch {
        batch_id: row.try_get("batch_id")?,
        node_id: row.try_get("node_id")?,
        channel_id: row.try_get("channel_id")?,
        status: status.parse()?,
        statement_count: row.try_get::<_, i64>("statement_count")? as u64,
        fallback_insert_count: row.try_get::<_, i64>("fallback_insert_count")? as u64,
        fallback_update_count: row.try_get::<_, i64>("fallback_update_count")? as u64,
        missing_delete_count: row.try_get::<_, i64>("missing_delete_count")? as u64,
        byte_count: row.try_get::<_, i64>("byte_count")? as u64,
        load_millis: row.try_get::<_, i64>("load_millis")? as u64,
        skip_count: row.try_get::<_, i32>("skip_count")? as u32,
        retry: row.try_get("retry")?,
        failure: failure_from_row(row)?,
        last_update_hostname: row.try_get("last_update_hostname")?,
        created_at: row.try_get::<_, DateTime<Utc>>("create_time")?,
        updated_at: row.try_get::<_, DateTime<Utc>>("last_update_time")?,
    })
}

fn failure_from_row(row: &Row) -> Result<BatchFailure> {
    Ok(BatchFailure {
        failed_data_id: row.try_get("failed_data_id")?,
        failed_line_number: row
            .try_get::<_, Option<i32>>("failed_line_number")?
            .map(|n| n as u32),
        sql_state: row.try_get("sql_state")?,
        sql_code: row.try_get("sql_code")?,
        sql_message: row.try_get("sql_message")?,
    })
}

fn change_from_row(row: &Row) -> Result<ChangeRecord> {
    let event_type: String = row.try_get("event_type")?;
    Ok(ChangeRecord {
        data_id: row.try_get("data_id")?,
        channel_id: row.try_get("channel_id")?,
        table_name: row.try_get("table_name")?,
        event_type: event_type.parse()?,
        row_data: row.try_get("row_data")?,
        old_data: row.try_get("old_data")?,
        pk_data: row.try_get("pk_data")?,
        transaction_id: row.try_get("transaction_id")?,
        schema_version: row.try_get("schema_version")?,
        created_at: row.try_get("create_time")?,
    })
}

impl Drop for PgStore {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

#[async_trait]
impl ChangeLog for PgStore {
    async fn read_after(&self, after: DataId, limit: usize) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE data_id > $1 ORDER BY data_id LIMIT $2",
            DATA_COLUMNS,
            self.table("data")
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[&after, &(limit as i64)]).await?;
        rows.iter().map(change_from_row).collect()
    }

    async fn read_ids(&self, data_ids: &[DataId]) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE data_id = ANY($1) ORDER BY data_id",
            DATA_COLUMNS,
            self.table("data")
        );
        let ids = data_ids.to_vec();
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[&ids]).await?;
        rows.iter().map(change_from_row).collect()
    }
}

#[async_trait]
impl OutgoingBatchStore for PgStore {
    async fn create(&self, batch: NewBatch, hostname: &str) -> Result<OutgoingBatch> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let created = self.insert_outgoing(&tx, batch, hostname).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn commit_routed(
        &self,
        batches: Vec<NewBatch>,
        watermark: Watermark,
        hostname: &str,
    ) -> Result<Vec<OutgoingBatch>> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let mut created = Vec::with_capacity(batches.len());
        for batch in batches {
            created.push(self.insert_outgoing(&tx, batch, hostname).await?);
        }
        let sql = format!(
            "INSERT INTO {t} AS s (id, last_data_id, routed_count, update_time) \
             VALUES (1, $1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET last_data_id = EXCLUDED.last_data_id, \
             routed_count = EXCLUDED.routed_count, update_time = EXCLUDED.update_time \
             WHERE s.last_data_id < EXCLUDED.last_data_id",
            t = self.table("router_state")
        );
        tx.execute(
            &sql,
            &[
                &watermark.last_data_id,
                &(watermark.routed_count as i64),
                &watermark.timestamp,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn watermark(&self) -> Result<Watermark> {
        let sql = format!(
            "SELECT last_data_id, routed_count, update_time FROM {} WHERE id = 1",
            self.table("router_state")
        );
        let client = self.client.lock().await;
        match client.query_opt(&sql, &[]).await? {
            Some(row) => Ok(Watermark {
                last_data_id: row.try_get("last_data_id")?,
                routed_count: row.try_get::<_, i64>("routed_count")? as u64,
                timestamp: row.try_get("update_time")?,
            }),
            None => Ok(Watermark::origin()),
        }
    }

    async fn update(&self, batch: &OutgoingBatch) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = $2, data_event_count = $3, byte_count = $4, \
             extract_count = $5, sent_count = $6, router_millis = $7, extract_millis = $8, \
             network_millis = $9, load_millis = $10, failed_data_id = $11, \
             failed_line_number = $12, sql_state = $13, sql_code = $14, sql_message = $15, \
             last_update_hostname = $16, last_update_time = $17, ignore_count = $18 \
             WHERE batch_id = $1",
            self.table("outgoing_batch")
        );
        let client = self.client.lock().await;
        client
            .execute(
                &sql,
                &[
                    &batch.batch_id,
                    &batch.status.code(),
                    &(batch.data_event_count as i64),
                    &(batch.byte_count as i64),
                    &(batch.extract_count as i32),
                    &(batch.sent_count as i32),
                    &(batch.router_millis as i64),
                    &(batch.extract_millis as i64),
                    &(batch.network_millis as i64),
                    &(batch.load_millis as i64),
                    &batch.failure.failed_data_id,
                    &batch.failure.failed_line_number.map(|n| n as i32),
                    &batch.failure.sql_state,
                    &batch.failure.sql_code,
                    &batch.failure.sql_message,
                    &batch.last_update_hostname,
                    &batch.updated_at,
                    &(batch.ignore_count as i32),
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        hostname: &str,
    ) -> Result<bool> {
        let select = format!(
            "SELECT {} FROM {} WHERE batch_id = $1 FOR UPDATE",
            OUTGOING_COLUMNS,
            self.table("outgoing_batch")
        );
        let update = format!(
            "UPDATE {} SET status = $2, last_update_hostname = $3, last_update_time = $4 \
             WHERE batch_id = $1",
            self.table("outgoing_batch")
        );
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let mut batch = match tx.query_opt(&select, &[&batch_id]).await? {
            Some(row) => outgoing_from_row(&row)?,
            None => return Ok(false),
        };
        if batch.transition(status, hostname)? {
            tx.execute(
                &update,
                &[&batch_id, &status.code(), &hostname, &batch.updated_at],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn find(&self, batch_id: BatchId) -> Result<Option<OutgoingBatch>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE batch_id = $1",
            OUTGOING_COLUMNS,
            self.table("outgoing_batch")
        );
        let client = self.client.lock().await;
        client
            .query_opt(&sql, &[&batch_id])
            .await?
            .map(|row| outgoing_from_row(&row))
            .transpose()
    }

    async fn find_errors(&self, limit: usize) -> Result<Vec<OutgoingBatch>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE status = 'ER' ORDER BY batch_id DESC LIMIT $1",
            OUTGOING_COLUMNS,
            self.table("outgoing_batch")
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[&(limit as i64)]).await?;
        rows.iter().map(outgoing_from_row).collect()
    }

    async fn find_range(&self, start: BatchId, end: BatchId) -> Result<Vec<OutgoingBatch>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE batch_id BETWEEN $1 AND $2 ORDER BY batch_id",
            OUTGOING_COLUMNS,
            self.table("outgoing_batch")
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[&start, &end]).await?;
        rows.iter().map(outgoing_from_row).collect()
    }

    async fn find_pending(&self, node_id: &str) -> Result<Vec<OutgoingBatch>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE node_id = $1 AND (status IN ('NE', 'SE', 'ER') \
             OR (status = 'IG' AND ignore_count = 0)) ORDER BY batch_id",
            OUTGOING_COLUMNS,
            self.table("outgoing_batch")
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[&node_id]).await?;
        rows.iter().map(outgoing_from_row).collect()
    }

    async fn batch_data_ids(&self, batch_id: BatchId) -> Result<Vec<DataId>> {
        let sql = format!(
            "SELECT data_id FROM {} WHERE batch_id = $1 ORDER BY data_id",
            self.table("data_event")
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[&batch_id]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, i64>("data_id").map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl IncomingBatchStore for PgStore {
    async fn try_insert(&self, batch: &IncomingBatch) -> Result<InsertOutcome> {
        let insert = format!(
            "INSERT INTO {} (batch_id, node_id, channel_id, status, retry, last_update_hostname, \
             create_time, last_update_time) VALUES ($1, $2, $3, $4, $5, $6, $7, $7) \
             ON CONFLICT (batch_id, node_id) DO NOTHING",
            self.table("incoming_batch")
        );
        let inserted = {
            let client = self.client.lock().await;
            client
                .execute(
                    &insert,
                    &[
                        &batch.batch_id,
                        &batch.node_id,
                        &batch.channel_id,
                        &batch.status.code(),
                        &batch.retry,
                        &batch.last_update_hostname,
                        &batch.created_at,
                    ],
                )
                .await?
        };
        if inserted == 1 {
            return Ok(InsertOutcome::Inserted);
        }
        match IncomingBatchStore::find(self, batch.batch_id, &batch.node_id).await? {
            Some(existing) => Ok(InsertOutcome::AlreadyExists(existing)),
            None => Err(Error::InvalidMessage {
                message: format!(
                    "incoming batch {}-{} vanished during insert",
                    batch.node_id, batch.batch_id
                ),
            }),
        }
    }

    async fn update(&self, batch: &IncomingBatch) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = $3, statement_count = $4, fallback_insert_count = $5, \
             fallback_update_count = $6, missing_delete_count = $7, byte_count = $8, \
             load_millis = $9, skip_count = $10, retry = $11, failed_data_id = $12, \
             failed_line_number = $13, sql_state = $14, sql_code = $15, sql_message = $16, \
             last_update_hostname = $17, last_update_time = $18 \
             WHERE batch_id = $1 AND node_id = $2",
            self.table("incoming_batch")
        );
        let client = self.client.lock().await;
        client
            .execute(
                &sql,
                &[
                    &batch.batch_id,
                    &batch.node_id,
                    &batch.status.code(),
                    &(batch.statement_count as i64),
                    &(batch.fallback_insert_count as i64),
                    &(batch.fallback_update_count as i64),
                    &(batch.missing_delete_count as i64),
                    &(batch.byte_count as i64),
                    &(batch.load_millis as i64),
                    &(batch.skip_count as i32),
                    &batch.retry,
                    &batch.failure.failed_data_id,
                    &batch.failure.failed_line_number.map(|n| n as i32),
                    &batch.failure.sql_state,
                    &batch.failure.sql_code,
                    &batch.failure.sql_message,
                    &batch.last_update_hostname,
                    &batch.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn find(&self, batch_id: BatchId, node_id: &str) -> Result<Option<IncomingBatch>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE batch_id = $1 AND node_id = $2",
            INCOMING_COLUMNS,
            self.table("incoming_batch")
        );
        let client = self.client.lock().await;
        client
            .query_opt(&sql, &[&batch_id, &node_id])
            .await?
            .map(|row| incoming_from_row(&row))
            .transpose()
    }

    async fn find_errors(&self, limit: usize) -> Result<Vec<IncomingBatch>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE status = 'ER' ORDER BY last_update_time DESC LIMIT $1",
            INCOMING_COLUMNS,
            self.table("incoming_batch")
        );
        let client = self.client.lock().await;
        let rows = client.query(&sql, &[&(limit as i64)]).await?;
        rows.iter().map(incoming_from_row).collect()
    }

    async fn unresolved_predecessor(
        &self,
        node_id: &str,
        channel_id: &str,
        batch_id: BatchId,
    ) -> Result<Option<BatchId>> {
        let sql = format!(
            "SELECT MIN(batch_id) AS batch_id FROM {} WHERE node_id = $1 AND channel_id = $2 \
             AND batch_id < $3 AND status NOT IN ('OK', 'SK')",
            self.table("incoming_batch")
        );
        let client = self.client.lock().await;
        let row = client
            .query_one(&sql, &[&node_id, &channel_id, &batch_id])
            .await?;
        Ok(row.try_get("batch_id")?)
    }
}

#[async_trait]
impl ClusterLock for PgStore {
    async fn try_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let sql = format!(
            "INSERT INTO {t} AS l (lock_name, owner, lock_time) VALUES ($1, $2, now()) \
             ON CONFLICT (lock_name) DO UPDATE SET owner = EXCLUDED.owner, lock_time = now() \
             WHERE l.owner IS NULL OR l.owner = EXCLUDED.owner \
             OR l.lock_time < now() - make_interval(secs => $3)",
            t = self.table("lock")
        );
        let client = self.client.lock().await;
        let rows = client
            .execute(&sql, &[&name, &owner, &ttl.as_secs_f64()])
            .await?;
        Ok(rows == 1)
    }

    async fn unlock(&self, name: &str, owner: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET owner = NULL, lock_time = NULL WHERE lock_name = $1 AND owner = $2",
            self.table("lock")
        );
        let client = self.client.lock().await;
        client.execute(&sql, &[&name, &owner]).await?;
        Ok(())
    }
}
