//! The replication loop: one reader owns the stream, feeds the decoder one
//! chunk at a time, and publishes each emitted message before reading the
//! next frame. The source is never read faster than Kafka absorbs messages.

use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::kafka::{JsonSerializer, KafkaProducer, KeyStrategy};
use crate::postgres::connection::{
    self, ReplicationConnection, ReplicationFrame,
};
use crate::postgres::{
    ChangeKind, ChangeRecord, ReplicationMessage, StreamingDecoder, TransactionEnvelope,
};
use crate::{Config, Error, Result};

pub struct Replicator {
    config: Config,
}

impl Replicator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<()> {
        info!("Replicator starting");

        let checkpoints = CheckpointManager::new(&self.config.replication.checkpoint_path);
        let mut checkpoint = checkpoints.load().await?;

        let producer = KafkaProducer::new(&self.config.kafka)?;
        let key_strategy = if self.config.kafka.key_columns.is_empty() {
            KeyStrategy::default()
        } else {
            KeyStrategy::Columns(self.config.kafka.key_columns.clone())
        };

        // Snapshot-vs-stream is decided exactly once, before streaming.
        let snapshot_mode = self.config.replication.snapshot_mode;
        let offset = checkpoint.as_ref().map(Checkpoint::offset_state);
        if snapshot_mode.should_snapshot(offset.as_ref()) {
            checkpoint = Some(
                self.run_snapshot(&checkpoints, checkpoint, &producer, &key_strategy)
                    .await?,
            );
        }
        if !snapshot_mode.should_stream() {
            info!("Configured snapshot mode does not stream; stopping");
            return Ok(());
        }

        self.stream(&checkpoints, checkpoint, &producer, &key_strategy)
            .await
    }

    /// Drops the replication slot and deletes the checkpoint, so the next
    /// run starts over from a fresh snapshot decision.
    pub async fn reset(&self) -> Result<()> {
        let mut conn = ReplicationConnection::connect(&self.config.postgres).await?;
        conn.drop_replication_slot().await?;
        conn.close().await?;

        CheckpointManager::new(&self.config.replication.checkpoint_path)
            .delete()
            .await
    }

    /// Publishes the current contents of the configured tables as
    /// insert-kind messages, with the checkpoint's `snapshot_in_effect`
    /// flag raised for the duration so an interrupted snapshot is resumed
    /// on the next startup.
    async fn run_snapshot(
        &self,
        checkpoints: &CheckpointManager,
        checkpoint: Option<Checkpoint>,
        producer: &KafkaProducer,
        key_strategy: &KeyStrategy,
    ) -> Result<Checkpoint> {
        info!("Starting snapshot phase");

        let mut checkpoint = checkpoint.unwrap_or_else(|| Checkpoint::new("0/0".to_string(), 0));
        checkpoint.snapshot_in_effect = true;
        checkpoints.save(&checkpoint).await?;

        if self.config.postgres.tables.is_empty() {
            warn!("No tables configured; snapshot phase has nothing to export");
        }

        let (client, pg_connection) =
            tokio_postgres::connect(&self.config.postgres_url(), NoTls).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = pg_connection.await {
                error!("Connection error: {}", e);
            }
        });

        for table in &self.config.postgres.tables {
            let exported = self
                .snapshot_table(&client, table, producer, key_strategy)
                .await?;
            info!("Snapshot of {} exported {} rows", table, exported);
            checkpoint.message_count += exported;
        }

        driver.abort();

        checkpoint.snapshot_in_effect = false;
        checkpoint.timestamp = Utc::now();
        checkpoints.save(&checkpoint).await?;
        info!("Snapshot phase complete");

        Ok(checkpoint)
    }

    async fn snapshot_table(
        &self,
        client: &tokio_postgres::Client,
        table: &str,
        producer: &KafkaProducer,
        key_strategy: &KeyStrategy,
    ) -> Result<u64> {
        let (schema, name) = table.split_once('.').unwrap_or(("public", table));

        let metadata_query = format!(
            "SELECT column_name, data_type, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = '{}' AND table_name = '{}' \
             ORDER BY ordinal_position",
            schema, name
        );

        let mut column_names = Vec::new();
        let mut column_types = Vec::new();
        let mut column_optionals = Vec::new();
        for message in client.simple_query(&metadata_query).await? {
            if let SimpleQueryMessage::Row(row) = message {
                column_names.push(row.get(0).unwrap_or_default().to_string());
                column_types.push(row.get(1).unwrap_or_default().to_string());
                column_optionals.push(row.get(2) == Some("YES"));
            }
        }
        if column_names.is_empty() {
            return Err(Error::Replication {
                message: format!("Cannot snapshot unknown table {}.{}", schema, name),
            });
        }

        let rows: Vec<_> = client
            .simple_query(&format!("SELECT * FROM {}.{}", schema, name))
            .await?
            .into_iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .collect();

        let contains_metadata = self.config.replication.include_metadata;
        let envelope = TransactionEnvelope {
            xid: 0,
            commit_time: Utc::now(),
        };

        let total = rows.len();
        for (index, row) in rows.iter().enumerate() {
            let column_values = (0..column_names.len())
                .map(|i| {
                    row.get(i)
                        .map(|v| Value::String(v.to_string()))
                        .unwrap_or(Value::Null)
                })
                .collect();

            let change = ChangeRecord {
                kind: ChangeKind::Insert,
                schema: schema.to_string(),
                table: name.to_string(),
                column_names: column_names.clone(),
                column_types: column_types.clone(),
                column_optionals: if contains_metadata {
                    column_optionals.clone()
                } else {
                    Vec::new()
                },
                column_values,
                oldkeys: None,
            };
            let message = ReplicationMessage {
                envelope: envelope.clone(),
                change,
                contains_metadata,
                last_in_transaction: index + 1 == total,
            };
            self.publish(producer, key_strategy, &message).await?;
        }

        Ok(total as u64)
    }

    async fn stream(
        &self,
        checkpoints: &CheckpointManager,
        checkpoint: Option<Checkpoint>,
        producer: &KafkaProducer,
        key_strategy: &KeyStrategy,
    ) -> Result<()> {
        let mut conn = ReplicationConnection::connect(&self.config.postgres).await?;

        let system = conn.identify_system().await?;
        info!(
            system_id = %system.system_id,
            timeline = system.timeline,
            xlogpos = %system.xlogpos,
            "Connected to replication source"
        );

        conn.create_replication_slot().await?;

        let start_lsn = match &checkpoint {
            Some(c) => connection::parse_lsn(&c.lsn)?,
            // 0/0 lets the slot resume from its confirmed position.
            None => 0,
        };
        conn.start_replication(
            start_lsn,
            self.config.replication.include_metadata,
            &self.config.postgres.tables,
        )
        .await?;

        // Fresh decoder per session: its state is never carried across a
        // reconnect.
        let mut decoder = StreamingDecoder::new(self.config.replication.include_metadata);
        let mut confirmed_lsn = start_lsn;
        let mut message_count = checkpoint.as_ref().map(|c| c.message_count).unwrap_or(0);

        let keepalive = Duration::from_secs(self.config.replication.keepalive_interval_secs);
        let checkpoint_interval =
            Duration::from_secs(self.config.replication.checkpoint_interval_secs);
        let mut last_checkpoint = Instant::now();

        loop {
            match timeout(keepalive, conn.recv_frame()).await {
                Ok(Ok(Some(ReplicationFrame::XLogData { wal_end, payload }))) => {
                    let mut emitted = Vec::with_capacity(1);
                    let mut collect = |message: ReplicationMessage| -> Result<()> {
                        emitted.push(message);
                        Ok(())
                    };
                    decoder.submit(&payload, &mut collect)?;
                    drop(collect);
                    for message in emitted {
                        self.publish(producer, key_strategy, &message).await?;
                        message_count += 1;
                    }
                    confirmed_lsn = confirmed_lsn.max(wal_end);
                }
                Ok(Ok(Some(ReplicationFrame::Keepalive {
                    wal_end,
                    reply_requested,
                }))) => {
                    confirmed_lsn = confirmed_lsn.max(wal_end);
                    if reply_requested {
                        conn.standby_status_update(confirmed_lsn, false).await?;
                    }
                }
                Ok(Ok(None)) => {
                    warn!("Replication stream closed by server");
                    break;
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    conn.standby_status_update(confirmed_lsn, false).await?;
                }
            }

            if last_checkpoint.elapsed() >= checkpoint_interval {
                let cp = Checkpoint::new(connection::format_lsn(confirmed_lsn), message_count);
                checkpoints.save(&cp).await?;
                conn.standby_status_update(confirmed_lsn, false).await?;
                last_checkpoint = Instant::now();
            }
        }

        let cp = Checkpoint::new(connection::format_lsn(confirmed_lsn), message_count);
        checkpoints.save(&cp).await?;
        conn.close().await
    }

    async fn publish(
        &self,
        producer: &KafkaProducer,
        key_strategy: &KeyStrategy,
        message: &ReplicationMessage,
    ) -> Result<()> {
        let topic = self
            .config
            .kafka_topic_name(&message.change.schema, &message.change.table);
        let payload = JsonSerializer::serialize(message)?;
        let key = key_strategy.extract_key(message);
        producer.send(&topic, key.as_deref(), &payload).await
    }
}
