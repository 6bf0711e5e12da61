//! Postgres notification bridge.
//!
//! One shared pool plus a single `PgListener` task carry all LISTEN traffic.
//! Channels are added at load time through a command channel; incoming
//! notifications are forwarded to the runtime for fan-out. When the listener
//! connection drops, the loop reconnects every 30 seconds and re-establishes
//! every previously active channel.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{Value, json};
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::PostgresConfig;
use crate::error::{QuiverError, Result};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum BridgeCommand {
    Listen(String),
}

/// A notification as received from Postgres: channel name and raw payload.
pub type Notification = (String, String);

#[derive(Debug)]
pub struct NotificationBridge {
    pool: PgPool,
    channels: RwLock<HashSet<String>>,
    cmd_tx: mpsc::UnboundedSender<BridgeCommand>,
}

impl NotificationBridge {
    /// Connect the shared pool. The returned receiver feeds
    /// [`NotificationBridge::listen_loop`].
    pub async fn connect(
        cfg: &PostgresConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<BridgeCommand>)> {
        let options = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.database);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Ok((
            Arc::new(Self {
                pool,
                channels: RwLock::new(HashSet::new()),
                cmd_tx,
            }),
            cmd_rx,
        ))
    }

    pub fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    /// Sorted list of channels currently LISTENed on.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<_> = self
            .channels
            .read()
            .expect("channel set lock poisoned")
            .iter()
            .cloned()
            .collect();
        channels.sort();
        channels
    }

    /// Start LISTENing on a channel if it is not already active.
    pub fn ensure_channel(&self, channel: &str) -> Result<()> {
        if !valid_identifier(channel) {
            return Err(QuiverError::InvalidIdentifier(channel.to_string()));
        }
        let newly_added = self
            .channels
            .write()
            .expect("channel set lock poisoned")
            .insert(channel.to_string());
        if newly_added {
            info!("Adding LISTEN channel '{}'", channel);
            let _ = self.cmd_tx.send(BridgeCommand::Listen(channel.to_string()));
        }
        Ok(())
    }

    /// Install the generic notify function and row trigger on a table.
    /// Best-effort: a missing table is logged and retried on a later reload.
    pub async fn ensure_table_trigger(&self, table: &str, channel: &str) -> Result<()> {
        if !valid_identifier(table) {
            return Err(QuiverError::InvalidIdentifier(table.to_string()));
        }
        if !valid_identifier(channel) {
            return Err(QuiverError::InvalidIdentifier(channel.to_string()));
        }

        for statement in [
            notify_function_ddl(table, channel),
            drop_trigger_ddl(table),
            create_trigger_ddl(table),
        ] {
            if let Err(e) = sqlx::query(&statement).execute(&self.pool).await {
                warn!(
                    "Could not install notify trigger on '{}' (will retry on reload): {}",
                    table, e
                );
                return Ok(());
            }
        }
        info!("Notify trigger installed on '{}' -> '{}'", table, channel);
        Ok(())
    }

    /// Issue a NOTIFY on the shared connection (`/db-notify`).
    pub async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        if !valid_identifier(channel) {
            return Err(QuiverError::InvalidIdentifier(channel.to_string()));
        }
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Long-running LISTEN task. Forwards notifications to `notify_tx` and
    /// reconnects (re-LISTENing every active channel) after connection loss.
    pub async fn listen_loop(
        self: Arc<Self>,
        mut cmd_rx: mpsc::UnboundedReceiver<BridgeCommand>,
        notify_tx: mpsc::UnboundedSender<Notification>,
    ) {
        loop {
            let mut listener = match PgListener::connect_with(&self.pool).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to connect database listener: {}", e);
                    tokio::time::sleep(RECONNECT_INTERVAL).await;
                    continue;
                }
            };

            let channels = self.channels();
            let mut resubscribed = true;
            for channel in &channels {
                if let Err(e) = listener.listen(channel).await {
                    error!("Failed to LISTEN on '{}': {}", channel, e);
                    resubscribed = false;
                    break;
                }
            }
            if !resubscribed {
                tokio::time::sleep(RECONNECT_INTERVAL).await;
                continue;
            }
            if !channels.is_empty() {
                info!("Listening on {} channel(s)", channels.len());
            }

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(BridgeCommand::Listen(channel)) => {
                            if let Err(e) = listener.listen(&channel).await {
                                error!("Failed to LISTEN on '{}': {}", channel, e);
                            }
                        }
                        None => return,
                    },
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            let _ = notify_tx.send((
                                notification.channel().to_string(),
                                notification.payload().to_string(),
                            ));
                        }
                        Err(e) => {
                            error!("Database listener connection lost: {}", e);
                            tokio::time::sleep(RECONNECT_INTERVAL).await;
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Parse a notification payload, falling back to `{"raw": <text>}` for
/// anything that is not valid JSON.
pub fn parse_notification_payload(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "raw": text }))
}

/// Whether a payload's operation passes a trigger's operation filter.
/// An unspecified filter admits everything.
pub fn operation_allowed(operations: Option<&Vec<String>>, payload: &Value) -> bool {
    let Some(operations) = operations else {
        return true;
    };
    let Some(operation) = payload.get("operation").and_then(Value::as_str) else {
        return false;
    };
    operations
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(operation))
}

/// Plain SQL identifier check applied before interpolating names into DDL.
pub fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn notify_function_ddl(table: &str, channel: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION notify_{table}_changes() RETURNS trigger AS $$
DECLARE
    payload json;
BEGIN
    IF (TG_OP = 'DELETE') THEN
        payload = json_build_object('operation', TG_OP, 'table', TG_TABLE_NAME, 'old_data', row_to_json(OLD));
    ELSIF (TG_OP = 'UPDATE') THEN
        payload = json_build_object('operation', TG_OP, 'table', TG_TABLE_NAME, 'data', row_to_json(NEW), 'old_data', row_to_json(OLD));
    ELSE
        payload = json_build_object('operation', TG_OP, 'table', TG_TABLE_NAME, 'data', row_to_json(NEW));
    END IF;
    PERFORM pg_notify('{channel}', payload::text);
    RETURN COALESCE(NEW, OLD);
END;
$$ LANGUAGE plpgsql"#
    )
}

fn drop_trigger_ddl(table: &str) -> String {
    format!("DROP TRIGGER IF EXISTS {table}_notify_trigger ON {table}")
}

fn create_trigger_ddl(table: &str) -> String {
    format!(
        "CREATE TRIGGER {table}_notify_trigger AFTER INSERT OR UPDATE OR DELETE ON {table} \
         FOR EACH ROW EXECUTE FUNCTION notify_{table}_changes()"
    )
}
