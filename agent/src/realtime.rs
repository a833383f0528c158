//! Realtime change feed.
//!
//! [`RealtimeClient`] keeps a websocket to the backend's change feed open,
//! reconnecting with capped exponential backoff, and forwards decoded
//! changes over a channel. [`apply_changes`] hands them to the engine and
//! flushes each debounced burst when it falls due.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shopsync_engine::{ChangeEventType, EntityType, Fields, RemoteChange};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::from_wire;
use crate::monitor::sleep_until_ms;
use crate::{now_ms, AppState};

/// Buffered changes between the socket and the engine.
pub const CHANNEL_CAPACITY: usize = 1024;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("change for unknown table '{0}'")]
    UnknownTable(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::WebSocket(Box::new(e))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Change {
        table: String,
        #[serde(rename = "eventType")]
        event_type: ChangeEventType,
        row: Fields,
    },
    #[serde(other)]
    Other,
}

/// Decode one text frame. Frames other than changes yield `None`.
pub fn decode_frame(text: &str) -> Result<Option<RemoteChange>, RealtimeError> {
    match serde_json::from_str(text)? {
        Frame::Change {
            table,
            event_type,
            row,
        } => {
            let entity_type =
                EntityType::from_table(&table).ok_or(RealtimeError::UnknownTable(table))?;
            Ok(Some(RemoteChange::new(entity_type, event_type, from_wire(row))))
        }
        Frame::Other => Ok(None),
    }
}

/// The subscription request sent after connecting.
pub fn subscribe_message() -> String {
    let tables: Vec<&str> = EntityType::ALL.iter().map(|t| t.table()).collect();
    serde_json::json!({ "type": "subscribe", "tables": tables }).to_string()
}

fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(MAX_BACKOFF)
}

#[derive(Debug, Clone)]
pub struct RealtimeClient {
    url: String,
}

impl RealtimeClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Stay connected until cancelled or the receiving side goes away.
    pub async fn run(self, tx: mpsc::Sender<RemoteChange>, cancel: CancellationToken) {
        let mut delay = INITIAL_BACKOFF;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.session(&tx, &mut delay) => result,
            };
            match result {
                Ok(()) => info!(url = %self.url, "realtime feed closed"),
                Err(e) => warn!(url = %self.url, error = %e, "realtime feed failed"),
            }
            if tx.is_closed() {
                break;
            }

            debug!(delay_ms = delay.as_millis() as u64, "reconnecting realtime feed");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_backoff(delay);
        }
        debug!("realtime client stopped");
    }

    async fn session(
        &self,
        tx: &mpsc::Sender<RemoteChange>,
        delay: &mut Duration,
    ) -> Result<(), RealtimeError> {
        let (ws, _) = connect_async(self.url.as_str()).await?;
        info!(url = %self.url, "realtime feed connected");
        *delay = INITIAL_BACKOFF;

        let (mut write, mut read) = ws.split();
        write.send(Message::Text(subscribe_message())).await?;

        while let Some(message) = read.next().await {
            match message? {
                Message::Text(text) => match decode_frame(&text) {
                    Ok(Some(change)) => {
                        if tx.send(change).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "skipping realtime frame"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Feed received changes to the engine and flush due bursts until
/// cancelled or the channel closes.
pub async fn apply_changes(
    state: AppState,
    mut rx: mpsc::Receiver<RemoteChange>,
    cancel: CancellationToken,
) {
    loop {
        let due = state.engine.lock().await.next_flush_at();
        tokio::select! {
            _ = cancel.cancelled() => break,
            change = rx.recv() => match change {
                Some(change) => receive(&state, change).await,
                None => break,
            },
            _ = sleep_until_ms(due) => {
                flush(&state).await;
            }
        }
    }
    debug!("realtime apply loop stopped");
}

/// Hand one change to the engine.
pub async fn receive(state: &AppState, change: RemoteChange) {
    let entity_type = change.entity_type;
    let mut engine = state.engine.lock().await;
    if let Err(e) = engine.receive_remote(change, now_ms()) {
        warn!(%entity_type, error = %e, "dropping remote change");
    }
}

/// Apply the debounced burst if it is due. Returns the entities changed.
pub async fn flush(state: &AppState) -> usize {
    let mut engine = state.engine.lock().await;
    let changed = engine.flush_remote(now_ms());
    state.publish(&mut engine);
    if changed > 0 {
        debug!(changed, "remote changes applied");
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_frames_decode() {
        let text = r#"{
            "type": "change",
            "table": "customers",
            "eventType": "UPDATE",
            "row": {"id": "c-1", "outstanding_debt": 450, "updated_at": "2023-11-14T22:13:20Z"}
        }"#;
        let change = decode_frame(text).unwrap().unwrap();

        assert_eq!(change.entity_type, EntityType::Customer);
        assert_eq!(change.event_type, ChangeEventType::Update);
        assert_eq!(change.row["updated_at"], json!(1_700_000_000_000i64));
    }

    #[test]
    fn other_frames_are_ignored() {
        assert!(decode_frame(r#"{"type": "subscribed", "tables": ["sales"]}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn bad_frames_are_errors() {
        assert!(matches!(
            decode_frame(r#"{"type": "change", "table": "invoices", "eventType": "insert", "row": {}}"#),
            Err(RealtimeError::UnknownTable(t)) if t == "invoices"
        ));
        assert!(matches!(decode_frame("not json"), Err(RealtimeError::Frame(_))));
    }

    #[test]
    fn subscription_lists_every_table() {
        let message: serde_json::Value = serde_json::from_str(&subscribe_message()).unwrap();
        assert_eq!(message["type"], "subscribe");
        assert_eq!(message["tables"].as_array().unwrap().len(), EntityType::ALL.len());
        assert_eq!(message["tables"][4], "debt_payments");
    }

    #[test]
    fn backoff_is_capped() {
        let mut delay = INITIAL_BACKOFF;
        for _ in 0..10 {
            delay = next_backoff(delay);
        }
        assert_eq!(delay, MAX_BACKOFF);
        assert_eq!(next_backoff(INITIAL_BACKOFF), Duration::from_secs(1));
    }
}
