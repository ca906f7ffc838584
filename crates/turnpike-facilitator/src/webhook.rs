//! Webhook registry and delivery.
//!
//! Registrations are sqlite-backed; delivery is fire-and-forget with a 10 s
//! per-request timeout. Failures are logged and counted but never affect
//! settlement outcomes. When a registration carries a secret, the body is
//! signed with `X-Webhook-Signature: sha256=<hex HMAC-SHA256>`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use turnpike::settlement::SettlementEvent;

use crate::metrics;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Events a webhook may subscribe to.
pub const KNOWN_EVENTS: &[&str] = &["settlement.success", "settlement.failed"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRecord {
    pub id: i64,
    pub url: String,
    /// Never serialized back to clients.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub events: Vec<String>,
    pub active: bool,
    pub created_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookStoreError {
    #[error("webhook store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("webhook store lock poisoned")]
    LockPoisoned,
}

/// SQLite-backed webhook registry.
#[derive(Clone)]
pub struct WebhookStore {
    conn: Arc<Mutex<Connection>>,
}

impl WebhookStore {
    pub fn open(path: &str) -> Result<Self, WebhookStoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, WebhookStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, WebhookStoreError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS webhooks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                secret TEXT,
                events TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, WebhookStoreError> {
        self.conn.lock().map_err(|_| WebhookStoreError::LockPoisoned)
    }

    pub fn register(
        &self,
        url: &str,
        events: &[String],
        secret: Option<&str>,
    ) -> Result<WebhookRecord, WebhookStoreError> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().timestamp();
        let events_json = serde_json::to_string(events).unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            "INSERT INTO webhooks (url, secret, events, active, created_at) VALUES (?1, ?2, ?3, 1, ?4)",
            params![url, secret, events_json, now],
        )?;
        Ok(WebhookRecord {
            id: conn.last_insert_rowid(),
            url: url.to_string(),
            secret: secret.map(String::from),
            events: events.to_vec(),
            active: true,
            created_at: now,
        })
    }

    pub fn list(&self) -> Result<Vec<WebhookRecord>, WebhookStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, url, secret, events, active, created_at FROM webhooks ORDER BY id",
        )?;
        let records = stmt
            .query_map([], map_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Deactivate a registration. Returns false when the id is unknown or
    /// already inactive.
    pub fn deactivate(&self, id: i64) -> Result<bool, WebhookStoreError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE webhooks SET active = 0 WHERE id = ?1 AND active = 1",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Active registrations subscribed to `event`.
    pub fn active_for_event(&self, event: &str) -> Result<Vec<WebhookRecord>, WebhookStoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|w| w.active && w.events.iter().any(|e| e == event))
            .collect())
    }
}

fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookRecord> {
    let events_json: String = row.get(3)?;
    Ok(WebhookRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        secret: row.get(2)?,
        events: serde_json::from_str(&events_json).unwrap_or_default(),
        active: row.get::<_, i32>(4)? == 1,
        created_at: row.get(5)?,
    })
}

/// A registration target must be https. Anything else would push payment
/// data across the network in cleartext, and an attacker-supplied plain-http
/// URL turns the registry into an SSRF primitive.
pub fn validate_webhook_url(raw: &str) -> Result<(), String> {
    match url::Url::parse(raw) {
        Ok(parsed) if parsed.scheme() == "https" => Ok(()),
        Ok(parsed) => Err(format!(
            "webhook URL must use https, got {}",
            parsed.scheme()
        )),
        Err(e) => Err(format!("invalid webhook URL: {e}")),
    }
}

/// The signature header value for a signed delivery.
pub fn signature_header(secret: &[u8], body: &[u8]) -> String {
    format!("sha256={}", turnpike::hmac::compute_hmac(secret, body))
}

/// HTTP client for webhook deliveries.
pub fn webhook_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(DELIVERY_TIMEOUT)
        // Prevent SSRF via redirects
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("reqwest client construction cannot fail with these options")
}

/// Consume settlement events and deliver them to matching registrations.
pub fn spawn_dispatcher(
    store: WebhookStore,
    client: reqwest::Client,
    mut events: UnboundedReceiver<SettlementEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let hooks = match store.active_for_event(&event.event) {
                Ok(hooks) => hooks,
                Err(e) => {
                    tracing::warn!(error = %e, "webhook registry read failed");
                    continue;
                }
            };
            if hooks.is_empty() {
                continue;
            }
            let body = match serde_json::to_vec(&event) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize webhook payload");
                    continue;
                }
            };
            for hook in hooks {
                let client = client.clone();
                let body = body.clone();
                let event_name = event.event.clone();
                let timestamp = event.timestamp;
                tokio::spawn(async move {
                    let mut request = client
                        .post(&hook.url)
                        .header("content-type", "application/json")
                        .header("X-Webhook-Event", event_name.as_str())
                        .header("X-Webhook-Timestamp", timestamp.to_string());
                    if let Some(secret) = &hook.secret {
                        request = request
                            .header("X-Webhook-Signature", signature_header(secret.as_bytes(), &body));
                    }
                    match request.body(body).send().await {
                        Ok(resp) => {
                            metrics::WEBHOOK_DELIVERIES
                                .with_label_values(&["delivered"])
                                .inc();
                            tracing::debug!(url = %hook.url, status = %resp.status(), "webhook delivered");
                        }
                        Err(e) => {
                            metrics::WEBHOOK_DELIVERIES
                                .with_label_values(&["failed"])
                                .inc();
                            tracing::warn!(url = %hook.url, error = %e, "webhook delivery failed");
                        }
                    }
                });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_list() {
        let store = WebhookStore::in_memory().unwrap();
        let record = store
            .register(
                "https://hooks.example.com/pay",
                &["settlement.success".to_string()],
                Some("s3cret"),
            )
            .unwrap();
        assert!(record.active);

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].url, "https://hooks.example.com/pay");
        assert_eq!(listed[0].events, vec!["settlement.success"]);
    }

    #[test]
    fn test_secret_never_serialized() {
        let store = WebhookStore::in_memory().unwrap();
        let record = store
            .register("https://hooks.example.com", &["settlement.failed".to_string()], Some("s3cret"))
            .unwrap();
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("s3cret"));
    }

    #[test]
    fn test_deactivate() {
        let store = WebhookStore::in_memory().unwrap();
        let record = store
            .register("https://hooks.example.com", &["settlement.success".to_string()], None)
            .unwrap();

        assert!(store.deactivate(record.id).unwrap());
        // Second deactivation is a no-op.
        assert!(!store.deactivate(record.id).unwrap());
        assert!(!store.deactivate(9999).unwrap());

        let listed = store.list().unwrap();
        assert!(!listed[0].active);
    }

    #[test]
    fn test_active_for_event_filters() {
        let store = WebhookStore::in_memory().unwrap();
        store
            .register("https://a.example.com", &["settlement.success".to_string()], None)
            .unwrap();
        let b = store
            .register("https://b.example.com", &["settlement.failed".to_string()], None)
            .unwrap();
        store.deactivate(b.id).unwrap();

        let success = store.active_for_event("settlement.success").unwrap();
        assert_eq!(success.len(), 1);
        assert_eq!(success[0].url, "https://a.example.com");
        assert!(store.active_for_event("settlement.failed").unwrap().is_empty());
    }

    #[test]
    fn test_signature_header_format() {
        let header = signature_header(b"secret", b"{}");
        assert!(header.starts_with("sha256="));
        // hex HMAC-SHA256 is 64 chars
        assert_eq!(header.len(), "sha256=".len() + 64);
    }

    #[test]
    fn test_validate_webhook_url_requires_https() {
        assert!(validate_webhook_url("https://hooks.example.com/pay").is_ok());
        assert!(validate_webhook_url("http://hooks.example.com/pay").is_err());
        assert!(validate_webhook_url("ftp://hooks.example.com").is_err());
        assert!(validate_webhook_url("not a url").is_err());
    }
}
