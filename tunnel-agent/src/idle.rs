//! Idle notifier (C6): while the agent is parked in idle mode, wait on a
//! lightweight external wake-up signal instead of holding the tunnel
//! channel open. Backed by a Firebase-Realtime-Database-style
//! Server-Sent-Events stream, with a hard timeout as a fallback.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use sse_stream::SseStream;
use tracing::{debug, warn};
use tunnel_protocol::IdleDescriptor;

/// Hard upper bound on how long a single idle period waits before giving up
/// and reconnecting anyway, even with no observed change.
const HARD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Abstraction over "wait for the wake-up signal", so the supervisor's
/// retry logic can be exercised without a real network watch.
#[async_trait]
pub trait IdleWatch: Send + Sync {
    /// Block until the projection of the watched value onto
    /// `remote_names` changes, an error arrives, or the hard timeout
    /// elapses. Every one of those is treated as "wake up".
    async fn wait(&self, descriptor: &IdleDescriptor, remote_names: &[String]);
}

/// Watches one Firebase Realtime Database location via its REST
/// `.json?auth=...` Server-Sent-Events endpoint, waking as soon as the
/// snapshot value differs from the one observed when the watch started.
pub struct FirebaseIdleWatch {
    client: reqwest::Client,
}

impl FirebaseIdleWatch {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn watch_url(&self, descriptor: &IdleDescriptor) -> String {
        format!(
            "{}/{}.json?auth={}",
            descriptor.db.trim_end_matches('/'),
            descriptor.db_key.trim_start_matches('/'),
            descriptor.token,
        )
    }
}

#[async_trait]
impl IdleWatch for FirebaseIdleWatch {
    async fn wait(&self, descriptor: &IdleDescriptor, remote_names: &[String]) {
        let deadline = tokio::time::sleep(HARD_TIMEOUT);
        tokio::pin!(deadline);

        let watch = watch_until_change(&self.client, self.watch_url(descriptor), remote_names);
        tokio::pin!(watch);

        tokio::select! {
            _ = &mut deadline => {
                debug!("idle watch hit the hard timeout, waking up");
            }
            _ = &mut watch => {
                debug!("idle watch observed a change, waking up");
            }
        }
    }
}

/// A snapshot's `{name: count}` map, projected onto the configured
/// `remote_name`s in order, missing names mapping to `None`.
type Projection = Vec<Option<i64>>;

fn project(value: &Value, remote_names: &[String]) -> Projection {
    remote_names
        .iter()
        .map(|name| value.get(name).and_then(Value::as_i64))
        .collect()
}

/// Consume the SSE stream at `url` until the projected snapshot differs
/// from the first one observed (the initial read is a baseline, never a
/// wake-up by itself), or the stream itself ends or errors (both treated
/// as a wake-up, not a reason to stay idle forever).
async fn watch_until_change(client: &reqwest::Client, url: String, remote_names: &[String]) {
    let response = match client
        .get(&url)
        .header("Accept", "text/event-stream")
        .send()
        .await
    {
        Ok(r) => r,
        Err(err) => {
            warn!(error = %err, "idle watch request failed, waking up");
            return;
        }
    };

    let mut events = SseStream::from_byte_stream(response.bytes_stream());
    let mut baseline: Option<Projection> = None;

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "idle watch stream error, waking up");
                return;
            }
        };
        let Some(data) = event.data else { continue };
        let snapshot: Value = match serde_json::from_str(&data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let projected = project(&snapshot, remote_names);

        match &baseline {
            None => baseline = Some(projected),
            Some(seen) if *seen != projected => return,
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> IdleDescriptor {
        IdleDescriptor {
            db: "https://example.firebaseio.com".to_string(),
            db_key: "/agents/abc".to_string(),
            api_key: "k".to_string(),
            token: "t".to_string(),
        }
    }

    #[test]
    fn test_watch_url_joins_db_and_key_with_auth() {
        let watch = FirebaseIdleWatch::new(reqwest::Client::new());
        let url = watch.watch_url(&descriptor());
        assert_eq!(
            url,
            "https://example.firebaseio.com/agents/abc.json?auth=t"
        );
    }

    #[test]
    fn test_project_maps_missing_names_to_none() {
        let names = vec!["app".to_string(), "db".to_string()];
        let snapshot: Value = serde_json::from_str(r#"{"app": 3}"#).unwrap();
        assert_eq!(project(&snapshot, &names), vec![Some(3), None]);
    }

    #[test]
    fn test_project_detects_elementwise_change() {
        let names = vec!["app".to_string()];
        let before = project(&serde_json::json!({"app": 1}), &names);
        let after = project(&serde_json::json!({"app": 2}), &names);
        assert_ne!(before, after);
    }
}
