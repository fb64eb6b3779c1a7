pub mod pty;
pub mod shell;
pub mod telnet;
pub mod utf8;

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

pub const ROUTE_SERVER_OUTPUT_CHANNEL: &str = "route-server-output";

/// Output channel name for one terminal session.
pub fn terminal_output_channel(id: &str) -> String {
    format!("terminal-output-{id}")
}

/// Exit channel name for one terminal session.
pub fn terminal_exit_channel(id: &str) -> String {
    format!("terminal-exit-{id}")
}

/// One item pushed from a session to the UI side of the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    RouteServerOutput {
        session_id: String,
        data: String,
    },
    TerminalOutput {
        id: String,
        data: String,
    },
    TerminalExit {
        id: String,
        exit_code: Option<u32>,
        signal: Option<i32>,
    },
}

impl PushEvent {
    pub fn session_id(&self) -> &str {
        match self {
            PushEvent::RouteServerOutput { session_id, .. } => session_id,
            PushEvent::TerminalOutput { id, .. } | PushEvent::TerminalExit { id, .. } => id,
        }
    }

    pub fn channel(&self) -> String {
        match self {
            PushEvent::RouteServerOutput { .. } => ROUTE_SERVER_OUTPUT_CHANNEL.to_string(),
            PushEvent::TerminalOutput { id, .. } => terminal_output_channel(id),
            PushEvent::TerminalExit { id, .. } => terminal_exit_channel(id),
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            PushEvent::RouteServerOutput { session_id, data } => {
                json!({ "sessionId": session_id, "data": data })
            }
            PushEvent::TerminalOutput { data, .. } => Value::String(data.clone()),
            PushEvent::TerminalExit {
                exit_code, signal, ..
            } => json!({ "exitCode": exit_code, "signal": signal }),
        }
    }
}

/// Sending half of a push channel.
///
/// Sessions hold clones of this handle but never the receiver; the
/// transport that created the channel decides how long it lives. Pushing
/// after the receiver is gone is a silent no-op.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<PushEvent>,
}

impl OutputSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PushEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn push(&self, event: PushEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(err) => {
                tracing::trace!(
                    session_id = %err.0.session_id(),
                    "Output sink receiver dropped; event discarded"
                );
                false
            }
        }
    }

    pub fn route_server(&self, session_id: &str, data: impl Into<String>) -> bool {
        self.push(PushEvent::RouteServerOutput {
            session_id: session_id.to_string(),
            data: data.into(),
        })
    }

    pub fn terminal_output(&self, id: &str, data: impl Into<String>) -> bool {
        self.push(PushEvent::TerminalOutput {
            id: id.to_string(),
            data: data.into(),
        })
    }

    pub fn terminal_exit(&self, id: &str, exit_code: Option<u32>, signal: Option<i32>) -> bool {
        self.push(PushEvent::TerminalExit {
            id: id.to_string(),
            exit_code,
            signal,
        })
    }
}

/// A live session that can release its OS resources on teardown.
#[async_trait]
pub trait SessionRecord: Send + Sync {
    fn id(&self) -> &str;
    async fn cleanup(&self);
}

/// Keyed store of live sessions of one kind.
pub struct SessionRegistry<R> {
    kind: &'static str,
    sessions: RwLock<HashMap<String, Arc<R>>>,
}

impl<R: SessionRecord> SessionRegistry<R> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts `record`; a record already stored under `id` is replaced
    /// and handed back.
    pub async fn register(&self, id: impl Into<String>, record: Arc<R>) -> Option<Arc<R>> {
        let id = id.into();
        let previous = self.sessions.write().await.insert(id.clone(), record);
        if previous.is_some() {
            tracing::warn!(
                kind = self.kind,
                session_id = %id,
                "Session id collision; previous record overwritten"
            );
        }
        previous
    }

    pub async fn get(&self, id: &str) -> Option<Arc<R>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<R>> {
        self.sessions.write().await.remove(id)
    }

    /// Drains the registry, running each record's cleanup. Returns how
    /// many records were released.
    pub async fn remove_all(&self) -> usize {
        let drained: Vec<Arc<R>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, record)| record).collect()
        };
        for record in &drained {
            tracing::debug!(kind = self.kind, session_id = %record.id(), "Releasing session");
            record.cleanup().await;
        }
        drained.len()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn records(&self) -> Vec<Arc<R>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct DummyRecord {
        id: String,
        cleaned: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SessionRecord for DummyRecord {
        fn id(&self) -> &str {
            &self.id
        }

        async fn cleanup(&self) {
            self.cleaned.store(true, Ordering::SeqCst);
        }
    }

    fn record(id: &str) -> (Arc<DummyRecord>, Arc<AtomicBool>) {
        let cleaned = Arc::new(AtomicBool::new(false));
        (
            Arc::new(DummyRecord {
                id: id.to_string(),
                cleaned: cleaned.clone(),
            }),
            cleaned,
        )
    }

    #[tokio::test]
    async fn register_get_remove() {
        let registry = SessionRegistry::new("test");
        let (rec, _) = record("a");
        assert!(registry.register("a", rec).await.is_none());
        assert_eq!(registry.get("a").await.map(|r| r.id.clone()), Some("a".to_string()));
        assert!(registry.get("b").await.is_none());
        assert_eq!(registry.ids().await, vec!["a".to_string()]);
        assert!(registry.remove("a").await.is_some());
        assert!(registry.get("a").await.is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry: SessionRegistry<DummyRecord> = SessionRegistry::new("test");
        assert!(registry.remove("missing").await.is_none());
        let (rec, _) = record("a");
        registry.register("a", rec).await;
        assert!(registry.remove("a").await.is_some());
        assert!(registry.remove("a").await.is_none());
    }

    #[tokio::test]
    async fn register_overwrites_and_returns_previous() {
        let registry = SessionRegistry::new("test");
        let (first, _) = record("first");
        let (second, _) = record("second");
        registry.register("dup", first).await;
        let previous = registry.register("dup", second).await.expect("previous");
        assert_eq!(previous.id, "first");
        assert_eq!(registry.get("dup").await.expect("current").id, "second");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_all_runs_cleanup() {
        let registry = SessionRegistry::new("test");
        let (a, a_cleaned) = record("a");
        let (b, b_cleaned) = record("b");
        registry.register("a", a).await;
        registry.register("b", b).await;
        assert_eq!(registry.remove_all().await, 2);
        assert!(a_cleaned.load(Ordering::SeqCst));
        assert!(b_cleaned.load(Ordering::SeqCst));
        assert!(registry.is_empty().await);
    }

    #[test]
    fn push_event_channels_are_per_session() {
        let output = PushEvent::TerminalOutput {
            id: "abc".to_string(),
            data: "hi".to_string(),
        };
        let exit = PushEvent::TerminalExit {
            id: "abc".to_string(),
            exit_code: Some(0),
            signal: None,
        };
        assert_eq!(output.channel(), "terminal-output-abc");
        assert_eq!(output.payload(), json!("hi"));
        assert_eq!(exit.channel(), "terminal-exit-abc");
        assert_eq!(exit.payload(), json!({ "exitCode": 0, "signal": null }));
    }

    #[test]
    fn route_server_payload_carries_session_id() {
        let event = PushEvent::RouteServerOutput {
            session_id: "s1".to_string(),
            data: "Password: ".to_string(),
        };
        assert_eq!(event.channel(), ROUTE_SERVER_OUTPUT_CHANNEL);
        assert_eq!(
            event.payload(),
            json!({ "sessionId": "s1", "data": "Password: " })
        );
    }

    #[tokio::test]
    async fn sink_push_after_receiver_drop_is_noop() {
        let (sink, rx) = OutputSink::channel();
        assert!(sink.route_server("s1", "one"));
        drop(rx);
        assert!(!sink.route_server("s1", "two"));
    }
}
