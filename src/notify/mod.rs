//! Command-change notification poller.
//!
//! Each tick resolves the updates channel, fetches pending notifications,
//! delivers them one at a time and acknowledges only what was delivered.
//! Anything left unacknowledged is fetched again on the next tick, which is
//! the whole retry mechanism. Deliveries of created or updated commands ask
//! the supervisor for a reload over an mpsc channel.

use crate::api::{ApiError, UserVaultClient};
use crate::discord::DeliveryError;
use crate::model::{NotificationAction, PendingNotification, PendingNotifications};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::{fmt, time::Duration};
use tokio::sync::{mpsc, watch};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CHANGES_MAX_CHARS: usize = 1024;

#[async_trait]
pub trait NotificationQueue: Send + Sync {
    async fn fetch_pending(&self) -> Result<Vec<PendingNotification>, ApiError>;
    async fn mark_processed(&self, id: &str) -> Result<(), ApiError>;
}

#[async_trait]
impl NotificationQueue for UserVaultClient {
    async fn fetch_pending(&self) -> Result<Vec<PendingNotification>, ApiError> {
        let value = self.get_pending_notifications().await?;
        let list: PendingNotifications = serde_json::from_value(value)
            .map_err(|err| ApiError::new(format!("invalid notification list: {err}")))?;
        let (parsed, rejected) = list.parse();
        for (index, err) in rejected {
            tracing::warn!(index, error = %err, "skipping malformed notification");
        }
        Ok(parsed)
    }

    async fn mark_processed(&self, id: &str) -> Result<(), ApiError> {
        self.mark_notification_processed(id).await.map(|_| ())
    }
}

/// A resolved delivery target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub channel_id: u64,
    pub name: Option<String>,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "#{} (id={})", name, self.channel_id),
            None => write!(f, "id={}", self.channel_id),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn resolve(&self, channel_id: u64) -> Result<Destination, DeliveryError>;
    async fn deliver(
        &self,
        destination: &Destination,
        notification: &RenderedNotification,
    ) -> Result<(), DeliveryError>;
    async fn send_text(&self, destination: &Destination, text: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedNotification {
    pub id: String,
    pub action: NotificationAction,
    pub title: String,
    pub description: String,
    pub shown_usage: String,
    pub colour: u32,
    pub changes: Option<String>,
    pub footer: String,
}

pub fn render(notification: &PendingNotification) -> RenderedNotification {
    let action = notification.action;
    let name = if notification.command_name.is_empty() {
        "unknown"
    } else {
        notification.command_name.as_str()
    };
    let shown_usage = match notification.changes.get("usage") {
        Some(Value::String(usage)) if !usage.trim().is_empty() => usage.clone(),
        _ => format!("?{name}"),
    };
    let (emoji, colour) = match action {
        NotificationAction::Created => ("✨", 0x22c55e),
        NotificationAction::Updated => ("📝", 0xf59e0b),
        NotificationAction::Deleted => ("🗑️", 0xef4444),
        NotificationAction::Unknown => ("📋", 0x6366f1),
    };

    let changes = (!notification.changes.is_empty()).then(|| {
        let text = notification
            .changes
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("• **{key}**: {s}"),
                other => format!("• **{key}**: {other}"),
            })
            .collect::<Vec<_>>()
            .join("\n");
        text.chars().take(CHANGES_MAX_CHARS).collect()
    });

    RenderedNotification {
        id: notification.id.clone(),
        action,
        title: format!("{emoji} Command {}", capitalize(action.as_str())),
        description: format!("**`{shown_usage}`** was {action}"),
        shown_usage,
        colour,
        changes,
        footer: format!("UserVault Command System • v{}", env!("CARGO_PKG_VERSION")),
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadRequest {
    pub reason: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub delivered: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub reload_requested: bool,
}

#[derive(Debug)]
pub enum PollError {
    Resolve(DeliveryError),
    Queue(ApiError),
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve(err) => write!(f, "could not resolve updates channel: {err}"),
            Self::Queue(err) => write!(f, "could not fetch notifications: {err}"),
        }
    }
}

impl std::error::Error for PollError {}

pub struct NotificationPoller {
    queue: Arc<dyn NotificationQueue>,
    sink: Arc<dyn NotificationSink>,
    channel_id: u64,
    interval: Duration,
    destination: Option<Destination>,
    reload_tx: mpsc::Sender<ReloadRequest>,
}

impl NotificationPoller {
    pub fn new(
        queue: Arc<dyn NotificationQueue>,
        sink: Arc<dyn NotificationSink>,
        channel_id: u64,
        interval: Duration,
        reload_tx: mpsc::Sender<ReloadRequest>,
    ) -> Self {
        Self {
            queue,
            sink,
            channel_id,
            interval,
            destination: None,
            reload_tx,
        }
    }

    async fn destination(&mut self) -> Result<Destination, PollError> {
        if let Some(destination) = &self.destination {
            return Ok(destination.clone());
        }
        let destination = self
            .sink
            .resolve(self.channel_id)
            .await
            .map_err(PollError::Resolve)?;
        tracing::info!(destination = %destination, "sending command updates");
        self.destination = Some(destination.clone());
        Ok(destination)
    }

    pub async fn tick(&mut self) -> Result<TickReport, PollError> {
        let destination = self.destination().await?;
        let pending = self.queue.fetch_pending().await.map_err(PollError::Queue)?;

        let mut report = TickReport {
            fetched: pending.len(),
            ..TickReport::default()
        };
        let mut reload_for: Vec<&str> = Vec::new();

        for notification in &pending {
            let rendered = render(notification);
            if let Err(err) = self.sink.deliver(&destination, &rendered).await {
                report.failed += 1;
                self.destination = None;
                tracing::warn!(
                    id = %notification.id,
                    error = %err,
                    "notification not delivered, leaving it queued"
                );
                continue;
            }

            report.delivered += 1;
            tracing::info!(
                id = %notification.id,
                action = %notification.action,
                command = %rendered.shown_usage,
                "notification delivered"
            );
            if notification.action.requires_reload() {
                reload_for.push(&notification.command_name);
            }
            match self.queue.mark_processed(&notification.id).await {
                Ok(()) => report.acknowledged += 1,
                Err(err) => tracing::warn!(
                    id = %notification.id,
                    error = %err,
                    "notification delivered but not acknowledged"
                ),
            }
        }

        if !reload_for.is_empty() {
            let request = ReloadRequest {
                reason: format!("command changes: {}", reload_for.join(", ")),
            };
            match self.reload_tx.try_send(request) {
                Ok(()) => report.reload_requested = true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("reload already pending");
                    report.reload_requested = true;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!("reload channel closed, skipping reload");
                }
            }
        }

        Ok(report)
    }

    /// Polls until `shutdown` flips to true or its sender is dropped. Tick
    /// errors are logged and the loop carries on.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            channel_id = self.channel_id,
            interval_secs = self.interval.as_secs(),
            "notification polling active"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                Ok(report) if report.fetched > 0 => tracing::debug!(?report, "poll tick"),
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "notification poll error"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("notification polling stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) fn notification(id: &str, action: NotificationAction, name: &str) -> PendingNotification {
        PendingNotification {
            id: id.to_string(),
            action,
            command_name: name.to_string(),
            ..PendingNotification::default()
        }
    }

    /// In-memory backend queue: items stay until acknowledged.
    #[derive(Default)]
    pub(crate) struct FakeQueue {
        pub pending: Mutex<Vec<PendingNotification>>,
        pub acked: Mutex<Vec<String>>,
        pub fetches: AtomicUsize,
        pub failing: AtomicBool,
    }

    impl FakeQueue {
        pub(crate) fn with(items: Vec<PendingNotification>) -> Arc<Self> {
            Arc::new(Self {
                pending: Mutex::new(items),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl NotificationQueue for FakeQueue {
        async fn fetch_pending(&self) -> Result<Vec<PendingNotification>, ApiError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ApiError::new("HTTP 503"));
            }
            Ok(self.pending.lock().unwrap().iter().take(10).cloned().collect())
        }

        async fn mark_processed(&self, id: &str) -> Result<(), ApiError> {
            self.pending.lock().unwrap().retain(|n| n.id != id);
            self.acked.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeSink {
        pub fail_ids: Mutex<HashSet<String>>,
        pub delivered: Mutex<Vec<RenderedNotification>>,
        pub texts: Mutex<Vec<String>>,
        pub resolves: AtomicUsize,
    }

    #[async_trait]
    impl NotificationSink for FakeSink {
        async fn resolve(&self, channel_id: u64) -> Result<Destination, DeliveryError> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(Destination {
                channel_id,
                name: Some("command-updates".to_string()),
            })
        }

        async fn deliver(
            &self,
            _destination: &Destination,
            notification: &RenderedNotification,
        ) -> Result<(), DeliveryError> {
            if self.fail_ids.lock().unwrap().contains(&notification.id) {
                return Err(DeliveryError::Unavailable("simulated send failure".to_string()));
            }
            self.delivered.lock().unwrap().push(notification.clone());
            Ok(())
        }

        async fn send_text(&self, _destination: &Destination, text: &str) -> Result<(), DeliveryError> {
            self.texts.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn poller(
        queue: Arc<FakeQueue>,
        sink: Arc<FakeSink>,
    ) -> (NotificationPoller, mpsc::Receiver<ReloadRequest>) {
        let (tx, rx) = mpsc::channel(1);
        (
            NotificationPoller::new(queue, sink, 99, DEFAULT_POLL_INTERVAL, tx),
            rx,
        )
    }

    #[test]
    fn render_prefers_usage_from_changes() {
        let mut notif = notification("n1", NotificationAction::Updated, "slots");
        notif.changes = json!({"usage": "?slots <bet>", "cooldown": 5})
            .as_object()
            .cloned()
            .unwrap();
        let rendered = render(&notif);
        assert_eq!(rendered.title, "📝 Command Updated");
        assert_eq!(rendered.description, "**`?slots <bet>`** was updated");
        assert_eq!(rendered.colour, 0xf59e0b);
        let changes = rendered.changes.unwrap();
        assert!(changes.contains("• **usage**: ?slots <bet>"));
        assert!(changes.contains("• **cooldown**: 5"));
    }

    #[test]
    fn render_falls_back_and_truncates() {
        let mut notif = notification("n2", NotificationAction::Created, "mines");
        notif.changes.insert("description".to_string(), json!("x".repeat(3000)));
        let rendered = render(&notif);
        assert_eq!(rendered.shown_usage, "?mines");
        assert_eq!(rendered.changes.unwrap().chars().count(), CHANGES_MAX_CHARS);

        let bare = render(&notification("n3", NotificationAction::Deleted, "crash"));
        assert!(bare.changes.is_none());
        assert_eq!(bare.colour, 0xef4444);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_next_tick() {
        let queue = FakeQueue::with(vec![
            notification("n1", NotificationAction::Deleted, "crash"),
            notification("n2", NotificationAction::Deleted, "mines"),
        ]);
        let sink = Arc::new(FakeSink::default());
        sink.fail_ids.lock().unwrap().insert("n1".to_string());
        let (mut poller, _rx) = poller(queue.clone(), sink.clone());

        let first = poller.tick().await.unwrap();
        assert_eq!((first.fetched, first.delivered, first.failed), (2, 1, 1));
        assert_eq!(*queue.acked.lock().unwrap(), vec!["n2".to_string()]);

        sink.fail_ids.lock().unwrap().clear();
        let second = poller.tick().await.unwrap();
        assert_eq!((second.fetched, second.delivered), (1, 1));
        assert_eq!(sink.delivered.lock().unwrap().last().unwrap().id, "n1");
        assert!(queue.pending.lock().unwrap().is_empty());
        // the failure dropped the cached destination
        assert_eq!(sink.resolves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn only_created_or_updated_requests_reload() {
        let queue = FakeQueue::with(vec![notification("n1", NotificationAction::Deleted, "crash")]);
        let sink = Arc::new(FakeSink::default());
        let (mut poller, mut rx) = poller(queue.clone(), sink);

        let report = poller.tick().await.unwrap();
        assert!(!report.reload_requested);
        assert!(rx.try_recv().is_err());

        queue
            .pending
            .lock()
            .unwrap()
            .push(notification("n2", NotificationAction::Created, "slots"));
        let report = poller.tick().await.unwrap();
        assert!(report.reload_requested);
        assert_eq!(rx.try_recv().unwrap().reason, "command changes: slots");
    }

    #[tokio::test]
    async fn failed_reload_candidate_does_not_request_reload() {
        let queue = FakeQueue::with(vec![notification("n1", NotificationAction::Updated, "slots")]);
        let sink = Arc::new(FakeSink::default());
        sink.fail_ids.lock().unwrap().insert("n1".to_string());
        let (mut poller, mut rx) = poller(queue, sink);
        assert!(!poller.tick().await.unwrap().reload_requested);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fetch_failure_is_an_error_not_a_panic() {
        let queue = FakeQueue::with(vec![]);
        queue.failing.store(true, Ordering::SeqCst);
        let (mut poller, _rx) = poller(queue, Arc::new(FakeSink::default()));
        assert!(matches!(poller.tick().await, Err(PollError::Queue(_))));
    }

    #[tokio::test]
    async fn malformed_row_does_not_block_the_rest() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        let fetch = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/bot-command-notifications")
                    .body_contains("\"get_pending\"");
                then.status(200).json_body(json!({"notifications": [
                    {"id": null, "action": "created", "command_name": "slots"},
                    {"id": "n2", "action": "deleted", "command_name": "mines", "changes": null}
                ]}));
            })
            .await;
        let ack = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/bot-command-notifications")
                    .body_contains("\"mark_processed\"")
                    .body_contains("\"notificationId\":\"n2\"");
                then.status(200).json_body(json!({"success": true}));
            })
            .await;

        let queue = Arc::new(crate::api::tests::client_for(&server.base_url()));
        let sink = Arc::new(FakeSink::default());
        let (tx, mut rx) = mpsc::channel(1);
        let mut poller = NotificationPoller::new(queue, sink.clone(), 99, DEFAULT_POLL_INTERVAL, tx);

        let report = poller.tick().await.unwrap();
        fetch.assert_async().await;
        ack.assert_hits_async(1).await;
        assert_eq!((report.fetched, report.delivered, report.failed), (1, 1, 0));
        assert_eq!(sink.delivered.lock().unwrap()[0].id, "n2");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_keeps_polling_until_shutdown() {
        let queue = FakeQueue::with(vec![]);
        queue.failing.store(true, Ordering::SeqCst);
        let (poller, _rx) = poller(queue.clone(), Arc::new(FakeSink::default()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(poller.run(stop_rx));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(queue.fetches.load(Ordering::SeqCst), 3);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
