use crate::api::{ApiError, UserVaultClient};
use crate::model::{BotCommands, CommandDescriptor};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait CommandSource: Send + Sync {
    async fn fetch_commands(&self) -> Result<Vec<CommandDescriptor>, ApiError>;
}

#[async_trait]
impl CommandSource for UserVaultClient {
    async fn fetch_commands(&self) -> Result<Vec<CommandDescriptor>, ApiError> {
        let value = self.get_bot_commands().await?;
        let parsed: BotCommands = serde_json::from_value(value)
            .map_err(|err| ApiError::new(format!("invalid command list: {err}")))?;
        Ok(parsed.commands)
    }
}

/// An immutable view of the backend command registry.
#[derive(Debug, Clone, Default)]
pub struct CommandSnapshot {
    commands: Vec<CommandDescriptor>,
    by_name: HashMap<String, usize>,
    fetched_at: Option<Instant>,
}

impl CommandSnapshot {
    pub fn new(commands: Vec<CommandDescriptor>, fetched_at: Option<Instant>) -> Self {
        let by_name = commands
            .iter()
            .enumerate()
            .map(|(idx, cmd)| (cmd.name.to_lowercase(), idx))
            .collect();
        Self {
            commands,
            by_name,
            fetched_at,
        }
    }

    pub fn commands(&self) -> &[CommandDescriptor] {
        &self.commands
    }

    pub fn get(&self, name: &str) -> Option<&CommandDescriptor> {
        let key = name.trim().trim_start_matches('?').to_lowercase();
        self.by_name.get(&key).map(|idx| &self.commands[*idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn fetched_at(&self) -> Option<Instant> {
        self.fetched_at
    }

    /// Enabled commands grouped by category, for help output.
    pub fn categories(&self) -> BTreeMap<&str, Vec<&CommandDescriptor>> {
        let mut grouped: BTreeMap<&str, Vec<&CommandDescriptor>> = BTreeMap::new();
        for cmd in self.commands.iter().filter(|cmd| cmd.enabled) {
            grouped.entry(cmd.category_or_default()).or_default().push(cmd);
        }
        grouped
    }
}

/// Single-writer TTL cache over the command registry. Readers always get a
/// whole snapshot; refreshes swap in a new `Arc` and never mutate in place.
pub struct CommandCache {
    source: Arc<dyn CommandSource>,
    ttl: Duration,
    current: Mutex<Arc<CommandSnapshot>>,
}

impl CommandCache {
    pub fn new(source: Arc<dyn CommandSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            current: Mutex::new(Arc::new(CommandSnapshot::default())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn snapshot(&self) -> Arc<CommandSnapshot> {
        Arc::clone(&self.current.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn is_fresh(&self, snapshot: &CommandSnapshot) -> bool {
        snapshot
            .fetched_at
            .map_or(false, |at| at.elapsed() < self.ttl)
    }

    /// Returns the cached snapshot while it is younger than the TTL. Otherwise
    /// refetches; if the backend fails the previous snapshot is returned.
    pub async fn get_commands(&self, force: bool) -> Arc<CommandSnapshot> {
        let current = self.snapshot();
        if !force && self.is_fresh(&current) {
            return current;
        }
        match self.refresh().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    cached = current.len(),
                    "command refresh failed, serving cached commands"
                );
                current
            }
        }
    }

    pub async fn refresh(&self) -> Result<Arc<CommandSnapshot>, ApiError> {
        let commands = self.source.fetch_commands().await?;
        let snapshot = Arc::new(CommandSnapshot::new(commands, Some(Instant::now())));
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
        tracing::debug!(commands = snapshot.len(), "command cache refreshed");
        Ok(snapshot)
    }

    /// Forces the next `get_commands` to hit the backend while keeping the
    /// current data available as a fallback.
    pub fn invalidate(&self) {
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stale = CommandSnapshot::clone(&guard);
        stale.fetched_at = None;
        *guard = Arc::new(stale);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub(crate) fn descriptor(name: &str, category: &str) -> CommandDescriptor {
        CommandDescriptor {
            name: name.to_string(),
            category: Some(category.to_string()),
            ..CommandDescriptor::default()
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub calls: AtomicUsize,
        pub failing: AtomicBool,
        pub commands: Mutex<Vec<CommandDescriptor>>,
    }

    impl FakeSource {
        pub(crate) fn with(commands: Vec<CommandDescriptor>) -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(commands),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl CommandSource for FakeSource {
        async fn fetch_commands(&self) -> Result<Vec<CommandDescriptor>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ApiError::new("backend unavailable"));
            }
            Ok(self.commands.lock().unwrap().clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serves_cached_snapshot_inside_ttl() {
        let source = FakeSource::with(vec![descriptor("slots", "games")]);
        let cache = CommandCache::new(source.clone(), DEFAULT_TTL);

        let first = cache.get_commands(false).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(59)).await;
        let second = cache.get_commands(false).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));

        tokio::time::advance(Duration::from_secs(2)).await;
        let third = cache.get_commands(false).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&second, &third));
    }

    #[tokio::test(start_paused = true)]
    async fn force_bypasses_ttl() {
        let source = FakeSource::with(vec![descriptor("slots", "games")]);
        let cache = CommandCache::new(source.clone(), DEFAULT_TTL);
        cache.get_commands(false).await;
        cache.get_commands(true).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_previous_snapshot() {
        let source = FakeSource::with(vec![descriptor("slots", "games"), descriptor("daily", "economy")]);
        let cache = CommandCache::new(source.clone(), DEFAULT_TTL);
        let good = cache.get_commands(false).await;
        assert_eq!(good.len(), 2);

        source.failing.store(true, Ordering::SeqCst);
        let after = cache.get_commands(true).await;
        assert!(Arc::ptr_eq(&good, &after));
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn first_fetch_failure_yields_empty_snapshot() {
        let source = FakeSource::with(vec![]);
        source.failing.store(true, Ordering::SeqCst);
        let cache = CommandCache::new(source, DEFAULT_TTL);
        let snapshot = cache.get_commands(false).await;
        assert!(snapshot.is_empty());
        assert!(snapshot.fetched_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_triggers_refetch_but_keeps_data() {
        let source = FakeSource::with(vec![descriptor("slots", "games")]);
        let cache = CommandCache::new(source.clone(), DEFAULT_TTL);
        cache.get_commands(false).await;
        cache.invalidate();
        assert_eq!(cache.snapshot().len(), 1);
        cache.get_commands(false).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn lookup_is_case_insensitive_and_groups_enabled_by_category() {
        let mut hidden = descriptor("mines", "games");
        hidden.enabled = false;
        let snapshot = CommandSnapshot::new(
            vec![
                descriptor("Slots", "games"),
                descriptor("daily", "economy"),
                hidden,
                CommandDescriptor {
                    name: "ping".to_string(),
                    ..CommandDescriptor::default()
                },
            ],
            None,
        );

        assert_eq!(snapshot.get("SLOTS").map(|c| c.name.as_str()), Some("Slots"));
        assert!(snapshot.contains("?daily"));
        assert!(!snapshot.contains("crash"));

        let categories = snapshot.categories();
        assert_eq!(categories.keys().copied().collect::<Vec<_>>(), ["economy", "games", "other"]);
        assert_eq!(categories["games"].len(), 1);
    }
}
