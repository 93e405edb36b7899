use crate::api::UserVaultClient;
use crate::cache::{CommandCache, CommandSource};
use crate::config::Config;
use crate::discord::DiscordClient;
use crate::dispatch::{api_stats, render_result, CommandTable, DispatchSettings, Dispatcher, IncomingMessage};
use crate::exporters::RequestExporter;
use crate::notify::{NotificationPoller, NotificationQueue, NotificationSink, ReloadRequest};
use crate::signing::{self, SignedRequest, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::stats::RequestLog;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const RELOAD_QUEUE: usize = 4;
const CONSOLE_CHANNEL_ID: u64 = 0;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "sign" {
            return handle_sign(&Config::load_unchecked()?);
        }
        if command == "commands" {
            return handle_commands(&Config::load_unchecked()?).await;
        }
        if command == "call" {
            return handle_call(&Config::load_unchecked()?).await;
        }
        if command == "games" {
            return handle_games(&Config::load_unchecked()?).await;
        }
        if command == "delete-account" {
            return handle_delete_account(&Config::load_unchecked()?).await;
        }
        if command == "notifications" {
            return handle_notifications(&Config::load_unchecked()?).await;
        }
        if command == "console" {
            return handle_console(&Config::load_unchecked()?).await;
        }
    }

    let config = Config::load()?;
    let log = build_request_log(&config).await;
    let client = Arc::new(build_client(&config, log)?);
    let cache = Arc::new(CommandCache::new(
        client.clone(),
        Duration::from_secs(config.cache.ttl_secs),
    ));
    let sink = build_sink(&config);

    let (reload_tx, reload_rx) = mpsc::channel(RELOAD_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = Arc::new(Dispatcher::new(
        dispatch_settings(&config),
        client.clone(),
        cache.clone(),
        reload_tx.clone(),
    ));

    let mut supervisor = Supervisor::new(
        cache,
        dispatcher,
        client.clone(),
        sink,
        poller_settings(&config),
        reload_tx,
        shutdown_rx,
    );
    supervisor.start().await;
    tracing::info!(
        embedded = config.embedded,
        slash_commands = config.discord.enable_slash_commands,
        "uservault bot running"
    );

    let supervisor_task = tokio::spawn(supervisor.run(reload_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown: ctrl-c");
    let _ = shutdown_tx.send(true);
    if let Err(err) = supervisor_task.await {
        tracing::warn!(error = %err, "supervisor did not stop cleanly");
    }
    tracing::info!(stats = %client.request_log().snapshot(), "backend request totals");
    client.close();
    tracing::debug!(closed = client.is_closed(), "backend session released");
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub channel_id: Option<u64>,
    pub interval: Duration,
}

fn poller_settings(config: &Config) -> PollerSettings {
    PollerSettings {
        channel_id: config
            .notifications
            .channel_id
            .filter(|_| config.notifications.enabled),
        interval: Duration::from_secs(config.notifications.poll_interval_secs),
    }
}

fn dispatch_settings(config: &Config) -> DispatchSettings {
    DispatchSettings {
        prefix: config.discord.command_prefix.clone(),
        admin_user_ids: config.discord.admin_user_ids.clone(),
        slash_enabled: config.discord.enable_slash_commands,
        embedded: config.embedded,
    }
}

/// Owns the routing table and the one live notification poller.
pub struct Supervisor {
    cache: Arc<CommandCache>,
    dispatcher: Arc<Dispatcher>,
    queue: Arc<dyn NotificationQueue>,
    sink: Option<Arc<dyn NotificationSink>>,
    settings: PollerSettings,
    reload_tx: mpsc::Sender<ReloadRequest>,
    shutdown: watch::Receiver<bool>,
    poller: Option<JoinHandle<()>>,
    generation: u64,
}

impl Supervisor {
    pub fn new(
        cache: Arc<CommandCache>,
        dispatcher: Arc<Dispatcher>,
        queue: Arc<dyn NotificationQueue>,
        sink: Option<Arc<dyn NotificationSink>>,
        settings: PollerSettings,
        reload_tx: mpsc::Sender<ReloadRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cache,
            dispatcher,
            queue,
            sink,
            settings,
            reload_tx,
            shutdown,
            poller: None,
            generation: 0,
        }
    }

    /// Initial load. A backend outage here still starts the poller so a
    /// later notification can trigger a reload.
    pub async fn start(&mut self) {
        let snapshot = self.cache.get_commands(true).await;
        self.dispatcher.install(CommandTable::build(&snapshot));
        tracing::info!(commands = snapshot.len(), "command table installed");
        self.restart_poller().await;
    }

    pub async fn reload(&mut self, request: &ReloadRequest) -> bool {
        tracing::info!(reason = %request.reason, "reloading command table");
        match self.cache.refresh().await {
            Ok(snapshot) => {
                self.dispatcher.install(CommandTable::build(&snapshot));
                self.restart_poller().await;
                tracing::info!(
                    commands = snapshot.len(),
                    generation = self.generation,
                    poller_running = self.poller_running(),
                    "reload complete"
                );
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "reload failed, keeping previous command table");
                self.report(&format!("❌ Reload failed: {}", err.message)).await;
                false
            }
        }
    }

    /// Stops the current poller and waits for it before spawning the next,
    /// so two pollers never overlap.
    async fn restart_poller(&mut self) {
        if let Some(handle) = self.poller.take() {
            handle.abort();
            let _ = handle.await;
        }
        let (Some(channel_id), Some(sink)) = (self.settings.channel_id, self.sink.clone()) else {
            tracing::info!("no updates channel configured, notification polling disabled");
            return;
        };
        let poller = NotificationPoller::new(
            self.queue.clone(),
            sink,
            channel_id,
            self.settings.interval,
            self.reload_tx.clone(),
        );
        self.generation += 1;
        self.poller = Some(tokio::spawn(poller.run(self.shutdown.clone())));
    }

    async fn report(&self, text: &str) {
        let (Some(channel_id), Some(sink)) = (self.settings.channel_id, &self.sink) else {
            return;
        };
        let delivered = match sink.resolve(channel_id).await {
            Ok(destination) => sink.send_text(&destination, text).await,
            Err(err) => Err(err),
        };
        if let Err(err) = delivered {
            tracing::warn!(error = %err, "could not notify operator channel");
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn poller_running(&self) -> bool {
        self.poller.as_ref().map_or(false, |handle| !handle.is_finished())
    }

    pub async fn run(mut self, mut reload_rx: mpsc::Receiver<ReloadRequest>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                request = reload_rx.recv() => match request {
                    Some(request) => {
                        self.reload(&request).await;
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Some(handle) = self.poller.take() {
            handle.abort();
            let _ = handle.await;
        }
        tracing::info!("supervisor stopped");
    }
}

async fn build_request_log(config: &Config) -> Arc<RequestLog> {
    match RequestExporter::from_config(&config.otlp) {
        Ok(Some(exporter)) => Arc::new(RequestLog::with_exporter(exporter)),
        Ok(None) => Arc::new(RequestLog::new()),
        Err(err) => {
            tracing::warn!(error = %err, "otlp exporter init failed, metrics export disabled");
            Arc::new(RequestLog::new())
        }
    }
}

fn build_client(
    config: &Config,
    log: Arc<RequestLog>,
) -> Result<UserVaultClient, Box<dyn std::error::Error>> {
    let secret = config
        .webhook_secret()
        .ok_or("missing DISCORD_WEBHOOK_SECRET (backend.webhook_secret)")?;
    Ok(UserVaultClient::builder(config.backend.endpoints(), secret)
        .timeout(Duration::from_secs(config.backend.timeout_secs))
        .request_log(log)
        .build()?)
}

fn build_sink(config: &Config) -> Option<Arc<dyn NotificationSink>> {
    let token = config.discord.token.as_deref()?;
    match DiscordClient::new(
        token,
        &config.discord.api_base,
        Duration::from_secs(config.backend.timeout_secs),
    ) {
        Ok(client) => Some(Arc::new(client)),
        Err(err) => {
            tracing::warn!(error = %err, "discord client unavailable, notifications disabled");
            None
        }
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn parse_object(raw: Option<String>) -> Result<Map<String, Value>, Box<dyn std::error::Error>> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str(&raw)? {
            Value::Object(map) => Ok(map),
            _ => Err("expected a JSON object".into()),
        },
    }
}

fn handle_sign(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let payload = parse_object(Some(
        args.next()
            .ok_or("missing payload (usage: sign '<json object>')")?,
    ))?;
    let secret = config
        .webhook_secret()
        .ok_or("missing DISCORD_WEBHOOK_SECRET (backend.webhook_secret)")?;

    let signed = SignedRequest::new(secret, payload, signing::now_ms());
    if !signing::verify(secret, signed.timestamp, signed.body(), &signed.signature) {
        return Err("signature failed verification".into());
    }
    println!("{}: {}", TIMESTAMP_HEADER, signed.timestamp);
    println!("{}: {}", SIGNATURE_HEADER, signed.signature);
    println!("{}", signed.body());
    Ok(())
}

async fn handle_commands(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = build_client(config, Arc::new(RequestLog::new()))?;
    let commands = client.fetch_commands().await?;
    for cmd in &commands {
        println!(
            "{:<16} {:<10} {:<8} {}",
            cmd.name,
            cmd.category_or_default(),
            if cmd.enabled { "enabled" } else { "disabled" },
            cmd.usage_or_default()
        );
    }
    let snapshot = crate::cache::CommandSnapshot::new(commands, None);
    let table = CommandTable::build(&snapshot);
    if !table.unhandled().is_empty() {
        println!("\nno local handler: {}", table.unhandled().join(", "));
    }
    if config.discord.enable_slash_commands {
        println!("slash commands: {}", CommandTable::slash_commands().join(", "));
    }
    client.close();
    Ok(())
}

async fn handle_call(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let action = args
        .next()
        .ok_or("missing action (usage: call <action> [json params] [discord_user_id])")?;
    let params = parse_object(args.next())?;
    let user_id = args.next();

    let client = build_client(config, Arc::new(RequestLog::new()))?;
    let result = match user_id.as_deref() {
        Some(user_id) => client.call_authenticated(&action, user_id, params).await,
        None => client.call_unauthenticated(&action, params).await,
    };
    println!("{}", render_result(&result));
    client.close();
    Ok(())
}

async fn handle_games(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = build_client(config, Arc::new(RequestLog::new()))?;
    println!("games:\n{}\n", render_result(&client.get_available_games().await));
    println!("config:\n{}\n", render_result(&client.get_game_config().await));
    println!("commands:\n{}", render_result(&client.get_all_commands().await));
    client.close();
    Ok(())
}

async fn handle_delete_account(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let user_id = std::env::args()
        .nth(2)
        .ok_or("missing user id (usage: delete-account <discord_user_id>)")?;
    let client = build_client(config, Arc::new(RequestLog::new()))?;
    let result = client.delete_account(&user_id).await;
    tracing::info!(user_id = %user_id, ok = result.is_ok(), "delete_account");
    println!("{}", render_result(&result));
    client.close();
    Ok(())
}

async fn handle_notifications(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = build_client(config, Arc::new(RequestLog::new()))?;
    let pending = client.fetch_pending().await?;
    if pending.is_empty() {
        println!("no pending notifications");
    }
    for notification in &pending {
        let rendered = crate::notify::render(notification);
        println!("[{}] {} ({})", notification.id, rendered.title, rendered.shown_usage);
    }
    client.close();
    Ok(())
}

/// Reads commands from stdin and prints the replies, for exercising the
/// command table without a Discord connection.
async fn handle_console(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let user_id: u64 = args
        .next()
        .ok_or("missing user id (usage: console <discord_user_id>)")?
        .parse()?;

    let client = Arc::new(build_client(config, Arc::new(RequestLog::new()))?);
    let cache = Arc::new(CommandCache::new(
        client.clone(),
        Duration::from_secs(config.cache.ttl_secs),
    ));
    let (reload_tx, mut reload_rx) = mpsc::channel(RELOAD_QUEUE);
    let dispatcher = Dispatcher::new(dispatch_settings(config), client.clone(), cache.clone(), reload_tx);
    dispatcher.install(CommandTable::build(&*cache.get_commands(false).await));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let msg = IncomingMessage {
            user_id,
            channel_id: CONSOLE_CHANNEL_ID,
            content: line,
        };
        if let Some(reply) = dispatcher.handle(&msg).await {
            println!("{reply}\n");
        }
        if let Ok(request) = reload_rx.try_recv() {
            let snapshot = cache.get_commands(true).await;
            dispatcher.install(CommandTable::build(&snapshot));
            println!("reloaded {} commands ({})\n", snapshot.len(), request.reason);
        }
    }
    println!("{}", api_stats(&client));
    client.close();
    Ok(())
}
