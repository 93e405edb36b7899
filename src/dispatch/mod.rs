//! Text command routing.
//!
//! Commands are resolved through a [`CommandTable`] built from the built-in
//! handler list and the latest registry snapshot. Whether a command is
//! implemented is answered by table membership alone.

use crate::api::{coerce_balance, ApiResult, UserVaultClient};
use crate::cache::{CommandCache, CommandSnapshot};
use crate::notify::ReloadRequest;
use crate::session::{GuessSessions, ViewTimers, BLACKJACK_TIMEOUT};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

pub const TRIVIA_TIMEOUT: Duration = Duration::from_secs(60);
const MIN_BET: i64 = 10;
const MAX_BET: i64 = 500;
const BLACKJACK_BET: i64 = 50;
const USERS_PER_PAGE: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Help,
    Ping,
    Version,
    ApiStats,
    Balance,
    Daily,
    Profile,
    Link,
    Unlink,
    Lookup,
    Slots,
    Coin,
    Rps,
    Trivia,
    Guess,
    Blackjack,
    Hit,
    Stand,
    Users,
    Reload,
}

struct Builtin {
    command: Command,
    names: &'static [&'static str],
    slash: bool,
}

const BUILTINS: &[Builtin] = &[
    Builtin { command: Command::Help, names: &["help", "helping", "commands"], slash: false },
    Builtin { command: Command::Ping, names: &["ping"], slash: false },
    Builtin { command: Command::Version, names: &["version"], slash: false },
    Builtin { command: Command::ApiStats, names: &["apistats"], slash: true },
    Builtin { command: Command::Balance, names: &["balance", "bal"], slash: true },
    Builtin { command: Command::Daily, names: &["daily"], slash: true },
    Builtin { command: Command::Profile, names: &["profile"], slash: true },
    Builtin { command: Command::Link, names: &["link"], slash: true },
    Builtin { command: Command::Unlink, names: &["unlink"], slash: true },
    Builtin { command: Command::Lookup, names: &["lookup"], slash: true },
    Builtin { command: Command::Slots, names: &["slots"], slash: true },
    Builtin { command: Command::Coin, names: &["coin", "coinflip"], slash: true },
    Builtin { command: Command::Rps, names: &["rps"], slash: true },
    Builtin { command: Command::Trivia, names: &["trivia"], slash: true },
    Builtin { command: Command::Guess, names: &["guess"], slash: true },
    Builtin { command: Command::Blackjack, names: &["blackjack", "bj"], slash: true },
    Builtin { command: Command::Hit, names: &["hit"], slash: false },
    Builtin { command: Command::Stand, names: &["stand"], slash: false },
    Builtin { command: Command::Users, names: &["users"], slash: false },
    Builtin { command: Command::Reload, names: &["reload"], slash: false },
];

/// Name and alias routing, plus which handlers the registry has switched off.
#[derive(Debug, Default)]
pub struct CommandTable {
    routes: HashMap<&'static str, Command>,
    disabled: HashSet<Command>,
    unhandled: Vec<String>,
}

impl CommandTable {
    pub fn build(snapshot: &CommandSnapshot) -> Self {
        let mut routes = HashMap::new();
        let mut disabled = HashSet::new();
        for builtin in BUILTINS {
            for name in builtin.names {
                routes.insert(*name, builtin.command);
            }
            let switched_off = builtin
                .names
                .iter()
                .filter_map(|name| snapshot.get(name))
                .any(|descriptor| !descriptor.enabled);
            if switched_off {
                disabled.insert(builtin.command);
            }
        }

        let unhandled = snapshot
            .commands()
            .iter()
            .filter(|cmd| !routes.contains_key(cmd.name.to_lowercase().as_str()))
            .map(|cmd| cmd.name.clone())
            .collect();

        Self {
            routes,
            disabled,
            unhandled,
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Command> {
        self.routes.get(name.to_lowercase().as_str()).copied()
    }

    pub fn is_disabled(&self, command: Command) -> bool {
        self.disabled.contains(&command)
    }

    /// Registry commands this build has no handler for.
    pub fn unhandled(&self) -> &[String] {
        &self.unhandled
    }

    pub fn slash_commands() -> Vec<&'static str> {
        BUILTINS
            .iter()
            .filter(|builtin| builtin.slash)
            .map(|builtin| builtin.names[0])
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub user_id: u64,
    pub channel_id: u64,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub prefix: String,
    pub admin_user_ids: Vec<u64>,
    pub slash_enabled: bool,
    pub embedded: bool,
}

#[derive(Debug, Clone)]
struct TriviaPrompt {
    question: String,
    options: Vec<String>,
    channel_id: u64,
}

pub struct Dispatcher {
    settings: DispatchSettings,
    client: Arc<UserVaultClient>,
    cache: Arc<CommandCache>,
    table: RwLock<Arc<CommandTable>>,
    guesses: GuessSessions,
    blackjack: ViewTimers<Map<String, Value>>,
    trivia: ViewTimers<TriviaPrompt>,
    reload_tx: mpsc::Sender<ReloadRequest>,
}

impl Dispatcher {
    pub fn new(
        settings: DispatchSettings,
        client: Arc<UserVaultClient>,
        cache: Arc<CommandCache>,
        reload_tx: mpsc::Sender<ReloadRequest>,
    ) -> Self {
        Self {
            settings,
            client,
            cache,
            table: RwLock::new(Arc::new(CommandTable::default())),
            guesses: GuessSessions::new(),
            blackjack: ViewTimers::new(BLACKJACK_TIMEOUT),
            trivia: ViewTimers::new(TRIVIA_TIMEOUT),
            reload_tx,
        }
    }

    pub fn table(&self) -> Arc<CommandTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swaps in a rebuilt routing table. In-flight handlers keep the old one.
    pub fn install(&self, table: CommandTable) {
        if !table.unhandled().is_empty() {
            tracing::info!(commands = ?table.unhandled(), "registry commands without a local handler");
        }
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
    }

    pub fn sessions(&self) -> &GuessSessions {
        &self.guesses
    }

    pub async fn handle(&self, msg: &IncomingMessage) -> Option<String> {
        let content = msg.content.trim();
        let Some(rest) = content.strip_prefix(self.settings.prefix.as_str()) else {
            return self.handle_free_text(msg).await;
        };
        let mut parts = rest.split_whitespace();
        let name = parts.next()?.to_lowercase();
        let args: Vec<&str> = parts.collect();

        let table = self.table();
        let Some(command) = table.resolve(&name) else {
            return self.unknown_command(&name).await;
        };
        if table.is_disabled(command) {
            return Some(format!(
                "❌ `{}{}` is currently disabled.",
                self.settings.prefix, name
            ));
        }
        tracing::debug!(user_id = msg.user_id, ?command, "dispatching command");
        Some(self.run(command, msg, &args).await)
    }

    async fn unknown_command(&self, name: &str) -> Option<String> {
        let snapshot = self.cache.get_commands(false).await;
        snapshot.contains(name).then(|| {
            format!(
                "⚠️ `{}{}` is registered but not available in this bot version yet.",
                self.settings.prefix, name
            )
        })
    }

    async fn run(&self, command: Command, msg: &IncomingMessage, args: &[&str]) -> String {
        let user = msg.user_id.to_string();
        match command {
            Command::Help => self.help().await,
            Command::Ping => "🏓 Pong! Bot is responding.".to_string(),
            Command::Version => self.version(),
            Command::ApiStats => api_stats(&self.client),
            Command::Balance => self.balance(&user).await,
            Command::Daily => self.daily(&user).await,
            Command::Profile => self.profile(&user).await,
            Command::Link => self.link(&user, args.first().copied()).await,
            Command::Unlink => match self.client.unlink_account(&user).await {
                Ok(_) => "🔓 **Account Unlinked**".to_string(),
                Err(err) => format!("❌ {}", err.message),
            },
            Command::Lookup => self.lookup(args.first().copied()).await,
            Command::Slots => self.slots(&user, args).await,
            Command::Coin => self.coin(&user, args).await,
            Command::Rps => self.rps(&user, args).await,
            Command::Trivia => self.trivia(msg).await,
            Command::Guess => self.start_guess(msg).await,
            Command::Blackjack => self.blackjack(msg.user_id).await,
            Command::Hit => self.hit(msg.user_id).await,
            Command::Stand => self.stand(msg.user_id).await,
            Command::Users => self.users(msg.user_id).await,
            Command::Reload => self.reload(msg.user_id).await,
        }
    }

    async fn handle_free_text(&self, msg: &IncomingMessage) -> Option<String> {
        if let Some(reply) = self.guess_attempt(msg).await {
            return Some(reply);
        }
        self.trivia_answer(msg).await
    }

    // ============ info ============

    async fn help(&self) -> String {
        let snapshot = self.cache.get_commands(false).await;
        if snapshot.is_empty() {
            return "📋 No commands available.".to_string();
        }
        let mut out = String::from("📋 **UserVault Bot Commands**\n");
        for (category, commands) in snapshot.categories() {
            let emoji = match category {
                "games" => "🎮",
                "utility" => "🔧",
                "admin" => "👮",
                _ => "📦",
            };
            out.push_str(&format!("\n{emoji} **{}**\n", capitalize(category)));
            for cmd in commands {
                let desc: String = cmd
                    .description
                    .as_deref()
                    .unwrap_or_default()
                    .chars()
                    .take(50)
                    .collect();
                out.push_str(&format!("`{}` – {}\n", cmd.usage_or_default(), desc));
            }
        }
        out
    }

    fn version(&self) -> String {
        format!(
            "🤖 **Bot Version** `v{}`\nMode: {} • Dispatch: {}",
            env!("CARGO_PKG_VERSION"),
            if self.settings.embedded { "embedded" } else { "standalone" },
            if self.settings.slash_enabled { "slash + prefix" } else { "prefix" },
        )
    }

    // ============ account ============

    async fn balance(&self, user: &str) -> String {
        match self.client.get_balance(user).await {
            Ok(result) => format!(
                "💰 **Your Balance**\n\nBalance: **{} UC**\nTotal Earned: {} UC",
                coerce_balance(&result["balance"]),
                coerce_balance(&result["totalEarned"]),
            ),
            Err(err) => format!("❌ Error: {}", err.message),
        }
    }

    async fn daily(&self, user: &str) -> String {
        match self.client.claim_daily(user).await {
            Ok(result) => format!(
                "📅 **Daily Reward**\n\n🎉 Claimed **{} UC**!\n🔥 Streak: {} days\n💰 New Balance: {} UC",
                int_or(&result, "reward", 50),
                int_or(&result, "streak", 1),
                coerce_balance(&result["newBalance"]),
            ),
            Err(err) => format!("❌ {}", err.message),
        }
    }

    async fn profile(&self, user: &str) -> String {
        match self.client.get_profile(user).await {
            Ok(result) => {
                let username = text_or(&result, "username", "Unknown");
                format!(
                    "👤 **UserVault Profile**\n\n**Username:** {username}\n💰 **Balance:** {} UC\n📈 **Total Earned:** {} UC\n🔗 **Profile:** https://uservault.cc/{username}",
                    coerce_balance(&result["balance"]),
                    coerce_balance(&result["totalEarned"]),
                )
            }
            Err(err) => format!("❌ {}", err.message),
        }
    }

    async fn link(&self, user: &str, code: Option<&str>) -> String {
        let Some(code) = code else {
            return format!(
                "🔗 **Account Linking**\n\n1️⃣ Open your UserVault dashboard\n2️⃣ Click 'Generate Verification Code'\n3️⃣ Use `{}link <CODE>`",
                self.settings.prefix
            );
        };
        match self.client.link_account(user, code).await {
            Ok(result) => format!(
                "🔗 **Account Linked!** ✅\n\nYour Discord is now linked to **{}**!",
                text_or(&result, "username", "your account")
            ),
            Err(err) => format!("❌ {}", err.message),
        }
    }

    async fn lookup(&self, username: Option<&str>) -> String {
        let Some(username) = username.map(|name| name.trim().to_lowercase()) else {
            return format!("❌ Usage: `{}lookup <username>`", self.settings.prefix);
        };
        match self.client.lookup_profile(&username).await {
            Ok(result) => {
                let display = match result.get("display_name").and_then(Value::as_str) {
                    Some(name) if !name.is_empty() => name.to_string(),
                    _ => text_or(&result, "username", &username),
                };
                let badge = if result["is_premium"].as_bool().unwrap_or(false) { "⭐ " } else { "" };
                let bio: String = text_or(&result, "bio", "No bio set").chars().take(200).collect();
                format!(
                    "{badge}**{display}**\n{bio}\n\n👁️ Views: {} • ❤️ Likes: {}\nuservault.cc/{username}",
                    int_or(&result, "views_count", 0),
                    int_or(&result, "likes_count", 0),
                )
            }
            Err(err) => format!("❌ {}", err.message),
        }
    }

    // ============ games ============

    async fn check_funds(&self, user: &str, bet: i64) -> Result<(), String> {
        if bet < MIN_BET {
            return Err(format!("❌ Minimum bet is {MIN_BET} UC!"));
        }
        if bet > MAX_BET {
            return Err(format!("❌ Maximum bet is {MAX_BET} UC!"));
        }
        let result = self
            .client
            .get_balance(user)
            .await
            .map_err(|err| format!("❌ {}", err.message))?;
        let balance = coerce_balance(&result["balance"]);
        if balance < bet {
            return Err(format!(
                "❌ Insufficient balance! You have {balance} UC, but need {bet} UC."
            ));
        }
        Ok(())
    }

    async fn settle(&self, user: &str, amount: i64, game: &str, description: String) {
        if let Err(err) = self.client.send_reward(user, amount, game, &description).await {
            tracing::warn!(user_id = user, game, amount, error = %err, "reward not booked");
        }
    }

    async fn slots(&self, user: &str, args: &[&str]) -> String {
        let Some(bet) = parse_bet(args.first(), 20) else {
            return format!("❌ Usage: `{}slots [bet]`", self.settings.prefix);
        };
        if let Err(reply) = self.check_funds(user, bet).await {
            return reply;
        }
        let result = match self.client.spin_slots().await {
            Ok(result) => result,
            Err(err) => return format!("❌ {}", err.message),
        };
        let payout = int_or(&result, "payout", 0);
        let display = text_or(&result, "display", "🎰 🎰 🎰");
        let outcome = if payout > 0 {
            self.settle(user, payout, "slots", format!("Slots win ({payout} UC)")).await;
            format!("🎉 **WIN! +{payout} UC**")
        } else {
            self.settle(user, -bet, "slots", format!("Slots loss ({bet} UC)")).await;
            format!("❌ No match! **-{bet} UC**")
        };
        format!("🎰 **Slots** (Bet: {bet} UC)\n\n{display}\n\n{outcome}")
    }

    async fn coin(&self, user: &str, args: &[&str]) -> String {
        let choice = args.first().map(|c| c.trim().to_lowercase());
        let (Some(choice), Some(bet)) = (choice, parse_bet(args.get(1), 10)) else {
            return format!("❌ Usage: `{}coin heads|tails [bet]`", self.settings.prefix);
        };
        if choice != "heads" && choice != "tails" {
            return format!("❌ Usage: `{}coin heads|tails [bet]`", self.settings.prefix);
        }
        if let Err(reply) = self.check_funds(user, bet).await {
            return reply;
        }
        let result = match self.client.flip_coin().await {
            Ok(result) => result,
            Err(err) => return format!("❌ {}", err.message),
        };
        let landed = text_or(&result, "result", "unknown");
        let emoji = text_or(&result, "emoji", "🪙");
        let outcome = if landed == choice {
            self.settle(user, bet, "coinflip", format!("Coinflip win ({bet} UC)")).await;
            format!("🎉 **You won! +{bet} UC**")
        } else {
            self.settle(user, -bet, "coinflip", format!("Coinflip loss ({bet} UC)")).await;
            format!("❌ You lost! **-{bet} UC**")
        };
        format!("🪙 **Coinflip** (Bet: {bet} UC)\n\n{emoji} The coin landed on **{landed}**!\n\n{outcome}")
    }

    async fn rps(&self, user: &str, args: &[&str]) -> String {
        let usage = format!("❌ Usage: `{}rps rock|paper|scissors [bet]`", self.settings.prefix);
        let choice = args.first().map(|c| c.trim().to_lowercase());
        let (Some(choice), Some(bet)) = (choice, parse_bet(args.get(1), 15)) else {
            return usage;
        };
        if !matches!(choice.as_str(), "rock" | "paper" | "scissors") {
            return usage;
        }
        if let Err(reply) = self.check_funds(user, bet).await {
            return reply;
        }
        let result = match self.client.play_rps(&choice).await {
            Ok(result) => result,
            Err(err) => return format!("❌ Error: {}", err.message),
        };
        let header = format!(
            "✂️ **Rock Paper Scissors** (Bet: {bet} UC)\n\nYou: {}  vs  Bot: {}\n\n",
            text_or(&result, "playerEmoji", "❓"),
            text_or(&result, "botEmoji", "❓"),
        );
        let outcome = match result["result"].as_str().unwrap_or("tie") {
            "win" => {
                self.settle(user, bet, "rps", format!("RPS win ({bet} UC)")).await;
                format!("🎉 **You won! +{bet} UC**")
            }
            "lose" => {
                self.settle(user, -bet, "rps", format!("RPS loss ({bet} UC)")).await;
                format!("❌ You lost! **-{bet} UC**")
            }
            _ => "🤝 It's a tie! No UC won or lost.".to_string(),
        };
        header + &outcome
    }

    async fn trivia(&self, msg: &IncomingMessage) -> String {
        let result = match self.client.get_trivia().await {
            Ok(result) => result,
            Err(err) => return format!("❌ {}", err.message),
        };
        let options: Vec<String> = result["options"]
            .as_array()
            .map(|opts| opts.iter().map(|opt| value_text(opt, "")).collect())
            .unwrap_or_default();
        if options.is_empty() {
            return "❌ Trivia could not be loaded.".to_string();
        }
        let question = text_or(&result, "question", "Trivia");
        let listed = options
            .iter()
            .enumerate()
            .map(|(idx, opt)| format!("{}. {opt}", idx + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let reply = format!(
            "🎯 **Trivia**\n\n{question}\n\n*Category: {}*\n\n{listed}\n\nAnswer with the number (1-{}) within {}s.",
            text_or(&result, "category", "General"),
            options.len(),
            TRIVIA_TIMEOUT.as_secs(),
        );
        self.trivia.insert(
            msg.user_id,
            TriviaPrompt {
                question,
                options,
                channel_id: msg.channel_id,
            },
        );
        reply
    }

    async fn trivia_answer(&self, msg: &IncomingMessage) -> Option<String> {
        let prompt = self.trivia.get(msg.user_id)?;
        if prompt.channel_id != msg.channel_id {
            return None;
        }
        let choice: usize = msg.content.trim().parse().ok()?;
        self.trivia.take(msg.user_id);
        let Some(answer) = choice.checked_sub(1).and_then(|idx| prompt.options.get(idx)) else {
            return Some("❌ Invalid choice.".to_string());
        };
        let user = msg.user_id.to_string();
        match self.client.check_trivia(&prompt.question, answer).await {
            Ok(result) if result["correct"].as_bool().unwrap_or(false) => {
                let reward = int_or(&result, "reward", 25);
                self.settle(&user, reward, "trivia", "Trivia correct".to_string()).await;
                Some(format!("✅ **Correct!** +{reward} UC"))
            }
            Ok(result) => Some(format!(
                "❌ Wrong! The answer was: **{}**",
                text_or(&result, "correctAnswer", "Unknown")
            )),
            Err(err) => Some(format!("❌ {}", err.message)),
        }
    }

    async fn start_guess(&self, msg: &IncomingMessage) -> String {
        let result = match self.client.generate_number().await {
            Ok(result) => result,
            Err(err) => return format!("❌ {}", err.message),
        };
        let Some(secret) = result["secret"].as_i64() else {
            return "❌ Could not start a game right now.".to_string();
        };
        self.guesses.start(msg.user_id, secret, msg.channel_id);
        "🔢 **Guess the Number**\n\nI'm thinking of a number between 1 and 100.\nYou have 5 attempts!\n\nType a number in chat to guess.".to_string()
    }

    async fn guess_attempt(&self, msg: &IncomingMessage) -> Option<String> {
        let (guess, session) = self
            .guesses
            .begin_attempt(msg.user_id, msg.channel_id, &msg.content)?;
        let result = self
            .client
            .check_guess(session.secret, guess, session.attempts_left)
            .await;
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                self.guesses.finish_attempt(msg.user_id, false);
                return Some(format!("❌ {}", err.message));
            }
        };

        let correct = result["correct"].as_bool().unwrap_or(false);
        self.guesses.finish_attempt(msg.user_id, correct);
        if correct {
            let reward = int_or(&result, "reward", 50);
            self.settle(&msg.user_id.to_string(), reward, "guess", "Number guess".to_string())
                .await;
            Some(format!("🎉 **Correct!** The number was {guess}! **+{reward} UC**"))
        } else if session.attempts_left == 0 {
            Some(format!(
                "❌ Out of attempts! The number was {}.",
                text_or(&result, "answer", &session.secret.to_string())
            ))
        } else {
            Some(format!(
                "{} ({} attempts left)",
                text_or(&result, "hint", "Try again!"),
                session.attempts_left
            ))
        }
    }

    async fn blackjack(&self, user_id: u64) -> String {
        let game = match self.client.start_blackjack(BLACKJACK_BET).await {
            Ok(Value::Object(game)) => game,
            Ok(_) => return "❌ Could not start blackjack.".to_string(),
            Err(err) => return format!("❌ {}", err.message),
        };
        let mut reply = format!(
            "🃏 **Blackjack** (Bet: {BLACKJACK_BET} UC)\n\nYour hand: {} ({})\nDealer: {}",
            map_text(&game, "playerDisplay", "??"),
            map_int(&game, "playerValue", 0),
            map_text(&game, "dealerDisplay", "??"),
        );
        if map_int(&game, "playerValue", 0) == 21 {
            self.settle(&user_id.to_string(), 75, "blackjack", "Blackjack!".to_string())
                .await;
            reply.push_str("\n\n🎉 **BLACKJACK! +75 UC**");
            return reply;
        }
        let lapsed = self.blackjack.purge_expired();
        if lapsed > 0 {
            tracing::debug!(lapsed, "dropped idle blackjack hands");
        }
        self.blackjack.insert(user_id, game);
        reply.push_str(&format!(
            "\n\n`{p}hit` or `{p}stand`",
            p = self.settings.prefix
        ));
        reply
    }

    async fn hit(&self, user_id: u64) -> String {
        let Some(mut game) = self.blackjack.get(user_id) else {
            return "❌ No active blackjack hand.".to_string();
        };
        let deck = game.get("deck").cloned().unwrap_or(Value::Null);
        let hand = game.get("playerHand").cloned().unwrap_or(Value::Null);
        let result = match self.client.blackjack_hit(deck, hand).await {
            Ok(Value::Object(result)) => result,
            Ok(_) => return "❌ Unexpected blackjack response.".to_string(),
            Err(err) => return format!("❌ {}", err.message),
        };
        game.extend(result);
        let mut reply = format!(
            "🃏 **Blackjack** (Bet: {BLACKJACK_BET} UC)\n\nYour hand: {} ({})\nDealer: {}",
            map_text(&game, "playerDisplay", "??"),
            map_int(&game, "playerValue", 0),
            map_text(&game, "dealerDisplay", "??"),
        );
        if game.get("busted").and_then(Value::as_bool).unwrap_or(false) {
            self.blackjack.take(user_id);
            reply.push_str("\n\n💥 **BUST! You lose!**");
        } else {
            self.blackjack.insert(user_id, game);
        }
        reply
    }

    async fn stand(&self, user_id: u64) -> String {
        let Some(game) = self.blackjack.take(user_id) else {
            return "❌ No active blackjack hand.".to_string();
        };
        let result = self
            .client
            .blackjack_stand(
                game.get("deck").cloned().unwrap_or(Value::Null),
                game.get("dealerHand").cloned().unwrap_or(Value::Null),
                map_int(&game, "playerValue", 0),
            )
            .await;
        let result = match result {
            Ok(result) => result,
            Err(err) => return format!("❌ {}", err.message),
        };
        let header = format!(
            "🃏 **Blackjack** (Bet: {BLACKJACK_BET} UC)\n\nYour hand: {} ({})\nDealer: {} ({})\n\n",
            map_text(&game, "playerDisplay", "??"),
            map_int(&game, "playerValue", 0),
            text_or(&result, "dealerDisplay", "??"),
            int_or(&result, "dealerValue", 0),
        );
        let outcome = match result["result"].as_str() {
            Some("win") => {
                let payout = int_or(&result, "payout", 100);
                self.settle(&user_id.to_string(), payout, "blackjack", "Blackjack win".to_string())
                    .await;
                format!("🎉 **You win! +{payout} UC**")
            }
            Some("lose") => "❌ **Dealer wins!**".to_string(),
            _ => "🤝 **Push! Bet returned.**".to_string(),
        };
        header + &outcome
    }

    // ============ admin ============

    /// Allow-listed operators, else backend admins. Supporters do not qualify.
    async fn is_users_admin(&self, user_id: u64) -> bool {
        if self.settings.admin_user_ids.contains(&user_id) {
            return true;
        }
        match self.client.check_admin(&user_id.to_string()).await {
            Ok(result) => result["is_admin"].as_bool().unwrap_or(false),
            Err(err) => {
                tracing::warn!(user_id, error = %err, "admin check failed");
                false
            }
        }
    }

    async fn users(&self, user_id: u64) -> String {
        if !self.is_users_admin(user_id).await {
            return "❌ Admin access required!".to_string();
        }
        let result = match self.client.get_all_users(&user_id.to_string()).await {
            Ok(result) => result,
            Err(err) => return format!("❌ {}", err.message),
        };
        let users = result["users"].as_array().cloned().unwrap_or_default();
        if users.is_empty() {
            return "📋 No registered users found.".to_string();
        }
        let count = int_or(&result, "count", users.len() as i64);
        let mut out = format!("📋 **Registered Users** ({count} total)\n");
        for entry in users.iter().take(USERS_PER_PAGE) {
            out.push_str(&format!(
                "**#{}** — {}\n",
                text_or(entry, "uid_number", "?"),
                text_or(entry, "username", "Unknown"),
            ));
        }
        if users.len() > USERS_PER_PAGE {
            out.push_str(&format!("ℹ️ Showing first {USERS_PER_PAGE} of {count} users."));
        }
        out
    }

    /// Allow-list first, then the backend's admin or supporter flag.
    pub async fn is_reload_admin(&self, user_id: u64) -> bool {
        if self.settings.admin_user_ids.contains(&user_id) {
            return true;
        }
        match self.client.check_admin(&user_id.to_string()).await {
            Ok(result) => {
                result["is_admin"].as_bool().unwrap_or(false)
                    || result["is_supporter"].as_bool().unwrap_or(false)
            }
            Err(err) => {
                tracing::warn!(user_id, error = %err, "admin check failed");
                false
            }
        }
    }

    async fn reload(&self, user_id: u64) -> String {
        if !self.is_reload_admin(user_id).await {
            return "❌ Admin only command. You need to be a UserVault admin or supporter.".to_string();
        }
        let request = ReloadRequest {
            reason: format!("requested by {user_id}"),
        };
        match self.reload_tx.try_send(request) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => "🔄 Reloading commands...".to_string(),
            Err(mpsc::error::TrySendError::Closed(_)) => "❌ Reload is not available right now.".to_string(),
        }
    }
}

pub fn api_stats(client: &UserVaultClient) -> String {
    let stats = client.request_log().snapshot();
    format!(
        "📊 **API Request Statistics**\n\n📡 Total Requests: **{}**\n✅ Successful: **{}**\n❌ Errors: **{}**\n📈 Success Rate: **{:.1}%**",
        stats.count,
        stats.success_count,
        stats.error_count,
        stats.success_rate()
    )
}

/// Missing bet falls back to `default`; anything non-numeric is rejected.
fn parse_bet(arg: Option<&&str>, default: i64) -> Option<i64> {
    match arg {
        None => Some(default),
        Some(raw) => raw.trim().parse().ok(),
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn value_text(value: &Value, default: &str) -> String {
    match value {
        Value::Null => default.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_or(result: &Value, key: &str, default: &str) -> String {
    value_text(result.get(key).unwrap_or(&Value::Null), default)
}

fn int_or(result: &Value, key: &str, default: i64) -> i64 {
    match result.get(key) {
        None | Some(Value::Null) => default,
        Some(value) => coerce_balance(value),
    }
}

fn map_text(game: &Map<String, Value>, key: &str, default: &str) -> String {
    value_text(game.get(key).unwrap_or(&Value::Null), default)
}

fn map_int(game: &Map<String, Value>, key: &str, default: i64) -> i64 {
    game.get(key).map_or(default, coerce_balance)
}

/// Result of calling through to the backend, for the console and CLI.
pub fn render_result(result: &ApiResult) -> String {
    match result {
        Ok(value) => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        Err(err) => format!("error: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::client_for;
    use crate::cache::tests::{descriptor, FakeSource};
    use crate::cache::DEFAULT_TTL;
    use httpmock::prelude::*;
    use serde_json::json;

    const USER: u64 = 42;
    const CHANNEL: u64 = 100;

    fn settings() -> DispatchSettings {
        DispatchSettings {
            prefix: "?".to_string(),
            admin_user_ids: vec![1],
            slash_enabled: false,
            embedded: false,
        }
    }

    async fn dispatcher(
        server: &MockServer,
        registry: Vec<crate::model::CommandDescriptor>,
    ) -> (Dispatcher, mpsc::Receiver<ReloadRequest>) {
        let cache = Arc::new(CommandCache::new(FakeSource::with(registry), DEFAULT_TTL));
        let (tx, rx) = mpsc::channel(1);
        let dispatcher = Dispatcher::new(settings(), Arc::new(client_for(&server.base_url())), cache.clone(), tx);
        let snapshot = cache.get_commands(false).await;
        dispatcher.install(CommandTable::build(&snapshot));
        (dispatcher, rx)
    }

    fn message(content: &str) -> IncomingMessage {
        IncomingMessage {
            user_id: USER,
            channel_id: CHANNEL,
            content: content.to_string(),
        }
    }

    #[test]
    fn table_routes_aliases_and_tracks_registry_state() {
        let mut mines = descriptor("mines", "games");
        mines.enabled = true;
        let mut slots = descriptor("slots", "games");
        slots.enabled = false;
        let snapshot = CommandSnapshot::new(vec![slots, mines, descriptor("Ping", "utility")], None);
        let table = CommandTable::build(&snapshot);

        assert_eq!(table.resolve("HELPING"), Some(Command::Help));
        assert_eq!(table.resolve("coinflip"), Some(Command::Coin));
        assert_eq!(table.resolve("mines"), None);
        assert!(table.is_disabled(Command::Slots));
        assert!(!table.is_disabled(Command::Ping));
        assert_eq!(table.unhandled(), ["mines".to_string()]);
        assert!(CommandTable::slash_commands().contains(&"guess"));
        assert!(!CommandTable::slash_commands().contains(&"reload"));
    }

    #[tokio::test]
    async fn unknown_command_policy() {
        let server = MockServer::start_async().await;
        let (dispatcher, _rx) = dispatcher(&server, vec![descriptor("mines", "games")]).await;

        let reply = dispatcher.handle(&message("?mines 50")).await.unwrap();
        assert!(reply.contains("registered but not available"));
        assert!(dispatcher.handle(&message("?nope")).await.is_none());
        assert!(dispatcher.handle(&message("just chatting")).await.is_none());
        assert_eq!(dispatcher.handle(&message("?PING")).await.unwrap(), "🏓 Pong! Bot is responding.");
    }

    #[tokio::test]
    async fn disabled_command_is_refused() {
        let server = MockServer::start_async().await;
        let mut slots = descriptor("slots", "games");
        slots.enabled = false;
        let (dispatcher, _rx) = dispatcher(&server, vec![slots]).await;
        let reply = dispatcher.handle(&message("?slots")).await.unwrap();
        assert!(reply.contains("currently disabled"));
    }

    #[tokio::test]
    async fn balance_shows_coerced_amount() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/minigame-reward")
                    .json_body(json!({"action": "get_balance", "discordUserId": "42"}));
                then.status(200)
                    .json_body(json!({"balance": "1,234.5", "totalEarned": 9000}));
            })
            .await;
        let (dispatcher, _rx) = dispatcher(&server, vec![]).await;
        let reply = dispatcher.handle(&message("?balance")).await.unwrap();
        assert!(reply.contains("**1234 UC**"));
        assert!(reply.contains("Total Earned: 9000 UC"));
    }

    #[tokio::test]
    async fn bet_limits_are_checked_before_backend() {
        let server = MockServer::start_async().await;
        let (dispatcher, _rx) = dispatcher(&server, vec![]).await;
        assert!(dispatcher.handle(&message("?slots 5")).await.unwrap().contains("Minimum bet"));
        assert!(dispatcher.handle(&message("?coin heads 9999")).await.unwrap().contains("Maximum bet"));
        assert!(dispatcher.handle(&message("?rps lizard")).await.unwrap().contains("Usage"));
        assert_eq!(dispatcher.client.request_log().snapshot().count, 0);
    }

    #[tokio::test]
    async fn guess_game_round_trip() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/minigame-data")
                    .json_body(json!({"action": "generate_number"}));
                then.status(200).json_body(json!({"secret": 37}));
            })
            .await;
        let wrong = server
            .mock_async(|when, then| {
                when.method(POST).path("/minigame-data").json_body(json!({
                    "action": "check_guess", "secret": 37, "guess": 50, "attemptsLeft": 4
                }));
                then.status(200).json_body(json!({"correct": false, "hint": "📉 Lower!"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/minigame-data").json_body(json!({
                    "action": "check_guess", "secret": 37, "guess": 37, "attemptsLeft": 3
                }));
                then.status(200).json_body(json!({"correct": true, "reward": 50}));
            })
            .await;
        let reward = server
            .mock_async(|when, then| {
                when.method(POST).path("/minigame-reward").json_body(json!({
                    "action": "add_uv", "discordUserId": "42", "amount": 50,
                    "gameType": "guess", "description": "Number guess"
                }));
                then.status(200).json_body(json!({"success": true}));
            })
            .await;

        let (dispatcher, _rx) = dispatcher(&server, vec![]).await;
        assert!(dispatcher.handle(&message("?guess")).await.unwrap().contains("Guess the Number"));
        assert_eq!(dispatcher.sessions().len(), 1);

        let hint = dispatcher.handle(&message("50")).await.unwrap();
        assert_eq!(hint, "📉 Lower! (4 attempts left)");
        wrong.assert_async().await;

        let win = dispatcher.handle(&message("37")).await.unwrap();
        assert!(win.contains("+50 UC"));
        reward.assert_async().await;
        assert!(dispatcher.sessions().is_empty());
        assert!(dispatcher.handle(&message("37")).await.is_none());
    }

    #[tokio::test]
    async fn reload_requires_admin() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/minigame-reward")
                    .json_body(json!({"action": "check_admin", "discordUserId": "42"}));
                then.status(200).json_body(json!({"is_admin": false, "is_supporter": false}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/minigame-reward")
                    .json_body(json!({"action": "check_admin", "discordUserId": "7"}));
                then.status(200).json_body(json!({"is_admin": false, "is_supporter": true}));
            })
            .await;
        let (dispatcher, mut rx) = dispatcher(&server, vec![]).await;

        let denied = dispatcher.handle(&message("?reload")).await.unwrap();
        assert!(denied.contains("Admin only"));
        assert!(rx.try_recv().is_err());

        let allowed = IncomingMessage {
            user_id: 1,
            ..message("?reload")
        };
        assert!(dispatcher.handle(&allowed).await.unwrap().contains("Reloading"));
        assert_eq!(rx.try_recv().unwrap().reason, "requested by 1");

        assert!(dispatcher.is_reload_admin(7).await);
    }

    #[tokio::test]
    async fn users_honours_allow_list_before_backend() {
        let server = MockServer::start_async().await;
        let check = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/minigame-reward")
                    .body_contains("\"check_admin\"");
                then.status(200).json_body(json!({"is_admin": false, "is_supporter": true}));
            })
            .await;
        let listing = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/minigame-reward")
                    .json_body(json!({"action": "get_all_users", "discordUserId": "1"}));
                then.status(200).json_body(json!({
                    "count": 1,
                    "users": [{"uid_number": 1, "username": "vault"}]
                }));
            })
            .await;
        let (dispatcher, _rx) = dispatcher(&server, vec![]).await;

        let denied = dispatcher.handle(&message("?users")).await.unwrap();
        assert!(denied.contains("Admin access required"));
        check.assert_hits_async(1).await;

        let operator = IncomingMessage {
            user_id: 1,
            ..message("?users")
        };
        let reply = dispatcher.handle(&operator).await.unwrap();
        assert!(reply.contains("Registered Users"));
        assert!(reply.contains("vault"));
        listing.assert_async().await;
        check.assert_hits_async(1).await;
    }
}
