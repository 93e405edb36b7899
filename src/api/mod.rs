use crate::signing::{self, SignedRequest, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::stats::RequestLog;
use reqwest::{
    header::{HeaderValue, CONTENT_TYPE},
    Body, Client, Method, Request, StatusCode, Url,
};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::{fmt, time::Duration, time::Instant};

const DEFAULT_TIMEOUT_SECS: u64 = 15;

pub type ApiResult = Result<Value, ApiError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub game: String,
    pub reward: String,
    pub verify: String,
    pub notifications: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Game,
    Reward,
    Verify,
    Notifications,
}

impl Endpoint {
    pub fn label(self) -> &'static str {
        match self {
            Self::Game => "minigame-data",
            Self::Reward => "minigame-reward",
            Self::Verify => "bot-verify-code",
            Self::Notifications => "bot-command-notifications",
        }
    }
}

#[derive(Debug)]
struct ParsedEndpoints {
    game: Url,
    reward: Url,
    verify: Url,
    notifications: Url,
}

impl ParsedEndpoints {
    fn parse(endpoints: &Endpoints) -> Result<Self, ClientError> {
        let parse = |raw: &str| Url::parse(raw.trim()).map_err(|err| ClientError::Url(err.to_string()));
        Ok(Self {
            game: parse(&endpoints.game)?,
            reward: parse(&endpoints.reward)?,
            verify: parse(&endpoints.verify)?,
            notifications: parse(&endpoints.notifications)?,
        })
    }

    fn get(&self, endpoint: Endpoint) -> &Url {
        match endpoint {
            Endpoint::Game => &self.game,
            Endpoint::Reward => &self.reward,
            Endpoint::Verify => &self.verify,
            Endpoint::Notifications => &self.notifications,
        }
    }
}

/// Client for the UserVault functions backend.
///
/// Game calls are plain JSON posts. Reward, verify and notification calls are
/// signed with the shared webhook secret. Every outcome, including transport
/// failures, comes back as [`ApiResult`].
pub struct UserVaultClient {
    session: Mutex<Option<Client>>,
    endpoints: ParsedEndpoints,
    webhook_secret: String,
    timeout: Duration,
    log: Arc<RequestLog>,
}

pub struct UserVaultClientBuilder {
    endpoints: Endpoints,
    webhook_secret: String,
    timeout: Duration,
    log: Option<Arc<RequestLog>>,
}

impl UserVaultClientBuilder {
    pub fn new(endpoints: Endpoints, webhook_secret: impl Into<String>) -> Self {
        Self {
            endpoints,
            webhook_secret: webhook_secret.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            log: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn request_log(mut self, log: Arc<RequestLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> Result<UserVaultClient, ClientError> {
        if self.webhook_secret.trim().is_empty() {
            return Err(ClientError::Config("webhook secret must not be empty"));
        }
        Ok(UserVaultClient {
            session: Mutex::new(None),
            endpoints: ParsedEndpoints::parse(&self.endpoints)?,
            webhook_secret: self.webhook_secret,
            timeout: self.timeout,
            log: self.log.unwrap_or_default(),
        })
    }
}

impl UserVaultClient {
    pub fn builder(endpoints: Endpoints, webhook_secret: impl Into<String>) -> UserVaultClientBuilder {
        UserVaultClientBuilder::new(endpoints, webhook_secret)
    }

    pub fn request_log(&self) -> &Arc<RequestLog> {
        &self.log
    }

    /// Returns the pooled HTTP session, creating it if it was never opened or
    /// has been closed.
    fn session(&self) -> Result<Client, ApiError> {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(ApiError::transport)?;
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Drops the pooled session. Safe to call any number of times.
    pub fn close(&self) {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            tracing::debug!("backend http session closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub async fn call_unauthenticated(&self, action: &str, params: Map<String, Value>) -> ApiResult {
        let mut payload = Map::new();
        payload.insert("action".to_string(), Value::from(action));
        payload.extend(params);
        let req = self.build_game_request(&payload)?;
        self.execute(Endpoint::Game, action, None, req).await
    }

    pub async fn call_authenticated(
        &self,
        action: &str,
        subject_id: &str,
        params: Map<String, Value>,
    ) -> ApiResult {
        let mut payload = Map::new();
        payload.insert("action".to_string(), Value::from(action));
        payload.insert("discordUserId".to_string(), Value::from(subject_id));
        payload.extend(params);
        self.call_signed(Endpoint::Reward, payload, Some(subject_id))
            .await
    }

    pub async fn call_signed(
        &self,
        endpoint: Endpoint,
        payload: Map<String, Value>,
        subject_id: Option<&str>,
    ) -> ApiResult {
        let signed = SignedRequest::new(&self.webhook_secret, payload, signing::now_ms());
        let action = signed.action.clone();
        let req = self.build_signed_request(endpoint, signed)?;
        self.execute(endpoint, &action, subject_id, req).await
    }

    pub fn build_game_request(&self, payload: &Map<String, Value>) -> Result<Request, ApiError> {
        let body = signing::canonical_json(payload);
        Ok(json_post(self.endpoints.get(Endpoint::Game).clone(), body.into_bytes()))
    }

    pub fn build_signed_request(
        &self,
        endpoint: Endpoint,
        signed: SignedRequest,
    ) -> Result<Request, ApiError> {
        let signature = HeaderValue::from_str(&signed.signature)
            .map_err(|err| ApiError::new(format!("invalid signature header: {err}")))?;
        let timestamp = HeaderValue::from(signed.timestamp);
        let mut req = json_post(self.endpoints.get(endpoint).clone(), signed.into_body());
        req.headers_mut().insert(SIGNATURE_HEADER, signature);
        req.headers_mut().insert(TIMESTAMP_HEADER, timestamp);
        Ok(req)
    }

    async fn execute(
        &self,
        endpoint: Endpoint,
        action: &str,
        subject_id: Option<&str>,
        req: Request,
    ) -> ApiResult {
        self.log.request_start(endpoint.label(), action, subject_id);
        let started = Instant::now();
        let result = self.send(req).await;
        let latency = started.elapsed();
        match &result {
            Ok(value) => self.log.request_success(action, latency, &value.to_string()),
            Err(err) => self.log.request_error(action, latency, &err.to_string()),
        }
        result
    }

    async fn send(&self, req: Request) -> ApiResult {
        let http = self.session()?;
        let resp = http.execute(req).await.map_err(ApiError::transport)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ApiError::transport)?;
        parse_response(status, &body)
    }

    // ============ game calls ============

    pub async fn get_available_games(&self) -> ApiResult {
        self.call_unauthenticated("get_games", Map::new()).await
    }

    pub async fn get_all_commands(&self) -> ApiResult {
        self.call_unauthenticated("get_commands", Map::new()).await
    }

    pub async fn get_bot_commands(&self) -> ApiResult {
        self.call_unauthenticated("get_bot_commands", Map::new()).await
    }

    pub async fn lookup_profile(&self, username: &str) -> ApiResult {
        self.call_unauthenticated("lookup_profile", params([("username", username.into())]))
            .await
    }

    pub async fn get_trivia(&self) -> ApiResult {
        self.call_unauthenticated("get_trivia", Map::new()).await
    }

    pub async fn check_trivia(&self, question: &str, answer: &str) -> ApiResult {
        self.call_unauthenticated(
            "check_trivia",
            params([("question", question.into()), ("answer", answer.into())]),
        )
        .await
    }

    pub async fn spin_slots(&self) -> ApiResult {
        self.call_unauthenticated("spin_slots", Map::new()).await
    }

    pub async fn flip_coin(&self) -> ApiResult {
        self.call_unauthenticated("coin_flip", Map::new()).await
    }

    pub async fn play_rps(&self, choice: &str) -> ApiResult {
        self.call_unauthenticated("play_rps", params([("choice", choice.into())]))
            .await
    }

    pub async fn generate_number(&self) -> ApiResult {
        self.call_unauthenticated("generate_number", Map::new()).await
    }

    pub async fn check_guess(&self, secret: i64, guess: i64, attempts_left: u32) -> ApiResult {
        self.call_unauthenticated(
            "check_guess",
            params([
                ("secret", secret.into()),
                ("guess", guess.into()),
                ("attemptsLeft", attempts_left.into()),
            ]),
        )
        .await
    }

    pub async fn start_blackjack(&self, bet: i64) -> ApiResult {
        self.call_unauthenticated("start_blackjack", params([("bet", bet.into())]))
            .await
    }

    pub async fn blackjack_hit(&self, deck: Value, player_hand: Value) -> ApiResult {
        self.call_unauthenticated(
            "blackjack_hit",
            params([("deck", deck), ("playerHand", player_hand)]),
        )
        .await
    }

    pub async fn blackjack_stand(&self, deck: Value, dealer_hand: Value, player_value: i64) -> ApiResult {
        self.call_unauthenticated(
            "blackjack_stand",
            params([
                ("deck", deck),
                ("dealerHand", dealer_hand),
                ("playerValue", player_value.into()),
            ]),
        )
        .await
    }

    pub async fn get_game_config(&self) -> ApiResult {
        self.call_unauthenticated("get_config", Map::new()).await
    }

    // ============ signed calls ============

    pub async fn send_reward(
        &self,
        discord_user_id: &str,
        amount: i64,
        game_type: &str,
        description: &str,
    ) -> ApiResult {
        self.call_authenticated(
            "add_uv",
            discord_user_id,
            params([
                ("amount", amount.into()),
                ("gameType", game_type.into()),
                ("description", description.into()),
            ]),
        )
        .await
    }

    pub async fn get_balance(&self, discord_user_id: &str) -> ApiResult {
        self.call_authenticated("get_balance", discord_user_id, Map::new())
            .await
    }

    pub async fn claim_daily(&self, discord_user_id: &str) -> ApiResult {
        self.call_authenticated("daily_reward", discord_user_id, Map::new())
            .await
    }

    pub async fn get_profile(&self, discord_user_id: &str) -> ApiResult {
        self.call_authenticated("get_profile", discord_user_id, Map::new())
            .await
    }

    pub async fn unlink_account(&self, discord_user_id: &str) -> ApiResult {
        self.call_authenticated("unlink_account", discord_user_id, Map::new())
            .await
    }

    pub async fn delete_account(&self, discord_user_id: &str) -> ApiResult {
        self.call_authenticated("delete_account", discord_user_id, Map::new())
            .await
    }

    pub async fn check_admin(&self, discord_user_id: &str) -> ApiResult {
        self.call_authenticated("check_admin", discord_user_id, Map::new())
            .await
    }

    pub async fn get_all_users(&self, discord_user_id: &str) -> ApiResult {
        self.call_authenticated("get_all_users", discord_user_id, Map::new())
            .await
    }

    pub async fn link_account(&self, discord_user_id: &str, code: &str) -> ApiResult {
        let payload = params([
            ("action", "verify".into()),
            ("code", code.trim().to_uppercase().into()),
            ("discordUserId", discord_user_id.into()),
        ]);
        self.call_signed(Endpoint::Verify, payload, Some(discord_user_id))
            .await
    }

    pub async fn get_pending_notifications(&self) -> ApiResult {
        self.call_signed(
            Endpoint::Notifications,
            params([("action", "get_pending".into())]),
            None,
        )
        .await
    }

    pub async fn mark_notification_processed(&self, notification_id: &str) -> ApiResult {
        self.call_signed(
            Endpoint::Notifications,
            params([
                ("action", "mark_processed".into()),
                ("notificationId", notification_id.into()),
            ]),
            None,
        )
        .await
    }
}

fn json_post(url: Url, body: Vec<u8>) -> Request {
    let mut req = Request::new(Method::POST, url);
    req.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    *req.body_mut() = Some(Body::from(body));
    req
}

pub fn params<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Folds HTTP status, JSON validity and the backend's `error` field into one
/// result.
pub fn parse_response(status: StatusCode, body: &str) -> ApiResult {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(err) => {
            let message = if status.is_success() {
                format!("invalid response body: {err}")
            } else {
                format!("HTTP {}", status.as_u16())
            };
            return Err(ApiError::with_status(message, status));
        }
    };

    if let Some(message) = error_message(&value) {
        return Err(ApiError::with_status(message, status));
    }
    if !status.is_success() {
        return Err(ApiError::with_status(format!("HTTP {}", status.as_u16()), status));
    }
    Ok(value)
}

fn error_message(value: &Value) -> Option<String> {
    match value.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Backend balances may arrive as numbers, numeric strings, strings with
/// thousands separators or decimals. Fractions are truncated; anything else
/// is 0.
pub fn coerce_balance(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| i64::try_from(u).unwrap_or(i64::MAX)))
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
            let integer = cleaned.split('.').next().unwrap_or_default();
            integer.parse().unwrap_or_else(|_| saturate_integer(integer))
        }
        _ => 0,
    }
}

/// Clamps a well-formed integer too wide for `i64` to the matching bound.
/// Anything that is not an integer is 0.
fn saturate_integer(text: &str) -> i64 {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    if negative {
        i64::MIN
    } else {
        i64::MAX
    }
}

/// The single failure shape every backend call is folded into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub message: String,
    pub status: Option<u16>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    fn with_status(message: impl Into<String>, status: StatusCode) -> Self {
        Self {
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }

    fn transport(err: reqwest::Error) -> Self {
        Self {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} [HTTP {}]", self.message, status),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug)]
pub enum ClientError {
    Config(&'static str),
    Url(String),
    Http(reqwest::Error),
    InvalidHeaderValue(reqwest::header::InvalidHeaderValue),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Url(err) => write!(f, "url error: {err}"),
            Self::Http(err) => write!(f, "http client error: {err}"),
            Self::InvalidHeaderValue(err) => write!(f, "invalid header value: {err}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err)
    }
}

impl From<reqwest::header::InvalidHeaderValue> for ClientError {
    fn from(err: reqwest::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeaderValue(err)
    }
}
