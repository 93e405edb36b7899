use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const GUESS_ATTEMPTS: u32 = 5;
pub const GUESS_RANGE: RangeInclusive<i64> = 1..=100;
pub const BLACKJACK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuessSession {
    pub secret: i64,
    pub attempts_left: u32,
    pub channel_id: u64,
}

/// Active number-guess games, one per user.
#[derive(Debug, Default)]
pub struct GuessSessions {
    inner: Mutex<HashMap<u64, GuessSession>>,
}

impl GuessSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, GuessSession>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starting again replaces any running game for the same user.
    pub fn start(&self, user_id: u64, secret: i64, channel_id: u64) -> Option<GuessSession> {
        self.lock().insert(
            user_id,
            GuessSession {
                secret,
                attempts_left: GUESS_ATTEMPTS,
                channel_id,
            },
        )
    }

    pub fn get(&self, user_id: u64) -> Option<GuessSession> {
        self.lock().get(&user_id).cloned()
    }

    /// Spends one attempt if `text` is an in-range number typed in the game's
    /// channel. Returns the session as it stands after the attempt.
    pub fn begin_attempt(&self, user_id: u64, channel_id: u64, text: &str) -> Option<(i64, GuessSession)> {
        let guess: i64 = text.trim().parse().ok()?;
        if !GUESS_RANGE.contains(&guess) {
            return None;
        }
        let mut sessions = self.lock();
        let session = sessions.get_mut(&user_id)?;
        if session.channel_id != channel_id || session.attempts_left == 0 {
            return None;
        }
        session.attempts_left -= 1;
        Some((guess, session.clone()))
    }

    /// Ends the game on a correct guess or when no attempts remain. Returns
    /// whether the session was removed.
    pub fn finish_attempt(&self, user_id: u64, correct: bool) -> bool {
        let mut sessions = self.lock();
        let done = match sessions.get(&user_id) {
            Some(session) => correct || session.attempts_left == 0,
            None => return false,
        };
        if done {
            sessions.remove(&user_id);
        }
        done
    }

    pub fn remove(&self, user_id: u64) -> Option<GuessSession> {
        self.lock().remove(&user_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct TimedEntry<T> {
    state: T,
    touched: Instant,
}

/// Per-user interactive state that lapses after `timeout` without use.
/// Expiry is checked lazily on access.
pub struct ViewTimers<T> {
    timeout: Duration,
    inner: Mutex<HashMap<u64, TimedEntry<T>>>,
}

impl<T: Clone> ViewTimers<T> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Stores state for the user and restarts their timer.
    pub fn insert(&self, user_id: u64, state: T) {
        let entry = TimedEntry {
            state,
            touched: Instant::now(),
        };
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, entry);
    }

    pub fn get(&self, user_id: u64) -> Option<T> {
        let mut views = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match views.get(&user_id) {
            Some(entry) if entry.touched.elapsed() < self.timeout => Some(entry.state.clone()),
            Some(_) => {
                views.remove(&user_id);
                None
            }
            None => None,
        }
    }

    pub fn take(&self, user_id: u64) -> Option<T> {
        let entry = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id)?;
        (entry.touched.elapsed() < self.timeout).then_some(entry.state)
    }

    /// Drops every lapsed entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut views = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = views.len();
        views.retain(|_, entry| entry.touched.elapsed() < self.timeout);
        before - views.len()
    }
}
