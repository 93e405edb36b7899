use crate::exporters::RequestExporter;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl RequestStats {
    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.count as f64 * 100.0
    }
}

impl fmt::Display for RequestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requests | {} success | {} errors | {:.1}% success rate",
            self.count,
            self.success_count,
            self.error_count,
            self.success_rate()
        )
    }
}

/// Process-lifetime request counters. Shared behind an `Arc`.
#[derive(Default)]
pub struct RequestLog {
    count: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    exporter: Option<RequestExporter>,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exporter(exporter: RequestExporter) -> Self {
        Self {
            exporter: Some(exporter),
            ..Self::default()
        }
    }

    /// Counts the request and returns its sequence number.
    pub fn request_start(&self, endpoint: &str, action: &str, user_id: Option<&str>) -> u64 {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            request = n,
            endpoint,
            action,
            user_id = user_id.unwrap_or("-"),
            "backend request"
        );
        n
    }

    pub fn request_success(&self, action: &str, latency: Duration, response: &str) {
        self.record(Outcome::Success, action, latency, response);
    }

    pub fn request_error(&self, action: &str, latency: Duration, error: &str) {
        self.record(Outcome::Error, action, latency, error);
    }

    pub fn record(&self, outcome: Outcome, action: &str, latency: Duration, detail: &str) {
        let latency_ms = latency.as_millis() as u64;
        match outcome {
            Outcome::Success => {
                self.success_count.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    action,
                    latency_ms,
                    preview = %preview(detail, PREVIEW_CHARS),
                    "backend request succeeded"
                );
            }
            Outcome::Error => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    action,
                    latency_ms,
                    error = %preview(detail, PREVIEW_CHARS),
                    "backend request failed"
                );
            }
        }
        if let Some(exporter) = &self.exporter {
            exporter.record(outcome, action, latency);
        }
    }

    pub fn snapshot(&self) -> RequestStats {
        RequestStats {
            count: self.count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

/// Truncates on a char boundary.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let log = RequestLog::new();
        log.request_start("minigame-data", "spin_slots", None);
        log.request_success("spin_slots", Duration::from_millis(12), "{}");
        log.request_start("minigame-reward", "add_uv", Some("42"));
        log.request_error("add_uv", Duration::from_millis(30), "Invalid signature");
        log.request_start("minigame-reward", "get_balance", Some("42"));
        log.request_success("get_balance", Duration::from_millis(5), "{\"balance\":1}");

        let stats = log.snapshot();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.error_count, 1);
        assert!((stats.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn empty_stats_have_zero_rate() {
        let stats = RequestLog::new().snapshot();
        assert_eq!(stats.success_rate(), 0.0);
        assert!(stats.to_string().starts_with("0 requests"));
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "ü".repeat(150);
        let out = preview(&long, PREVIEW_CHARS);
        assert_eq!(out.chars().count(), PREVIEW_CHARS + 3);
        assert_eq!(preview("short", PREVIEW_CHARS), "short");
    }
}
