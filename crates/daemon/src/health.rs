//! Health event classification for engine output.
//!
//! The engine writes free-form diagnostics to stderr. This module turns that
//! stream into structured [`HealthEvent`]s via an ordered, data-driven rule
//! table: each rule is a set of marker substrings mapped to a severity,
//! category, and fatality flag. The first matching rule wins; lines matching
//! no rule and carrying no severity word are informational noise and produce
//! no event. Matching is a linear scan over a lowercased copy of the line.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Severity of a classified health event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Output indicating the pipeline is producing data.
    Ok,
    /// Degradation that does not stop the stream.
    Warning,
    /// A condition that kills or will kill the stream.
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Ok => write!(f, "ok"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Broad category of a classified health event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Network,
    Codec,
    Resource,
    Unknown,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Network => write!(f, "network"),
            Category::Codec => write!(f, "codec"),
            Category::Resource => write!(f, "resource"),
            Category::Unknown => write!(f, "unknown"),
        }
    }
}

/// A classified signal derived from one line of engine output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    /// Unix timestamp in milliseconds when the line was classified.
    pub timestamp_ms: i64,
    pub severity: Severity,
    pub category: Category,
    /// Fatal conditions are never auto-retried.
    pub fatal: bool,
    /// The raw line that produced this event.
    pub detail: String,
}

impl HealthEvent {
    /// Whether this event represents a transient condition eligible for
    /// automatic restart.
    pub fn is_retryable(&self) -> bool {
        self.severity == Severity::Error && !self.fatal
    }
}

/// One entry of the ordered classification table.
struct ClassifyRule {
    markers: &'static [&'static str],
    severity: Severity,
    category: Category,
    fatal: bool,
}

/// Ordered classification rules; the first matching rule wins.
///
/// Fatal markers come first so a line mentioning both a fatal and a
/// transient condition is never treated as retryable.
const RULES: &[ClassifyRule] = &[
    // Bad input data or rejected arguments: operator must fix the spec.
    ClassifyRule {
        markers: &[
            "invalid data found when processing input",
            "invalid argument",
            "unrecognized option",
            "option not found",
            "conversion failed",
        ],
        severity: Severity::Error,
        category: Category::Codec,
        fatal: true,
    },
    // Local address conflicts: retrying cannot succeed while the port is held.
    ClassifyRule {
        markers: &["address already in use", "bind failed", "failed to bind"],
        severity: Severity::Error,
        category: Category::Network,
        fatal: true,
    },
    // Permission and missing-file conditions.
    ClassifyRule {
        markers: &[
            "permission denied",
            "operation not permitted",
            "no such file or directory",
            "protocol not found",
        ],
        severity: Severity::Error,
        category: Category::Unknown,
        fatal: true,
    },
    // Transient transport failures: eligible for automatic restart.
    ClassifyRule {
        markers: &[
            "connection refused",
            "connection reset",
            "connection timed out",
            "network is unreachable",
            "host is unreachable",
            "input/output error",
            "i/o error",
            "broken pipe",
            "timed out",
            "end of file",
        ],
        severity: Severity::Error,
        category: Category::Network,
        fatal: false,
    },
    // Quality degradation that does not stop the process.
    ClassifyRule {
        markers: &[
            "frame dropped",
            "dropping frame",
            "frame drop",
            "buffer underflow",
            "buffer underrun",
            "underrun",
            "non-monotonous dts",
            "non-monotonic dts",
            "past duration",
            "packet corrupt",
            "desync",
            "dup!",
        ],
        severity: Severity::Warning,
        category: Category::Resource,
        fatal: false,
    },
    // Output negotiation and progress lines: evidence of a healthy pipeline.
    ClassifyRule {
        markers: &["stream mapping:", "output #0", "frame=", "speed="],
        severity: Severity::Ok,
        category: Category::Unknown,
        fatal: false,
    },
];

/// Severity words that mark an otherwise-unrecognized diagnostic line.
const SEVERITY_WORDS: &[&str] = &["error", "warning", "failed"];

/// Classification of a single line: the winning rule plus a coalescing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineClass {
    pub severity: Severity,
    pub category: Category,
    pub fatal: bool,
    /// Index of the winning rule, used to coalesce duplicates.
    key: usize,
}

/// Classify one line of engine output.
///
/// Returns `None` for informational noise. Unrecognized lines carrying a
/// severity word classify as warning/unknown and are never escalated to an
/// error on their own.
pub fn classify_line(line: &str) -> Option<LineClass> {
    let lower = line.to_lowercase();

    for (key, rule) in RULES.iter().enumerate() {
        if rule.markers.iter().any(|m| lower.contains(m)) {
            return Some(LineClass {
                severity: rule.severity,
                category: rule.category,
                fatal: rule.fatal,
                key,
            });
        }
    }

    if SEVERITY_WORDS.iter().any(|w| lower.contains(w)) {
        return Some(LineClass {
            severity: Severity::Warning,
            category: Category::Unknown,
            fatal: false,
            key: RULES.len(),
        });
    }

    None
}

/// Stateful per-job parser wrapping [`classify_line`] with duplicate
/// coalescing.
///
/// Repeated ok/warning events from the same rule within the coalescing
/// window are suppressed so a stuttering input cannot flood the event ring.
/// Errors are never coalesced.
pub struct HealthParser {
    coalesce_window: Duration,
    last_emitted: Option<(usize, Instant)>,
}

impl HealthParser {
    pub fn new(coalesce_window: Duration) -> Self {
        Self {
            coalesce_window,
            last_emitted: None,
        }
    }

    /// Classify a line, applying duplicate coalescing against the current time.
    pub fn parse(&mut self, line: &str) -> Option<HealthEvent> {
        self.parse_at(line, Instant::now())
    }

    /// Classification with an explicit clock, extracted for tests.
    pub fn parse_at(&mut self, line: &str, now: Instant) -> Option<HealthEvent> {
        let class = classify_line(line)?;

        if class.severity != Severity::Error {
            if let Some((key, at)) = self.last_emitted {
                if key == class.key && now.duration_since(at) < self.coalesce_window {
                    return None;
                }
            }
        }
        self.last_emitted = Some((class.key, now));

        Some(HealthEvent {
            timestamp_ms: current_timestamp_ms(),
            severity: class.severity,
            category: class.category,
            fatal: class.fatal,
            detail: line.trim().to_string(),
        })
    }
}

/// Bounded, append-only ring of the most recent health events for one job.
///
/// Oldest events are discarded once capacity is reached; monitoring is
/// best-effort and lossy by design.
#[derive(Debug, Clone)]
pub struct EventRing {
    cap: usize,
    events: VecDeque<HealthEvent>,
}

impl EventRing {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            events: VecDeque::new(),
        }
    }

    pub fn push(&mut self, event: HealthEvent) {
        self.events.push_back(event);
        while self.events.len() > self.cap {
            self.events.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last(&self) -> Option<&HealthEvent> {
        self.events.back()
    }

    /// The most recent `n` events in chronological order.
    pub fn recent(&self, n: usize) -> Vec<HealthEvent> {
        let start = self.events.len().saturating_sub(n);
        self.events.iter().skip(start).cloned().collect()
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
