//! Multi-signal prompt detection over one session's output stream.
//!
//! Three signals feed one detector: pattern matches on the output tail
//! (HIGH), a blocked-on-read probe (MEDIUM) and plain silence (LOW). A stall
//! produces at most one event; a stronger signal arriving for the same stall
//! refines that event instead of creating another.

mod ansi;
mod patterns;
mod sanitize;

pub use ansi::strip_ansi;
pub use patterns::{PatternCatalogue, PatternMatch};
pub use sanitize::{redact_secrets, sanitize_excerpt};

use chrono::Utc;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::DetectorConfig;
use crate::prompt::{
    Choice, Confidence, ConfidenceTier, DetectionSignal, PromptEvent, PromptType, Refinement,
    excerpt_fingerprint,
};

const MAX_PARTIAL_BYTES: usize = 4096;
const BLOCKED_READ_SCORE: f64 = 0.6;
const SILENCE_SCORE: f64 = 0.3;

/// Rolling window over the most recent output: complete lines plus the
/// unterminated line the cursor sits on.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    partial: String,
    max_lines: usize,
    /// Lines completed since the tail was created.
    completed: u64,
}

impl OutputTail {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines + 1),
            partial: String::new(),
            max_lines: max_lines.max(1),
            completed: 0,
        }
    }

    pub fn push(&mut self, text: &str) {
        let mut rest = text;
        while let Some(pos) = rest.find('\n') {
            self.partial.push_str(&rest[..pos]);
            self.lines.push_back(std::mem::take(&mut self.partial));
            self.completed += 1;
            if self.lines.len() > self.max_lines {
                self.lines.pop_front();
            }
            rest = &rest[pos + 1..];
        }
        self.partial.push_str(rest);

        if self.partial.len() > MAX_PARTIAL_BYTES {
            let mut cut = self.partial.len() - MAX_PARTIAL_BYTES;
            while !self.partial.is_char_boundary(cut) {
                cut += 1;
            }
            self.partial.drain(..cut);
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Lines completed after the `mark` taken from [`OutputTail::completed`],
    /// or `None` when some of them have already scrolled out.
    pub fn completed_since(&self, mark: u64) -> Option<impl Iterator<Item = &str>> {
        let count = usize::try_from(self.completed.saturating_sub(mark)).ok()?;
        let skip = self.lines.len().checked_sub(count)?;
        Some(self.lines.iter().skip(skip).map(String::as_str))
    }

    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// Complete lines then the partial line, blank ones skipped.
    pub fn non_empty_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.partial.as_str()))
            .filter(|line| !line.trim().is_empty())
            .collect()
    }

    /// Fingerprint of the last non-empty line.
    pub fn anchor(&self) -> String {
        let last = self.non_empty_lines().last().copied().unwrap_or_default();
        excerpt_fingerprint(last)
    }

    pub fn text(&self) -> String {
        self.non_empty_lines().join("\n")
    }
}

/// What the detector hands to the router.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOutput {
    Created(PromptEvent),
    Refined(PromptEvent),
}

impl DetectorOutput {
    pub fn event(&self) -> &PromptEvent {
        match self {
            Self::Created(event) | Self::Refined(event) => event,
        }
    }
}

/// The event currently standing for the latest stall.
#[derive(Debug, Clone)]
struct Episode {
    event: PromptEvent,
    detected_at: Instant,
    /// Output sequence number when the event was produced or last confirmed.
    output_seq: u64,
    /// Fingerprint of the last line when the prompt was seen.
    anchor: String,
    /// `OutputTail::completed` when the prompt was seen.
    lines_at: u64,
}

impl Episode {
    /// Output since the prompt was seen only repainted the prompt line.
    /// Anything else on a finished line means the process moved on.
    fn is_redraw(&self, tail: &OutputTail) -> bool {
        self.event.confidence.tier == ConfidenceTier::High
            && self.anchor == tail.anchor()
            && tail.completed_since(self.lines_at).is_some_and(|mut lines| {
                lines.all(|line| line.trim().is_empty() || excerpt_fingerprint(line) == self.anchor)
            })
    }
}

pub struct PromptDetector {
    session_id: String,
    catalogue: PatternCatalogue,
    tail: OutputTail,
    silence_threshold: Duration,
    blocked_read_min_idle: Duration,
    tie_break_window: Duration,
    excerpt_max_chars: usize,
    last_output: Instant,
    output_seq: u64,
    episode: Option<Episode>,
}

impl PromptDetector {
    pub fn new(
        session_id: impl Into<String>,
        config: &DetectorConfig,
        now: Instant,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            session_id: session_id.into(),
            catalogue: PatternCatalogue::new()?,
            tail: OutputTail::new(config.tail_lines),
            silence_threshold: config.silence_threshold(),
            blocked_read_min_idle: config.blocked_read_min_idle(),
            tie_break_window: config.tie_break_window(),
            excerpt_max_chars: config.excerpt_max_chars,
            last_output: now,
            output_seq: 0,
            episode: None,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_output)
    }

    /// Feed an ANSI-stripped chunk of output.
    pub fn on_output(&mut self, text: &str, now: Instant) -> Option<DetectorOutput> {
        self.tail.push(text);
        if text.trim().is_empty() {
            return None;
        }
        self.last_output = now;
        self.output_seq += 1;

        let found = self.catalogue.match_tail(&self.tail)?;
        let excerpt = sanitize_excerpt(&self.tail.text(), self.excerpt_max_chars);
        let confidence = Confidence::new(ConfidenceTier::High, found.score);
        let signal = DetectionSignal::Pattern {
            matcher: found.matcher.to_string(),
        };

        if let Some(episode) = self.episode.as_mut() {
            if episode.is_redraw(&self.tail) {
                episode.output_seq = self.output_seq;
                episode.lines_at = self.tail.completed();
                return None;
            }
            let weaker = episode.event.confidence.tier < ConfidenceTier::High;
            let recent = now.saturating_duration_since(episode.detected_at) <= self.tie_break_window;
            if weaker && recent {
                let refined = episode.event.refined(Refinement {
                    confidence,
                    signal,
                    prompt_type: found.prompt_type,
                    excerpt,
                    choices: found.choices,
                });
                episode.event = refined.clone();
                episode.output_seq = self.output_seq;
                tracing::debug!(prompt_id = %refined.id, session_id = %self.session_id, "prompt.refined");
                return Some(DetectorOutput::Refined(refined));
            }
        }

        let event = self.new_event(found.prompt_type, excerpt, found.choices, confidence, signal);
        Some(self.open_episode(event, now))
    }

    /// Periodic liveness probe. `blocked` is the supervisor's
    /// blocked-on-read answer at `now`.
    pub fn on_probe(&mut self, blocked: bool, now: Instant) -> Option<DetectorOutput> {
        let idle = self.idle_for(now);
        let blocked_signal = blocked && idle >= self.blocked_read_min_idle;
        let silent = self.output_seq > 0 && idle >= self.silence_threshold;

        if let Some(episode) = self.episode.as_mut()
            && episode.output_seq == self.output_seq
        {
            // This stall already has an event; only a stronger signal matters.
            if blocked_signal && episode.event.confidence.tier < ConfidenceTier::Medium {
                let (prompt_type, choices) = self.catalogue.infer(&self.tail);
                let refined = episode.event.refined(Refinement {
                    confidence: Confidence::new(ConfidenceTier::Medium, BLOCKED_READ_SCORE),
                    signal: DetectionSignal::BlockedRead {
                        idle_ms: duration_ms(idle),
                    },
                    prompt_type,
                    excerpt: episode.event.excerpt.clone(),
                    choices,
                });
                episode.event = refined.clone();
                tracing::debug!(prompt_id = %refined.id, session_id = %self.session_id, "prompt.refined");
                return Some(DetectorOutput::Refined(refined));
            }
            return None;
        }

        let (tier, score, signal) = if blocked_signal {
            (
                ConfidenceTier::Medium,
                BLOCKED_READ_SCORE,
                DetectionSignal::BlockedRead {
                    idle_ms: duration_ms(idle),
                },
            )
        } else if silent {
            (
                ConfidenceTier::Low,
                SILENCE_SCORE,
                DetectionSignal::Silence {
                    idle_ms: duration_ms(idle),
                },
            )
        } else {
            return None;
        };

        let (prompt_type, choices) = self.catalogue.infer(&self.tail);
        let excerpt = sanitize_excerpt(&self.tail.text(), self.excerpt_max_chars);
        let event = self.new_event(
            prompt_type,
            excerpt,
            choices,
            Confidence::new(tier, score),
            signal,
        );
        Some(self.open_episode(event, now))
    }

    fn new_event(
        &self,
        prompt_type: PromptType,
        excerpt: String,
        choices: Vec<Choice>,
        confidence: Confidence,
        signal: DetectionSignal,
    ) -> PromptEvent {
        PromptEvent {
            id: Uuid::new_v4(),
            session_id: self.session_id.clone(),
            prompt_type,
            excerpt,
            choices,
            confidence,
            signal,
            created_at: Utc::now(),
        }
    }

    fn open_episode(&mut self, event: PromptEvent, now: Instant) -> DetectorOutput {
        tracing::info!(
            prompt_id = %event.id,
            session_id = %self.session_id,
            prompt_type = %event.prompt_type,
            signal = event.signal.name(),
            tier = %event.confidence.tier,
            "prompt.created"
        );
        self.episode = Some(Episode {
            event: event.clone(),
            detected_at: now,
            output_seq: self.output_seq,
            anchor: self.tail.anchor(),
            lines_at: self.tail.completed(),
        });
        DetectorOutput::Created(event)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
