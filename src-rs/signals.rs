//! Turns raw OCR text into the signals the control loop acts on.
//!
//! OCR output is noisy. All tolerance for that noise lives here: progress
//! text is mapped onto a closed [`Marker`] set, and numbers are pulled out
//! with one pattern per readout shape. A missing match is "no signal", never
//! zero.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::time::Duration;

static AMOUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$?\s*(\d+)").unwrap());
static TIMER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":\s*(\d+)").unwrap());

/// State-transition trigger recognized in the progress readout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    None,
    Checkpoint,
    AmountCheck,
    Completion,
}

/// The three marker strings for one target app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerSet {
    pub completion: String,
    pub checkpoint: String,
    pub amount_check: String,
}

impl MarkerSet {
    pub fn new(
        completion: impl Into<String>,
        checkpoint: impl Into<String>,
        amount_check: impl Into<String>,
    ) -> Self {
        Self {
            completion: completion.into(),
            checkpoint: checkpoint.into(),
            amount_check: amount_check.into(),
        }
    }

    /// Completion wins over checkpoint, checkpoint over amount check.
    /// Whitespace inside the readout is ignored so `"10 / 20"` still matches.
    pub fn classify(&self, text: &str) -> Marker {
        let compact = squash(text);
        if compact.is_empty() {
            return Marker::None;
        }
        let hit = |marker: &str| {
            let needle = squash(marker);
            !needle.is_empty() && compact.contains(&needle)
        };
        if hit(&self.completion) {
            Marker::Completion
        } else if hit(&self.checkpoint) {
            Marker::Checkpoint
        } else if hit(&self.amount_check) {
            Marker::AmountCheck
        } else {
            Marker::None
        }
    }

    /// Only the completion marker counts; used after the timer checkpoint.
    pub fn is_completion(&self, text: &str) -> bool {
        self.classify(text) == Marker::Completion
    }
}

fn squash(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// First digit run, optionally behind a `$`: `"$123"`, `"123"`, `" 123 "` → 123.
pub fn parse_amount(text: &str) -> Option<u32> {
    AMOUNT_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Seconds part of a `m:ss` style readout: `"00:07"` → 7.
pub fn parse_timer_seconds(text: &str) -> Option<u32> {
    TIMER_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// `1h 2m 3s`, dropping zero-valued leading units.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}
