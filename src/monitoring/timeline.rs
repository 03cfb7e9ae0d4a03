//! Run Timeline
//!
//! Turns a run's step history into timing reports and an ASCII Gantt chart.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::run::{RunSnapshot, StepOutcome};

/// Chart width in characters.
const CHART_WIDTH: f64 = 50.0;

/// One bar of the chart.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub step: String,
    pub outcome: StepOutcome,
    /// Offset from the run's start
    pub offset: Duration,
    pub duration: Duration,
    pub attempts: u32,
}

impl TimelineEntry {
    fn end(&self) -> Duration {
        self.offset + self.duration
    }
}

/// The step timeline of one run.
#[derive(Debug, Clone, Default)]
pub struct RunTimeline {
    entries: Vec<TimelineEntry>,
}

impl RunTimeline {
    /// Builds a timeline from the history recorded in a snapshot.
    pub fn from_snapshot(snapshot: &RunSnapshot) -> Self {
        let origin = snapshot
            .started_at
            .or_else(|| snapshot.history.first().map(|h| h.started_at))
            .unwrap_or(snapshot.submitted_at);

        let entries = snapshot
            .history
            .iter()
            .map(|h| TimelineEntry {
                step: h.step.clone(),
                outcome: h.outcome,
                offset: offset_from(origin, h.started_at),
                duration: h.duration,
                attempts: h.attempts,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Time from the run's start until the last step finished.
    pub fn total(&self) -> Duration {
        self.entries
            .iter()
            .map(TimelineEntry::end)
            .max()
            .unwrap_or_default()
    }

    /// Step durations keyed by step name.
    pub fn durations(&self) -> HashMap<String, Duration> {
        self.entries
            .iter()
            .map(|e| (e.step.clone(), e.duration))
            .collect()
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// Bars use `#` for succeeded steps, `x` for failures and `~` for
    /// timed-out waits.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nRun Timeline:\n\n");

        let total_ms = self.total().as_millis();
        if self.entries.is_empty() {
            return output;
        }
        let scale = if total_ms == 0 {
            0.0
        } else {
            CHART_WIDTH / total_ms as f64
        };

        for entry in &self.entries {
            let start_pos = (entry.offset.as_millis() as f64 * scale) as usize;
            let width = (entry.duration.as_millis() as f64 * scale).max(1.0) as usize;
            let mark = match entry.outcome {
                StepOutcome::Succeeded => "#",
                StepOutcome::Failed => "x",
                StepOutcome::TimedOut => "~",
            };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(width));

            let retries = if entry.attempts > 1 {
                format!(", {} attempts", entry.attempts)
            } else {
                String::new()
            };
            output.push_str(&format!(
                "{} |{:width$}| ({} ms{})\n",
                truncate(&entry.step, 20),
                bar,
                entry.duration.as_millis(),
                retries,
                width = CHART_WIDTH as usize + 1
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_ms));
        output
    }
}

fn offset_from(origin: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - origin).to_std().unwrap_or_default()
}

/// Pads or truncates a label to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
