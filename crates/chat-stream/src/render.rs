use std::time::Duration;

use crate::errors::ChatError;

/// Text already shown to the user plus text received but not yet shown.
///
/// Only the network side calls [`RenderBuffer::push_pending`]; only the
/// display side calls [`RenderBuffer::promote`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderBuffer {
    displayed: String,
    pending: String,
    pending_chars: usize,
}

impl RenderBuffer {
    /// Appends a received fragment to the pending side.
    pub fn push_pending(&mut self, text: &str) {
        self.pending.push_str(text);
        self.pending_chars += text.chars().count();
    }

    /// Moves up to `max_chars` characters from the front of pending to the end
    /// of displayed. Returns `true` when anything moved.
    pub fn promote(&mut self, max_chars: usize) -> bool {
        if self.pending.is_empty() || max_chars == 0 {
            return false;
        }
        let mut split = self.pending.len();
        let mut moved = 0;
        for (count, (idx, _)) in self.pending.char_indices().enumerate() {
            if count == max_chars {
                split = idx;
                break;
            }
            moved += 1;
        }
        self.displayed.push_str(&self.pending[..split]);
        self.pending.drain(..split);
        self.pending_chars -= moved;
        true
    }

    /// Text shown so far.
    pub fn displayed(&self) -> &str {
        &self.displayed
    }

    /// Text received but not yet shown.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Number of characters waiting to be shown.
    pub fn backlog(&self) -> usize {
        self.pending_chars
    }

    /// `displayed + pending`: everything received so far.
    pub fn full_text(&self) -> String {
        let mut out = String::with_capacity(self.displayed.len() + self.pending.len());
        out.push_str(&self.displayed);
        out.push_str(&self.pending);
        out
    }

    /// Consumes the buffer and returns the displayed text.
    pub fn into_displayed(self) -> String {
        self.displayed
    }
}

/// One rung of the backlog staircase: when the backlog is strictly greater
/// than `above`, promote `chars_per_tick` characters per tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacingStep {
    pub above: usize,
    pub chars_per_tick: usize,
}

/// How fast pending text is moved on screen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacingPolicy {
    /// Display timer period.
    pub tick: Duration,
    /// Staircase, checked from the first entry; falls back to one character.
    pub steps: Vec<PacingStep>,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(20),
            steps: vec![
                PacingStep {
                    above: 200,
                    chars_per_tick: 20,
                },
                PacingStep {
                    above: 100,
                    chars_per_tick: 10,
                },
                PacingStep {
                    above: 50,
                    chars_per_tick: 5,
                },
                PacingStep {
                    above: 20,
                    chars_per_tick: 2,
                },
            ],
        }
    }
}

impl PacingPolicy {
    /// Overrides the display tick.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Replaces the staircase. Steps are sorted by descending threshold.
    pub fn steps(mut self, mut steps: Vec<PacingStep>) -> Self {
        steps.sort_by(|a, b| b.above.cmp(&a.above));
        self.steps = steps;
        self
    }

    /// Characters to promote for the given backlog. Never returns zero.
    pub fn chunk_size(&self, backlog: usize) -> usize {
        self.steps
            .iter()
            .find(|step| backlog > step.above)
            .map(|step| step.chars_per_tick)
            .unwrap_or(1)
            .max(1)
    }

    /// Rejects policies the display timer cannot run with.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.tick.is_zero() {
            return Err(ChatError::Config("pacing tick must be greater than 0".into()));
        }
        if self.steps.iter().any(|step| step.chars_per_tick == 0) {
            return Err(ChatError::Config(
                "pacing steps must promote at least one character".into(),
            ));
        }
        Ok(())
    }
}
