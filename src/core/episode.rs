//! Training episodes: an immutable tick-indexed input timeline plus the
//! designated target output unit.

use crate::error::EvoError;

/// One complete trial: which unit gets how much current at which tick, and
/// which output unit should win the decision window.
///
/// Episodes are built once (via [`Episode::push_event`] or
/// [`Episode::with_events`]) and read-only afterwards; the trainer never
/// mutates them.
#[derive(Debug, Clone)]
pub struct Episode {
    target: String,
    ticks: Vec<Vec<(String, f32)>>,
}

impl Episode {
    pub fn new(target: impl Into<String>, len: usize) -> Self {
        Self {
            target: target.into(),
            ticks: vec![Vec::new(); len],
        }
    }

    pub fn with_events(
        target: impl Into<String>,
        len: usize,
        events: &[(usize, &str, f32)],
    ) -> Result<Self, EvoError> {
        let mut ep = Self::new(target, len);
        for &(tick, id, amount) in events {
            ep.push_event(tick, id, amount)?;
        }
        Ok(ep)
    }

    /// Append one injection event. Non-finite amounts are rejected at build
    /// time so the simulation never sees them.
    pub fn push_event(&mut self, tick: usize, id: &str, amount: f32) -> Result<(), EvoError> {
        if !amount.is_finite() {
            return Err(EvoError::InvalidParameter {
                id: id.to_string(),
                what: "injected amount must be finite",
            });
        }
        if tick >= self.ticks.len() {
            self.ticks.resize(tick + 1, Vec::new());
        }
        self.ticks[tick].push((id.to_string(), amount));
        Ok(())
    }

    /// Extend the timeline to at least `len` ticks (never shrinks).
    pub fn set_len(&mut self, len: usize) {
        if len > self.ticks.len() {
            self.ticks.resize(len, Vec::new());
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Timeline length in ticks (max event tick + 1, or the declared length).
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn events_at(&self, tick: usize) -> &[(String, f32)] {
        self.ticks.get(tick).map(|v| v.as_slice()).unwrap_or(&[])
    }
}
