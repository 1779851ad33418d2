//! Output activity tracking: per-unit EMA firing rates, hysteretic winner
//! selection, and a confidence margin.

use hashbrown::HashMap;

use crate::network::UnitId;

/// First-order IIR smoother over fire flags plus a sticky winner.
///
/// The sticky policy keeps the previously selected output until a competitor
/// *strictly* exceeds its rate; exact ties never switch. This prevents
/// oscillation between near-tied candidates during a decision window.
#[derive(Debug, Clone)]
pub struct OutputTracker {
    alpha: f32,
    min_rate: f32,
    default: Option<UnitId>,
    rates: HashMap<UnitId, f32>,
    current: Option<UnitId>,
}

impl OutputTracker {
    pub fn new(alpha: f32, min_rate: f32, default: Option<UnitId>) -> Self {
        Self {
            alpha,
            min_rate,
            default,
            rates: HashMap::new(),
            current: None,
        }
    }

    /// Clear all rates and the sticky winner (episode boundary).
    pub fn reset(&mut self) {
        self.rates.clear();
        self.current = None;
    }

    /// `rate = (1-alpha) * rate + alpha * fired`.
    pub fn update(&mut self, id: UnitId, fired: bool) {
        let r = self.rates.entry(id).or_insert(0.0);
        *r = (1.0 - self.alpha) * *r + if fired { self.alpha } else { 0.0 };
    }

    pub fn rate(&self, id: UnitId) -> f32 {
        self.rates.get(&id).copied().unwrap_or(0.0)
    }

    /// Highest-rate candidate; earlier candidates win exact ties.
    fn argmax(&self, candidates: &[UnitId]) -> Option<(UnitId, f32)> {
        let mut best: Option<(UnitId, f32)> = None;
        for &id in candidates {
            let r = self.rate(id);
            if best.map(|(_, br)| r > br).unwrap_or(true) {
                best = Some((id, r));
            }
        }
        best
    }

    /// Stateless argmax above the minimum-activity threshold.
    /// All-silent candidates abstain to the configured default.
    pub fn predict(&self, candidates: &[UnitId]) -> Option<UnitId> {
        match self.argmax(candidates) {
            Some((id, r)) if r > self.min_rate => Some(id),
            _ => self.default,
        }
    }

    /// Hysteretic prediction: the stored winner only changes when a
    /// challenger's rate strictly exceeds it. The very first prediction (or
    /// a stored winner no longer among the candidates) falls back to the
    /// plain argmax, or the default when everything is at/below threshold.
    pub fn predict_sticky(&mut self, candidates: &[UnitId]) -> Option<UnitId> {
        let Some((best, best_rate)) = self.argmax(candidates) else {
            return self.default;
        };
        match self.current {
            Some(prev) if candidates.contains(&prev) => {
                if best_rate > self.rate(prev) {
                    self.current = Some(best);
                }
            }
            _ => {
                self.current = if best_rate > self.min_rate {
                    Some(best)
                } else {
                    self.default
                };
            }
        }
        self.current
    }

    /// Top-1 minus top-2 rate over the candidates; a lone candidate's margin
    /// is its own rate.
    pub fn margin(&self, candidates: &[UnitId]) -> f32 {
        let mut top1 = 0.0f32;
        let mut top2 = 0.0f32;
        for &id in candidates {
            let r = self.rate(id);
            if r > top1 {
                top2 = top1;
                top1 = r;
            } else if r > top2 {
                top2 = r;
            }
        }
        top1 - top2
    }

    pub fn winner(&self) -> Option<UnitId> {
        self.current
    }
}
