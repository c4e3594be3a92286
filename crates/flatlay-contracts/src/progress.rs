use serde::{Deserialize, Serialize};

use crate::results::GenerationResult;

/// Minutes the original product quoted per generated image.
const MINUTES_PER_IMAGE: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressState {
    pub current: usize,
    pub total: usize,
}

impl ProgressState {
    pub fn start(total: usize) -> Self {
        Self { current: 0, total }
    }

    /// Counts one more item as started. Never moves past `total`.
    pub fn advance(&mut self) {
        if self.current < self.total {
            self.current += 1;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_idle(&self) -> bool {
        self.total == 0
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.current as f64 / self.total as f64
    }

    pub fn estimated_minutes_remaining(&self) -> u64 {
        let remaining = self.total.saturating_sub(self.current) as f64;
        (remaining * MINUTES_PER_IMAGE).ceil() as u64
    }
}

/// What observers of a run see after every change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub progress: ProgressState,
    pub results: Vec<GenerationResult>,
    pub in_progress: bool,
}

impl RunSnapshot {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|result| result.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}
