use serde::{Deserialize, Serialize};

/// Step counter for one operation or batch.
///
/// `completed_steps` never decreases and never exceeds `total_steps`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressTracker {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub last_message: Option<String>,
}

impl ProgressTracker {
    pub fn new(total_steps: usize) -> Self {
        Self {
            total_steps,
            ..Self::default()
        }
    }

    /// Complete one step. The total grows with it if it was underestimated.
    pub fn advance(&mut self, message: impl Into<String>) {
        self.completed_steps += 1;
        self.total_steps = self.total_steps.max(self.completed_steps);
        self.last_message = Some(message.into());
    }

    /// Re-estimate the total; it is never set below the completed count.
    pub fn set_total(&mut self, total_steps: usize) {
        self.total_steps = total_steps.max(self.completed_steps);
    }

    /// Record a message without completing a step.
    pub fn note(&mut self, message: impl Into<String>) {
        self.last_message = Some(message.into());
    }

    pub fn is_complete(&self) -> bool {
        self.completed_steps == self.total_steps
    }

    /// Completed fraction in `0.0..=1.0`; an empty tracker counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total_steps == 0 {
            1.0
        } else {
            self.completed_steps as f64 / self.total_steps as f64
        }
    }
}

/// Receives progress updates as a batch advances.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &ProgressTracker);
}

/// Discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: &ProgressTracker) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressTracker) + Send + Sync,
{
    fn report(&self, progress: &ProgressTracker) {
        self(progress)
    }
}
