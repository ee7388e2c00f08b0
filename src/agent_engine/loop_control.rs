use crate::config::AgentConfig;

/// Step and failure bookkeeping for one task.
#[derive(Debug, Clone)]
pub struct LoopController {
    max_steps: u32,
    max_failures: u32,
    step_count: u32,
    consecutive_failures: u32,
}

impl LoopController {
    pub fn new(config: &AgentConfig) -> Self {
        Self::with_limits(config.max_steps, config.max_consecutive_failures)
    }

    pub fn with_limits(max_steps: u32, max_failures: u32) -> Self {
        Self {
            max_steps,
            max_failures,
            step_count: 0,
            consecutive_failures: 0,
        }
    }

    /// Counts a new step; `false` once the step cap has been reached.
    pub fn begin_step(&mut self) -> bool {
        if self.step_count >= self.max_steps {
            return false;
        }
        self.step_count += 1;
        true
    }

    /// A step produced a command.
    pub fn record_command(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Returns `true` when the failure threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.consecutive_failures >= self.max_failures
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
