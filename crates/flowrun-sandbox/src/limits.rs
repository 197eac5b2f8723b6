use std::time::Duration;

/// Resource budgets for one step invocation.
///
/// The wall-clock timeout is authoritative for runaway steps. Memory/CPU
/// budgets are enforced on observable volume (output bytes, log lines);
/// this type is the seam for an OS-level enforcement backend.
#[derive(Debug, Clone)]
pub struct Limits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub max_log_lines: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_bytes: 4 * 1024 * 1024,
            max_log_lines: 1_000,
        }
    }
}

impl Limits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
