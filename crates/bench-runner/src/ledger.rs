use std::collections::HashMap;

/// How a finished run was judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Succeeded,
    /// Failed, and the image still has retry budget left.
    Retry { failures: u32 },
    /// Failed past the retry budget.
    Exhausted { failures: u32 },
}

/// Consecutive-failure counts per image, kept for the life of the process.
///
/// Counts are never cleared, not even by a later success, so an early failure
/// streak keeps counting against the image in later rounds.
#[derive(Debug, Clone)]
pub struct RetryLedger {
    max_retry_attempts: u32,
    failures: HashMap<String, u32>,
}

impl RetryLedger {
    pub fn new(max_retry_attempts: u32) -> Self {
        Self {
            max_retry_attempts,
            failures: HashMap::new(),
        }
    }

    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts
    }

    pub fn failures(&self, image: &str) -> u32 {
        self.failures.get(image).copied().unwrap_or(0)
    }

    pub fn should_retry(&self, image: &str) -> bool {
        self.failures(image) <= self.max_retry_attempts
    }

    /// A run failed only when the composition exited non-zero and produced no
    /// usable result.
    pub fn record_outcome(&mut self, image: &str, exit_ok: bool, has_result: bool) -> Verdict {
        if exit_ok || has_result {
            return Verdict::Succeeded;
        }
        let count = self.failures.entry(image.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let failures = *count;
        if self.should_retry(image) {
            Verdict::Retry { failures }
        } else {
            Verdict::Exhausted { failures }
        }
    }

    pub fn snapshot(&self) -> Vec<(String, u32)> {
        let mut out: Vec<(String, u32)> = self
            .failures
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.sort();
        out
    }
}
