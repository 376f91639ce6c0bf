//! Combination of check and quota results
//!
//! Results are combined in encounter order: destination, then instance
//! group, then instance. Numeric grants and durations take the minimum; the
//! status takes the first failing code and every failing message.

use attrmesh_core::{
    adapter::{CheckResult, QuotaResult},
    status::{Code, Status},
};

/// Accumulates the statuses of several results into one
#[derive(Debug, Default)]
pub struct StatusCombiner {
    code: Option<Code>,
    messages: Vec<String>,
}

impl StatusCombiner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the status reported by the destination named `friendly_name`
    pub fn add(&mut self, friendly_name: &str, status: &Status) {
        if status.is_ok() {
            return;
        }
        self.code.get_or_insert(status.code);
        self.messages.push(format!("{}:{}", friendly_name, status.message));
    }

    pub fn finish(self) -> Status {
        match self.code {
            None => Status::ok(),
            Some(code) => Status::with_message(code, self.messages.join(", ")),
        }
    }
}

/// Combine check results given as `(friendly name, result)` pairs
pub fn combine_check_results<'a, I>(results: I) -> CheckResult
where
    I: IntoIterator<Item = (&'a str, &'a CheckResult)>,
{
    let mut status = StatusCombiner::new();
    let mut combined: Option<CheckResult> = None;

    for (name, result) in results {
        status.add(name, &result.status);
        combined = Some(match combined {
            None => result.clone(),
            Some(c) => CheckResult {
                status: c.status,
                valid_duration: c.valid_duration.min(result.valid_duration),
                valid_use_count: c.valid_use_count.min(result.valid_use_count),
            },
        });
    }

    let mut combined = combined.unwrap_or_default();
    combined.status = status.finish();
    combined
}

/// Combine quota results given as `(friendly name, result)` pairs
pub fn combine_quota_results<'a, I>(results: I) -> QuotaResult
where
    I: IntoIterator<Item = (&'a str, &'a QuotaResult)>,
{
    let mut status = StatusCombiner::new();
    let mut combined: Option<QuotaResult> = None;

    for (name, result) in results {
        status.add(name, &result.status);
        combined = Some(match combined {
            None => result.clone(),
            Some(c) => QuotaResult {
                status: c.status,
                valid_duration: c.valid_duration.min(result.valid_duration),
                amount: c.amount.min(result.amount),
            },
        });
    }

    let mut combined = combined.unwrap_or_default();
    combined.status = status.finish();
    combined
}
