//! Usage: Request-scoped attempt history (append on start, settle exactly once).

use crate::gateway::events::{Attempt, AttemptStatus};

#[derive(Debug, Default)]
pub(super) struct AttemptLog {
    attempts: Vec<Attempt>,
}

pub(super) struct Settlement<'a> {
    pub(super) status: AttemptStatus,
    pub(super) finish_reason: Option<&'a str>,
    pub(super) error_code: Option<&'a str>,
    pub(super) error: Option<String>,
}

impl<'a> Settlement<'a> {
    pub(super) fn finished(status: AttemptStatus, finish_reason: &'a str) -> Self {
        Self {
            status,
            finish_reason: Some(finish_reason),
            error_code: None,
            error: None,
        }
    }

    pub(super) fn failed(status: AttemptStatus, error_code: &'a str, error: String) -> Self {
        Self {
            status,
            finish_reason: None,
            error_code: Some(error_code),
            error: Some(error),
        }
    }
}

impl AttemptLog {
    /// Appends a `started` entry and returns its 1-based sequence number.
    pub(super) fn start(&mut self, model: &str) -> u32 {
        let attempt = u32::try_from(self.attempts.len() + 1).unwrap_or(u32::MAX);
        self.attempts.push(Attempt {
            attempt,
            model: model.to_string(),
            status: AttemptStatus::Started,
            finish_reason: None,
            error_code: None,
            error: None,
        });
        attempt
    }

    /// Settles the latest attempt. A settled attempt is never touched again.
    pub(super) fn settle(&mut self, settlement: Settlement<'_>) {
        let Some(last) = self.attempts.last_mut() else {
            return;
        };
        if last.status != AttemptStatus::Started {
            return;
        }
        last.status = settlement.status;
        last.finish_reason = settlement.finish_reason.map(str::to_string);
        last.error_code = settlement.error_code.map(str::to_string);
        last.error = settlement.error;
    }

    pub(super) fn len(&self) -> usize {
        self.attempts.len()
    }

    pub(super) fn last_model(&self) -> Option<String> {
        self.attempts.last().map(|a| a.model.clone())
    }

    pub(super) fn snapshot(&self) -> Vec<Attempt> {
        self.attempts.clone()
    }

    pub(super) fn into_vec(self) -> Vec<Attempt> {
        self.attempts
    }
}
