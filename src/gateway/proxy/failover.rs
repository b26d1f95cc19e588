//! Usage: Two-tier model selection (normal cascade queue + bounded recitation fallback).

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CascadeDecision {
    /// Attempt succeeded; stop consuming the queue.
    Finish,
    /// Recitation recovered: a fallback model was pushed to the queue front.
    Recover,
    /// Generic failure: move on to the next queued model.
    Advance,
    /// Recitation fallbacks exhausted.
    Abort,
}

impl CascadeDecision {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::Finish => "finish",
            Self::Recover => "recover",
            Self::Advance => "advance",
            Self::Abort => "abort",
        }
    }
}

pub(super) trait ModelSource {
    fn next_model(&mut self) -> Option<String>;
}

/// Request-scoped candidate list, consumed from the front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ModelQueue {
    models: VecDeque<String>,
}

impl ModelQueue {
    /// A model override yields a singleton queue; otherwise the default order applies.
    pub(super) fn for_request(model_override: Option<&str>, defaults: &[String]) -> Self {
        let models = match model_override {
            Some(model) => VecDeque::from([model.to_string()]),
            None => defaults.iter().cloned().collect(),
        };
        Self { models }
    }

    pub(super) fn push_front(&mut self, model: String) {
        self.models.push_front(model);
    }

    pub(super) fn len(&self) -> usize {
        self.models.len()
    }
}

impl ModelSource for ModelQueue {
    fn next_model(&mut self) -> Option<String> {
        self.models.pop_front()
    }
}

/// Counts recitation finishes for one request. Occurrence `n` (1-based) maps to
/// fallback index `n - 1`; past the end of the list the policy is exhausted.
#[derive(Debug, Clone)]
pub(super) struct RecitationRecovery {
    occurrences: usize,
    fallbacks: Vec<String>,
}

impl RecitationRecovery {
    pub(super) fn new(fallbacks: &[String]) -> Self {
        Self {
            occurrences: 0,
            fallbacks: fallbacks.to_vec(),
        }
    }

    pub(super) fn occurrences(&self) -> usize {
        self.occurrences
    }

    pub(super) fn limit(&self) -> usize {
        self.fallbacks.len()
    }
}

impl ModelSource for RecitationRecovery {
    fn next_model(&mut self) -> Option<String> {
        self.occurrences = self.occurrences.saturating_add(1);
        self.fallbacks.get(self.occurrences - 1).cloned()
    }
}
