//! Usage: NDJSON wire messages and the per-request attempt history they carry.

use crate::gateway::upstream::PartTag;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum AttemptStatus {
    Started,
    Success,
    Recoverable,
    Failed,
    UnknownEnd,
}

/// One entry of the attempt history. Mutated once when the attempt reaches its
/// terminal disposition, never afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Attempt {
    pub(crate) attempt: u32,
    pub(crate) model: String,
    pub(crate) status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum MetaEvent {
    AttemptStart,
    RetryingAfterRecitation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum TerminalErrorCode {
    ContentPolicyExhausted,
    AllModelsExhausted,
}

impl TerminalErrorCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::ContentPolicyExhausted => "content-policy-exhausted",
            Self::AllModelsExhausted => "all-models-exhausted",
        }
    }

    /// Only content-policy exhaustion is final; a fresh call might get past a
    /// transient cascade failure.
    pub(crate) fn retryable(self) -> bool {
        matches!(self, Self::AllModelsExhausted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum StreamMessage {
    Meta {
        event: MetaEvent,
        attempt: u32,
        model: String,
    },
    Thought {
        attempt: u32,
        model: String,
        text: String,
    },
    Answer {
        attempt: u32,
        model: String,
        text: String,
    },
    Debug {
        attempt: u32,
        model: String,
        text: String,
    },
    Grounding {
        metadata: Value,
    },
    Reset {
        attempt: u32,
        model: String,
        reason: String,
        clear: bool,
    },
    Error {
        code: TerminalErrorCode,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attempts: Option<Vec<Attempt>>,
    },
}

impl StreamMessage {
    pub(crate) fn part(tag: PartTag, attempt: u32, model: &str, text: String) -> Self {
        let model = model.to_string();
        match tag {
            PartTag::Thought => Self::Thought {
                attempt,
                model,
                text,
            },
            PartTag::Answer => Self::Answer {
                attempt,
                model,
                text,
            },
        }
    }

    pub(crate) fn debug(attempt: u32, model: &str, text: String) -> Self {
        Self::Debug {
            attempt,
            model: model.to_string(),
            text,
        }
    }

    pub(crate) fn terminal_error(
        code: TerminalErrorCode,
        message: String,
        attempts: Vec<Attempt>,
    ) -> Self {
        Self::Error {
            code,
            message,
            retryable: code.retryable(),
            attempts: Some(attempts),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Meta { .. } => "meta",
            Self::Thought { .. } => "thought",
            Self::Answer { .. } => "answer",
            Self::Debug { .. } => "debug",
            Self::Grounding { .. } => "grounding",
            Self::Reset { .. } => "reset",
            Self::Error { .. } => "error",
        }
    }

    /// Sequence number of the attempt this message belongs to, if any.
    #[cfg(test)]
    pub(crate) fn attempt(&self) -> Option<u32> {
        match self {
            Self::Meta { attempt, .. }
            | Self::Thought { attempt, .. }
            | Self::Answer { attempt, .. }
            | Self::Debug { attempt, .. }
            | Self::Reset { attempt, .. } => Some(*attempt),
            Self::Grounding { .. } | Self::Error { .. } => None,
        }
    }
}
