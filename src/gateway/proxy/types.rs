//! Usage: Small shared types for the gateway proxy module.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub(in crate::gateway) enum ErrorCategory {
    SystemError,
    ProviderError,
    ContentPolicy,
    InvalidRequest,
}

impl ErrorCategory {
    pub(in crate::gateway) fn as_str(self) -> &'static str {
        match self {
            Self::SystemError => "SYSTEM_ERROR",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::ContentPolicy => "CONTENT_POLICY",
            Self::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

/// Inbound body shared by both variants.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(in crate::gateway) struct GenerationRequest {
    #[serde(default)]
    pub(in crate::gateway) text: String,
    #[serde(default)]
    pub(in crate::gateway) schema: Option<Value>,
    #[serde(default)]
    pub(in crate::gateway) images: Vec<InlineImage>,
    #[serde(default)]
    pub(in crate::gateway) mime_type: Option<String>,
    #[serde(default)]
    pub(in crate::gateway) model: Option<String>,
    #[serde(default)]
    pub(in crate::gateway) api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(in crate::gateway) enum InlineImage {
    /// Data URI or bare base64.
    Encoded(String),
    Object {
        #[serde(default, rename = "mimeType")]
        mime_type: Option<String>,
        data: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(in crate::gateway) enum RequestVariant {
    Generate,
    Search,
}

/// The knobs that separate the two variants; everything else is one cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(in crate::gateway) struct VariantConfig {
    pub(in crate::gateway) enable_search: bool,
    pub(in crate::gateway) relay_grounding: bool,
    pub(in crate::gateway) allow_schema: bool,
    pub(in crate::gateway) use_request_mime_type: bool,
}

impl RequestVariant {
    pub(in crate::gateway) fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Search => "search",
        }
    }

    pub(in crate::gateway) fn config(self) -> VariantConfig {
        match self {
            Self::Generate => VariantConfig {
                enable_search: false,
                relay_grounding: false,
                allow_schema: true,
                use_request_mime_type: true,
            },
            Self::Search => VariantConfig {
                enable_search: true,
                relay_grounding: true,
                allow_schema: false,
                use_request_mime_type: false,
            },
        }
    }
}
