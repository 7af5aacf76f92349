//! Provider detection and endpoint construction.
//!
//! Providers differ in where the chat completions endpoint lives and in the
//! extra headers they accept.

use url::Url;

use crate::error::RelayError;

/// Supported upstream providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    /// `OpenAI` (api.openai.com)
    OpenAI,
    /// Azure `OpenAI` Service
    AzureOpenAI {
        /// Deployment name (required for Azure)
        deployment_name: String,
        /// API version (e.g., "2024-08-01-preview")
        api_version: String,
    },
    /// `OpenRouter` (openrouter.ai)
    OpenRouter,
    /// Generic OpenAI-compatible provider
    Generic,
}

impl Provider {
    /// Detect provider from base URL.
    #[must_use]
    pub fn detect_from_url(base_url: &str) -> Self {
        let lower = base_url.to_lowercase();

        if lower.contains("openai.azure.com") {
            Self::AzureOpenAI {
                deployment_name: String::new(),
                api_version: "2024-08-01-preview".to_string(),
            }
        } else if lower.contains("openrouter.ai") {
            Self::OpenRouter
        } else if lower.contains("openai.com") {
            Self::OpenAI
        } else {
            Self::Generic
        }
    }

    /// Build the chat completions URL for this provider.
    ///
    /// A base URL that already ends in `/v1` is not given a second one.
    pub fn chat_url(&self, base_url: &str) -> Result<Url, RelayError> {
        let base = base_url.trim_end_matches('/');

        let raw = match self {
            Self::AzureOpenAI {
                deployment_name,
                api_version,
            } => format!(
                "{base}/openai/deployments/{deployment_name}/chat/completions?api-version={api_version}"
            ),
            _ if base.ends_with("/v1") => format!("{base}/chat/completions"),
            _ => format!("{base}/v1/chat/completions"),
        };

        Url::parse(&raw).map_err(|e| RelayError::Config(format!("invalid LLM base URL {base_url:?}: {e}")))
    }

    /// Extra request headers the provider understands.
    #[must_use]
    pub fn extra_headers(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::OpenRouter => &[("X-Title", "chat-relay")],
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_providers() {
        assert_eq!(
            Provider::detect_from_url("https://openrouter.ai/api"),
            Provider::OpenRouter
        );
        assert_eq!(
            Provider::detect_from_url("https://api.openai.com"),
            Provider::OpenAI
        );
        assert!(matches!(
            Provider::detect_from_url("https://my-resource.openai.azure.com"),
            Provider::AzureOpenAI { .. }
        ));
        assert_eq!(
            Provider::detect_from_url("http://localhost:11434"),
            Provider::Generic
        );
    }

    #[test]
    fn test_chat_url() {
        let url = Provider::OpenRouter
            .chat_url("https://openrouter.ai/api/")
            .unwrap();
        assert_eq!(url.as_str(), "https://openrouter.ai/api/v1/chat/completions");

        let url = Provider::Generic.chat_url("http://localhost:8080/v1").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_chat_url_azure() {
        let provider = Provider::AzureOpenAI {
            deployment_name: "gpt-4o".to_string(),
            api_version: "2024-08-01-preview".to_string(),
        };
        let url = provider
            .chat_url("https://my-resource.openai.azure.com")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://my-resource.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-08-01-preview"
        );
    }

    #[test]
    fn test_chat_url_rejects_garbage() {
        assert!(matches!(
            Provider::Generic.chat_url("not a url"),
            Err(RelayError::Config(_))
        ));
    }
}
