//! Moderation providers

use super::types::ModerationResult;
use super::{LlmError, ModerationService};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `OpenAI` moderation endpoint
pub struct OpenAiModeration {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiModeration {
    pub fn new(api_key: String, gateway: Option<&str>) -> Self {
        let base_url = match gateway {
            Some(gw) => format!("{}/openai/v1/moderations", gw.trim_end_matches('/')),
            None => "https://api.openai.com/v1/moderations".to_string(),
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            base_url,
        }
    }

    fn interpret(response: ModerationResponse) -> ModerationResult {
        let Some(result) = response.results.into_iter().next() else {
            return ModerationResult::clean();
        };
        if !result.flagged {
            return ModerationResult::clean();
        }
        let mut categories: Vec<_> = result
            .categories
            .into_iter()
            .filter_map(|(name, hit)| hit.then_some(name))
            .collect();
        categories.sort();
        if categories.is_empty() {
            ModerationResult::flagged("flagged")
        } else {
            ModerationResult::flagged(categories.join(", "))
        }
    }
}

#[async_trait]
impl ModerationService for OpenAiModeration {
    async fn check(&self, text: &str) -> Result<ModerationResult, LlmError> {
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&ModerationRequest { input: text })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::timeout(format!("Moderation timeout: {e}"))
                } else {
                    LlmError::network(format!("Moderation request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => LlmError::auth(format!("Moderation auth failed: {body}")),
                429 => LlmError::rate_limit(format!("Moderation rate limited: {body}")),
                _ => LlmError::server_error(format!("Moderation HTTP {status}: {body}")),
            });
        }

        let parsed: ModerationResponse = response
            .json()
            .await
            .map_err(|e| LlmError::unknown(format!("Failed to parse moderation response: {e}")))?;
        Ok(Self::interpret(parsed))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[derive(Debug, Serialize)]
struct ModerationRequest<'a> {
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationEntry>,
}

#[derive(Debug, Deserialize)]
struct ModerationEntry {
    flagged: bool,
    #[serde(default)]
    categories: std::collections::HashMap<String, bool>,
}

// ============================================================================
// Local Blocklist
// ============================================================================

/// Terms never acceptable in a food plan
const DEFAULT_BLOCKLIST: &[&str] = &[
    "bleach",
    "detergent",
    "antifreeze",
    "poison",
    "rat poison",
    "laundry pod",
    "lighter fluid",
];

/// Offline moderation used when no remote provider is configured
pub struct BlocklistModeration {
    patterns: Vec<(String, Regex)>,
}

impl BlocklistModeration {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = terms
            .into_iter()
            .filter_map(|term| {
                let term = term.as_ref().trim().to_lowercase();
                let regex = RegexBuilder::new(&format!(r"\b{}\b", regex::escape(&term)))
                    .case_insensitive(true)
                    .build()
                    .ok()?;
                Some((term, regex))
            })
            .collect();
        Self { patterns }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BLOCKLIST)
    }
}

#[async_trait]
impl ModerationService for BlocklistModeration {
    async fn check(&self, text: &str) -> Result<ModerationResult, LlmError> {
        Ok(self
            .patterns
            .iter()
            .find(|(_, regex)| regex.is_match(text))
            .map_or_else(ModerationResult::clean, |(term, _)| {
                ModerationResult::flagged(format!("unsafe item: {term}"))
            }))
    }

    fn name(&self) -> &str {
        "blocklist"
    }
}
