//! Text generation over an OpenAI-compatible `/chat/completions` endpoint.

use std::time::Duration;

use analyst_coordination::{GenerationError, ParticipantRole, TextGenerator, TurnConstraints};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmEndpoint;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the first choice's text.
pub fn parse_completion(body: &str) -> Result<String, GenerationError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| GenerationError::RequestFailed(format!("malformed response: {}", e)))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(GenerationError::EmptyResponse)
}

/// Map a non-success HTTP status to a generation error.
pub fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> GenerationError {
    let snippet: String = body.chars().take(200).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        GenerationError::RateLimited(retry_after.unwrap_or(Duration::from_secs(1)))
    } else if status.is_server_error() {
        GenerationError::Unavailable(format!("{}: {}", status, snippet))
    } else {
        GenerationError::RequestFailed(format!("{}: {}", status, snippet))
    }
}

fn system_prompt(role: ParticipantRole, constraints: &TurnConstraints) -> String {
    let mut prompt = format!(
        "You are the {} in a structured analytical debate. This is a {} turn. \
         Answer in at most {} words.",
        role, constraints.turn_type, constraints.max_words
    );
    if constraints.require_citations {
        prompt.push_str(" Every number you state must be followed by its [src:<query_id>] marker");
        if constraints.allowed_query_ids.is_empty() {
            prompt.push_str("; no sources are available, so state no numbers.");
        } else {
            prompt.push_str(&format!(
                ", using only: {}.",
                constraints.allowed_query_ids.join(", ")
            ));
        }
    }
    prompt
}

pub struct ChatCompletionsGenerator {
    client: reqwest::Client,
    endpoint: LlmEndpoint,
}

impl ChatCompletionsGenerator {
    pub fn new(endpoint: LlmEndpoint) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(endpoint.request_timeout)
            .build()
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;
        Ok(Self { client, endpoint })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.url.trim_end_matches('/'))
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionsGenerator {
    async fn generate(
        &self,
        role: ParticipantRole,
        context: &str,
        constraints: &TurnConstraints,
    ) -> Result<String, GenerationError> {
        let system = system_prompt(role, constraints);
        let request = ChatRequest {
            model: &self.endpoint.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: context,
                },
            ],
            temperature: self.endpoint.temperature,
            max_tokens: constraints.max_words.saturating_mul(2).max(64),
        };

        let mut builder = self.client.post(self.completions_url()).json(&request);
        if let Some(key) = &self.endpoint.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout(self.endpoint.request_timeout)
            } else {
                GenerationError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .await
            .map_err(|e| GenerationError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(status_error(status, retry_after, &body));
        }
        debug!(role = %role, bytes = body.len(), "Completion received");
        parse_completion(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analyst_coordination::debate::TurnType;

    fn constraints(ids: &[&str]) -> TurnConstraints {
        TurnConstraints {
            turn_type: TurnType::Rebuttal,
            require_citations: true,
            allowed_query_ids: ids.iter().map(|s| s.to_string()).collect(),
            max_words: 180,
        }
    }

    #[test]
    fn test_parse_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  Rates rose.  "}}]}"#;
        assert_eq!(parse_completion(body).unwrap(), "Rates rose.");
    }

    #[test]
    fn test_parse_empty_and_malformed() {
        assert_eq!(
            parse_completion(r#"{"choices":[]}"#),
            Err(GenerationError::EmptyResponse)
        );
        assert_eq!(
            parse_completion(r#"{"choices":[{"message":{"content":null}}]}"#),
            Err(GenerationError::EmptyResponse)
        );
        assert!(matches!(
            parse_completion("<html>"),
            Err(GenerationError::RequestFailed(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)), ""),
            GenerationError::RateLimited(Duration::from_secs(7))
        );
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, None, "upstream"),
            GenerationError::Unavailable(_)
        ));
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, None, "bad key"),
            GenerationError::RequestFailed(_)
        ));
    }

    #[test]
    fn test_system_prompt_lists_citable_sources() {
        let prompt = system_prompt(ParticipantRole::Skeptic, &constraints(&["q1", "q2"]));
        assert!(prompt.contains("skeptic"));
        assert!(prompt.contains("rebuttal"));
        assert!(prompt.contains("q1, q2"));

        let bare = system_prompt(ParticipantRole::Quant, &constraints(&[]));
        assert!(bare.contains("state no numbers"));
    }
}
