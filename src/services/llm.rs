use std::future::Future;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::{LlmSettings, ModelProfile};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model returned an empty response")]
    EmptyResponse,
    #[error("{0}")]
    Other(String),
}

/// One unit of work handed to an agent: a persona plus a task.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTask {
    pub role: String,
    pub goal: String,
    pub backstory: String,
    pub description: String,
    pub expected_output: String,
    pub profile: ModelProfile,
}

impl AgentTask {
    pub fn system_prompt(&self) -> String {
        format!(
            "Você é {}. {}\nSeu objetivo: {}",
            self.role,
            self.backstory.trim(),
            self.goal.trim()
        )
    }

    pub fn user_prompt(&self) -> String {
        format!(
            "{}\n\nRESULTADO ESPERADO:\n{}",
            self.description.trim(),
            self.expected_output.trim()
        )
    }
}

pub trait LanguageModel: Send + Sync {
    fn invoke(&self, task: &AgentTask) -> impl Future<Output = Result<String, LlmError>> + Send;
}

/// OpenAI-compatible chat completions client.
pub struct LLMClient {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LLMClient {
    pub fn new(settings: &LlmSettings) -> Result<Self, LlmError> {
        if settings.model.trim().is_empty() {
            return Err(LlmError::Other("model name must not be empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;

        Ok(LLMClient {
            client,
            api_url: settings.api_url.clone(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl LanguageModel for LLMClient {
    async fn invoke(&self, task: &AgentTask) -> Result<String, LlmError> {
        let mut request_builder = self
            .client
            .post(&self.api_url)
            .header("Content-Type", "application/json")
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": task.system_prompt() },
                    { "role": "user", "content": task.user_prompt() },
                ],
                "temperature": task.profile.temperature,
                "max_tokens": task.profile.max_tokens,
            }));

        if let Some(key) = &self.api_key {
            request_builder = request_builder.bearer_auth(key);
        }

        tracing::debug!(role = %task.role, "invoking language model");
        let response = request_builder.send().await?;
        let status = response.status();
        let response_text = response.text().await?;

        if !status.is_success() {
            return Err(LlmError::Status {
                status,
                body: response_text,
            });
        }

        extract_content(&response_text)
    }
}

fn extract_content(body: &str) -> Result<String, LlmError> {
    let parsed: ChatResponse = serde_json::from_str(body)?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|text| text.trim().to_string())
        .unwrap_or_default();

    if content.is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> AgentTask {
        AgentTask {
            role: "Escritor do Capítulo 2".to_string(),
            goal: "Escrever um capítulo".to_string(),
            backstory: "Especialista em fantasia.".to_string(),
            description: "Escreva o capítulo 2.".to_string(),
            expected_output: "O capítulo completo.".to_string(),
            profile: ModelProfile {
                temperature: 0.7,
                max_tokens: 4000,
            },
        }
    }

    #[test]
    fn persona_goes_into_system_prompt() {
        let system = task().system_prompt();
        assert!(system.starts_with("Você é Escritor do Capítulo 2."));
        assert!(system.contains("Seu objetivo: Escrever um capítulo"));
    }

    #[test]
    fn expected_output_follows_description() {
        let user = task().user_prompt();
        let description = user.find("Escreva o capítulo 2.").unwrap();
        let expected = user.find("O capítulo completo.").unwrap();
        assert!(description < expected);
    }

    #[test]
    fn extract_content_reads_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  Era uma vez.  "}}]}"#;
        assert_eq!(extract_content(body).unwrap(), "Era uma vez.");
    }

    #[test]
    fn extract_content_rejects_empty_choices() {
        assert!(matches!(
            extract_content(r#"{"choices":[]}"#),
            Err(LlmError::EmptyResponse)
        ));
        assert!(matches!(extract_content("not json"), Err(LlmError::Json(_))));
    }
}
