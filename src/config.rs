use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Sampling settings for one agent role.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelProfile {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub output_dir: PathBuf,
    pub users_file: PathBuf,
    pub llm: LlmSettings,
    pub planning: ModelProfile,
    pub writing: ModelProfile,
    pub chapter_delay: Duration,
    pub target_words: u32,
    pub default_chapters: u32,
    pub admin_email: Option<String>,
    pub require_subscription: bool,
    pub app_url: String,
    pub export_epub: bool,
}

impl Config {
    /// Reads the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("LLM_API_KEY").or_else(|| get("OPENAI_API_KEY"));

        Ok(Config {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            output_dir: PathBuf::from(get("OUTPUT_DIR").unwrap_or_else(|| "./output".to_string())),
            users_file: PathBuf::from(
                get("USERS_FILE").unwrap_or_else(|| "./output/users.json".to_string()),
            ),
            llm: LlmSettings {
                api_url: get("LLM_API_URL").unwrap_or_else(|| {
                    "https://api.openai.com/v1/chat/completions".to_string()
                }),
                api_key,
                model: get("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                timeout: Duration::from_secs(parse(&get, "LLM_TIMEOUT_SECS", 180)?),
            },
            planning: ModelProfile {
                temperature: parse(&get, "PLANNING_TEMPERATURE", 0.7)?,
                max_tokens: parse(&get, "PLANNING_MAX_TOKENS", 3000)?,
            },
            writing: ModelProfile {
                temperature: parse(&get, "WRITING_TEMPERATURE", 0.7)?,
                max_tokens: parse(&get, "WRITING_MAX_TOKENS", 4000)?,
            },
            chapter_delay: Duration::from_secs(parse(&get, "CHAPTER_DELAY_SECS", 2)?),
            target_words: parse(&get, "TARGET_WORDS", 27_000)?,
            default_chapters: parse(&get, "DEFAULT_CHAPTERS", 12)?,
            admin_email: get("ADMIN_EMAIL").map(|e| e.trim().to_lowercase()),
            require_subscription: parse_bool(&get, "REQUIRE_SUBSCRIPTION", true)?,
            app_url: get("APP_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
            export_epub: parse_bool(&get, "EXPORT_EPUB", true)?,
        })
    }
}

fn parse<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn parse_bool<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.target_words, 27_000);
        assert_eq!(config.default_chapters, 12);
        assert_eq!(config.chapter_delay, Duration::from_secs(2));
        assert_eq!(config.writing.max_tokens, 4000);
        assert!(config.require_subscription);
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn openai_key_is_used_as_fallback() {
        let config = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));

        let config = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("LLM_API_KEY", "sk-primary"),
        ]))
        .unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-primary"));
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_key() {
        let err = Config::from_lookup(lookup(&[("CHAPTER_DELAY_SECS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("CHAPTER_DELAY_SECS"));
    }

    #[test]
    fn booleans_accept_common_spellings() {
        let config = Config::from_lookup(lookup(&[
            ("REQUIRE_SUBSCRIPTION", "no"),
            ("EXPORT_EPUB", "0"),
            ("ADMIN_EMAIL", " Admin@Example.com "),
        ]))
        .unwrap();
        assert!(!config.require_subscription);
        assert!(!config.export_epub);
        assert_eq!(config.admin_email.as_deref(), Some("admin@example.com"));
    }
}
