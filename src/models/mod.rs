use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_AUTHOR: &str = "Autor Anônimo";
pub const DEFAULT_AUTHOR_EMAIL: &str = "autor@exemplo.com";
pub const DEFAULT_GENRE: &str = "Ficção";
pub const DEFAULT_STYLE: &str = "Narrativo";
pub const DEFAULT_AUDIENCE: &str = "Adulto";
pub const MAX_CHAPTERS: u32 = 100;

/// Form submitted by a user to start a book. Optional fields fall back to the
/// defaults in [`BookRequest::from_form`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookForm {
    pub theme: String,
    pub author: Option<String>,
    pub author_email: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    pub style: Option<String>,
    pub audience: Option<String>,
    pub chapter_count: Option<u32>,
    pub target_words: Option<u32>,
}

/// Immutable input of a generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRequest {
    pub theme: String,
    pub author: String,
    pub author_email: String,
    pub description: String,
    pub genre: String,
    pub style: String,
    pub audience: String,
    pub chapter_count: u32,
    pub target_words: u32,
}

impl BookRequest {
    pub fn from_form(form: BookForm, default_chapters: u32, default_target_words: u32) -> Self {
        let theme = form.theme.trim().to_string();
        let description = non_blank(form.description)
            .unwrap_or_else(|| format!("Um livro sobre {}", theme));

        Self {
            author: non_blank(form.author).unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
            author_email: non_blank(form.author_email)
                .unwrap_or_else(|| DEFAULT_AUTHOR_EMAIL.to_string()),
            description,
            genre: non_blank(form.genre).unwrap_or_else(|| DEFAULT_GENRE.to_string()),
            style: non_blank(form.style).unwrap_or_else(|| DEFAULT_STYLE.to_string()),
            audience: non_blank(form.audience).unwrap_or_else(|| DEFAULT_AUDIENCE.to_string()),
            chapter_count: form.chapter_count.unwrap_or(default_chapters),
            target_words: form.target_words.unwrap_or(default_target_words),
            theme,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.theme.trim().is_empty() {
            return Err("theme must not be empty".to_string());
        }
        if self.chapter_count == 0 || self.chapter_count > MAX_CHAPTERS {
            return Err(format!(
                "chapter_count must be between 1 and {}",
                MAX_CHAPTERS
            ));
        }
        if self.target_words == 0 {
            return Err("target_words must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Advisory per-chapter word target.
    pub fn words_per_chapter(&self) -> u32 {
        self.target_words / self.chapter_count.max(1)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChapterStatus {
    Pending,
    InProgress,
    Done,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub number: u32,
    pub status: ChapterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ChapterRecord {
    pub fn pending(number: u32) -> Self {
        Self {
            number,
            status: ChapterStatus::Pending,
            file: None,
            generated_at: None,
            word_count: None,
            sha256: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ChapterStatus::Done
    }

    pub fn reset(&mut self) {
        *self = Self::pending(self.number);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Planning,
    Writing,
    Compiling,
    Completed,
    Failed { error: String },
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

/// Run manifest persisted as `metadata.json` in the run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub request: BookRequest,
    pub year: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_file: Option<String>,
    pub chapters: Vec<ChapterRecord>,
}

impl BookMetadata {
    pub fn chapter_mut(&mut self, number: u32) -> Option<&mut ChapterRecord> {
        self.chapters.iter_mut().find(|c| c.number == number)
    }

    pub fn chapter(&self, number: u32) -> Option<&ChapterRecord> {
        self.chapters.iter().find(|c| c.number == number)
    }

    pub fn completed_chapters(&self) -> usize {
        self.chapters.iter().filter(|c| c.is_done()).count()
    }

    /// Numbers of chapters whose last attempt failed.
    pub fn failed_chapters(&self) -> Vec<u32> {
        self.chapters
            .iter()
            .filter(|c| matches!(c.status, ChapterStatus::Failed { .. }))
            .map(|c| c.number)
            .collect()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            theme: self.request.theme.clone(),
            author: self.request.author.clone(),
            status: self.status.clone(),
            chapter_count: self.request.chapter_count,
            completed_chapters: self.completed_chapters(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub theme: String,
    pub author: String,
    pub status: RunStatus,
    pub chapter_count: u32,
    pub completed_chapters: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub stage: u32,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedBook {
    pub run_id: String,
    pub content: String,
    pub failed_chapters: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiled_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub salt: String,
    #[serde(default)]
    pub subscription_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_token_expiry: Option<DateTime<Utc>>,
}

/// What a client gets to see of an account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicUser {
    pub id: String,
    pub name: String,
    pub email: String,
    pub subscription_active: bool,
    pub is_admin: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_defaults_fill_missing_fields() {
        let form = BookForm {
            theme: "  Dragões  ".to_string(),
            author: Some("   ".to_string()),
            ..Default::default()
        };
        let request = BookRequest::from_form(form, 12, 27_000);

        assert_eq!(request.theme, "Dragões");
        assert_eq!(request.author, DEFAULT_AUTHOR);
        assert_eq!(request.description, "Um livro sobre Dragões");
        assert_eq!(request.chapter_count, 12);
        assert_eq!(request.words_per_chapter(), 2_250);
    }

    #[test]
    fn validate_rejects_zero_chapters_and_blank_theme() {
        let mut request = BookRequest::from_form(
            BookForm {
                theme: "X".to_string(),
                chapter_count: Some(0),
                ..Default::default()
            },
            12,
            27_000,
        );
        assert!(request.validate().is_err());

        request.chapter_count = 3;
        assert!(request.validate().is_ok());

        request.theme = " ".to_string();
        assert!(request.validate().is_err());
    }

    #[test]
    fn words_per_chapter_floors() {
        let request = BookRequest::from_form(
            BookForm {
                theme: "X".to_string(),
                chapter_count: Some(7),
                target_words: Some(100),
                ..Default::default()
            },
            12,
            27_000,
        );
        assert_eq!(request.words_per_chapter(), 14);
    }

    #[test]
    fn chapter_status_serializes_with_state_tag() {
        let status = ChapterStatus::Failed {
            error: "boom".to_string(),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "failed");
        assert_eq!(value["error"], "boom");
    }
}
