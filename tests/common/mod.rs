#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use bookgen::models::{BookForm, BookRequest};
use bookgen::services::llm::{AgentTask, LanguageModel, LlmError};

/// Replays canned answers in order and records every task it receives.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, String>>>,
    tasks: Mutex<Vec<AgentTask>>,
}

impl ScriptedModel {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, String>>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn ok<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(responses.into_iter().map(|s| Ok(s.into())))
    }

    pub fn tasks(&self) -> Vec<AgentTask> {
        self.tasks.lock().expect("mock mutex poisoned").clone()
    }

    pub fn assert_empty(&self) {
        let guard = self.responses.lock().expect("mock mutex poisoned");
        assert!(guard.is_empty(), "expected all mock responses to be consumed");
    }
}

impl LanguageModel for ScriptedModel {
    async fn invoke(&self, task: &AgentTask) -> Result<String, LlmError> {
        self.tasks
            .lock()
            .expect("mock mutex poisoned")
            .push(task.clone());
        let next = self
            .responses
            .lock()
            .expect("mock mutex poisoned")
            .pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(LlmError::Other(message)),
            None => Err(LlmError::Other(
                "mock language model has no remaining responses".to_string(),
            )),
        }
    }
}

pub fn request(theme: &str, chapters: u32) -> BookRequest {
    BookRequest::from_form(
        BookForm {
            theme: theme.to_string(),
            author: Some("Clara Souza".to_string()),
            author_email: Some("clara@example.com".to_string()),
            chapter_count: Some(chapters),
            target_words: Some(3_000),
            ..Default::default()
        },
        12,
        27_000,
    )
}

pub fn paragraphs(prefix: &str, count: usize) -> String {
    (1..=count)
        .map(|i| format!("{} parágrafo {}.", prefix, i))
        .collect::<Vec<_>>()
        .join("\n\n")
}
