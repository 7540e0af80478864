use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{Config, ModelProfile};
use crate::models::{BookRequest, GeneratedBook, RunStatus};
use crate::services::compiler::{compile_book, export_epub};
use crate::services::llm::{LanguageModel, LlmError};
use crate::services::manifest::{
    COMPILED_FILE_NAME, EPUB_FILE_NAME, ManifestError, RunHandle, RunStore, STRUCTURE_FILE_NAME,
};
use crate::services::planner::plan_structure;
use crate::services::progress::{
    ProgressReporter, STAGE_COMPILING, STAGE_FINISHED, STAGE_PLANNING_STARTED,
    STAGE_STRUCTURE_DONE, STAGE_STRUCTURE_REQUESTED,
};
use crate::services::writer::{ChapterWriter, save_quietly};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid book request: {0}")]
    InvalidRequest(String),
    #[error("Erro ao gerar estrutura: {0}")]
    Planning(#[source] LlmError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub planning: ModelProfile,
    pub writing: ModelProfile,
    pub chapter_delay: Duration,
    pub export_epub: bool,
}

impl GeneratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            planning: config.planning,
            writing: config.writing,
            chapter_delay: config.chapter_delay,
            export_epub: config.export_epub,
        }
    }
}

/// Drives one run end to end: plan, write chapters, compile.
pub struct BookGenerator<M> {
    model: Arc<M>,
    store: RunStore,
    settings: GeneratorSettings,
}

impl<M> Clone for BookGenerator<M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            store: self.store.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<M> BookGenerator<M> {
    pub fn new(model: Arc<M>, store: RunStore, settings: GeneratorSettings) -> Self {
        Self {
            model,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }
}

impl<M: LanguageModel> BookGenerator<M> {
    /// Validates the request and creates the run directory and manifest.
    pub fn start(
        &self,
        request: BookRequest,
        owner_id: Option<String>,
    ) -> Result<RunHandle, GenerationError> {
        request.validate().map_err(GenerationError::InvalidRequest)?;
        Ok(self.store.create_run(request, owner_id)?)
    }

    /// Creates a run and executes it to completion.
    pub async fn generate(
        &self,
        request: BookRequest,
        owner_id: Option<String>,
        reporter: &dyn ProgressReporter,
    ) -> Result<GeneratedBook, GenerationError> {
        let handle = self.start(request, owner_id)?;
        self.execute(handle, reporter).await
    }

    /// Continues an interrupted run from its manifest.
    pub async fn resume(
        &self,
        run_id: &str,
        reporter: &dyn ProgressReporter,
    ) -> Result<GeneratedBook, GenerationError> {
        let handle = self.store.load_run(run_id)?;
        tracing::info!(
            run = %run_id,
            done = handle.metadata.completed_chapters(),
            total = handle.metadata.request.chapter_count,
            "resuming run"
        );
        self.execute(handle, reporter).await
    }

    pub async fn execute(
        &self,
        mut handle: RunHandle,
        reporter: &dyn ProgressReporter,
    ) -> Result<GeneratedBook, GenerationError> {
        let structure = self.ensure_structure(&mut handle, reporter).await?;

        handle.metadata.status = RunStatus::Writing;
        save_quietly(&mut handle);
        let writer = ChapterWriter::new(
            self.model.as_ref(),
            self.settings.writing,
            self.settings.chapter_delay,
        );
        let chapters = writer.write_all(&mut handle, &structure, reporter).await;

        Ok(self.compile(&mut handle, &structure, &chapters, reporter))
    }

    async fn ensure_structure(
        &self,
        handle: &mut RunHandle,
        reporter: &dyn ProgressReporter,
    ) -> Result<String, GenerationError> {
        if let Some(file) = handle.metadata.structure_file.clone() {
            match handle.read_text(&file) {
                Ok(structure) => return Ok(structure),
                Err(e) => tracing::warn!(run = %handle.id(), "structure unreadable, planning again: {}", e),
            }
        }

        let request = handle.metadata.request.clone();
        reporter.report(
            STAGE_PLANNING_STARTED,
            &format!("Planejando a estrutura do livro sobre '{}'...", request.theme),
        );
        handle.metadata.status = RunStatus::Planning;
        save_quietly(handle);

        reporter.report(
            STAGE_STRUCTURE_REQUESTED,
            &format!("Gerando estrutura do livro sobre '{}'...", request.theme),
        );
        let structure = match plan_structure(self.model.as_ref(), &request, self.settings.planning).await {
            Ok(structure) => structure,
            Err(e) => {
                let error = GenerationError::Planning(e);
                tracing::error!(run = %handle.id(), "{}", error);
                handle.metadata.status = RunStatus::Failed {
                    error: error.to_string(),
                };
                save_quietly(handle);
                reporter.report(STAGE_STRUCTURE_DONE, &error.to_string());
                return Err(error);
            }
        };

        handle.write_text(STRUCTURE_FILE_NAME, &structure)?;
        handle.metadata.structure_file = Some(STRUCTURE_FILE_NAME.to_string());
        save_quietly(handle);
        reporter.report(STAGE_STRUCTURE_DONE, "Estrutura do livro criada com sucesso!");
        Ok(structure)
    }

    /// Never fails: a write error is reported and the assembled text is
    /// still returned.
    fn compile(
        &self,
        handle: &mut RunHandle,
        structure: &str,
        chapters: &[String],
        reporter: &dyn ProgressReporter,
    ) -> GeneratedBook {
        reporter.report(STAGE_COMPILING, "Compilando livro completo...");
        handle.metadata.status = RunStatus::Compiling;
        save_quietly(handle);

        let content = compile_book(&handle.metadata, structure, chapters);
        let failed_chapters = handle.metadata.failed_chapters();

        let compiled_file = match handle.write_text(COMPILED_FILE_NAME, &content) {
            Ok(path) => {
                if self.settings.export_epub {
                    self.write_epub(handle, structure, chapters);
                }
                handle.metadata.compiled_file = Some(COMPILED_FILE_NAME.to_string());
                handle.metadata.status = RunStatus::Completed;
                save_quietly(handle);
                reporter.report(
                    STAGE_FINISHED,
                    &format!(
                        "Livro '{}' finalizado com sucesso! Salvo em {}",
                        handle.metadata.request.theme,
                        path.display()
                    ),
                );
                Some(COMPILED_FILE_NAME.to_string())
            }
            Err(e) => {
                tracing::error!(run = %handle.id(), "failed to write compiled book: {}", e);
                reporter.report(STAGE_FINISHED, &format!("Erro ao compilar livro: {}", e));
                None
            }
        };

        if !failed_chapters.is_empty() {
            tracing::warn!(run = %handle.id(), ?failed_chapters, "book contains failed chapters");
        }

        GeneratedBook {
            run_id: handle.id().to_string(),
            content,
            failed_chapters,
            compiled_file,
        }
    }

    fn write_epub(&self, handle: &RunHandle, structure: &str, chapters: &[String]) {
        let path = handle.path(EPUB_FILE_NAME);
        let result = export_epub(&handle.metadata, structure, chapters)
            .map_err(|e| e.to_string())
            .and_then(|bytes| std::fs::write(&path, bytes).map_err(|e| e.to_string()));
        if let Err(e) = result {
            tracing::warn!(run = %handle.id(), "epub export failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_is_reachable_without_a_model_bound() {
        let profile = ModelProfile {
            temperature: 0.7,
            max_tokens: 3000,
        };
        let settings = GeneratorSettings {
            planning: profile,
            writing: profile,
            chapter_delay: Duration::ZERO,
            export_epub: false,
        };
        let generator = BookGenerator::new(Arc::new(()), RunStore::new("/tmp/livros"), settings);
        let copy = generator.clone();
        assert_eq!(copy.store().root(), std::path::Path::new("/tmp/livros"));
    }
}
