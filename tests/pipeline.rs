mod common;

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bookgen::config::ModelProfile;
use bookgen::models::{ChapterStatus, RunStatus};
use bookgen::services::generator::{BookGenerator, GenerationError, GeneratorSettings};
use bookgen::services::manifest::{
    COMPILED_FILE_NAME, EPUB_FILE_NAME, METADATA_FILE_NAME, RunStore, STRUCTURE_FILE_NAME,
    chapter_file_name, sha256_hex,
};
use bookgen::services::progress::NullReporter;
use common::{ScriptedModel, paragraphs, request};
use tempfile::tempdir;

const PROFILE: ModelProfile = ModelProfile {
    temperature: 0.7,
    max_tokens: 4000,
};

fn settings(export_epub: bool) -> GeneratorSettings {
    GeneratorSettings {
        planning: PROFILE,
        writing: PROFILE,
        chapter_delay: Duration::ZERO,
        export_epub,
    }
}

fn generator(model: &Arc<ScriptedModel>, root: &std::path::Path) -> BookGenerator<ScriptedModel> {
    BookGenerator::new(Arc::clone(model), RunStore::new(root), settings(false))
}

#[tokio::test]
async fn three_chapter_book_produces_expected_artifacts() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let model = Arc::new(ScriptedModel::ok([
        "ESTRUTURA: três capítulos sobre o farol",
        "Texto do primeiro capítulo.",
        "Texto do segundo capítulo.",
        "Texto do terceiro capítulo.",
    ]));
    let generator = generator(&model, temp.path());

    let book = generator
        .generate(request("O Farol", 3), None, &NullReporter)
        .await?;
    model.assert_empty();
    assert!(book.failed_chapters.is_empty());
    assert_eq!(book.compiled_file.as_deref(), Some(COMPILED_FILE_NAME));

    let handle = generator.store().view_run(&book.run_id)?;
    assert!(handle.dir.ends_with(format!("livro_{}", book.run_id)));
    for file in [METADATA_FILE_NAME, STRUCTURE_FILE_NAME, COMPILED_FILE_NAME] {
        assert!(handle.path(file).exists(), "missing {}", file);
    }
    for number in 1..=3 {
        assert!(handle.path(&chapter_file_name(number)).exists());
    }
    assert!(!handle.path(EPUB_FILE_NAME).exists());

    assert_eq!(handle.metadata.status, RunStatus::Completed);
    let record = handle.metadata.chapter(2).expect("chapter 2 record");
    assert_eq!(record.status, ChapterStatus::Done);
    assert_eq!(
        record.sha256.as_deref(),
        Some(sha256_hex("Texto do segundo capítulo.").as_str())
    );
    assert_eq!(record.word_count, Some(4));

    let compiled = fs::read_to_string(handle.path(COMPILED_FILE_NAME))?;
    assert_eq!(compiled, book.content);
    assert_eq!(compiled.matches("ESTRUTURA: três capítulos").count(), 1);
    let first = compiled.find("## Capítulo 1").expect("heading 1");
    let second = compiled.find("## Capítulo 2").expect("heading 2");
    let third = compiled.find("## Capítulo 3").expect("heading 3");
    assert!(first < second && second < third);
    assert!(compiled.find("Texto do terceiro capítulo.") > Some(third));
    assert!(compiled.starts_with("# O FAROL"));
    Ok(())
}

#[tokio::test]
async fn failed_chapter_becomes_placeholder_and_run_continues() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let model = Arc::new(ScriptedModel::new([
        Ok("Estrutura".to_string()),
        Ok("Capítulo um.".to_string()),
        Err("limite de requisições".to_string()),
        Ok("Capítulo três.".to_string()),
    ]));
    let generator = generator(&model, temp.path());

    let book = generator
        .generate(request("Tempestade", 3), None, &NullReporter)
        .await?;

    assert_eq!(book.failed_chapters, vec![2]);
    assert!(
        book.content
            .contains("## Capítulo 2\n\n[ERRO NO CAPÍTULO 2: limite de requisições]")
    );
    assert!(book.content.contains("Capítulo três."));

    let handle = generator.store().view_run(&book.run_id)?;
    assert_eq!(handle.metadata.status, RunStatus::Completed);
    assert!(matches!(
        handle.metadata.chapter(2).map(|c| &c.status),
        Some(ChapterStatus::Failed { error }) if error == "limite de requisições"
    ));
    assert!(!handle.path(&chapter_file_name(2)).exists());
    Ok(())
}

#[tokio::test]
async fn long_previous_chapters_are_excerpted_in_later_prompts() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let model = Arc::new(ScriptedModel::ok([
        "Estrutura".to_string(),
        paragraphs("Um", 10),
        "Curto.".to_string(),
    ]));
    let generator = generator(&model, temp.path());

    generator
        .generate(request("Floresta", 2), None, &NullReporter)
        .await?;

    let tasks = model.tasks();
    assert_eq!(tasks.len(), 3);
    assert!(!tasks[1].description.contains("CONTEÚDO DOS CAPÍTULOS ANTERIORES"));

    let second = &tasks[2].description;
    assert!(second.contains("--- CAPÍTULO 1 ---"));
    assert!(second.contains("Um parágrafo 3."));
    assert!(second.contains("[...]"));
    assert!(second.contains("Um parágrafo 8."));
    assert!(!second.contains("Um parágrafo 5."));
    assert!(second.contains("Capítulo 2 de 2"));
    Ok(())
}

#[tokio::test]
async fn resume_skips_finished_chapters_and_reuses_their_text() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let store = RunStore::new(temp.path());

    // A run interrupted while writing chapter 2.
    let mut handle = store.create_run(request("Montanha", 3), None)?;
    let run_id = handle.id().to_string();
    handle.write_text(STRUCTURE_FILE_NAME, "Estrutura salva")?;
    handle.metadata.structure_file = Some(STRUCTURE_FILE_NAME.to_string());
    let chapter_one = "Texto original do capítulo um.";
    handle.write_text(&chapter_file_name(1), chapter_one)?;
    {
        let record = handle.metadata.chapter_mut(1).expect("chapter 1");
        record.status = ChapterStatus::Done;
        record.file = Some(chapter_file_name(1));
        record.sha256 = Some(sha256_hex(chapter_one));
    }
    handle.metadata.chapter_mut(2).expect("chapter 2").status = ChapterStatus::InProgress;
    handle.metadata.status = RunStatus::Writing;
    handle.save()?;

    let model = Arc::new(ScriptedModel::ok(["Novo capítulo dois.", "Novo capítulo três."]));
    let generator = generator(&model, temp.path());
    let book = generator.resume(&run_id, &NullReporter).await?;
    model.assert_empty();

    let tasks = model.tasks();
    assert_eq!(tasks.len(), 2);
    assert!(tasks[0].description.contains("Capítulo 2 de 3"));
    assert!(tasks[0].description.contains("Estrutura salva"));
    assert!(tasks[0].description.contains(chapter_one));

    assert!(book.content.contains(&format!("## Capítulo 1\n\n{}", chapter_one)));
    assert!(book.content.contains("Novo capítulo três."));
    assert_eq!(book.content.matches("Estrutura salva").count(), 1);

    let metadata = store.read_manifest(&run_id)?;
    assert_eq!(metadata.status, RunStatus::Completed);
    assert_eq!(metadata.completed_chapters(), 3);
    Ok(())
}

#[tokio::test]
async fn edited_chapter_file_is_regenerated_on_resume() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let model = Arc::new(ScriptedModel::ok(["Estrutura", "Primeiro.", "Segundo."]));
    let generator = generator(&model, temp.path());
    let book = generator
        .generate(request("Rio", 2), None, &NullReporter)
        .await?;

    let handle = generator.store().view_run(&book.run_id)?;
    fs::write(handle.path(&chapter_file_name(2)), "editado à mão")?;

    let again = Arc::new(ScriptedModel::ok(["Segundo refeito."]));
    let resumed = BookGenerator::new(Arc::clone(&again), RunStore::new(temp.path()), settings(false))
        .resume(&book.run_id, &NullReporter)
        .await?;
    again.assert_empty();
    assert!(resumed.content.contains("Primeiro."));
    assert!(resumed.content.contains("Segundo refeito."));
    assert!(!resumed.content.contains("editado à mão"));
    Ok(())
}

#[tokio::test]
async fn planning_failure_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let model = Arc::new(ScriptedModel::new([Err("sem conexão".to_string())]));
    let generator = generator(&model, temp.path());

    let result = generator
        .generate(request("Deserto", 2), None, &NullReporter)
        .await;
    let err = result.expect_err("planning failure must abort the run");
    assert!(matches!(err, GenerationError::Planning(_)));
    assert!(err.to_string().starts_with("Erro ao gerar estrutura"));
    assert_eq!(model.tasks().len(), 1);

    let runs = generator.store().list_runs(None)?;
    assert_eq!(runs.len(), 1);
    assert!(matches!(runs[0].status, RunStatus::Failed { .. }));
    let handle = generator.store().view_run(&runs[0].id)?;
    assert!(!handle.path(COMPILED_FILE_NAME).exists());
    assert!(!handle.path(&chapter_file_name(1)).exists());
    Ok(())
}

#[tokio::test]
async fn progress_stages_are_reported_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let model = Arc::new(ScriptedModel::ok(["Estrutura", "Um.", "Dois."]));
    let generator = generator(&model, temp.path());

    let events = Mutex::new(Vec::new());
    let reporter = |stage: u32, message: &str| {
        events
            .lock()
            .expect("events mutex")
            .push((stage, message.to_string()));
    };
    generator
        .generate(request("Cidade", 2), None, &reporter)
        .await?;

    let events = events.into_inner().expect("events mutex");
    let stages: Vec<u32> = events.iter().map(|(stage, _)| *stage).collect();
    assert_eq!(stages, vec![1, 2, 3, 4, 4, 4, 4, 5, 6]);
    assert_eq!(events[3].1, "Gerando capítulo 1 de 2...");
    assert_eq!(events[4].1, "Capítulo 1 gerado com 1 palavras.");
    assert_eq!(events[6].1, "Capítulo 2 gerado com 1 palavras.");
    Ok(())
}

#[tokio::test]
async fn epub_is_written_when_enabled() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let model = Arc::new(ScriptedModel::ok(["Estrutura", "Único capítulo."]));
    let generator = BookGenerator::new(Arc::clone(&model), RunStore::new(temp.path()), settings(true));

    let book = generator
        .generate(request("Jardim", 1), None, &NullReporter)
        .await?;
    let handle = generator.store().view_run(&book.run_id)?;
    let bytes = fs::read(handle.path(EPUB_FILE_NAME))?;
    assert!(bytes.starts_with(b"PK"));
    Ok(())
}
