use std::time::Duration;

use chrono::Utc;

use crate::config::ModelProfile;
use crate::models::{BookRequest, ChapterStatus};
use crate::services::llm::{AgentTask, LanguageModel};
use crate::services::manifest::{RunHandle, chapter_file_name, sha256_hex};
use crate::services::progress::{ProgressReporter, STAGE_CHAPTER};

/// Chapters with more paragraphs than this are excerpted in later prompts.
const CONTEXT_PARAGRAPH_THRESHOLD: usize = 6;
const CONTEXT_KEEP_PARAGRAPHS: usize = 3;
pub const ELLIPSIS_MARKER: &str = "[...]";

pub fn error_placeholder(number: u32, error: &str) -> String {
    format!("[ERRO NO CAPÍTULO {}: {}]", number, error)
}

/// Keeps the first and last paragraphs of a long chapter.
pub fn compress_chapter(text: &str) -> String {
    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    if paragraphs.len() <= CONTEXT_PARAGRAPH_THRESHOLD {
        return text.to_string();
    }
    let head = paragraphs[..CONTEXT_KEEP_PARAGRAPHS].join("\n\n");
    let tail = paragraphs[paragraphs.len() - CONTEXT_KEEP_PARAGRAPHS..].join("\n\n");
    format!("{}\n\n{}\n\n{}", head, ELLIPSIS_MARKER, tail)
}

pub fn previous_chapters_context(chapters: &[String]) -> String {
    let mut context = String::new();
    if chapters.is_empty() {
        return context;
    }
    context.push_str("\nCONTEÚDO DOS CAPÍTULOS ANTERIORES:\n");
    for (idx, chapter) in chapters.iter().enumerate() {
        context.push_str(&format!("\n--- CAPÍTULO {} ---\n", idx + 1));
        context.push_str(&format!("\n{}\n", compress_chapter(chapter)));
    }
    context
}

/// Layout rules for Amazon KDP publication, shared by every chapter prompt.
const KDP_FORMATTING: &str = "FORMATAÇÃO PARA KDP (Amazon):\n\
- Estruture o livro com: página de título, dedicatória (opcional), direitos autorais, sumário/índice, capítulos, sobre o autor (no final).\n\
- Cada capítulo deve começar em uma nova página e ter o título centralizado (estilo \"Título 1\").\n\
- Utilize fonte clara e legível (Times New Roman ou Arial, tamanho 12), texto justificado, recuo de 5 mm na primeira linha de cada parágrafo, espaçamento simples.\n\
- Inclua sumário/índice no início, com os títulos dos capítulos.\n\
- Se inserir imagens, use apenas como ilustração e indique onde elas devem aparecer.\n\
- Adicione, se possível, uma breve seção \"Sobre o autor\" ao final.\n\
- Siga rigorosamente as normas de formatação para publicação na Amazon KDP.\n";

/// The three position-dependent lines of the chapter instructions.
pub fn positional_instructions(number: u32, total: u32) -> [&'static str; 3] {
    let opening = if number == 1 {
        "Inicie a história apresentando os personagens e o cenário."
    } else {
        "Continue exatamente de onde o capítulo anterior parou."
    };
    let middle = if number > 1 && number < total {
        "Desenvolva o conflito principal."
    } else {
        ""
    };
    let closing = if number == total {
        "Conclua a história com uma resolução satisfatória."
    } else {
        "Termine em um ponto que crie expectativa para o próximo capítulo."
    };
    [opening, middle, closing]
}

pub fn chapter_task(
    request: &BookRequest,
    structure: &str,
    number: u32,
    previous: &[String],
    profile: ModelProfile,
) -> AgentTask {
    let total = request.chapter_count;
    let words = request.words_per_chapter();
    let [opening, middle, closing] = positional_instructions(number, total);

    let mut context = format!(
        "ESTRUTURA DO LIVRO:\n{structure}\n\n\
         INSTRUÇÕES PARA ESTE CAPÍTULO:\n\
         Você está escrevendo o Capítulo {number} de {total}.\n\
         Cada capítulo deve ser detalhado, extenso e completo, com bastante desenvolvimento de cenas, diálogos e descrições.\n"
    );
    context.push_str(&previous_chapters_context(previous));

    let description = format!(
        "Escrever o Capítulo {number} baseado na estrutura e contexto fornecidos.\n\n\
         {context}\n\
         INSTRUÇÕES IMPORTANTES:\n\
         1. {opening}\n\
         2. {middle}\n\
         3. {closing}\n\
         4. Garanta que o conteúdo seja apropriado para o público {audience} e siga as convenções do gênero {genre} com estilo {style}.\n\
         5. Certifique-se de incluir título e conteúdo.\n\
         6. O capítulo deve ter aproximadamente {words} palavras.\n\
         7. Se o nome do personagem principal for especificado na descrição, use exatamente esse nome em toda a história.\n\n\
         {KDP_FORMATTING}\n\
         DESCRIÇÃO DO LIVRO: {description}\n",
        audience = request.audience,
        genre = request.genre,
        style = request.style,
        description = request.description,
    );

    AgentTask {
        role: format!("Escritor do Capítulo {}", number),
        goal: format!(
            "Escrever um capítulo completo e cativante, seguindo fielmente a estrutura fornecida e mantendo a continuidade narrativa. \
             Este capítulo deve ter pelo menos {} palavras. Mantenha a história coerente, conectada e sem deixar pontas soltas.",
            words
        ),
        backstory: format!(
            "Escritor especializado em {} com estilo {}, criador de histórias envolventes sobre '{}' para o público {}.",
            request.genre, request.style, request.theme, request.audience
        ),
        description,
        expected_output: format!(
            "O capítulo {} completo com título e conteúdo, seguindo todas as instruções. \
             Deve ser estruturado em parágrafos separados por linhas em branco.",
            number
        ),
        profile,
    }
}

/// Sequential chapter generation over a run manifest.
pub struct ChapterWriter<'a, M> {
    model: &'a M,
    profile: ModelProfile,
    delay: Duration,
}

impl<'a, M: LanguageModel> ChapterWriter<'a, M> {
    pub fn new(model: &'a M, profile: ModelProfile, delay: Duration) -> Self {
        Self {
            model,
            profile,
            delay,
        }
    }

    /// Writes every chapter that is not already done. Returns one text per
    /// chapter in order; failed chapters yield an error placeholder.
    pub async fn write_all(
        &self,
        handle: &mut RunHandle,
        structure: &str,
        reporter: &dyn ProgressReporter,
    ) -> Vec<String> {
        let total = handle.metadata.request.chapter_count;
        let mut chapters: Vec<String> = Vec::with_capacity(total as usize);

        for number in 1..=total {
            if let Some(text) = self.load_done(handle, number) {
                tracing::info!(run = %handle.id(), chapter = number, "chapter already exists, skipping");
                reporter.report(
                    STAGE_CHAPTER,
                    &format!("Capítulo {} já existente. Pulando geração.", number),
                );
                chapters.push(text);
                continue;
            }

            set_status(handle, number, ChapterStatus::InProgress);
            reporter.report(
                STAGE_CHAPTER,
                &format!("Gerando capítulo {} de {}...", number, total),
            );

            match self.write_one(handle, structure, number, &chapters).await {
                Ok((text, word_count)) => {
                    reporter.report(
                        STAGE_CHAPTER,
                        &format!("Capítulo {} gerado com {} palavras.", number, word_count),
                    );
                    chapters.push(text);
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                }
                Err(error) => {
                    tracing::error!(run = %handle.id(), chapter = number, "chapter failed: {}", error);
                    set_status(
                        handle,
                        number,
                        ChapterStatus::Failed {
                            error: error.clone(),
                        },
                    );
                    reporter.report(
                        STAGE_CHAPTER,
                        &format!("Erro ao gerar capítulo {}: {}", number, error),
                    );
                    chapters.push(error_placeholder(number, &error));
                }
            }
        }

        chapters
    }

    fn load_done(&self, handle: &RunHandle, number: u32) -> Option<String> {
        let record = handle.metadata.chapter(number)?;
        if !record.is_done() {
            return None;
        }
        let file = record.file.as_deref()?;
        match handle.read_text(file) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(run = %handle.id(), chapter = number, "cannot reuse chapter: {}", e);
                None
            }
        }
    }

    async fn write_one(
        &self,
        handle: &mut RunHandle,
        structure: &str,
        number: u32,
        previous: &[String],
    ) -> Result<(String, usize), String> {
        let task = chapter_task(
            &handle.metadata.request,
            structure,
            number,
            previous,
            self.profile,
        );
        let text = self
            .model
            .invoke(&task)
            .await
            .map_err(|e| e.to_string())?;

        let word_count = text.split_whitespace().count();
        let file = chapter_file_name(number);
        handle.write_text(&file, &text).map_err(|e| e.to_string())?;

        if let Some(record) = handle.metadata.chapter_mut(number) {
            record.status = ChapterStatus::Done;
            record.file = Some(file);
            record.generated_at = Some(Utc::now());
            record.word_count = Some(word_count);
            record.sha256 = Some(sha256_hex(&text));
        }
        save_quietly(handle);

        tracing::info!(run = %handle.id(), chapter = number, word_count, "chapter written");
        Ok((text, word_count))
    }
}

fn set_status(handle: &mut RunHandle, number: u32, status: ChapterStatus) {
    if let Some(record) = handle.metadata.chapter_mut(number) {
        record.reset();
        record.status = status;
    }
    save_quietly(handle);
}

/// The manifest is a recovery aid; failing to persist it does not stop a run.
pub(crate) fn save_quietly(handle: &mut RunHandle) {
    if let Err(e) = handle.save() {
        tracing::warn!(run = %handle.id(), "failed to persist manifest: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookForm;

    fn paragraphs(count: usize) -> String {
        (1..=count)
            .map(|i| format!("Parágrafo {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn request(chapters: u32) -> BookRequest {
        BookRequest::from_form(
            BookForm {
                theme: "Ilha".to_string(),
                chapter_count: Some(chapters),
                target_words: Some(3_000),
                ..Default::default()
            },
            12,
            27_000,
        )
    }

    const PROFILE: ModelProfile = ModelProfile {
        temperature: 0.7,
        max_tokens: 4000,
    };

    #[test]
    fn short_chapters_are_kept_whole() {
        let text = paragraphs(6);
        assert_eq!(compress_chapter(&text), text);
    }

    #[test]
    fn long_chapters_keep_three_head_and_tail_paragraphs() {
        let compressed = compress_chapter(&paragraphs(10));
        assert_eq!(
            compressed,
            "Parágrafo 1.\n\nParágrafo 2.\n\nParágrafo 3.\n\n[...]\n\nParágrafo 8.\n\nParágrafo 9.\n\nParágrafo 10."
        );
    }

    #[test]
    fn context_labels_each_previous_chapter() {
        let context = previous_chapters_context(&["A".to_string(), "B".to_string()]);
        let first = context.find("--- CAPÍTULO 1 ---").unwrap();
        let second = context.find("--- CAPÍTULO 2 ---").unwrap();
        assert!(first < second);
        assert!(previous_chapters_context(&[]).is_empty());
    }

    #[test]
    fn positional_instructions_depend_on_chapter_position() {
        let first = positional_instructions(1, 3);
        assert!(first[0].contains("apresentando"));
        assert!(first[1].is_empty());

        let middle = positional_instructions(2, 3);
        assert!(middle[0].contains("Continue"));
        assert_eq!(middle[1], "Desenvolva o conflito principal.");
        assert!(middle[2].contains("expectativa"));

        let last = positional_instructions(3, 3);
        assert!(last[2].contains("Conclua"));

        let only = positional_instructions(1, 1);
        assert!(only[0].contains("apresentando"));
        assert!(only[2].contains("Conclua"));
    }

    #[test]
    fn chapter_task_carries_structure_and_word_target() {
        let task = chapter_task(&request(3), "ESTRUTURA-XYZ", 2, &["Anterior.".to_string()], PROFILE);
        assert_eq!(task.role, "Escritor do Capítulo 2");
        assert!(task.description.contains("ESTRUTURA-XYZ"));
        assert!(task.description.contains("Capítulo 2 de 3"));
        assert!(task.description.contains("Anterior."));
        assert!(task.goal.contains("1000 palavras"));
        assert_eq!(task.profile, PROFILE);
    }

    #[test]
    fn chapter_task_includes_kdp_formatting_rules() {
        let task = chapter_task(&request(2), "Estrutura", 1, &[], PROFILE);
        let rules = task.description.find("FORMATAÇÃO PARA KDP (Amazon):").unwrap();
        let book = task.description.find("DESCRIÇÃO DO LIVRO:").unwrap();
        assert!(rules < book);
        assert!(task.description.contains("Times New Roman ou Arial, tamanho 12"));
    }

    #[test]
    fn placeholder_names_the_chapter() {
        assert_eq!(error_placeholder(4, "timeout"), "[ERRO NO CAPÍTULO 4: timeout]");
    }
}
