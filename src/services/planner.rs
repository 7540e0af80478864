use crate::config::ModelProfile;
use crate::models::BookRequest;
use crate::services::llm::{AgentTask, LanguageModel, LlmError};

pub fn structure_task(request: &BookRequest, profile: ModelProfile) -> AgentTask {
    let BookRequest {
        theme,
        genre,
        style,
        audience,
        chapter_count,
        ..
    } = request;

    AgentTask {
        role: "Planejador e Estruturador de Livros".to_string(),
        goal: format!(
            "Definir a estrutura do livro sobre '{theme}' com elementos necessários: \
             título, capítulos, personagens e arco narrativo consistente com o gênero {genre} e estilo {style}."
        ),
        backstory: format!(
            "Especialista em estruturação de livros do gênero {genre} com estilo {style}, \
             focado no tema '{theme}'. Conhece os requisitos da Amazon KDP para publicação."
        ),
        description: format!(
            "Criar a estrutura do livro sobre '{theme}' do gênero {genre} com estilo {style} para o público {audience}, \
             incluindo título, subtítulo, sumário e personagens.\n\n\
             Desenvolva uma única história contínua ao longo de {chapter_count} capítulos, com personagens \
             consistentes e um arco narrativo adequado. Para cada capítulo, forneça um título e um resumo \
             detalhado do que acontecerá.\n\n\
             DESCRIÇÃO DO LIVRO: {}",
            request.description
        ),
        expected_output: format!(
            "Estrutura completa com:\n\
             1. Título e subtítulo do livro\n\
             2. Lista de {chapter_count} capítulos com títulos e resumos detalhados (pelo menos 3 parágrafos por capítulo)\n\
             3. Personagens principais com descrição de características físicas e psicológicas\n\
             4. Arco narrativo principal completo"
        ),
        profile,
    }
}

/// Asks the planning agent for the whole-book structure. The answer is
/// opaque text and is never parsed.
pub async fn plan_structure<M: LanguageModel>(
    model: &M,
    request: &BookRequest,
    profile: ModelProfile,
) -> Result<String, LlmError> {
    let task = structure_task(request, profile);
    model.invoke(&task).await
}
