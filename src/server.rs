use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{AppError, Result};
use crate::models::{BookForm, BookMetadata, BookRequest, ChapterStatus, PublicUser, RunStatus};
use crate::services::accounts::{AccountError, AccountService, JsonUserStore};
use crate::services::compiler::export_epub;
use crate::services::generator::BookGenerator;
use crate::services::llm::LanguageModel;
use crate::services::manifest::{COMPILED_FILE_NAME, EPUB_FILE_NAME, RunHandle};
use crate::services::progress::ProgressRegistry;
use crate::services::writer::error_placeholder;

pub struct AppState<M> {
    pub generator: BookGenerator<M>,
    pub accounts: Arc<AccountService<JsonUserStore>>,
    pub progress: ProgressRegistry,
    pub default_chapters: u32,
    pub target_words: u32,
}

impl<M> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            generator: self.generator.clone(),
            accounts: Arc::clone(&self.accounts),
            progress: self.progress.clone(),
            default_chapters: self.default_chapters,
            target_words: self.target_words,
        }
    }
}

pub fn create_router<M: LanguageModel + 'static>(state: AppState<M>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/api/auth/register", post(register::<M>))
        .route("/api/auth/login", post(login::<M>))
        .route("/api/auth/logout", post(logout::<M>))
        .route("/api/auth/password-reset", post(request_password_reset::<M>))
        .route(
            "/api/auth/password-reset/confirm",
            post(confirm_password_reset::<M>),
        )
        .route("/api/admin/subscriptions", post(update_subscription::<M>))
        .route("/api/books", post(start_book::<M>).get(list_books::<M>))
        .route("/api/books/in-progress", get(book_in_progress::<M>))
        .route("/api/books/:id", get(get_book::<M>))
        .route("/api/books/:id/resume", post(resume_book::<M>))
        .route("/api/books/:id/download", get(download_book::<M>))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::AllowMethods::any())
                .allow_headers(tower_http::cors::AllowHeaders::any()),
        )
}

async fn index() -> Html<&'static str> {
    Html(
        r#"
    <!DOCTYPE html>
    <html>
    <head>
        <title>Gerador de Livros</title>
        <meta charset="utf-8">
        <style>
            body { font-family: Arial, sans-serif; margin: 40px; }
            .info-box { background-color: #f0f8ff; padding: 20px; border-radius: 8px; margin: 20px 0; }
            .endpoint { background-color: #f5f5f5; padding: 10px; margin: 10px 0; border-radius: 4px; font-family: monospace; }
        </style>
    </head>
    <body>
        <h1>Gerador de Livros</h1>

        <div class="info-box">
            <h2>Service Information</h2>
            <p>Plans a book structure and writes it chapter by chapter with a language model.</p>
            <p>Runs are resumable: finished chapters are kept when a run is continued.</p>
        </div>

        <h2>Available Endpoints:</h2>
        <div class="endpoint">GET /health - Health check</div>
        <div class="endpoint">POST /api/auth/register - Create an account</div>
        <div class="endpoint">POST /api/auth/login - Obtain a session token</div>
        <div class="endpoint">POST /api/auth/password-reset - Request a reset link</div>
        <div class="endpoint">POST /api/books - Start a book (requires subscription)</div>
        <div class="endpoint">GET /api/books - List your books</div>
        <div class="endpoint">GET /api/books/in-progress - Latest unfinished book</div>
        <div class="endpoint">GET /api/books/{id} - Manifest and progress</div>
        <div class="endpoint">POST /api/books/{id}/resume - Continue an interrupted book</div>
        <div class="endpoint">GET /api/books/{id}/download?format=txt|md|epub - Download</div>
    </body>
    </html>
    "#,
    )
}

async fn health_check() -> &'static str {
    "OK"
}

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))
}

fn current_user<M>(state: &AppState<M>, headers: &HeaderMap) -> Result<PublicUser> {
    let token = bearer_token(headers)?;
    Ok(state.accounts.session(token)?)
}

fn require_generation_rights<M>(state: &AppState<M>, headers: &HeaderMap) -> Result<PublicUser> {
    let user = current_user(state, headers)?;
    if !state.accounts.can_generate(&user) {
        return Err(AppError::SubscriptionRequired);
    }
    Ok(user)
}

/// Runs are only visible to their owner and to admins.
fn owned_run<M>(state: &AppState<M>, user: &PublicUser, id: &str) -> Result<RunHandle> {
    let handle = state.generator.store().view_run(id)?;
    if !user.is_admin && handle.metadata.owner_id.as_deref() != Some(user.id.as_str()) {
        return Err(AppError::NotFound(format!("run `{}` not found", id)));
    }
    Ok(handle)
}

fn spawn_run<M: LanguageModel + 'static>(state: &AppState<M>, handle: RunHandle) {
    let generator = state.generator.clone();
    let progress = state.progress.clone();
    let run_id = handle.id().to_string();

    tokio::spawn(async move {
        let _active = progress.release_on_drop(&run_id);
        let reporter = progress.reporter(&run_id);
        match generator.execute(handle, &reporter).await {
            Ok(book) => tracing::info!(
                run = %run_id,
                failed = book.failed_chapters.len(),
                "run finished"
            ),
            Err(e) => tracing::error!(run = %run_id, "run aborted: {}", e),
        }
    });
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    name: String,
    email: String,
    password: String,
}

async fn register<M>(
    State(state): State<AppState<M>>,
    Json(body): Json<RegisterBody>,
) -> Result<(StatusCode, Json<PublicUser>)> {
    let user = state
        .accounts
        .register(&body.name, &body.email, &body.password)?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

async fn login<M>(
    State(state): State<AppState<M>>,
    Json(body): Json<LoginBody>,
) -> Result<impl IntoResponse> {
    let session = state.accounts.authenticate(&body.email, &body.password)?;
    Ok(Json(session))
}

async fn logout<M>(State(state): State<AppState<M>>, headers: HeaderMap) -> Result<StatusCode> {
    let token = bearer_token(&headers)?;
    state.accounts.logout(token);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ResetRequestBody {
    email: String,
}

async fn request_password_reset<M>(
    State(state): State<AppState<M>>,
    Json(body): Json<ResetRequestBody>,
) -> Result<Json<serde_json::Value>> {
    match state.accounts.request_password_reset(&body.email) {
        Ok(_) => {}
        Err(AccountError::UnknownEmail) => {
            tracing::info!("password reset requested for unknown e-mail");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(Json(json!({
        "message": "Se o e-mail estiver cadastrado, um link de redefinição foi enviado."
    })))
}

#[derive(Debug, Deserialize)]
struct ResetConfirmBody {
    token: String,
    new_password: String,
}

async fn confirm_password_reset<M>(
    State(state): State<AppState<M>>,
    Json(body): Json<ResetConfirmBody>,
) -> Result<Json<serde_json::Value>> {
    state
        .accounts
        .reset_password(&body.token, &body.new_password)?;
    Ok(Json(json!({ "message": "Senha redefinida com sucesso!" })))
}

#[derive(Debug, Deserialize)]
struct SubscriptionBody {
    user_id: String,
    active: bool,
}

async fn update_subscription<M>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    Json(body): Json<SubscriptionBody>,
) -> Result<Json<PublicUser>> {
    let caller = current_user(&state, &headers)?;
    if !caller.is_admin {
        return Err(AppError::Forbidden("admin only".to_string()));
    }
    let user = state
        .accounts
        .update_subscription_status(&body.user_id, body.active)?;
    Ok(Json(user))
}

async fn start_book<M: LanguageModel + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    Json(form): Json<BookForm>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let user = require_generation_rights(&state, &headers)?;
    let request = BookRequest::from_form(form, state.default_chapters, state.target_words);
    let handle = state.generator.start(request, Some(user.id.clone()))?;
    let run_id = handle.id().to_string();

    state.progress.try_activate(&run_id);
    spawn_run(&state, handle);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "run_id": run_id,
            "status_url": format!("/api/books/{}", run_id),
        })),
    ))
}

async fn list_books<M>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let user = current_user(&state, &headers)?;
    let owner = (!user.is_admin).then_some(user.id.as_str());
    let runs = state.generator.store().list_runs(owner)?;
    let summaries: Vec<_> = runs.iter().map(BookMetadata::summary).collect();
    Ok(Json(json!({ "books": summaries })))
}

async fn book_in_progress<M>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let user = current_user(&state, &headers)?;
    let latest = state
        .generator
        .store()
        .latest_unfinished(Some(user.id.as_str()))?;
    let running = latest
        .as_ref()
        .is_some_and(|run| state.progress.is_active(&run.id));
    Ok(Json(json!({
        "book": latest.as_ref().map(BookMetadata::summary),
        "running": running,
    })))
}

async fn get_book<M>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let user = current_user(&state, &headers)?;
    let handle = owned_run(&state, &user, &id)?;
    Ok(Json(json!({
        "manifest": handle.metadata,
        "running": state.progress.is_active(&id),
        "progress": state.progress.events(&id),
    })))
}

async fn resume_book<M: LanguageModel + 'static>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let user = require_generation_rights(&state, &headers)?;
    let current = owned_run(&state, &user, &id)?;
    // Completed runs with failed chapters can be resumed to retry them.
    if current.metadata.status == RunStatus::Completed
        && current.metadata.failed_chapters().is_empty()
    {
        return Err(AppError::Conflict(format!("run `{}` is already completed", id)));
    }
    if !state.progress.try_activate(&id) {
        return Err(AppError::Conflict(format!("run `{}` is already running", id)));
    }

    let handle = match state.generator.store().load_run(&id) {
        Ok(handle) => handle,
        Err(e) => {
            state.progress.deactivate(&id);
            return Err(e.into());
        }
    };
    spawn_run(&state, handle);

    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": id }))))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    format: Option<String>,
}

fn download_name(theme: &str, extension: &str) -> String {
    let stem: String = theme
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("livro_{}.{}", stem, extension)
}

/// Chapter texts as they appear in the compiled book.
fn chapter_texts(handle: &RunHandle) -> Result<Vec<String>> {
    handle
        .metadata
        .chapters
        .iter()
        .map(|record| match (&record.status, &record.file) {
            (ChapterStatus::Done, Some(file)) => handle.read_text(file).map_err(AppError::from),
            (ChapterStatus::Failed { error }, _) => Ok(error_placeholder(record.number, error)),
            _ => Err(AppError::Conflict(format!(
                "chapter {} has not been written",
                record.number
            ))),
        })
        .collect()
}

async fn download_book<M>(
    State(state): State<AppState<M>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let user = current_user(&state, &headers)?;
    let handle = owned_run(&state, &user, &id)?;
    if handle.metadata.status != RunStatus::Completed {
        return Err(AppError::Conflict(format!("run `{}` is not finished", id)));
    }
    let format = query.format.as_deref().unwrap_or("txt");

    let (content_type, extension, body): (&str, &str, Vec<u8>) = match format {
        "txt" | "md" => {
            let text = handle.read_text(COMPILED_FILE_NAME)?;
            let content_type = if format == "md" {
                "text/markdown; charset=utf-8"
            } else {
                "text/plain; charset=utf-8"
            };
            (content_type, format, text.into_bytes())
        }
        "epub" => {
            let bytes = match std::fs::read(handle.path(EPUB_FILE_NAME)) {
                Ok(bytes) => bytes,
                Err(_) => {
                    let structure = match &handle.metadata.structure_file {
                        Some(file) => handle.read_text(file)?,
                        None => String::new(),
                    };
                    let chapters = chapter_texts(&handle)?;
                    export_epub(&handle.metadata, &structure, &chapters)
                        .map_err(|e| AppError::Internal(e.to_string()))?
                }
            };
            ("application/epub+zip", "epub", bytes)
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "unsupported format `{}`; expected txt, md or epub",
                other
            )));
        }
    };

    let disposition = format!(
        "attachment; filename=\"{}\"",
        download_name(&handle.metadata.request.theme, extension)
    );
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_names_are_ascii_safe() {
        assert_eq!(download_name("O Mar Azul", "txt"), "livro_O_Mar_Azul.txt");
        assert_eq!(download_name("Coração", "md"), "livro_Cora__o.md");
    }

    #[test]
    fn bearer_token_requires_prefix() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, "Token abc".parse().unwrap());
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "abc");
    }
}
