use std::path::PathBuf;

use rocket::fs::NamedFile;
use rocket::futures::StreamExt;
use rocket::http::{ContentType, Status};
use rocket::response::content::RawHtml;
use rocket::response::stream::TextStream;
use rocket::serde::json::Json;
use rocket::tokio::task;
use rocket::{catch, get, options, post, Request, Responder, State};
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::chat::paced;
use crate::error::ChatError;
use crate::types::{ChatRequest, ChatResponse, ErrorResponse, HealthResponse};

const FALLBACK_INDEX: &str = "<!DOCTYPE html>\
<html><head><title>Chatbot</title></head><body>\
<h1>Chatbot API</h1>\
<p>No frontend is installed. Use <code>POST /chat</code>, \
<code>GET /chat/stream?message=...</code> or check <a href=\"/health\">/health</a>.</p>\
</body></html>";

#[derive(Responder)]
pub enum IndexPage {
    File(NamedFile),
    Fallback(RawHtml<&'static str>),
}

#[get("/")]
pub async fn index(state: &State<AppState>) -> IndexPage {
    let path: PathBuf = state.config.static_dir.join("index.html");
    match NamedFile::open(&path).await {
        Ok(file) => IndexPage::File(file),
        Err(_) => IndexPage::Fallback(RawHtml(FALLBACK_INDEX)),
    }
}

#[get("/health")]
pub async fn health(state: &State<AppState>) -> Json<HealthResponse> {
    Json(state.health())
}

#[post("/chat", data = "<req>")]
pub async fn chat(
    state: &State<AppState>,
    req: Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ChatError> {
    state.chat.handle(req.into_inner()).await.map(Json)
}

/// 先完整生成，再按词推送；词与词之间停顿 stream_delay
///
/// Frames are written verbatim as `data: <json>\n\n`, with no comments or
/// keep-alive lines in between.
#[get("/chat/stream?<message>")]
pub async fn chat_stream(
    state: &State<AppState>,
    message: Option<String>,
) -> Result<(ContentType, TextStream![String]), ChatError> {
    let message = message.unwrap_or_default();
    let chunks = state.chat.stream(&message).await?;
    let frames = paced(chunks, state.config.stream_delay).map(|chunk| chunk.to_sse_frame());
    Ok((ContentType::EventStream, TextStream(frames)))
}

/// 手动重新加载模型（启动加载失败后的恢复手段）
#[post("/admin/reload")]
pub async fn reload(state: &State<AppState>) -> Result<Json<HealthResponse>, ChatError> {
    let session = state.session.clone();
    let loaded = task::spawn_blocking(move || session.reload())
        .await
        .map_err(|e| ChatError::Internal(format!("reload task failed: {e}")))?;
    info!(loaded, "manual model reload finished");
    Ok(Json(state.health()))
}

#[options("/<_..>")]
pub fn preflight() -> Status {
    Status::NoContent
}

/// 所有错误状态统一返回 `{"detail": ...}`，包括请求体解析失败和未知路径
#[catch(default)]
pub fn default_catcher(status: Status, req: &Request<'_>) -> (Status, Json<ErrorResponse>) {
    debug!(%status, uri = %req.uri(), "request rejected before reaching a handler");
    let detail = match status.code {
        400 => "Malformed request".to_string(),
        404 => "Not found".to_string(),
        422 => "Invalid request body".to_string(),
        _ => status.reason().unwrap_or("Request failed").to_string(),
    };
    (status, Json(ErrorResponse { detail }))
}
