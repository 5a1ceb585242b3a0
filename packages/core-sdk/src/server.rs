use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, get_service, post, put},
    Json, Router,
};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tower_http::services::ServeDir;

use crate::conversation::{ConversationCore, SendOptions, ViewState};
use crate::error::ChatError;
use crate::models::{Chat, Message, Role};
use crate::settings::{Settings, SettingsStore};
use crate::speech::{HttpSpeech, Synthesizer, Transcriber};
use crate::{db, telemetry};

type ApiError = (StatusCode, String);

/**
 * \brief 服务共享状态：会话核心、语音服务与设置数据库路径。
 */
#[derive(Clone)]
pub struct AppState {
    core: Arc<ConversationCore>,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn Synthesizer>,
    db_path: Arc<PathBuf>,
}

impl AppState {
    pub fn new(core: Arc<ConversationCore>, db_path: PathBuf) -> Self {
        let speech = Arc::new(HttpSpeech::new());
        Self {
            core,
            transcriber: speech.clone(),
            synthesizer: speech,
            db_path: Arc::new(db_path),
        }
    }
}

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 * \param db_path 设置所在的 SQLite 文件
 */
pub async fn run(addr: &str, db_path: PathBuf) -> Result<()> {
    let settings = {
        let conn = db::open_db(&db_path)?;
        db::migrate(&conn)?;
        SettingsStore::new(&conn).load()
    };
    let core = Arc::new(ConversationCore::with_defaults());
    // failures are already published as notices; the server still starts in local mode
    let _ = core.change_settings(settings).await;

    let app = router(AppState::new(core, db_path));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target: "chatwell", "server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 组装路由：API 与静态前端回退。
 */
pub fn router(state: AppState) -> Router {
    let ui_root = std::env::var("CHATWELL_UI_DIR").unwrap_or_else(|_| "web".to_string());
    let static_service = get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));

    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/events", get(events))
        .route("/api/settings", get(get_settings).put(save_settings))
        .route("/api/chats", get(list_chats).post(new_chat))
        .route("/api/chats/{id}", axum::routing::delete(delete_chat))
        .route("/api/chats/{id}/select", post(select_chat))
        .route("/api/messages", post(send_message))
        .route("/api/messages/{id}", put(edit_message))
        .route("/api/speech/transcribe", post(transcribe))
        .route("/api/speech/synthesize", post(synthesize))
        .fallback_service(static_service)
        .with_state(state)
}

#[derive(Serialize, Debug, PartialEq, Eq)]
struct MessageDto {
    /** \brief 对外 ID：已持久化为存储 ID，否则为乐观 ID */
    id: String,
    role: Role,
    content: String,
    persisted: bool,
}

impl From<&Message> for MessageDto {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id().to_string(),
            role: m.role,
            content: m.content.clone(),
            persisted: m.is_persisted(),
        }
    }
}

#[derive(Serialize, Debug)]
struct StateDto {
    synced: bool,
    chats: Vec<Chat>,
    active_id: Option<String>,
    messages: Vec<MessageDto>,
    loading: bool,
}

impl From<&ViewState> for StateDto {
    fn from(s: &ViewState) -> Self {
        Self {
            synced: s.synced,
            chats: s.chats.clone(),
            active_id: s.active_id.clone(),
            messages: s.messages.iter().map(MessageDto::from).collect(),
            loading: s.loading,
        }
    }
}

#[derive(Deserialize, Debug)]
struct SendRequest {
    /** \brief 用户输入 */
    text: String,
    /** \brief 编辑后重新生成时携带的消息 ID */
    #[serde(default)]
    edit_of: Option<String>,
}

#[derive(Deserialize, Debug)]
struct EditRequest {
    content: String,
}

#[derive(Deserialize, Debug)]
struct SynthesizeRequest {
    text: String,
}

fn status_for(err: &ChatError) -> StatusCode {
    match err {
        ChatError::Configuration(_) | ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ChatError::Backend(_) | ChatError::Provider(_) => StatusCode::BAD_GATEWAY,
    }
}

fn chat_err(err: ChatError) -> ApiError {
    (status_for(&err), err.to_string())
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn current_state(app: &AppState) -> Json<StateDto> {
    Json(StateDto::from(&app.core.snapshot()))
}

fn json_event<T: Serialize>(name: &str, value: &T) -> Event {
    Event::default()
        .event(name)
        .data(serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()))
}

async fn get_state(State(app): State<AppState>) -> Json<StateDto> {
    current_state(&app)
}

/**
 * \brief 状态变化与错误通知的 SSE 推送：`state` 事件携带完整状态，`notice` 事件携带通知。
 */
async fn events(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut states = app.core.subscribe();
    let mut notices = app.core.notices();
    let stream = async_stream::stream! {
        let initial = StateDto::from(&*states.borrow_and_update());
        yield Ok(json_event("state", &initial));
        loop {
            let event = tokio::select! {
                changed = states.changed() => match changed {
                    Ok(()) => {
                        let dto = StateDto::from(&*states.borrow_and_update());
                        json_event("state", &dto)
                    }
                    Err(_) => break,
                },
                notice = notices.recv() => match notice {
                    Ok(notice) => json_event("notice", &notice),
                    Err(RecvError::Lagged(skipped)) => {
                        telemetry::log_event("server.events", &format!("notice lagged skipped={}", skipped));
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            yield Ok(event);
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new())
}

/**
 * \brief 读取已保存的设置。
 */
async fn get_settings(State(app): State<AppState>) -> Result<Json<Settings>, ApiError> {
    let conn = db::open_db(app.db_path.as_path()).map_err(internal_err)?;
    Ok(Json(SettingsStore::new(&conn).load()))
}

/**
 * \brief 保存设置并应用到会话核心（可能切换本地/同步模式）。
 */
async fn save_settings(
    State(app): State<AppState>,
    Json(settings): Json<Settings>,
) -> Result<Json<StateDto>, ApiError> {
    {
        let conn = db::open_db(app.db_path.as_path()).map_err(internal_err)?;
        SettingsStore::new(&conn).save(&settings).map_err(internal_err)?;
    }
    telemetry::log_event("server.settings", "settings saved");
    app.core.change_settings(settings).await.map_err(chat_err)?;
    Ok(current_state(&app))
}

async fn list_chats(State(app): State<AppState>) -> Result<Json<StateDto>, ApiError> {
    app.core.refresh_chats().await.map_err(chat_err)?;
    Ok(current_state(&app))
}

async fn new_chat(State(app): State<AppState>) -> Result<Json<StateDto>, ApiError> {
    app.core.new_chat().await.map_err(chat_err)?;
    Ok(current_state(&app))
}

async fn select_chat(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StateDto>, ApiError> {
    app.core.select_chat(&id).await.map_err(chat_err)?;
    Ok(current_state(&app))
}

async fn delete_chat(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StateDto>, ApiError> {
    app.core.delete_chat(&id).await.map_err(chat_err)?;
    Ok(current_state(&app))
}

/**
 * \brief 发送消息；请求在回复生成并持久化后返回。
 */
async fn send_message(
    State(app): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<StateDto>, ApiError> {
    telemetry::log_event(
        "server.send",
        &format!("prompt_len={} regen={}", req.text.len(), req.edit_of.is_some()),
    );
    app.core
        .send_with(&req.text, SendOptions { edit_of: req.edit_of })
        .await
        .map_err(chat_err)?;
    Ok(current_state(&app))
}

async fn edit_message(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EditRequest>,
) -> Result<Json<StateDto>, ApiError> {
    app.core
        .edit_message(&id, &req.content)
        .await
        .map_err(chat_err)?;
    Ok(current_state(&app))
}

/**
 * \brief 语音转写：请求体为原始音频字节。
 */
async fn transcribe(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let settings = app.core.settings();
    let text = app
        .transcriber
        .transcribe(body.to_vec(), &settings)
        .await
        .map_err(chat_err)?;
    Ok(Json(serde_json::json!({ "text": text })))
}

/**
 * \brief 语音合成：返回音频字节，Content-Type 随服务商而定。
 */
async fn synthesize(
    State(app): State<AppState>,
    Json(req): Json<SynthesizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let settings = app.core.settings();
    let audio = app
        .synthesizer
        .synthesize(&req.text, &settings)
        .await
        .map_err(chat_err)?;
    Ok(([(header::CONTENT_TYPE, audio.mime)], audio.bytes))
}
