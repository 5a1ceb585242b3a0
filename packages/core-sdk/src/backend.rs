use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::db::SqliteStore;
use crate::models::{Chat, Message, Role, PLACEHOLDER_TITLE};
use crate::telemetry;

/**
 * \brief 远端表存储的通用 CRUD 契约（chats / messages 两张表）。
 * \details 所有操作失败时返回携带可读信息的错误，调用方不区分错误子类。
 */
#[async_trait]
pub trait TableStore: Send + Sync {
    /** \brief 全部会话，按 updated_at 降序。 */
    async fn list_chats(&self) -> Result<Vec<Chat>>;
    /** \brief 新建会话，由存储分配 id 与时间戳。 */
    async fn create_chat(&self, title: &str) -> Result<Chat>;
    async fn update_chat_title(&self, chat_id: &str, title: &str) -> Result<()>;
    /** \brief 删除会话；其消息的级联删除由存储负责。 */
    async fn delete_chat(&self, chat_id: &str) -> Result<()>;
    /** \brief 会话内全部消息，按创建时间升序。 */
    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>>;
    /** \brief 有界存在性查询：会话是否至少有一条消息。 */
    async fn has_messages(&self, chat_id: &str) -> Result<bool>;
    /** \brief 插入消息并刷新所属会话的 updated_at。 */
    async fn insert_message(&self, chat_id: &str, role: Role, content: &str) -> Result<Message>;
    async fn delete_message(&self, message_id: &str) -> Result<()>;
    async fn update_message(&self, message_id: &str, content: &str) -> Result<()>;
}

/**
 * \brief 后端凭据，作为连接缓存的值相等键。
 */
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BackendCredentials {
    pub url: String,
    pub key: String,
}

impl BackendCredentials {
    /**
     * \brief 校验并构造凭据：两者均非空且地址是语法合法的绝对 URL。
     */
    pub fn parse(url: &str, key: &str) -> Option<Self> {
        let url = url.trim();
        let key = key.trim();
        if url.is_empty() || key.is_empty() {
            return None;
        }
        Url::parse(url).ok()?;
        Some(Self {
            url: url.to_string(),
            key: key.to_string(),
        })
    }

    pub fn scheme(&self) -> String {
        Url::parse(&self.url)
            .map(|u| u.scheme().to_ascii_lowercase())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for BackendCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCredentials")
            .field("url", &self.url)
            .field("key", &"<redacted>")
            .finish()
    }
}

/**
 * \brief 由凭据构造存储连接。
 */
pub trait Connector: Send + Sync {
    fn connect(&self, creds: &BackendCredentials) -> Result<Arc<dyn TableStore>>;
}

/**
 * \brief 默认连接器：http(s) 走 PostgREST 表接口，sqlite 走本地数据库文件。
 */
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

impl Connector for DefaultConnector {
    fn connect(&self, creds: &BackendCredentials) -> Result<Arc<dyn TableStore>> {
        match creds.scheme().as_str() {
            "http" | "https" => Ok(Arc::new(PostgrestStore::new(creds)?)),
            "sqlite" => {
                let raw = creds.url.as_str();
                let path = raw
                    .strip_prefix("sqlite://")
                    .or_else(|| raw.strip_prefix("sqlite:"))
                    .unwrap_or_default();
                if path == ":memory:" {
                    Ok(Arc::new(SqliteStore::open_in_memory()?))
                } else if path.is_empty() {
                    bail!("sqlite backend url has no path: {}", raw)
                } else {
                    Ok(Arc::new(SqliteStore::open(path)?))
                }
            }
            other => bail!("unsupported backend scheme: {}", other),
        }
    }
}

/**
 * \brief 连接缓存：凭据不变时复用同一连接，凭据变化时重建。
 */
#[derive(Default)]
pub struct GatewayCache {
    inner: Mutex<Option<(BackendCredentials, Arc<dyn TableStore>)>>,
}

impl GatewayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 取得与凭据对应的连接，必要时通过连接器懒创建。
     */
    pub fn get_or_connect(
        &self,
        creds: &BackendCredentials,
        connector: &dyn Connector,
    ) -> Result<Arc<dyn TableStore>> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| anyhow!("gateway cache lock poisoned: {}", e))?;
        if let Some((cached_creds, store)) = guard.as_ref() {
            if cached_creds == creds {
                return Ok(store.clone());
            }
        }
        let store = connector.connect(creds)?;
        telemetry::log_event("backend", &format!("connected url={}", creds.url));
        *guard = Some((creds.clone(), store.clone()));
        Ok(store)
    }
}

/**
 * \brief PostgREST 风格的远端表存储（Supabase 的 `/rest/v1` 布局）。
 */
pub struct PostgrestStore {
    client: reqwest::Client,
    base: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct ChatRow {
    id: Value,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    id: Value,
    role: String,
    #[serde(default)]
    content: String,
}

impl PostgrestStore {
    pub fn new(creds: &BackendCredentials) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base: creds.url.trim_end_matches('/').to_string(),
            key: creds.key.clone(),
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base, table))
            .header("apikey", &self.key)
            .header(AUTHORIZATION, format!("Bearer {}", self.key))
    }

    async fn insert_returning(&self, table: &str, body: Value) -> Result<Value> {
        let resp = self
            .request(Method::POST, table)
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp, &format!("insert into {}", table)).await?;
        let v: Value = resp.json().await?;
        first_row(v)
    }

    async fn touch_chat(&self, chat_id: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
        let resp = self
            .request(Method::PATCH, "chats")
            .query(&[("id", format!("eq.{}", chat_id))])
            .json(&json!({ "updated_at": now }))
            .send()
            .await?;
        check_status(resp, "touch chat").await?;
        Ok(())
    }
}

#[async_trait]
impl TableStore for PostgrestStore {
    async fn list_chats(&self) -> Result<Vec<Chat>> {
        let resp = self
            .request(Method::GET, "chats")
            .query(&[
                ("select", "id,title,created_at,updated_at"),
                ("order", "updated_at.desc"),
            ])
            .send()
            .await?;
        let resp = check_status(resp, "list chats").await?;
        let rows: Vec<ChatRow> = resp.json().await?;
        rows.into_iter().map(chat_from_row).collect()
    }

    async fn create_chat(&self, title: &str) -> Result<Chat> {
        let row = self
            .insert_returning("chats", json!({ "title": title }))
            .await?;
        chat_from_row(serde_json::from_value(row)?)
    }

    async fn update_chat_title(&self, chat_id: &str, title: &str) -> Result<()> {
        let resp = self
            .request(Method::PATCH, "chats")
            .query(&[("id", format!("eq.{}", chat_id))])
            .json(&json!({ "title": title }))
            .send()
            .await?;
        check_status(resp, "update chat title").await?;
        Ok(())
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, "chats")
            .query(&[("id", format!("eq.{}", chat_id))])
            .send()
            .await?;
        check_status(resp, "delete chat").await?;
        Ok(())
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let resp = self
            .request(Method::GET, "messages")
            .query(&[
                ("select", "id,chat_id,role,content,created_at".to_string()),
                ("chat_id", format!("eq.{}", chat_id)),
                ("order", "created_at.asc".to_string()),
            ])
            .send()
            .await?;
        let resp = check_status(resp, "list messages").await?;
        let rows: Vec<MessageRow> = resp.json().await?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn has_messages(&self, chat_id: &str) -> Result<bool> {
        let resp = self
            .request(Method::GET, "messages")
            .query(&[
                ("select", "id".to_string()),
                ("chat_id", format!("eq.{}", chat_id)),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let resp = check_status(resp, "check messages").await?;
        let rows: Vec<Value> = resp.json().await?;
        Ok(!rows.is_empty())
    }

    async fn insert_message(&self, chat_id: &str, role: Role, content: &str) -> Result<Message> {
        let row = self
            .insert_returning(
                "messages",
                json!({ "chat_id": chat_id, "role": role.as_str(), "content": content }),
            )
            .await?;
        let message = message_from_row(serde_json::from_value(row)?)?;
        if let Err(e) = self.touch_chat(chat_id).await {
            telemetry::log_error("backend", &format!("touch chat {} failed: {}", chat_id, e));
        }
        Ok(message)
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, "messages")
            .query(&[("id", format!("eq.{}", message_id))])
            .send()
            .await?;
        check_status(resp, "delete message").await?;
        Ok(())
    }

    async fn update_message(&self, message_id: &str, content: &str) -> Result<()> {
        let resp = self
            .request(Method::PATCH, "messages")
            .query(&[("id", format!("eq.{}", message_id))])
            .json(&json!({ "content": content }))
            .send()
            .await?;
        check_status(resp, "update message").await?;
        Ok(())
    }
}

async fn check_status(resp: Response, action: &str) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    Err(anyhow!("{} failed: {} -> {}", action, status, error_message(&text)))
}

/** \brief 从 PostgREST 错误体中提取 `message` 字段，否则原样返回。 */
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

fn first_row(v: Value) -> Result<Value> {
    match v {
        Value::Array(rows) => rows
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("insert returned no rows")),
        Value::Object(map) => Ok(Value::Object(map)),
        other => Err(anyhow!("unexpected insert payload: {}", other)),
    }
}

fn id_to_string(v: &Value) -> Result<String> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(anyhow!("unexpected row id: {}", other)),
    }
}

/**
 * \brief 宽松解析时间戳：接受 RFC3339，缺少时区时按 UTC 处理，其余返回 None。
 */
fn parse_timestamp(raw: Option<&str>) -> Option<OffsetDateTime> {
    let raw = raw?.trim();
    OffsetDateTime::parse(raw, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(&format!("{}Z", raw), &Rfc3339))
        .ok()
}

fn chat_from_row(row: ChatRow) -> Result<Chat> {
    Ok(Chat {
        id: id_to_string(&row.id)?,
        title: row.title.unwrap_or_else(|| PLACEHOLDER_TITLE.to_string()),
        created_at: parse_timestamp(row.created_at.as_deref()),
        updated_at: parse_timestamp(row.updated_at.as_deref()),
    })
}

fn message_from_row(row: MessageRow) -> Result<Message> {
    Ok(Message::stored(
        id_to_string(&row.id)?,
        row.role.parse()?,
        row.content,
    ))
}
