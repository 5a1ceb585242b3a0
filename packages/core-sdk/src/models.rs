use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/** \brief 会话标题的最大字符数（按 Unicode 字符计）。 */
pub const TITLE_MAX_CHARS: usize = 60;

/** \brief 标题被截断时追加的省略标记。 */
pub const TITLE_ELLIPSIS: &str = "...";

/** \brief 空会话的占位标题。 */
pub const PLACEHOLDER_TITLE: &str = "New Chat";

/** \brief 本地会话 ID 前缀，用于区分没有远端对应行的会话。 */
pub const LOCAL_CHAT_PREFIX: &str = "local-";

/**
 * \brief 消息角色。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(anyhow::anyhow!("unknown message role: {}", other)),
        }
    }
}

/**
 * \brief 会话中的一条消息。
 * \details 身份分两阶段：`local_id` 为客户端生成的关联 ID，写入远端成功后
 * `remote_id` 记录存储分配的 ID。对外展示的 ID 见 `Message::id`。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /** \brief 客户端关联 ID，在内存中的生命周期内保持不变。 */
    pub local_id: String,
    /** \brief 存储分配的 ID（本地模式下始终为空）。 */
    pub remote_id: Option<String>,
    /** \brief 角色 */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    /**
     * \brief 以乐观 ID 构造一条尚未持久化的消息。
     */
    pub fn optimistic(role: Role, content: impl Into<String>) -> Self {
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            remote_id: None,
            role,
            content: content.into(),
        }
    }

    /**
     * \brief 由存储中读出的行构造消息，两个 ID 相同。
     */
    pub fn stored(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            local_id: id.clone(),
            remote_id: Some(id),
            role,
            content: content.into(),
        }
    }

    /** \brief 对外可见的 ID：已持久化时为存储 ID，否则为乐观 ID。 */
    pub fn id(&self) -> &str {
        self.remote_id.as_deref().unwrap_or(&self.local_id)
    }

    /** \brief 是否已有远端对应行。 */
    pub fn is_persisted(&self) -> bool {
        self.remote_id.is_some()
    }

    /** \brief 按任一阶段的 ID 匹配。 */
    pub fn matches(&self, id: &str) -> bool {
        self.local_id == id || self.remote_id.as_deref() == Some(id)
    }
}

/**
 * \brief 会话元数据。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub title: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl Chat {
    /** \brief 标题是否为空或占位标题。 */
    pub fn has_placeholder_title(&self) -> bool {
        self.title.is_empty() || self.title == PLACEHOLDER_TITLE
    }
}

/** \brief 生成新的本地会话 ID。 */
pub fn new_local_chat_id() -> String {
    format!("{}{}", LOCAL_CHAT_PREFIX, uuid::Uuid::new_v4())
}

pub fn is_local_chat_id(id: &str) -> bool {
    id.starts_with(LOCAL_CHAT_PREFIX)
}

/**
 * \brief 由消息文本推导会话标题。
 * \details 超过 `TITLE_MAX_CHARS` 时截取前 N 个字符并追加省略标记；空白文本回落为占位标题。
 */
pub fn derive_title(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return PLACEHOLDER_TITLE.to_string();
    }
    let mut chars = trimmed.char_indices();
    match chars.nth(TITLE_MAX_CHARS) {
        Some((cut, _)) => format!("{}{}", &trimmed[..cut], TITLE_ELLIPSIS),
        None => trimmed.to_string(),
    }
}

/**
 * \brief 用存储分配的 ID 原位替换乐观 ID。
 * \details 按关联 ID 查找而非按位置，列表形状变化时仍然安全；未找到返回 false。
 */
pub fn reconcile_id(messages: &mut [Message], local_id: &str, remote_id: &str) -> bool {
    match messages.iter_mut().find(|m| m.local_id == local_id) {
        Some(message) => {
            message.remote_id = Some(remote_id.to_string());
            true
        }
        None => false,
    }
}

/**
 * \brief 由历史中首条用户消息推导标题，没有用户消息时返回占位标题。
 */
pub fn title_for_history(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| derive_title(&m.content))
        .unwrap_or_else(|| PLACEHOLDER_TITLE.to_string())
}
