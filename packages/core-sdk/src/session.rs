use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;

use crate::backend::TableStore;
use crate::error::{ChatError, ChatResult};
use crate::models::{is_local_chat_id, new_local_chat_id, title_for_history, Chat, Message, Role};

struct LocalChat {
    chat: Chat,
    messages: Arc<Vec<Message>>,
}

/**
 * \brief 进程内的本地会话存储，重启即丢失。
 * \details 消息列表以整体替换（快照后交换）的方式更新，不做原地修改。
 */
#[derive(Clone, Default)]
pub struct LocalStore {
    chats: Arc<Mutex<HashMap<String, LocalChat>>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LocalChat>> {
        self.chats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /**
     * \brief 注册一个新的空会话并返回其元数据。
     */
    pub fn register(&self, title: &str) -> Chat {
        let now = OffsetDateTime::now_utc();
        let chat = Chat {
            id: new_local_chat_id(),
            title: title.to_string(),
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.lock().insert(
            chat.id.clone(),
            LocalChat {
                chat: chat.clone(),
                messages: Arc::new(Vec::new()),
            },
        );
        chat
    }

    /** \brief 会话消息；不存在时返回空列表。 */
    pub fn messages(&self, chat_id: &str) -> Vec<Message> {
        self.lock()
            .get(chat_id)
            .map(|entry| entry.messages.as_ref().clone())
            .unwrap_or_default()
    }

    /** \brief 会话不存在或没有消息。 */
    pub fn is_empty_chat(&self, chat_id: &str) -> bool {
        self.lock()
            .get(chat_id)
            .map(|entry| entry.messages.is_empty())
            .unwrap_or(true)
    }

    /**
     * \brief 以整份快照替换会话消息，同时刷新标题与 updated_at；会话不存在时自动登记。
     */
    pub fn snapshot(&self, chat_id: &str, messages: &[Message]) {
        let now = OffsetDateTime::now_utc();
        let title = title_for_history(messages);
        let mut guard = self.lock();
        let entry = guard.entry(chat_id.to_string()).or_insert_with(|| LocalChat {
            chat: Chat {
                id: chat_id.to_string(),
                title: title.clone(),
                created_at: Some(now),
                updated_at: Some(now),
            },
            messages: Arc::new(Vec::new()),
        });
        entry.messages = Arc::new(messages.to_vec());
        entry.chat.title = title;
        entry.chat.updated_at = Some(now);
    }

    pub fn remove(&self, chat_id: &str) -> bool {
        self.lock().remove(chat_id).is_some()
    }

    /** \brief 本地会话列表，按 updated_at 降序。 */
    pub fn list(&self) -> Vec<Chat> {
        let mut chats: Vec<Chat> = self.lock().values().map(|e| e.chat.clone()).collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        chats
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/**
 * \brief 会话模式：本地内存或同步到远端表存储，每次设置变更时选定一次。
 */
#[derive(Clone)]
pub enum SessionMode {
    Local(LocalStore),
    Synced(Arc<dyn TableStore>),
}

impl SessionMode {
    pub fn is_synced(&self) -> bool {
        matches!(self, SessionMode::Synced(_))
    }

    /** \brief 两个模式是否指向同一存储（同一本地 map 或同一远端连接）。 */
    pub fn same_target(&self, other: &SessionMode) -> bool {
        match (self, other) {
            (SessionMode::Local(a), SessionMode::Local(b)) => Arc::ptr_eq(&a.chats, &b.chats),
            (SessionMode::Synced(a), SessionMode::Synced(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub async fn list_chats(&self) -> ChatResult<Vec<Chat>> {
        match self {
            SessionMode::Local(local) => Ok(local.list()),
            SessionMode::Synced(store) => store.list_chats().await.map_err(ChatError::backend),
        }
    }

    pub async fn load_messages(&self, chat_id: &str) -> ChatResult<Vec<Message>> {
        match self {
            SessionMode::Local(local) => Ok(local.messages(chat_id)),
            SessionMode::Synced(store) => store
                .list_messages(chat_id)
                .await
                .map_err(ChatError::backend),
        }
    }

    /**
     * \brief 会话是否没有消息；远端查询失败时按非空处理。
     */
    pub async fn chat_is_empty(&self, chat_id: &str) -> bool {
        match self {
            SessionMode::Local(local) => local.is_empty_chat(chat_id),
            SessionMode::Synced(store) => matches!(store.has_messages(chat_id).await, Ok(false)),
        }
    }

    pub async fn create_chat(&self, title: &str) -> ChatResult<Chat> {
        match self {
            SessionMode::Local(local) => Ok(local.register(title)),
            SessionMode::Synced(store) => store.create_chat(title).await.map_err(ChatError::backend),
        }
    }

    pub async fn delete_chat(&self, chat_id: &str) -> ChatResult<()> {
        match self {
            SessionMode::Local(local) => {
                local.remove(chat_id);
                Ok(())
            }
            SessionMode::Synced(store) => store.delete_chat(chat_id).await.map_err(ChatError::backend),
        }
    }

    /**
     * \brief 持久化一条新追加的消息。
     * \details 本地模式快照整段历史并返回 None；同步模式插入该消息并返回存储分配的 ID。
     */
    pub async fn persist_message(
        &self,
        chat_id: &str,
        history: &[Message],
        message: &Message,
    ) -> ChatResult<Option<String>> {
        match self {
            SessionMode::Local(local) => {
                local.snapshot(chat_id, history);
                Ok(None)
            }
            SessionMode::Synced(store) => {
                let stored = store
                    .insert_message(chat_id, message.role, &message.content)
                    .await
                    .map_err(ChatError::backend)?;
                Ok(Some(stored.id().to_string()))
            }
        }
    }

    /**
     * \brief 移除若干消息；远端只删除已持久化的行，本地占位消息跳过。
     */
    pub async fn discard_messages(
        &self,
        chat_id: &str,
        removed: &[Message],
        remaining: &[Message],
    ) -> ChatResult<()> {
        match self {
            SessionMode::Local(local) => {
                local.snapshot(chat_id, remaining);
                Ok(())
            }
            SessionMode::Synced(store) => {
                for message in removed {
                    if let Some(remote_id) = message.remote_id.as_deref() {
                        store
                            .delete_message(remote_id)
                            .await
                            .map_err(ChatError::backend)?;
                    }
                }
                Ok(())
            }
        }
    }

    /**
     * \brief 提交一次编辑：替换目标消息内容并删除其后的全部消息。
     */
    pub async fn commit_edit(
        &self,
        chat_id: &str,
        edited: &Message,
        removed: &[Message],
        remaining: &[Message],
    ) -> ChatResult<()> {
        if let (SessionMode::Synced(store), Some(remote_id)) = (self, edited.remote_id.as_deref()) {
            store
                .update_message(remote_id, &edited.content)
                .await
                .map_err(ChatError::backend)?;
        }
        self.discard_messages(chat_id, removed, remaining).await
    }

    /**
     * \brief 更新会话标题；本地模式下标题随快照推导，这里无需操作。
     */
    pub async fn set_title(&self, chat_id: &str, title: &str) -> ChatResult<()> {
        match self {
            SessionMode::Synced(store) if !is_local_chat_id(chat_id) => store
                .update_chat_title(chat_id, title)
                .await
                .map_err(ChatError::backend),
            _ => Ok(()),
        }
    }
}

/**
 * \brief 按会话串行化发送与编辑。
 */
#[derive(Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 获取会话锁，持有期间同一会话的其他发送/编辑会等待。
     * \details 顺带清理无人持有也无人等待的条目。
     */
    pub async fn acquire(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.retain(|_, lock| Arc::strong_count(lock) > 1);
            guard
                .entry(chat_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        tracing::debug!(target: "chatwell", chat_id, "acquire chat lock");
        lock.lock_owned().await
    }

    /** \brief 会话删除后移除其锁；仍被持有时保留。 */
    pub fn forget(&self, chat_id: &str) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.get(chat_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            guard.remove(chat_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/**
 * \brief 生成上下文：配置了系统提示词且历史不以 system 消息开头时，前置一条合成消息。
 */
pub fn with_system_prompt(system_prompt: Option<&str>, history: &[Message]) -> Vec<Message> {
    let mut context = Vec::with_capacity(history.len() + 1);
    if let Some(prompt) = system_prompt {
        if history.first().map(|m| m.role) != Some(Role::System) {
            context.push(Message {
                local_id: "system".to_string(),
                remote_id: None,
                role: Role::System,
                content: prompt.to_string(),
            });
        }
    }
    context.extend_from_slice(history);
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::PLACEHOLDER_TITLE;
    use std::time::Duration;

    #[test]
    fn test_local_store_snapshot_and_list_order() {
        let local = LocalStore::new();
        let first = local.register(PLACEHOLDER_TITLE);
        let second = local.register(PLACEHOLDER_TITLE);
        assert!(local.is_empty_chat(&first.id));
        assert!(local.is_empty_chat("absent"));

        std::thread::sleep(Duration::from_millis(2));
        local.snapshot(&first.id, &[Message::optimistic(Role::User, "hello")]);
        let chats = local.list();
        assert_eq!(chats[0].id, first.id);
        assert_eq!(chats[0].title, "hello");
        assert_eq!(chats[1].id, second.id);
        assert!(!local.is_empty_chat(&first.id));
        assert_eq!(local.messages(&first.id).len(), 1);
    }

    #[test]
    fn test_snapshot_registers_unknown_chat() {
        let local = LocalStore::new();
        local.snapshot("local-x", &[Message::optimistic(Role::User, "q")]);
        assert_eq!(local.len(), 1);
        assert!(local.remove("local-x"));
        assert!(local.is_empty());
    }

    #[test]
    fn test_system_prompt_is_prepended_once() {
        let history = vec![Message::optimistic(Role::User, "hi")];
        let ctx = with_system_prompt(Some("be kind"), &history);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx[0].role, Role::System);
        assert_eq!(ctx[0].content, "be kind");

        let explicit = vec![
            Message::stored("s", Role::System, "stored system"),
            Message::stored("u", Role::User, "hi"),
        ];
        let ctx = with_system_prompt(Some("be kind"), &explicit);
        assert_eq!(ctx, explicit);

        assert_eq!(with_system_prompt(None, &history), history);
    }

    #[tokio::test]
    async fn test_synced_discard_skips_unpersisted_messages() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let chat = store.create_chat("c").await.expect("chat");
        let persisted = store
            .insert_message(&chat.id, Role::Assistant, "a")
            .await
            .expect("insert");
        let mode = SessionMode::Synced(store.clone());
        let placeholder = Message::optimistic(Role::User, "pending");
        mode.discard_messages(&chat.id, &[persisted, placeholder], &[])
            .await
            .expect("discard");
        assert!(!store.has_messages(&chat.id).await.expect("has_messages"));
    }

    #[tokio::test]
    async fn test_chat_locks_serialize_same_chat() {
        let locks = Arc::new(ChatLocks::new());
        let held = locks.acquire("c1").await;
        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire("c1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        let _unrelated = locks.acquire("c2").await;
        drop(held);
        waiter.await.expect("waiter joins");
    }

    #[tokio::test]
    async fn test_chat_locks_drop_idle_entries() {
        let locks = ChatLocks::new();
        drop(locks.acquire("a").await);
        let held = locks.acquire("b").await;
        assert_eq!(locks.len(), 1);

        locks.forget("b");
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.forget("b");
        assert_eq!(locks.len(), 0);
    }
}
