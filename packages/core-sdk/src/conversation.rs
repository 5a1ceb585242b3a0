use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::{broadcast, watch, OwnedMutexGuard};

use crate::backend::{Connector, DefaultConnector, GatewayCache};
use crate::error::{ChatError, ChatResult};
use crate::llm::{CompletionProvider, HttpCompletionProvider};
use crate::models::{
    derive_title, is_local_chat_id, reconcile_id, title_for_history, Chat, Message, Role,
    PLACEHOLDER_TITLE,
};
use crate::session::{with_system_prompt, ChatLocks, LocalStore, SessionMode};
use crate::settings::Settings;
use crate::telemetry;

const NOTICE_CAPACITY: usize = 64;

/**
 * \brief 展示层可观察的会话状态。
 */
#[derive(Debug, Clone, Default)]
pub struct ViewState {
    /** \brief 是否处于同步模式 */
    pub synced: bool,
    pub chats: Vec<Chat>,
    pub active_id: Option<String>,
    pub messages: Vec<Message>,
    /** \brief 有发送或编辑在进行中 */
    pub loading: bool,
}

/**
 * \brief 面向用户的错误通知。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub title: String,
    pub description: String,
}

impl From<&ChatError> for Notice {
    fn from(err: &ChatError) -> Self {
        Self {
            title: err.title().to_string(),
            description: err.detail().to_string(),
        }
    }
}

/**
 * \brief 发送选项。
 * \details `edit_of` 标记这是一次编辑触发的重新生成：末尾的助手回复会先被丢弃。
 */
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub edit_of: Option<String>,
}

/**
 * \brief 会话核心：持有会话模式、当前会话与消息列表，处理全部用户意图。
 * \details 所有意图都返回 `ChatResult`，失败时同时通过通知频道广播；
 * 同一会话上的发送与编辑按会话加锁串行执行。
 */
pub struct ConversationCore {
    settings: RwLock<Arc<Settings>>,
    mode: RwLock<Option<SessionMode>>,
    /** \brief 上次进入模式时加载失败，下次应用设置时需重新加载 */
    stale: AtomicBool,
    local: LocalStore,
    gateways: GatewayCache,
    connector: Arc<dyn Connector>,
    provider: Arc<dyn CompletionProvider>,
    locks: ChatLocks,
    in_flight: AtomicUsize,
    state: watch::Sender<ViewState>,
    notices: broadcast::Sender<Notice>,
}

struct LoadingGuard<'a> {
    core: &'a ConversationCore,
}

impl<'a> LoadingGuard<'a> {
    fn start(core: &'a ConversationCore) -> Self {
        core.in_flight.fetch_add(1, Ordering::SeqCst);
        core.state.send_modify(|s| s.loading = true);
        Self { core }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let remaining = self.core.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.core.state.send_modify(|s| s.loading = false);
        }
    }
}

fn missing_llm_creds() -> ChatError {
    ChatError::Configuration(
        "Please open Settings and enter provider, API key, and model.".to_string(),
    )
}

impl ConversationCore {
    pub fn new(provider: Arc<dyn CompletionProvider>, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ViewState::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            settings: RwLock::new(Arc::new(Settings::default())),
            mode: RwLock::new(None),
            stale: AtomicBool::new(false),
            local: LocalStore::new(),
            gateways: GatewayCache::new(),
            connector,
            provider,
            locks: ChatLocks::new(),
            in_flight: AtomicUsize::new(0),
            state,
            notices,
        }
    }

    /** \brief HTTP 模型服务 + 默认后端连接器。 */
    pub fn with_defaults() -> Self {
        Self::new(
            Arc::new(HttpCompletionProvider::new()),
            Arc::new(DefaultConnector),
        )
    }

    /** \brief 当前设置快照。 */
    pub fn settings(&self) -> Arc<Settings> {
        self.settings
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn mode(&self) -> SessionMode {
        self.mode
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
            .unwrap_or_else(|| SessionMode::Local(self.local.clone()))
    }

    fn is_current(&self, mode: &SessionMode) -> bool {
        self.mode().same_target(mode)
    }

    /** \brief 当前状态的一份拷贝。 */
    pub fn snapshot(&self) -> ViewState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.state.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    fn report(&self, category: &str, err: ChatError) -> ChatError {
        telemetry::log_error(category, &err.to_string());
        let _ = self.notices.send(Notice::from(&err));
        err
    }

    fn update_if_active(&self, chat_id: Option<&str>, f: impl FnOnce(&mut ViewState)) {
        self.state.send_if_modified(|s| {
            if s.active_id.as_deref() == chat_id {
                f(s);
                true
            } else {
                false
            }
        });
    }

    async fn lock_active(&self) -> (Option<String>, OwnedMutexGuard<()>) {
        loop {
            let chat_id = self.snapshot().active_id;
            let guard = self.locks.acquire(chat_id.as_deref().unwrap_or_default()).await;
            if self.snapshot().active_id == chat_id {
                return (chat_id, guard);
            }
        }
    }

    /**
     * \brief 应用新的设置快照，并据此选定会话模式。
     * \details 凭据未变时复用已有连接且不重新加载；模式或连接变化、或上次加载失败时重新加载会话列表。
     */
    pub async fn change_settings(&self, settings: Settings) -> ChatResult<()> {
        telemetry::set_enabled(settings.telemetry_enabled);
        let creds = settings.backend_credentials();
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(settings);

        let mut outcome = Ok(());
        let next = match creds {
            Some(creds) => match self.gateways.get_or_connect(&creds, self.connector.as_ref()) {
                Ok(store) => SessionMode::Synced(store),
                Err(err) => {
                    outcome = Err(self.report(
                        "settings",
                        ChatError::Configuration(format!("cannot connect to backend: {}", err)),
                    ));
                    SessionMode::Local(self.local.clone())
                }
            },
            None => SessionMode::Local(self.local.clone()),
        };

        let unchanged = {
            let mut guard = self.mode.write().unwrap_or_else(|e| e.into_inner());
            let unchanged = guard.as_ref().is_some_and(|m| m.same_target(&next))
                && !self.stale.load(Ordering::SeqCst);
            *guard = Some(next.clone());
            unchanged
        };
        if !unchanged {
            if let Err(err) = self.enter_mode(&next).await {
                self.stale.store(true, Ordering::SeqCst);
                return Err(err);
            }
            self.stale.store(false, Ordering::SeqCst);
        }
        outcome
    }

    async fn enter_mode(&self, mode: &SessionMode) -> ChatResult<()> {
        let synced = mode.is_synced();
        telemetry::log_event("session", &format!("enter mode synced={}", synced));
        self.state.send_modify(|s| {
            s.synced = synced;
            if synced && s.active_id.as_deref().is_some_and(is_local_chat_id) {
                s.active_id = None;
                s.messages.clear();
            }
        });

        match mode {
            SessionMode::Synced(_) => {
                let chats = mode.list_chats().await.map_err(|e| self.report("chats", e))?;
                let target = match self.snapshot().active_id {
                    Some(id) if chats.iter().any(|c| c.id == id) => Some(id),
                    _ => chats.first().map(|c| c.id.clone()),
                };
                let messages = match target.as_deref() {
                    Some(id) => mode
                        .load_messages(id)
                        .await
                        .map_err(|e| self.report("messages", e))?,
                    None => Vec::new(),
                };
                if !self.is_current(mode) {
                    return Ok(());
                }
                self.state.send_modify(|s| {
                    s.chats = chats;
                    s.active_id = target;
                    s.messages = messages;
                });
            }
            SessionMode::Local(local) => {
                let existing = local.list();
                let active = match self.snapshot().active_id.filter(|id| is_local_chat_id(id)) {
                    Some(id) => id,
                    None => match existing.first() {
                        Some(chat) => chat.id.clone(),
                        None => local.register(PLACEHOLDER_TITLE).id,
                    },
                };
                let messages = local.messages(&active);
                let chats = local.list();
                self.state.send_modify(|s| {
                    s.chats = chats;
                    s.active_id = Some(active);
                    s.messages = messages;
                });
            }
        }
        Ok(())
    }

    async fn refresh_with(&self, mode: &SessionMode) -> ChatResult<()> {
        let chats = mode.list_chats().await.map_err(|e| self.report("chats", e))?;
        if self.is_current(mode) {
            self.state.send_modify(|s| s.chats = chats);
        }
        Ok(())
    }

    /**
     * \brief 重新加载会话列表；失败时保留原列表。
     */
    pub async fn refresh_chats(&self) -> ChatResult<()> {
        self.refresh_with(&self.mode()).await
    }

    /**
     * \brief 切换当前会话并整体替换消息列表；重复选择同一会话会重新加载。
     */
    pub async fn select_chat(&self, chat_id: &str) -> ChatResult<()> {
        if chat_id.trim().is_empty() {
            return Err(self.report(
                "select",
                ChatError::InvalidRequest("chat id is empty".to_string()),
            ));
        }
        let mode = self.mode();
        let messages = mode
            .load_messages(chat_id)
            .await
            .map_err(|e| self.report("select", e))?;
        if !self.is_current(&mode) {
            return Ok(());
        }
        self.state.send_modify(|s| {
            s.active_id = Some(chat_id.to_string());
            s.messages = messages;
        });
        Ok(())
    }

    /**
     * \brief 新建会话，优先复用空会话：当前会话为空 > 任一空会话 > 新建。
     */
    pub async fn new_chat(&self) -> ChatResult<()> {
        let mode = self.mode();
        let state = self.snapshot();

        if state.active_id.is_some() && state.messages.is_empty() {
            return Ok(());
        }

        for chat in state.chats.iter() {
            if state.active_id.as_deref() == Some(chat.id.as_str()) {
                continue;
            }
            if mode.is_synced() && (is_local_chat_id(&chat.id) || !chat.has_placeholder_title()) {
                continue;
            }
            if mode.chat_is_empty(&chat.id).await {
                telemetry::log_event("session", &format!("reuse empty chat id={}", chat.id));
                self.state.send_modify(|s| {
                    s.active_id = Some(chat.id.clone());
                    s.messages.clear();
                });
                return Ok(());
            }
        }

        let chat = mode
            .create_chat(PLACEHOLDER_TITLE)
            .await
            .map_err(|e| self.report("new_chat", e))?;
        telemetry::log_event("session", &format!("created chat id={}", chat.id));
        let local_chats = match &mode {
            SessionMode::Local(local) => Some(local.list()),
            SessionMode::Synced(_) => None,
        };
        self.state.send_modify(|s| {
            s.active_id = Some(chat.id.clone());
            s.messages.clear();
            match local_chats {
                Some(chats) => s.chats = chats,
                None => {
                    s.chats.retain(|c| !is_local_chat_id(&c.id));
                    s.chats.insert(0, chat);
                }
            }
        });
        Ok(())
    }

    /**
     * \brief 删除会话。
     * \details 同步模式删除后刷新列表，若删除的是当前会话则切到下一个（或无）；
     * 本地模式移除内存条目，若删除的是当前会话则清空消息列表。
     */
    pub async fn delete_chat(&self, chat_id: &str) -> ChatResult<()> {
        let mode = self.mode();
        mode.delete_chat(chat_id)
            .await
            .map_err(|e| self.report("delete", e))?;
        telemetry::log_event("session", &format!("deleted chat id={}", chat_id));
        self.locks.forget(chat_id);
        let was_active = self.snapshot().active_id.as_deref() == Some(chat_id);

        match &mode {
            SessionMode::Synced(_) => {
                let chats = match mode.list_chats().await {
                    Ok(chats) => chats,
                    Err(e) => {
                        let err = self.report("chats", e);
                        self.update_if_active(Some(chat_id), |s| {
                            s.chats.retain(|c| c.id != chat_id);
                            s.active_id = None;
                            s.messages.clear();
                        });
                        return Err(err);
                    }
                };
                let next = if was_active {
                    chats.first().map(|c| c.id.clone())
                } else {
                    None
                };
                let messages = match next.as_deref() {
                    Some(id) => mode
                        .load_messages(id)
                        .await
                        .map_err(|e| self.report("messages", e))
                        .unwrap_or_default(),
                    None => Vec::new(),
                };
                self.state.send_modify(|s| {
                    s.chats = chats;
                    if s.active_id.as_deref() == Some(chat_id) {
                        s.active_id = next;
                        s.messages = messages;
                    }
                });
            }
            SessionMode::Local(local) => {
                let chats = local.list();
                self.state.send_modify(|s| {
                    s.chats = chats;
                    if s.active_id.as_deref() == Some(chat_id) {
                        s.messages.clear();
                    }
                });
            }
        }
        Ok(())
    }

    pub async fn send(&self, text: &str) -> ChatResult<()> {
        self.send_with(text, SendOptions::default()).await
    }

    /**
     * \brief 发送一条用户消息并生成回复。
     * \details 用户消息先乐观追加，再持久化并回填存储 ID；生成失败时用户消息保留，不回滚。
     */
    pub async fn send_with(&self, text: &str, options: SendOptions) -> ChatResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(self.report(
                "send",
                ChatError::InvalidRequest("message text is empty".to_string()),
            ));
        }
        let settings = self.settings();
        if !settings.has_llm_creds() {
            return Err(self.report("send", missing_llm_creds()));
        }
        let mode = self.mode();
        let _loading = LoadingGuard::start(self);
        let (origin, _guard) = self.lock_active().await;
        let mut history = self.snapshot().messages;

        if options.edit_of.is_some() && history.last().map(|m| m.role) == Some(Role::Assistant) {
            if let Some(dropped) = history.pop() {
                self.update_if_active(origin.as_deref(), |s| {
                    s.messages.retain(|m| m.local_id != dropped.local_id)
                });
                if let Some(chat_id) = origin.as_deref() {
                    if let Err(e) = mode
                        .discard_messages(chat_id, std::slice::from_ref(&dropped), &history)
                        .await
                    {
                        telemetry::log_error("send", &format!("drop trailing reply failed: {}", e));
                    }
                }
            }
        }

        let user = Message::optimistic(Role::User, text);
        history.push(user.clone());
        self.update_if_active(origin.as_deref(), |s| s.messages.push(user.clone()));

        let chat_id = self
            .ensure_chat(&mode, origin.as_deref(), text)
            .await
            .map_err(|e| self.report("send", e))?;
        self.persist(&mode, &chat_id, &mut history, &user)
            .await
            .map_err(|e| self.report("send", e))?;

        self.generate_reply(&settings, &mode, &chat_id, history).await
    }

    /**
     * \brief 确保消息有可写入的会话：同步模式下未落库的会话先创建远端行并切换当前 ID。
     */
    async fn ensure_chat(
        &self,
        mode: &SessionMode,
        origin: Option<&str>,
        text: &str,
    ) -> ChatResult<String> {
        match (mode, origin) {
            (SessionMode::Local(_), Some(id)) => return Ok(id.to_string()),
            (SessionMode::Synced(_), Some(id)) if !is_local_chat_id(id) => {
                return Ok(id.to_string())
            }
            _ => {}
        }
        let title = if mode.is_synced() {
            derive_title(text)
        } else {
            PLACEHOLDER_TITLE.to_string()
        };
        let chat = mode.create_chat(&title).await?;
        telemetry::log_event("session", &format!("materialized chat id={}", chat.id));
        let chat_id = chat.id.clone();
        let synced = mode.is_synced();
        self.state.send_modify(|s| {
            if s.active_id.as_deref() == origin {
                s.active_id = Some(chat.id.clone());
            }
            s.chats
                .retain(|c| Some(c.id.as_str()) != origin && !(synced && is_local_chat_id(&c.id)));
            s.chats.insert(0, chat);
        });
        Ok(chat_id)
    }

    async fn persist(
        &self,
        mode: &SessionMode,
        chat_id: &str,
        history: &mut [Message],
        message: &Message,
    ) -> ChatResult<()> {
        if let Some(remote_id) = mode.persist_message(chat_id, history, message).await? {
            reconcile_id(history, &message.local_id, &remote_id);
            self.update_if_active(Some(chat_id), |s| {
                reconcile_id(&mut s.messages, &message.local_id, &remote_id);
            });
        }
        Ok(())
    }

    /**
     * \brief 以给定历史生成一条助手回复并持久化，同步模式下顺带更新标题与列表排序。
     */
    async fn generate_reply(
        &self,
        settings: &Settings,
        mode: &SessionMode,
        chat_id: &str,
        mut history: Vec<Message>,
    ) -> ChatResult<()> {
        let context = with_system_prompt(settings.system_prompt(), &history);
        let reply = self
            .provider
            .generate(settings, &context)
            .await
            .map_err(|e| self.report("generate", ChatError::provider(e)))?;

        let assistant = Message::optimistic(Role::Assistant, reply);
        history.push(assistant.clone());
        self.update_if_active(Some(chat_id), |s| s.messages.push(assistant.clone()));
        self.persist(mode, chat_id, &mut history, &assistant)
            .await
            .map_err(|e| self.report("send", e))?;

        if mode.is_synced() {
            let title = title_for_history(&history);
            let current = self
                .snapshot()
                .chats
                .iter()
                .find(|c| c.id == chat_id)
                .map(|c| c.title.clone());
            if current.as_deref() != Some(title.as_str()) {
                mode.set_title(chat_id, &title)
                    .await
                    .map_err(|e| self.report("title", e))?;
            }
        }
        self.refresh_with(mode).await
    }

    /**
     * \brief 编辑当前会话中的一条消息：替换内容、删除其后所有消息，然后重新生成。
     * \details 编辑一经提交即不回滚；重新生成失败只上报。
     */
    pub async fn edit_message(&self, message_id: &str, new_content: &str) -> ChatResult<()> {
        let content = new_content.trim();
        if content.is_empty() {
            return Err(self.report(
                "edit",
                ChatError::InvalidRequest("edited content is empty".to_string()),
            ));
        }
        let settings = self.settings();
        let mode = self.mode();
        let _loading = LoadingGuard::start(self);
        let (active, _guard) = self.lock_active().await;
        let mut history = self.snapshot().messages;

        let not_found =
            || ChatError::InvalidRequest(format!("message {} is not in the active chat", message_id));
        let (Some(chat_id), Some(index)) = (active, history.iter().position(|m| m.matches(message_id)))
        else {
            return Err(self.report("edit", not_found()));
        };

        let removed = history.split_off(index + 1);
        history[index].content = content.to_string();
        let edited = history[index].clone();
        let is_first_user = history.iter().position(|m| m.role == Role::User) == Some(index);
        let truncated = history.clone();
        self.update_if_active(Some(&chat_id), |s| s.messages = truncated);

        mode.commit_edit(&chat_id, &edited, &removed, &history)
            .await
            .map_err(|e| self.report("edit", e))?;
        telemetry::log_event(
            "session",
            &format!("edited message chat={} removed={}", chat_id, removed.len()),
        );
        if is_first_user {
            if let Err(e) = mode.set_title(&chat_id, &derive_title(content)).await {
                telemetry::log_error("title", &e.to_string());
            }
        }

        if !settings.has_llm_creds() {
            return Err(self.report("edit", missing_llm_creds()));
        }
        self.generate_reply(&settings, &mode, &chat_id, history).await
    }
}
