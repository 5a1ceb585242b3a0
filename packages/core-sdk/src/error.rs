use std::fmt::Display;

use thiserror::Error;

/**
 * \brief 会话核心对外暴露的错误分类。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /** \brief 后端或模型服务凭据缺失/无效，在任何网络调用之前检出。 */
    #[error("configuration error: {0}")]
    Configuration(String),

    /** \brief 存储操作失败。 */
    #[error("backend error: {0}")]
    Backend(String),

    /** \brief 生成、转写或合成失败。 */
    #[error("provider error: {0}")]
    Provider(String),

    /** \brief 请求本身不合法（空文本、未知消息等）。 */
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ChatError {
    pub fn backend<E: Display>(err: E) -> Self {
        ChatError::Backend(err.to_string())
    }

    pub fn provider<E: Display>(err: E) -> Self {
        ChatError::Provider(err.to_string())
    }

    /** \brief 面向用户的通知标题。 */
    pub fn title(&self) -> &'static str {
        match self {
            ChatError::Configuration(_) => "Not configured",
            ChatError::Backend(_) => "Backend error",
            ChatError::Provider(_) => "Provider error",
            ChatError::InvalidRequest(_) => "Invalid request",
        }
    }

    /** \brief 不含分类前缀的详细描述。 */
    pub fn detail(&self) -> &str {
        match self {
            ChatError::Configuration(s)
            | ChatError::Backend(s)
            | ChatError::Provider(s)
            | ChatError::InvalidRequest(s) => s,
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
