pub mod backend;
pub mod conversation;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod server;
pub mod session;
pub mod settings;
pub mod speech;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::conversation::{ConversationCore, Notice, SendOptions, ViewState};
    pub use crate::error::{ChatError, ChatResult};
    pub use crate::models::{Chat, Message, Role};
    pub use crate::settings::{Settings, SettingsStore};
    pub use crate::{backend, db, llm, server, session, speech, telemetry};
}
