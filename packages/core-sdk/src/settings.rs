use std::str::FromStr;

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::backend::BackendCredentials;
use crate::db;

/** \brief 设置记录在 `app_config` 表中的键。 */
pub const SETTINGS_KEY: &str = "chatwell.settings.v1";

/**
 * \brief 对话模型服务名称。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Groq,
    #[serde(rename = "openai")]
    OpenAI,
    Gemini,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Groq => "groq",
            LlmProvider::OpenAI => "openai",
            LlmProvider::Gemini => "gemini",
        }
    }
}

/**
 * \brief 语音转写服务。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionProvider {
    Groq,
    #[serde(rename = "openai")]
    OpenAI,
}

/**
 * \brief 语音合成服务。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    Groq,
    #[serde(rename = "openai")]
    OpenAI,
    Gemini,
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(LlmProvider::Groq),
            "openai" => Ok(LlmProvider::OpenAI),
            "gemini" => Ok(LlmProvider::Gemini),
            other => Err(anyhow!("unknown LLM provider: {}", other)),
        }
    }
}

impl FromStr for TranscriptionProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(TranscriptionProvider::Groq),
            "openai" => Ok(TranscriptionProvider::OpenAI),
            other => Err(anyhow!("unknown transcription provider: {}", other)),
        }
    }
}

impl FromStr for TtsProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(TtsProvider::Groq),
            "openai" => Ok(TtsProvider::OpenAI),
            "gemini" => Ok(TtsProvider::Gemini),
            other => Err(anyhow!("unknown TTS provider: {}", other)),
        }
    }
}

/**
 * \brief 扁平设置记录，所有字段均可缺省。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /** \brief 远端表存储地址 */
    pub backend_url: Option<String>,
    /** \brief 远端表存储密钥 */
    pub backend_key: Option<String>,
    pub provider: Option<LlmProvider>,
    pub model: Option<String>,
    /** \brief 覆盖对话服务的 API 基地址（OpenAI 兼容服务等） */
    pub api_base: Option<String>,
    pub system_prompt: Option<String>,
    pub groq_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub microphone_enabled: bool,
    pub transcription_provider: Option<TranscriptionProvider>,
    pub transcription_model: Option<String>,
    pub tts_enabled: bool,
    pub tts_provider: Option<TtsProvider>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub telemetry_enabled: bool,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Settings {
    pub fn groq_key(&self) -> Option<&str> {
        non_empty(&self.groq_api_key)
    }

    pub fn openai_key(&self) -> Option<&str> {
        non_empty(&self.openai_api_key)
    }

    pub fn gemini_key(&self) -> Option<&str> {
        non_empty(&self.gemini_api_key)
    }

    pub fn model_name(&self) -> Option<&str> {
        non_empty(&self.model)
    }

    /** \brief 非空的系统提示词。 */
    pub fn system_prompt(&self) -> Option<&str> {
        non_empty(&self.system_prompt)
    }

    /**
     * \brief 当前对话服务所需的 API Key。
     */
    pub fn provider_key(&self) -> Option<&str> {
        match self.provider? {
            LlmProvider::Groq => self.groq_key(),
            LlmProvider::OpenAI => self.openai_key(),
            LlmProvider::Gemini => self.gemini_key(),
        }
    }

    /**
     * \brief 对话服务是否可用：需要同时具备 API Key 与模型名。
     */
    pub fn has_llm_creds(&self) -> bool {
        self.provider_key().is_some() && self.model_name().is_some()
    }

    /**
     * \brief 可用的后端凭据：地址与密钥均非空且地址为合法的绝对 URL。
     */
    pub fn backend_credentials(&self) -> Option<BackendCredentials> {
        BackendCredentials::parse(non_empty(&self.backend_url)?, non_empty(&self.backend_key)?)
    }

    pub fn has_backend_creds(&self) -> bool {
        self.backend_credentials().is_some()
    }
}

/**
 * \brief 设置持久化：整个记录以 JSON 存放在单一键下。
 */
pub struct SettingsStore<'a> {
    conn: &'a Connection,
}

impl<'a> SettingsStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /**
     * \brief 读取设置；记录缺失或无法解析时返回默认值，不报错。
     */
    pub fn load(&self) -> Settings {
        db::get_config(self.conn, SETTINGS_KEY)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        let raw = serde_json::to_string(settings)?;
        db::set_config(self.conn, SETTINGS_KEY, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names_parse() {
        assert_eq!("OpenAI".parse::<LlmProvider>().unwrap(), LlmProvider::OpenAI);
        assert_eq!(" gemini ".parse::<TtsProvider>().unwrap(), TtsProvider::Gemini);
        assert_eq!(
            "groq".parse::<TranscriptionProvider>().unwrap(),
            TranscriptionProvider::Groq
        );
        assert!("gemini".parse::<TranscriptionProvider>().is_err());
        assert!("claude".parse::<LlmProvider>().is_err());
    }

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::migrate(&conn).expect("migrate");
        conn
    }

    fn llm_settings(provider: LlmProvider) -> Settings {
        Settings {
            provider: Some(provider),
            model: Some("m".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_llm_creds_require_matching_key_and_model() {
        let mut s = llm_settings(LlmProvider::Groq);
        assert!(!s.has_llm_creds());
        s.gemini_api_key = Some("g".into());
        assert!(!s.has_llm_creds());
        s.groq_api_key = Some("k".into());
        assert!(s.has_llm_creds());
        s.model = Some("  ".into());
        assert!(!s.has_llm_creds());
    }

    #[test]
    fn test_llm_creds_without_provider_are_unusable() {
        let s = Settings {
            model: Some("m".into()),
            groq_api_key: Some("k".into()),
            ..Default::default()
        };
        assert!(!s.has_llm_creds());
    }

    #[test]
    fn test_backend_creds_require_absolute_url_and_key() {
        let mut s = Settings {
            backend_url: Some("https://db.example.com".into()),
            ..Default::default()
        };
        assert!(!s.has_backend_creds());
        s.backend_key = Some("anon".into());
        assert!(s.has_backend_creds());
        s.backend_url = Some("db.example.com".into());
        assert!(!s.has_backend_creds());
        s.backend_url = Some("".into());
        assert!(!s.has_backend_creds());
    }

    #[test]
    fn test_store_roundtrip() {
        let conn = mem_conn();
        let store = SettingsStore::new(&conn);
        assert_eq!(store.load(), Settings::default());
        let mut s = llm_settings(LlmProvider::Gemini);
        s.system_prompt = Some("be brief".into());
        s.tts_provider = Some(TtsProvider::OpenAI);
        store.save(&s).expect("save");
        assert_eq!(store.load(), s);
    }

    #[test]
    fn test_unparseable_record_loads_as_default() {
        let conn = mem_conn();
        db::set_config(&conn, SETTINGS_KEY, "{not json").expect("write garbage");
        assert_eq!(SettingsStore::new(&conn).load(), Settings::default());
    }

    #[test]
    fn test_partial_record_fills_defaults() {
        let conn = mem_conn();
        db::set_config(&conn, SETTINGS_KEY, r#"{"provider":"openai","model":"gpt"}"#)
            .expect("write partial");
        let s = SettingsStore::new(&conn).load();
        assert_eq!(s.provider, Some(LlmProvider::OpenAI));
        assert!(!s.tts_enabled);
        assert!(s.backend_url.is_none());
    }
}
