use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::models::{Message, Role};
use crate::settings::{LlmProvider, Settings};

const GROQ_BASE: &str = "https://api.groq.com/openai/v1";
const OPENAI_BASE: &str = "https://api.openai.com/v1";
const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/**
 * \brief 对话补全服务：有序历史进，助手文本出。
 */
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn generate(&self, settings: &Settings, history: &[Message]) -> Result<String>;
}

/**
 * \brief 基于 HTTP 的补全服务，按设置中的 provider 分派。
 */
#[derive(Clone, Default)]
pub struct HttpCompletionProvider {
    client: reqwest::Client,
}

impl HttpCompletionProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    async fn generate(&self, settings: &Settings, history: &[Message]) -> Result<String> {
        let provider = settings
            .provider
            .ok_or_else(|| anyhow!("Missing LLM provider or model"))?;
        let model = settings
            .model_name()
            .ok_or_else(|| anyhow!("Missing LLM provider or model"))?;
        let key = settings
            .provider_key()
            .ok_or_else(|| anyhow!("Missing {} API key", provider.as_str()))?;
        match provider {
            LlmProvider::Groq | LlmProvider::OpenAI => {
                let default_base = if provider == LlmProvider::Groq {
                    GROQ_BASE
                } else {
                    OPENAI_BASE
                };
                let base = settings.api_base.as_deref().unwrap_or(default_base);
                chat_once_openai(&self.client, base, key, model, history).await
            }
            LlmProvider::Gemini => {
                let base = settings.api_base.as_deref().unwrap_or(GEMINI_BASE);
                chat_once_gemini(&self.client, base, key, model, history).await
            }
        }
    }
}

async fn chat_once_openai(
    client: &reqwest::Client,
    api_base: &str,
    api_key: &str,
    model: &str,
    messages: &[Message],
) -> Result<String> {
    let url = format!("{}/chat/completions", api_base.trim_end_matches('/'));
    let body = json!({
        "model": model,
        "messages": openai_payload(messages),
        "stream": false
    });

    let resp = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("request failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    Ok(extract_openai_content(&v))
}

async fn chat_once_gemini(
    client: &reqwest::Client,
    api_base: &str,
    api_key: &str,
    model: &str,
    messages: &[Message],
) -> Result<String> {
    let base = normalize_gemini_base(api_base);
    let url = format!("{}/models/{}:generateContent", base, model);
    let (system_prompt, contents) = gemini_payload(messages);

    let mut body = json!({
        "contents": contents,
    });
    if let Some(sys) = system_prompt {
        body["system_instruction"] = json!({
            "parts": [{"text": sys}]
        });
    }

    let resp = client
        .post(url)
        .query(&[("key", api_key)])
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("gemini request failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    Ok(extract_gemini_content(&v))
}

fn openai_payload(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

fn extract_openai_content(v: &Value) -> String {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_gemini_content(v: &Value) -> String {
    if let Some(candidates) = v.get("candidates").and_then(|c| c.as_array()) {
        if let Some(first) = candidates.first() {
            if let Some(parts) = first
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(|p| p.as_array())
            {
                return parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("");
            }
        }
    }
    v.get("text")
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .to_string()
}

fn gemini_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.clone()),
            Role::Assistant => contents.push(json!({
                "role": "model",
                "parts": [{"text": msg.content}]
            })),
            Role::User => contents.push(json!({
                "role": "user",
                "parts": [{"text": msg.content}]
            })),
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, contents)
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<Message> {
        vec![
            Message::stored("s", Role::System, "be brief"),
            Message::stored("1", Role::User, "hi"),
            Message::stored("2", Role::Assistant, "hello"),
            Message::stored("3", Role::User, "how are you"),
        ]
    }

    #[test]
    fn test_openai_payload_keeps_order_and_roles() {
        let payload = openai_payload(&history());
        assert_eq!(payload.len(), 4);
        assert_eq!(payload[0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(payload[3]["role"], "user");
    }

    #[test]
    fn test_gemini_payload_splits_system_and_maps_roles() {
        let (system, contents) = gemini_payload(&history());
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "how are you");
    }

    #[test]
    fn test_extract_contents() {
        let openai = json!({"choices": [{"message": {"content": "hey"}}]});
        assert_eq!(extract_openai_content(&openai), "hey");
        assert_eq!(extract_openai_content(&json!({})), "");

        let gemini = json!({"candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}]});
        assert_eq!(extract_gemini_content(&gemini), "ab");
        assert_eq!(extract_gemini_content(&json!({"text": "t"})), "t");
    }

    #[test]
    fn test_normalize_gemini_base() {
        assert_eq!(
            normalize_gemini_base("https://g.example.com/"),
            "https://g.example.com/v1beta"
        );
        assert_eq!(normalize_gemini_base(GEMINI_BASE), GEMINI_BASE);
    }

    #[tokio::test]
    async fn test_generate_without_key_fails_before_any_request() {
        let settings = Settings {
            provider: Some(LlmProvider::Groq),
            model: Some("llama".into()),
            ..Default::default()
        };
        let err = HttpCompletionProvider::new()
            .generate(&settings, &history())
            .await
            .expect_err("missing key");
        assert!(err.to_string().contains("groq"));
    }
}
