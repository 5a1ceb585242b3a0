use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};

use crate::error::{ChatError, ChatResult};
use crate::settings::{Settings, TranscriptionProvider, TtsProvider};

const GROQ_AUDIO_BASE: &str = "https://api.groq.com/openai/v1/audio";
const OPENAI_AUDIO_BASE: &str = "https://api.openai.com/v1/audio";
const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/** \brief Gemini TTS 返回的 PCM 参数。 */
const GEMINI_SAMPLE_RATE: u32 = 24_000;
const GEMINI_CHANNELS: u16 = 1;
const GEMINI_BITS_PER_SAMPLE: u16 = 16;

/**
 * \brief 合成得到的音频。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechAudio {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

/**
 * \brief 语音转写：音频字节进，文本出。
 */
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>, settings: &Settings) -> ChatResult<String>;
}

/**
 * \brief 语音合成：文本进，音频字节出。
 */
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, settings: &Settings) -> ChatResult<SpeechAudio>;
}

/**
 * \brief 基于 HTTP 的转写与合成实现。
 */
#[derive(Clone, Default)]
pub struct HttpSpeech {
    client: reqwest::Client,
}

impl HttpSpeech {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transcriber for HttpSpeech {
    async fn transcribe(&self, audio: Vec<u8>, settings: &Settings) -> ChatResult<String> {
        if !settings.microphone_enabled {
            return Err(ChatError::Configuration("Microphone not enabled".into()));
        }
        let provider = settings.transcription_provider.ok_or_else(|| {
            ChatError::Configuration("No transcription provider selected".into())
        })?;
        let (base, key, default_model) = match provider {
            TranscriptionProvider::Groq => (
                GROQ_AUDIO_BASE,
                settings.groq_key(),
                "whisper-large-v3-turbo",
            ),
            TranscriptionProvider::OpenAI => {
                (OPENAI_AUDIO_BASE, settings.openai_key(), "whisper-1")
            }
        };
        let key = key.ok_or_else(|| missing_key(provider_label_stt(provider)))?;
        let model = settings
            .transcription_model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(default_model);
        transcribe_openai_compatible(&self.client, base, key, model, audio)
            .await
            .map_err(ChatError::provider)
    }
}

#[async_trait]
impl Synthesizer for HttpSpeech {
    async fn synthesize(&self, text: &str, settings: &Settings) -> ChatResult<SpeechAudio> {
        if !settings.tts_enabled {
            return Err(ChatError::Configuration("TTS not enabled".into()));
        }
        let provider = settings
            .tts_provider
            .ok_or_else(|| ChatError::Configuration("No TTS provider selected".into()))?;
        let model = settings.tts_model.as_deref().filter(|m| !m.trim().is_empty());
        let voice = settings.tts_voice.as_deref().filter(|v| !v.trim().is_empty());
        let result = match provider {
            TtsProvider::Groq => {
                let key = settings.groq_key().ok_or_else(|| missing_key("Groq"))?;
                speech_openai_compatible(
                    &self.client,
                    GROQ_AUDIO_BASE,
                    key,
                    model.unwrap_or("playai-tts"),
                    voice.unwrap_or("Fritz-PlayAI"),
                    "wav",
                    text,
                )
                .await
            }
            TtsProvider::OpenAI => {
                let key = settings.openai_key().ok_or_else(|| missing_key("OpenAI"))?;
                speech_openai_compatible(
                    &self.client,
                    OPENAI_AUDIO_BASE,
                    key,
                    model.unwrap_or("tts-1"),
                    voice.unwrap_or("alloy"),
                    "mp3",
                    text,
                )
                .await
            }
            TtsProvider::Gemini => {
                let key = settings.gemini_key().ok_or_else(|| missing_key("Gemini"))?;
                speech_gemini(
                    &self.client,
                    key,
                    model.unwrap_or("gemini-2.5-flash-preview-tts"),
                    voice.unwrap_or("Kore"),
                    text,
                )
                .await
            }
        };
        result.map_err(ChatError::provider)
    }
}

fn missing_key(provider: &str) -> ChatError {
    ChatError::Configuration(format!("{} API key not provided", provider))
}

fn provider_label_stt(provider: TranscriptionProvider) -> &'static str {
    match provider {
        TranscriptionProvider::Groq => "Groq",
        TranscriptionProvider::OpenAI => "OpenAI",
    }
}

async fn transcribe_openai_compatible(
    client: &reqwest::Client,
    base: &str,
    api_key: &str,
    model: &str,
    audio: Vec<u8>,
) -> Result<String> {
    let file = Part::bytes(audio)
        .file_name("audio.wav")
        .mime_str("audio/wav")?;
    let form = Form::new()
        .part("file", file)
        .text("model", model.to_string())
        .text("language", "en");
    let resp = client
        .post(format!("{}/transcriptions", base))
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .multipart(form)
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("transcription failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    v.get("text")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("transcription response has no text: {}", v))
}

async fn speech_openai_compatible(
    client: &reqwest::Client,
    base: &str,
    api_key: &str,
    model: &str,
    voice: &str,
    format: &'static str,
    text: &str,
) -> Result<SpeechAudio> {
    let resp = client
        .post(format!("{}/speech", base))
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .header(CONTENT_TYPE, "application/json")
        .json(&json!({
            "model": model,
            "voice": voice,
            "input": text,
            "response_format": format
        }))
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("speech request failed: {} -> {}", status, text));
    }
    let bytes = resp.bytes().await?.to_vec();
    let mime = if format == "wav" { "audio/wav" } else { "audio/mpeg" };
    Ok(SpeechAudio { bytes, mime })
}

async fn speech_gemini(
    client: &reqwest::Client,
    api_key: &str,
    model: &str,
    voice: &str,
    text: &str,
) -> Result<SpeechAudio> {
    let url = format!("{}/models/{}:generateContent", GEMINI_BASE, model);
    let body = json!({
        "contents": [{ "parts": [{ "text": format!("Say: {}", text) }] }],
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            }
        }
    });
    let resp = client
        .post(url)
        .query(&[("key", api_key)])
        .json(&body)
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("gemini tts failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    let pcm = extract_gemini_audio(&v)?;
    Ok(SpeechAudio {
        bytes: wrap_pcm_as_wav(&pcm),
        mime: "audio/wav",
    })
}

fn extract_gemini_audio(v: &Value) -> Result<Vec<u8>> {
    let data = v
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.get(0))
        .and_then(|p| p.get("inlineData"))
        .and_then(|d| d.get("data"))
        .and_then(|d| d.as_str())
        .ok_or_else(|| anyhow!("No audio data received from Gemini TTS"))?;
    Ok(STANDARD.decode(data)?)
}

/**
 * \brief 为 Gemini 返回的裸 PCM 补上 44 字节 WAV 头（24kHz/单声道/16bit）。
 */
pub fn wrap_pcm_as_wav(pcm: &[u8]) -> Vec<u8> {
    let mut out = wav_header(
        pcm.len() as u32,
        GEMINI_SAMPLE_RATE,
        GEMINI_CHANNELS,
        GEMINI_BITS_PER_SAMPLE,
    )
    .to_vec();
    out.extend_from_slice(pcm);
    out
}

fn wav_header(data_len: u32, sample_rate: u32, channels: u16, bits_per_sample: u16) -> [u8; 44] {
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * block_align as u32;
    let mut h = [0u8; 44];
    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes());
    h[20..22].copy_from_slice(&1u16.to_le_bytes());
    h[22..24].copy_from_slice(&channels.to_le_bytes());
    h[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    h[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    h[32..34].copy_from_slice(&block_align.to_le_bytes());
    h[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_len.to_le_bytes());
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header_layout() {
        let wav = wrap_pcm_as_wav(&[1, 2, 3, 4]);
        assert_eq!(wav.len(), 48);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[4], wav[5], wav[6], wav[7]]), 40);
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 24_000);
        assert_eq!(u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]), 48_000);
        assert_eq!(u16::from_le_bytes([wav[32], wav[33]]), 2);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(&wav[44..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_extract_gemini_audio() {
        let v = json!({"candidates": [{"content": {"parts": [{"inlineData": {"data": "AQID"}}]}}]});
        assert_eq!(extract_gemini_audio(&v).expect("audio"), vec![1, 2, 3]);
        assert!(extract_gemini_audio(&json!({"candidates": []})).is_err());
    }

    #[tokio::test]
    async fn test_disabled_features_are_configuration_errors() {
        let speech = HttpSpeech::new();
        let settings = Settings::default();
        let err = speech
            .transcribe(vec![0u8; 4], &settings)
            .await
            .expect_err("mic disabled");
        assert!(matches!(err, ChatError::Configuration(_)));
        let err = speech
            .synthesize("hi", &settings)
            .await
            .expect_err("tts disabled");
        assert!(matches!(err, ChatError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_provider_key_is_configuration_error() {
        let settings = Settings {
            tts_enabled: true,
            tts_provider: Some(TtsProvider::Gemini),
            microphone_enabled: true,
            transcription_provider: Some(TranscriptionProvider::OpenAI),
            ..Default::default()
        };
        let speech = HttpSpeech::new();
        let err = speech.synthesize("hi", &settings).await.expect_err("no key");
        assert_eq!(
            err,
            ChatError::Configuration("Gemini API key not provided".into())
        );
        let err = speech
            .transcribe(vec![1], &settings)
            .await
            .expect_err("no key");
        assert_eq!(
            err,
            ChatError::Configuration("OpenAI API key not provided".into())
        );
    }
}
