use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chatwell_core_sdk::conversation::ConversationCore;
use chatwell_core_sdk::models::{Message, Role};
use chatwell_core_sdk::settings::{
    LlmProvider, Settings, SettingsStore, TranscriptionProvider, TtsProvider,
};
use chatwell_core_sdk::speech::{HttpSpeech, Synthesizer, Transcriber};
use chatwell_core_sdk::{db, server, telemetry};

/**
 * \brief CLI 程序入口。
 */
#[derive(Parser, Debug)]
#[command(name = "chatwell", version, about = "Chatwell chat client")]
struct Cli {
    /** \brief 设置数据库路径，缺省读取 CHATWELL_DB，否则为 chatwell.db */
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 更新设置；未给出的字段保持不变，传空字符串清空。
     */
    Configure(ConfigureArgs),

    /** \brief 显示当前设置（密钥只显示是否已设置）。 */
    Settings,

    /** \brief 列出会话。 */
    Chats,

    /** \brief 显示会话消息，缺省为最近更新的会话。 */
    History {
        #[arg(long)]
        chat: Option<String>,
    },

    /**
     * \brief 发送一条消息并打印模型回复。
     */
    Chat {
        #[arg(long)]
        chat: Option<String>,
        #[arg(long)]
        prompt: String,
    },

    /**
     * \brief 编辑一条消息，删除其后的消息并重新生成回复。
     */
    Edit {
        #[arg(long)]
        chat: Option<String>,
        #[arg(long)]
        message: String,
        #[arg(long)]
        content: String,
    },

    /** \brief 新建会话（存在空会话时复用）。 */
    New,

    Delete {
        #[arg(long)]
        chat: String,
    },

    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },

    /** \brief 转写音频文件。 */
    Transcribe {
        #[arg(long)]
        file: PathBuf,
    },

    /** \brief 合成语音并写入文件。 */
    Speak {
        #[arg(long)]
        text: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct ConfigureArgs {
    #[arg(long)]
    provider: Option<LlmProvider>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    system_prompt: Option<String>,
    #[arg(long)]
    groq_key: Option<String>,
    #[arg(long)]
    openai_key: Option<String>,
    #[arg(long)]
    gemini_key: Option<String>,
    /** \brief 远端存储地址：http(s) 为 PostgREST，sqlite://<path> 为本地文件 */
    #[arg(long)]
    backend_url: Option<String>,
    #[arg(long)]
    backend_key: Option<String>,
    #[arg(long)]
    microphone: Option<bool>,
    #[arg(long)]
    transcription_provider: Option<TranscriptionProvider>,
    #[arg(long)]
    transcription_model: Option<String>,
    #[arg(long)]
    tts: Option<bool>,
    #[arg(long)]
    tts_provider: Option<TtsProvider>,
    #[arg(long)]
    tts_model: Option<String>,
    #[arg(long)]
    tts_voice: Option<String>,
    #[arg(long)]
    telemetry: Option<bool>,
}

fn set_text(slot: &mut Option<String>, value: Option<String>) {
    if let Some(v) = value {
        *slot = if v.trim().is_empty() { None } else { Some(v) };
    }
}

impl ConfigureArgs {
    fn apply(self, s: &mut Settings) {
        if self.provider.is_some() {
            s.provider = self.provider;
        }
        set_text(&mut s.model, self.model);
        set_text(&mut s.api_base, self.api_base);
        set_text(&mut s.system_prompt, self.system_prompt);
        set_text(&mut s.groq_api_key, self.groq_key);
        set_text(&mut s.openai_api_key, self.openai_key);
        set_text(&mut s.gemini_api_key, self.gemini_key);
        set_text(&mut s.backend_url, self.backend_url);
        set_text(&mut s.backend_key, self.backend_key);
        if let Some(v) = self.microphone {
            s.microphone_enabled = v;
        }
        if self.transcription_provider.is_some() {
            s.transcription_provider = self.transcription_provider;
        }
        set_text(&mut s.transcription_model, self.transcription_model);
        if let Some(v) = self.tts {
            s.tts_enabled = v;
        }
        if self.tts_provider.is_some() {
            s.tts_provider = self.tts_provider;
        }
        set_text(&mut s.tts_model, self.tts_model);
        set_text(&mut s.tts_voice, self.tts_voice);
        if let Some(v) = self.telemetry {
            s.telemetry_enabled = v;
        }
    }
}

fn presence(value: Option<&str>) -> &'static str {
    if value.is_some() {
        "set"
    } else {
        "unset"
    }
}

fn print_settings(s: &Settings) {
    println!(
        "mode:          {}",
        if s.has_backend_creds() { "synced" } else { "local" }
    );
    println!("backend_url:   {}", s.backend_url.as_deref().unwrap_or("-"));
    println!("backend_key:   {}", presence(s.backend_key.as_deref()));
    println!(
        "provider:      {}",
        s.provider.map(|p| p.as_str()).unwrap_or("-")
    );
    println!("model:         {}", s.model_name().unwrap_or("-"));
    println!("api_base:      {}", s.api_base.as_deref().unwrap_or("-"));
    println!("system_prompt: {}", presence(s.system_prompt()));
    println!("groq_key:      {}", presence(s.groq_key()));
    println!("openai_key:    {}", presence(s.openai_key()));
    println!("gemini_key:    {}", presence(s.gemini_key()));
    println!("microphone:    {}", s.microphone_enabled);
    println!("tts:           {}", s.tts_enabled);
    println!("telemetry:     {}", s.telemetry_enabled);
}

fn print_messages(messages: &[Message]) {
    for m in messages {
        println!("[{}] {}", m.role.as_str(), m.id());
        println!("{}", m.content);
        println!();
    }
}

/**
 * \brief 按设置构造会话核心并加载会话列表，可选切换到指定会话。
 */
async fn open_core(settings: Settings, chat: Option<&str>) -> Result<ConversationCore> {
    let core = ConversationCore::with_defaults();
    core.change_settings(settings).await?;
    if !core.snapshot().synced {
        tracing::warn!(
            target: "chatwell",
            "local mode: chats live only for this run; configure --backend-url to keep them"
        );
    }
    if let Some(id) = chat {
        core.select_chat(id).await?;
    }
    Ok(core)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let db_path = cli.db.clone().unwrap_or_else(db::default_db_path);
    let settings = {
        let conn = db::open_db(&db_path).context("open database failed")?;
        db::migrate(&conn).context("apply migrations failed")?;
        SettingsStore::new(&conn).load()
    };
    telemetry::set_enabled(settings.telemetry_enabled);

    match cli.command {
        Commands::Configure(args) => {
            let mut next = settings;
            args.apply(&mut next);
            let conn = db::open_db(&db_path).context("open database failed")?;
            SettingsStore::new(&conn)
                .save(&next)
                .context("save settings failed")?;
            telemetry::set_enabled(next.telemetry_enabled);
            println!("Saved settings to {}", db_path.display());
            print_settings(&next);
        }
        Commands::Settings => print_settings(&settings),
        Commands::Chats => {
            let core = open_core(settings, None).await?;
            let state = core.snapshot();
            for chat in state.chats {
                let marker = if state.active_id.as_deref() == Some(chat.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{} {}  {}", marker, chat.id, chat.title);
            }
        }
        Commands::History { chat } => {
            let core = open_core(settings, chat.as_deref()).await?;
            print_messages(&core.snapshot().messages);
        }
        Commands::Chat { chat, prompt } => {
            let core = open_core(settings, chat.as_deref()).await?;
            telemetry::log_event("cli.chat", &format!("prompt_len={}", prompt.len()));
            core.send(&prompt).await?;
            let state = core.snapshot();
            if let Some(reply) = state.messages.last().filter(|m| m.role == Role::Assistant) {
                println!("{}", reply.content);
            }
            if let Some(id) = state.active_id {
                println!("(chat id={})", id);
            }
        }
        Commands::Edit {
            chat,
            message,
            content,
        } => {
            let core = open_core(settings, chat.as_deref()).await?;
            core.edit_message(&message, &content).await?;
            print_messages(&core.snapshot().messages);
        }
        Commands::New => {
            let core = open_core(settings, None).await?;
            core.new_chat().await?;
            if let Some(id) = core.snapshot().active_id {
                println!("Active chat id={}", id);
            }
        }
        Commands::Delete { chat } => {
            let core = open_core(settings, None).await?;
            core.delete_chat(&chat).await?;
            println!("Deleted chat id={}", chat);
        }
        Commands::Serve { addr } => {
            server::run(&addr, db_path).await?;
        }
        Commands::Transcribe { file } => {
            let audio = std::fs::read(&file)
                .with_context(|| format!("read {} failed", file.display()))?;
            let text = HttpSpeech::new().transcribe(audio, &settings).await?;
            println!("{}", text);
        }
        Commands::Speak { text, out } => {
            let audio = HttpSpeech::new().synthesize(&text, &settings).await?;
            std::fs::write(&out, &audio.bytes)
                .with_context(|| format!("write {} failed", out.display()))?;
            println!(
                "Wrote {} bytes ({}) to {}",
                audio.bytes.len(),
                audio.mime,
                out.display()
            );
        }
    }

    Ok(())
}
