use anyhow::{Context, Result};
use clap::Parser;
use companion_core::backend::{CompletionBackend, GeminiBackend, OpenAiBackend};
use companion_core::{
    CallStatus, CompanionSession, Role, SessionConfig, SessionEvent, TutorClient, VoiceProfile,
};
use companion_service::commands::{ConsoleCommand, HELP};
use companion_service::config::{Config, TutorProvider};
use companion_service::console::ConsoleSynthesizer;
use companion_service::history::JsonlHistory;
use companion_service::prompt_loader::Prompts;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Talk to an AI tutor from the terminal")]
struct Cli {
    /// Companion whose session history is updated when the call ends
    #[arg(long)]
    companion_id: String,
    #[arg(long)]
    subject: String,
    /// The topic to learn about
    #[arg(long)]
    topic: String,
    /// Conversational style, e.g. "socratic" or "casual"
    #[arg(long)]
    style: String,
    /// Tutor display name
    #[arg(long)]
    name: String,
    #[arg(long)]
    voice: Option<String>,
    #[arg(long, default_value_t = 1.0)]
    rate: f32,
    #[arg(long, default_value_t = 1.0)]
    pitch: f32,
    #[arg(long, default_value_t = 1.0)]
    volume: f32,
    /// Write the transcript here as JSON when the session ends
    #[arg(long)]
    transcript_out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Parse Command-Line Arguments ---
    let args = Cli::parse();

    // --- 2. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 3. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!(provider = ?config.provider, model = %config.model, "Configuration loaded.");

    // --- 4. Load Prompts ---
    let prompts =
        Prompts::load_optional(&config.prompts_dir).context("Failed to load tutor prompts")?;
    tracing::info!("Loaded {} prompt overrides.", prompts.len());

    // --- 5. Build the Session ---
    let mut options = config.session_options();
    options.voice = VoiceProfile::default()
        .with_rate(args.rate)
        .with_pitch(args.pitch)
        .with_volume(args.volume);

    let backend: Arc<dyn CompletionBackend> = match config.provider {
        TutorProvider::Gemini => Arc::new(GeminiBackend::new(config.api_key)),
        TutorProvider::OpenAI => Arc::new(OpenAiBackend::new(config.api_key)),
    };
    let mut tutor =
        TutorClient::new(backend, config.model).with_context_window(config.context_window);
    if let Some(instructions) = prompts.tutor_instructions() {
        tutor = tutor.with_instructions(instructions);
    }

    let history = Arc::new(JsonlHistory::new(config.history_file));
    match history.records().await {
        Ok(records) => {
            let previous = records
                .iter()
                .filter(|record| record.companion_id == args.companion_id)
                .count();
            tracing::info!(previous, "Previous sessions with this companion.");
        }
        Err(err) => tracing::warn!(error = ?err, "Could not read session history."),
    }

    let session = CompanionSession::builder(Arc::new(tutor))
        .synthesis(Arc::new(ConsoleSynthesizer::new()))
        .history(history)
        .options(options)
        .build();

    let speaker_muted = Arc::new(AtomicBool::new(false));
    let (ended_tx, mut ended_rx) = watch::channel(false);
    attach_printer(&session, speaker_muted.clone(), ended_tx);

    // --- 6. Run ---
    let mut session_config = SessionConfig::new(
        args.companion_id,
        args.subject,
        args.topic,
        args.style,
        args.name,
    );
    if let Some(voice) = args.voice {
        session_config = session_config.with_voice(voice);
    }
    let tutor_name = session_config.name.clone();
    println!("Calling {tutor_name}... (type /help for commands)");
    session
        .start(session_config)
        .await
        .context("Failed to start tutoring session")?;

    tokio::select! {
        result = run_console(session.clone(), speaker_muted) => result?,
        _ = ended_rx.wait_for(|ended| *ended) => {
            tracing::info!("Session ended.");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down...");
        }
    }

    session.shutdown();
    session.events().flush().await;

    if let Some(path) = args.transcript_out {
        let transcript = serde_json::to_string_pretty(&session.transcript())
            .context("Failed to encode transcript")?;
        tokio::fs::write(&path, transcript)
            .await
            .with_context(|| format!("Failed to write transcript to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Transcript saved.");
    }
    tracing::info!("Shutting down...");
    Ok(())
}

/// Prints session events the user should see.
fn attach_printer(
    session: &CompanionSession,
    speaker_muted: Arc<AtomicBool>,
    ended: watch::Sender<bool>,
) {
    session.events().subscribe_all(move |event| match event {
        SessionEvent::CallStart => println!("-- call started --"),
        SessionEvent::CallEnd => {
            println!("-- call ended --");
            ended.send_replace(true);
        }
        // Spoken replies are printed by the console engine; only show them when it is silent.
        SessionEvent::Message(message)
            if message.role == Role::Assistant && speaker_muted.load(Ordering::Relaxed) =>
        {
            println!("Tutor: {}", message.transcript);
        }
        SessionEvent::Message(_) => {}
        SessionEvent::Error(err) => eprintln!("! {err}"),
        SessionEvent::VoiceSettingsUpdated(profile) => println!(
            "voice: {} rate {:.1} pitch {:.1} volume {:.1}",
            profile.voice.as_deref().unwrap_or("default"),
            profile.rate,
            profile.pitch,
            profile.volume
        ),
        SessionEvent::SpeechStart(source) => tracing::debug!(?source, "speech started"),
        SessionEvent::SpeechEnd(source) => tracing::debug!(?source, "speech ended"),
    });
}

/// Reads stdin on a plain thread; a pending blocking read must not hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_console(session: CompanionSession, speaker_muted: Arc<AtomicBool>) -> Result<()> {
    let mut lines = spawn_stdin_reader();

    while let Some(line) = lines.recv().await {
        let line = line.context("Failed to read user input")?;
        let Some(command) = ConsoleCommand::parse(&line) else {
            continue;
        };
        match command {
            ConsoleCommand::Say(text) => {
                // Turns run in the background so commands such as `/speaker off` stay
                // responsive while the tutor is talking.
                let session = session.clone();
                tokio::spawn(async move {
                    if let Err(err) = session.send_text(&text).await {
                        eprintln!("! {err}");
                    }
                });
            }
            ConsoleCommand::Mute => session.set_muted(true),
            ConsoleCommand::Unmute => session.set_muted(false),
            ConsoleCommand::Speaker(on) => {
                speaker_muted.store(!on, Ordering::Relaxed);
                session.set_speaker_muted(!on);
            }
            ConsoleCommand::Rate(rate) => {
                session.update_voice_settings(session.voice_settings().with_rate(rate))
            }
            ConsoleCommand::Pitch(pitch) => {
                session.update_voice_settings(session.voice_settings().with_pitch(pitch))
            }
            ConsoleCommand::Volume(volume) => {
                session.update_voice_settings(session.voice_settings().with_volume(volume))
            }
            ConsoleCommand::Voice(name) => {
                if !session.voices().iter().any(|voice| voice.name == name) {
                    println!("unknown voice {name:?}; the first available voice will be used");
                }
                session.update_voice_settings(session.voice_settings().with_voice(name));
            }
            ConsoleCommand::Voices => {
                for voice in session.voices() {
                    println!("  {} ({})", voice.name, voice.lang);
                }
            }
            ConsoleCommand::History => {
                for entry in session.transcript() {
                    let speaker = match entry.role {
                        Role::User => "You",
                        Role::Assistant => "Tutor",
                    };
                    println!("  [{}] {speaker}: {}", entry.timestamp.format("%H:%M:%S"), entry.content);
                }
            }
            ConsoleCommand::Help => println!("{HELP}"),
            ConsoleCommand::Quit => break,
            ConsoleCommand::Invalid(hint) => println!("{hint}"),
        }

        if session.status() == CallStatus::Finished {
            break;
        }
    }
    Ok(())
}
