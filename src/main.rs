use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use parla_live::audio::{MicrophoneCapture, SpeakerOutput};
use parla_live::config::{ConversationMode, MAX_ACCENT_INTENSITY};
use parla_live::persona::{self, PERSONAS};
use parla_live::settings::{self, AppSettings};
use parla_live::streaming::{get_api_key, LiveConnector, Role};
use parla_live::translation::{GeminiTranslator, NoopTranslator, Translator};
use parla_live::{ControllerDeps, SessionController, SessionStatus, SessionUpdate};

/// Spoken Italian practice with a live conversation partner
#[derive(Parser)]
#[command(name = "parla-live")]
#[command(about = "Live spoken conversation with gap-free playback and a bilingual transcript", long_about = None)]
struct Cli {
    /// Persona to talk to (see --list-personas)
    #[arg(short, long)]
    persona: Option<String>,

    /// Accent intensity, 0 (standard) to 100 (strong dialect)
    #[arg(short, long)]
    intensity: Option<u8>,

    /// Conversation mode: free-talk, lesson or roleplay
    #[arg(short, long)]
    mode: Option<String>,

    /// Start with the microphone muted
    #[arg(long)]
    muted: bool,

    /// Add a study note for this session (repeatable)
    #[arg(short, long = "note")]
    notes: Vec<String>,

    /// Print the persona catalog and exit
    #[arg(long)]
    list_personas: bool,

    /// Persist the resulting settings as the new defaults
    #[arg(long)]
    save: bool,
}

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        log::debug!("rustls crypto provider already installed");
    }

    let cli = Cli::parse();
    if cli.list_personas {
        for p in PERSONAS {
            println!("{:<10} {:<10} {:<10} voice {}", p.id, p.name, p.region, p.voice_id);
        }
        return;
    }

    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

/// Merge CLI flags over stored settings
fn apply_cli(mut settings: AppSettings, cli: &Cli) -> Result<AppSettings, String> {
    if let Some(id) = &cli.persona {
        if persona::find(id).is_none() {
            return Err(format!("Unknown persona '{}' (try --list-personas)", id));
        }
        settings.persona_id = id.clone();
    }
    if let Some(intensity) = cli.intensity {
        settings.accent_intensity = intensity.min(MAX_ACCENT_INTENSITY);
    }
    if let Some(mode) = &cli.mode {
        settings.mode = ConversationMode::parse(mode).ok_or_else(|| format!("Unknown mode '{}'", mode))?;
    }
    if cli.muted {
        settings.start_muted = true;
    }
    settings.notes.extend(cli.notes.iter().cloned());
    Ok(settings)
}

async fn run(cli: Cli) -> Result<(), String> {
    let settings = apply_cli(settings::load_settings(), &cli)?;
    if cli.save {
        settings::save_settings(&settings)?;
        log::info!("Settings saved");
    }

    let api_key = get_api_key()
        .ok_or_else(|| "Gemini API key not configured. Set GEMINI_API_KEY environment variable.".to_string())?;

    let translator: Arc<dyn Translator> = if settings.translation_language.trim().is_empty() {
        log::info!("Translation disabled");
        Arc::new(NoopTranslator)
    } else {
        Arc::new(GeminiTranslator::new(api_key.clone(), settings.translation_language.clone()))
    };

    let deps = ControllerDeps {
        connector: Arc::new(LiveConnector::new(api_key, settings.live_model.clone())),
        capture: Arc::new(MicrophoneCapture::new(settings.input_device.clone())),
        output: Arc::new(SpeakerOutput::new(settings.output_device.clone())),
        translator,
    };

    let mut config = settings.session_config();
    let controller = SessionController::spawn(config.clone(), deps);
    let mut updates = controller.subscribe();

    controller.mute(settings.start_muted).await.map_err(|e| e.to_string())?;
    controller.start().await.map_err(|e| e.to_string())?;

    println!("Commands: m = toggle mute, p <persona> = switch persona, i <0-100> = accent, t = transcript, s = start, q = quit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut last_status: Option<SessionStatus> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(update) => print_update(&update, &mut last_status),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Display fell behind, skipped {} updates", n);
                }
                Err(_) => break,
            },
            line = stdin.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                let mut parts = line.trim().splitn(2, ' ');
                match (parts.next().unwrap_or(""), parts.next().map(str::trim)) {
                    ("q", _) => break,
                    ("m", _) => {
                        let muted = !controller.is_muted();
                        controller.mute(muted).await.map_err(|e| e.to_string())?;
                    }
                    ("p", Some(id)) => match persona::find(id) {
                        Some(p) => {
                            config = config.clone().with_persona(p);
                            controller.change_config(config.clone()).await.map_err(|e| e.to_string())?;
                        }
                        None => println!("Unknown persona '{}'", id),
                    },
                    ("i", Some(value)) => match value.parse::<u8>() {
                        Ok(intensity) => {
                            config = config.clone().with_accent_intensity(intensity);
                            controller.change_config(config.clone()).await.map_err(|e| e.to_string())?;
                        }
                        Err(_) => println!("Accent intensity must be 0-100"),
                    },
                    ("t", _) => {
                        for line in controller.transcript().await.map_err(|e| e.to_string())? {
                            println!("{:>9}: {}", role_label(line.role), line.text);
                            if let Some(translation) = &line.translation {
                                println!("{:>9}  ({})", "", translation);
                            }
                        }
                    }
                    ("s", _) => {
                        // Restart after an error or a stop
                        controller.start().await.map_err(|e| e.to_string())?;
                    }
                    ("", _) => {}
                    (other, _) => println!("Unknown command '{}'", other),
                }
            }
        }
    }

    if let Ok(summary) = controller.metrics().await {
        if let Some(current) = &summary.current {
            log::info!(
                "Packets sent: {}, dropped: {}",
                current.packets.sent,
                current.packets.dropped()
            );
        }
    }
    controller.shutdown().await.map_err(|e| e.to_string())?;
    Ok(())
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "partner",
    }
}

fn print_update(update: &SessionUpdate, last_status: &mut Option<SessionStatus>) {
    match update {
        SessionUpdate::Status(status) => {
            // Live ticks every second; only show changes other than elapsed time
            let shown = match status {
                SessionStatus::Live { muted, .. } => SessionStatus::Live {
                    muted: *muted,
                    elapsed_secs: 0,
                },
                other => other.clone(),
            };
            if last_status.as_ref() != Some(&shown) {
                let json = serde_json::to_string(status).unwrap_or_default();
                println!("[status] {}", json);
                *last_status = Some(shown);
            }
        }
        SessionUpdate::LineUpdated(line) if line.is_final => {
            println!("{:>9}: {}", role_label(line.role), line.text);
            if let Some(translation) = &line.translation {
                println!("{:>9}  ({})", "", translation);
            }
        }
        SessionUpdate::LineUpdated(_) => {}
        SessionUpdate::TranscriptCleared => println!("[transcript cleared]"),
        SessionUpdate::FactsExtracted(facts) => {
            for fact in facts {
                println!("[note] {}: {}", fact.key, fact.value);
            }
        }
        SessionUpdate::PlaybackInterrupted { dropped } => {
            log::debug!("Playback interrupted ({} buffers dropped)", dropped);
        }
    }
}
