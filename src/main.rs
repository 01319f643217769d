//! LocalChat - on-device LLM chat from the terminal
//!
//! Loads a GGUF model through llama.cpp and generates text in one-shot or
//! interactive chat mode.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use localchat::chat::ChatSession;
use localchat::inference::{EngineError, Generation, LlamaEngine};
use localchat::storage::history::ChatHistory;
use localchat::storage::models::scan_models_directory;
use localchat::storage::settings::{load_settings, InferenceSettings, Preset};
use localchat::storage::{init_storage, StorageError};
use localchat::system::get_resource_usage;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("No model given; pass --model or set model_path in settings.json")]
    NoModel,
}

/// Run local language models from the terminal
#[derive(Parser)]
#[command(name = "localchat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a single reply to a prompt.
    Generate {
        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Print fragments as they are produced.
        #[arg(long)]
        stream: bool,

        /// Send the prompt as-is instead of wrapping it in the chat template.
        #[arg(long)]
        raw: bool,

        #[command(flatten)]
        model: ModelArgs,
    },
    /// Chat interactively. `/clear` resets the conversation, `/exit` quits.
    Chat {
        /// Do not append the conversation to the saved history.
        #[arg(long)]
        no_save: bool,

        #[command(flatten)]
        model: ModelArgs,
    },
    /// List model files in the models directory.
    Models {
        /// Directory to scan instead of the configured one.
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

/// Overrides for the saved settings
#[derive(Args)]
struct ModelArgs {
    /// Path to a GGUF model file.
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Speed/quality preset: fast, balanced or quality.
    #[arg(long)]
    preset: Option<Preset>,

    /// Maximum number of tokens to generate.
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Sampling temperature (0 = greedy).
    #[arg(short, long)]
    temperature: Option<f32>,

    /// Random seed for reproducible sampling (0 = random).
    #[arg(long)]
    seed: Option<u32>,

    /// Context window size in tokens (0 = model default).
    #[arg(long)]
    context_size: Option<u32>,

    /// Layers to offload to the GPU.
    #[arg(long)]
    gpu_layers: Option<u32>,

    /// Decoding threads.
    #[arg(long)]
    threads: Option<u32>,
}

impl ModelArgs {
    fn apply(&self, settings: &mut InferenceSettings) {
        if let Some(preset) = self.preset {
            settings.apply_preset(preset);
        }
        if let Some(path) = &self.model {
            settings.model_path = Some(path.clone());
        }
        if let Some(max_tokens) = self.max_tokens {
            settings.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            settings.temperature = temperature;
        }
        if let Some(seed) = self.seed {
            settings.seed = seed;
        }
        if let Some(context_size) = self.context_size {
            settings.context_size = context_size;
        }
        if let Some(gpu_layers) = self.gpu_layers {
            settings.gpu_layers = gpu_layers;
        }
        if self.threads.is_some() {
            settings.threads = self.threads;
        }
        settings.validate();
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env().add_directive("localchat=info".parse().unwrap()))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut settings = load_settings();

    match cli.command {
        Command::Generate {
            prompt,
            stream,
            raw,
            model,
        } => {
            model.apply(&mut settings);
            let engine = start_engine(&settings)?;

            let generation = if raw {
                let request = settings.to_request(prompt);
                if stream {
                    engine.generate_streaming(request, print_fragment)?
                } else {
                    engine.generate(request)?
                }
            } else {
                let mut session = ChatSession::from_settings(&settings);
                if stream {
                    session.send_streaming(&engine, &prompt, print_fragment)?
                } else {
                    session.send(&engine, &prompt)?
                }
            };

            if stream {
                println!();
            } else {
                println!("{}", generation.text);
            }
            report(&generation);
        }
        Command::Chat { no_save, model } => {
            model.apply(&mut settings);
            let engine = start_engine(&settings)?;
            let history = if no_save {
                None
            } else {
                Some(ChatHistory::open(init_storage()?))
            };
            chat_loop(&engine, &settings, history.as_ref())?;
        }
        Command::Models { dir } => {
            let dir = dir.unwrap_or_else(|| settings.models_directory.clone());
            let models = scan_models_directory(&dir)?;
            if models.is_empty() {
                println!("No models found in {}", dir.display());
            }
            for model in models {
                println!("{:<48} {:>10}  {}", model.filename, model.size_string(), model.format());
            }
        }
    }

    Ok(())
}

fn start_engine(settings: &InferenceSettings) -> Result<LlamaEngine, CliError> {
    let path = settings.model_path.clone().ok_or(CliError::NoModel)?;

    let mut engine = LlamaEngine::new();
    engine.init()?;
    let model_info = engine.load_model(&path, settings.load_options())?;
    info!(
        "Loaded {} ({} params, trained context {})",
        model_info.path, model_info.param_count, model_info.context_length
    );

    Ok(engine)
}

fn chat_loop(
    engine: &LlamaEngine,
    settings: &InferenceSettings,
    history: Option<&ChatHistory>,
) -> Result<(), CliError> {
    let mut session = ChatSession::from_settings(settings);
    let stdin = io::stdin();

    prompt_marker()?;
    for line in stdin.lock().lines() {
        let line = line?;
        let input = line.trim();

        match input {
            "" => {}
            "/exit" | "/quit" => break,
            "/clear" => {
                session.clear_history();
                println!("(conversation cleared)");
            }
            _ => match session.send_streaming(engine, input, print_fragment) {
                Ok(generation) => {
                    println!();
                    report(&generation);
                    let saved = match history {
                        Some(history) if generation.has_reply() => {
                            history.store_exchange(input, &generation.text)
                        }
                        _ => Ok(()),
                    };
                    if let Err(e) = saved {
                        tracing::warn!("Failed to save chat history: {}", e);
                    }
                }
                Err(e) => eprintln!("error: {e}"),
            },
        }

        prompt_marker()?;
    }

    Ok(())
}

fn print_fragment(fragment: &str) -> bool {
    let mut stdout = io::stdout();
    stdout
        .write_all(fragment.as_bytes())
        .and_then(|_| stdout.flush())
        .is_ok()
}

fn prompt_marker() -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(b"> ")?;
    stdout.flush()
}

fn report(generation: &Generation) {
    match generation.error() {
        Some(e) => tracing::warn!("Generation cut short: {}", e),
        None => info!(
            "Finished ({}): {} prompt tokens, {} generated",
            generation.finish_reason, generation.prompt_tokens, generation.generated_tokens
        ),
    }
    if let Some(usage) = get_resource_usage() {
        info!("Memory: {}", usage);
    }
}
