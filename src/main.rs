//! persona-chat CLI: a small REPL front end over the generation worker.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use persona_chat::binding::BindingRegistry;
use persona_chat::personality::processor::ProcessorRegistry;
use persona_chat::personality::Personality;
use persona_chat::prompt::Discussion;
use persona_chat::worker::ModelRunner;
use persona_chat::AppConfig;

#[derive(Parser, Debug)]
#[command(
    name = "persona-chat",
    version,
    about = "Chat with interchangeable LLM bindings through configurable personas"
)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "configs/config.yaml")]
    config: PathBuf,

    /// Binding to use (overrides the configuration file).
    #[arg(short, long)]
    binding: Option<String>,

    /// Model identifier to load (overrides the configuration file).
    #[arg(short, long)]
    model: Option<String>,

    /// Personality name (overrides the configuration file).
    #[arg(short, long)]
    personality: Option<String>,

    /// List the models advertised by the active binding and exit.
    #[arg(long)]
    list_models: bool,
}

fn setup_logging(debug: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = "logs";
    std::fs::create_dir_all(log_dir)?;
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    let log_path = format!("{log_dir}/{timestamp}.log");

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}",
        )))
        .build(log_path)?;

    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .build(Root::builder().appender("file").build(level))?;

    log4rs::init_config(config)?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        AppConfig::load(&args.config)?
    } else {
        AppConfig::default()
    };
    if let Some(binding) = args.binding {
        config.binding = binding;
    }
    if let Some(model) = args.model {
        config.model = Some(model);
    }
    if let Some(personality) = args.personality {
        config.personality = personality;
    }

    if let Err(e) = setup_logging(config.debug) {
        eprintln!("Failed to set up logging: {e}");
    }

    let registry = BindingRegistry::with_builtin(&config.bindings_path);
    let available = registry.discover();
    log::info!("bindings with on-disk packages: {available:?}");

    if args.list_models {
        for entry in registry.available_models(&config.binding)? {
            let filename = entry.filename.as_deref().unwrap_or("-");
            let license = entry.license.as_deref().unwrap_or("unknown license");
            println!("{:<32} {filename:<40} {license}", entry.name);
        }
        return Ok(());
    }

    let processors = Arc::new(ProcessorRegistry::new());
    let persona = Personality::load_or_default(
        &config.personalities_path,
        &config.personality_language,
        &config.personality_category,
        &config.personality,
        &processors,
    );

    println!(
        "persona-chat {} | binding: {} | personality: {}",
        env!("CARGO_PKG_VERSION"),
        config.binding,
        persona.name
    );
    if !persona.disclaimer.is_empty() {
        println!("\nDisclaimer\n{}\n", persona.disclaimer);
    }
    if !persona.welcome_message.is_empty() {
        println!("{}", persona.welcome_message);
    }

    let mut runner = ModelRunner::new(config, Arc::new(registry), processors);
    runner.start();
    let chunks = runner.chunk_receiver();

    let mut discussion = Discussion::new(&persona);
    discussion.greet(&persona);

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut next_id: u64 = 0;

    loop {
        print!("You: ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let prompt_text = line.trim();
        if prompt_text.is_empty() {
            continue;
        }
        if prompt_text == "exit" {
            break;
        }

        discussion.push_user_turn(&persona, prompt_text);
        next_id += 1;
        if runner.generate(discussion.flatten(), next_id).is_err() {
            eprintln!("The generation worker is not running.");
            break;
        }
        if runner.wait_until_started(Duration::from_secs(30)).is_none() {
            eprintln!("The worker never started the request; check the logs.");
            continue;
        }

        print!("{}: ", persona.name);
        io::stdout().flush()?;
        let mut reply = String::new();
        loop {
            match chunks.recv_timeout(Duration::from_millis(100)) {
                Ok(chunk) => {
                    print!("{}", chunk.text);
                    io::stdout().flush()?;
                    reply.push_str(&chunk.text);
                }
                Err(_) => {
                    if !runner.is_generating() {
                        // Drain anything that raced with the flag.
                        while let Ok(chunk) = chunks.try_recv() {
                            print!("{}", chunk.text);
                            reply.push_str(&chunk.text);
                        }
                        break;
                    }
                }
            }
        }
        println!();
        discussion.push_model_text(&reply);
    }

    runner.stop();
    Ok(())
}
