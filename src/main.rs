//! EMG Intent Agent CLI
//!
//! Record labeled EMG windows, train a model and run real-time inference.

use clap::{Parser, Subcommand};
use emg_intent_agent::{
    config::{ClassifierMode, Config},
    control::{ControlPlane, StatusUpdate},
    dispatch::spawn_actuator_links,
    recording::{combine_recordings, recording_path},
    serial::{discovery, list_ports},
    stats::AcquisitionStats,
    SAFETY_NOTICE, VERSION,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "emg-intent")]
#[command(version = VERSION)]
#[command(about = "Real-time EMG intent classification agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one labeled window and save it as CSV
    Record {
        /// Label to record (must be one of the configured intent labels)
        #[arg(long, short)]
        label: String,

        /// Recording length in seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Serial port (discovered automatically if not specified)
        #[arg(long)]
        port: Option<String>,

        /// Use the synthetic signal instead of a serial device
        #[arg(long)]
        simulate: bool,
    },

    /// Combine recordings into a training dataset
    Combine {
        /// Output file (defaults to the configured dataset file)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Recordings to combine (defaults to one per configured label)
        files: Vec<PathBuf>,
    },

    /// Train a model from the recordings on disk
    Train {
        /// Model name
        #[arg(long)]
        name: Option<String>,
    },

    /// Run inference in the foreground until Ctrl+C
    Infer {
        /// Synthetic signal and simulated classifier, no hardware required
        #[arg(long)]
        simulate: bool,

        /// Serial port (discovered automatically if not specified)
        #[arg(long)]
        port: Option<String>,

        /// Trained model to load
        #[arg(long)]
        model: Option<String>,

        /// Additional actuator WebSocket URL (repeatable)
        #[arg(long = "actuator")]
        actuators: Vec<String>,
    },

    /// Run the HTTP control plane
    #[cfg(feature = "server")]
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "5000")]
        port: u16,

        /// Use the synthetic signal instead of a serial device
        #[arg(long)]
        simulate: bool,
    },

    /// List serial ports
    Ports,

    /// Show configuration summary and acquisition statistics
    Status,

    /// Display the operating notice
    Notice,

    /// Show configuration
    Config,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Record {
            label,
            duration,
            port,
            simulate,
        } => {
            cmd_record(&label, duration, port, simulate);
        }
        Commands::Combine { output, files } => {
            cmd_combine(output, files);
        }
        Commands::Train { name } => {
            cmd_train(name);
        }
        Commands::Infer {
            simulate,
            port,
            model,
            actuators,
        } => {
            cmd_infer(simulate, port, model, actuators);
        }
        #[cfg(feature = "server")]
        Commands::Serve { port, simulate } => {
            cmd_serve(port, simulate);
        }
        Commands::Ports => {
            cmd_ports();
        }
        Commands::Status => {
            cmd_status();
        }
        Commands::Notice => {
            println!("{SAFETY_NOTICE}");
        }
        Commands::Config => {
            cmd_config();
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emg_intent_agent=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load configuration, exiting on a malformed file.
fn load_config() -> Config {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config from {:?}: {e}", Config::config_path());
            std::process::exit(1);
        }
    };
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }
    config
}

fn cmd_record(label: &str, duration: Option<u64>, port: Option<String>, simulate: bool) {
    let mut config = load_config();
    if let Some(secs) = duration {
        config.acquisition.recording_duration = Duration::from_secs(secs);
    }
    if port.is_some() {
        config.serial.port = port;
    }

    println!("EMG Intent Agent v{VERSION}");
    println!();
    println!("Recording '{label}'");
    println!(
        "  Duration: {}s",
        config.acquisition.recording_duration.as_secs()
    );
    println!("  Channels: {}", config.serial.channels.count());
    println!(
        "  Output: {:?}",
        recording_path(&config.data_path, &config.recording.file_prefix, label)
    );
    println!();
    println!("Press Ctrl+C to stop early");
    println!();

    let control = ControlPlane::from_config(config, simulate);
    if let Err(e) = control.start_recording(label) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    loop {
        match control.poll_status() {
            StatusUpdate::Waiting => {}
            StatusUpdate::Success { message, file, .. } => {
                println!("{message}");
                println!("Saved to {file}");
                break;
            }
            StatusUpdate::Error { message } => {
                eprintln!("Error: {message}");
                control.shutdown();
                std::process::exit(1);
            }
            StatusUpdate::Prediction { .. } => {}
        }
        if !running.load(Ordering::SeqCst) {
            println!("Stopping recording...");
            if let Err(e) = control.stop_recording() {
                eprintln!("Warning: {e}");
            }
            running.store(true, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_millis(100));
    }

    control.shutdown();
}

fn cmd_combine(output: Option<PathBuf>, files: Vec<PathBuf>) {
    let config = load_config();
    let inputs = if files.is_empty() {
        config
            .classifier
            .labels
            .all()
            .iter()
            .map(|label| recording_path(&config.data_path, &config.recording.file_prefix, label))
            .collect()
    } else {
        files
    };
    let output = output.unwrap_or_else(|| config.data_path.join(&config.recording.dataset_file));

    match combine_recordings(&inputs, &output) {
        Ok(dataset) => {
            println!(
                "Combined {} file(s), {} rows, into {:?}",
                inputs.len(),
                dataset.len(),
                output
            );
        }
        Err(e) => {
            eprintln!("Error combining recordings: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_train(name: Option<String>) {
    let config = load_config();
    let control = ControlPlane::from_config(config, false);

    match control.train(name.as_deref()) {
        Ok(report) => {
            println!("Trained model '{}'", report.model);
            println!("  Rows: {}", report.rows);
            println!("  Classes: {}", report.classes.join(", "));
            println!("  Dataset: {:?}", report.dataset_path);
            println!("  Model: {:?}", report.model_path);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Record each label first with 'emg-intent record --label <LABEL>'.");
            std::process::exit(1);
        }
    }
}

fn cmd_infer(simulate: bool, port: Option<String>, model: Option<String>, actuators: Vec<String>) {
    let mut config = load_config();
    if port.is_some() {
        config.serial.port = port;
    }
    if let Some(model) = model {
        config.classifier.mode = ClassifierMode::Trained { model };
    } else if simulate {
        config.classifier.mode = ClassifierMode::Simulated {
            affirmative_prior: 0.6,
            seed: None,
        };
    }
    config.dispatch.actuator_urls.extend(actuators);

    println!("{SAFETY_NOTICE}");
    println!("EMG Intent Agent v{VERSION}");
    println!();
    println!("Starting inference...");
    println!("  Sample rate: {} Hz", config.acquisition.sample_rate);
    println!("  Cooldown: {}ms", config.decision.cooldown.as_millis());
    match &config.classifier.mode {
        ClassifierMode::Trained { model } => println!("  Model: {model}"),
        ClassifierMode::Simulated {
            affirmative_prior, ..
        } => println!("  Model: simulated (P(affirmative) = {affirmative_prior})"),
    }
    if config.dispatch.actuator_urls.is_empty() {
        println!("  Actuators: none");
    } else {
        for url in &config.dispatch.actuator_urls {
            println!("  Actuator: {url}");
        }
    }
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error starting runtime: {e}");
            std::process::exit(1);
        }
    };

    let urls = config.dispatch.actuator_urls.clone();
    let control = ControlPlane::from_config(config, simulate);
    let links_cancel = CancellationToken::new();
    let links = spawn_actuator_links(
        control.dispatcher(),
        &urls,
        runtime.handle(),
        links_cancel.clone(),
    );

    if let Err(e) = control.start_inference() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    while running.load(Ordering::SeqCst) {
        match control.poll_status() {
            StatusUpdate::Prediction {
                prediction,
                affirmative,
                negative,
                accepted,
                ..
            } => {
                if accepted {
                    println!(
                        "[{}] {prediction} ({affirmative} yes / {negative} no)",
                        chrono::Utc::now().format("%H:%M:%S")
                    );
                }
            }
            StatusUpdate::Error { message } => {
                eprintln!("Error: {message}");
                break;
            }
            StatusUpdate::Waiting => thread::sleep(Duration::from_millis(100)),
            StatusUpdate::Success { .. } => {}
        }
    }

    println!();
    println!("Stopping inference...");
    control.shutdown();
    links_cancel.cancel();
    runtime.block_on(async {
        for link in links {
            let _ = link.await;
        }
    });

    println!();
    println!("{}", control.stats().summary());
}

#[cfg(feature = "server")]
fn cmd_serve(port: u16, simulate: bool) {
    use emg_intent_agent::server::{run, ServerConfig};

    let config = load_config();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error starting runtime: {e}");
            std::process::exit(1);
        }
    };

    let urls = config.dispatch.actuator_urls.clone();
    let control = ControlPlane::from_config(config, simulate);
    let links_cancel = CancellationToken::new();
    let _links = spawn_actuator_links(
        control.dispatcher(),
        &urls,
        runtime.handle(),
        links_cancel.clone(),
    );

    let (addr, shutdown_tx) = match runtime.block_on(run(ServerConfig::new(port), control.clone())) {
        Ok(started) => started,
        Err(e) => {
            eprintln!("Error starting server: {e}");
            std::process::exit(1);
        }
    };

    println!("EMG Intent Agent v{VERSION}");
    println!("Control server listening on http://{addr}");
    println!("Press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    println!();
    println!("Shutting down...");
    let _ = shutdown_tx.send(());
    control.shutdown();
    links_cancel.cancel();
    runtime.shutdown_timeout(Duration::from_secs(2));
}

fn cmd_ports() {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found.");
        println!("Default port: {}", discovery::default_port());
        return;
    }

    println!("Serial ports:");
    for port in &ports {
        let marker = if discovery::matches_known_pattern(port) {
            " (sensor board)"
        } else {
            ""
        };
        println!("  {port}{marker}");
    }
    if let Some(selected) = discovery::select_port(&ports) {
        println!();
        println!("Selected by default: {selected}");
    }
}

fn cmd_status() {
    let config = Config::load().unwrap_or_default();

    println!("EMG Intent Agent Status");
    println!("=======================");
    println!();

    println!("Configuration:");
    println!(
        "  Serial port: {}",
        config
            .serial
            .port
            .clone()
            .unwrap_or_else(|| "auto-detect".to_string())
    );
    println!("  Baud rate: {}", config.serial.baud_rate);
    println!("  Channels: {}", config.serial.channels.count());
    println!("  Sample rate: {} Hz", config.acquisition.sample_rate);
    println!("  Cooldown: {}ms", config.decision.cooldown.as_millis());
    println!();

    println!("Recordings:");
    for label in config.classifier.labels.all() {
        let path = recording_path(&config.data_path, &config.recording.file_prefix, label);
        let state = if path.exists() { "present" } else { "missing" };
        println!("  {label}: {state} ({path:?})");
    }
    if let ClassifierMode::Trained { model } = &config.classifier.mode {
        let path = config.models_path.join(format!("{model}.json"));
        let state = if path.exists() { "trained" } else { "not trained" };
        println!("  Model '{model}': {state}");
    }
    println!();

    let stats_path = config.data_path.join("stats.json");
    if stats_path.exists() {
        let stats = AcquisitionStats::with_persistence(stats_path);
        println!("{}", stats.summary());
    } else {
        println!("No previous session data found.");
    }
}

fn cmd_config() {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");
}
