//! smartrec agent
//!
//! Attaches the configured sources, reads trigger commands from stdin and
//! prints finished segments as JSON lines on stdout.

use anyhow::{Context, Result};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use smartrec::backend::{BackendKind, RecordBin, RecordEngine};
use smartrec::cache::{EncodedFrame, FrameTap, SoftwareEngine};
use smartrec::config::{Config, DemoConfig, ManagedEngineKind};
use smartrec::logging::init_logging;
use smartrec::native::nvds::NvDsSrLibrary;
use smartrec::{AttachTarget, SmartRecordController, SourceId, TriggerOutcome};

/// Commands read from stdin
#[derive(Debug, Clone, PartialEq)]
enum AgentCommand {
    /// `r <sid> [label]`
    Record {
        source_id: SourceId,
        label: Option<String>,
    },
    /// `s <sid>`
    Stop(SourceId),
    /// `c <seconds>`
    Cooldown(f64),
    /// `q`
    Quit,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|a| a == "--config" || a == "-c")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let _log_guard = init_logging()?;
    info!("smartrec agent starting...");

    let config = match config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded from {:?}", config.config_path()?);

    std::fs::create_dir_all(&config.recording.output_directory).with_context(|| {
        format!(
            "Failed to create output directory: {:?}",
            config.recording.output_directory
        )
    })?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config))?;

    info!("smartrec agent stopped");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let controller = Arc::new(SmartRecordController::new(
        config.controller_settings(),
        create_engine(&config),
    ));
    let dispatcher = controller.spawn_dispatcher();
    let printer = spawn_event_printer(controller.subscribe());

    let mut feeds = Vec::new();
    for source in &config.sources {
        if source.backend == BackendKind::Delegated {
            warn!(
                "Source {} uses the delegated backend and needs a pipeline-provided source object, skipping",
                source.id
            );
            continue;
        }

        match controller.attach(source.id, source.name.as_deref(), AttachTarget::Managed) {
            Ok(Some(RecordBin::Tap(tap))) => {
                controller.confirm_link(source.id, true)?;
                feeds.push(spawn_demo_feed(source.id, tap, config.demo.clone()));
            }
            Ok(Some(RecordBin::Element(_))) => {
                // No GStreamer pipeline here to graft the element into.
                if let Err(e) = controller.confirm_link(source.id, false) {
                    warn!("Source {} record bin not linked: {}", source.id, e);
                }
            }
            Ok(None) => {}
            Err(e) if e.is_fatal() => error!("Source {} cannot record: {}", source.id, e),
            Err(e) => warn!("Failed to attach source {}: {}", source.id, e),
        }
    }

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    spawn_stdin_reader(cmd_tx.clone());

    let ctrl_c_tx = cmd_tx.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let _ = ctrl_c_tx.send(AgentCommand::Quit);
    })?;

    info!("Ready: r <sid> [label] to record, s <sid> to stop, c <seconds> for cooldown, q to quit");

    while let Some(command) = cmd_rx.recv().await {
        match command {
            AgentCommand::Record { source_id, label } => {
                match controller.notify_manual_trigger(source_id, label.as_deref()) {
                    TriggerOutcome::Started(token) => info!(
                        "Source {} recording ({}s back, {}s front)",
                        source_id, token.window.back_seconds, token.window.front_seconds
                    ),
                    TriggerOutcome::Suppressed(reason) => {
                        info!("Trigger on source {} suppressed: {:?}", source_id, reason)
                    }
                    TriggerOutcome::Failed(e) => {
                        warn!("Trigger on source {} failed: {}", source_id, e)
                    }
                }
            }
            AgentCommand::Stop(source_id) => match controller.stop(source_id) {
                Ok(true) => {}
                Ok(false) => info!("Source {} is not recording", source_id),
                Err(e) => warn!("Stop failed for source {}: {}", source_id, e),
            },
            AgentCommand::Cooldown(seconds) => controller.set_cooldown(seconds),
            AgentCommand::Quit => break,
        }
    }

    for feed in &feeds {
        feed.abort();
    }

    // Teardown may wait on native code; keep it off the async workers.
    let shutdown_controller = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || shutdown_controller.shutdown())
        .await
        .context("Controller shutdown task failed")?;

    // Let completions from the final stop reach stdout.
    tokio::time::sleep(Duration::from_millis(200)).await;
    if let Some(dispatcher) = dispatcher {
        dispatcher.abort();
    }
    printer.abort();
    Ok(())
}

fn create_engine(config: &Config) -> smartrec::Result<Arc<dyn RecordEngine>> {
    match config.native.managed_engine {
        ManagedEngineKind::Software => Ok(Arc::new(SoftwareEngine::new())),
        ManagedEngineKind::Nvds => {
            let library = NvDsSrLibrary::load(&config.native.library_paths)?;
            Ok(Arc::new(library))
        }
    }
}

fn spawn_event_printer(mut events: broadcast::Receiver<smartrec::RecordEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to serialize record event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event printer lagged, {} event(s) dropped", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_stdin_reader(tx: mpsc::UnboundedSender<AgentCommand>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match parse_command(&line) {
                Some(Ok(command)) => {
                    if tx.send(command).is_err() {
                        return;
                    }
                }
                Some(Err(message)) => warn!("{}", message),
                None => {}
            }
        }
        let _ = tx.send(AgentCommand::Quit);
    });
}

/// `None` for blank lines
fn parse_command(line: &str) -> Option<std::result::Result<AgentCommand, String>> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;

    let source_id = |arg: Option<&str>| -> std::result::Result<SourceId, String> {
        let arg = arg.ok_or_else(|| format!("'{}' needs a source id", verb))?;
        arg.parse()
            .map_err(|_| format!("Invalid source id: {}", arg))
    };

    let command = match verb {
        "r" | "record" => source_id(parts.next()).map(|source_id| {
            let label: Vec<&str> = parts.collect();
            AgentCommand::Record {
                source_id,
                label: (!label.is_empty()).then(|| label.join(" ")),
            }
        }),
        "s" | "stop" => source_id(parts.next()).map(AgentCommand::Stop),
        "c" | "cooldown" => match parts.next().map(str::parse::<f64>) {
            Some(Ok(seconds)) => Ok(AgentCommand::Cooldown(seconds)),
            _ => Err("'c' needs a number of seconds".to_string()),
        },
        "q" | "quit" => Ok(AgentCommand::Quit),
        other => Err(format!("Unknown command: {}", other)),
    };
    Some(command)
}

/// Synthetic encoded stream for software-engine sources
fn spawn_demo_feed(source_id: SourceId, tap: FrameTap, demo: DemoConfig) -> JoinHandle<()> {
    let fps = demo.fps.max(1);
    let keyframe_interval = demo.keyframe_interval.max(1) as u64;
    let frame_time = Duration::from_secs(1) / fps;

    tokio::spawn(async move {
        info!("Demo feed for source {} at {} fps", source_id, fps);
        let mut ticker = tokio::time::interval(frame_time);
        let mut index: u64 = 0;
        loop {
            ticker.tick().await;
            let keyframe = index % keyframe_interval == 0;
            let mut data = vec![0u8; demo.frame_bytes.max(5)];
            // Annex-B start code, then an IDR or non-IDR NAL header.
            data[..5].copy_from_slice(&[0, 0, 0, 1, if keyframe { 0x65 } else { 0x41 }]);
            tap.push(EncodedFrame::new(data, frame_time * index as u32, keyframe));
            index += 1;
        }
    })
}

fn print_help() {
    println!("smartrec agent");
    println!();
    println!("Usage: smartrec-agent [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config <PATH>  Use this config file instead of the default");
    println!("  -h, --help           Show this help message");
    println!();
    println!("Commands (stdin):");
    println!("  r <sid> [label]      Trigger a recording on a source");
    println!("  s <sid>              Stop the active recording early");
    println!("  c <seconds>          Set the trigger cooldown");
    println!("  q                    Shut down");
    println!();
    println!("Environment:");
    println!("  RUST_LOG             Log filter (default: info)");
    println!("  SMARTREC_LOG_PATH    Log directory override");
}
