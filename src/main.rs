use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use droidclaw::agent_engine::engine::AgentEngine;
use droidclaw::agent_engine::event_bus::{AgentEvent, ChannelGate, EventBus, UserSignal};
use droidclaw::agent_engine::session::SessionModels;
use droidclaw::agent_engine::state::{Severity, TaskOutcome};
use droidclaw::agent_engine::supervisor::TaskSupervisor;
use droidclaw::config::{load_config, load_config_from};
use droidclaw::device::adb::AdbDevice;
use droidclaw::errors::DroidClawResult;
use droidclaw::executor::safety::{AutoApprove, HumanGate};
use droidclaw::llm::registry::ProviderRegistry;

#[derive(Parser, Debug)]
#[clap(name = "droidclaw", version, about = "Operates an Android phone with a vision model")]
struct Cli {
    #[clap(long, short, help = "Path to config.toml (default: next to the binary, then the working directory)")]
    config: Option<PathBuf>,

    #[clap(long, short, help = "adb serial of the target device")]
    serial: Option<String>,

    #[clap(long, short = 'y', help = "Approve sensitive actions and skip hand-offs without asking")]
    yes: bool,

    #[clap(long, default_value = "droidclaw=info")]
    log: String,

    /// What the agent should do, e.g. "Open Settings and turn on Wi-Fi"
    task: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    droidclaw::init_tracing(&cli.log);
    let _ = dotenvy::dotenv();

    match run(cli).await {
        Ok(Some(TaskOutcome::Finished { .. })) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            eprintln!("droidclaw: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> DroidClawResult<Option<TaskOutcome>> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(serial) = cli.serial {
        config.device.serial = Some(serial);
    }
    let config = Arc::new(config);

    let registry = ProviderRegistry::from_config(&config)?;
    let models = SessionModels::from_registry(&registry)?;
    let device = Arc::new(AdbDevice::new(&config.device));
    let events = EventBus::new();

    let gate: Arc<dyn HumanGate> = if cli.yes {
        Arc::new(AutoApprove)
    } else {
        let (gate, replies) = ChannelGate::new(events.clone());
        tokio::spawn(answer_from_stdin(events.subscribe(), replies));
        Arc::new(gate)
    };
    tokio::spawn(print_events(events.subscribe()));

    let engine = Arc::new(AgentEngine::new(config, models, device, gate, events));
    let supervisor = TaskSupervisor::new(engine);
    supervisor.start(cli.task).await;

    let outcome = tokio::select! {
        outcome = supervisor.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, cancelling task");
            supervisor.stop().await
        }
    };
    // Let the printer flush the final event.
    tokio::task::yield_now().await;
    Ok(outcome)
}

async fn print_events(mut rx: broadcast::Receiver<AgentEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            AgentEvent::TaskStarted { task, .. } => println!("▶ {task}"),
            AgentEvent::StepStarted { step } => println!("── step {step}"),
            AgentEvent::Rationale { text, .. } => println!("  💭 {text}"),
            AgentEvent::CommandParsed { command, .. } => println!("  → {}", command.verb),
            AgentEvent::ActionFailed { message, .. } => println!("  ✗ {message}"),
            AgentEvent::ServiceError { message, .. } => println!("  ⚠ {message}"),
            AgentEvent::TaskEnded { message, .. } => {
                let mark = match message.severity {
                    Severity::Success => "✔",
                    Severity::Warning => "⚠",
                    Severity::Error => "✗",
                    Severity::Info => "ℹ",
                };
                println!("{mark} {}", message.text);
            }
            // Prompted by the stdin responder.
            AgentEvent::ConfirmationRequested { .. }
            | AgentEvent::TakeOverRequested { .. }
            | AgentEvent::InteractRequested { .. } => {}
        }
    }
}

/// Answers confirmation and hand-off requests from the terminal.
async fn answer_from_stdin(mut rx: broadcast::Receiver<AgentEvent>, replies: mpsc::Sender<UserSignal>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let signal = match event {
            AgentEvent::ConfirmationRequested { request_id, message } => {
                println!("? {message} [y/N]");
                let line = lines.next_line().await.ok().flatten().unwrap_or_default();
                UserSignal::Confirm {
                    request_id,
                    approved: matches!(line.trim(), "y" | "Y" | "yes"),
                }
            }
            AgentEvent::TakeOverRequested { request_id, message } => {
                println!("✋ {message} (press Enter when done)");
                let _ = lines.next_line().await;
                UserSignal::TakeOverDone { request_id }
            }
            AgentEvent::InteractRequested { request_id, message } => {
                println!("? {message}");
                let line = lines.next_line().await.ok().flatten().unwrap_or_default();
                let reply = line.trim();
                UserSignal::Choice {
                    request_id,
                    reply: (!reply.is_empty()).then(|| reply.to_string()),
                }
            }
            _ => continue,
        };
        if replies.send(signal).await.is_err() {
            return;
        }
    }
}
