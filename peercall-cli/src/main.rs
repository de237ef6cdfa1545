//! PeerCall CLI Application
//!
//! Runs call coordinators over the in-process network: scripted demos of the
//! signaling flows and an interactive console against simulated peers.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use console::{describe, describe_call, parse_command, ConsoleCommand, HELP};
use peercall_core::prelude::*;
use peercall_core::{MediaError, SyntheticMediaSource};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod console;
#[cfg(test)]
mod console_tests;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local peer id (random when omitted)
    #[arg(short, long, env = "PEERCALL_IDENTITY")]
    identity: Option<String>,

    /// Delay between sending `close` and tearing the link down
    #[arg(long, env = "PEERCALL_GRACE_MS", default_value_t = 200)]
    grace_ms: u64,

    /// Acquire audio only
    #[arg(long)]
    audio_only: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted call between simulated peers
    Demo {
        /// Flow to run
        #[arg(value_enum, default_value = "accept")]
        scenario: Scenario,

        /// Print the wire log as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactive console against simulated peers
    Console {
        /// Simulated peers to put online
        #[arg(long, value_delimiter = ',', default_value = "bob,carol")]
        peers: Vec<String>,

        /// Simulated peers decline instead of accepting
        #[arg(long)]
        remote_declines: bool,
    },

    /// Show status and available commands
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Callee accepts, caller hangs up
    Accept,
    /// Callee declines
    Decline,
    /// Callee is already in another call
    Busy,
    /// Callee cannot open its camera
    MediaFailure,
}

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peercall=info")),
        )
        .init();

    let cli = Cli::parse();

    let identity = PeerId::new(cli.identity.unwrap_or_else(generate_random_identity));
    if !identity.is_roster_safe() {
        bail!("identity {identity:?} cannot contain commas or surrounding spaces");
    }
    let config = CoordinatorConfig {
        close_grace_ms: cli.grace_ms,
        constraints: if cli.audio_only {
            MediaConstraints::audio_only()
        } else {
            MediaConstraints::video_call()
        },
        ..CoordinatorConfig::default()
    };

    println!("🔗 Using identity: {}", identity);

    match cli.command {
        Commands::Demo { scenario, json } => run_demo(identity, scenario, json, config).await?,
        Commands::Console {
            peers,
            remote_declines,
        } => run_console(identity, peers, !remote_declines, config).await?,
        Commands::Status => print_status(&config)?,
    }

    Ok(())
}

fn spawn_printer(label: String, coordinator: &CallCoordinator) {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("[{label}] {}", describe(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_for(
    events: &mut broadcast::Receiver<CallEvent>,
    matches: impl Fn(&CallEvent) -> bool,
) -> Result<CallEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow!("coordinator stopped"))
                }
            }
        }
    })
    .await
    .context("timed out waiting for call event")?
}

fn is_incoming(event: &CallEvent) -> bool {
    matches!(event, CallEvent::IncomingCall { .. })
}

fn is_active(event: &CallEvent) -> bool {
    matches!(
        event,
        CallEvent::StateChanged {
            state: CallState::Active,
            ..
        }
    )
}

fn is_ended(event: &CallEvent) -> bool {
    matches!(event, CallEvent::CallEnded { .. })
}

async fn run_demo(
    local: PeerId,
    scenario: Scenario,
    json: bool,
    config: CoordinatorConfig,
) -> Result<()> {
    let callee_id = PeerId::new("bob");
    let third_id = PeerId::new("carol");
    if local == callee_id || local == third_id {
        bail!("the demo uses the ids 'bob' and 'carol'; pick another identity");
    }
    println!("🎬 Running {scenario:?} demo");

    let network = MemoryNetwork::new();
    let caller = network
        .join(local.clone())?
        .spawn_coordinator(Arc::new(SyntheticMediaSource::new()), config.clone());
    let callee_media = if scenario == Scenario::MediaFailure {
        SyntheticMediaSource::failing(MediaError::PermissionDenied)
    } else {
        SyntheticMediaSource::new()
    };
    let callee = network
        .join(callee_id.clone())?
        .spawn_coordinator(Arc::new(callee_media), config.clone());
    spawn_printer(local.to_string(), &caller);
    spawn_printer(callee_id.to_string(), &callee);

    let mut caller_events = caller.subscribe();
    let mut callee_events = callee.subscribe();

    let third = if scenario == Scenario::Busy {
        let third = network
            .join(third_id.clone())?
            .spawn_coordinator(Arc::new(SyntheticMediaSource::new()), config.clone());
        spawn_printer(third_id.to_string(), &third);
        let mut third_events = third.subscribe();
        third.place_call(callee_id.clone()).await?;
        wait_for(&mut callee_events, is_incoming).await?;
        callee.decide(true).await?;
        wait_for(&mut third_events, is_active).await?;
        Some(third)
    } else {
        None
    };

    let call_id = caller.place_call(callee_id.clone()).await?;
    println!("📞 Calling {callee_id} (call {call_id})");

    if scenario != Scenario::Busy {
        wait_for(&mut callee_events, is_incoming).await?;
        callee.decide(scenario != Scenario::Decline).await?;
    }
    if scenario == Scenario::Accept {
        wait_for(&mut caller_events, is_active).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        println!("{}", describe_call(caller.current_call().await?.as_ref()));
        caller.hangup().await?;
    }

    if let CallEvent::CallEnded { reason, .. } = wait_for(&mut caller_events, is_ended).await? {
        println!("✅ Demo finished: {reason}");
    }
    // Let the other side finish its teardown before reading the log
    tokio::time::sleep(config.close_grace() + Duration::from_millis(50)).await;

    let wire = network.wire_log();
    if json {
        println!("{}", serde_json::to_string_pretty(&wire)?);
    } else {
        println!("Wire log:");
        for record in &wire {
            println!("  {} -> {}: {}", record.from, record.to, record.payload);
        }
    }

    if let Some(third) = third {
        third.shutdown().await?;
    }
    callee.shutdown().await?;
    caller.shutdown().await?;
    Ok(())
}

async fn run_console(
    local: PeerId,
    peers: Vec<String>,
    remote_accepts: bool,
    config: CoordinatorConfig,
) -> Result<()> {
    let network = MemoryNetwork::new();
    let me = network
        .join(local.clone())?
        .spawn_coordinator(Arc::new(SyntheticMediaSource::new()), config.clone());

    let mut remotes: HashMap<PeerId, CallCoordinator> = HashMap::new();
    for name in peers {
        let id = PeerId::new(name.trim());
        if id == local || remotes.contains_key(&id) {
            bail!("duplicate peer id '{id}'");
        }
        let remote = network
            .join(id.clone())?
            .spawn_coordinator(Arc::new(SyntheticMediaSource::new()), config.clone());
        spawn_answerer(&remote, remote_accepts);
        remotes.insert(id, remote);
    }

    let mut events = me.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", describe(&event)),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(err) = execute(&me, &remotes, command).await {
                            println!("⚠️  {err}");
                        }
                    }
                    Err(err) => println!("⚠️  {err}"),
                }
            }
        }
    }

    me.shutdown().await?;
    for remote in remotes.values() {
        let _ = remote.shutdown().await;
    }
    Ok(())
}

fn spawn_answerer(remote: &CallCoordinator, accept: bool) {
    let coordinator = remote.clone();
    let mut events = remote.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::IncomingCall { peer, .. }) => {
                    tracing::debug!(remote = %coordinator.local_id(), caller = %peer, accept, "Simulated peer answering");
                    if coordinator.decide(accept).await.is_err() {
                        break;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn execute(
    me: &CallCoordinator,
    remotes: &HashMap<PeerId, CallCoordinator>,
    command: ConsoleCommand,
) -> Result<()> {
    match command {
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Peers => {
            let peers = me.roster().await?;
            println!("{}", describe(&CallEvent::RosterChanged { peers }));
        }
        ConsoleCommand::Call(peer) => {
            let call_id = me.place_call(peer.clone()).await?;
            println!("📞 Calling {peer} (call {call_id})");
        }
        ConsoleCommand::Ring(peer) => {
            let remote = remotes
                .get(&peer)
                .ok_or_else(|| anyhow!("'{peer}' is not a simulated peer"))?;
            remote.place_call(me.local_id().clone()).await?;
        }
        ConsoleCommand::Hangup => me.hangup().await?,
        ConsoleCommand::Accept => me.decide(true).await?,
        ConsoleCommand::Decline => me.decide(false).await?,
        ConsoleCommand::Mute(muted) => {
            me.set_muted(muted).await?;
            println!("🎙️  microphone {}", if muted { "muted" } else { "on" });
        }
        ConsoleCommand::Hide(hidden) => {
            me.set_camera_hidden(hidden).await?;
            println!("📷 camera {}", if hidden { "hidden" } else { "on" });
        }
        ConsoleCommand::Status => {
            println!("{}", describe_call(me.current_call().await?.as_ref()));
        }
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn print_status(config: &CoordinatorConfig) -> Result<()> {
    println!("📊 PeerCall CLI Status");
    println!("======================");
    println!("✅ Signaling: call / yes / no / close");
    println!("✅ Transport: in-process simulation");
    println!("Configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);
    println!();
    println!("Available commands:");
    println!("  peercall demo [accept|decline|busy|media-failure]  - Run a scripted call");
    println!("  peercall console [--peers a,b]                     - Interactive console");
    println!("  peercall status                                    - Show this status");
    println!();
    println!("Use 'peercall --help' for detailed options");

    Ok(())
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    let word = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{word}-{:04}", rng.gen_range(0..10_000))
}
