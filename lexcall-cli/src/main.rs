//! LexCall demo CLI
//!
//! Wires two controllers together over an in-process loopback relay and
//! drives a complete call: initiate, ring, accept, hold, resume, hang up.

use anyhow::Result;
use clap::{Parser, Subcommand};
use lexcall_core::prelude::*;
use lexcall_core::{OutboundEvent, RtcConnector, SignalingChannel};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted two-party call over an in-process loopback relay
    Demo {
        /// Place a video call instead of audio-only
        #[arg(long)]
        video: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "6")]
        talk_seconds: u64,
    },

    /// Show status and available commands
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lexcall=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Demo {
            video,
            talk_seconds,
        } => run_demo(video, talk_seconds).await,
        Commands::Status => {
            print_status();
            Ok(())
        }
    }
}

/// Error type for the loopback relay
#[derive(Debug)]
struct RelayClosed;

impl std::fmt::Display for RelayClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "loopback relay closed")
    }
}

impl std::error::Error for RelayClosed {}

/// One endpoint of the in-process relay
///
/// Translates addressed outbound events into the payloads the other side
/// would receive from the real relay, including the `ringing` progress
/// notification back to the caller.
struct LoopbackEnd {
    to_peer: mpsc::Sender<Value>,
    to_self: mpsc::Sender<Value>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Value>>,
}

fn loopback_pair() -> (Arc<LoopbackEnd>, Arc<LoopbackEnd>) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    let a = Arc::new(LoopbackEnd {
        to_peer: b_tx.clone(),
        to_self: a_tx.clone(),
        inbox: tokio::sync::Mutex::new(a_rx),
    });
    let b = Arc::new(LoopbackEnd {
        to_peer: a_tx,
        to_self: b_tx,
        inbox: tokio::sync::Mutex::new(b_rx),
    });
    (a, b)
}

#[async_trait::async_trait]
impl SignalingChannel for LoopbackEnd {
    type Error = RelayClosed;

    async fn send(&self, event: OutboundEvent) -> Result<(), RelayClosed> {
        let payload = match event {
            OutboundEvent::CallUser {
                offer,
                from,
                kind,
                caller_info,
                ..
            } => {
                // The relay reports ringing back to the caller on delivery.
                let _ = self.to_self.send(json!({ "event": "ringing" })).await;
                json!({
                    "event": "incoming-call",
                    "from": from,
                    "offer": offer,
                    "type": kind,
                    "callerInfo": caller_info,
                })
            }
            OutboundEvent::AnswerCall { answer, .. } => {
                json!({ "event": "call-answered", "answer": answer })
            }
            OutboundEvent::IceCandidate { candidate, .. } => {
                json!({ "event": "ice-candidate", "candidate": candidate })
            }
            OutboundEvent::Hangup { .. } => json!({ "event": "hangup" }),
        };
        self.to_peer.send(payload).await.map_err(|_| RelayClosed)
    }

    async fn recv(&self) -> Result<Value, RelayClosed> {
        self.inbox.lock().await.recv().await.ok_or(RelayClosed)
    }
}

type DemoController = Arc<CallController<LoopbackEnd, SampleMediaSource, RtcConnector>>;

fn build_controller(name: &str, channel: Arc<LoopbackEnd>) -> DemoController {
    let suffix: u32 = rand::thread_rng().gen_range(1000..10_000);
    CallController::new(
        LocalIdentity::new(format!("u-{suffix}"), name),
        channel,
        Arc::new(SampleMediaSource::new()),
        Arc::new(RtcConnector::new()),
        Arc::new(InMemoryDirectory::new()),
        ControllerConfig::default(),
    )
}

async fn run_demo(video: bool, talk_seconds: u64) -> Result<()> {
    let kind = if video {
        MediaKind::Video
    } else {
        MediaKind::Audio
    };

    let (caller_end, callee_end) = loopback_pair();
    let caller = build_controller("Amara Okafor", caller_end);
    let callee = build_controller("Dana Reyes", callee_end);
    caller.subscribe();
    callee.subscribe();

    // The callee auto-accepts and both sides narrate their lifecycle.
    spawn_auto_accept(Arc::clone(&callee));
    spawn_narrator("caller", Arc::clone(&caller));
    spawn_narrator("callee", Arc::clone(&callee));

    println!("placing a {kind:?} call over the loopback relay...");
    let receiver = UserId::new("callee");
    // The loopback relay has exactly one peer, so any target id works.
    let call_id = caller.initiate_call(receiver, kind).await?;
    println!("call {call_id} ringing");

    tokio::time::sleep(Duration::from_secs(2)).await;

    if caller.snapshot().phase.in_call() {
        println!("holding for a moment...");
        let _ = caller.toggle_hold();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let _ = caller.toggle_hold();
    }

    tokio::time::sleep(Duration::from_secs(talk_seconds)).await;

    println!("hanging up");
    if caller.end_call().await.is_err() {
        println!("call had already ended");
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    caller.unsubscribe();
    callee.unsubscribe();
    println!("demo complete");
    Ok(())
}

fn spawn_auto_accept(callee: DemoController) {
    let mut events = callee.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SessionEvent::IncomingCall { caller, kind } = event {
                println!("callee: incoming {kind:?} call from {}", caller.name);
                if let Err(e) = callee.accept_call().await {
                    tracing::warn!(error = %e, "auto-accept failed");
                }
            }
        }
    });
}

fn spawn_narrator(label: &'static str, controller: DemoController) {
    let mut events = controller.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::PhaseChanged { phase } => println!("{label}: phase {phase:?}"),
                SessionEvent::DurationTick { seconds } => {
                    if seconds % 5 == 0 {
                        println!("{label}: {seconds}s elapsed");
                    }
                }
                SessionEvent::Terminated { reason } => println!("{label}: ended ({reason:?})"),
                _ => {}
            }
        }
    });
}

fn print_status() {
    println!("LexCall demo CLI");
    println!("================");
    println!("  lexcall demo [--video] [--talk-seconds N]  - run a loopback call");
    println!("  lexcall status                              - show this status");
    println!();
    println!("RUST_LOG=lexcall=debug surfaces controller tracing.");
}
