use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::Local;
use clap::Parser;
use guardian_call::calls::ChannelRelay;
use guardian_call::calls::media::WebRtcSessionFactory;
use guardian_call::{CallConfig, CallEvent, CallManager, CallState};
use log::{error, info};
use tokio::sync::broadcast;

// Two local participants call each other through an in-memory relay, using
// real webrtc-rs peer connections.
//
// Usage:
//   cargo run
//   cargo run -- --hold-secs 10
//   cargo run -- --room kitchen --caller parent --callee child

#[derive(Parser, Debug)]
#[command(about = "Place a loopback audio call between two local users")]
struct Args {
    #[arg(long, default_value = "family-room")]
    room: String,

    #[arg(long, default_value = "parent")]
    caller: String,

    #[arg(long, default_value = "child")]
    callee: String,

    /// How long to stay connected before hanging up.
    #[arg(long, default_value_t = 5)]
    hold_secs: u64,

    /// Give up if the call is not connected by then.
    #[arg(long, default_value_t = 30)]
    connect_timeout_secs: u64,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(args)) {
        error!("Call demo failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = CallConfig::default();
    let sessions = Arc::new(WebRtcSessionFactory::new(&config));
    let relay = ChannelRelay::new();

    let caller = CallManager::new(
        &args.caller,
        config.clone(),
        relay.clone(),
        sessions.clone(),
    );
    caller.attach_inbound(relay.join(&args.room, &args.caller).await);

    let callee = CallManager::new(&args.callee, config, relay.clone(), sessions);
    callee.attach_inbound(relay.join(&args.room, &args.callee).await);

    let mut caller_events = caller.subscribe();
    let mut callee_events = callee.subscribe();

    // The callee answers as soon as it rings.
    let answering = callee.clone();
    tokio::spawn(async move {
        if wait_for(&mut callee_events, CallState::Incoming).await {
            info!("{} answering", answering.local_id());
            if let Err(e) = answering.accept_call().await {
                error!("Failed to accept call: {}", e);
            }
        }
    });

    let call_id = caller.start_call(&args.room, &args.callee).await?;
    info!("Placed call {}", call_id);

    let connected = tokio::time::timeout(
        Duration::from_secs(args.connect_timeout_secs),
        wait_for(&mut caller_events, CallState::Connected),
    )
    .await
    .context("timed out waiting for the call to connect")?;
    if !connected {
        let snapshot = caller.snapshot().await?;
        bail!("call did not connect (state: {})", snapshot.state);
    }

    info!("Connected, holding for {}s", args.hold_secs);
    tokio::time::sleep(Duration::from_secs(args.hold_secs)).await;

    caller.toggle_mute().await?;
    caller.end_call().await?;
    info!("Call {} finished", call_id);

    relay.leave(&args.room, &args.caller).await;
    relay.leave(&args.room, &args.callee).await;
    Ok(())
}

/// Wait until `target` is reached. Returns false if the call ended first.
async fn wait_for(events: &mut broadcast::Receiver<CallEvent>, target: CallState) -> bool {
    loop {
        match events.recv().await {
            Ok(CallEvent::StateChanged(change)) => {
                if change.state == target {
                    return true;
                }
                if change.state.is_terminal() {
                    if let Some(error) = change.error {
                        error!("Call failed: {}", error);
                    }
                    return false;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                info!("Skipped {} call events", n);
            }
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}
