//! pulse-signal - Headless Host für die Call Engine
//!
//! Aufruf: `pulse-signal <username>`
//!
//! Befehle auf stdin: `call <peer>`, `accept`, `reject`, `hangup`, `mute`,
//! `camera`, `status`, `quit`

use anyhow::{bail, Context, Result};
use pulse_signaling::call_engine::{CallEngine, CallEvent};
use pulse_signaling::config::Config;
use pulse_signaling::signaling::ParticipantId;
use pulse_signaling::{init_logging, CallNode};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let Some(username) = std::env::args().nth(1) else {
        bail!("usage: pulse-signal <username>");
    };
    let config = Config::load().context("failed to load configuration")?;

    let node = CallNode::connect(&config, ParticipantId::new(username))
        .await
        .context("failed to connect to signaling server")?;
    tracing::info!("Connected as {}", node.client().username());

    let mut events = node.engine().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        if command == "quit" {
            break;
        }
        if let Err(e) = run_command(node.engine(), command, words.next()).await {
            println!("error: {:#}", e);
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn run_command(engine: &CallEngine, command: &str, arg: Option<&str>) -> Result<()> {
    match command {
        "call" => {
            let peer = arg.context("usage: call <peer>")?;
            engine.start_call(peer).await?;
        }
        "accept" => engine.accept_incoming_call().await?,
        "reject" => engine.reject_incoming_call().await?,
        "hangup" => engine.hang_up().await,
        "mute" => println!("muted: {}", engine.toggle_mute().await?),
        "camera" => println!("camera off: {}", engine.toggle_camera().await?),
        "status" => {
            let snapshot = engine.status().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        other => bail!("unknown command '{}'", other),
    }
    Ok(())
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::StateChanged(snapshot) => match &snapshot.peer {
            Some(peer) => println!("[{}] {}", snapshot.state, peer),
            None => println!("[{}]", snapshot.state),
        },
        CallEvent::IncomingCall { from } => {
            println!("incoming call from {} (accept/reject)", from)
        }
        CallEvent::RemoteRinging { peer } => println!("{} is ringing", peer),
        CallEvent::RemoteTrack(track) => println!("receiving {} from peer", track.kind),
        CallEvent::MediaChanged { muted, camera_off } => {
            println!("muted: {}, camera off: {}", muted, camera_off)
        }
        CallEvent::BusyRejected { from } => println!("rejected {} (busy)", from),
        CallEvent::CallFailed { reason } => println!("call failed: {}", reason),
    }
}
