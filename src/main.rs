use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{panic, process};

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use log::{error, info, warn};

use depthcast::config::{app_name, version};
use depthcast::display::AudioRingBuffer;
use depthcast::pipeline::PipelineStage;
use depthcast::transport::UdpTransport;
use depthcast::{ReceiveStage, ReceiverConfig, ReceiverCoordinator, ReceiverEvent};

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("sender")
                .short('s')
                .long("sender")
                .value_name("ADDR")
                .help("Sender endpoint to connect to (repeatable).")
                .required(true)
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(SocketAddr)),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDR")
                .help("Local address for the receive socket.")
                .default_value("0.0.0.0:0")
                .value_parser(clap::value_parser!(SocketAddr)),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON receiver configuration.")
                .required(false),
        )
        .get_matches();

    let senders: Vec<SocketAddr> = matches
        .get_many::<SocketAddr>("sender")
        .map(|v| v.copied().collect())
        .unwrap_or_default();
    let bind = matches
        .get_one::<SocketAddr>("bind")
        .copied()
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let config_path = matches.get_one::<String>("config").cloned();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(senders, bind, config_path)) {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(senders: Vec<SocketAddr>, bind: SocketAddr, config_path: Option<String>) -> Result<()> {
    let config = match config_path {
        Some(path) => ReceiverConfig::load(&path)?,
        None => ReceiverConfig::default(),
    };
    let samples_per_frame = config.audio_samples_per_frame;

    let transport = UdpTransport::bind(bind)?;
    info!(
        "{} {} listening on {}",
        app_name(),
        version(),
        transport.local_addr().context("socket has no local address")?
    );

    let mut coordinator = ReceiverCoordinator::new(transport, config);
    let now = Instant::now();
    for sender in &senders {
        coordinator.connect(*sender, now)?;
    }

    let mut stage = ReceiveStage::new(coordinator);
    let mut frames = stage.take_frame_output();
    let mut events = stage.take_event_output();
    let cancel = stage.cancel_token();

    // gracefully close the receiver on SIGINT, SIGTERM, or SIGHUP
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || on_signal.cancel()).context("Error setting Ctrl-C handler")?;

    let stage_name = stage.name();
    let handle = tokio::spawn(async move { stage.run().await });

    let mut outstanding = senders.len();
    let mut rings: Vec<Arc<AudioRingBuffer>> = Vec::new();
    let mut playback = tokio::time::interval(Duration::from_millis(20));
    let mut scratch = vec![0.0f32; samples_per_frame];
    let mut received = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(frame) = frames.recv() => {
                received += 1;
                if frame.frame.frame.keyframe || received % 300 == 0 {
                    info!(
                        "sender {}: frame {} ({} color / {} depth bytes, {} received)",
                        frame.sender_session_id,
                        frame.frame.frame_id,
                        frame.frame.frame.color.len(),
                        frame.frame.frame.depth.len(),
                        received
                    );
                }
                frame.mark_rendered();
            }
            Some(event) = events.recv() => match event {
                ReceiverEvent::SessionStarted { sender_session_id, endpoint, audio_ring, .. } => {
                    info!("session {} from {} started", sender_session_id, endpoint);
                    rings.push(audio_ring);
                }
                ReceiverEvent::SessionEnded { sender_session_id, reason } => {
                    warn!("session {} ended: {}", sender_session_id, reason);
                    outstanding = outstanding.saturating_sub(1);
                }
                ReceiverEvent::ConnectFailed { endpoint } => {
                    warn!("sender {} never answered", endpoint);
                    outstanding = outstanding.saturating_sub(1);
                }
            },
            _ = playback.tick() => {
                // Stand-in for an audio device: drain at roughly real time.
                for ring in &rings {
                    ring.read(&mut scratch);
                }
            }
        }

        if outstanding == 0 {
            info!("no senders left");
            break;
        }
    }

    cancel.cancel();
    handle
        .await
        .with_context(|| format!("{} panicked", stage_name))??;
    info!("{} frames received", received);
    Ok(())
}
