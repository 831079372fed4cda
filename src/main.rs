//! pabgpd daemon

// SPDX-License-Identifier: AGPL-3.0-or-later

mod arg;

use clap::Parser;
use pabgpd::config::Config;
use pabgpd::server::{Server, WatchEvent};
use std::process::ExitCode;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn setup_logger(level: log::LevelFilter) {
    let config = simplelog::ConfigBuilder::new()
        .set_time_format_rfc3339()
        .build();
    simplelog::TermLogger::init(
        level,
        config,
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )
    .expect("Failed to initialize logger");
}

fn log_event(event: &WatchEvent) {
    match event {
        WatchEvent::PeerState(state) => log::info!(
            "{}: AS {} is {} (admin {}): {}",
            state.neighbor_address,
            state.peer_as,
            state.state,
            state.admin_state,
            state.reason
        ),
        WatchEvent::Update {
            neighbor,
            paths,
            eor,
            ..
        } => match eor {
            Some(family) => log::debug!("{neighbor}: End-of-RIB for {family}"),
            None => log::debug!("{neighbor}: {} paths", paths.len()),
        },
        WatchEvent::RouteRefresh { neighbor, family } => {
            log::info!("{neighbor}: route refresh requested for {family}");
        }
        WatchEvent::Stale { neighbor, families } => {
            log::info!("{neighbor}: paths of {families:?} are stale");
        }
        WatchEvent::LlgrStale { neighbor, families } => {
            log::info!("{neighbor}: paths of {families:?} are long-lived stale");
        }
        WatchEvent::Drop { neighbor, families } => {
            log::info!("{neighbor}: dropping paths of {families:?}");
        }
        WatchEvent::DropStale { neighbor, families } => {
            log::info!("{neighbor}: dropping stale paths of {families:?}");
        }
    }
}

async fn watch_events(mut watch: broadcast::Receiver<WatchEvent>) {
    loop {
        match watch.recv().await {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Missed {missed} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = arg::Pabgpd::parse();
    setup_logger(match args.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    });
    let mut config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Cannot load {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };
    if !args.listen_addr.is_empty() {
        config.global.listen_addresses = args.listen_addr;
    }
    if let Some(port) = args.listen_port {
        config.global.port = port;
    }
    if args.check {
        log::info!(
            "{}: AS {} with {} neighbors",
            args.config.display(),
            config.global.asn,
            config.neighbors.len()
        );
        return ExitCode::SUCCESS;
    }

    let cancel = CancellationToken::new();
    let server = Server::new(config.global, cancel.clone());
    tokio::spawn(watch_events(server.subscribe()));
    for neighbor in config.neighbors {
        if let Err(e) = server.add_neighbor(neighbor) {
            log::error!("{e}");
            server.shutdown().await;
            return ExitCode::FAILURE;
        }
    }
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Shutting down");
                cancel.cancel();
            }
            Err(e) => log::error!("Cannot listen for Ctrl-C: {e}"),
        }
    });
    let result = server.serve().await;
    server.shutdown().await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
