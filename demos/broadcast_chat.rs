//! Broadcast Chat - every message is relayed to every connected browser
//!
//! Lines typed on stdin are broadcast too, so the operator can talk to the
//! room. End stdin (Ctrl-D) to stop the server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example broadcast_chat -- --port 8080 -vv
//! cargo run --example broadcast_chat -- --config chat.toml
//! ```
//!
//! A config file may use the `chat.` namespace, e.g.
//!
//! ```toml
//! [chat]
//! port = 8080
//! path = "/chat"
//! ```

use clap::Parser;
use config::Config;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::mpsc::{channel, Receiver};
use tracing_subscriber::EnvFilter;
use wsserver::prelude::*;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the wsserver crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = format!("wsserver={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Broadcast chat server", long_about = None)]
struct Args {
    /// Port to listen on, overriding the config file
    #[arg(short, long)]
    port: Option<u16>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

// ============================================================================
// Chat Handler
// ============================================================================

/// Relays each message to the whole room through the server interface.
///
/// The interface only exists once the server is running, so it arrives over
/// a channel after `start()`.
struct ChatRoom {
    interface: Option<ServerInterface>,
    pending: Receiver<ServerInterface>,
}

impl ChatRoom {
    fn interface(&mut self) -> Option<&ServerInterface> {
        if self.interface.is_none() {
            self.interface = self.pending.try_recv().ok();
        }
        self.interface.as_ref()
    }
}

impl MessageHandler for ChatRoom {
    fn message_received(&mut self, peer: &mut Peer<'_>, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        if text.trim() == "/quit" {
            peer.close();
            return;
        }
        let line = format!("[{}] {}", peer.id(), text);
        println!("{line}");
        if let Some(interface) = self.interface() {
            interface.broadcast(line);
        }
    }

    fn connection_opened(&mut self, peer: &mut Peer<'_>) {
        println!("* {} joined from {}", peer.id(), peer.peer_addr());
        peer.send(format!("welcome, you are {}", peer.id()));
    }

    fn connection_closed(&mut self, id: usize) {
        println!("* {id} left");
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = if let Some(config_path) = &args.config {
        match Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                eprintln!("Failed to load config file '{}': {}", config_path, err);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    let mut server_config = match ServerConfig::from_config_named(&config, "chat") {
        Ok(c) => c,
        Err(err) => {
            eprintln!("Invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = args.port {
        server_config.port = port;
    }

    let (tx, rx) = channel();
    let room = ChatRoom {
        interface: None,
        pending: rx,
    };

    let server = match Server::new(server_config, room) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("Failed to create server: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let handle = match server.start() {
        Ok(h) => h,
        Err(err) => {
            eprintln!("Failed to start server: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let _ = tx.send(handle.interface());
    println!("Chat server listening on {}", handle.local_addr());

    for line in std::io::stdin().lock().lines() {
        match line {
            Ok(line) => handle.broadcast(format!("[server] {line}")),
            Err(_) => break,
        }
    }

    handle.stop();
    ExitCode::SUCCESS
}
