//! DOMES Node
//!
//! Runs one pod over UDP broadcast on a LAN, with the pod hardware replaced
//! by the console.

mod console_game;

use clap::Parser;
use console_game::ConsoleGame;
use domes_core::{
    DrillProgram, GameCapability, Notice, PodAddr, PodConfig, PodHandle, PodRuntime,
    PriorityScore, ResignReason, UdpTransport,
};
use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// DOMES pod node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pod name; the pod address is derived from it
    #[arg(short, long)]
    name: String,

    /// UDP port to listen on
    #[arg(short, long, default_value_t = domes_core::transport::DEFAULT_PORT)]
    port: u16,

    /// Explicit pod address (xx:xx:xx:xx:xx:xx), overrides the name-derived one
    #[arg(long)]
    addr: Option<PodAddr>,

    /// Broadcast targets, comma separated (default: 255.255.255.255:<port>)
    #[arg(long, value_delimiter = ',')]
    broadcast: Vec<SocketAddr>,

    /// Battery level reported for election priority, percent
    #[arg(short, long, default_value = "100")]
    battery: u8,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Take mastership immediately (operator override)
    #[arg(long)]
    force_master: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

enum ConsoleCommand {
    Status,
    Drill(PathBuf),
    Abort,
    Force,
    Resign,
    Hit,
    Battery(u8),
    Quit,
}

fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["status"] => Ok(ConsoleCommand::Status),
        ["drill", path] => Ok(ConsoleCommand::Drill(PathBuf::from(path))),
        ["abort"] => Ok(ConsoleCommand::Abort),
        ["force"] => Ok(ConsoleCommand::Force),
        ["resign"] => Ok(ConsoleCommand::Resign),
        ["hit"] | ["h"] => Ok(ConsoleCommand::Hit),
        ["battery", level] => level
            .parse()
            .map(ConsoleCommand::Battery)
            .map_err(|_| format!("Invalid battery level: {}", level)),
        ["quit"] | ["exit"] => Ok(ConsoleCommand::Quit),
        _ => Err("Unknown command. Try: status, drill <file>, abort, force, resign, hit, battery <n>, quit".into()),
    }
}

fn print_help() {
    println!("\nCommands:");
    println!("  status          - Show session status");
    println!("  drill <file>    - Run a drill program (JSON, master only)");
    println!("  abort           - Abort the running drill");
    println!("  force           - Force this pod to master");
    println!("  resign          - Resign mastership");
    println!("  hit             - Touch this pod");
    println!("  battery <n>     - Set battery level");
    println!("  quit            - Resign and exit\n");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins when set
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = match &args.config {
        Some(path) => PodConfig::load(path)?,
        None => PodConfig::default(),
    };

    let own = args.addr.unwrap_or_else(|| PodAddr::from_name(&args.name));
    info!("DOMES node \"{}\" starting as {}", args.name, own);

    let transport = Arc::new(UdpTransport::bind(own, args.port, args.broadcast.clone()).await?);
    info!("Listening on {}", transport.local_addr()?);

    let game = ConsoleGame::new(args.battery);
    let priority = PriorityScore::new(args.battery, 0, 0);
    let (runtime, mut handle) = PodRuntime::new(transport.clone(), priority, config, Box::new(game.clone()));
    transport.start_receive(runtime.inbox());
    let pod = tokio::spawn(runtime.run());

    if args.force_master {
        handle.force_master()?;
    }

    // Console runs on its own thread; stdin is blocking
    let (console_tx, mut console_rx) = mpsc::channel::<ConsoleCommand>(16);
    std::thread::spawn(move || {
        print_help();
        let stdin = io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(cmd) => {
                    if console_tx.blocking_send(cmd).is_err() {
                        break;
                    }
                }
                Err(e) => println!("{}", e),
            }
        }
    });

    loop {
        tokio::select! {
            Some(cmd) = console_rx.recv() => {
                if !run_command(cmd, &handle, &game).await {
                    break;
                }
            }

            notice = handle.next_notice() => {
                match notice {
                    Some(Notice::MasterChanged { master, is_master }) => {
                        if is_master {
                            println!(">> This pod is now MASTER");
                        } else {
                            println!(">> Master is now {}", master.map_or("(none)".to_string(), |m| m.to_string()));
                        }
                    }
                    Some(Notice::DrillFinished(result)) => {
                        println!(">> Drill finished:\n{}", serde_json::to_string_pretty(&result)?);
                    }
                    None => break,
                }
            }
        }
    }

    pod.await?;
    info!("DOMES node \"{}\" stopped", args.name);
    Ok(())
}

/// Returns false when the node should exit
async fn run_command(cmd: ConsoleCommand, handle: &PodHandle, game: &ConsoleGame) -> bool {
    let result = match cmd {
        ConsoleCommand::Status => {
            match serde_json::to_string_pretty(&handle.status()) {
                Ok(text) => println!("{}", text),
                Err(e) => warn!("Could not render status: {}", e),
            }
            Ok(())
        }
        ConsoleCommand::Drill(path) => match tokio::fs::read_to_string(&path).await {
            Ok(text) => DrillProgram::from_json(&text).and_then(|program| handle.start_drill(program)),
            Err(e) => {
                println!("Cannot read {}: {}", path.display(), e);
                Ok(())
            }
        },
        ConsoleCommand::Abort => handle.abort_drill(),
        ConsoleCommand::Force => handle.force_master(),
        ConsoleCommand::Resign => handle.resign(ResignReason::Operator),
        ConsoleCommand::Hit => {
            match game.hit() {
                Some(us) => println!("Hit after {:.1} ms", us as f64 / 1000.0),
                None => println!("Not armed"),
            }
            Ok(())
        }
        ConsoleCommand::Battery(level) => {
            game.set_battery(level);
            handle.update_vitals(game.battery_level(), 0)
        }
        ConsoleCommand::Quit => {
            let status = handle.status();
            if status.is_master() {
                let _ = handle.resign(ResignReason::Shutdown);
            }
            let _ = handle.shutdown();
            return false;
        }
    };

    if let Err(e) = result {
        println!("Error: {}", e);
    }
    true
}
