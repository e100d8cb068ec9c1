use std::{
    io::{self, BufRead},
    path::PathBuf,
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use oxidepass::{
    Config, Effect, Engine, Event, FileStore, SecretStore, SystemClock, ViewSnapshot,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// A terminal stand-in for the status bar menu.
#[derive(Debug, Parser)]
struct Args {
    /// Where the server settings live
    #[arg(long, default_value = "oxidepass.toml")]
    config: PathBuf,

    /// Where the secrets live
    #[arg(long, default_value = "secrets.toml")]
    secrets: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,
}

enum Command {
    Show,
    Pick(usize),
    Add(String, String),
    Event(Event),
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Command {
    let mut words = line.split_whitespace();

    match words.next() {
        None | Some("list") => Command::Show,
        Some("pick") => match words.next().and_then(|n| n.parse().ok()) {
            Some(position) => Command::Pick(position),
            None => Command::Unknown(line.to_string()),
        },
        Some("add") => match (words.next(), words.next()) {
            (Some(label), Some(secret)) => Command::Add(label.into(), secret.into()),
            _ => Command::Unknown(line.to_string()),
        },
        Some("mode") => Command::Event(Event::ToggleMode),
        Some("port") => Command::Event(Event::PortChanged(words.collect::<Vec<_>>().join(" "))),
        Some("restart") => Command::Event(Event::RestartServer),
        Some("stop") => Command::Event(Event::StopServer),
        Some("quit") | Some("exit") => Command::Quit,
        Some(_) => Command::Unknown(line.to_string()),
    }
}

fn print_menu(engine: &Engine, snapshot: &ViewSnapshot) {
    println!("--- {} ---", Local::now().format("%H:%M:%S"));
    println!("{}", engine.expiry_text());
    for entry in &snapshot.entries {
        println!(
            "  [{}] {}  ({})",
            entry.position,
            entry.title(),
            entry.decoration.tooltip()
        );
    }
    if snapshot.entries.is_empty() {
        println!("  (no keys yet, try `add <label> <secret>`)");
    }
    println!("  {}    {}", snapshot.mode.toggle_title(), engine.server_url());
}

fn report(effects: Vec<Effect>, engine: &Engine) {
    for effect in effects {
        match effect {
            Effect::Refreshed(_) => print_menu(engine, &engine.snapshot()),
            Effect::CopyToClipboard(code) => println!("copied {code} to the clipboard"),
            Effect::EntryRemoved(label) => println!("removed {label}"),
            Effect::ModeChanged(mode) => println!("now in {mode} mode"),
            Effect::Notice(message) => println!("! {message}"),
            Effect::ConfigRejected(message) => println!("! {message}"),
            Effect::ServerStarted(addr) => println!("serving codes on http://{addr}"),
            Effect::ServerStopped => println!("server stopped"),
            Effect::ServerFailed(message) => println!("! could not start the server: {message}"),
        }
    }
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let config = Config::load(&args.config).context("failed to load config")?;
    let store = Arc::new(FileStore::open(&args.secrets).context("failed to open secrets")?);

    let mut engine = Engine::new(store.clone(), Arc::new(SystemClock), config);
    let effects = engine.startup();
    report(effects, &engine);

    let (lines_tx, lines_rx) = mpsc::channel();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if lines_tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("failed to spawn the input thread")?;

    loop {
        let line = match lines_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(line) => line,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let effects = engine.handle(Event::Tick);
                report(effects, &engine);
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let effects = match parse_command(&line) {
            Command::Show => {
                print_menu(&engine, &engine.snapshot());
                continue;
            }
            Command::Pick(position) => {
                let snapshot = engine.snapshot();
                match snapshot.entries.get(position) {
                    Some(entry) => engine.handle(Event::EntryActivated(entry.id)),
                    None => {
                        println!("! no entry at {position}");
                        continue;
                    }
                }
            }
            Command::Add(label, secret) => match store.add(&label, &secret) {
                Ok(()) => {
                    let mut effects = engine.handle(Event::SecretAdded);
                    effects.extend(engine.handle(Event::Tick));
                    effects
                }
                Err(e) => {
                    println!("! {e}");
                    continue;
                }
            },
            Command::Event(event) => engine.handle(event),
            Command::Quit => break,
            Command::Unknown(line) => {
                println!("! unknown command {line:?}");
                continue;
            }
        };

        let port_changed = effects
            .iter()
            .any(|e| matches!(e, Effect::ServerStarted(_)));
        report(effects, &engine);

        if port_changed {
            engine
                .config()
                .save(&args.config)
                .context("failed to save config")?;
        }
    }

    tracing::info!("bye");

    Ok(())
}
