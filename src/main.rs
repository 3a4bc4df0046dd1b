// Tower sync client entry point.
//
// Startup sequence:
// 1. Load config
// 2. Initialize tracing (log to file, not terminal)
// 3. Connect the remote store (memory or websocket)
// 4. Create mpsc channels
// 5. Spawn the session engine task
// 6. Run the line-based console until EOF or `quit`
// 7. Cleanup on exit

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use tower_sync::app;
use tower_sync::config::{self, Config, StoreBackend};
use tower_sync::protocol::{PlayerEntry, RoomSnapshot, UiUpdate, UserCommand};
use tower_sync::room::{NUMBER_CHOICES, NUM_LAYERS};
use tower_sync::store::memory::MemoryBackend;
use tower_sync::store::ws::WsStore;
use tower_sync::store::RemoteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config, 2. initialize tracing (log to file, not terminal)
    let config = config::load_config().context("failed to load configuration")?;
    init_tracing(&config)?;
    info!("Tower sync client starting up");

    // 3. Connect the remote store
    let store: Arc<dyn RemoteStore> = match config.store.backend {
        StoreBackend::Memory => {
            info!("Using the in-process memory store");
            Arc::new(MemoryBackend::new().connect())
        }
        StoreBackend::Websocket => {
            let url = config
                .store
                .url
                .as_deref()
                .context("store.url missing for the websocket backend")?;
            info!("Connecting to store server at {url}");
            Arc::new(
                WsStore::connect(url)
                    .await
                    .with_context(|| format!("failed to connect to {url}"))?,
            )
        }
    };

    // 4. Create mpsc channels
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ui_tx, mut ui_rx) = mpsc::channel(256);

    // 5. Spawn the session engine task
    let engine_handle = tokio::spawn(async move {
        if let Err(e) = app::run(store, cmd_rx, ui_tx).await {
            error!("Session engine error: {e}");
        }
    });

    // 6. Run the console: stdin lines become commands, updates get printed.
    println!("tower sync console");
    println!("commands: join <room> <name> | pick <1-4> | undo | reset | exit | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    info!("stdin closed, shutting down");
                    break;
                };
                match parse_line(&line) {
                    Ok(Some(cmd)) => {
                        if cmd_tx.send(cmd).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // quit
                    Err(msg) => println!("{msg}"),
                }
            }
            update = ui_rx.recv() => {
                let Some(update) = update else {
                    break;
                };
                print_update(&update);
            }
        }
    }

    // 7. Cleanup: closing the command channel stops the engine, which exits
    // any joined room on the way out.
    drop(cmd_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), engine_handle).await;

    info!("Tower sync client shut down cleanly");
    Ok(())
}

/// Parse one console line. `Ok(None)` means quit; `Err` carries a usage
/// message for the user.
fn parse_line(line: &str) -> Result<Option<UserCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err(String::new());
    };
    match verb {
        "join" => {
            let (Some(room), Some(name), None) = (words.next(), words.next(), words.next()) else {
                return Err("usage: join <room> <name>".into());
            };
            Ok(Some(UserCommand::Join {
                room_code: room.to_string(),
                player_name: name.to_string(),
            }))
        }
        "pick" => {
            let number = words
                .next()
                .and_then(|w| w.parse::<u8>().ok())
                .ok_or_else(|| "usage: pick <1-4>".to_string())?;
            Ok(Some(UserCommand::Pick { number }))
        }
        "undo" => Ok(Some(UserCommand::Undo)),
        "reset" => Ok(Some(UserCommand::Reset)),
        "exit" => Ok(Some(UserCommand::Exit)),
        "quit" | "q" => Ok(None),
        other => Err(format!("unknown command `{other}`")),
    }
}

fn print_update(update: &UiUpdate) {
    match update {
        UiUpdate::Joined(snap) => {
            println!("joined room {} as {}", snap.room_code, snap.player_name);
            print_snapshot(snap);
        }
        UiUpdate::Snapshot(snap) => print_snapshot(snap),
        UiUpdate::JoinFailed { reason } => println!("could not join: {reason}"),
        UiUpdate::WriteFailed { context } => {
            println!("warning: the room may be out of sync ({context} failed)")
        }
        UiUpdate::Rejected { reason } => println!("{reason}"),
        UiUpdate::Left => println!("left the room"),
    }
}

/// Render the room top-down, the way a tower is stacked.
fn print_snapshot(snap: &RoomSnapshot) {
    let names: Vec<String> = snap
        .players
        .iter()
        .map(|PlayerEntry { name, online }| {
            if *online {
                name.clone()
            } else {
                format!("{name} (offline)")
            }
        })
        .collect();
    println!("players: {}", names.join(", "));

    for layer in (0..NUM_LAYERS).rev() {
        let picks = &snap.grid[layer];
        let marker = if layer == snap.pointer { ">" } else { " " };
        let cells: Vec<String> = picks.iter().map(|(name, n)| format!("{name}={n}")).collect();
        println!("{marker} layer {:2}: {}", layer + 1, cells.join("  "));
    }

    if snap.complete {
        println!("all {NUM_LAYERS} layers complete! reset to play again");
    } else {
        let free: Vec<String> = NUMBER_CHOICES
            .iter()
            .filter(|n| !snap.disabled.contains(n))
            .map(|n| n.to_string())
            .collect();
        println!("layer {}: available {}", snap.pointer + 1, free.join(" "));
        if let Some(hint) = snap.hint {
            println!("only {hint} remains on this layer");
        }
    }
}

/// Initialize tracing to log to a file (not the terminal, which is used by
/// the console).
fn init_tracing(config: &Config) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_file = std::fs::File::create(&config.log.file)
        .with_context(|| format!("failed to create log file {}", config.log.file))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tower_sync=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
