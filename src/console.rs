//! Terminal front-end for the client: renders coordinator events to stdout
//! and turns typed lines into intents. `@name text` sends an encrypted
//! direct message, anything else broadcasts in the clear, `/quit` leaves.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cli::ClientArgs;
use crate::client::{ClientEvent, Coordinator, KeySource, SendError};
use crate::message::SERVER_NAME;

pub async fn run(args: ClientArgs) -> Result<()> {
    let key_source = key_source_from_args(&args)?;
    let (host, port) = split_server_address(&args.server)?;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut coordinator = Coordinator::connect(host, port, &args.name, key_source, events_tx)
        .await
        .with_context(|| format!("failed to join {}", args.server))?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if !render_event(event, coordinator.name()).await? {
                            break;
                        }
                    }
                    None => break,
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_input(bytes_read, &input, &mut coordinator).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    coordinator.disconnect().await;
    Ok(())
}

fn key_source_from_args(args: &ClientArgs) -> Result<KeySource> {
    if let (Some(p), Some(q)) = (args.p, args.q) {
        return Ok(KeySource::Manual { p, q });
    }
    let candidates = load_prime_pool(&args.prime_pool)?;
    Ok(KeySource::Pool { candidates })
}

/// Reads a candidate pool, one integer per line. Entries are sampled and
/// re-validated at key generation time, so the file is data, not trusted
/// input; every line still has to parse.
fn load_prime_pool(path: &Path) -> Result<Vec<u64>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read prime pool {}", path.display()))?;
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<u64>()
                .with_context(|| format!("invalid prime pool entry '{line}'"))
        })
        .collect()
}

fn split_server_address(server: &str) -> Result<(&str, u16)> {
    let (host, port) = server
        .rsplit_once(':')
        .with_context(|| format!("server address '{server}' must be host:port"))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in '{server}'"))?;
    Ok((host, port))
}

/// Renders one event. Returns false when the session is over.
async fn render_event(event: ClientEvent, own_name: &str) -> Result<bool> {
    match event {
        ClientEvent::Connected { name } => {
            write_stdout(&format!("*** connected as {name}")).await?;
        }
        ClientEvent::Disconnected { reason } => {
            write_stdout(&format!("*** disconnected: {reason}")).await?;
            return Ok(false);
        }
        // The status line's closest terminal analog is the log.
        ClientEvent::Status { text } => info!("{text}"),
        ClientEvent::RosterChanged { names } => {
            let others: Vec<&str> = names
                .iter()
                .map(String::as_str)
                .filter(|name| *name != own_name)
                .collect();
            if !others.is_empty() {
                write_stdout(&format!("*** online: {}", others.join(", "))).await?;
            }
        }
        ClientEvent::DirectReceived { from, text, .. } => {
            write_stdout(&format!("[from {from}] {text}")).await?;
        }
        ClientEvent::BroadcastReceived { from, text, .. } => {
            if from == SERVER_NAME {
                write_stdout(&format!("*** {text}")).await?;
            } else if from != own_name {
                // Our own broadcast came back from the relay; the local echo
                // already covered it.
                write_stdout(&format!("<{from}> {text}")).await?;
            }
        }
    }
    Ok(true)
}

async fn handle_input(
    bytes_read: io::Result<usize>,
    input: &str,
    coordinator: &mut Coordinator,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let line = input.trim();
    if line.is_empty() {
        return Ok(true);
    }

    if line.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if let Some(rest) = line.strip_prefix('@') {
        let Some((recipient, text)) = rest.split_once(char::is_whitespace) else {
            write_stdout("!!! usage: @name message").await?;
            return Ok(true);
        };
        let text = text.trim();
        match coordinator.send_direct(recipient, text).await {
            Ok(()) => write_stdout(&format!("[to {recipient}] {text}")).await?,
            Err(error @ (SendError::UnknownRecipient(_) | SendError::NoPublicKey(_))) => {
                write_stdout(&format!("!!! {error}")).await?;
            }
            Err(SendError::Io(error)) => return Err(error.into()),
        }
        return Ok(true);
    }

    coordinator.send_broadcast(line).await?;
    write_stdout(&format!("[to all] {line}")).await?;
    Ok(true)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
