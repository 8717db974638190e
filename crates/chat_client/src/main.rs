//! # Chat Client
//!
//! Terminal client for the chat relay. Joins under the given username, sends
//! every line typed on stdin as a chat message, and prints the feed and
//! roster as they arrive. Type `/quit` (or close stdin) to leave.

use anyhow::{bail, Context, Result};
use chat_core::{ClientAction, ClientPayload, ResponseAction, ServerResponse};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chat-client")]
#[command(about = "Terminal client for the chat relay")]
struct Args {
    /// Relay WebSocket URL
    #[arg(short, long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,

    /// Name to join under
    #[arg(short = 'n', long)]
    username: String,
}

/// What to do with a line typed by the user
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Quit,
    Skip,
    Say(String),
}

fn parse_input(line: &str) -> Input {
    match line.trim() {
        "/quit" => Input::Quit,
        "" => Input::Skip,
        text => Input::Say(text.to_string()),
    }
}

/// Turn a server response into the line shown to the user.
fn render(response: &ServerResponse) -> String {
    match response.action {
        Some(ResponseAction::ListUsers) if response.connected_users.is_empty() => {
            "* nobody online".to_string()
        }
        Some(ResponseAction::ListUsers) => {
            format!("* online: {}", response.connected_users.join(", "))
        }
        Some(ResponseAction::Broadcast) => response.message.clone(),
        None => format!("* {}", response.message),
    }
}

fn encode(action: ClientAction, username: &str, message: &str) -> Result<Message> {
    let payload = ClientPayload::new(action, username, message);
    Ok(Message::text(serde_json::to_string(&payload)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    if args.username.trim().is_empty() {
        bail!("username must not be blank");
    }

    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    info!(url = %args.url, username = %args.username, "Connected");

    ws_sender
        .send(encode(ClientAction::Join, &args.username, "")?)
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let input = match line? {
                    Some(line) => parse_input(&line),
                    None => Input::Quit,
                };
                match input {
                    Input::Quit => {
                        ws_sender.send(encode(ClientAction::Leave, &args.username, "")?).await?;
                        info!("Left the chat");
                        break;
                    }
                    Input::Skip => {}
                    Input::Say(text) => {
                        ws_sender.send(encode(ClientAction::Broadcast, &args.username, &text)?).await?;
                    }
                }
            }
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerResponse>(text.as_str()) {
                            Ok(response) => println!("{}", render(&response)),
                            Err(e) => warn!(error = %e, "Unreadable frame from relay"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "Relay closed the connection");
                        break;
                    }
                    Some(Ok(other)) => debug!(?other, "Ignoring frame"),
                    Some(Err(e)) => return Err(e).context("Connection to relay failed"),
                    None => {
                        info!("Relay went away");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
