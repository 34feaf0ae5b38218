//! Terminal client: one websocket, stdin as chat input, stdout as transcript.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, warn};

use crate::{
    cli::ClientArgs,
    message::{MessageKind, RoomMessage},
    wire::{WireFormat, render_line},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the session loop should do after handling one event.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let url = endpoint_url(&args)?;
    let (socket, _response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    debug!(%url, "websocket established");

    print_line(&format!("*** connected as {} in {}", args.username, args.room)).await?;

    let mut session = Session {
        socket,
        wire_format: args.wire_format,
    };
    let result = session.run(BufReader::new(tokio::io::stdin()).lines()).await;
    session.close().await;
    result
}

/// Upgrade URL for the relay, with the join parameters form-encoded.
pub fn endpoint_url(args: &ClientArgs) -> Result<String> {
    let query = serde_urlencoded::to_string([
        ("room", args.room.as_str()),
        ("username", args.username.as_str()),
    ])
    .context("failed to encode join parameters")?;
    Ok(format!("ws://{}/ws?{query}", args.server))
}

struct Session {
    socket: Socket,
    wire_format: WireFormat,
}

impl Session {
    async fn run(&mut self, mut input: Lines<BufReader<Stdin>>) -> Result<()> {
        loop {
            let flow = select! {
                frame = self.socket.next() => self.on_frame(frame).await?,
                line = input.next_line() => match line.context("failed to read stdin")? {
                    Some(line) => self.on_input(&line).await?,
                    None => Flow::Stop,
                },
                signal = tokio::signal::ctrl_c() => {
                    if let Err(error) = signal {
                        warn!(?error, "ctrl-c handler failed");
                    }
                    Flow::Stop
                }
            };
            if flow == Flow::Stop {
                return Ok(());
            }
        }
    }

    async fn on_frame(
        &mut self,
        frame: Option<Result<Message, tungstenite::Error>>,
    ) -> Result<Flow> {
        match frame {
            Some(Ok(Message::Text(text))) => {
                for line in render_frame(&text, self.wire_format) {
                    print_line(&line).await?;
                }
                Ok(Flow::Continue)
            }
            Some(Ok(Message::Close(_))) | None => {
                print_line("*** server closed the connection").await?;
                Ok(Flow::Stop)
            }
            Some(Ok(_)) => Ok(Flow::Continue),
            Some(Err(err)) => Err(err).context("connection to server failed"),
        }
    }

    async fn on_input(&mut self, line: &str) -> Result<Flow> {
        let text = line.trim_end();
        if text.is_empty() {
            return Ok(Flow::Continue);
        }
        if text.eq_ignore_ascii_case("/quit") {
            print_line("*** leaving room").await?;
            return Ok(Flow::Stop);
        }

        let frame = self.wire_format.encode_outbound(text)?;
        self.socket
            .send(Message::Text(frame))
            .await
            .context("failed to send chat message")?;
        Ok(Flow::Continue)
    }

    async fn close(&mut self) {
        if let Err(error) = self.socket.close(None).await {
            debug!(?error, "websocket did not close cleanly");
        }
    }
}

/// Transcript lines for one server frame.
fn render_frame(text: &str, wire_format: WireFormat) -> Vec<String> {
    match wire_format {
        WireFormat::Json => match serde_json::from_str::<RoomMessage>(text) {
            Ok(message) => vec![render_message(&message)],
            Err(_) => vec![format!("!!! unreadable frame: {text}")],
        },
        WireFormat::Text => text.lines().map(str::to_string).collect(),
    }
}

/// Terminal rendering: chat as `<sender> text`, events as `***` lines.
pub fn render_message(message: &RoomMessage) -> String {
    match message.kind {
        MessageKind::Chat => format!("<{}> {}", message.sender, message.content),
        _ => render_line(message),
    }
}

async fn print_line(line: &str) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{line}\n").as_bytes()).await?;
    stdout.flush().await
}
