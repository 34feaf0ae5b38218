//! The two mutually incompatible wire variants a deployment can pick from.

use std::sync::Arc;

use clap::ValueEnum;

use crate::message::{ClientFrame, MessageKind, RoomMessage};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum WireFormat {
    /// One JSON object per websocket frame.
    #[default]
    Json,
    /// Raw text lines, chat prefixed with `<username>: `.
    Text,
}

impl WireFormat {
    /// Turns a batch of queued messages into the text frames to write.
    ///
    /// JSON keeps one frame per message; plain text joins the batch into a
    /// single newline-separated frame.
    pub fn encode_batch(self, messages: &[Arc<RoomMessage>]) -> serde_json::Result<Vec<String>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        match self {
            WireFormat::Json => messages
                .iter()
                .map(|message| serde_json::to_string(message.as_ref()))
                .collect(),
            WireFormat::Text => {
                let lines: Vec<String> = messages
                    .iter()
                    .map(|message| render_line(message))
                    .collect();
                Ok(vec![lines.join("\n")])
            }
        }
    }

    /// Extracts chat content from an inbound frame, `None` if it should be dropped.
    pub fn decode_inbound(self, payload: &str) -> Option<String> {
        match self {
            WireFormat::Json => {
                let frame: ClientFrame = serde_json::from_str(payload).ok()?;
                normalize(&frame.content)
            }
            WireFormat::Text => normalize(payload),
        }
    }

    /// Builds the frame a client sends for a line of chat.
    pub fn encode_outbound(self, content: &str) -> serde_json::Result<String> {
        match self {
            WireFormat::Json => serde_json::to_string(&ClientFrame {
                content: content.to_string(),
            }),
            WireFormat::Text => Ok(content.to_string()),
        }
    }
}

/// Plain-text rendering of a single message.
pub fn render_line(message: &RoomMessage) -> String {
    match message.kind {
        MessageKind::Chat => format!("{}: {}", message.sender, message.content),
        MessageKind::Join => format!("*** {} joined {}", message.sender, message.room),
        MessageKind::Leave => format!("*** {} left {}", message.sender, message.room),
        MessageKind::Presence => {
            format!("*** online in {}: {}", message.room, message.users.join(", "))
        }
    }
}

fn normalize(text: &str) -> Option<String> {
    let flattened = text.replace(LINE_ENDINGS, " ");
    let trimmed = flattened.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
