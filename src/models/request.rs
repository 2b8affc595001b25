use serde::{Deserialize, Serialize};

/// The core's internal, adapter-agnostic call shape.
///
/// Exactly one of `prompt` / `messages` must be present; handlers reject
/// bodies with both or neither before any adapter work happens.
/// `parameters` accepts arbitrary keys; adapters walk it with a known-keys
/// allow-list and pass the rest through opaquely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub stream: bool,
    /// Client deadline for the whole call, capped by the server default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl NormalizedRequest {
    /// Structural validation: exactly one of prompt/messages.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.prompt, &self.messages) {
            (Some(_), Some(_)) => Err("request must not carry both prompt and messages".into()),
            (None, None) => Err("request must carry either prompt or messages".into()),
            (Some(p), None) if p.is_empty() => Err("prompt must not be empty".into()),
            (None, Some(m)) if m.is_empty() => Err("messages must not be empty".into()),
            _ => Ok(()),
        }
    }

    /// The message list adapters translate: a bare prompt becomes a single
    /// user message.
    pub fn effective_messages(&self) -> Vec<Message> {
        match (&self.prompt, &self.messages) {
            (_, Some(messages)) => messages.clone(),
            (Some(prompt), None) => vec![Message {
                role: Role::User,
                content: MessageContent::Text(prompt.clone()),
            }],
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message content: either a bare string or an ordered list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Part>),
}

impl MessageContent {
    /// Concatenated text of all text parts. Media parts contribute nothing.
    pub fn text_lossy(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Part::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn has_media(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => {
                parts.iter().any(|p| !matches!(p, Part::Text { .. }))
            }
        }
    }
}

/// A single typed content part. Media parts carry either a URL or an inline
/// base64 payload with its mime type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    ImageRef {
        #[serde(flatten)]
        source: MediaSource,
    },
    AudioRef {
        #[serde(flatten)]
        source: MediaSource,
    },
    VideoRef {
        #[serde(flatten)]
        source: MediaSource,
    },
    FileRef {
        #[serde(flatten)]
        source: MediaSource,
    },
}

impl Part {
    pub fn source(&self) -> Option<&MediaSource> {
        match self {
            Part::Text { .. } => None,
            Part::ImageRef { source }
            | Part::AudioRef { source }
            | Part::VideoRef { source }
            | Part::FileRef { source } => Some(source),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Inline payload, base64-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}
