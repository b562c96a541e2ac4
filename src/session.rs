//! Persona chat-session dialect: create a session, send one message, then
//! decode the upstream's event stream into completion chunks.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::browser::{self, Priority};
use crate::egress::{DispatchError, EgressPool, OutboundRequest};
use crate::logging::make_body_preview;
use crate::openai::{Delta, StreamChunk, unix_nanos, unix_now};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("create chat session failed: {0}")]
    Create(String),
    #[error("send message failed: {0}")]
    SendTransport(#[source] DispatchError),
    #[error("send message rejected with status {status}")]
    SendRejected { status: u16, body: Bytes },
}

#[derive(Debug, Clone)]
pub struct SessionEndpoints {
    pub create_url: String,
    pub send_url: String,
    /// Sent as `Origin` / `Referer`.
    pub origin: String,
}

impl SessionEndpoints {
    pub fn new(session_base: &str, origin: &str) -> Self {
        let base = session_base.trim_end_matches('/');
        Self {
            create_url: format!("{base}/chat/create-chat-session"),
            send_url: format!("{base}/chat/send-message"),
            origin: origin.to_string(),
        }
    }
}

#[derive(Serialize)]
struct CreateSessionBody {
    persona_id: u64,
    description: String,
}

#[derive(Deserialize)]
struct CreateSessionReply {
    chat_session_id: Value,
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    chat_session_id: &'a str,
    parent_message_id: Option<u64>,
    message: &'a str,
    file_descriptors: [Value; 0],
    search_doc_ids: [Value; 0],
    retrieval_options: Map<String, Value>,
}

/// Start of the handshake; nothing has been sent yet.
pub struct SessionHandshake<'a> {
    egress: &'a EgressPool,
    endpoints: &'a SessionEndpoints,
    credential: &'a str,
}

impl<'a> SessionHandshake<'a> {
    pub fn new(egress: &'a EgressPool, endpoints: &'a SessionEndpoints, credential: &'a str) -> Self {
        Self {
            egress,
            endpoints,
            credential,
        }
    }

    fn request(&self, url: &str, body: Vec<u8>) -> OutboundRequest {
        let headers = browser::upstream_headers(
            &self.endpoints.origin,
            Priority::Random,
            Some(self.credential),
        );
        OutboundRequest::post_json(url.to_string(), headers, body)
    }

    /// Creates a session bound to `persona_id`. Any failure is final.
    pub async fn create(self, persona_id: u64, model: &str) -> Result<CreatedSession<'a>, SessionError> {
        let body = serde_json::to_vec(&CreateSessionBody {
            persona_id,
            description: format!("Streaming chat session using {model}"),
        })
        .map_err(|e| SessionError::Create(e.to_string()))?;

        let out = self
            .egress
            .dispatch(self.request(&self.endpoints.create_url, body))
            .await
            .map_err(|e| SessionError::Create(e.to_string()))?;
        let status = out.response.status();
        let bytes = out
            .response
            .bytes()
            .await
            .map_err(|e| SessionError::Create(e.to_string()))?;
        if !status.is_success() {
            let preview = make_body_preview(&bytes, None, 200);
            return Err(SessionError::Create(format!(
                "status {}, body: {}",
                status.as_u16(),
                preview.data
            )));
        }

        let reply: CreateSessionReply =
            serde_json::from_slice(&bytes).map_err(|e| SessionError::Create(e.to_string()))?;
        let session_id = match reply.chat_session_id {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        };
        if session_id.is_empty() {
            return Err(SessionError::Create("missing chat_session_id".to_string()));
        }

        Ok(CreatedSession {
            handshake: self,
            session_id,
        })
    }
}

pub struct CreatedSession<'a> {
    handshake: SessionHandshake<'a>,
    session_id: String,
}

impl<'a> CreatedSession<'a> {
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Posts the flattened conversation; the reply body is the event stream.
    pub async fn send(self, message: &str) -> Result<SentMessage, SessionError> {
        let body = serde_json::to_vec(&SendMessageBody {
            chat_session_id: &self.session_id,
            parent_message_id: None,
            message,
            file_descriptors: [],
            search_doc_ids: [],
            retrieval_options: Map::new(),
        })
        .unwrap_or_default();

        let out = self
            .handshake
            .egress
            .dispatch(self.handshake.request(&self.handshake.endpoints.send_url, body))
            .await
            .map_err(SessionError::SendTransport)?;

        let status = out.response.status();
        if status != reqwest::StatusCode::OK {
            let body = out.response.bytes().await.unwrap_or_default();
            return Err(SessionError::SendRejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(SentMessage {
            session_id: self.session_id,
            response: out.response,
            path: out.path,
        })
    }
}

/// An accepted message whose response body is still unread.
#[derive(Debug)]
pub struct SentMessage {
    pub session_id: String,
    pub response: reqwest::Response,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderPhase {
    AwaitingAck,
    Streaming,
    Terminal(Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Chunk(StreamChunk),
    Done,
}

#[derive(Deserialize)]
struct SessionEvent {
    obj: EventObject,
}

#[derive(Deserialize)]
struct EventObject {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    content: Option<String>,
}

fn is_ack(value: &Value) -> bool {
    value.as_object().is_some_and(|o| {
        !o.contains_key("obj")
            && (o.contains_key("user_message_id") || o.contains_key("reserved_assistant_message_id"))
    })
}

/// Turns session event lines into `chat.completion.chunk`s.
///
/// The first line may be an acknowledgement, which is swallowed. A `stop`
/// event emits the terminal chunk and `[DONE]`; nothing is emitted after.
#[derive(Debug)]
pub struct SessionEventDecoder {
    id: String,
    created: i64,
    model: String,
    phase: DecoderPhase,
    deltas: usize,
}

impl SessionEventDecoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", unix_nanos()),
            created: unix_now(),
            model: model.to_string(),
            phase: DecoderPhase::AwaitingAck,
            deltas: 0,
        }
    }

    pub fn phase(&self) -> DecoderPhase {
        self.phase
    }

    pub fn deltas(&self) -> usize {
        self.deltas
    }

    fn chunk(&self, delta: Delta, finish: Option<&str>) -> Emission {
        Emission::Chunk(StreamChunk::new(&self.id, self.created, &self.model, delta, finish))
    }

    fn terminate(&mut self) -> Vec<Emission> {
        self.phase = DecoderPhase::Terminal(Outcome::Success);
        vec![self.chunk(Delta::default(), Some("stop")), Emission::Done]
    }

    pub fn decode_line(&mut self, line: &str) -> Vec<Emission> {
        if matches!(self.phase, DecoderPhase::Terminal(_)) {
            return Vec::new();
        }
        let line = line.trim();
        let line = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
        if line.is_empty() {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            self.phase = DecoderPhase::Streaming;
            return Vec::new();
        };

        if self.phase == DecoderPhase::AwaitingAck {
            self.phase = DecoderPhase::Streaming;
            if is_ack(&value) {
                return Vec::new();
            }
        }

        let Ok(event) = serde_json::from_value::<SessionEvent>(value) else {
            return Vec::new();
        };
        match event.obj.kind.as_str() {
            "message_start" => vec![self.chunk(
                Delta {
                    role: Some("assistant".to_string()),
                    ..Default::default()
                },
                None,
            )],
            "message_delta" => {
                self.deltas += 1;
                vec![self.chunk(
                    Delta {
                        content: Some(event.obj.content.unwrap_or_default()),
                        ..Default::default()
                    },
                    None,
                )]
            }
            "stop" => self.terminate(),
            _ => Vec::new(),
        }
    }

    /// Upstream EOF. If no `stop` arrived, closes the exchange itself; the
    /// returned emissions are non-empty exactly in that case.
    pub fn finish(&mut self) -> Vec<Emission> {
        match self.phase {
            DecoderPhase::Terminal(_) => Vec::new(),
            _ => self.terminate(),
        }
    }

    /// A hard read error; the exchange ends without a terminal chunk.
    pub fn fail(&mut self) {
        self.phase = DecoderPhase::Terminal(Outcome::Failed);
    }
}
