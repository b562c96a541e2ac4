use bytes::Bytes;
use reqwest::Url;
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::openai::{ChatRequest, InputItem, Message, MessageContent, ResponsesInput, ResponsesRequest};

pub fn validate_chat(req: &ChatRequest) -> ApiResult<()> {
    if req.model.trim().is_empty() {
        return Err(ApiError::missing("model"));
    }
    if req.messages.is_empty() {
        return Err(ApiError::missing("messages"));
    }
    Ok(())
}

/// Collapses a conversation into the single message the session dialect accepts.
/// Roles other than system, user and assistant are dropped.
pub fn flatten_for_session(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|m| {
            let label = match m.role.as_str() {
                "system" => "System",
                "user" => "User",
                "assistant" => "Assistant",
                _ => return None,
            };
            Some(format!("[{label}]: {}", m.content.text()))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The client's own JSON body with `stream` forced on; the upstream only streams.
pub fn direct_upstream_body(mut raw: Value) -> ApiResult<Bytes> {
    let Some(obj) = raw.as_object_mut() else {
        return Err(ApiError::invalid("Invalid JSON"));
    };
    obj.insert("stream".to_string(), Value::Bool(true));
    serde_json::to_vec(&raw)
        .map(Bytes::from)
        .map_err(|e| ApiError::Internal(format!("Failed to create request: {e}")))
}

/// Builds a direct-dialect body from an already normalized request.
pub fn chat_request_body(req: &ChatRequest) -> Value {
    let mut body = json!({
        "model": req.model,
        "messages": req.messages,
        "stream": true,
    });
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(m) = req.max_tokens {
        body["max_tokens"] = json!(m);
    }
    if let Some(effort) = &req.reasoning_effort {
        body["reasoning_effort"] = json!(effort);
    }
    body
}

/// `base` with its `provider` query parameter set to `provider`. Other
/// parameters keep their order; an unparsable base is returned unchanged.
pub fn upstream_endpoint(base: &str, provider: Option<&str>) -> String {
    let Some(provider) = provider.filter(|p| !p.is_empty()) else {
        return base.to_string();
    };
    let Ok(mut url) = Url::parse(base) else {
        return base.to_string();
    };
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "provider")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.push(("provider".to_string(), provider.to_string()));
    url.query_pairs_mut().clear().extend_pairs(pairs);
    url.to_string()
}

/// Maps a Responses API request onto a chat request, keeping turn roles.
pub fn responses_to_chat(req: &ResponsesRequest) -> ApiResult<ChatRequest> {
    if req.model.trim().is_empty() {
        return Err(ApiError::missing("model"));
    }

    let mut messages = Vec::new();
    if let Some(instructions) = req.instructions.as_deref().filter(|s| !s.is_empty()) {
        messages.push(Message::new("system", instructions));
    }
    match &req.input {
        ResponsesInput::Text(s) => {
            if !s.is_empty() {
                messages.push(Message::new("user", s.clone()));
            }
        }
        ResponsesInput::Items(items) => {
            for item in items {
                match item {
                    InputItem::Text(s) => messages.push(Message::new("user", s.clone())),
                    InputItem::Message { role, content } => {
                        let role = match role.as_deref() {
                            None => "user",
                            Some("developer") => "system",
                            Some(r) => r,
                        };
                        messages.push(Message {
                            role: role.to_string(),
                            content: MessageContent::Text(content.text()),
                            reasoning_content: None,
                        });
                    }
                    InputItem::Other(_) => {}
                }
            }
        }
    }
    if messages.iter().all(|m| m.role == "system") {
        return Err(ApiError::missing("input"));
    }

    Ok(ChatRequest {
        model: req.model.clone(),
        messages,
        stream: false,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_output_tokens,
        frequency_penalty: None,
        presence_penalty: None,
        reasoning_effort: req
            .reasoning
            .as_ref()
            .and_then(|r| r.get("effort"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
