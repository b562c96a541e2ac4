//! Endpoints the upstream cannot serve. Embeddings and moderations are answered
//! locally; audio and image calls are validated and then refused with 501.

use std::collections::HashMap;

use axum::Json;
use axum::extract::Multipart;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::logging::new_request_id;
use crate::openai::unix_nanos;

use super::parse_json;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;
pub const MAX_EMBEDDING_DIMENSIONS: usize = 3072;
const DEFAULT_MODERATION_MODEL: &str = "text-moderation-latest";
const VOICES: &[&str] = &["alloy", "echo", "fable", "onyx", "nova", "shimmer"];
const IMAGE_SIZES: &[&str] = &["256x256", "512x512", "1024x1024", "1792x1024", "1024x1792"];

#[derive(Debug, Deserialize)]
pub(super) struct EmbeddingsRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    input: Value,
    dimensions: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingData {
    pub object: &'static str,
    pub embedding: Vec<f64>,
    pub index: usize,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingsUsage {
    pub prompt_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingsResponse {
    pub object: &'static str,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: EmbeddingsUsage,
}

/// Strings of a `string | string[]` field; other array members are skipped.
fn string_inputs(input: &Value) -> Option<Vec<String>> {
    match input {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

/// Deterministic pseudo-embedding seeded from the text: a string hash feeds
/// a linear congruential generator, one step per dimension.
pub fn pseudo_embedding(text: &str, dimensions: usize) -> Vec<f64> {
    let mut hash: i64 = 0;
    for c in text.chars() {
        hash = (hash * 31 + c as i64) % 1_000_000;
    }
    (0..dimensions)
        .map(|_| {
            hash = (hash * 1_103_515_245 + 12_345) % (1 << 31);
            (hash % 2000 - 1000) as f64 / 10_000.0
        })
        .collect()
}

fn embedding_dimensions(requested: Option<usize>) -> ApiResult<usize> {
    match requested {
        None => Ok(DEFAULT_EMBEDDING_DIMENSIONS),
        Some(d) if (1..=MAX_EMBEDDING_DIMENSIONS).contains(&d) => Ok(d),
        Some(_) => Err(ApiError::invalid(format!(
            "dimensions must be between 1 and {MAX_EMBEDDING_DIMENSIONS}"
        ))),
    }
}

pub(super) async fn embeddings(body: Bytes) -> ApiResult<Json<EmbeddingsResponse>> {
    let req: EmbeddingsRequest = parse_json(&body)?;
    let dimensions = embedding_dimensions(req.dimensions)?;
    let inputs = string_inputs(&req.input).unwrap_or_default();

    let mut tokens = 0;
    let data = inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            tokens += input.split_whitespace().count() + 1;
            EmbeddingData {
                object: "embedding",
                embedding: pseudo_embedding(input, dimensions),
                index,
            }
        })
        .collect();

    info!(
        "[Embeddings] model={} inputs={} dimensions={} tokens={}",
        req.model,
        inputs.len(),
        dimensions,
        tokens
    );
    Ok(Json(EmbeddingsResponse {
        object: "list",
        data,
        model: req.model,
        usage: EmbeddingsUsage {
            prompt_tokens: tokens,
            total_tokens: tokens,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct ModerationRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ModerationCategories<T> {
    pub sexual: T,
    pub hate: T,
    pub harassment: T,
    #[serde(rename = "self-harm")]
    pub self_harm: T,
    #[serde(rename = "sexual/minors")]
    pub sexual_minors: T,
    #[serde(rename = "hate/threatening")]
    pub hate_threatening: T,
    #[serde(rename = "violence/graphic")]
    pub violence_graphic: T,
    #[serde(rename = "self-harm/intent")]
    pub self_harm_intent: T,
    #[serde(rename = "self-harm/instructions")]
    pub self_harm_instructions: T,
    #[serde(rename = "harassment/threatening")]
    pub harassment_threatening: T,
    pub violence: T,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModerationResult {
    pub flagged: bool,
    pub categories: ModerationCategories<bool>,
    pub category_scores: ModerationCategories<f64>,
}

#[derive(Debug, Serialize)]
pub struct ModerationResponse {
    pub id: String,
    pub model: String,
    pub results: Vec<ModerationResult>,
}

const VIOLENCE_KEYWORDS: &[&str] = &["kill", "murder", "attack", "weapon", "bomb", "shoot"];
const HATE_KEYWORDS: &[&str] = &["hate", "racist", "discrimination"];
const SELF_HARM_KEYWORDS: &[&str] = &["suicide", "self-harm", "hurt myself"];

/// Keyword heuristic. Unflagged categories get a small non-zero score.
pub fn moderate(input: &str) -> ModerationResult {
    let lower = input.to_lowercase();
    let hit = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    let mut categories = ModerationCategories::<bool>::default();
    let mut scores = ModerationCategories {
        sexual: 0.001,
        hate: 0.001,
        harassment: 0.001,
        self_harm: 0.001,
        sexual_minors: 0.0001,
        hate_threatening: 0.001,
        violence_graphic: 0.001,
        self_harm_intent: 0.001,
        self_harm_instructions: 0.001,
        harassment_threatening: 0.001,
        violence: 0.001,
    };

    if hit(VIOLENCE_KEYWORDS) {
        categories.violence = true;
        scores.violence = 0.7;
    }
    if hit(HATE_KEYWORDS) {
        categories.hate = true;
        scores.hate = 0.6;
    }
    if hit(SELF_HARM_KEYWORDS) {
        categories.self_harm = true;
        scores.self_harm = 0.8;
    }

    ModerationResult {
        flagged: categories.violence || categories.hate || categories.self_harm,
        categories,
        category_scores: scores,
    }
}

pub(super) async fn moderations(body: Bytes) -> ApiResult<Json<ModerationResponse>> {
    let req: ModerationRequest = parse_json(&body)?;
    if req.input.is_null() {
        return Err(ApiError::missing("input"));
    }
    let inputs = string_inputs(&req.input)
        .ok_or_else(|| ApiError::invalid("Input must be a string or array of strings"))?;
    if inputs.is_empty() {
        return Err(ApiError::invalid("Input cannot be empty"));
    }
    let model = if req.model.is_empty() {
        DEFAULT_MODERATION_MODEL.to_string()
    } else {
        req.model
    };

    let request_id = new_request_id();
    info!("[{}] ⇣ REQ (Moderation) model={} inputs={}", request_id, model, inputs.len());
    Ok(Json(ModerationResponse {
        id: format!("modr-{}", unix_nanos()),
        model,
        results: inputs.iter().map(|i| moderate(i)).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct SpeechRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    input: String,
    #[serde(default)]
    voice: String,
}

pub(super) async fn speech(body: Bytes) -> ApiResult<()> {
    let req: SpeechRequest = parse_json(&body)?;
    if req.model.is_empty() {
        return Err(ApiError::missing("model"));
    }
    if req.input.is_empty() {
        return Err(ApiError::missing("input"));
    }
    if req.voice.is_empty() {
        return Err(ApiError::missing("voice"));
    }
    if !VOICES.contains(&req.voice.as_str()) {
        return Err(ApiError::invalid(format!("Invalid voice: {}", req.voice)));
    }
    info!(
        "⇣ REQ (Speech) model={} voice={} input_len={}",
        req.model,
        req.voice,
        req.input.len()
    );
    Err(ApiError::NotImplemented(
        "Text-to-speech is not supported by the upstream service. This endpoint requires a TTS-capable backend."
            .to_string(),
    ))
}

/// Text fields and file parts of a multipart form. File bodies are only measured.
#[derive(Debug, Default)]
struct FormFields {
    text: HashMap<String, String>,
    files: HashMap<String, (String, usize)>,
}

impl FormFields {
    async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let bad_form = |_| ApiError::invalid("Failed to parse multipart form");
        let mut fields = FormFields::default();
        while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match field.file_name().map(str::to_string) {
                Some(filename) => {
                    let bytes = field.bytes().await.map_err(bad_form)?;
                    fields.files.insert(name, (filename, bytes.len()));
                }
                None => {
                    let text = field.text().await.map_err(bad_form)?;
                    fields.text.insert(name, text);
                }
            }
        }
        Ok(fields)
    }

    fn text(&self, name: &str) -> Option<&str> {
        self.text.get(name).map(String::as_str).filter(|s| !s.is_empty())
    }

    fn require_text(&self, name: &str) -> ApiResult<&str> {
        self.text(name).ok_or_else(|| ApiError::missing(name))
    }

    fn require_file(&self, name: &str) -> ApiResult<&(String, usize)> {
        self.files.get(name).ok_or_else(|| ApiError::missing(name))
    }
}

async fn audio_upload(multipart: Multipart, kind: &str, refusal: &str) -> ApiResult<()> {
    let form = FormFields::read(multipart).await?;
    let model = form.require_text("model")?;
    let (filename, size) = form.require_file("file")?;
    info!(
        "⇣ REQ ({}) model={} file={} size={} format={}",
        kind,
        model,
        filename,
        size,
        form.text("response_format").unwrap_or("json")
    );
    Err(ApiError::NotImplemented(refusal.to_string()))
}

pub(super) async fn transcriptions(multipart: Multipart) -> ApiResult<()> {
    audio_upload(
        multipart,
        "Transcription",
        "Speech-to-text transcription is not supported by the upstream service. This endpoint requires a Whisper-capable backend.",
    )
    .await
}

pub(super) async fn translations(multipart: Multipart) -> ApiResult<()> {
    audio_upload(
        multipart,
        "Translation",
        "Audio translation is not supported by the upstream service. This endpoint requires a Whisper-capable backend.",
    )
    .await
}

#[derive(Debug, Deserialize)]
pub(super) struct ImageGenerationRequest {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    model: String,
    n: Option<i64>,
    #[serde(default)]
    size: String,
}

pub(super) async fn image_generations(body: Bytes) -> ApiResult<()> {
    let req: ImageGenerationRequest = parse_json(&body)?;
    if req.prompt.is_empty() {
        return Err(ApiError::missing("prompt"));
    }
    let model = if req.model.is_empty() { "dall-e-2" } else { req.model.as_str() };
    let size = if req.size.is_empty() { "1024x1024" } else { req.size.as_str() };
    let n = req.n.unwrap_or(1);

    if !IMAGE_SIZES.contains(&size) {
        return Err(ApiError::invalid(format!("Invalid size: {size}")));
    }
    if !(1..=10).contains(&n) {
        return Err(ApiError::invalid("n must be between 1 and 10"));
    }
    if model == "dall-e-3" && n > 1 {
        return Err(ApiError::invalid("dall-e-3 only supports n=1"));
    }

    info!(
        "⇣ REQ (ImageGen) model={} size={} n={} prompt_len={}",
        model,
        size,
        n,
        req.prompt.len()
    );
    Err(ApiError::NotImplemented(
        "Image generation is not supported by the upstream service. This endpoint requires a DALL-E capable backend."
            .to_string(),
    ))
}

pub(super) async fn image_edits(multipart: Multipart) -> ApiResult<()> {
    let form = FormFields::read(multipart).await?;
    let prompt = form.require_text("prompt")?;
    let (filename, _) = form.require_file("image")?;
    info!(
        "⇣ REQ (ImageEdit) model={} size={} image={} prompt_len={}",
        form.text("model").unwrap_or("dall-e-2"),
        form.text("size").unwrap_or("1024x1024"),
        filename,
        prompt.len()
    );
    Err(ApiError::NotImplemented(
        "Image editing is not supported by the upstream service. This endpoint requires a DALL-E capable backend."
            .to_string(),
    ))
}

pub(super) async fn image_variations(multipart: Multipart) -> ApiResult<()> {
    let form = FormFields::read(multipart).await?;
    let (filename, _) = form.require_file("image")?;
    info!(
        "⇣ REQ (ImageVariation) model={} size={} image={}",
        form.text("model").unwrap_or("dall-e-2"),
        form.text("size").unwrap_or("1024x1024"),
        filename
    );
    Err(ApiError::NotImplemented(
        "Image variations is not supported by the upstream service. This endpoint requires a DALL-E capable backend."
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn embeddings_are_deterministic_and_bounded() {
        let a = pseudo_embedding("hello world", 8);
        let b = pseudo_embedding("hello world", 8);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.iter().all(|v| (-0.1..0.1).contains(v)));
        assert_ne!(a, pseudo_embedding("hello there", 8));
    }

    #[test]
    fn embedding_matches_reference_first_value() {
        // "a" -> hash 97 -> one LCG step
        let expected_hash = (97i64 * 1_103_515_245 + 12_345) % (1 << 31);
        let expected = (expected_hash % 2000 - 1000) as f64 / 10_000.0;
        assert_eq!(pseudo_embedding("a", 1), vec![expected]);
    }

    #[test]
    fn embedding_dimensions_are_bounded() {
        assert_eq!(embedding_dimensions(None).unwrap(), DEFAULT_EMBEDDING_DIMENSIONS);
        assert_eq!(embedding_dimensions(Some(3072)).unwrap(), 3072);
        assert!(embedding_dimensions(Some(0)).is_err());
        assert!(embedding_dimensions(Some(4_000_000_000)).is_err());
    }

    #[tokio::test]
    async fn oversized_dimensions_are_rejected_before_allocating() {
        let body = Bytes::from_static(br#"{"input":["a","b"],"dimensions":4000000000}"#);
        let err = embeddings(body).await.expect_err("too many dimensions");
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "dimensions must be between 1 and 3072");
    }

    #[test]
    fn moderation_flags_keyword_categories() {
        let r = moderate("I will ATTACK with a bomb");
        assert!(r.flagged);
        assert!(r.categories.violence);
        assert_eq!(r.category_scores.violence, 0.7);
        assert_eq!(r.category_scores.hate, 0.001);

        let calm = moderate("a quiet afternoon");
        assert!(!calm.flagged);
        assert_eq!(calm.category_scores.sexual_minors, 0.0001);
    }

    #[test]
    fn moderation_serializes_slash_category_names() {
        let v = serde_json::to_value(moderate("hurt myself")).unwrap();
        assert_eq!(v["categories"]["self-harm"], serde_json::json!(true));
        assert_eq!(v["category_scores"]["self-harm"], serde_json::json!(0.8));
        assert!(v["categories"].get("sexual/minors").is_some());
    }

    #[test]
    fn string_inputs_accepts_string_or_array() {
        assert_eq!(string_inputs(&serde_json::json!("x")), Some(vec!["x".to_string()]));
        assert_eq!(
            string_inputs(&serde_json::json!(["a", 1, "b"])),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(string_inputs(&serde_json::json!(5)), None);
    }
}
