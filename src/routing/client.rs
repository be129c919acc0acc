//! Model tier clients
//!
//! A tier is reached through the [`CompletionClient`] trait. The default
//! implementation talks to any OpenAI-compatible `chat/completions` endpoint;
//! the same wire types carry images for the vision recognition provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fields::{DocumentType, StructuredFields};

use super::patterns::parse_amount;

/// Errors raised by a single tier call
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Model API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse model response: {0}")]
    Parse(String),

    #[error("Model tier not configured: {0}")]
    NotConfigured(String),

    #[error("Model call cancelled")]
    Cancelled,
}

/// Raw completion returned by a tier
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub raw_text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A language model endpoint
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Completion, ModelError>;
}

// ============================================================================
// Chat Completions Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ResponseFormat {
    pub r#type: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessage {
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum ContentPart {
    Text { r#type: String, text: String },
    Image { r#type: String, image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            r#type: "text".to_string(),
            text: text.into(),
        }
    }

    pub fn image(url: String) -> Self {
        Self::Image {
            r#type: "image_url".to_string(),
            image_url: ImageUrl {
                url,
                detail: "high".to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ImageUrl {
    pub url: String,
    pub detail: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Choice {
    pub message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// POST a chat request and decode the response
pub(crate) async fn send_chat(
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    request: &ChatRequest,
) -> Result<ChatResponse, ModelError> {
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

    let mut builder = client.post(&url).json(request);
    if let Some(key) = api_key {
        builder = builder.bearer_auth(key);
    }

    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            ModelError::Http(format!("request to {} timed out", url))
        } else {
            ModelError::Http(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ModelError::Api {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json()
        .await
        .map_err(|e| ModelError::Parse(e.to_string()))
}

// ============================================================================
// OpenAI-compatible Client
// ============================================================================

/// Client for one model behind an OpenAI-compatible API
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: &str, api_key: Option<String>, model: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.to_string(),
            api_key,
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Completion, ModelError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![ContentPart::text(prompt)],
            }],
            max_tokens,
            temperature: 0.0,
            response_format: Some(ResponseFormat {
                r#type: "json_object".to_string(),
            }),
        };

        let response = send_chat(&self.client, &self.base_url, self.api_key.as_deref(), &request).await?;

        let raw_text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ModelError::Parse("response contained no choices".to_string()))?;

        let (input_tokens, output_tokens) = response
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or_else(|| (estimate_tokens(prompt), estimate_tokens(&raw_text)));

        tracing::debug!(
            model = %self.model,
            input_tokens,
            output_tokens,
            "Completion received"
        );

        Ok(Completion {
            raw_text,
            input_tokens,
            output_tokens,
        })
    }
}

// ============================================================================
// Prompt and Response Handling
// ============================================================================

/// Rough token count used for pre-call cost estimates (four chars per token)
pub fn estimate_tokens(text: &str) -> u32 {
    // roughly four characters per token
    u32::try_from(text.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
}

/// Build the field extraction prompt
pub fn build_extraction_prompt(text: &str, document_type: DocumentType, target_language: &str) -> String {
    format!(
        "{EXTRACTION_PROMPT}\n\nDocument type: {}\nDocument language (expected): {}\n\nDOCUMENT TEXT:\n{}",
        document_type, target_language, text
    )
}

/// Parse the model's JSON answer into structured fields.
///
/// Accepts fenced code blocks and surrounding prose. Amounts given as
/// localized strings are converted to numbers; unknown keys are ignored.
pub fn parse_extraction(raw: &str) -> Result<StructuredFields, ModelError> {
    let json = extract_json(raw);
    let mut value: Value = serde_json::from_str(&json).map_err(|e| ModelError::Parse(e.to_string()))?;

    if !value.is_object() {
        return Err(ModelError::Parse("expected a JSON object".to_string()));
    }
    // order matters: unparseable amounts become nulls, then nulls go
    normalize_numbers(&mut value);
    drop_nulls(&mut value);

    let mut fields: StructuredFields =
        serde_json::from_value(value).map_err(|e| ModelError::Parse(e.to_string()))?;
    fields.prune();
    Ok(fields)
}

/// Extract a JSON object from a response that may be wrapped in a code fence
fn extract_json(text: &str) -> String {
    let text = text.trim();

    if text.starts_with("```") {
        if let Some(start) = text.find('\n') {
            let body = &text[start + 1..];
            if let Some(end) = body.rfind("```") {
                return body[..end].trim().to_string();
            }
        }
    }

    // prose around the object
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => text[start..=end].to_string(),
        _ => text.to_string(),
    }
}

/// Convert string amounts inside `totals` and `lineItems` into numbers
fn normalize_numbers(value: &mut Value) {
    fn fix(v: &mut Value) {
        if let Value::String(s) = v {
            *v = parse_amount(s)
                .and_then(serde_json::Number::from_f64)
                .map_or(Value::Null, Value::Number);
        }
    }

    if let Some(totals) = value.get_mut("totals").and_then(Value::as_object_mut) {
        totals.values_mut().for_each(fix);
    }
    if let Some(items) = value.get_mut("lineItems").and_then(Value::as_array_mut) {
        for item in items.iter_mut().filter_map(Value::as_object_mut) {
            for key in ["quantity", "unitPrice", "total", "vatRate"] {
                if let Some(v) = item.get_mut(key) {
                    fix(v);
                }
            }
        }
    }
    if let Some(doc_type) = value.get_mut("documentType") {
        let parsed = doc_type.as_str().and_then(DocumentType::parse);
        *doc_type = parsed.map_or(Value::Null, |d| Value::String(d.as_str().to_string()));
    }
}

fn drop_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(drop_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(drop_nulls),
        _ => {}
    }
}

pub(crate) const EXTRACTION_PROMPT: &str = r#"You extract structured data from scanned business documents. The text below was produced by OCR and may contain recognition errors.

Return ONLY a JSON object with these keys (omit a key when the value is not present in the document, never guess):
{
  "documentType": "invoice | receipt | credit_note | proforma | order | other",
  "vendor": { "name": string, "taxId": string, "registrationId": string },
  "customer": { "name": string, "taxId": string, "registrationId": string },
  "totals": { "subtotal": number, "vatAmount": number, "total": number },
  "invoiceNumber": string,
  "date": "YYYY-MM-DD",
  "dueDate": "YYYY-MM-DD",
  "currency": "ISO 4217 code",
  "bankAccount": string,
  "variableSymbol": string,
  "lineItems": [ { "description": string, "quantity": number, "unitPrice": number, "total": number, "vatRate": number } ]
}"#;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_json() {
        let raw = "Here you go:\n```json\n{\"invoiceNumber\": \"FV2024-015\", \"currency\": \"CZK\"}\n```";
        let fields = parse_extraction(raw).unwrap();
        assert_eq!(fields.invoice_number.as_deref(), Some("FV2024-015"));
        assert_eq!(fields.currency.as_deref(), Some("CZK"));
    }

    #[test]
    fn test_parse_json_with_prose() {
        let raw = "The result is {\"vendor\": {\"name\": \"ACME s.r.o.\"}} as requested.";
        let fields = parse_extraction(raw).unwrap();
        assert_eq!(fields.vendor_name(), Some("ACME s.r.o."));
    }

    #[test]
    fn test_string_amounts_become_numbers() {
        let raw = r#"{"totals": {"total": "1 815,00", "subtotal": 1500, "vatAmount": null},
                      "lineItems": [{"description": "Consulting", "total": "1000.00"}],
                      "documentType": "Invoice"}"#;
        let fields = parse_extraction(raw).unwrap();
        let totals = fields.totals.unwrap();
        assert_eq!(totals.total, Some(1815.0));
        assert_eq!(totals.subtotal, Some(1500.0));
        assert_eq!(totals.vat_amount, None);
        assert_eq!(fields.line_items[0].total, Some(1000.0));
        assert_eq!(fields.document_type, Some(DocumentType::Invoice));
    }

    #[test]
    fn test_unknown_document_type_is_dropped() {
        let fields = parse_extraction(r#"{"documentType": "letter", "date": "2024-03-12"}"#).unwrap();
        assert_eq!(fields.document_type, None);
        assert_eq!(fields.date.as_deref(), Some("2024-03-12"));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(matches!(parse_extraction("no json here"), Err(ModelError::Parse(_))));
        assert!(matches!(parse_extraction("[1, 2]"), Err(ModelError::Parse(_))));
    }

    #[test]
    fn test_prompt_contains_text_and_type() {
        let prompt = build_extraction_prompt("Faktura 123", DocumentType::Invoice, "cs");
        assert!(prompt.contains("Faktura 123"));
        assert!(prompt.contains("Document type: invoice"));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
