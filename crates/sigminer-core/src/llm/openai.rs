//! OpenAI-compatible extraction client
//!
//! Asks for the answer through a forced function call so the arguments
//! always come back as the `{thoughtProcess, answer}` object.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::pricing::completion_cost;
use super::prompt::{self, ANSWER_TOOL_NAME};
use super::{Extraction, ExtractionRequest, FieldExtractor};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::models::ExtractionAnswer;

/// Delay before the first retry, doubled for each following one
const INITIAL_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    tools: Vec<Value>,
    tool_choice: Value,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
    detail: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Extraction client for OpenAI and compatible endpoints
pub struct OpenAiExtractor {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    fallback_model: Option<String>,
    retries: u32,
    retry_delay: Duration,
}

impl OpenAiExtractor {
    /// Create a client from runtime settings
    pub fn new(api_key: Option<String>, settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.llm_base_url.trim_end_matches('/').to_string(),
            api_key,
            fallback_model: settings.fallback_model.clone(),
            retries: settings.llm_retries,
            retry_delay: Duration::from_millis(INITIAL_RETRY_DELAY_MS),
        })
    }

    /// Overrides the initial retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn user_message(request: &ExtractionRequest) -> ChatMessage {
        let text = if request.context_chunks.is_empty() {
            request.query.clone()
        } else {
            prompt::rag_prompt(&request.query, &request.context_chunks)
        };

        let content = if request.images.is_empty() {
            MessageContent::Text(text)
        } else {
            let mut parts = vec![ContentPart::Text { text }];
            parts.extend(request.images.iter().map(|image| ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/jpeg;base64,{}", STANDARD.encode(image)),
                    detail: "auto",
                },
            }));
            MessageContent::Parts(parts)
        };

        ChatMessage {
            role: "user",
            content,
        }
    }

    /// One completion call against one model
    async fn complete(&self, model: &str, request: &ExtractionRequest) -> Result<Option<Extraction>> {
        let body = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(prompt::system_message()),
                },
                Self::user_message(request),
            ],
            tools: vec![prompt::answer_tool(&request.field)],
            tool_choice: json!({"type": "function", "function": {"name": ANSWER_TOOL_NAME}}),
            temperature: 0.0,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(ref api_key) = self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(Error::ExtractionRejected {
                model: model.to_string(),
                status,
                message,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let cost = parsed
            .usage
            .map(|u| completion_cost(model, u.prompt_tokens, u.completion_tokens))
            .unwrap_or(0.0);

        let tool_calls = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.tool_calls)
            .unwrap_or_default();

        for call in tool_calls {
            if call.function.name != ANSWER_TOOL_NAME {
                debug!("Ignoring unexpected tool call {}", call.function.name);
                continue;
            }
            let answer: ExtractionAnswer =
                serde_json::from_str(&call.function.arguments).map_err(|e| {
                    Error::Extraction(format!("{} returned invalid answer arguments: {}", model, e))
                })?;
            return Ok(Some(Extraction {
                answer,
                cost,
                model: model.to_string(),
            }));
        }

        debug!("{} answered without calling {}", model, ANSWER_TOOL_NAME);
        Ok(None)
    }
}

fn is_retryable(error: &Error) -> bool {
    match error {
        Error::ExtractionRejected { status, .. } => *status == 429 || *status >= 500,
        Error::Http(_) | Error::Extraction(_) => true,
        _ => false,
    }
}

#[async_trait]
impl FieldExtractor for OpenAiExtractor {
    async fn extract(&self, request: ExtractionRequest) -> Result<Option<Extraction>> {
        let mut models = vec![request.model.clone()];
        if let Some(fallback) = &self.fallback_model {
            if fallback != &request.model {
                models.push(fallback.clone());
            }
        }

        let mut last_error = None;
        for (index, model) in models.iter().enumerate() {
            if index > 0 {
                info!("Falling back to {} for field {}", model, request.field.field_name);
            }

            let mut delay = self.retry_delay;
            for attempt in 0..=self.retries {
                match self.complete(model, &request).await {
                    Ok(result) => return Ok(result),
                    Err(e) if is_retryable(&e) => {
                        warn!(
                            "Extraction attempt {}/{} with {} failed: {}",
                            attempt + 1,
                            self.retries + 1,
                            model,
                            e
                        );
                        last_error = Some(e);
                        if attempt < self.retries {
                            tokio::time::sleep(delay).await;
                            delay *= 2;
                        }
                    }
                    Err(e) => {
                        warn!("Extraction with {} failed: {}", model, e);
                        last_error = Some(e);
                        break;
                    }
                }
            }
        }

        Err(match last_error {
            Some(e @ Error::ExtractionRejected { .. }) | Some(e @ Error::Extraction(_)) => e,
            Some(e) => Error::Extraction(e.to_string()),
            None => Error::Extraction("no model configured".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldConfig;
    use mockito::Matcher;
    use std::sync::Arc;

    fn extractor(server: &mockito::ServerGuard) -> OpenAiExtractor {
        let settings = Settings {
            llm_base_url: server.url(),
            llm_retries: 1,
            ..Settings::default()
        };
        OpenAiExtractor::new(Some("sk-test".to_string()), &settings)
            .unwrap()
            .with_retry_delay(Duration::from_millis(1))
    }

    fn request(model: &str, images: Vec<Vec<u8>>) -> ExtractionRequest {
        ExtractionRequest {
            query: "Extract the company".to_string(),
            model: model.to_string(),
            context_chunks: vec!["Subject: Hello".to_string()],
            images: Arc::new(images),
            field: FieldConfig::new("company", "Legal name"),
        }
    }

    fn tool_response(answer: &str) -> String {
        json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": ANSWER_TOOL_NAME,
                            "arguments": json!({"thoughtProcess": "Signature says so", "answer": answer}).to_string()
                        }
                    }]
                }
            }],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 100, "total_tokens": 1100}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_extract_parses_tool_call_and_cost() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(json!({
                "model": "gpt-4o",
                "temperature": 0.0,
                "tool_choice": {"type": "function", "function": {"name": ANSWER_TOOL_NAME}}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(tool_response("Acme"))
            .create_async()
            .await;

        let extraction = extractor(&server)
            .extract(request("gpt-4o", vec![]))
            .await
            .unwrap()
            .unwrap();
        mock.assert_async().await;

        assert_eq!(extraction.answer.value(), Some("Acme"));
        assert_eq!(extraction.model, "gpt-4o");
        // 1000 * 2.5 + 100 * 10 per million tokens
        assert!((extraction.cost - 0.0035).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_images_are_sent_as_data_urls() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::Regex(format!(
                "data:image/jpeg;base64,{}",
                STANDARD.encode(b"logo")
            )))
            .with_status(200)
            .with_body(tool_response("null"))
            .create_async()
            .await;

        let extraction = extractor(&server)
            .extract(request("gpt-4o", vec![b"logo".to_vec()]))
            .await
            .unwrap()
            .unwrap();
        mock.assert_async().await;
        assert_eq!(extraction.answer.value(), None);
    }

    #[tokio::test]
    async fn test_no_tool_call_is_no_answer() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices": [{"message": {"role": "assistant", "content": "I cannot tell."}}]}"#)
            .create_async()
            .await;

        let result = extractor(&server)
            .extract(request("gpt-4o", vec![]))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_falls_back_after_retries() {
        let mut server = mockito::Server::new_async().await;
        let primary = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(json!({"model": "gpt-4o"})))
            .with_status(500)
            .with_body(r#"{"error": {"message": "overloaded"}}"#)
            .expect(2)
            .create_async()
            .await;
        let fallback = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(json!({"model": "gpt-4o-mini"})))
            .with_status(200)
            .with_body(tool_response("Acme"))
            .create_async()
            .await;

        let extraction = extractor(&server)
            .extract(request("gpt-4o", vec![]))
            .await
            .unwrap()
            .unwrap();
        primary.assert_async().await;
        fallback.assert_async().await;
        assert_eq!(extraction.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_rejection_surfaces_after_fallback() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error": {"message": "Incorrect API key provided"}}"#)
            .create_async()
            .await;

        let err = extractor(&server)
            .extract(request("gpt-4o", vec![]))
            .await
            .unwrap_err();
        match err {
            Error::ExtractionRejected { status, message, .. } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Incorrect API key provided");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
