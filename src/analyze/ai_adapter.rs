//! AI adapter: chat-completion client abstraction + batch classification prompts.
//!
//! The HTTP client reads the `aiClassify` block from the live config on every
//! call, so key/model/base changes apply after a reload without rebuilding it.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

use crate::analyze::response::{parse_batch_response, BatchResults};
use crate::analyze::strip_html;
use crate::config::{AiClassifyConfig, Category, ClassifyStrategy, ConfigHandle};
use crate::ingest::types::Item;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a news classification assistant. \
Assign every article to exactly one category id from the list of available categories.";
const JSON_ONLY_SUFFIX: &str = "You must reply with strict JSON only. Do not use markdown.";

/// One chat exchange: system + user message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    /// Multiplier applied to the configured max tokens.
    pub token_factor: u32,
    /// Ask the backend for a JSON object response format.
    pub json_object: bool,
}

/// Chat-completion backend. Errors are transport or protocol failures; the
/// caller decides about retries.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, req: &ChatRequest) -> Result<String>;

    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str {
        "unknown"
    }
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    config: ConfigHandle,
}

impl OpenAiCompatClient {
    pub fn new(config: ConfigHandle) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("rss-curator/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building AI http client")?;
        Ok(Self { http, config })
    }
}

#[async_trait::async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn complete(&self, req: &ChatRequest) -> Result<String> {
        let cfg = self.config.current();
        let ai: &AiClassifyConfig = &cfg.ai_classify;
        if ai.effective_api_key().is_empty() {
            bail!("AI api key is not configured");
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct ResponseFormat {
            #[serde(rename = "type")]
            kind: &'static str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f64,
            max_tokens: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            response_format: Option<ResponseFormat>,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            choices: Vec<Choice>,
            #[serde(default)]
            error: Option<ApiError>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            #[serde(default)]
            content: String,
        }
        #[derive(Deserialize)]
        struct ApiError {
            #[serde(default)]
            message: String,
        }

        let body = Req {
            model: ai.model(),
            messages: vec![
                Msg {
                    role: "system",
                    content: &req.system,
                },
                Msg {
                    role: "user",
                    content: &req.user,
                },
            ],
            temperature: ai.temperature(),
            max_tokens: ai.max_tokens().saturating_mul(req.token_factor.max(1)),
            response_format: req.json_object.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let url = format!("{}/chat/completions", ai.api_base());
        let resp = self
            .http
            .post(&url)
            .bearer_auth(ai.effective_api_key())
            .timeout(ai.timeout())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = resp.status();
        let text = resp.text().await.context("reading AI response body")?;
        let parsed: Resp = serde_json::from_str(&text).with_context(|| {
            let preview: String = text.chars().take(200).collect();
            format!("decoding AI response (status {status}): {preview}")
        })?;
        if let Some(err) = parsed.error {
            bail!("AI api error (status {status}): {}", err.message);
        }
        if !status.is_success() {
            bail!("AI api returned status {status}");
        }
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            bail!("AI api returned no content");
        }
        Ok(content)
    }

    fn provider_name(&self) -> &'static str {
        "openai-compatible"
    }
}

/// "Title:" line plus the HTML-stripped description capped at `max_desc` chars.
pub fn build_item_content(item: &Item, max_desc: usize) -> String {
    let mut out = format!("Title: {}\n", item.title);
    if !item.description.is_empty() {
        let mut desc = strip_html(&item.description);
        if desc.chars().count() > max_desc {
            desc = desc.chars().take(max_desc).collect();
            desc.push_str("...");
        }
        let _ = write!(out, "Content: {desc}");
    }
    out
}

/// The system prompt: strategy prompt, else global prompt, else the default,
/// followed by the JSON-only instruction and the category list.
pub fn system_prompt(ai: &AiClassifyConfig, strategy: &ClassifyStrategy, categories: &[Category]) -> String {
    let base = if !strategy.custom_prompt.trim().is_empty() {
        strategy.custom_prompt.as_str()
    } else if !ai.system_prompt.trim().is_empty() {
        ai.system_prompt.as_str()
    } else {
        DEFAULT_SYSTEM_PROMPT
    };
    let mut out = format!("{base}\n\n{JSON_ONLY_SUFFIX}\n\nAvailable categories:\n");
    for c in categories {
        let _ = writeln!(out, "- {} ({}): {}", c.id, c.name, c.description);
    }
    out
}

/// Request for one batch. Keys are the items' indices in the update's list.
pub fn build_batch_request(
    batch: &[(usize, &Item)],
    categories: &[Category],
    ai: &AiClassifyConfig,
    strategy: &ClassifyStrategy,
) -> ChatRequest {
    let mut user = String::from(
        "Classify the following articles.\n\
         Return a JSON object whose keys are the article ids (strings) and whose values are the best matching category id (string).\n\
         Articles:\n\n",
    );
    let mut sorted: Vec<&(usize, &Item)> = batch.iter().collect();
    sorted.sort_by_key(|(idx, _)| *idx);
    for (idx, item) in sorted {
        let _ = writeln!(user, "--- Article ID: {idx} ---");
        user.push_str(&build_item_content(item, ai.max_desc_length()));
        user.push_str("\n\n");
    }
    ChatRequest {
        system: system_prompt(ai, strategy, categories),
        user,
        token_factor: 2,
        json_object: true,
    }
}

/// One attempt: call the backend and decode the reply.
pub async fn classify_batch(client: &dyn ChatClient, req: &ChatRequest) -> Result<BatchResults> {
    let content = client.complete(req).await?;
    let (shape, results) = parse_batch_response(&content)?;
    tracing::debug!(target: "classify", ?shape, entries = results.len(), "batch reply decoded");
    Ok(results)
}

/// `attempts` tries with a fixed `wait` between them.
pub async fn classify_batch_with_retry(
    client: &dyn ChatClient,
    req: &ChatRequest,
    attempts: u32,
    wait: Duration,
) -> Result<BatchResults> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match classify_batch(client, req).await {
            Ok(r) => return Ok(r),
            Err(e) if attempt < attempts => {
                tracing::warn!(target: "classify", attempt, attempts, error = %e, "batch classification failed; retrying");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("batch classification failed after {attempts} attempts"))),
        }
    }
}
