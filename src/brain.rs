use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::dom::MARKUP_MAX_CHARS;
use crate::error::{Error, Result};
use crate::extract;
use crate::schema::Instruction;
use crate::settings::{ProviderId, SettingsStore};

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const GROQ_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

const OPENAI_MODEL: &str = "gpt-3.5-turbo";
const GROQ_MODEL: &str = "gemma2-9b-it";

const TEMPERATURE: f64 = 0.7;
const MAX_TOKENS: u32 = 500;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(1000);

const SYSTEM_PROMPT: &str = r#"You are a web page automation assistant. You receive the HTML of the current page and a user request, and you reply with a single JSON object describing what to do.

The JSON object may contain any of these fields:
- "click": a CSS selector for the element to click.
- "fill": {"selector": "...", "value": "..."} to type into an input or textarea.
- "select": {"selector": "...", "value": "..."} to choose an option of a <select> element.
- "scroll": {"selector": "...", "behavior": "smooth"} to bring an element into view, or {"top": 0, "left": 0} for absolute coordinates.
- "wait": a number of milliseconds to pause before finishing.
- "display": {"message": "...", "type": "info" | "warning" | "error" | "success"} to show the user a message.
- "extract": {"selector": "...", "attribute": "...", "multiple": true, "data": [...]} where "data" holds the values you read out of the HTML.
- "error": a plain-language explanation, used ONLY when the request cannot be fulfilled on this page.

Rules:
1. Use CSS selectors that exist in the provided HTML. Prefer ids, then names, then stable class names.
2. Combine fields only when the request genuinely needs several steps.
3. For extraction requests, read the values out of the HTML yourself and put them in "data".
4. If the request cannot be fulfilled, set "error" and nothing else.
5. Reply with nothing but the JSON object inside a ```json code fence."#;

/// Chat-completion client. Turns a user request plus page markup into a
/// validated [`Instruction`].
pub struct Brain {
    client: reqwest::Client,
    store: Arc<dyn SettingsStore>,
    api_base: Option<String>,
    retry_base: Duration,
}

impl Brain {
    pub fn new(store: Arc<dyn SettingsStore>) -> Result<Brain> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Provider(e.to_string()))?;
        Ok(Brain {
            client,
            store,
            api_base: None,
            retry_base: RETRY_BASE,
        })
    }

    /// Routes every provider call to `api_base` instead of the provider's
    /// public endpoint. Useful for proxies and loopback servers.
    pub fn with_api_base(store: Arc<dyn SettingsStore>, api_base: impl Into<String>) -> Result<Brain> {
        let mut brain = Brain::new(store)?;
        brain.api_base = Some(api_base.into());
        Ok(brain)
    }

    /// Asks the configured provider for an instruction answering `prompt`
    /// against `markup`.
    ///
    /// Settings are re-read on every call, so a provider or key change
    /// takes effect immediately. The network call is the only retried
    /// step; a reply that fails to parse or validate is final.
    pub async fn instructions(&self, prompt: &str, markup: &str) -> Result<Instruction> {
        let settings = self.store.load().await?;
        let key = settings.credential()?.to_string();
        let endpoint = self.endpoint(settings.provider);
        let body = request_body(settings.provider, prompt, &cap_markup(markup));

        debug!(provider = settings.provider.as_str(), "requesting instructions");
        let raw = self.complete(&endpoint, &key, &body).await?;
        let payload = extract::payload(&raw)?;
        Instruction::validate(&payload)
    }

    fn endpoint(&self, provider: ProviderId) -> String {
        match &self.api_base {
            Some(base) => format!("{}/chat/completions", base.trim_end_matches('/')),
            None => match provider {
                ProviderId::OpenAi => OPENAI_URL.to_string(),
                ProviderId::Groq => GROQ_URL.to_string(),
            },
        }
    }

    async fn complete(&self, endpoint: &str, key: &str, body: &Value) -> Result<String> {
        let mut last_failure = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.call_once(endpoint, key, body).await? {
                CallOutcome::Content(content) => return Ok(content),
                CallOutcome::Retry(reason) => {
                    warn!(attempt, reason = %reason, "provider attempt failed");
                    last_failure = reason;
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(self.retry_base * attempt).await;
            }
        }
        Err(Error::Provider(format!(
            "no usable response after {MAX_ATTEMPTS} attempts: {last_failure}"
        )))
    }

    async fn call_once(&self, endpoint: &str, key: &str, body: &Value) -> Result<CallOutcome> {
        let response = match self
            .client
            .post(endpoint)
            .bearer_auth(key)
            .json(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(CallOutcome::Retry(e.to_string())),
        };
        let status = response.status();
        let payload: Value = match response.json().await {
            Ok(payload) => payload,
            Err(e) => return Ok(CallOutcome::Retry(format!("unreadable response body: {e}"))),
        };

        // A well-formed error payload is the provider's final answer, no
        // matter how many attempts remain.
        if let Some(message) = provider_error(&payload) {
            return Err(Error::Provider(message));
        }
        if !status.is_success() {
            return Ok(CallOutcome::Retry(format!("provider returned HTTP {status}")));
        }
        match content_from(&payload) {
            Some(content) => Ok(CallOutcome::Content(content.to_string())),
            None => Ok(CallOutcome::Retry("response had no message content".into())),
        }
    }
}

enum CallOutcome {
    Content(String),
    Retry(String),
}

fn request_body(provider: ProviderId, prompt: &str, markup: &str) -> Value {
    let model = match provider {
        ProviderId::OpenAi => OPENAI_MODEL,
        ProviderId::Groq => GROQ_MODEL,
    };
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": SYSTEM_PROMPT},
            {"role": "user", "content": format!("Website HTML: {markup}\n\nUser Request: {prompt}")},
        ],
        "temperature": TEMPERATURE,
        "max_tokens": MAX_TOKENS,
    })
}

fn content_from(payload: &Value) -> Option<&str> {
    payload["choices"][0]["message"]["content"].as_str()
}

fn provider_error(payload: &Value) -> Option<String> {
    Some(payload.get("error")?.get("message")?.as_str()?.to_string())
}

fn cap_markup(markup: &str) -> String {
    let mut capped: String = markup.chars().take(MARKUP_MAX_CHARS).collect();
    if capped.len() < markup.len() {
        capped.push_str("...");
    }
    capped
}
