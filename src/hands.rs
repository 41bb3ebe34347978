use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dom::PageDom;
use crate::error::{Error, Result};
use crate::schema::ScrollBehavior;
use crate::transport::{AgentChannel, AgentCommand, AgentResponse, CommandEnvelope};

/// Default bound on selector resolution.
pub const SELECTOR_TIMEOUT: Duration = Duration::from_millis(5000);

/// Diagnostic examples attached to a not-found failure.
const SIMILAR_SAMPLES: usize = 3;

/// The page agent's serve half: answers transport commands one at a time
/// against the page backend. Every handler failure becomes a structured
/// `{success: false, error}` response; the loop itself never dies on one.
pub struct PageAgent {
    dom: Arc<dyn PageDom>,
    selector_timeout: Duration,
}

impl PageAgent {
    /// Spawns the serve loop and returns its transport handle.
    pub fn attach(dom: Arc<dyn PageDom>) -> AgentChannel {
        PageAgent::attach_with_timeout(dom, SELECTOR_TIMEOUT)
    }

    pub fn attach_with_timeout(dom: Arc<dyn PageDom>, selector_timeout: Duration) -> AgentChannel {
        let (tx, rx) = mpsc::channel(16);
        let agent = PageAgent {
            dom,
            selector_timeout,
        };
        tokio::spawn(agent.serve(rx));
        AgentChannel::new(tx)
    }

    async fn serve(self, mut rx: mpsc::Receiver<CommandEnvelope>) {
        while let Some((command, reply)) = rx.recv().await {
            let kind = command.kind();
            let response = match self.handle(command).await {
                Ok(()) => AgentResponse::ok(),
                Err(e) => AgentResponse::failed(e.to_string()),
            };
            if let Some(error) = &response.error {
                debug!(command = kind, error, "command failed");
            }
            if reply.send(response).is_err() {
                warn!(command = kind, "reply slot dropped before the response");
            }
        }
        debug!("page agent stopped");
    }

    async fn handle(&self, command: AgentCommand) -> Result<()> {
        match command {
            AgentCommand::Ping => {
                if self.dom.ping().await? {
                    Ok(())
                } else {
                    Err(Error::Page("in-page helper is not responding".into()))
                }
            }
            AgentCommand::Click { selector } => self.click(&selector).await,
            AgentCommand::Fill { selector, value } => self.fill(&selector, &value).await,
            AgentCommand::Select { selector, value } => self.select(&selector, &value).await,
            AgentCommand::Scroll {
                selector,
                behavior,
                top,
                left,
            } => self.scroll(selector, behavior, top, left).await,
        }
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.resolve(selector).await?;
        if !self.dom.click(selector).await? {
            return Err(self.not_found(selector).await);
        }
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<()> {
        self.resolve(selector).await?;
        if !self.dom.set_field_value(selector, value).await? {
            return Err(self.not_found(selector).await);
        }
        Ok(())
    }

    async fn select(&self, selector: &str, value: &str) -> Result<()> {
        self.resolve(selector).await?;
        match self.dom.tag_name(selector).await? {
            Some(tag) if tag.eq_ignore_ascii_case("select") => {}
            Some(tag) => {
                return Err(Error::ElementTypeMismatch {
                    selector: selector.to_string(),
                    actual: tag,
                });
            }
            None => return Err(self.not_found(selector).await),
        }
        if !self.dom.set_select_value(selector, value).await? {
            return Err(self.not_found(selector).await);
        }
        Ok(())
    }

    async fn scroll(
        &self,
        selector: Option<String>,
        behavior: Option<ScrollBehavior>,
        top: Option<f64>,
        left: Option<f64>,
    ) -> Result<()> {
        let behavior = behavior.unwrap_or_default();
        match selector {
            Some(selector) => {
                self.resolve(&selector).await?;
                if !self.dom.scroll_into_view(&selector, behavior).await? {
                    return Err(self.not_found(&selector).await);
                }
                Ok(())
            }
            None => {
                self.dom
                    .scroll_to(top.unwrap_or(0.0), left.unwrap_or(0.0), behavior)
                    .await
            }
        }
    }

    /// Resolves `selector`: immediately when it already matches, otherwise
    /// by waking on subtree mutations until the deadline. Not a poll loop;
    /// between mutations this does no work.
    async fn resolve(&self, selector: &str) -> Result<()> {
        if self.dom.exists(selector).await? {
            return Ok(());
        }
        debug!(selector, "waiting for selector");
        let deadline = Instant::now() + self.selector_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.not_found(selector).await);
            }
            let mutated = self.dom.next_mutation(remaining).await?;
            if self.dom.exists(selector).await? {
                return Ok(());
            }
            if !mutated {
                return Err(self.not_found(selector).await);
            }
        }
    }

    async fn not_found(&self, selector: &str) -> Error {
        let samples = self
            .dom
            .similar_elements(base_tag(selector), SIMILAR_SAMPLES)
            .await
            .unwrap_or_default();
        Error::ElementNotFound {
            selector: selector.to_string(),
            samples,
        }
    }
}

/// `input[name="q"]` diagnoses against `input`; selectors without an
/// attribute part diagnose against themselves.
fn base_tag(selector: &str) -> &str {
    selector.split('[').next().unwrap_or(selector)
}
