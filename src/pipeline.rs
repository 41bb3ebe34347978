use tracing::debug;

use crate::brain::Brain;
use crate::dom::MARKUP_MAX_CHARS;
use crate::error::Result;
use crate::executor::{Executor, PageTarget, SessionReport};

/// Runs one user prompt end to end: capture the page markup, ask the
/// provider for an instruction, execute it against the target.
///
/// The markup cleaner lives in the in-page helper, and a fresh tab (or a
/// navigation since the last request) has no helper yet, so the helper is
/// installed before the capture. Installation is marker-idempotent.
pub async fn run_request(
    brain: &Brain,
    executor: &Executor,
    target: &PageTarget,
    prompt: &str,
) -> Result<SessionReport> {
    target.dom.install().await?;
    let markup = target.dom.markup(MARKUP_MAX_CHARS).await?;
    debug!(chars = markup.len(), "captured page markup");
    let instruction = brain.instructions(prompt, &markup).await?;
    executor.execute(&instruction, Some(target)).await
}
