use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::Tab;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::ScrollBehavior;

/// Page markup sent to the provider is capped at this many characters.
pub const MARKUP_MAX_CHARS: usize = 10_000;

/// Primitive DOM verbs the page agent drives. Chrome devtools in
/// production, an in-memory fake in tests.
///
/// The `click`/`set_*`/`scroll_into_view` verbs return `false` when the
/// element is gone at action time; higher layers own the diagnostics.
#[async_trait]
pub trait PageDom: Send + Sync {
    /// Installs the in-page helper. Idempotent: a page-scoped marker keeps
    /// repeat installs from registering anything twice.
    async fn install(&self) -> Result<()>;
    /// True when the installed helper answers.
    async fn ping(&self) -> Result<bool>;
    async fn exists(&self, selector: &str) -> Result<bool>;
    async fn tag_name(&self, selector: &str) -> Result<Option<String>>;
    async fn click(&self, selector: &str) -> Result<bool>;
    /// Sets an input-like element's value, firing input and change so
    /// reactive UI layers observe it.
    async fn set_field_value(&self, selector: &str, value: &str) -> Result<bool>;
    /// Sets a select element's value, firing change.
    async fn set_select_value(&self, selector: &str, value: &str) -> Result<bool>;
    async fn scroll_into_view(&self, selector: &str, behavior: ScrollBehavior) -> Result<bool>;
    async fn scroll_to(&self, top: f64, left: f64, behavior: ScrollBehavior) -> Result<()>;
    /// Up to `limit` elements matching the base selector, each rendered as
    /// an opening tag with its attributes. Diagnostic text only.
    async fn similar_elements(&self, base: &str, limit: usize) -> Result<Vec<String>>;
    /// Resolves `true` on the next DOM subtree mutation, `false` once
    /// `max_wait` elapses without one.
    async fn next_mutation(&self, max_wait: Duration) -> Result<bool>;
    /// Cleaned page markup, truncated to `max_chars`.
    async fn markup(&self, max_chars: usize) -> Result<String>;
}

/// JavaScript installed into the page as the agent's in-page half.
///
/// The script:
///   1. Bails out early if `window.__autopage` already exists, so repeated
///      injection never registers a second observer or handler.
///   2. Exposes primitive verbs (exists/tagName/click/setValue/scroll).
///   3. `nextMutation(maxMs)` resolves once on the next subtree mutation,
///      or `false` on its own timer, so the Rust side never hangs on a
///      page that stays still.
///   4. `markup(maxChars)` clones the document, strips non-content nodes
///      (scripts, styles, frames, metadata links), comments, inline styles
///      and inline event handlers, collapses whitespace and truncates.
const AGENT_JS: &str = r#"
(() => {
  if (window.__autopage) return 'present';
  window.__autopage = {
    ping() { return true; },
    exists(sel) { return document.querySelector(sel) !== null; },
    tagName(sel) {
      const el = document.querySelector(sel);
      return el ? el.tagName.toLowerCase() : null;
    },
    click(sel) {
      const el = document.querySelector(sel);
      if (!el) return false;
      el.click();
      return true;
    },
    setValue(sel, value, fireInput) {
      const el = document.querySelector(sel);
      if (!el) return false;
      el.value = value;
      if (fireInput) el.dispatchEvent(new Event('input', { bubbles: true }));
      el.dispatchEvent(new Event('change', { bubbles: true }));
      return true;
    },
    scrollToElement(sel, behavior) {
      const el = document.querySelector(sel);
      if (!el) return false;
      el.scrollIntoView({ behavior: behavior, block: 'center' });
      return true;
    },
    scrollTo(top, left, behavior) {
      window.scrollTo({ top: top, left: left, behavior: behavior });
      return true;
    },
    similar(base, limit) {
      let matches = [];
      try { matches = document.querySelectorAll(base); } catch (e) { return '[]'; }
      const out = [];
      for (const el of matches) {
        if (out.length >= limit) break;
        const attrs = [...el.attributes].map(a => a.name + '="' + a.value + '"').join(' ');
        out.push('<' + el.tagName.toLowerCase() + (attrs ? ' ' + attrs : '') + '>');
      }
      return JSON.stringify(out);
    },
    nextMutation(maxMs) {
      return new Promise(resolve => {
        const timer = setTimeout(() => { observer.disconnect(); resolve(false); }, maxMs);
        const observer = new MutationObserver(() => {
          observer.disconnect();
          clearTimeout(timer);
          resolve(true);
        });
        observer.observe(document.body, { childList: true, subtree: true });
      });
    },
    markup(maxChars) {
      const root = document.documentElement.cloneNode(true);
      root.querySelectorAll(
        'script, style, noscript, iframe, object, embed, applet, meta, ' +
        'link[rel="stylesheet"], link[rel="preload"], link[rel="prefetch"]'
      ).forEach(n => n.remove());
      const comments = [];
      const walker = document.createTreeWalker(root, NodeFilter.SHOW_COMMENT);
      while (walker.nextNode()) comments.push(walker.currentNode);
      comments.forEach(c => c.remove());
      for (const el of root.querySelectorAll('*')) {
        el.removeAttribute('style');
        for (const a of [...el.attributes]) {
          if (a.name.startsWith('on')) el.removeAttribute(a.name);
        }
      }
      let html = root.outerHTML.replace(/\s+/g, ' ');
      if (html.length > maxChars) html = html.slice(0, maxChars) + '...';
      return html;
    },
  };
  return 'installed';
})()
"#;

/// [`PageDom`] over a Chrome tab. The devtools client is blocking, so every
/// evaluation runs under `spawn_blocking`.
pub struct ChromeDom {
    tab: Arc<Tab>,
}

impl ChromeDom {
    pub fn new(tab: Arc<Tab>) -> ChromeDom {
        ChromeDom { tab }
    }

    async fn eval(&self, js: String, await_promise: bool) -> Result<Value> {
        let tab = self.tab.clone();
        let object = tokio::task::spawn_blocking(move || tab.evaluate(&js, await_promise))
            .await
            .map_err(|e| Error::Page(format!("evaluation task failed: {e}")))?
            .map_err(|e| Error::Page(e.to_string()))?;
        Ok(object.value.unwrap_or(Value::Null))
    }

    async fn eval_found(&self, js: String) -> Result<bool> {
        Ok(self.eval(js, false).await?.as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl PageDom for ChromeDom {
    async fn install(&self) -> Result<()> {
        self.eval(AGENT_JS.to_string(), false).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<bool> {
        self.eval_found("window.__autopage ? window.__autopage.ping() : false".to_string())
            .await
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        self.eval_found(format!("window.__autopage.exists({})", js_str(selector)))
            .await
    }

    async fn tag_name(&self, selector: &str) -> Result<Option<String>> {
        let value = self
            .eval(
                format!("window.__autopage.tagName({})", js_str(selector)),
                false,
            )
            .await?;
        Ok(value.as_str().map(String::from))
    }

    async fn click(&self, selector: &str) -> Result<bool> {
        self.eval_found(format!("window.__autopage.click({})", js_str(selector)))
            .await
    }

    async fn set_field_value(&self, selector: &str, value: &str) -> Result<bool> {
        self.eval_found(format!(
            "window.__autopage.setValue({}, {}, true)",
            js_str(selector),
            js_str(value)
        ))
        .await
    }

    async fn set_select_value(&self, selector: &str, value: &str) -> Result<bool> {
        self.eval_found(format!(
            "window.__autopage.setValue({}, {}, false)",
            js_str(selector),
            js_str(value)
        ))
        .await
    }

    async fn scroll_into_view(&self, selector: &str, behavior: ScrollBehavior) -> Result<bool> {
        self.eval_found(format!(
            "window.__autopage.scrollToElement({}, {})",
            js_str(selector),
            js_str(behavior.as_str())
        ))
        .await
    }

    async fn scroll_to(&self, top: f64, left: f64, behavior: ScrollBehavior) -> Result<()> {
        self.eval(
            format!(
                "window.__autopage.scrollTo({top}, {left}, {})",
                js_str(behavior.as_str())
            ),
            false,
        )
        .await?;
        Ok(())
    }

    async fn similar_elements(&self, base: &str, limit: usize) -> Result<Vec<String>> {
        let value = self
            .eval(
                format!("window.__autopage.similar({}, {limit})", js_str(base)),
                false,
            )
            .await?;
        let Some(text) = value.as_str() else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(text).unwrap_or_default())
    }

    async fn next_mutation(&self, max_wait: Duration) -> Result<bool> {
        self.eval(
            format!(
                "window.__autopage.nextMutation({})",
                max_wait.as_millis().min(u128::from(u32::MAX))
            ),
            true,
        )
        .await
        .map(|v| v.as_bool().unwrap_or(false))
    }

    async fn markup(&self, max_chars: usize) -> Result<String> {
        let value = self
            .eval(format!("window.__autopage.markup({max_chars})"), false)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}

/// Renders a Rust string as a JS string literal, JSON escaping included.
fn js_str(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}
