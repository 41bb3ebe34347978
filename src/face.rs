use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::executor::ActionOutcome;
use crate::schema::MessageKind;
use crate::settings::{ProviderId, Settings, SettingsStore};

const PORT_RANGE: std::ops::Range<u16> = 3000..3010;
const EVENT_BUFFER: usize = 64;

/// Everything the pipeline reports to whoever is watching the control page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UiEvent {
    Ready,
    Thinking {
        prompt: String,
    },
    Message {
        message: String,
        kind: MessageKind,
    },
    ExtractedData {
        data: Vec<Value>,
        selector: String,
        attribute: Option<String>,
    },
    Completed {
        summary: String,
        outcomes: Vec<ActionOutcome>,
    },
    Failed {
        message: String,
    },
}

/// Fire-and-forget notification sink. Implementations must never block the
/// pipeline or report failure back into it.
pub trait UiSink: Send + Sync {
    fn notify(&self, event: UiEvent);
}

/// Browser-facing surface: serves the control page, streams events to it
/// over SSE, and accepts prompts and settings edits from it. Clones share
/// the same channels and store.
#[derive(Clone)]
pub struct WebUi {
    events: broadcast::Sender<UiEvent>,
    commands: mpsc::Sender<String>,
    store: Arc<dyn SettingsStore>,
}

impl WebUi {
    /// Returns the UI surface plus the receiving end of its prompt queue.
    pub fn new(store: Arc<dyn SettingsStore>) -> (Arc<WebUi>, mpsc::Receiver<String>) {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (commands, rx) = mpsc::channel(16);
        (
            Arc::new(WebUi {
                events,
                commands,
                store,
            }),
            rx,
        )
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index))
            .route("/events", get(events))
            .route("/command", post(command))
            .route("/settings", get(get_settings).post(put_settings))
            .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
            .with_state(self.clone())
    }

    /// Binds `port` when given, otherwise the first free port in the scan
    /// range, and serves the control page from a background task.
    pub async fn serve(&self, port: Option<u16>) -> Result<SocketAddr> {
        let listener = match port {
            Some(port) => TcpListener::bind(("127.0.0.1", port))
                .await
                .map_err(|e| Error::Configuration(format!("cannot bind port {port}: {e}")))?,
            None => bind_first_free().await?,
        };
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        let router = self.router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "control page server stopped");
            }
        });
        info!("control page on http://{addr}");
        Ok(addr)
    }
}

impl UiSink for WebUi {
    fn notify(&self, event: UiEvent) {
        // No subscribers is fine; the page may not be open yet.
        let _ = self.events.send(event);
    }
}

async fn bind_first_free() -> Result<TcpListener> {
    for port in PORT_RANGE {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(port, error = %e, "port busy"),
        }
    }
    Err(Error::Configuration(format!(
        "no free port between {} and {}",
        PORT_RANGE.start,
        PORT_RANGE.end - 1
    )))
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn events(
    State(ui): State<WebUi>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(ui.events.subscribe()).filter_map(|event| {
        let event = event.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    prompt: String,
}

async fn command(
    State(ui): State<WebUi>,
    Json(body): Json<CommandBody>,
) -> (StatusCode, Json<Value>) {
    let prompt = body.prompt.trim().to_string();
    if prompt.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "empty prompt"})));
    }
    match ui.commands.try_send(prompt) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"queued": true}))),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "a request is already running"})),
        ),
    }
}

async fn get_settings(State(ui): State<WebUi>) -> (StatusCode, Json<Value>) {
    match ui.store.load().await {
        Ok(settings) => (StatusCode::OK, Json(settings_view(&settings))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct SettingsPatch {
    provider: Option<String>,
    #[serde(rename = "openaiKey")]
    openai_key: Option<String>,
    #[serde(rename = "groqKey")]
    groq_key: Option<String>,
}

async fn put_settings(
    State(ui): State<WebUi>,
    Json(patch): Json<SettingsPatch>,
) -> (StatusCode, Json<Value>) {
    let mut settings = match ui.store.load().await {
        Ok(settings) => settings,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            );
        }
    };
    if let Some(provider) = &patch.provider {
        match ProviderId::parse(provider) {
            Some(parsed) => settings.provider = parsed,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("unknown provider: {provider}")})),
                );
            }
        }
    }
    if let Some(key) = patch.openai_key {
        settings.openai_key = Some(key).filter(|k| !k.is_empty());
    }
    if let Some(key) = patch.groq_key {
        settings.groq_key = Some(key).filter(|k| !k.is_empty());
    }
    match ui.store.save(&settings).await {
        Ok(()) => (StatusCode::OK, Json(settings_view(&settings))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

/// Settings as shown to the page: keys are reported as present/absent,
/// never echoed back.
fn settings_view(settings: &Settings) -> Value {
    json!({
        "provider": settings.provider.as_str(),
        "openaiKey": settings.openai_key.as_deref().is_some_and(|k| !k.is_empty()),
        "groqKey": settings.groq_key.as_deref().is_some_and(|k| !k.is_empty()),
    })
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>autopage</title>
<style>
  :root { color-scheme: dark; }
  body { font-family: system-ui, sans-serif; background: #101418; color: #e6e6e6;
         max-width: 720px; margin: 2rem auto; padding: 0 1rem; }
  h1 { font-size: 1.3rem; } h1 .dot { color: #e74c3c; } h1 .dot.on { color: #2ecc71; }
  form { display: flex; gap: .5rem; }
  input, select, button { font: inherit; border-radius: 6px; border: 1px solid #333;
         background: #1a2028; color: inherit; padding: .5rem .7rem; }
  input { flex: 1; }
  button { cursor: pointer; background: #2d6cdf; border-color: #2d6cdf; }
  button:disabled { opacity: .5; cursor: wait; }
  #log { list-style: none; padding: 0; }
  #log li { padding: .4rem .6rem; margin: .3rem 0; border-radius: 6px; background: #1a2028; }
  #log li.error { border-left: 3px solid #e74c3c; }
  #log li.warning { border-left: 3px solid #f1c40f; }
  #log li.success { border-left: 3px solid #2ecc71; }
  #log li.info { border-left: 3px solid #2d6cdf; }
  pre { background: #0b0e12; padding: .6rem; border-radius: 6px; overflow-x: auto; }
  details { margin-top: 2rem; } details div { display: flex; gap: .5rem; margin: .5rem 0; }
  label { width: 7rem; align-self: center; color: #9aa4af; }
</style>
</head>
<body>
<h1><span class="dot" id="dot">&#9679;</span> autopage</h1>
<form id="prompt-form">
  <input id="prompt" placeholder="Tell the page what to do..." autocomplete="off">
  <button id="send" type="submit">Send</button>
</form>
<ul id="log"></ul>
<details>
  <summary>Settings</summary>
  <div><label for="provider">Provider</label>
    <select id="provider"><option value="groq">Groq</option><option value="openai">OpenAI</option></select></div>
  <div><label for="openai-key">OpenAI key</label><input id="openai-key" type="password"></div>
  <div><label for="groq-key">Groq key</label><input id="groq-key" type="password"></div>
  <div><label></label><button id="save" type="button">Save</button></div>
</details>
<script>
  const log = document.getElementById('log');
  const send = document.getElementById('send');

  function line(text, kind) {
    const li = document.createElement('li');
    li.className = kind || 'info';
    li.textContent = text;
    log.prepend(li);
  }

  function render(ev) {
    if (ev.event === 'ready') { document.getElementById('dot').classList.add('on'); return; }
    if (ev.event === 'thinking') { send.disabled = true; line('Working on: ' + ev.prompt); return; }
    if (ev.event === 'message') { line(ev.message, ev.kind); return; }
    if (ev.event === 'completed') { send.disabled = false; line(ev.summary, 'success'); return; }
    if (ev.event === 'failed') { send.disabled = false; line(ev.message, 'error'); return; }
    if (ev.event === 'extracted_data') {
      const li = document.createElement('li');
      li.className = 'success';
      const pre = document.createElement('pre');
      pre.textContent = JSON.stringify(ev.data, null, 2);
      li.append('Extracted from ' + ev.selector + ':', pre);
      log.prepend(li);
    }
  }

  new EventSource('/events').onmessage = (e) => render(JSON.parse(e.data));

  document.getElementById('prompt-form').addEventListener('submit', async (e) => {
    e.preventDefault();
    const input = document.getElementById('prompt');
    const prompt = input.value.trim();
    if (!prompt) return;
    const res = await fetch('/command', {
      method: 'POST',
      headers: { 'Content-Type': 'application/json' },
      body: JSON.stringify({ prompt }),
    });
    if (res.ok) input.value = '';
    else line((await res.json()).error, 'error');
  });

  async function loadSettings() {
    const s = await (await fetch('/settings')).json();
    document.getElementById('provider').value = s.provider;
    document.getElementById('openai-key').placeholder = s.openaiKey ? 'saved' : 'not set';
    document.getElementById('groq-key').placeholder = s.groqKey ? 'saved' : 'not set';
  }

  document.getElementById('save').addEventListener('click', async () => {
    const patch = { provider: document.getElementById('provider').value };
    const openai = document.getElementById('openai-key').value.trim();
    const groq = document.getElementById('groq-key').value.trim();
    if (openai) patch.openaiKey = openai;
    if (groq) patch.groqKey = groq;
    await fetch('/settings', {
      method: 'POST',
      headers: { 'Content-Type': 'application/json' },
      body: JSON.stringify(patch),
    });
    document.getElementById('openai-key').value = '';
    document.getElementById('groq-key').value = '';
    loadSettings();
  });

  loadSettings();
</script>
</body>
</html>
"##;
