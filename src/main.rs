use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::spawn_blocking;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use autopage::brain::Brain;
use autopage::browser::BrowserSession;
use autopage::dom::ChromeDom;
use autopage::executor::{Executor, PageTarget};
use autopage::face::{UiEvent, UiSink, WebUi};
use autopage::pipeline::run_request;
use autopage::settings::{FileStore, History, SettingsStore};

/// Drive a live web page from natural-language requests.
#[derive(Debug, Parser)]
#[command(name = "autopage", version, about)]
struct Args {
    /// Run the launched browser without a visible window.
    #[arg(long)]
    headless: bool,

    /// Attach to a running Chrome DevTools endpoint instead of launching.
    #[arg(long, value_name = "URL")]
    attach: Option<String>,

    /// Navigate to this page once the browser is ready.
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Fixed port for the control page (default: first free in 3000-3009).
    #[arg(long)]
    port: Option<u16>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let store: Arc<dyn SettingsStore> = Arc::new(FileStore::new(FileStore::default_path()?));
    let history = History::new(History::default_path()?);

    let (ui, mut commands) = WebUi::new(store.clone());
    ui.serve(args.port).await?;

    let headless = args.headless;
    let attach = args.attach.clone();
    let session = spawn_blocking(move || BrowserSession::open(headless, attach.as_deref()))
        .await
        .context("browser task panicked")??;
    let session = Arc::new(session);

    if let Some(url) = args.url.clone() {
        let session = session.clone();
        info!(%url, "opening start page");
        spawn_blocking(move || session.navigate(&url))
            .await
            .context("navigation task panicked")??;
    }

    let target = PageTarget::new("main", Arc::new(ChromeDom::new(session.tab())));
    let brain = Brain::new(store)?;
    let executor = Executor::new(ui.clone());

    ui.notify(UiEvent::Ready);
    info!("ready for requests");

    while let Some(prompt) = commands.recv().await {
        ui.notify(UiEvent::Thinking {
            prompt: prompt.clone(),
        });
        match run_request(&brain, &executor, &target, &prompt).await {
            Ok(report) => {
                let summary = report.summary();
                ui.notify(UiEvent::Completed {
                    summary: summary.clone(),
                    outcomes: report.outcomes,
                });
                record(&history, &prompt, &summary);
            }
            Err(e) => {
                let message = e.to_string();
                warn!(error = %message, "request failed");
                ui.notify(UiEvent::Failed {
                    message: message.clone(),
                });
                record(&history, &prompt, &message);
            }
        }
    }
    Ok(())
}

fn record(history: &History, prompt: &str, outcome: &str) {
    if let Err(e) = history.append(prompt, outcome) {
        warn!(error = %e, "could not record history");
    }
}
