use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const DEBUG_ENDPOINT: &str = "http://127.0.0.1:9222";

/// Left generous so the session survives long gaps between user requests.
const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Persistent browser session. Created once, reused for every request.
///
/// All methods block on the DevTools connection; call them through
/// `spawn_blocking` from async code.
pub struct BrowserSession {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl BrowserSession {
    /// Connects to a Chrome already listening for DevTools clients, or
    /// launches one with its own profile when none is reachable.
    ///
    /// An explicit `attach` endpoint must be reachable; without one, the
    /// default debug port is tried before falling back to a launch.
    pub fn open(headless: bool, attach: Option<&str>) -> Result<BrowserSession> {
        if let Some(endpoint) = attach {
            let browser = Browser::connect(endpoint.to_string())
                .map_err(|e| Error::Page(format!("cannot attach to {endpoint}: {e}")))?;
            info!("attached to chrome on {endpoint}");
            return BrowserSession::from_browser(browser);
        }

        match Browser::connect(DEBUG_ENDPOINT.to_string()) {
            Ok(browser) => {
                info!("attached to chrome on {DEBUG_ENDPOINT}");
                return BrowserSession::from_browser(browser);
            }
            Err(e) => debug!(error = %e, "no chrome on the debug port, launching"),
        }

        let options = LaunchOptions {
            headless,
            user_data_dir: Some(profile_dir()?),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: IDLE_TIMEOUT,
            ..Default::default()
        };
        let browser =
            Browser::new(options).map_err(|e| Error::Page(format!("browser launch failed: {e}")))?;
        let tab = browser.new_tab().map_err(|e| Error::Page(e.to_string()))?;
        tab.navigate_to("about:blank")
            .map_err(|e| Error::Page(e.to_string()))?;
        info!("browser ready");
        Ok(BrowserSession {
            _browser: browser,
            tab,
        })
    }

    fn from_browser(browser: Browser) -> Result<BrowserSession> {
        let existing = {
            let tabs = browser.get_tabs();
            let tabs = tabs
                .lock()
                .map_err(|_| Error::Page("tab registry poisoned".into()))?;
            tabs.first().cloned()
        };
        let tab = match existing {
            Some(tab) => tab,
            None => {
                warn!("attached browser has no tabs, opening one");
                browser.new_tab().map_err(|e| Error::Page(e.to_string()))?
            }
        };
        Ok(BrowserSession {
            _browser: browser,
            tab,
        })
    }

    pub fn tab(&self) -> Arc<Tab> {
        self.tab.clone()
    }

    /// Points the session at `url` and waits for the document to load.
    pub fn navigate(&self, url: &str) -> Result<()> {
        self.tab
            .navigate_to(url)
            .map_err(|e| Error::Page(e.to_string()))?;
        self.tab
            .wait_until_navigated()
            .map_err(|e| Error::Page(e.to_string()))?;
        Ok(())
    }
}

fn profile_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| Error::Configuration("no user config directory".into()))?
        .join("autopage")
        .join("browser-profile");
    std::fs::create_dir_all(&dir).map_err(|e| Error::Configuration(e.to_string()))?;
    Ok(dir)
}
