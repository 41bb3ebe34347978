//! Drive a live web page from natural-language requests.
//!
//! One request flows through four stages: the current page markup and the
//! user's prompt go to a chat-completion provider ([`brain`]), the reply is
//! unwrapped and validated into a single [`schema::Instruction`], and the
//! [`executor`] walks its actions in a fixed order against an agent injected
//! into the page ([`hands`] driving [`dom`]). A small web control page
//! ([`face`]) feeds prompts in and streams progress back out.

pub mod brain;
pub mod browser;
pub mod dom;
pub mod error;
pub mod executor;
pub mod extract;
pub mod face;
pub mod hands;
pub mod pipeline;
pub mod schema;
pub mod settings;
pub mod transport;

pub use brain::Brain;
pub use browser::BrowserSession;
pub use dom::{ChromeDom, MARKUP_MAX_CHARS, PageDom};
pub use error::{Error, Result};
pub use executor::{Executor, PageTarget, SessionReport};
pub use face::{UiEvent, UiSink, WebUi};
pub use hands::PageAgent;
pub use pipeline::run_request;
pub use schema::Instruction;
pub use settings::{FileStore, History, Settings, SettingsStore};
