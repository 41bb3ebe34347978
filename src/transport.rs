use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::schema::{ScrollBehavior, ScrollSpec};

/// Upper bound on one command round trip. Generous: selector resolution
/// alone may legitimately take its full 5s inside the agent.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// The closed set of commands a page agent answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentCommand {
    Ping,
    Click {
        selector: String,
    },
    Fill {
        selector: String,
        value: String,
    },
    Select {
        selector: String,
        value: String,
    },
    Scroll {
        #[serde(skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        behavior: Option<ScrollBehavior>,
        #[serde(skip_serializing_if = "Option::is_none")]
        top: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        left: Option<f64>,
    },
}

impl AgentCommand {
    pub fn scroll(spec: &ScrollSpec) -> AgentCommand {
        match spec {
            ScrollSpec::Element { selector, behavior } => AgentCommand::Scroll {
                selector: Some(selector.clone()),
                behavior: Some(*behavior),
                top: None,
                left: None,
            },
            ScrollSpec::Position { top, left } => AgentCommand::Scroll {
                selector: None,
                behavior: None,
                top: Some(*top),
                left: Some(*left),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentCommand::Ping => "ping",
            AgentCommand::Click { .. } => "click",
            AgentCommand::Fill { .. } => "fill",
            AgentCommand::Select { .. } => "select",
            AgentCommand::Scroll { .. } => "scroll",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn ok() -> AgentResponse {
        AgentResponse {
            success: true,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> AgentResponse {
        AgentResponse {
            success: false,
            error: Some(message.into()),
        }
    }
}

/// One command paired with the slot its single response must land in.
pub type CommandEnvelope = (AgentCommand, oneshot::Sender<AgentResponse>);

/// Request/response messaging into a page context: one command, at most one
/// response, one timeout per call. No ordering is guaranteed across
/// independent transports.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn send(&self, command: AgentCommand, timeout: Duration) -> Result<AgentResponse>;
}

/// Transport to an in-process page agent task. The oneshot reply channel
/// makes the at-most-one-response property structural.
#[derive(Clone)]
pub struct AgentChannel {
    tx: mpsc::Sender<CommandEnvelope>,
}

impl AgentChannel {
    pub fn new(tx: mpsc::Sender<CommandEnvelope>) -> AgentChannel {
        AgentChannel { tx }
    }

    /// False once the agent task has stopped serving.
    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[async_trait]
impl PageTransport for AgentChannel {
    async fn send(&self, command: AgentCommand, timeout: Duration) -> Result<AgentResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((command, reply_tx))
            .await
            .map_err(|_| Error::Transport("page agent channel is closed".into()))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport(
                "page agent dropped the reply channel".into(),
            )),
            Err(_) => Err(Error::Transport(format!(
                "no response from page agent within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}
