use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dom::PageDom;
use crate::error::{Error, Result};
use crate::face::{UiEvent, UiSink};
use crate::hands::{PageAgent, SELECTOR_TIMEOUT};
use crate::schema::{ACTION_ORDER, ActionKind, Instruction, ScrollSpec};
use crate::transport::{AgentChannel, AgentCommand, COMMAND_TIMEOUT, PageTransport};

/// Pause between injecting the agent and probing it, so its listener has
/// time to register.
pub const SETTLE_INTERVAL: Duration = Duration::from_millis(500);

/// Bound on one handshake ping round trip.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// One page context a session can run against.
#[derive(Clone)]
pub struct PageTarget {
    pub id: String,
    pub dom: Arc<dyn PageDom>,
}

impl PageTarget {
    pub fn new(id: impl Into<String>, dom: Arc<dyn PageDom>) -> PageTarget {
        PageTarget {
            id: id.into(),
            dom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    HandshakePending,
    Dispatching(usize),
    Completed,
    Failed,
}

/// One acknowledged action, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub action: ActionKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub target: String,
    pub outcomes: Vec<ActionOutcome>,
}

impl SessionReport {
    pub fn summary(&self) -> String {
        match self.outcomes.len() {
            0 => "no page actions to run".to_string(),
            1 => "1 action completed".to_string(),
            n => format!("{n} actions completed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorTimings {
    pub settle: Duration,
    pub ping_timeout: Duration,
    pub command_timeout: Duration,
    pub selector_timeout: Duration,
}

impl Default for ExecutorTimings {
    fn default() -> ExecutorTimings {
        ExecutorTimings {
            settle: SETTLE_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
            selector_timeout: SELECTOR_TIMEOUT,
        }
    }
}

/// Drives validated instructions to a terminal outcome: forwards UI
/// notifications, establishes a live page agent per target, then walks the
/// action fields strictly in order, failing fast on the first rejection.
pub struct Executor {
    ui: Arc<dyn UiSink>,
    agents: Mutex<HashMap<String, AgentChannel>>,
    timings: ExecutorTimings,
}

impl Executor {
    pub fn new(ui: Arc<dyn UiSink>) -> Executor {
        Executor::with_timings(ui, ExecutorTimings::default())
    }

    pub fn with_timings(ui: Arc<dyn UiSink>, timings: ExecutorTimings) -> Executor {
        Executor {
            ui,
            agents: Mutex::new(HashMap::new()),
            timings,
        }
    }

    /// Runs one instruction as one session. Sessions are never resumed or
    /// retried as a whole: the first rejection is the final word.
    pub async fn execute(
        &self,
        instruction: &Instruction,
        target: Option<&PageTarget>,
    ) -> Result<SessionReport> {
        let target = target.ok_or_else(|| {
            Error::Configuration("no target page context for this session".into())
        })?;

        let mut state = SessionState::NotStarted;
        let result = self.run_session(instruction, target, &mut state).await;
        match &result {
            Ok(report) => {
                info!(target = %target.id, actions = report.outcomes.len(), "session completed");
            }
            Err(e) => {
                advance(&mut state, SessionState::Failed);
                warn!(target = %target.id, error = %e, "session failed");
            }
        }
        result
    }

    async fn run_session(
        &self,
        instruction: &Instruction,
        target: &PageTarget,
        state: &mut SessionState,
    ) -> Result<SessionReport> {
        if let Some(display) = &instruction.display {
            self.ui.notify(UiEvent::Message {
                message: display.message.clone(),
                kind: display.kind,
            });
        }
        if let Some(extract) = &instruction.extract
            && !extract.data.is_empty()
        {
            self.ui.notify(UiEvent::ExtractedData {
                data: extract.data.clone(),
                selector: extract.selector.clone(),
                attribute: extract.attribute.clone(),
            });
        }

        // Only page-crossing actions need a live agent; a wait-only or
        // notification-only instruction never touches the target.
        let transport = if instruction.has_page_actions() {
            advance(state, SessionState::HandshakePending);
            Some(self.ensure_agent(target).await?)
        } else {
            None
        };

        let mut outcomes: Vec<ActionOutcome> = Vec::new();
        for kind in ACTION_ORDER {
            let detail = match kind {
                ActionKind::Click => {
                    let Some(selector) = &instruction.click else {
                        continue;
                    };
                    advance(state, SessionState::Dispatching(outcomes.len()));
                    self.dispatch(
                        transport.as_ref(),
                        kind,
                        AgentCommand::Click {
                            selector: selector.clone(),
                        },
                    )
                    .await?;
                    format!("clicked {selector}")
                }
                ActionKind::Fill => {
                    let Some(fill) = &instruction.fill else {
                        continue;
                    };
                    advance(state, SessionState::Dispatching(outcomes.len()));
                    self.dispatch(
                        transport.as_ref(),
                        kind,
                        AgentCommand::Fill {
                            selector: fill.selector.clone(),
                            value: fill.value.clone(),
                        },
                    )
                    .await?;
                    format!("filled {}", fill.selector)
                }
                ActionKind::Select => {
                    let Some(select) = &instruction.select else {
                        continue;
                    };
                    advance(state, SessionState::Dispatching(outcomes.len()));
                    self.dispatch(
                        transport.as_ref(),
                        kind,
                        AgentCommand::Select {
                            selector: select.selector.clone(),
                            value: select.value.clone(),
                        },
                    )
                    .await?;
                    format!("selected {} in {}", select.value, select.selector)
                }
                ActionKind::Scroll => {
                    let Some(scroll) = &instruction.scroll else {
                        continue;
                    };
                    advance(state, SessionState::Dispatching(outcomes.len()));
                    self.dispatch(transport.as_ref(), kind, AgentCommand::scroll(scroll))
                        .await?;
                    match scroll {
                        ScrollSpec::Element { selector, .. } => format!("scrolled to {selector}"),
                        ScrollSpec::Position { top, left } => {
                            format!("scrolled to ({top}, {left})")
                        }
                    }
                }
                ActionKind::Wait => {
                    let Some(ms) = instruction.wait else {
                        continue;
                    };
                    advance(state, SessionState::Dispatching(outcomes.len()));
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    format!("waited {ms}ms")
                }
            };
            outcomes.push(ActionOutcome {
                action: kind,
                detail,
            });
        }

        advance(state, SessionState::Completed);
        Ok(SessionReport {
            target: target.id.clone(),
            outcomes,
        })
    }

    async fn dispatch(
        &self,
        transport: Option<&AgentChannel>,
        action: ActionKind,
        command: AgentCommand,
    ) -> Result<()> {
        let transport = transport.ok_or_else(|| {
            Error::Transport("page agent not attached for this session".into())
        })?;
        debug!(action = action.name(), "dispatching");
        let response = transport
            .send(command, self.timings.command_timeout)
            .await
            .map_err(|e| Error::Action {
                action: action.name(),
                reason: e.to_string(),
            })?;
        if response.success {
            Ok(())
        } else {
            Err(Error::Action {
                action: action.name(),
                reason: response.error.unwrap_or_else(|| "unknown error".into()),
            })
        }
    }

    /// Returns a live agent handle for `target`, reusing a registered one
    /// when possible so repeated sessions never stack up listeners.
    ///
    /// An open channel only proves the agent task is alive: a navigation
    /// wipes the in-page helper without closing the channel. A registered
    /// handle is therefore re-verified with a bounded ping, and on a
    /// negative answer falls through to the full handshake (inject →
    /// settle → ping, repeated exactly once more on failure) over the
    /// same channel. Injection is marker-idempotent.
    ///
    /// The registry lock is scoped to the lookup and the insert so that
    /// handshakes for unrelated targets never wait on each other.
    async fn ensure_agent(&self, target: &PageTarget) -> Result<AgentChannel> {
        let existing = {
            let mut agents = self.agents.lock().await;
            match agents.get(&target.id) {
                Some(channel) if channel.is_live() => Some(channel.clone()),
                Some(_) => {
                    agents.remove(&target.id);
                    None
                }
                None => None,
            }
        };

        if let Some(channel) = &existing {
            match channel
                .send(AgentCommand::Ping, self.timings.ping_timeout)
                .await
            {
                Ok(response) if response.success => {
                    debug!(target = %target.id, "reusing live page agent");
                    return Ok(channel.clone());
                }
                _ => {
                    debug!(target = %target.id, "registered agent did not answer, handshaking again");
                }
            }
        }

        let transport = match existing {
            Some(channel) => channel,
            None => {
                PageAgent::attach_with_timeout(target.dom.clone(), self.timings.selector_timeout)
            }
        };
        let mut last_failure = String::new();
        for attempt in 1..=2u32 {
            if let Err(e) = target.dom.install().await {
                last_failure = e.to_string();
                warn!(target = %target.id, attempt, error = %last_failure, "agent injection failed");
                continue;
            }
            tokio::time::sleep(self.timings.settle).await;
            match transport
                .send(AgentCommand::Ping, self.timings.ping_timeout)
                .await
            {
                Ok(response) if response.success => {
                    debug!(target = %target.id, attempt, "handshake succeeded");
                    let mut agents = self.agents.lock().await;
                    agents.insert(target.id.clone(), transport.clone());
                    return Ok(transport);
                }
                Ok(response) => {
                    last_failure = response.error.unwrap_or_else(|| "ping rejected".into());
                }
                Err(e) => last_failure = e.to_string(),
            }
            warn!(target = %target.id, attempt, error = %last_failure, "handshake ping failed");
        }
        Err(Error::AgentUnreachable(format!(
            "handshake failed after 2 attempts: {last_failure}"
        )))
    }
}

fn advance(state: &mut SessionState, next: SessionState) {
    debug!(from = ?state, to = ?next, "session state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    use serde_json::json;

    use super::*;
    use crate::dom::fake::{FakeElement, FakePage};
    use crate::schema::MessageKind;

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<UiEvent>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<UiEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl UiSink for RecordingSink {
        fn notify(&self, event: UiEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn harness(page: &FakePage) -> (Executor, Arc<RecordingSink>, PageTarget) {
        let sink = Arc::new(RecordingSink::default());
        let executor = Executor::with_timings(
            sink.clone(),
            ExecutorTimings {
                settle: Duration::from_millis(5),
                ping_timeout: Duration::from_millis(250),
                command_timeout: Duration::from_secs(2),
                selector_timeout: Duration::from_millis(60),
            },
        );
        let target = PageTarget::new("tab-1", Arc::new(page.clone()));
        (executor, sink, target)
    }

    fn instruction(value: serde_json::Value) -> Instruction {
        Instruction::validate(&value).unwrap()
    }

    #[tokio::test]
    async fn missing_target_is_a_configuration_error() {
        let page = FakePage::new();
        let (executor, _, _) = harness(&page);
        let err = executor
            .execute(&instruction(json!({"click": "#a"})), None)
            .await
            .unwrap_err();
        match err {
            Error::Configuration(_) => {}
            other => panic!("expected configuration error, got {other:?}"),
        }
        assert_eq!(page.install_count(), 0);
    }

    #[tokio::test]
    async fn fixed_order_runs_click_before_wait() {
        let page = FakePage::new().with_element("#a", FakeElement::new("button"));
        let (executor, _, target) = harness(&page);
        let started = Instant::now();
        let report = executor
            .execute(&instruction(json!({"wait": 100, "click": "#a"})), Some(&target))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        let kinds: Vec<ActionKind> = report.outcomes.iter().map(|o| o.action).collect();
        assert_eq!(kinds, vec![ActionKind::Click, ActionKind::Wait]);
        assert_eq!(page.actions(), vec!["click #a"]);
    }

    #[tokio::test]
    async fn fill_rejection_fails_fast_and_skips_the_rest() {
        let page = FakePage::new()
            .with_element("#country", FakeElement::new("select"))
            .with_element("#footer", FakeElement::new("div"));
        let (executor, _, target) = harness(&page);
        let err = executor
            .execute(
                &instruction(json!({
                    "fill": {"selector": "#missing", "value": "x"},
                    "select": {"selector": "#country", "value": "NZ"},
                    "scroll": {"selector": "#footer"},
                    "wait": 50,
                })),
                Some(&target),
            )
            .await
            .unwrap_err();
        match err {
            Error::Action { action, reason } => {
                assert_eq!(action, "fill");
                assert!(reason.contains("element not found"));
            }
            other => panic!("expected action error, got {other:?}"),
        }
        assert!(page.actions().is_empty());
    }

    #[tokio::test]
    async fn handshake_retries_once_and_proceeds() {
        let page = FakePage::new().with_element("#a", FakeElement::new("button"));
        page.fail_next_pings(1);
        let (executor, _, target) = harness(&page);
        let report = executor
            .execute(&instruction(json!({"click": "#a"})), Some(&target))
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(page.install_count(), 2);
        assert_eq!(page.ping_count(), 2);
        assert_eq!(page.actions(), vec!["click #a"]);
    }

    #[tokio::test]
    async fn two_ping_failures_abort_before_any_command() {
        let page = FakePage::new().with_element("#a", FakeElement::new("button"));
        page.fail_next_pings(2);
        let (executor, _, target) = harness(&page);
        let err = executor
            .execute(&instruction(json!({"click": "#a"})), Some(&target))
            .await
            .unwrap_err();
        match err {
            Error::AgentUnreachable(_) => {}
            other => panic!("expected agent unreachable, got {other:?}"),
        }
        assert_eq!(page.install_count(), 2);
        assert_eq!(page.ping_count(), 2);
        assert!(page.actions().is_empty());
    }

    #[tokio::test]
    async fn fill_then_wait_scenario_acknowledges_both_in_order() {
        let page = FakePage::new().with_element("#email", FakeElement::new("input"));
        let (executor, _, target) = harness(&page);
        let started = Instant::now();
        let report = executor
            .execute(
                &instruction(
                    json!({"fill": {"selector": "#email", "value": "a@b.com"}, "wait": 200}),
                ),
                Some(&target),
            )
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].action, ActionKind::Fill);
        assert_eq!(report.outcomes[1].action, ActionKind::Wait);
        assert_eq!(report.outcomes[1].detail, "waited 200ms");
        assert_eq!(page.element_value("#email").as_deref(), Some("a@b.com"));
    }

    #[tokio::test]
    async fn extract_only_notifies_without_touching_the_page() {
        let page = FakePage::new();
        let (executor, sink, target) = harness(&page);
        let report = executor
            .execute(
                &instruction(json!({"extract": {
                    "selector": "a",
                    "attribute": "textContent",
                    "multiple": true,
                    "data": ["Home", "About"],
                }})),
                Some(&target),
            )
            .await
            .unwrap();
        assert!(report.outcomes.is_empty());
        let events = sink.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            UiEvent::ExtractedData {
                data,
                selector,
                attribute,
            } => {
                assert_eq!(data, &vec![json!("Home"), json!("About")]);
                assert_eq!(selector, "a");
                assert_eq!(attribute.as_deref(), Some("textContent"));
            }
            other => panic!("expected extracted data, got {other:?}"),
        }
        assert_eq!(page.install_count(), 0);
        assert_eq!(page.ping_count(), 0);
        assert!(page.actions().is_empty());
    }

    #[tokio::test]
    async fn empty_extract_data_is_not_forwarded() {
        let page = FakePage::new();
        let (executor, sink, target) = harness(&page);
        executor
            .execute(
                &instruction(json!({"extract": {"selector": "a", "data": []}})),
                Some(&target),
            )
            .await
            .unwrap();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn notifications_precede_page_actions() {
        let page = FakePage::new().with_element("#a", FakeElement::new("button"));
        let (executor, sink, target) = harness(&page);
        executor
            .execute(
                &instruction(json!({
                    "display": {"message": "working on it", "type": "info"},
                    "extract": {"selector": "h1", "data": ["Title"]},
                    "click": "#a",
                })),
                Some(&target),
            )
            .await
            .unwrap();
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            UiEvent::Message { message, kind: MessageKind::Info } if message == "working on it"
        ));
        assert!(matches!(&events[1], UiEvent::ExtractedData { .. }));
        assert_eq!(page.actions(), vec!["click #a"]);
    }

    #[tokio::test]
    async fn a_second_session_reuses_the_live_agent() {
        let page = FakePage::new().with_element("#a", FakeElement::new("button"));
        let (executor, _, target) = harness(&page);
        let click = instruction(json!({"click": "#a"}));
        executor.execute(&click, Some(&target)).await.unwrap();
        executor.execute(&click, Some(&target)).await.unwrap();
        // One install; the second session only re-verifies with a ping.
        assert_eq!(page.install_count(), 1);
        assert_eq!(page.ping_count(), 2);
        assert_eq!(page.actions(), vec!["click #a", "click #a"]);
    }

    #[tokio::test]
    async fn a_second_session_reinstalls_a_wiped_helper() {
        let page = FakePage::new().with_element("#go", FakeElement::new("button"));
        let (executor, _, target) = harness(&page);
        let click = instruction(json!({"click": "#go"}));
        executor.execute(&click, Some(&target)).await.unwrap();
        assert_eq!(page.install_count(), 1);

        // A navigation keeps the agent task alive but drops the in-page
        // helper; the registered handle must not be trusted blindly.
        page.wipe_helper();
        executor.execute(&click, Some(&target)).await.unwrap();

        assert_eq!(page.install_count(), 2);
        // Session one: handshake ping. Session two: failed reuse ping,
        // then the handshake ping after re-injection.
        assert_eq!(page.ping_count(), 3);
        assert_eq!(page.actions(), vec!["click #go", "click #go"]);
    }

    #[tokio::test]
    async fn a_stalled_handshake_does_not_block_other_targets() {
        let sink = Arc::new(RecordingSink::default());
        let executor = Executor::with_timings(
            sink,
            ExecutorTimings {
                settle: Duration::from_millis(100),
                ping_timeout: Duration::from_millis(250),
                command_timeout: Duration::from_secs(2),
                selector_timeout: Duration::from_millis(60),
            },
        );
        let page_a = FakePage::new().with_element("#a", FakeElement::new("button"));
        page_a.fail_next_pings(2);
        let page_b = FakePage::new().with_element("#b", FakeElement::new("button"));
        let target_a = PageTarget::new("tab-a", Arc::new(page_a));
        let target_b = PageTarget::new("tab-b", Arc::new(page_b));
        let click_a = instruction(json!({"click": "#a"}));
        let click_b = instruction(json!({"click": "#b"}));

        // Target a burns both handshake attempts (two settle intervals);
        // target b needs one. If the registry lock were held across the
        // handshake, b could not finish ahead of a.
        let started = Instant::now();
        let (slow, fast) = tokio::join!(
            async {
                let result = executor.execute(&click_a, Some(&target_a)).await;
                (result, started.elapsed())
            },
            async {
                let result = executor.execute(&click_b, Some(&target_b)).await;
                (result, started.elapsed())
            },
        );
        match slow.0 {
            Err(Error::AgentUnreachable(_)) => {}
            other => panic!("expected agent unreachable, got {other:?}"),
        }
        fast.0.unwrap();
        assert!(fast.1 < slow.1);
    }
}
