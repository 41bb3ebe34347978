use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A validated automation instruction. Every field is optional and
/// independently meaningful; an empty instruction is a valid no-op.
///
/// Construction goes through [`Instruction::validate`], so a value of this
/// type can never carry the model's terminal `error` marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Instruction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<SelectorValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<SelectorValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll: Option<ScrollSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplaySpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract: Option<ExtractSpec>,
}

/// A selector plus the value to apply to the matched element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorValue {
    pub selector: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScrollSpec {
    Element {
        selector: String,
        behavior: ScrollBehavior,
    },
    Position {
        top: f64,
        left: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollBehavior {
    #[default]
    Smooth,
    Auto,
}

impl ScrollBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            ScrollBehavior::Smooth => "smooth",
            ScrollBehavior::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplaySpec {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Info,
    Warning,
    Error,
    Success,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Info => "info",
            MessageKind::Warning => "warning",
            MessageKind::Error => "error",
            MessageKind::Success => "success",
        }
    }
}

/// Data the model claims to have extracted from the page, forwarded to the
/// UI verbatim. `data` is never checked against live page content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractSpec {
    pub selector: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    pub data: Vec<Value>,
}

/// One executable action field, used for dispatch order and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    Fill,
    Select,
    Scroll,
    Wait,
}

impl ActionKind {
    pub fn name(self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::Select => "select",
            ActionKind::Scroll => "scroll",
            ActionKind::Wait => "wait",
        }
    }
}

/// Execution order of the action fields. Fixed, independent of the JSON
/// object's key order. `display` and `extract` are UI notifications and run
/// before all of these.
pub const ACTION_ORDER: [ActionKind; 5] = [
    ActionKind::Click,
    ActionKind::Fill,
    ActionKind::Select,
    ActionKind::Scroll,
    ActionKind::Wait,
];

impl Instruction {
    /// Validates a parsed instruction object.
    ///
    /// The `error` field is checked first: if present and non-empty the
    /// whole instruction is a terminal logical failure and no other field
    /// is looked at. Otherwise each recognized field present must satisfy
    /// its shape predicate; the first violation rejects naming that field.
    /// Unrecognized fields are ignored.
    pub fn validate(value: &Value) -> Result<Instruction> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Parse("instruction payload is not a JSON object".into()))?;

        if let Some(err) = obj.get("error") {
            match err {
                Value::Null => {}
                Value::String(msg) if msg.is_empty() => {}
                Value::String(msg) => return Err(Error::Logical(msg.clone())),
                _ => return Err(Error::Validation { field: "error" }),
            }
        }

        let mut out = Instruction::default();
        if let Some(v) = obj.get("click") {
            out.click = Some(expect_string(v, "click")?);
        }
        if let Some(v) = obj.get("fill") {
            out.fill = Some(expect_selector_value(v, "fill")?);
        }
        if let Some(v) = obj.get("select") {
            out.select = Some(expect_selector_value(v, "select")?);
        }
        if let Some(v) = obj.get("wait") {
            out.wait = Some(expect_duration_ms(v)?);
        }
        if let Some(v) = obj.get("scroll") {
            out.scroll = Some(expect_scroll(v)?);
        }
        if let Some(v) = obj.get("display") {
            out.display = Some(expect_shape::<DisplaySpec>(v, "display")?);
        }
        if let Some(v) = obj.get("extract") {
            out.extract = Some(expect_shape::<ExtractSpec>(v, "extract")?);
        }
        Ok(out)
    }

    /// True when at least one field requires dispatching into the page
    /// context. `wait` is excluded: it runs locally in the orchestrator.
    pub fn has_page_actions(&self) -> bool {
        self.click.is_some()
            || self.fill.is_some()
            || self.select.is_some()
            || self.scroll.is_some()
    }
}

fn expect_string(v: &Value, field: &'static str) -> Result<String> {
    v.as_str()
        .map(str::to_owned)
        .ok_or(Error::Validation { field })
}

fn expect_selector_value(v: &Value, field: &'static str) -> Result<SelectorValue> {
    expect_shape::<SelectorValue>(v, field)
}

fn expect_shape<T: serde::de::DeserializeOwned>(v: &Value, field: &'static str) -> Result<T> {
    serde_json::from_value(v.clone()).map_err(|_| Error::Validation { field })
}

fn expect_duration_ms(v: &Value) -> Result<u64> {
    let ms = v
        .as_f64()
        .filter(|n| n.is_finite() && *n >= 0.0)
        .ok_or(Error::Validation { field: "wait" })?;
    Ok(ms as u64)
}

/// Accepts either the element form `{selector, behavior?}` or the viewport
/// coordinate form `{top?, left?}` with at least one coordinate present.
fn expect_scroll(v: &Value) -> Result<ScrollSpec> {
    let field = "scroll";
    let obj = v.as_object().ok_or(Error::Validation { field })?;

    if let Some(sel) = obj.get("selector") {
        let selector = sel
            .as_str()
            .map(str::to_owned)
            .ok_or(Error::Validation { field })?;
        let behavior = match obj.get("behavior") {
            None | Some(Value::Null) => ScrollBehavior::default(),
            Some(b) => expect_shape::<ScrollBehavior>(b, field)?,
        };
        return Ok(ScrollSpec::Element { selector, behavior });
    }

    let coord = |key: &str| -> Result<Option<f64>> {
        match obj.get(key) {
            None => Ok(None),
            Some(n) => n
                .as_f64()
                .filter(|n| n.is_finite())
                .map(Some)
                .ok_or(Error::Validation { field }),
        }
    };
    let top = coord("top")?;
    let left = coord("left")?;
    if top.is_none() && left.is_none() {
        return Err(Error::Validation { field });
    }
    Ok(ScrollSpec::Position {
        top: top.unwrap_or(0.0),
        left: left.unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field_of(err: Error) -> &'static str {
        match err {
            Error::Validation { field } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn accepts_instruction_with_every_field_valid() {
        let value = json!({
            "click": "#submit",
            "fill": {"selector": "#email", "value": "a@b.com"},
            "select": {"selector": "#country", "value": "NZ"},
            "wait": 250,
            "scroll": {"selector": "#footer", "behavior": "auto"},
            "display": {"message": "working", "type": "info"},
            "extract": {"selector": "a", "attribute": "href", "multiple": true, "data": ["x"]},
        });
        let got = Instruction::validate(&value).unwrap();
        assert_eq!(got.click.as_deref(), Some("#submit"));
        assert_eq!(got.fill.as_ref().unwrap().value, "a@b.com");
        assert_eq!(got.select.as_ref().unwrap().selector, "#country");
        assert_eq!(got.wait, Some(250));
        assert_eq!(
            got.scroll,
            Some(ScrollSpec::Element {
                selector: "#footer".into(),
                behavior: ScrollBehavior::Auto,
            })
        );
        assert_eq!(got.display.as_ref().unwrap().kind, MessageKind::Info);
        let extract = got.extract.unwrap();
        assert!(extract.multiple);
        assert_eq!(extract.data, vec![json!("x")]);
    }

    #[test]
    fn accepts_empty_instruction() {
        let got = Instruction::validate(&json!({})).unwrap();
        assert_eq!(got, Instruction::default());
        assert!(!got.has_page_actions());
    }

    #[test]
    fn ignores_unknown_fields() {
        let value = json!({"click": "#a", "hover": {"selector": "#b"}, "version": 2});
        let got = Instruction::validate(&value).unwrap();
        assert_eq!(got.click.as_deref(), Some("#a"));
    }

    #[test]
    fn error_field_short_circuits_even_when_other_fields_are_broken() {
        let value = json!({
            "error": "Cannot automate a PDF viewer",
            "click": 42,
            "fill": "not an object",
        });
        match Instruction::validate(&value) {
            Err(Error::Logical(msg)) => assert_eq!(msg, "Cannot automate a PDF viewer"),
            other => panic!("expected logical error, got {other:?}"),
        }
    }

    #[test]
    fn empty_error_string_is_ignored() {
        let got = Instruction::validate(&json!({"error": "", "click": "#a"})).unwrap();
        assert_eq!(got.click.as_deref(), Some("#a"));
    }

    #[test]
    fn non_string_error_rejects_naming_error() {
        let err = Instruction::validate(&json!({"error": 5})).unwrap_err();
        assert_eq!(field_of(err), "error");
    }

    #[test]
    fn one_corrupted_field_rejects_naming_it_regardless_of_the_rest() {
        let value = json!({
            "click": "#ok",
            "fill": {"selector": "#email", "value": "a@b.com"},
            "select": {"selector": "#country", "value": 7},
            "wait": 100,
        });
        let err = Instruction::validate(&value).unwrap_err();
        assert_eq!(field_of(err), "select");
    }

    #[test]
    fn click_must_be_a_string() {
        let err = Instruction::validate(&json!({"click": ["#a"]})).unwrap_err();
        assert_eq!(field_of(err), "click");
    }

    #[test]
    fn fill_requires_selector_and_value() {
        let err = Instruction::validate(&json!({"fill": {"selector": "#a"}})).unwrap_err();
        assert_eq!(field_of(err), "fill");
        let err = Instruction::validate(&json!({"fill": "type here"})).unwrap_err();
        assert_eq!(field_of(err), "fill");
    }

    #[test]
    fn wait_rejects_negative_and_non_numeric() {
        let err = Instruction::validate(&json!({"wait": -5})).unwrap_err();
        assert_eq!(field_of(err), "wait");
        let err = Instruction::validate(&json!({"wait": "100"})).unwrap_err();
        assert_eq!(field_of(err), "wait");
    }

    #[test]
    fn wait_accepts_zero_and_truncates_fractions() {
        let got = Instruction::validate(&json!({"wait": 0})).unwrap();
        assert_eq!(got.wait, Some(0));
        let got = Instruction::validate(&json!({"wait": 250.9})).unwrap();
        assert_eq!(got.wait, Some(250));
    }

    #[test]
    fn scroll_behavior_defaults_to_smooth() {
        let got = Instruction::validate(&json!({"scroll": {"selector": "#top"}})).unwrap();
        assert_eq!(
            got.scroll,
            Some(ScrollSpec::Element {
                selector: "#top".into(),
                behavior: ScrollBehavior::Smooth,
            })
        );
    }

    #[test]
    fn scroll_rejects_unknown_behavior() {
        let err = Instruction::validate(
            &json!({"scroll": {"selector": "#top", "behavior": "instant"}}),
        )
        .unwrap_err();
        assert_eq!(field_of(err), "scroll");
    }

    #[test]
    fn scroll_accepts_viewport_coordinates() {
        let got = Instruction::validate(&json!({"scroll": {"top": 400}})).unwrap();
        assert_eq!(
            got.scroll,
            Some(ScrollSpec::Position { top: 400.0, left: 0.0 })
        );
    }

    #[test]
    fn scroll_rejects_an_empty_object() {
        let err = Instruction::validate(&json!({"scroll": {}})).unwrap_err();
        assert_eq!(field_of(err), "scroll");
    }

    #[test]
    fn display_rejects_unknown_message_type() {
        let err = Instruction::validate(
            &json!({"display": {"message": "done", "type": "celebration"}}),
        )
        .unwrap_err();
        assert_eq!(field_of(err), "display");
    }

    #[test]
    fn extract_requires_a_data_array() {
        let err =
            Instruction::validate(&json!({"extract": {"selector": "a", "data": "Home"}}))
                .unwrap_err();
        assert_eq!(field_of(err), "extract");
        let err = Instruction::validate(&json!({"extract": {"selector": "a"}})).unwrap_err();
        assert_eq!(field_of(err), "extract");
    }

    #[test]
    fn extract_defaults_are_permissive() {
        let got =
            Instruction::validate(&json!({"extract": {"selector": "a", "data": []}})).unwrap();
        let extract = got.extract.unwrap();
        assert!(!extract.multiple);
        assert!(extract.attribute.is_none());
        assert!(extract.data.is_empty());
    }

    #[test]
    fn non_object_payload_is_a_parse_failure() {
        match Instruction::validate(&json!(["click"])) {
            Err(Error::Parse(_)) => {}
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn page_action_detection_excludes_wait_and_notifications() {
        let local = Instruction::validate(&json!({
            "wait": 50,
            "display": {"message": "hi", "type": "info"},
            "extract": {"selector": "a", "data": ["x"]},
        }))
        .unwrap();
        assert!(!local.has_page_actions());

        let paged = Instruction::validate(&json!({"scroll": {"top": 10}})).unwrap();
        assert!(paged.has_page_actions());
    }
}
