use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between a user prompt and a finished session.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid {field} action format")]
    Validation { field: &'static str },

    /// The model declared the request impossible; its message is surfaced verbatim.
    #[error("{0}")]
    Logical(String),

    #[error("invalid provider response: {0}")]
    Parse(String),

    #[error("provider request failed: {0}")]
    Provider(String),

    #[error("page agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error("{}", not_found_text(.selector, .samples))]
    ElementNotFound {
        selector: String,
        samples: Vec<String>,
    },

    #[error("element is not a select control: {selector} (found <{actual}>)")]
    ElementTypeMismatch { selector: String, actual: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{action} action failed: {reason}")]
    Action {
        action: &'static str,
        reason: String,
    },

    #[error("page backend failure: {0}")]
    Page(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

fn not_found_text(selector: &str, samples: &[String]) -> String {
    if samples.is_empty() {
        return format!("element not found: {selector}");
    }
    format!(
        "element not found: {selector}\nFound {} similar elements. Examples:\n{}",
        samples.len(),
        samples.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_names_the_field() {
        let err = Error::Validation { field: "fill" };
        assert_eq!(err.to_string(), "invalid fill action format");
    }

    #[test]
    fn logical_is_verbatim() {
        let err = Error::Logical("Cannot automate this page".into());
        assert_eq!(err.to_string(), "Cannot automate this page");
    }

    #[test]
    fn not_found_without_samples_is_one_line() {
        let err = Error::ElementNotFound {
            selector: "#missing".into(),
            samples: vec![],
        };
        assert_eq!(err.to_string(), "element not found: #missing");
    }

    #[test]
    fn not_found_lists_samples() {
        let err = Error::ElementNotFound {
            selector: "input[name=\"q\"]".into(),
            samples: vec!["<input type=\"text\">".into(), "<input type=\"email\">".into()],
        };
        let text = err.to_string();
        assert!(text.starts_with("element not found: input[name=\"q\"]"));
        assert!(text.contains("Found 2 similar elements"));
        assert!(text.contains("<input type=\"email\">"));
    }

    #[test]
    fn action_failure_names_the_action() {
        let err = Error::Action {
            action: "select",
            reason: "element is not a select control: #q (found <input>)".into(),
        };
        assert!(err.to_string().starts_with("select action failed: "));
    }
}
