use serde::{Serialize, Serializer};
use serde_json::Value;
use std::os::raw::c_int;

/// Outcome of one client or server run.
///
/// Holds the engine's JSON report as text plus its parsed form. When the run
/// failed the report is `{"error": "<message>"}` and [`TestResult::error`]
/// returns the message. A report that isn't valid JSON is also treated as an
/// error, so callers only ever need to check one field.
///
/// # Examples
///
/// ```
/// use iperf3_ffi::TestResult;
///
/// let ok = TestResult::parse(r#"{"start": {}, "end": {}}"#);
/// assert!(ok.is_success());
///
/// let failed = TestResult::parse(r#"{"error": "unable to connect to server"}"#);
/// assert_eq!(failed.error(), Some("unable to connect to server"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    text: String,
    json: Value,
    error: Option<String>,
}

impl TestResult {
    /// Parses the text produced by a run.
    pub fn parse(text: impl Into<String>) -> Self {
        let text = text.into();
        match serde_json::from_str::<Value>(&text) {
            Ok(json) => {
                let error = json.get("error").map(|e| match e {
                    Value::String(message) => message.clone(),
                    other => other.to_string(),
                });
                Self { text, json, error }
            }
            Err(e) => {
                let error = format!("engine produced malformed JSON: {}", e);
                Self {
                    json: error_payload(&error),
                    text,
                    error: Some(error),
                }
            }
        }
    }

    /// Builds the error-shaped result for a failed run.
    pub fn from_error(message: &str) -> Self {
        let json = error_payload(message);
        Self {
            text: json.to_string(),
            json,
            error: Some(message.to_string()),
        }
    }

    /// Turns the raw outcome of an engine run into a result.
    ///
    /// A nonzero return code or empty text means the run failed; the message
    /// then comes from `error_message`, which should translate the engine's
    /// error cell as it was right after the run.
    pub(crate) fn from_run(
        text: String,
        code: c_int,
        error_message: impl FnOnce() -> String,
    ) -> Self {
        if code != 0 || text.trim().is_empty() {
            Self::from_error(&error_message())
        } else {
            Self::parse(text)
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Error message, if the run failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Parsed report, or `None` for a failed run.
    pub fn payload(&self) -> Option<&Value> {
        match self.error {
            None => Some(&self.json),
            Some(_) => None,
        }
    }

    /// Parsed JSON for either outcome.
    pub fn json(&self) -> &Value {
        &self.json
    }

    /// Text exactly as the engine produced it.
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl Serialize for TestResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.json.serialize(serializer)
    }
}

/// `{"error": "<message>"}`
pub(crate) fn error_payload(message: &str) -> Value {
    serde_json::json!({ "error": message })
}
