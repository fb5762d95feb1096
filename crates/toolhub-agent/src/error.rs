use toolhub_process::TransitionError;

pub const PREFIX: &str = "TOOLHUB_ERROR_JSON:";

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

pub type ToolResult<T> = Result<T, ToolError>;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("process failure: {message}")]
    ProcessFailure {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("launch cancelled before spawn")]
    Cancelled,
}

impl ToolError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn spawn(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::ProcessFailure {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "validation",
            ToolError::NotFound { .. } => "not_found",
            ToolError::Conflict(_) => "conflict",
            ToolError::Security(_) => "security",
            ToolError::ProcessFailure { .. } => "process_failure",
            ToolError::Io { .. } => "io",
            ToolError::Cancelled => "cancelled",
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            ToolError::Conflict(msg) if msg.contains("port") => Some(
                "Pick another port, or use the recommended range to find a free one.".to_string(),
            ),
            ToolError::NotFound {
                what: "executable", ..
            } => Some("Check that the tool is installed at the configured path.".to_string()),
            ToolError::Security(_) => {
                Some("Use an absolute path without `..` segments.".to_string())
            }
            _ => None,
        }
    }

    /// Full cause chain, joined the way the agent logs it.
    pub fn chain_message(&self) -> String {
        let mut parts = vec![self.to_string()];
        let mut cur = std::error::Error::source(self);
        while let Some(cause) = cur {
            let s = cause.to_string();
            if !s.is_empty() && parts.last() != Some(&s) {
                parts.push(s);
            }
            cur = cause.source();
        }
        parts.join(": ")
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: truncate_utf8(&self.chain_message(), MAX_MESSAGE_BYTES),
            hint: self.hint().map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        }
    }

    /// Serialized payload for a calling layer that only transports strings.
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(&self.payload())
            .unwrap_or_else(|_| "{\"code\":\"internal\",\"message\":\"serialize_failed\"}".to_string());
        format!("{PREFIX}{json}")
    }
}

impl From<TransitionError> for ToolError {
    fn from(value: TransitionError) -> Self {
        ToolError::Conflict(value.to_string())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}
