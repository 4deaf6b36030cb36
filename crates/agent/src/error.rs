#![forbid(unsafe_code)]

/// Recoverable tool failures. They are echoed back to the model through `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("empty search request")]
    EmptySearch,
    #[error("search budget exhausted ({used}/{total}); apply or skip queued entries before searching again")]
    BudgetExhausted { used: usize, total: usize },
    #[error("empty {0} request")]
    EmptyBatch(&'static str),
    #[error("invalid indices (not in queue): {}", join(.0))]
    InvalidIndices(Vec<usize>),
    #[error("duplicate indices in one call: {}", join(.0))]
    DuplicateIndices(Vec<usize>),
    #[error("blank translation for indices: {}", join(.0))]
    BlankTranslations(Vec<usize>),
}

/// Chat model failures. Fatal to the batch once retries are spent.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model api returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model transport: {0}")]
    Transport(String),
    #[error("model response decode: {0}")]
    Decode(String),
    #[error("model response had no choices")]
    Empty,
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Status { status, .. } => *status == 429 || *status >= 500,
            ModelError::Transport(_) => true,
            ModelError::Decode(_) | ModelError::Empty => false,
        }
    }
}

fn join(v: &[usize]) -> String {
    v.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_message_lists_every_index() {
        assert_eq!(ToolError::InvalidIndices(vec![7, 9]).to_string(), "invalid indices (not in queue): 7, 9");
    }

    #[test]
    fn retry_classification() {
        assert!(ModelError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(ModelError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!ModelError::Status { status: 401, body: String::new() }.is_retryable());
        assert!(!ModelError::Empty.is_retryable());
    }
}
