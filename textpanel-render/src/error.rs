use thiserror::Error;

pub type RenderResult<T> = Result<T, RenderError>;

/// Shape errors in incoming data frames.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Field '{field}' has {actual} values, expected {expected} like the other fields")]
    LengthMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Error, Debug, Clone)]
pub enum RenderError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Template error: {message}")]
    Template { message: String },

    /// Raised by sandboxed code while it runs. `traceback` keeps the full
    /// script host output so it can be shown verbatim.
    #[error("Script error: {message}")]
    Script { message: String, traceback: String },

    #[error("Script host error: {0}")]
    ScriptHost(String),

    #[error("Invalid options: {0}")]
    Options(String),
}

impl RenderError {
    /// Full text of the error, including any traceback or source chain.
    pub fn raw(&self) -> String {
        match self {
            RenderError::Script { traceback, .. } if !traceback.is_empty() => traceback.clone(),
            other => other.to_string(),
        }
    }
}

impl From<tera::Error> for RenderError {
    fn from(err: tera::Error) -> Self {
        // tera's Display only shows the outermost message
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        RenderError::Template { message }
    }
}

impl From<mlua::Error> for RenderError {
    fn from(err: mlua::Error) -> Self {
        let traceback = err.to_string();
        let message = match root_cause(&err) {
            mlua::Error::RuntimeError(msg) => msg.clone(),
            mlua::Error::MemoryError(msg) => format!("memory limit exceeded: {}", msg),
            other => other.to_string(),
        };
        RenderError::Script { message, traceback }
    }
}

impl From<serde_yaml::Error> for RenderError {
    fn from(err: serde_yaml::Error) -> Self {
        RenderError::Options(err.to_string())
    }
}

/// Unwraps callback layers added when errors cross Rust/Lua boundaries.
fn root_cause(err: &mlua::Error) -> &mlua::Error {
    match err {
        mlua::Error::CallbackError { cause, .. } => root_cause(cause),
        mlua::Error::WithContext { cause, .. } => root_cause(cause),
        other => other,
    }
}

/// Error as presented to the host: one panel replacing all output of a pass.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PanelError {
    pub title: String,
    pub detail: String,
    pub raw: String,
}

pub const PANEL_ERROR_TITLE: &str = "Couldn't build text from template";

impl From<&RenderError> for PanelError {
    fn from(err: &RenderError) -> Self {
        let detail = match err {
            RenderError::Template { message } => message.clone(),
            RenderError::Script { message, .. } => message.clone(),
            other => other.to_string(),
        };
        PanelError {
            title: PANEL_ERROR_TITLE.to_string(),
            detail,
            raw: err.raw(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_message_unwraps_callback() {
        let inner = mlua::Error::RuntimeError("boom".to_string());
        let err = mlua::Error::CallbackError {
            traceback: "stack traceback:\n  [C]: in ?".to_string(),
            cause: std::sync::Arc::new(inner),
        };
        let render: RenderError = err.into();
        match render {
            RenderError::Script { message, traceback } => {
                assert_eq!(message, "boom");
                assert!(traceback.contains("boom"));
            }
            other => panic!("Expected Script error, got {:?}", other),
        }
    }

    #[test]
    fn test_panel_error_from_template_error() {
        let err = RenderError::Template {
            message: "unexpected token".to_string(),
        };
        let panel = PanelError::from(&err);
        assert_eq!(panel.title, PANEL_ERROR_TITLE);
        assert_eq!(panel.detail, "unexpected token");
        assert_eq!(panel.raw, "Template error: unexpected token");
    }
}
