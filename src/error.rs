//! Macro errors
//!
//! Every failure the interpreter surfaces carries one of the legacy numeric
//! codes below. Hosts match on the numbers, so they never change.

use std::fmt;

/// The canonical error-code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    /// Run stopped by the host
    Stopped = -101,
    /// Author-triggered abort from an expression
    Aborted = -102,
    /// No capability handler registered for the command
    HandlerNotConfigured = -901,
    ImageSearchNotConfigured = -902,
    ImageFileNotFound = -903,
    /// Malformed macro source
    SyntaxError = -910,
    MissingParameter = -911,
    InvalidParameter = -912,
    ElementNotFound = -920,
    ElementNotVisible = -921,
    XpathAmbiguous = -923,
    ElementNotEnabled = -924,
    ImageNotFound = -927,
    Timeout = -930,
    FileNotFound = -931,
    FileAccessDenied = -932,
    DatasourceError = -950,
    /// Cursor moved past the last row
    DatasourceEnd = -951,
    ExecutionError = -970,
    ExpressionError = -971,
}

impl ErrorCode {
    const ALL: [ErrorCode; 21] = [
        ErrorCode::Ok,
        ErrorCode::Stopped,
        ErrorCode::Aborted,
        ErrorCode::HandlerNotConfigured,
        ErrorCode::ImageSearchNotConfigured,
        ErrorCode::ImageFileNotFound,
        ErrorCode::SyntaxError,
        ErrorCode::MissingParameter,
        ErrorCode::InvalidParameter,
        ErrorCode::ElementNotFound,
        ErrorCode::ElementNotVisible,
        ErrorCode::XpathAmbiguous,
        ErrorCode::ElementNotEnabled,
        ErrorCode::ImageNotFound,
        ErrorCode::Timeout,
        ErrorCode::FileNotFound,
        ErrorCode::FileAccessDenied,
        ErrorCode::DatasourceError,
        ErrorCode::DatasourceEnd,
        ErrorCode::ExecutionError,
        ErrorCode::ExpressionError,
    ];

    /// The legacy numeric value.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a code by its numeric value.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Whether the retry loop may absorb this code while the timeout window is open.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::ElementNotFound | ErrorCode::ElementNotVisible | ErrorCode::ImageNotFound
        )
    }

    /// Upper-case symbolic name, as shown in transcripts.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Stopped => "STOPPED",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::HandlerNotConfigured => "HANDLER_NOT_CONFIGURED",
            ErrorCode::ImageSearchNotConfigured => "IMAGE_SEARCH_NOT_CONFIGURED",
            ErrorCode::ImageFileNotFound => "IMAGE_FILE_NOT_FOUND",
            ErrorCode::SyntaxError => "SYNTAX_ERROR",
            ErrorCode::MissingParameter => "MISSING_PARAMETER",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::ElementNotFound => "ELEMENT_NOT_FOUND",
            ErrorCode::ElementNotVisible => "ELEMENT_NOT_VISIBLE",
            ErrorCode::XpathAmbiguous => "XPATH_AMBIGUOUS",
            ErrorCode::ElementNotEnabled => "ELEMENT_NOT_ENABLED",
            ErrorCode::ImageNotFound => "IMAGE_NOT_FOUND",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::FileAccessDenied => "FILE_ACCESS_DENIED",
            ErrorCode::DatasourceError => "DATASOURCE_ERROR",
            ErrorCode::DatasourceEnd => "DATASOURCE_END",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::ExpressionError => "EXPRESSION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// A macro error with line/command context
#[derive(Debug, Clone, PartialEq)]
pub struct MacroError {
    pub code: ErrorCode,
    pub message: String,
    pub line: Option<usize>,
    pub command: Option<String>,
}

impl MacroError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            line: None,
            command: None,
        }
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_command(mut self, cmd: impl Into<String>) -> Self {
        self.command = Some(cmd.into());
        self
    }

    pub fn missing(cmd: &str, param: &str) -> Self {
        Self::new(
            ErrorCode::MissingParameter,
            format!("{} requires parameter {}", cmd, param),
        )
    }

    pub fn invalid(param: &str, value: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidParameter,
            format!("invalid value {:?} for {}: expected {}", value, param, expected),
        )
    }

    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Aborted, msg)
    }

    pub fn is_abort(&self) -> bool {
        self.code == ErrorCode::Aborted
    }
}

impl fmt::Display for MacroError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(line) = self.line {
            write!(f, "line {}: ", line)?;
        }
        if let Some(ref cmd) = self.command {
            write!(f, "{}: ", cmd)?;
        }
        write!(f, "{} [{}]", self.message, self.code.code())
    }
}

impl std::error::Error for MacroError {}

impl From<crate::parser::ParseError> for MacroError {
    fn from(e: crate::parser::ParseError) -> Self {
        Self::new(ErrorCode::SyntaxError, e.message).with_line(e.line)
    }
}

impl From<crate::datasource::DatasourceError> for MacroError {
    fn from(e: crate::datasource::DatasourceError) -> Self {
        Self::new(ErrorCode::DatasourceError, e.to_string())
    }
}

impl From<crate::expr::EvalError> for MacroError {
    fn from(e: crate::expr::EvalError) -> Self {
        Self::new(ErrorCode::ExpressionError, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_values_are_stable() {
        assert_eq!(ErrorCode::Ok.code(), 0);
        assert_eq!(ErrorCode::ElementNotFound.code(), -920);
        assert_eq!(ErrorCode::ElementNotVisible.code(), -921);
        assert_eq!(ErrorCode::XpathAmbiguous.code(), -923);
        assert_eq!(ErrorCode::ElementNotEnabled.code(), -924);
        assert_eq!(ErrorCode::Timeout.code(), -930);
        assert_eq!(ErrorCode::ExecutionError.code(), -970);
    }

    #[test]
    fn test_from_code() {
        assert_eq!(ErrorCode::from_code(-930), Some(ErrorCode::Timeout));
        assert_eq!(ErrorCode::from_code(12345), None);
        for c in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(c.code()), Some(c));
        }
    }

    #[test]
    fn test_retryable_subset() {
        assert!(ErrorCode::ElementNotFound.is_retryable());
        assert!(ErrorCode::ImageNotFound.is_retryable());
        assert!(!ErrorCode::ElementNotEnabled.is_retryable());
        assert!(!ErrorCode::Timeout.is_retryable());
        assert!(!ErrorCode::FileNotFound.is_retryable());
    }

    #[test]
    fn test_display_with_context() {
        let err = MacroError::new(ErrorCode::ElementNotFound, "no such element")
            .with_line(4)
            .with_command("TAG");
        assert_eq!(err.to_string(), "line 4: TAG: no such element [-920]");
    }
}
