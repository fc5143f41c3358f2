//! Error types for ovaleval

use thiserror::Error;

/// Main error type for evaluation operations
///
/// Parse failures are recoverable (the offending package is skipped);
/// everything else aborts the request that triggered it.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("Malformed NEVRA: {0}")]
    MalformedNevra(String),

    #[error("Malformed EVR: {0}")]
    MalformedEvr(String),

    #[error("Unsupported EVR operation code: {0}")]
    UnsupportedEvrOperation(i64),

    #[error("Unsupported check_existence code: {0}")]
    UnsupportedCheckExistence(i64),

    #[error("Unsupported definition type code: {0}")]
    UnsupportedDefinitionType(i64),

    #[error("Unsupported criteria operator code: {0}")]
    UnsupportedCriteriaOperator(i64),

    #[error("Criteria dependency cycle at id {0}")]
    CriteriaCycle(i64),

    #[error("Criteria id {0} missing from cache")]
    UnknownCriteria(i64),

    #[error("Rpminfo test id {0} missing from cache")]
    UnknownTest(i64),

    #[error("Module test id {0} missing from cache")]
    UnknownModuleTest(i64),

    #[error("EVR id {0} missing from cache")]
    UnknownEvr(i64),
}

/// Result type alias for evaluation operations
pub type Result<T> = std::result::Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EvalError::MalformedNevra("not-a-package".to_string());
        assert_eq!(err.to_string(), "Malformed NEVRA: not-a-package");

        let err = EvalError::UnsupportedEvrOperation(7);
        assert!(err.to_string().contains('7'));

        let err = EvalError::CriteriaCycle(42);
        assert!(err.to_string().contains("cycle"));
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_result_type() {
        let ok: Result<i32> = Ok(1);
        assert!(ok.is_ok());

        let err: Result<()> = Err(EvalError::UnknownEvr(3));
        assert!(matches!(err, Err(EvalError::UnknownEvr(3))));
    }
}
