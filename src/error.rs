use crate::ir::verify::VerifyError;
use crate::ir::ValueId;
use crate::slp::graph::SuperwordId;

pub type Result<T> = std::result::Result<T, SlpError>;

/// Internal consistency violations of a vectorization attempt.
///
/// These indicate a builder or scheduler bug, not an unvectorizable input:
/// a seed that fails to grow or a pattern that does not match surfaces as a
/// normal "no change" result instead. Every variant aborts the attempt.
#[derive(Debug, thiserror::Error)]
pub enum SlpError {
    #[error("superword {0} marked computed before its operand superword {1}")]
    OperandOrder(SuperwordId, SuperwordId),
    #[error("superword {0} was already converted")]
    AlreadyConverted(SuperwordId),
    #[error("no vector value has been recorded for superword {0}")]
    MissingVector(SuperwordId),
    #[error("extraction deemed profitable, but value {0} sits in no computed superword")]
    NoExtractionSource(ValueId),
    #[error("block verification failed after conversion: {0}")]
    Verify(#[from] VerifyError),
}
