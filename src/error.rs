use std::fmt::{Display, Formatter};

/// Typed failure conditions. These travel inside `anyhow::Error` and can be recovered with
///  `downcast_ref::<RxwError>()`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RxwError {
    /// the slot array for the requested capacity could not be reserved
    Allocation { slots: u32 },
    /// the caller provided no room for even a single message
    BufferTooSmall,
    InvalidFecParameters { n: u8, k: u8 },
}

impl Display for RxwError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RxwError::Allocation { slots } => write!(f, "failed to allocate receive window of {} slots", slots),
            RxwError::BufferTooSmall => write!(f, "message vector has no room for a single message"),
            RxwError::InvalidFecParameters { n, k } => write!(f, "invalid Reed-Solomon parameters n={}, k={}", n, k),
        }
    }
}

impl std::error::Error for RxwError {}
