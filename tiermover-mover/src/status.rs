//! Run exit status
//!
//! Every run ends in exactly one [`ExitStatus`]. The numeric codes are a
//! stable contract for scripts that call the mover and must not change.

use std::fmt;

/// Terminal outcome of a mover run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Every block satisfies its storage policy
    Success,
    /// Another mover holds the namespace lease
    AlreadyRunning { holder: String },
    /// Blocks need moving but no destination could be found for any of them
    NoMoveBlock { unsatisfiable: usize },
    /// Moves kept failing without progress
    NoMoveProgress { iterations: u32 },
    /// Listing, lease or other I/O failure
    IoException(String),
    /// Invalid arguments supplied by the caller
    IllegalArguments(String),
    /// The run was interrupted
    Interrupted,
    /// The storage policy satisfier is active for this namespace
    SkippedDueToSps,
}

impl ExitStatus {
    /// Stable numeric exit code
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::AlreadyRunning { .. } => -1,
            ExitStatus::NoMoveBlock { .. } => -2,
            ExitStatus::NoMoveProgress { .. } => -3,
            ExitStatus::IoException(_) => -4,
            ExitStatus::IllegalArguments(_) => -5,
            ExitStatus::Interrupted => -6,
            ExitStatus::SkippedDueToSps => -8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitStatus::Success => "SUCCESS",
            ExitStatus::AlreadyRunning { .. } => "ALREADY_RUNNING",
            ExitStatus::NoMoveBlock { .. } => "NO_MOVE_BLOCK",
            ExitStatus::NoMoveProgress { .. } => "NO_MOVE_PROGRESS",
            ExitStatus::IoException(_) => "IO_EXCEPTION",
            ExitStatus::IllegalArguments(_) => "ILLEGAL_ARGUMENTS",
            ExitStatus::Interrupted => "INTERRUPTED",
            ExitStatus::SkippedDueToSps => "SKIPPED_DUE_TO_SPS",
        }
    }

    /// Human-readable reason
    pub fn reason(&self) -> String {
        match self {
            ExitStatus::Success => {
                "all blocks satisfy the specified storage policy".to_string()
            }
            ExitStatus::AlreadyRunning { holder } => {
                format!("another mover ({}) is running on this namespace", holder)
            }
            ExitStatus::NoMoveBlock { unsatisfiable } => {
                format!("{} block(s) can't be moved", unsatisfiable)
            }
            ExitStatus::NoMoveProgress { iterations } => format!(
                "failed to move some blocks after {} iteration(s) without progress",
                iterations
            ),
            ExitStatus::IoException(msg) => format!("I/O failure: {}", msg),
            ExitStatus::IllegalArguments(msg) => format!("illegal arguments: {}", msg),
            ExitStatus::Interrupted => "interrupted".to_string(),
            ExitStatus::SkippedDueToSps => {
                "storage policy satisfier is running, mover skipped".to_string()
            }
        }
    }

    /// Rank used when aggregating namespace outcomes; higher is worse
    pub fn severity(&self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::SkippedDueToSps => 1,
            ExitStatus::NoMoveBlock { .. } => 2,
            ExitStatus::NoMoveProgress { .. } => 3,
            ExitStatus::AlreadyRunning { .. }
            | ExitStatus::IoException(_)
            | ExitStatus::IllegalArguments(_)
            | ExitStatus::Interrupted => 4,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == 4
    }

    /// The worse of two outcomes; ties keep `self`
    pub fn worst(self, other: ExitStatus) -> ExitStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name(), self.code(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(
            ExitStatus::AlreadyRunning {
                holder: "m".to_string()
            }
            .code(),
            -1
        );
        assert_eq!(ExitStatus::NoMoveBlock { unsatisfiable: 1 }.code(), -2);
        assert_eq!(ExitStatus::NoMoveProgress { iterations: 3 }.code(), -3);
        assert_eq!(ExitStatus::IoException("x".to_string()).code(), -4);
        assert_eq!(ExitStatus::IllegalArguments("x".to_string()).code(), -5);
        assert_eq!(ExitStatus::Interrupted.code(), -6);
        assert_eq!(ExitStatus::SkippedDueToSps.code(), -8);
    }

    #[test]
    fn test_worst_ordering() {
        let status = ExitStatus::Success
            .worst(ExitStatus::SkippedDueToSps)
            .worst(ExitStatus::NoMoveBlock { unsatisfiable: 2 });
        assert_eq!(status, ExitStatus::NoMoveBlock { unsatisfiable: 2 });

        let status = status.worst(ExitStatus::NoMoveProgress { iterations: 4 });
        assert_eq!(status.code(), -3);

        let status = status.worst(ExitStatus::IoException("lease lost".to_string()));
        assert!(status.is_fatal());

        // A lesser outcome never replaces a worse one
        let status = status.worst(ExitStatus::Success);
        assert_eq!(status.code(), -4);
    }

    #[test]
    fn test_display() {
        let status = ExitStatus::NoMoveBlock { unsatisfiable: 3 };
        assert_eq!(status.to_string(), "NO_MOVE_BLOCK (-2): 3 block(s) can't be moved");
    }
}
