//! Definition of error and status.

use std::error::Error;
use std::fmt;

/// Status of epoch and persistent log operations
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Status {
    /// Success
    Success,
    /// Current thread is already protected
    Busy,
    /// Invalid parameter
    InvalidParam,
    /// Table or log is not initialized
    NotInitialized,
    /// Every epoch table slot is owned by another thread
    TableFull,
    /// Persistent log has no free slot left, it was sized too small
    LogSlotsExhausted,
}

impl Status {
    #[inline]
    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for Status {}

#[cfg(test)]
mod test {

    #[test]
    fn test_base() {
        use error::Status;

        let s = Status::Success;
        let a = format!("{}", s);
        assert_eq!(a, "Success");
        assert!(s.is_success());
        assert!(!Status::TableFull.is_success());
        assert_eq!(format!("{}", Status::LogSlotsExhausted), "LogSlotsExhausted");
    }

    #[test]
    fn test_status_names() {
        use error::Status;

        let all = [
            Status::Success,
            Status::Busy,
            Status::InvalidParam,
            Status::NotInitialized,
            Status::TableFull,
            Status::LogSlotsExhausted,
        ];
        for s in all.iter() {
            // exhaustive, a new variant has to be listed here
            let name = match *s {
                Status::Success => "Success",
                Status::Busy => "Busy",
                Status::InvalidParam => "InvalidParam",
                Status::NotInitialized => "NotInitialized",
                Status::TableFull => "TableFull",
                Status::LogSlotsExhausted => "LogSlotsExhausted",
            };
            assert_eq!(format!("{}", s), name);
        }
    }
}
