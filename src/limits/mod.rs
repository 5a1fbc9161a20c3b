//! Usage-limit handling: spotting limit messages and waiting them out.

pub mod detector;
pub mod recovery;

pub use detector::{Meridiem, UsageLimitDetector, UsageLimitSignal, WallClock};
pub use recovery::{RecoveryScheduler, WaitOutcome, WaitProgress, format_duration};
