//! Runtime of the stress test: writers, checkers and their coordination.

pub mod checker;
pub mod control;
pub mod failure;
pub mod liveness;
pub mod manager;
pub mod pool;
pub mod record;
pub mod stressor;

pub use checker::{CheckError, CheckerGroup, Checked};
pub use control::{Control, Interrupted};
pub use failure::{FailureCounts, FailureManager, ProgressView};
pub use liveness::{LivenessTracker, Participant};
pub use manager::{ManagerError, OperationSourceFactory, StressManager};
pub use pool::RecordPool;
pub use record::{RecordShared, StressorRecord};
pub use stressor::{Stressor, StressorError, StressorState, StressorStatus};
