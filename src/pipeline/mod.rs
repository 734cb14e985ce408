pub mod motion;
pub mod queue;
pub mod record;
pub mod shutdown;
pub mod stream;

pub use motion::{MotionDetector, MotionState, MotionTracker, Transition};
pub use queue::{job_queue, JobReceiver, JobSender, QueueSnapshot};
pub use record::{ClipSummary, ClipWriter, Recorder};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use stream::{ClipOutput, Launch, Offset, OutputGeometry, StatsSnapshot, Stream, StreamConfig};
