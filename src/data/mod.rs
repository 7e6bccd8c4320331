//! Data persistence: the rotating file sink and the per-channel asynchronous writer.
pub mod storage;
pub mod writer;

pub use storage::{
    encode_block, Appended, Clock, FileIdentity, FileNamer, FileOpener, FsOpener,
    RotatingFileSink,
};
pub use writer::{AsyncWriter, OverflowPolicy, QueueConfig, WriterConfig, WriterStats};
