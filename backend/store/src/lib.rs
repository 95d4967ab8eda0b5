pub mod checkpoints;
pub mod events;
pub mod recorder;
pub mod results;

pub use checkpoints::SqliteCheckpointStore;
pub use events::EventStore;
pub use recorder::EventRecorder;
pub use results::SqliteResultStore;
