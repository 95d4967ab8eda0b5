pub mod trigger;
pub mod watcher;

pub use trigger::{instance_id_for, IngestTrigger, Submission, UploadEvent, INGEST_NAMESPACE};
pub use watcher::DirectoryWatcher;
