pub mod error;
pub mod event;
pub mod instance;
pub mod traits;
pub mod types;

pub use error::DeepEyesError;
pub use event::{Event, EventKind};
pub use instance::{FailureKind, InstanceRecord, InstanceStatus, StepRecord};
pub use traits::{CheckpointStore, ResultStore, VisionAdapter};
pub use types::{
    AdultSignals, Caption, Colors, DescriptionResult, DetectedObject, Face, ImageRef, ImageSource,
    JobId, JobStatus, Ocr, OcrState, ScanResult, Tag, TextRegion, TEXT_TAG,
};
