pub mod client;
pub mod ocr;
pub mod vision;

pub use client::{AzureVisionClient, VisionClientConfig, classify_status};
pub use ocr::operation_id_from_location;
pub use vision::VISUAL_FEATURES;
