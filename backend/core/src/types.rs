use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeepEyesError;

/// Tag name whose presence in the description result schedules OCR.
pub const TEXT_TAG: &str = "text";

/// Where the vision provider should read an image from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    /// Publicly reachable URL (blob store SAS link, CDN, ...)
    Url { url: String },
    /// Local file uploaded as the request body
    File { path: PathBuf },
}

/// Reference to the source image of a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Blob name, stored on the ScanResult as `image`
    pub name: String,
    pub source: ImageSource,
}

impl ImageRef {
    pub fn from_url(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ImageSource::Url { url: url.into() },
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            source: ImageSource::File { path },
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ImageSource::Url { url } => write!(f, "{} ({})", self.name, url),
            ImageSource::File { path } => write!(f, "{} ({})", self.name, path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caption {
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub age: u32,
    pub gender: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Colors {
    pub accent: String,
    pub dominant: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdultSignals {
    pub is_adult: bool,
    pub is_gory: bool,
    pub is_racy: bool,
    pub adult_score: f64,
    pub gore_score: f64,
    pub racy_score: f64,
}

/// Result of the provider's `describe` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptionResult {
    pub tags: Vec<Tag>,
    pub captions: Vec<Caption>,
    pub faces: Vec<Face>,
    pub objects: Vec<DetectedObject>,
    pub colors: Colors,
    pub adult: AdultSignals,
}

impl DescriptionResult {
    /// True when any tag is named exactly `"text"`.
    pub fn has_text(&self) -> bool {
        self.tags.iter().any(|t| t.name == TEXT_TAG)
    }
}

/// Provider-assigned OCR operation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page/region of OCR output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    pub page: u32,
    pub lines: Vec<String>,
}

/// State of an asynchronous OCR job as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done { regions: Vec<TextRegion> },
    Failed { reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done { .. } | JobStatus::Failed { .. })
    }
}

/// OCR progress of a ScanResult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OcrState {
    None,
    Pending,
    Running,
    Done,
}

impl OcrState {
    /// Ordering used to keep the reader-visible record monotonic.
    /// `None` is terminal and shares the top rank with `Done`.
    pub fn rank(self) -> u8 {
        match self {
            OcrState::Pending => 1,
            OcrState::Running => 2,
            OcrState::None | OcrState::Done => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OcrState::None => "NONE",
            OcrState::Pending => "PENDING",
            OcrState::Running => "RUNNING",
            OcrState::Done => "DONE",
        }
    }
}

impl fmt::Display for OcrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ocr {
    pub state: OcrState,
    #[serde(default)]
    pub lines: Vec<String>,
}

impl Ocr {
    pub fn new(has_text: bool) -> Self {
        Self {
            state: if has_text { OcrState::Pending } else { OcrState::None },
            lines: Vec::new(),
        }
    }

    /// PENDING → RUNNING.
    pub fn mark_running(&mut self) -> Result<(), DeepEyesError> {
        self.transition(OcrState::Running)
    }

    /// RUNNING → DONE, attaching the extracted lines.
    pub fn complete(&mut self, lines: Vec<String>) -> Result<(), DeepEyesError> {
        self.transition(OcrState::Done)?;
        self.lines = lines;
        Ok(())
    }

    fn transition(&mut self, to: OcrState) -> Result<(), DeepEyesError> {
        let allowed = matches!(
            (self.state, to),
            (OcrState::Pending, OcrState::Running) | (OcrState::Running, OcrState::Done)
        );
        if !allowed {
            return Err(DeepEyesError::InvalidOcrTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// The evolving analysis record for one image. Always written wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub id: String,
    pub image: String,
    pub tags: Vec<Tag>,
    pub captions: Vec<Caption>,
    pub faces: Vec<Face>,
    pub objects: Vec<DetectedObject>,
    pub colors: Colors,
    pub adult: AdultSignals,
    pub ocr: Ocr,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanResult {
    /// Build the initial record from a description. OCR is scheduled when a
    /// `"text"` tag is present.
    pub fn from_description(
        id: impl Into<String>,
        image: impl Into<String>,
        description: DescriptionResult,
        created_at: DateTime<Utc>,
    ) -> Self {
        let ocr = Ocr::new(description.has_text());
        Self {
            id: id.into(),
            image: image.into(),
            tags: description.tags,
            captions: description.captions,
            faces: description.faces,
            objects: description.objects,
            colors: description.colors,
            adult: description.adult,
            ocr,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn needs_ocr(&self) -> bool {
        self.ocr.state == OcrState::Pending
    }
}
