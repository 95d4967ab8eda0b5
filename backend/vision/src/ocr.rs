//! Optical Character Recognition (OCR)
//!
//! Wire types of the provider's asynchronous read operation: the job id is
//! handed back in the `Operation-Location` header of the submit call, and the
//! poll response carries the status plus, once succeeded, per-page lines.

use serde::Deserialize;
use tracing::warn;

use deepeyes_core::{JobId, JobStatus, TextRegion};

/// Header carrying the URL of the submitted read operation.
pub const OPERATION_LOCATION: &str = "operation-location";

/// Extract the operation id (last path segment) from an `Operation-Location` URL.
pub fn operation_id_from_location(location: &str) -> Option<JobId> {
    let url = url::Url::parse(location.trim()).ok()?;
    let id = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    Some(JobId::new(id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOperationResponse {
    pub status: String,
    #[serde(default)]
    pub analyze_result: Option<ReadAnalyzeResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAnalyzeResult {
    #[serde(default)]
    pub read_results: Vec<ReadPage>,
}

#[derive(Debug, Deserialize)]
pub struct ReadPage {
    pub page: u32,
    #[serde(default)]
    pub lines: Vec<ReadLine>,
}

#[derive(Debug, Deserialize)]
pub struct ReadLine {
    pub text: String,
}

impl ReadOperationResponse {
    pub fn into_job_status(self) -> JobStatus {
        match self.status.as_str() {
            "notStarted" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "succeeded" => {
                let regions = self
                    .analyze_result
                    .map(|r| r.read_results)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|page| TextRegion {
                        page: page.page,
                        lines: page.lines.into_iter().map(|l| l.text).collect(),
                    })
                    .collect();
                JobStatus::Done { regions }
            }
            "failed" => JobStatus::Failed {
                reason: "provider reported read operation failure".to_string(),
            },
            other => {
                warn!(status = %other, "Unknown read operation status");
                JobStatus::Failed {
                    reason: format!("unknown read operation status '{other}'"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_operation_id() {
        let location = "https://westeurope.api.cognitive.microsoft.com/vision/v3.2/read/analyzeResults/49a36324-fc4b-4387-aa06-090cfbf0064f";
        let id = operation_id_from_location(location).unwrap();
        assert_eq!(id.as_str(), "49a36324-fc4b-4387-aa06-090cfbf0064f");
    }

    #[test]
    fn rejects_garbage_location() {
        assert!(operation_id_from_location("not a url").is_none());
        assert!(operation_id_from_location("https://host").is_none());
    }

    #[test]
    fn running_and_pending() {
        let r: ReadOperationResponse = serde_json::from_str(r#"{"status": "running"}"#).unwrap();
        assert_eq!(r.into_job_status(), JobStatus::Running);
        let r: ReadOperationResponse = serde_json::from_str(r#"{"status": "notStarted"}"#).unwrap();
        assert_eq!(r.into_job_status(), JobStatus::Pending);
    }

    #[test]
    fn succeeded_keeps_page_and_line_order() {
        let body = r#"{
            "status": "succeeded",
            "createdDateTime": "2024-01-01T00:00:00Z",
            "analyzeResult": {
                "version": "3.2.0",
                "readResults": [
                    {"page": 1, "angle": 0, "width": 800, "height": 600, "unit": "pixel",
                     "lines": [{"boundingBox": [0,0,1,1], "text": "NO PARKING", "words": []}]},
                    {"page": 2, "lines": [{"text": "TOW AWAY"}, {"text": "ZONE"}]}
                ]
            }
        }"#;
        let r: ReadOperationResponse = serde_json::from_str(body).unwrap();
        match r.into_job_status() {
            JobStatus::Done { regions } => {
                assert_eq!(regions.len(), 2);
                assert_eq!(regions[0].lines, vec!["NO PARKING"]);
                assert_eq!(regions[1].page, 2);
                assert_eq!(regions[1].lines, vec!["TOW AWAY", "ZONE"]);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn failed_status() {
        let r: ReadOperationResponse = serde_json::from_str(r#"{"status": "failed"}"#).unwrap();
        assert!(matches!(r.into_job_status(), JobStatus::Failed { .. }));
    }
}
