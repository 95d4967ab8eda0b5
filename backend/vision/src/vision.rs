//! Image description: wire types of the provider's `analyze` response and
//! their conversion into a `DescriptionResult`.

use serde::Deserialize;

use deepeyes_core::{
    AdultSignals, Caption, Colors, DescriptionResult, DetectedObject, Face, Tag,
};

/// Features requested from `analyze`.
pub const VISUAL_FEATURES: &str =
    "Tags,Adult,Categories,Color,Description,Brands,Faces,ImageType,Objects";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    #[serde(default)]
    pub tags: Vec<WireTag>,
    #[serde(default)]
    pub description: Option<WireDescription>,
    #[serde(default)]
    pub faces: Vec<WireFace>,
    #[serde(default)]
    pub objects: Vec<WireObject>,
    #[serde(default)]
    pub color: Option<WireColor>,
    #[serde(default)]
    pub adult: Option<WireAdult>,
}

#[derive(Debug, Deserialize)]
pub struct WireTag {
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
pub struct WireDescription {
    #[serde(default)]
    pub captions: Vec<WireCaption>,
}

#[derive(Debug, Deserialize)]
pub struct WireCaption {
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
pub struct WireFace {
    pub age: u32,
    #[serde(default)]
    pub gender: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireObject {
    pub object: String,
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireColor {
    #[serde(default)]
    pub accent_color: String,
    #[serde(default)]
    pub dominant_colors: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAdult {
    pub is_adult_content: bool,
    pub is_racy_content: bool,
    pub is_gory_content: bool,
    pub adult_score: f64,
    pub racy_score: f64,
    pub gore_score: f64,
}

impl From<AnalyzeResponse> for DescriptionResult {
    fn from(resp: AnalyzeResponse) -> Self {
        let captions = resp
            .description
            .map(|d| d.captions)
            .unwrap_or_default()
            .into_iter()
            .map(|c| Caption { text: c.text, confidence: c.confidence })
            .collect();

        let colors = resp
            .color
            .map(|c| Colors { accent: c.accent_color, dominant: c.dominant_colors })
            .unwrap_or_default();

        let adult = resp
            .adult
            .map(|a| AdultSignals {
                is_adult: a.is_adult_content,
                is_gory: a.is_gory_content,
                is_racy: a.is_racy_content,
                adult_score: a.adult_score,
                gore_score: a.gore_score,
                racy_score: a.racy_score,
            })
            .unwrap_or_default();

        DescriptionResult {
            tags: resp
                .tags
                .into_iter()
                .map(|t| Tag { name: t.name, confidence: t.confidence })
                .collect(),
            captions,
            faces: resp
                .faces
                .into_iter()
                .map(|f| Face {
                    age: f.age,
                    gender: f.gender.unwrap_or_else(|| "Unknown".to_string()),
                })
                .collect(),
            objects: resp
                .objects
                .into_iter()
                .map(|o| DetectedObject { name: o.object, confidence: o.confidence })
                .collect(),
            colors,
            adult,
        }
    }
}
