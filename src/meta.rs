//! Descriptive metadata attached to every exported trial.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RecorderError, Result};

pub const FILE_SCHEMA_VERSION: &str = "1.0";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Accepted breath-alcohol range, inclusive.
pub const BAC_RANGE: (f64, f64) = (0.0, 0.4);

/// Where the phone is carried during the walk.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    clap::ValueEnum,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
#[value(rename_all = "camelCase")]
pub enum Position {
    #[default]
    PocketRight,
    PocketLeft,
    Hand,
    Belt,
    Bag,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    clap::ValueEnum,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
#[value(rename_all = "camelCase")]
pub enum Condition {
    #[default]
    Unknown,
    Sober,
    Impaired,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    clap::ValueEnum,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
#[value(rename_all = "camelCase")]
pub enum BacMethod {
    Breathalyzer,
    Other,
}

/// Participant, device and measurement context for one trial.
///
/// `sampling_hz_measured` and `duration_recorded_s` are filled from the
/// quality analysis at export time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMeta {
    pub file_schema_version: String,
    pub app_version: String,
    pub participant_id: String,
    pub session_id: String,
    pub device_model: String,
    pub os_version: String,
    pub position: Position,
    pub orientation_start: String,
    pub condition: Condition,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub age_years: Option<String>,
    #[serde(default)]
    pub height_in: Option<String>,
    #[serde(default)]
    pub weight_lb: Option<String>,
    #[serde(default)]
    pub bac: Option<f64>,
    #[serde(default)]
    pub bac_method: Option<BacMethod>,
    #[serde(default)]
    pub bac_brand_model: Option<String>,
    #[serde(default)]
    pub bac_measured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bac_delay_min: Option<f64>,
    pub sampling_hz_target: u32,
    pub sampling_hz_measured: f64,
    pub duration_target_s: u32,
    pub duration_recorded_s: f64,
    pub preroll_s: f64,
    #[serde(default)]
    pub quality_flags: BTreeMap<String, String>,
}

impl TrialMeta {
    pub fn new(participant_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            file_schema_version: FILE_SCHEMA_VERSION.to_string(),
            app_version: APP_VERSION.to_string(),
            participant_id: participant_id.into(),
            session_id: session_id.into(),
            device_model: std::env::consts::ARCH.to_string(),
            os_version: std::env::consts::OS.to_string(),
            position: Position::default(),
            orientation_start: "portrait".to_string(),
            condition: Condition::default(),
            sex: None,
            age_years: None,
            height_in: None,
            weight_lb: None,
            bac: None,
            bac_method: None,
            bac_brand_model: None,
            bac_measured_at: None,
            bac_delay_min: None,
            sampling_hz_target: 100,
            sampling_hz_measured: 0.0,
            duration_target_s: 30,
            duration_recorded_s: 0.0,
            preroll_s: 0.0,
            quality_flags: BTreeMap::new(),
        }
    }

    /// Rejects what a record must never carry: an empty participant or an
    /// out-of-range BAC reading.
    pub fn validate(&self) -> Result<()> {
        if self.participant_id.trim().is_empty() {
            return Err(RecorderError::InvalidMeta(
                "participant id is required".to_string(),
            ));
        }
        if let Some(bac) = self.bac {
            if !(BAC_RANGE.0..=BAC_RANGE.1).contains(&bac) {
                return Err(RecorderError::InvalidMeta(format!(
                    "BAC {bac} outside [{:.2}, {:.2}]",
                    BAC_RANGE.0, BAC_RANGE.1
                )));
            }
        }
        Ok(())
    }
}
