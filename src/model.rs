use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Validated patient identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatientId(String);

impl PatientId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(ModelError::InvalidId("PatientId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ModelError::InvalidId(format!(
                "PatientId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ModelError::InvalidId(
                "PatientId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _, .)".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PatientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Vital signs captured at handover. Every field is independently optional;
/// non-finite values are treated as absent by the bundle builder.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    pub heart_rate: Option<f64>,
    pub respiratory_rate: Option<f64>,
    pub temperature_c: Option<f64>,
    pub spo2_percent: Option<f64>,
    pub systolic_bp: Option<f64>,
    pub diastolic_bp: Option<f64>,
    pub glucose_mg_dl: Option<f64>,
    pub glucose_mmol_l: Option<f64>,
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|n| n.is_finite())
}

impl Vitals {
    /// Core vitals eligible for the aggregate panel, in fixed emission order.
    pub fn present_core(&self) -> Vec<(CoreVital, f64)> {
        let mut out = Vec::new();
        if let Some(v) = finite(self.heart_rate) {
            out.push((CoreVital::HeartRate, v));
        }
        if let Some(v) = finite(self.respiratory_rate) {
            out.push((CoreVital::RespiratoryRate, v));
        }
        if let Some(v) = finite(self.temperature_c) {
            out.push((CoreVital::Temperature, v));
        }
        if let Some(v) = finite(self.spo2_percent) {
            out.push((CoreVital::Spo2, v));
        }
        if let Some(v) = finite(self.systolic_bp) {
            out.push((CoreVital::SystolicBp, v));
        }
        if let Some(v) = finite(self.diastolic_bp) {
            out.push((CoreVital::DiastolicBp, v));
        }
        out
    }

    pub fn glucose_mass(&self) -> Option<f64> {
        finite(self.glucose_mg_dl)
    }

    pub fn glucose_molar(&self) -> Option<f64> {
        finite(self.glucose_mmol_l)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoreVital {
    HeartRate,
    RespiratoryRate,
    Temperature,
    Spo2,
    SystolicBp,
    DiastolicBp,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MedicationCode {
    pub system: Option<String>,
    pub code: Option<String>,
    pub display: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MedicationEntry {
    pub name: Option<String>,
    pub code: Option<MedicationCode>,
    pub dose: Option<f64>,
    pub unit: Option<String>,
    pub route: Option<String>,
    /// ISO 8601 administration time; the build timestamp is used when absent.
    pub administered_at: Option<String>,
    pub note: Option<String>,
}

/// Oxygen therapy descriptor. `active` gates the DeviceUseStatement; flow and
/// FiO2 additionally produce their own observations when present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OxygenTherapy {
    pub active: bool,
    pub device: Option<String>,
    pub flow_l_min: Option<f64>,
    /// Either a 0..1 fraction or a 21..100 percentage; normalized on emit.
    pub fio2: Option<f64>,
}

impl OxygenTherapy {
    pub fn is_active(&self) -> bool {
        self.active
            || self.device.is_some()
            || finite(self.flow_l_min).is_some()
            || finite(self.fio2).is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioAttachment {
    pub url: String,
    pub content_type: Option<String>,
    pub description: Option<String>,
}

/// SBAR narrative blocks, each independently optional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SbarNote {
    pub situation: Option<String>,
    pub background: Option<String>,
    pub assessment: Option<String>,
    pub recommendation: Option<String>,
}

impl SbarNote {
    pub fn blocks(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if let Some(s) = self.situation.as_deref() {
            out.push(("Situation", s));
        }
        if let Some(s) = self.background.as_deref() {
            out.push(("Background", s));
        }
        if let Some(s) = self.assessment.as_deref() {
            out.push(("Assessment", s));
        }
        if let Some(s) = self.recommendation.as_deref() {
            out.push(("Recommendation", s));
        }
        out
    }
}

/// One handover capture, validated upstream, ready for bundle construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandoverRecord {
    pub patient_id: PatientId,
    pub encounter_id: Option<String>,
    pub author_id: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub vitals: Vitals,
    #[serde(default)]
    pub medications: Vec<MedicationEntry>,
    pub oxygen: Option<OxygenTherapy>,
    pub attachment: Option<AudioAttachment>,
    #[serde(default)]
    pub sbar: SbarNote,
}

impl HandoverRecord {
    pub fn new(patient_id: PatientId) -> Self {
        Self {
            patient_id,
            encounter_id: None,
            author_id: None,
            title: None,
            vitals: Vitals::default(),
            medications: Vec::new(),
            oxygen: None,
            attachment: None,
            sbar: SbarNote::default(),
        }
    }
}
