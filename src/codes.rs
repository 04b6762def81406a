//! Fixed clinical code tables. LOINC for observation codes, UCUM for units,
//! SNOMED CT for the oxygen-therapy reason code. Unit codes must match these
//! strings exactly; the server's conditional-create queries depend on them.

use crate::model::CoreVital;

pub const LOINC_SYSTEM: &str = "http://loinc.org";
pub const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";
pub const SNOMED_SYSTEM: &str = "http://snomed.info/sct";
pub const OBSERVATION_CATEGORY_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/observation-category";
pub const CATEGORY_VITAL_SIGNS: &str = "vital-signs";

/// Identifier namespaces used for conditional creates.
pub const PATIENT_ID_SYSTEM: &str = "urn:handover:ids";
pub const OBSERVATION_ID_SYSTEM: &str = "urn:handover:obs";
pub const MEDICATION_ID_SYSTEM: &str = "urn:handover:meds";
pub const DEVICE_ID_SYSTEM: &str = "urn:handover:devices";
pub const DOCUMENT_ID_SYSTEM: &str = "urn:handover:docs";
pub const COMPOSITION_ID_SYSTEM: &str = "urn:uuid";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObservationCode {
    pub loinc: &'static str,
    pub display: &'static str,
    pub unit: &'static str,
}

pub const HEART_RATE: ObservationCode = ObservationCode {
    loinc: "8867-4",
    display: "Heart rate",
    unit: "/min",
};

pub const RESPIRATORY_RATE: ObservationCode = ObservationCode {
    loinc: "9279-1",
    display: "Respiratory rate",
    unit: "/min",
};

pub const BODY_TEMPERATURE: ObservationCode = ObservationCode {
    loinc: "8310-5",
    display: "Body temperature",
    unit: "Cel",
};

pub const OXYGEN_SATURATION: ObservationCode = ObservationCode {
    loinc: "59408-5",
    display: "Oxygen saturation in Arterial blood by Pulse oximetry",
    unit: "%",
};

pub const SYSTOLIC_BP: ObservationCode = ObservationCode {
    loinc: "8480-6",
    display: "Systolic blood pressure",
    unit: "mm[Hg]",
};

pub const DIASTOLIC_BP: ObservationCode = ObservationCode {
    loinc: "8462-4",
    display: "Diastolic blood pressure",
    unit: "mm[Hg]",
};

pub const GLUCOSE_MASS: ObservationCode = ObservationCode {
    loinc: "2339-0",
    display: "Glucose [Mass/volume] in Blood",
    unit: "mg/dL",
};

pub const GLUCOSE_MOLAR: ObservationCode = ObservationCode {
    loinc: "15074-8",
    display: "Glucose [Moles/volume] in Blood",
    unit: "mmol/L",
};

pub const VITAL_SIGNS_PANEL: ObservationCode = ObservationCode {
    loinc: "85353-1",
    display: "Vital signs panel",
    unit: "",
};

pub const FIO2: ObservationCode = ObservationCode {
    loinc: "3150-0",
    display: "Inhaled oxygen concentration",
    unit: "%",
};

pub const OXYGEN_FLOW: ObservationCode = ObservationCode {
    loinc: "19849-6",
    display: "Oxygen flow rate",
    unit: "L/min",
};

/// SNOMED CT: Oxygen therapy (procedure)
pub const SNOMED_OXYGEN_THERAPY: &str = "46680005";
pub const SNOMED_OXYGEN_THERAPY_DISPLAY: &str = "Oxygen therapy";

pub fn for_core_vital(vital: CoreVital) -> ObservationCode {
    match vital {
        CoreVital::HeartRate => HEART_RATE,
        CoreVital::RespiratoryRate => RESPIRATORY_RATE,
        CoreVital::Temperature => BODY_TEMPERATURE,
        CoreVital::Spo2 => OXYGEN_SATURATION,
        CoreVital::SystolicBp => SYSTOLIC_BP,
        CoreVital::DiastolicBp => DIASTOLIC_BP,
    }
}
