use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::UnixTimeMs;
use crate::codes;
use crate::model::{HandoverRecord, MedicationEntry, OxygenTherapy};

// ============================================================================
// Resource types
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Coding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl CodeableConcept {
    fn coded(system: &str, code: &str, display: &str) -> Self {
        Self {
            coding: vec![Coding {
                system: Some(system.to_string()),
                code: Some(code.to_string()),
                display: Some(display.to_string()),
            }],
            text: Some(display.to_string()),
        }
    }

    fn text_only(text: impl Into<String>) -> Self {
        Self {
            coding: Vec::new(),
            text: Some(text.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: String,
    pub system: String,
    pub code: String,
}

impl Quantity {
    fn ucum(value: f64, unit: &str) -> Self {
        Self {
            value,
            unit: unit.to_string(),
            system: codes::UCUM_SYSTEM.to_string(),
            code: unit.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Reference {
    fn to(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            display: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    pub system: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub status: String,
    pub div: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub identifier: Vec<Identifier>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationComponent {
    pub code: CodeableConcept,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<Quantity>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category: Vec<CodeableConcept>,
    pub code: CodeableConcept,
    pub subject: Reference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter: Option<Reference>,
    pub effective_date_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component: Vec<ObservationComponent>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseAndRate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dose_quantity: Option<Quantity>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dosage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<CodeableConcept>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dose_and_rate: Vec<DoseAndRate>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationStatement {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,
    pub status: String,
    pub medication_codeable_concept: CodeableConcept,
    pub subject: Reference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter: Option<Reference>,
    pub effective_date_time: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dosage: Vec<Dosage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub note: Vec<Annotation>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUseStatement {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,
    pub status: String,
    pub subject: Reference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reason_code: Vec<CodeableConcept>,
    pub device: Reference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub note: Vec<Annotation>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentContent {
    pub attachment: Attachment,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encounter: Vec<Reference>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,
    pub status: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<CodeableConcept>,
    pub subject: Reference,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub content: Vec<DocumentContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<DocumentContext>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositionSection {
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Narrative>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
    pub identifier: Identifier,
    pub status: String,
    #[serde(rename = "type")]
    pub comp_type: CodeableConcept,
    pub subject: Reference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter: Option<Reference>,
    pub date: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub author: Vec<Reference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub section: Vec<CompositionSection>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resourceType")]
pub enum Resource {
    Patient(Patient),
    Observation(Observation),
    MedicationStatement(MedicationStatement),
    DeviceUseStatement(DeviceUseStatement),
    DocumentReference(DocumentReference),
    Composition(Composition),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::Patient(_) => "Patient",
            Resource::Observation(_) => "Observation",
            Resource::MedicationStatement(_) => "MedicationStatement",
            Resource::DeviceUseStatement(_) => "DeviceUseStatement",
            Resource::DocumentReference(_) => "DocumentReference",
            Resource::Composition(_) => "Composition",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRequest {
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_none_exist: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    pub full_url: String,
    pub resource: Resource,
    pub request: BundleRequest,
}

/// A FHIR transaction bundle ready for POST to the server root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionBundle {
    pub resource_type: String,
    #[serde(rename = "type")]
    pub bundle_type: String,
    pub entry: Vec<BundleEntry>,
}

impl TransactionBundle {
    /// Content-addressed reference strings of every entry, in bundle order.
    /// The queue keys dedup on this set.
    pub fn full_urls(&self) -> Vec<String> {
        self.entry.iter().map(|e| e.full_url.clone()).collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Deterministic identity helpers
// ============================================================================

fn content_fingerprint(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    hex::encode(&hasher.finalize().as_bytes()[..8])
}

fn deterministic_uuid(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
}

fn encode_query(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn identifier_query(system: &str, value: &str) -> String {
    format!("identifier={}|{}", encode_query(system), encode_query(value))
}

fn iso_datetime(now: UnixTimeMs) -> String {
    DateTime::<Utc>::from_timestamp_millis(now.0 as i64)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn iso_date(now: UnixTimeMs) -> String {
    DateTime::<Utc>::from_timestamp_millis(now.0 as i64)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .format("%Y-%m-%d")
        .to_string()
}

fn normalize_fio2_pct(fio2: f64) -> f64 {
    let pct = if fio2 <= 1.0 { fio2 * 100.0 } else { fio2 };
    pct.round().clamp(21.0, 100.0)
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct BundleOptions {
    /// Emit the aggregate vitals panel (LOINC 85353-1) when at least two
    /// core vitals are present. Off unless the caller opts in.
    pub emit_panel: bool,
}

/// Build the transaction bundle for one handover record.
///
/// Pure and deterministic: the same record and the same `now` produce
/// byte-identical identifier values and `ifNoneExist` queries for every
/// resource, which is what makes at-least-once retries safe against a server
/// doing conditional creates.
pub fn build_handover_bundle(record: &HandoverRecord, now: UnixTimeMs) -> TransactionBundle {
    build_handover_bundle_with(record, now, BundleOptions::default())
}

pub fn build_handover_bundle_with(
    record: &HandoverRecord,
    now: UnixTimeMs,
    options: BundleOptions,
) -> TransactionBundle {
    let patient_id = record.patient_id.as_str();
    let now_iso = iso_datetime(now);
    let date = iso_date(now);

    let patient_full_url = format!("urn:uuid:patient-{patient_id}");
    let subject = Reference::to(patient_full_url.clone());
    let encounter = record
        .encounter_id
        .as_deref()
        .map(|id| Reference::to(format!("Encounter/{id}")));

    let vital_category = vec![CodeableConcept::coded(
        codes::OBSERVATION_CATEGORY_SYSTEM,
        codes::CATEGORY_VITAL_SIGNS,
        "Vital Signs",
    )];

    let mut entries: Vec<BundleEntry> = Vec::new();
    let mut vital_refs: Vec<Reference> = Vec::new();
    let mut oxygen_refs: Vec<Reference> = Vec::new();
    let mut medication_refs: Vec<Reference> = Vec::new();
    let mut attachment_refs: Vec<Reference> = Vec::new();

    // Patient conditional create; every other entry references the
    // placeholder, matching the declared fullUrl exactly.
    entries.push(BundleEntry {
        full_url: patient_full_url.clone(),
        resource: Resource::Patient(Patient {
            identifier: vec![Identifier {
                system: codes::PATIENT_ID_SYSTEM.to_string(),
                value: patient_id.to_string(),
            }],
        }),
        request: BundleRequest {
            method: "POST".to_string(),
            url: "Patient".to_string(),
            if_none_exist: Some(identifier_query(codes::PATIENT_ID_SYSTEM, patient_id)),
        },
    });

    let push_observation = |entries: &mut Vec<BundleEntry>,
                                refs: &mut Vec<Reference>,
                                code: codes::ObservationCode,
                                value: Option<Quantity>,
                                component: Vec<ObservationComponent>| {
        let identifier_value = format!("{}|{}|{}", code.loinc, date, patient_id);
        let full_url = format!("urn:uuid:obs-{}-{}-{}", code.loinc, patient_id, date);

        let mut if_none_parts = vec![
            identifier_query(codes::OBSERVATION_ID_SYSTEM, &identifier_value),
            format!("patient={}", encode_query(&patient_full_url)),
            format!(
                "code={}|{}",
                encode_query(codes::LOINC_SYSTEM),
                encode_query(code.loinc)
            ),
        ];
        if_none_parts.push(format!("effective=eq{date}"));

        entries.push(BundleEntry {
            full_url: full_url.clone(),
            resource: Resource::Observation(Observation {
                identifier: vec![Identifier {
                    system: codes::OBSERVATION_ID_SYSTEM.to_string(),
                    value: identifier_value,
                }],
                status: "final".to_string(),
                category: vital_category.clone(),
                code: CodeableConcept::coded(codes::LOINC_SYSTEM, code.loinc, code.display),
                subject: subject.clone(),
                encounter: encounter.clone(),
                effective_date_time: now_iso.clone(),
                value_quantity: value,
                component,
            }),
            request: BundleRequest {
                method: "POST".to_string(),
                url: "Observation".to_string(),
                if_none_exist: Some(if_none_parts.join("&")),
            },
        });
        refs.push(Reference::to(full_url));
    };

    // One plain Observation per present vital. Out-of-range values are
    // emitted unchanged; range checking happens upstream of the builder.
    let core = record.vitals.present_core();
    for (vital, value) in &core {
        let code = codes::for_core_vital(*vital);
        push_observation(
            &mut entries,
            &mut vital_refs,
            code,
            Some(Quantity::ucum(*value, code.unit)),
            Vec::new(),
        );
    }
    if let Some(v) = record.vitals.glucose_mass() {
        push_observation(
            &mut entries,
            &mut vital_refs,
            codes::GLUCOSE_MASS,
            Some(Quantity::ucum(v, codes::GLUCOSE_MASS.unit)),
            Vec::new(),
        );
    }
    if let Some(v) = record.vitals.glucose_molar() {
        push_observation(
            &mut entries,
            &mut vital_refs,
            codes::GLUCOSE_MOLAR,
            Some(Quantity::ucum(v, codes::GLUCOSE_MOLAR.unit)),
            Vec::new(),
        );
    }

    if options.emit_panel && core.len() >= 2 {
        let component = core
            .iter()
            .map(|(vital, value)| {
                let code = codes::for_core_vital(*vital);
                ObservationComponent {
                    code: CodeableConcept::coded(codes::LOINC_SYSTEM, code.loinc, code.display),
                    value_quantity: Some(Quantity::ucum(*value, code.unit)),
                }
            })
            .collect();
        push_observation(
            &mut entries,
            &mut vital_refs,
            codes::VITAL_SIGNS_PANEL,
            None,
            component,
        );
    }

    if let Some(oxygen) = record.oxygen.as_ref().filter(|o| o.is_active()) {
        if let Some(fio2) = oxygen.fio2.filter(|v| v.is_finite()) {
            push_observation(
                &mut entries,
                &mut oxygen_refs,
                codes::FIO2,
                Some(Quantity::ucum(normalize_fio2_pct(fio2), codes::FIO2.unit)),
                Vec::new(),
            );
        }
        if let Some(flow) = oxygen.flow_l_min.filter(|v| v.is_finite()) {
            push_observation(
                &mut entries,
                &mut oxygen_refs,
                codes::OXYGEN_FLOW,
                Some(Quantity::ucum(flow, codes::OXYGEN_FLOW.unit)),
                Vec::new(),
            );
        }
    }

    for medication in &record.medications {
        let entry = build_medication_entry(
            medication,
            patient_id,
            &subject,
            &encounter,
            &now_iso,
        );
        medication_refs.push(Reference::to(entry.full_url.clone()));
        entries.push(entry);
    }

    if let Some(oxygen) = record.oxygen.as_ref().filter(|o| o.is_active()) {
        let entry = build_device_use_entry(oxygen, patient_id, &date, &subject);
        oxygen_refs.push(Reference::to(entry.full_url.clone()));
        entries.push(entry);
    }

    if let Some(attachment) = &record.attachment {
        let fp = content_fingerprint(&[&attachment.url]);
        let identifier_value = format!("{patient_id}|{fp}");
        let full_url = format!("urn:uuid:doc-{fp}-{patient_id}");

        entries.push(BundleEntry {
            full_url: full_url.clone(),
            resource: Resource::DocumentReference(DocumentReference {
                identifier: vec![Identifier {
                    system: codes::DOCUMENT_ID_SYSTEM.to_string(),
                    value: identifier_value.clone(),
                }],
                status: "current".to_string(),
                doc_type: Some(CodeableConcept::text_only("Handover attachments")),
                subject: subject.clone(),
                date: now_iso.clone(),
                description: attachment.description.clone(),
                content: vec![DocumentContent {
                    attachment: Attachment {
                        url: attachment.url.clone(),
                        content_type: attachment.content_type.clone(),
                        title: attachment.description.clone(),
                    },
                }],
                context: encounter.as_ref().map(|enc| DocumentContext {
                    encounter: vec![enc.clone()],
                }),
            }),
            request: BundleRequest {
                method: "POST".to_string(),
                url: "DocumentReference".to_string(),
                if_none_exist: Some(identifier_query(
                    codes::DOCUMENT_ID_SYSTEM,
                    &identifier_value,
                )),
            },
        });
        attachment_refs.push(Reference::to(full_url));
    }

    // Composition last: it groups everything above into named sections.
    let title = record
        .title
        .clone()
        .unwrap_or_else(|| format!("Handover {patient_id}"));
    let composition_uuid = deterministic_uuid(&["composition", patient_id, &date, &title]);

    let mut sections = Vec::new();
    if !vital_refs.is_empty() {
        sections.push(CompositionSection {
            title: "Vital signs".to_string(),
            entry: vital_refs,
            text: None,
        });
    }
    if !medication_refs.is_empty() {
        sections.push(CompositionSection {
            title: "Medications".to_string(),
            entry: medication_refs,
            text: None,
        });
    }
    if !oxygen_refs.is_empty() {
        sections.push(CompositionSection {
            title: "Oxygen therapy".to_string(),
            entry: oxygen_refs,
            text: None,
        });
    }
    if !attachment_refs.is_empty() {
        sections.push(CompositionSection {
            title: "Attachments".to_string(),
            entry: attachment_refs,
            text: None,
        });
    }
    for (section_title, text) in record.sbar.blocks() {
        sections.push(CompositionSection {
            title: section_title.to_string(),
            entry: Vec::new(),
            text: Some(Narrative {
                status: "generated".to_string(),
                div: text.to_string(),
            }),
        });
    }

    entries.push(BundleEntry {
        full_url: format!("urn:uuid:{composition_uuid}"),
        resource: Resource::Composition(Composition {
            identifier: Identifier {
                system: codes::COMPOSITION_ID_SYSTEM.to_string(),
                value: composition_uuid.clone(),
            },
            status: "final".to_string(),
            comp_type: CodeableConcept::text_only("Clinical handover"),
            subject,
            encounter,
            date: now_iso,
            title,
            author: record
                .author_id
                .as_deref()
                .map(|id| vec![Reference::to(format!("Practitioner/{id}"))])
                .unwrap_or_default(),
            section: sections,
        }),
        request: BundleRequest {
            method: "POST".to_string(),
            url: "Composition".to_string(),
            if_none_exist: Some(format!(
                "identifier={}|{composition_uuid}",
                codes::COMPOSITION_ID_SYSTEM
            )),
        },
    });

    TransactionBundle {
        resource_type: "Bundle".to_string(),
        bundle_type: "transaction".to_string(),
        entry: entries,
    }
}

fn build_medication_entry(
    medication: &MedicationEntry,
    patient_id: &str,
    subject: &Reference,
    encounter: &Option<Reference>,
    now_iso: &str,
) -> BundleEntry {
    let name = medication.name.as_deref();
    let coded = medication.code.as_ref();
    let effective = medication
        .administered_at
        .clone()
        .unwrap_or_else(|| now_iso.to_string());

    let fp = content_fingerprint(&[
        name.unwrap_or(""),
        coded.and_then(|c| c.code.as_deref()).unwrap_or(""),
        &medication.dose.map(|d| d.to_string()).unwrap_or_default(),
        medication.unit.as_deref().unwrap_or(""),
        medication.route.as_deref().unwrap_or(""),
        &effective,
    ]);
    let identifier_value = format!("{patient_id}|{fp}");
    let full_url = format!("urn:uuid:med-{fp}-{patient_id}");

    let medication_concept = match coded {
        Some(c) if c.code.is_some() || c.display.is_some() => CodeableConcept {
            coding: vec![Coding {
                system: c.system.clone(),
                code: c.code.clone(),
                display: c.display.clone(),
            }],
            text: name
                .map(str::to_string)
                .or_else(|| c.display.clone()),
        },
        _ => CodeableConcept::text_only(name.unwrap_or("Medication")),
    };

    let dosage_text = {
        let parts: Vec<String> = [
            medication.dose.map(|d| d.to_string()),
            medication.unit.clone(),
            medication.route.clone(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    };

    let dose_and_rate = match medication.dose.filter(|d| d.is_finite()) {
        Some(dose) => vec![DoseAndRate {
            dose_quantity: Some(Quantity {
                value: dose,
                unit: medication.unit.clone().unwrap_or_default(),
                system: codes::UCUM_SYSTEM.to_string(),
                code: medication.unit.clone().unwrap_or_default(),
            }),
        }],
        None => Vec::new(),
    };

    BundleEntry {
        full_url,
        resource: Resource::MedicationStatement(MedicationStatement {
            identifier: vec![Identifier {
                system: codes::MEDICATION_ID_SYSTEM.to_string(),
                value: identifier_value.clone(),
            }],
            status: "completed".to_string(),
            medication_codeable_concept: medication_concept,
            subject: subject.clone(),
            encounter: encounter.clone(),
            effective_date_time: effective,
            dosage: vec![Dosage {
                text: dosage_text,
                route: medication
                    .route
                    .as_deref()
                    .map(CodeableConcept::text_only),
                dose_and_rate,
            }],
            note: medication
                .note
                .as_deref()
                .map(|text| vec![Annotation { text: text.to_string() }])
                .unwrap_or_default(),
        }),
        request: BundleRequest {
            method: "POST".to_string(),
            url: "MedicationStatement".to_string(),
            if_none_exist: Some(identifier_query(
                codes::MEDICATION_ID_SYSTEM,
                &identifier_value,
            )),
        },
    }
}

fn build_device_use_entry(
    oxygen: &OxygenTherapy,
    patient_id: &str,
    date: &str,
    subject: &Reference,
) -> BundleEntry {
    let fp = content_fingerprint(&[
        oxygen.device.as_deref().unwrap_or(""),
        &oxygen.flow_l_min.map(|v| v.to_string()).unwrap_or_default(),
        &oxygen.fio2.map(|v| v.to_string()).unwrap_or_default(),
    ]);
    let identifier_value = format!("{patient_id}|{date}|{fp}");
    let full_url = format!("urn:uuid:dus-{patient_id}-{date}");

    let mut note_parts = Vec::new();
    if let Some(device) = &oxygen.device {
        note_parts.push(format!("Device: {device}"));
    }
    if let Some(flow) = oxygen.flow_l_min.filter(|v| v.is_finite()) {
        note_parts.push(format!("Flow: {flow} L/min"));
    }
    if let Some(fio2) = oxygen.fio2.filter(|v| v.is_finite()) {
        note_parts.push(format!("FiO2: {}%", normalize_fio2_pct(fio2)));
    }

    BundleEntry {
        full_url,
        resource: Resource::DeviceUseStatement(DeviceUseStatement {
            identifier: vec![Identifier {
                system: codes::DEVICE_ID_SYSTEM.to_string(),
                value: identifier_value.clone(),
            }],
            status: "active".to_string(),
            subject: subject.clone(),
            reason_code: vec![CodeableConcept::coded(
                codes::SNOMED_SYSTEM,
                codes::SNOMED_OXYGEN_THERAPY,
                codes::SNOMED_OXYGEN_THERAPY_DISPLAY,
            )],
            device: Reference {
                reference: None,
                display: Some(
                    oxygen
                        .device
                        .clone()
                        .unwrap_or_else(|| "Oxygen delivery device".to_string()),
                ),
            },
            note: if note_parts.is_empty() {
                Vec::new()
            } else {
                vec![Annotation {
                    text: note_parts.join(" | "),
                }]
            },
        }),
        request: BundleRequest {
            method: "POST".to_string(),
            url: "DeviceUseStatement".to_string(),
            if_none_exist: Some(identifier_query(codes::DEVICE_ID_SYSTEM, &identifier_value)),
        },
    }
}
