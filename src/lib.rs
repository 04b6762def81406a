//! Offline-first synchronization engine for clinical handover records.
//!
//! Handovers captured on a device with intermittent connectivity are turned
//! into idempotent FHIR transaction bundles, persisted in an encrypted
//! durable queue, and later delivered to the clinical-data server with
//! at-least-once retries that are safe to replay: every resource carries a
//! deterministic identifier and a conditional-create directive, so the server
//! no-ops on anything it has already applied (a 409 counts as delivered).
//!
//! The host application injects the leaf dependencies (secure storage, time
//! source, network transport, token provider) and decides when to drain; the
//! engine itself is a pure state machine that never schedules its own
//! wakeups.

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod audit;
pub mod bundle;
pub mod clock;
pub mod codes;
pub mod crypto;
pub mod model;
pub mod net;
pub mod queue;
pub mod secure_store;
pub mod sync;

pub use bundle::{build_handover_bundle, build_handover_bundle_with, BundleOptions, TransactionBundle};
pub use clock::{Clock, FixedClock, SystemClock, UnixTimeMs};
pub use crypto::{CryptoError, EncryptionService};
pub use model::{
    AudioAttachment, HandoverRecord, MedicationEntry, OxygenTherapy, PatientId, SbarNote, Vitals,
};
pub use net::{
    HttpNetworkClient, NetError, NetworkClient, NetworkConfig, OperationIssue, PostResponse,
    TokenProvider, ValidatedUrl,
};
pub use queue::{
    DeadLetterItem, EnqueueOutcome, QueueError, QueueItem, QueueStore, SyncStatus,
};
pub use secure_store::{
    FileSecureStore, MemorySecureStore, SecureStore, StoreError, StoreKey,
};
pub use sync::{backoff_delay_ms, DrainReport, SyncEngine, SyncError};
