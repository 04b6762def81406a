use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::audit::scan_sensitive_fields;
use crate::clock::{Clock, UnixTimeMs};
use crate::crypto::{build_aad, CryptoError, EncryptionService};
use crate::model::PatientId;
use crate::net::OperationIssue;
use crate::secure_store::{SecureStore, StoreError, StoreKey};

/// Persisted state layout: two string-keyed blobs, each an encrypted JSON
/// array under the versioned envelope.
pub const MAIN_QUEUE_KEY: &str = "handover.queue.v1";
pub const DEAD_QUEUE_KEY: &str = "handover.queue.dead.v1";

/// Window inside which a second enqueue for the same patient updates the
/// pending item instead of creating a new one.
pub const MERGE_WINDOW_MS: u64 = 10 * 60 * 1000;

const MAX_QUEUE_ITEMS: usize = 1_000;
const MAX_DEAD_LETTERS: usize = 50;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("queue is full ({0} entries)")]
    Full(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Pending,
    InFlight,
    Synced,
    Error,
}

/// One pending unit of work: a serialized transaction bundle plus the retry
/// bookkeeping the drain loop needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub patient_id: String,
    pub full_urls: Vec<String>,
    /// Serialized bundle; opaque here, only the builder knows its shape.
    pub payload: String,
    /// Sensitive field names detected at enqueue. Audit bookkeeping only,
    /// never used for branching.
    pub sensitive_fields: Vec<String>,
    pub attempts: u32,
    pub created_at: UnixTimeMs,
    pub last_attempt_at: Option<UnixTimeMs>,
    pub next_attempt_at: UnixTimeMs,
    pub sync_status: SyncStatus,
    pub error_message: Option<String>,
}

impl QueueItem {
    /// Item identity is the content-addressed entry set: the same fullUrls
    /// always hash to the same id, which is what makes re-enqueue of an
    /// identical bundle a no-op.
    pub fn compute_id(full_urls: &[String]) -> String {
        if full_urls.is_empty() {
            return "empty".to_string();
        }
        let mut sorted: Vec<&str> = full_urls.iter().map(String::as_str).collect();
        sorted.sort_unstable();

        let mut hasher = blake3::Hasher::new();
        for url in sorted {
            hasher.update(url.as_bytes());
            hasher.update(b"|");
        }
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

/// Dead-letter record: the failed item plus the server's diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub item: QueueItem,
    pub failed_at: UnixTimeMs,
    pub status: Option<u16>,
    #[serde(default)]
    pub issues: Vec<OperationIssue>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New item appended.
    Appended,
    /// Existing pending item for the patient replaced inside the merge window.
    Merged,
    /// Identical fullUrls already queued; nothing changed.
    Duplicate,
}

/// Durable, encrypted, deduplicating persistence for queue items. All reads
/// and writes of the two blobs go through this type; nothing else touches the
/// storage keys.
pub struct QueueStore {
    store: Arc<dyn SecureStore>,
    crypto: Arc<EncryptionService>,
    clock: Arc<dyn Clock>,
    main_key: StoreKey,
    dead_key: StoreKey,
    merge_window_ms: u64,
}

impl QueueStore {
    pub fn new(
        store: Arc<dyn SecureStore>,
        crypto: Arc<EncryptionService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            store,
            crypto,
            clock,
            main_key: StoreKey::new(MAIN_QUEUE_KEY)?,
            dead_key: StoreKey::new(DEAD_QUEUE_KEY)?,
            merge_window_ms: MERGE_WINDOW_MS,
        })
    }

    async fn load<T: serde::de::DeserializeOwned>(
        &self,
        key: &StoreKey,
        store_name: &str,
    ) -> Vec<T> {
        let envelope = match self.store.get(key).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "queue blob unreadable, treating as empty");
                return Vec::new();
            }
        };

        let plaintext = match self.crypto.decrypt(&envelope, &build_aad(store_name)) {
            Ok(p) => p,
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "queue blob undecryptable, treating as empty");
                return Vec::new();
            }
        };

        match serde_json::from_slice(&plaintext) {
            Ok(items) => items,
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "queue blob corrupt, treating as empty");
                Vec::new()
            }
        }
    }

    async fn save<T: Serialize>(
        &self,
        key: &StoreKey,
        store_name: &str,
        items: &[T],
    ) -> Result<(), QueueError> {
        let json =
            serde_json::to_vec(items).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let envelope = self.crypto.encrypt(&json, &build_aad(store_name))?;
        self.store.set(key, &envelope).await?;
        Ok(())
    }

    async fn load_queue(&self) -> Vec<QueueItem> {
        self.load(&self.main_key, "queue").await
    }

    async fn save_queue(&self, items: &[QueueItem]) -> Result<(), QueueError> {
        self.save(&self.main_key, "queue", items).await
    }

    /// Enqueue a serialized bundle. Dedup and merge semantics:
    /// identical fullUrls are a no-op; a different payload for a patient with
    /// a pending item created inside the merge window replaces that item
    /// (fresh attempts, `next_attempt_at` pulled forward, `created_at` kept);
    /// anything else appends.
    #[instrument(skip(self, payload, full_urls), fields(patient_id = %patient_id))]
    pub async fn enqueue(
        &self,
        patient_id: &PatientId,
        payload: String,
        full_urls: Vec<String>,
    ) -> Result<EnqueueOutcome, QueueError> {
        let now = self.clock.now();
        let id = QueueItem::compute_id(&full_urls);
        let mut queue = self.load_queue().await;

        if queue.iter().any(|item| item.id == id) {
            debug!(%id, "identical bundle already queued");
            return Ok(EnqueueOutcome::Duplicate);
        }

        let sensitive_fields = scan_sensitive_fields(&payload);

        if let Some(existing) = queue.iter_mut().find(|item| {
            item.patient_id == patient_id.as_str()
                && now.since(item.created_at) <= self.merge_window_ms
        }) {
            existing.id = id;
            existing.payload = payload;
            existing.full_urls = full_urls;
            existing.sensitive_fields = sensitive_fields;
            existing.attempts = 0;
            existing.next_attempt_at = existing.next_attempt_at.min(now);
            existing.sync_status = SyncStatus::Pending;
            existing.error_message = None;
            self.save_queue(&queue).await?;
            debug!("merged into pending item");
            return Ok(EnqueueOutcome::Merged);
        }

        if queue.len() >= MAX_QUEUE_ITEMS {
            return Err(QueueError::Full(MAX_QUEUE_ITEMS));
        }

        queue.push(QueueItem {
            id,
            patient_id: patient_id.as_str().to_string(),
            full_urls,
            payload,
            sensitive_fields,
            attempts: 0,
            created_at: now,
            last_attempt_at: None,
            next_attempt_at: now,
            sync_status: SyncStatus::Pending,
            error_message: None,
        });
        self.save_queue(&queue).await?;
        Ok(EnqueueOutcome::Appended)
    }

    pub async fn read_all(&self) -> Vec<QueueItem> {
        self.load_queue().await
    }

    /// Items due for dispatch, in FIFO order of readiness.
    pub async fn read_ready(&self, now: UnixTimeMs) -> Vec<QueueItem> {
        let mut ready: Vec<QueueItem> = self
            .load_queue()
            .await
            .into_iter()
            .filter(|item| item.sync_status != SyncStatus::Synced && item.next_attempt_at <= now)
            .collect();
        ready.sort_by_key(|item| item.next_attempt_at);
        ready
    }

    pub async fn get(&self, id: &str) -> Option<QueueItem> {
        self.load_queue().await.into_iter().find(|item| item.id == id)
    }

    /// Replace the stored item with the same id. No-op if it disappeared.
    pub async fn update(&self, item: QueueItem) -> Result<(), QueueError> {
        let mut queue = self.load_queue().await;
        if let Some(slot) = queue.iter_mut().find(|existing| existing.id == item.id) {
            *slot = item;
            self.save_queue(&queue).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<Option<QueueItem>, QueueError> {
        let mut queue = self.load_queue().await;
        let before = queue.len();
        let removed = queue.iter().position(|item| item.id == id).map(|idx| queue.remove(idx));
        if queue.len() != before {
            self.save_queue(&queue).await?;
        }
        Ok(removed)
    }

    /// Append to the dead-letter store, then remove from the main queue. The
    /// dead-letter store keeps the newest records up to its cap.
    #[instrument(skip(self, item, issues, error), fields(id = %item.id))]
    pub async fn move_to_dead_letter(
        &self,
        item: QueueItem,
        status: Option<u16>,
        issues: Vec<OperationIssue>,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let id = item.id.clone();

        let mut dead: Vec<DeadLetterItem> = self.load(&self.dead_key, "queue.dead").await;
        dead.push(DeadLetterItem {
            item,
            failed_at: now,
            status,
            issues,
            error,
        });
        if dead.len() > MAX_DEAD_LETTERS {
            let excess = dead.len() - MAX_DEAD_LETTERS;
            dead.drain(..excess);
        }
        self.save(&self.dead_key, "queue.dead", &dead).await?;

        self.remove(&id).await?;
        warn!(%id, "item moved to dead-letter store");
        Ok(())
    }

    pub async fn read_dead_letters(&self) -> Vec<DeadLetterItem> {
        self.load(&self.dead_key, "queue.dead").await
    }

    pub async fn depth(&self) -> usize {
        self.load_queue().await.len()
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.read_dead_letters().await.len()
    }

    /// Empty both stores. Test and debug tooling only.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.save_queue(&[]).await?;
        self.save::<DeadLetterItem>(&self.dead_key, "queue.dead", &[])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::crypto::testing::SequentialRng;
    use crate::secure_store::MemorySecureStore;

    const NOW: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

    async fn test_store() -> (QueueStore, Arc<MemorySecureStore>, Arc<FixedClock>) {
        let store = Arc::new(MemorySecureStore::new());
        let clock = Arc::new(FixedClock::new(NOW));
        let crypto = Arc::new(
            EncryptionService::ensure_key_with_rng(store.as_ref(), Box::new(SequentialRng::new()))
                .await
                .unwrap(),
        );
        let queue = QueueStore::new(store.clone(), crypto, clock.clone()).unwrap();
        (queue, store, clock)
    }

    fn patient(id: &str) -> PatientId {
        PatientId::new(id).unwrap()
    }

    fn urls(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn enqueue_appends_new_item() {
        let (queue, _, _) = test_store().await;

        let outcome = queue
            .enqueue(&patient("p1"), "{}".into(), urls(&["urn:uuid:a"]))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Appended);

        let items = queue.read_all().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].patient_id, "p1");
        assert_eq!(items[0].attempts, 0);
        assert_eq!(items[0].sync_status, SyncStatus::Pending);
        assert_eq!(items[0].next_attempt_at, NOW);
    }

    #[tokio::test]
    async fn identical_full_urls_dedupe() {
        let (queue, _, _) = test_store().await;
        let p = patient("p1");

        queue
            .enqueue(&p, "{}".into(), urls(&["urn:uuid:a", "urn:uuid:b"]))
            .await
            .unwrap();
        // Same set in different order is still the same logical unit.
        let outcome = queue
            .enqueue(&p, "{}".into(), urls(&["urn:uuid:b", "urn:uuid:a"]))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Duplicate);
        assert_eq!(queue.depth().await, 1);
    }

    #[tokio::test]
    async fn merge_replaces_within_window() {
        let (queue, _, clock) = test_store().await;
        let p = patient("p1");

        queue
            .enqueue(&p, r#"{"v":1}"#.into(), urls(&["urn:uuid:a"]))
            .await
            .unwrap();

        clock.advance_ms(60_000);
        let outcome = queue
            .enqueue(&p, r#"{"v":2}"#.into(), urls(&["urn:uuid:b"]))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Merged);

        let items = queue.read_all().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].full_urls, urls(&["urn:uuid:b"]));
        assert_eq!(items[0].payload, r#"{"v":2}"#);
        assert_eq!(items[0].attempts, 0);
        assert_eq!(items[0].created_at, NOW);
    }

    #[tokio::test]
    async fn merge_pulls_next_attempt_forward() {
        let (queue, _, clock) = test_store().await;
        let p = patient("p1");

        queue
            .enqueue(&p, "{}".into(), urls(&["urn:uuid:a"]))
            .await
            .unwrap();

        // Simulate a backoff pushing the retry out.
        let mut item = queue.read_all().await.remove(0);
        item.attempts = 2;
        item.next_attempt_at = NOW.saturating_add_ms(3_600_000);
        queue.update(item).await.unwrap();

        clock.advance_ms(60_000);
        queue
            .enqueue(&p, r#"{"v":2}"#.into(), urls(&["urn:uuid:b"]))
            .await
            .unwrap();

        let items = queue.read_all().await;
        assert_eq!(items[0].next_attempt_at, UnixTimeMs(NOW.0 + 60_000));
        assert_eq!(items[0].attempts, 0);
    }

    #[tokio::test]
    async fn no_merge_outside_window() {
        let (queue, _, clock) = test_store().await;
        let p = patient("p1");

        queue
            .enqueue(&p, "{}".into(), urls(&["urn:uuid:a"]))
            .await
            .unwrap();

        clock.advance_ms(MERGE_WINDOW_MS + 1);
        let outcome = queue
            .enqueue(&p, "{}".into(), urls(&["urn:uuid:b"]))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Appended);
        assert_eq!(queue.depth().await, 2);
    }

    #[tokio::test]
    async fn different_patients_do_not_merge() {
        let (queue, _, _) = test_store().await;

        queue
            .enqueue(&patient("p1"), "{}".into(), urls(&["urn:uuid:a"]))
            .await
            .unwrap();
        queue
            .enqueue(&patient("p2"), "{}".into(), urls(&["urn:uuid:b"]))
            .await
            .unwrap();
        assert_eq!(queue.depth().await, 2);
    }

    #[tokio::test]
    async fn read_ready_filters_and_orders() {
        let (queue, _, _) = test_store().await;

        queue
            .enqueue(&patient("p1"), "{}".into(), urls(&["urn:uuid:a"]))
            .await
            .unwrap();
        queue
            .enqueue(&patient("p2"), "{}".into(), urls(&["urn:uuid:b"]))
            .await
            .unwrap();

        // Push p1 into the future.
        let mut items = queue.read_all().await;
        let p1 = items.iter_mut().find(|i| i.patient_id == "p1").unwrap();
        p1.next_attempt_at = NOW.saturating_add_ms(10_000);
        let p1 = p1.clone();
        queue.update(p1).await.unwrap();

        let ready = queue.read_ready(NOW).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].patient_id, "p2");

        let ready = queue.read_ready(NOW.saturating_add_ms(10_000)).await;
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].patient_id, "p2");
        assert_eq!(ready[1].patient_id, "p1");
    }

    #[tokio::test]
    async fn remove_deletes_item() {
        let (queue, _, _) = test_store().await;

        queue
            .enqueue(&patient("p1"), "{}".into(), urls(&["urn:uuid:a"]))
            .await
            .unwrap();
        let id = queue.read_all().await[0].id.clone();

        let removed = queue.remove(&id).await.unwrap();
        assert!(removed.is_some());
        assert_eq!(queue.depth().await, 0);
        assert!(queue.remove(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letter_keeps_diagnostics_and_removes_from_main() {
        let (queue, _, _) = test_store().await;

        queue
            .enqueue(&patient("p1"), "{}".into(), urls(&["urn:uuid:a"]))
            .await
            .unwrap();
        let item = queue.read_all().await.remove(0);

        queue
            .move_to_dead_letter(
                item,
                Some(400),
                vec![OperationIssue {
                    severity: Some("error".into()),
                    code: Some("invalid".into()),
                    diagnostics: Some("bad bundle".into()),
                }],
                None,
            )
            .await
            .unwrap();

        assert_eq!(queue.depth().await, 0);
        let dead = queue.read_dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status, Some(400));
        assert_eq!(dead[0].issues[0].diagnostics.as_deref(), Some("bad bundle"));
    }

    #[tokio::test]
    async fn dead_letter_store_is_capped() {
        let (queue, _, clock) = test_store().await;

        for i in 0..(MAX_DEAD_LETTERS + 5) {
            // Distinct patients so nothing merges.
            let p = patient(&format!("p{i}"));
            queue
                .enqueue(&p, "{}".into(), urls(&[&format!("urn:uuid:{i}")]))
                .await
                .unwrap();
            let item = queue
                .read_all()
                .await
                .into_iter()
                .find(|it| it.patient_id == p.as_str())
                .unwrap();
            queue
                .move_to_dead_letter(item, Some(400), vec![], None)
                .await
                .unwrap();
            clock.advance_ms(1);
        }

        let dead = queue.read_dead_letters().await;
        assert_eq!(dead.len(), MAX_DEAD_LETTERS);
        // Oldest records dropped first.
        assert_eq!(dead[0].item.patient_id, "p5");
    }

    #[tokio::test]
    async fn corrupt_blob_reads_as_empty() {
        let (queue, store, _) = test_store().await;

        queue
            .enqueue(&patient("p1"), "{}".into(), urls(&["urn:uuid:a"]))
            .await
            .unwrap();

        let key = StoreKey::new(MAIN_QUEUE_KEY).unwrap();
        store.set(&key, "definitely not an envelope").await.unwrap();
        assert!(queue.read_all().await.is_empty());

        // Valid envelope, garbage plaintext.
        let crypto = EncryptionService::ensure_key(store.as_ref()).await.unwrap();
        let envelope = crypto.encrypt(b"not json", &build_aad("queue")).unwrap();
        store.set(&key, &envelope).await.unwrap();
        assert!(queue.read_all().await.is_empty());
    }

    #[tokio::test]
    async fn queue_survives_reload_with_same_key() {
        let store = Arc::new(MemorySecureStore::new());
        let clock = Arc::new(FixedClock::new(NOW));

        {
            let crypto =
                Arc::new(EncryptionService::ensure_key(store.as_ref()).await.unwrap());
            let queue = QueueStore::new(store.clone(), crypto, clock.clone()).unwrap();
            queue
                .enqueue(&patient("p1"), "{}".into(), urls(&["urn:uuid:a"]))
                .await
                .unwrap();
        }

        let crypto = Arc::new(EncryptionService::ensure_key(store.as_ref()).await.unwrap());
        let queue = QueueStore::new(store.clone(), crypto, clock).unwrap();
        let items = queue.read_all().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].patient_id, "p1");
    }

    #[tokio::test]
    async fn clear_empties_both_stores() {
        let (queue, _, _) = test_store().await;

        queue
            .enqueue(&patient("p1"), "{}".into(), urls(&["urn:uuid:a"]))
            .await
            .unwrap();
        let item = queue.read_all().await.remove(0);
        queue
            .enqueue(&patient("p2"), "{}".into(), urls(&["urn:uuid:b"]))
            .await
            .unwrap();
        queue
            .move_to_dead_letter(item, Some(400), vec![], None)
            .await
            .unwrap();

        queue.clear().await.unwrap();
        assert_eq!(queue.depth().await, 0);
        assert_eq!(queue.dead_letter_count().await, 0);
    }

    #[tokio::test]
    async fn sensitive_fields_recorded_at_enqueue() {
        let (queue, _, _) = test_store().await;
        let payload = r#"{"entry":[{"resource":{"subject":{"reference":"x"},"valueQuantity":{"value":1}}}]}"#;

        queue
            .enqueue(&patient("p1"), payload.into(), urls(&["urn:uuid:a"]))
            .await
            .unwrap();

        let items = queue.read_all().await;
        assert_eq!(items[0].sensitive_fields, vec!["subject", "valueQuantity"]);
    }

    #[test]
    fn compute_id_is_order_insensitive() {
        let a = QueueItem::compute_id(&urls(&["urn:uuid:a", "urn:uuid:b"]));
        let b = QueueItem::compute_id(&urls(&["urn:uuid:b", "urn:uuid:a"]));
        assert_eq!(a, b);
        assert_ne!(a, QueueItem::compute_id(&urls(&["urn:uuid:c"])));
        assert_eq!(QueueItem::compute_id(&[]), "empty");
    }
}
