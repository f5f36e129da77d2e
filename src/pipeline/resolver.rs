//! Dedup/update resolver — decides whether an accepted order is new, an
//! edit of an earlier post, a repeat, or already being published elsewhere.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::pipeline::fingerprint::OrderFingerprint;
use crate::store::{OrderStore, PublishedOrderRecord, with_timeout};

/// What to do with an accepted order.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishIntent {
    /// First sighting. The caller now holds the fingerprint reservation.
    New,
    /// Same order with changed content; edit the existing post.
    Update(PublishedOrderRecord),
    /// Same order, same content.
    Skip(PublishedOrderRecord),
    /// Another worker holds the reservation and has not committed yet.
    Blocked,
}

/// First and largest pause while another worker holds the reservation.
const BLOCKED_POLL_START: Duration = Duration::from_millis(50);
const BLOCKED_POLL_MAX: Duration = Duration::from_secs(2);

pub struct DedupResolver {
    store: Arc<dyn OrderStore>,
    reservation_ttl: Duration,
    dedup_window: Duration,
    store_timeout: Duration,
}

impl DedupResolver {
    pub fn new(
        store: Arc<dyn OrderStore>,
        reservation_ttl: Duration,
        dedup_window: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            reservation_ttl,
            dedup_window,
            store_timeout,
        }
    }

    /// Resolve the intent for `fingerprint` carrying `content_hash`.
    ///
    /// Returns `New` only after winning the reservation. Storage failures
    /// surface as [`PipelineError::Dedup`].
    pub async fn resolve(
        &self,
        fingerprint: &OrderFingerprint,
        content_hash: &str,
    ) -> Result<PublishIntent, PipelineError> {
        if let Some(intent) = self.existing(fingerprint, content_hash).await? {
            return Ok(intent);
        }

        let reserved = with_timeout(
            self.store_timeout,
            self.store
                .reserve_fingerprint(fingerprint.as_str(), self.reservation_ttl),
        )
        .await
        .map_err(PipelineError::Dedup)?;

        if reserved {
            // A commit can land between the lookup and the reserve.
            return match self.existing(fingerprint, content_hash).await {
                Ok(None) => {
                    debug!(fingerprint = %fingerprint, "Fingerprint reserved");
                    Ok(PublishIntent::New)
                }
                Ok(Some(intent)) => {
                    debug!(fingerprint = %fingerprint, "Record committed during reserve");
                    self.release_quietly(fingerprint).await;
                    Ok(intent)
                }
                Err(e) => {
                    self.release_quietly(fingerprint).await;
                    Err(e)
                }
            };
        }

        // Lost the race; the winner may have committed in the meantime.
        Ok(self
            .existing(fingerprint, content_hash)
            .await?
            .unwrap_or(PublishIntent::Blocked))
    }

    /// Resolve, polling with backoff while another worker holds the
    /// reservation. Gives up with `Blocked` once the reservation TTL has
    /// passed without the holder committing or releasing.
    pub async fn resolve_waiting(
        &self,
        fingerprint: &OrderFingerprint,
        content_hash: &str,
    ) -> Result<PublishIntent, PipelineError> {
        let deadline = Instant::now() + self.reservation_ttl;
        let mut delay = BLOCKED_POLL_START;
        loop {
            let intent = self.resolve(fingerprint, content_hash).await?;
            if intent != PublishIntent::Blocked {
                return Ok(intent);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(PublishIntent::Blocked);
            }
            debug!(
                fingerprint = %fingerprint,
                delay_ms = delay.as_millis() as u64,
                "Fingerprint in flight, waiting"
            );
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(BLOCKED_POLL_MAX);
        }
    }

    /// Drop the reservation for `fingerprint`.
    pub async fn release(&self, fingerprint: &OrderFingerprint) -> Result<(), PipelineError> {
        with_timeout(
            self.store_timeout,
            self.store.release_fingerprint(fingerprint.as_str()),
        )
        .await
        .map_err(PipelineError::Dedup)
    }

    async fn release_quietly(&self, fingerprint: &OrderFingerprint) {
        if let Err(e) = self.release(fingerprint).await {
            warn!(fingerprint = %fingerprint, error = %e, "Failed to release reservation");
        }
    }

    async fn existing(
        &self,
        fingerprint: &OrderFingerprint,
        content_hash: &str,
    ) -> Result<Option<PublishIntent>, PipelineError> {
        let record = with_timeout(
            self.store_timeout,
            self.store.get_record(fingerprint.as_str()),
        )
        .await
        .map_err(PipelineError::Dedup)?;

        let Some(record) = record else {
            return Ok(None);
        };
        if !self.is_live(&record) {
            debug!(fingerprint = %fingerprint, "Record outside dedup window, treating as new");
            return Ok(None);
        }

        if record.content_hash == content_hash {
            Ok(Some(PublishIntent::Skip(record)))
        } else {
            Ok(Some(PublishIntent::Update(record)))
        }
    }

    fn is_live(&self, record: &PublishedOrderRecord) -> bool {
        let Ok(window) = chrono::Duration::from_std(self.dedup_window) else {
            return true;
        };
        Utc::now() - record.updated_at <= window
    }
}
