use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::{keys::KeyKind, UploadCtx, UploadId, UploadMetadataCodec, UploadResult, UploadStore};

/// Removes uploads whose expiration has passed
pub struct ExpirationSweeper {
    store: Arc<UploadStore>,
    interval: Duration,
}

impl ExpirationSweeper {
    pub fn new(store: Arc<UploadStore>) -> Self {
        Self {
            store,
            interval: Duration::from_secs(60 * 60),
        }
    }

    pub fn with_interval(store: Arc<UploadStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Ids under the store's prefix whose expiration is at or before `now`.
    ///
    /// A real object's metadata wins over a leftover pending marker of the
    /// same id.
    pub async fn get_expired_ids(&self, ctx: &UploadCtx, now: DateTime<Utc>) -> UploadResult<Vec<UploadId>> {
        let keys = self.store.keys();
        let mut expirations: BTreeMap<UploadId, (bool, Option<DateTime<Utc>>)> = BTreeMap::new();

        ctx.ensure_active()?;
        let mut listing = self.store.backend().list(&keys.list_prefix());
        while let Some(entry) = listing.next().await {
            let entry = entry?;
            let Some(kind) = keys.parse(&entry.name) else {
                continue;
            };

            let is_object = matches!(kind, KeyKind::Object(_));
            let expires_at = UploadMetadataCodec::decode_expiration(&entry.metadata);
            match expirations.get(kind.id()) {
                Some((true, _)) if !is_object => {}
                _ => {
                    expirations.insert(kind.id().clone(), (is_object, expires_at));
                }
            }
        }

        Ok(expirations
            .into_iter()
            .filter(|(_, (_, expires_at))| expires_at.is_some_and(|at| at <= now))
            .map(|(id, _)| id)
            .collect())
    }

    /// Delete every expired upload, returning how many were removed.
    ///
    /// A failed delete is logged and the sweep moves on.
    pub async fn remove_expired(&self, ctx: &UploadCtx, now: DateTime<Utc>) -> UploadResult<usize> {
        let expired = self.get_expired_ids(ctx, now).await?;
        let mut removed = 0;

        for id in expired {
            ctx.ensure_active()?;
            match self.store.delete(ctx.clone(), &id).await {
                Ok(true) => {
                    debug!("Removed expired upload {}", id);
                    removed += 1;
                }
                Ok(false) => debug!("Expired upload {} was already gone", id),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!("Failed to remove expired upload {}: {}", id, e),
            }
        }

        Ok(removed)
    }

    /// Sweep on every tick until `ctx` is cancelled
    pub async fn run(&self, ctx: UploadCtx) {
        let mut ticker = interval(self.interval);

        info!("Starting expiration sweeper with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.remove_expired(&ctx, Utc::now()).await {
                Ok(removed) if removed > 0 => info!("Removed {} expired uploads", removed),
                Ok(_) => debug!("No expired uploads found"),
                Err(e) if e.is_cancelled() => break,
                Err(e) => warn!("Error during expiration sweep: {}", e),
            }
        }

        info!("Expiration sweeper stopped");
    }
}
