use crate::api::AppState;
use crate::attachments::BlobStore;
use crate::db::DbPool;
use crate::messages::referenced_blob_paths;
use anyhow::Result;
use tokio::time::{interval, Duration};

/// Uploads younger than this are left alone; their message may still be composing.
pub const ORPHAN_GRACE_MS: i64 = 24 * 60 * 60 * 1000;

/// Delete blobs no message references any more and that are older than `grace_ms`.
/// Returns the number of blobs removed.
pub async fn sweep_orphans(
    pool: &DbPool,
    blobs: &dyn BlobStore,
    now_ms: i64,
    grace_ms: i64,
) -> Result<usize> {
    let pool = pool.clone();
    let keep = tokio::task::spawn_blocking(move || -> Result<_> {
        let conn = pool.get()?;
        Ok(referenced_blob_paths(&conn)?)
    })
    .await??;
    let mut removed = 0;
    for entry in blobs.list("conversations").await? {
        if keep.contains(&entry.path) || now_ms - entry.modified_ms < grace_ms {
            continue;
        }
        blobs.delete(&entry.path).await?;
        removed += 1;
    }
    Ok(removed)
}

/// Periodically remove orphaned attachment blobs.
pub fn spawn_housekeeping(state: AppState) {
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(300));
        loop {
            tick.tick().await;
            let now = state.service.now_ms();
            match sweep_orphans(state.service.pool(), state.blobs.as_ref(), now, ORPHAN_GRACE_MS).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(removed = n, "orphaned attachments removed"),
                Err(e) => tracing::warn!(error = %e, "housekeeping sweep failed"),
            }
        }
    });
}
