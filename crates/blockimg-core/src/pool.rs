//! Pool validation
//!
//! Images rely on self-managed snapshots. A pool that was ever snapshotted at
//! pool level cannot hand them out, so before the first image goes into a
//! pool we allocate and release one snapshot id to prove it works.

use crate::DIRECTORY_OID;
use crate::store::MetadataStore;

use blockimg_common::config::ImageConfig;
use blockimg_common::{Error, PoolId, Result};
use tracing::{debug, error, warn};

/// Check that `pool` can hold images
pub async fn validate_pool(
    store: &dyn MetadataStore,
    config: &ImageConfig,
    pool: PoolId,
) -> Result<()> {
    if !config.validate_pool {
        return Ok(());
    }

    // A pool with a directory already holds images.
    match store.stat(pool, DIRECTORY_OID).await {
        Ok(_) => return Ok(()),
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            error!("Failed to stat directory of pool {}: {}", pool, e);
            return Err(e);
        }
    }

    let snap_id = match store.selfmanaged_snap_create(pool).await {
        Ok(id) => id,
        Err(Error::InvalidArgument(msg)) => {
            error!("Pool {} not configured for self-managed snapshots: {}", pool, msg);
            return Err(Error::InvalidArgument(msg));
        }
        Err(e) => {
            error!("Failed to allocate snapshot id in pool {}: {}", pool, e);
            return Err(e);
        }
    };

    if let Err(e) = store.selfmanaged_snap_remove(pool, snap_id).await {
        warn!("Failed to release snapshot id {} in pool {}: {}", snap_id, pool, e);
    }
    debug!(pool = %pool, "Pool validated");
    Ok(())
}
