//! Asset store seam and the upload-if-needed step.

use std::path::PathBuf;

use shipyard_content_hash::{ContentHash, IgnoreRuleSet};
use shipyard_transfer::{ArchiveStream, open_archive_stream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::BoxFuture;
use crate::error::DeployError;
use crate::types::UploadOutcome;

/// What the store reports after accepting an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Checksum the store computed for the uploaded tree.
    pub checksum: String,
}

/// Remote content-addressed asset storage.
pub trait AssetStore: Send + Sync {
    /// Whether an asset with `checksum` is already stored.
    fn asset_exists<'a>(&'a self, checksum: &'a ContentHash)
    -> BoxFuture<'a, Result<bool, DeployError>>;

    /// Uploads the archive stream as the asset for `checksum`.
    fn upload_asset<'a>(
        &'a self,
        archive: ArchiveStream,
        checksum: &'a ContentHash,
    ) -> BoxFuture<'a, Result<UploadReceipt, DeployError>>;
}

/// Uploads `roots` as the asset for `checksum` unless the store already has it.
///
/// A failing existence check is not fatal; the upload goes ahead as if the
/// asset were missing. A confirmed checksum that differs from `checksum` is
/// logged and otherwise accepted.
pub async fn package_and_upload_if_needed(
    store: &dyn AssetStore,
    roots: &[PathBuf],
    ignore: &IgnoreRuleSet,
    checksum: &ContentHash,
    cancel: &CancellationToken,
) -> Result<UploadOutcome, DeployError> {
    match store.asset_exists(checksum).await {
        Ok(true) => {
            info!(%checksum, "asset already stored, skipping upload");
            return Ok(UploadOutcome {
                uploaded: false,
                confirmed_checksum: checksum.to_string(),
            });
        }
        Ok(false) => {}
        Err(e) => {
            warn!(%checksum, error = %e, "asset existence check failed, uploading anyway");
        }
    }

    if cancel.is_cancelled() {
        return Err(DeployError::Cancelled);
    }

    let packaging = cancel.child_token();
    let archive = open_archive_stream(roots.to_vec(), ignore.clone(), packaging.clone())?;
    info!(%checksum, roots = roots.len(), "uploading asset");

    let receipt = tokio::select! {
        _ = cancel.cancelled() => {
            packaging.cancel();
            return Err(DeployError::Cancelled);
        }
        result = store.upload_asset(archive, checksum) => result?,
    };

    if !receipt.checksum.eq_ignore_ascii_case(&checksum.to_hex()) {
        warn!(
            local = %checksum,
            remote = %receipt.checksum,
            "store confirmed a different checksum than computed locally"
        );
    }
    info!(checksum = %receipt.checksum, "asset uploaded");

    Ok(UploadOutcome {
        uploaded: true,
        confirmed_checksum: receipt.checksum,
    })
}
