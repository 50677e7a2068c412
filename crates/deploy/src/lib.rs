//! Deploy flow for content-addressed assets.
//!
//! 1. Hash the (possibly overlaid) source tree into a git tree id
//! 2. Upload it as a tar.gz asset unless the store already has that id
//! 3. Submit a deploy task and wait for it to settle, combining pushed
//!    status events with polling under a deadline
//!
//! Transport lives behind [`AssetStore`] and [`DeployService`] so the flow
//! runs the same against the HTTP client and against test doubles.

pub mod asset;
pub mod deploy;
pub mod error;
pub mod service;
pub mod tracker;
pub mod types;
pub mod wait;

pub use asset::{AssetStore, UploadReceipt, package_and_upload_if_needed};
pub use deploy::Deployer;
pub use error::DeployError;
pub use service::DeployService;
pub use tracker::{DeployStateTracker, DeploySubscription, InFlightGuard};
pub use types::{
    DeployOutcome, DeployReport, DeployRequest, DeployTask, DeployerConfig, PipelineEvent,
    UploadOutcome,
};
pub use wait::{MIN_POLL_INTERVAL, wait_for_completion};

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
