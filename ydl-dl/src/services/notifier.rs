//! Outbound notification of batch outcomes
//!
//! Delivery is fire-and-forget: implementations swallow and log their own
//! failures so a batch never fails because a notice could not be sent.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::models::Owner;
use crate::services::resolver::item_url;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Archive is ready; `errors` lists links of items that failed
    async fn notify_ready(&self, owner: &Owner, errors: &[String]);

    async fn notify_failed(&self, owner: &Owner);
}

/// Links reported to the owner for failed item ids
pub fn failure_links(failed_ids: &[String]) -> Vec<String> {
    failed_ids.iter().map(|id| item_url(id)).collect()
}

/// Notifier writing notices to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_ready(&self, owner: &Owner, errors: &[String]) {
        match owner {
            Owner::User(_) => info!(%owner, failed = errors.len(), errors = ?errors, "Batch ready notice"),
            Owner::Ip(_) => warn!(%owner, "Ready notice skipped: anonymous owner has no address"),
        }
    }

    async fn notify_failed(&self, owner: &Owner) {
        match owner {
            Owner::User(_) => info!(%owner, "Batch failed notice"),
            Owner::Ip(_) => warn!(%owner, "Failure notice skipped: anonymous owner has no address"),
        }
    }
}
