//! Purchase records and the handler registered for the purchases topic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dispatcher::RecordHandler;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: String,
    pub amount: i64,
}

/// Logs every purchase it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPurchaseProcessor;

#[async_trait]
impl RecordHandler<Purchase> for LoggingPurchaseProcessor {
    async fn handle(&self, purchase: Purchase) -> anyhow::Result<()> {
        info!(
            purchase_id = %purchase.id,
            amount = purchase.amount,
            "Processing purchase"
        );
        Ok(())
    }
}
