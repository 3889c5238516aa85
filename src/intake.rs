//! Upload-time trigger for reconciliation.
//!
//! The HTTP layer validates the order number and authenticates the user,
//! then hands the upload here. A newly recorded order gets exactly one
//! reconciliation; re-uploads never start another.

use std::sync::Arc;

use crate::model::Order;
use crate::reconcile::SchedulerHandle;
use crate::store::{OrderStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Recorded as NEW; reconciliation started.
    Accepted,
    /// The same user uploaded this number before.
    AlreadyUploaded,
    /// Another user owns this number.
    OwnedByAnotherUser,
}

pub struct OrderIntake {
    store: Arc<dyn OrderStore>,
    scheduler: SchedulerHandle,
}

impl OrderIntake {
    pub fn new(store: Arc<dyn OrderStore>, scheduler: SchedulerHandle) -> Self {
        Self { store, scheduler }
    }

    pub async fn upload(&self, user_id: &str, order_id: &str) -> Result<UploadOutcome, StoreError> {
        match self.store.add_order(Order::new(user_id, order_id)).await {
            Ok(()) => {}
            Err(StoreError::OrderExists(_)) => {
                let existing = self.store.get_order(order_id).await?;
                return Ok(if existing.user_id == user_id {
                    UploadOutcome::AlreadyUploaded
                } else {
                    UploadOutcome::OwnedByAnotherUser
                });
            }
            Err(e) => return Err(e),
        }

        if !self.scheduler.submit(order_id).await {
            tracing::warn!(order_id = %order_id, "Fresh order was already being reconciled");
        }
        tracing::info!(order_id = %order_id, user_id = %user_id, "Order accepted");
        Ok(UploadOutcome::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::accrual::AccrualStatus;
    use crate::model::OrderStatus;
    use crate::reconcile::{Reconciler, RetryPolicy, Scheduler};
    use crate::store::MemoryStore;
    use crate::testing::ScriptedClient;

    async fn setup(client: ScriptedClient) -> (Arc<MemoryStore>, Arc<ScriptedClient>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        store.add_account("alice").await.unwrap();
        store.add_account("bob").await.unwrap();
        let client = Arc::new(client);
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            client.clone(),
            RetryPolicy::default(),
        ));
        let scheduler = Scheduler::start(reconciler, 2, &CancellationToken::new());
        (store, client, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_starts_reconciliation() {
        let (store, client, scheduler) = setup(ScriptedClient::new(vec![Ok(
            AccrualStatus::Processed { accrual: 50.0 },
        )]))
        .await;
        let intake = OrderIntake::new(store.clone(), scheduler.handle());

        let outcome = tokio_test::assert_ok!(intake.upload("alice", "92345678905").await);
        assert_eq!(outcome, UploadOutcome::Accepted);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.calls(), 1);
        assert_eq!(
            store.get_order("92345678905").await.unwrap().status,
            OrderStatus::Processed
        );
        assert_eq!(store.get_account("alice").await.unwrap().balance, 50.0);
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reupload_does_not_spawn_again() {
        let (store, client, scheduler) =
            setup(ScriptedClient::repeating(Ok(AccrualStatus::Invalid))).await;
        let intake = OrderIntake::new(store.clone(), scheduler.handle());

        assert_eq!(
            intake.upload("alice", "12345678903").await.unwrap(),
            UploadOutcome::Accepted
        );
        assert_eq!(
            intake.upload("alice", "12345678903").await.unwrap(),
            UploadOutcome::AlreadyUploaded
        );
        assert_eq!(
            intake.upload("bob", "12345678903").await.unwrap(),
            UploadOutcome::OwnedByAnotherUser
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.calls(), 1);
        assert_eq!(
            store.get_order("12345678903").await.unwrap().user_id,
            "alice"
        );
        scheduler.shutdown(Duration::from_secs(1)).await;
    }
}
