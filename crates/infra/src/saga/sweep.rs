//! Marks sagas that outlived their timeout as stuck.
//!
//! Stuck sagas are only reported; nothing is retried or compensated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use atlas_core::{Clock, CoreError, OperationContext, SystemClock, Tenant, TransactionId};

use crate::saga::store::{SagaStatus, SagaStore};
use crate::worker::PeriodicTask;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct StuckSagaSweep {
    store: Arc<dyn SagaStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl StuckSagaSweep {
    pub fn new(store: Arc<dyn SagaStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass over every tenant; returns the sagas marked stuck.
    pub async fn sweep(&self) -> Result<Vec<(Tenant, TransactionId)>, CoreError> {
        let ctx = OperationContext::background().without_tenant_filter();
        let now = self.clock.now();
        let timed_out = self
            .store
            .list_timed_out(&ctx, now)
            .await
            .map_err(CoreError::from)?;

        let mut stuck = Vec::with_capacity(timed_out.len());
        for record in timed_out {
            let transaction_id = record.transaction_id();
            // Skipped when the orchestrator wrote the saga after it was listed.
            if !self
                .store
                .set_status(&ctx, transaction_id, record.version, SagaStatus::Stuck)
                .await
                .map_err(CoreError::from)?
            {
                debug!(transaction_id = %transaction_id, "saga moved on during sweep, skipping");
                continue;
            }
            let current = record
                .saga
                .current_step()
                .map(|(_, s)| s.step_id.clone())
                .unwrap_or_default();
            warn!(
                tenant_id = %record.tenant.id(),
                transaction_id = %transaction_id,
                saga_type = record.saga.saga_type.as_str(),
                status = %record.status,
                current_step = %current,
                "saga timed out; marked stuck"
            );
            stuck.push((record.tenant, transaction_id));
        }
        if !stuck.is_empty() {
            info!(count = stuck.len(), "stuck saga sweep finished");
        }
        Ok(stuck)
    }
}

#[async_trait]
impl PeriodicTask for StuckSagaSweep {
    fn name(&self) -> &str {
        "stuck-saga-sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<(), CoreError> {
        self.sweep().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use chrono::DateTime;

    use super::*;
    use crate::registry::test_support::tenant;
    use crate::saga::store::{InMemorySagaStore, SagaRecord, SagaStoreError};
    use atlas_core::{CharacterId, ChannelId, ManualClock, WorldId};
    use atlas_saga::payload::SetHp;
    use atlas_saga::{Action, Saga, SagaType, Step};

    fn respawn(tx: TransactionId) -> Saga {
        Saga::new(tx, SagaType::CharacterRespawn, "character:3")
            .with_step(Step::pending(
                "heal",
                Action::SetHp(SetHp {
                    character_id: CharacterId(3),
                    world_id: WorldId(0),
                    channel_id: ChannelId(1),
                    amount: 50,
                }),
                Utc::now(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn only_open_sagas_past_their_timeout_are_marked() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(InMemorySagaStore::new());
        let gms = tenant("GMS");
        let ems = tenant("EMS");

        let mut ids = Vec::new();
        for (tenant, timeout) in [(&gms, 60), (&ems, 60), (&gms, 600)] {
            let tx = TransactionId::new();
            let ctx = OperationContext::background().with_tenant(tenant.clone());
            let mut record =
                SagaRecord::new(tenant.clone(), respawn(tx), start, Duration::from_secs(timeout));
            store.put(&ctx, &mut record).await.unwrap();
            ids.push(tx);
        }
        let done = OperationContext::background().with_tenant(gms.clone());
        store.set_status(&done, ids[0], 1, SagaStatus::Completed).await.unwrap();

        clock.advance(Duration::from_secs(120));
        let sweep = StuckSagaSweep::new(store.clone()).with_clock(clock);
        let stuck = sweep.sweep().await.unwrap();
        assert_eq!(stuck, vec![(ems.clone(), ids[1])]);

        let ctx = OperationContext::background().with_tenant(ems);
        let record = store.get(&ctx, ids[1]).await.unwrap().unwrap();
        assert_eq!(record.status, SagaStatus::Stuck);
        assert!(sweep.sweep().await.unwrap().is_empty());
    }

    /// Store where the orchestrator finishes a saga right after the sweep listed it.
    struct CompletesAfterListing {
        inner: InMemorySagaStore,
        tenant: Tenant,
    }

    #[async_trait]
    impl SagaStore for CompletesAfterListing {
        async fn get(
            &self,
            ctx: &OperationContext,
            transaction_id: TransactionId,
        ) -> Result<Option<SagaRecord>, SagaStoreError> {
            self.inner.get(ctx, transaction_id).await
        }

        async fn put(&self, ctx: &OperationContext, record: &mut SagaRecord) -> Result<(), SagaStoreError> {
            self.inner.put(ctx, record).await
        }

        async fn set_status(
            &self,
            ctx: &OperationContext,
            transaction_id: TransactionId,
            expected_version: u64,
            status: SagaStatus,
        ) -> Result<bool, SagaStoreError> {
            self.inner.set_status(ctx, transaction_id, expected_version, status).await
        }

        async fn list_active(&self, ctx: &OperationContext) -> Result<Vec<SagaRecord>, SagaStoreError> {
            self.inner.list_active(ctx).await
        }

        async fn list_timed_out(
            &self,
            ctx: &OperationContext,
            now: DateTime<Utc>,
        ) -> Result<Vec<SagaRecord>, SagaStoreError> {
            let listed = self.inner.list_timed_out(ctx, now).await?;
            let owner = OperationContext::background().with_tenant(self.tenant.clone());
            for record in &listed {
                let mut finished = record.clone();
                finished.status = SagaStatus::Completed;
                self.inner.put(&owner, &mut finished).await?;
            }
            Ok(listed)
        }
    }

    #[tokio::test]
    async fn saga_finished_after_listing_keeps_its_terminal_status() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let gms = tenant("GMS");
        let store = Arc::new(CompletesAfterListing {
            inner: InMemorySagaStore::new(),
            tenant: gms.clone(),
        });
        let ctx = OperationContext::background().with_tenant(gms.clone());
        let tx = TransactionId::new();
        let mut record = SagaRecord::new(gms.clone(), respawn(tx), start, Duration::from_secs(60));
        store.put(&ctx, &mut record).await.unwrap();

        clock.advance(Duration::from_secs(120));
        let sweep = StuckSagaSweep::new(store.clone()).with_clock(clock);
        assert!(sweep.sweep().await.unwrap().is_empty());

        let record = store.get(&ctx, tx).await.unwrap().unwrap();
        assert_eq!(record.status, SagaStatus::Completed);
    }
}
