//! Periodic fee rate refresh

use crate::error::{Result, StorageError};
use crate::storage::Storage;
use crate::types::{unix_time, FeeRate};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Source of current network fee rates, in satoshi per byte.
#[async_trait]
pub trait FeeRateProvider: Send + Sync {
    async fn fee_rate(&self) -> Result<FeeRate>;
}

pub struct FeeRateSyncer {
    storage: Arc<Storage>,
    provider: Arc<dyn FeeRateProvider>,
    interval: Duration,
}

impl FeeRateSyncer {
    pub fn new(storage: Arc<Storage>, provider: Arc<dyn FeeRateProvider>, interval: Duration) -> Self {
        FeeRateSyncer {
            storage,
            provider,
            interval,
        }
    }

    /// Last stored rate, or the built-in default before the first refresh.
    pub fn fee_rate(&self) -> FeeRate {
        self.storage.read(|records| records.fee_rate()).unwrap_or_default()
    }

    /// Fetch and store a fresh rate. Rates of zero are ignored.
    pub async fn refresh(&self) -> Result<FeeRate> {
        let mut fee_rate = self.provider.fee_rate().await?;
        if fee_rate.low == 0 || fee_rate.medium == 0 || fee_rate.high == 0 {
            warn!(?fee_rate, "provider returned a zero fee rate");
            return Ok(self.fee_rate());
        }
        if fee_rate.date == 0 {
            fee_rate.date = unix_time();
        }
        self.storage.with_transaction(|records| {
            records.set_fee_rate(fee_rate);
            Ok::<_, StorageError>(())
        })?;
        debug!(low = fee_rate.low, medium = fee_rate.medium, high = fee_rate.high, "fee rate updated");
        Ok(fee_rate)
    }

    /// Refresh every interval while connected; a reconnect triggers an immediate refresh.
    pub fn spawn(self: Arc<Self>, mut connectivity: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if !*connectivity.borrow() {
                            continue;
                        }
                    }
                }
                if !*connectivity.borrow() {
                    continue;
                }
                if let Err(e) = self.refresh().await {
                    warn!(error = %e, "fee rate refresh failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_FEE_RATE;
    use crate::error::SpvError;
    use parking_lot::Mutex;

    struct StaticProvider {
        rates: Mutex<Vec<Result<FeeRate>>>,
    }

    #[async_trait]
    impl FeeRateProvider for StaticProvider {
        async fn fee_rate(&self) -> Result<FeeRate> {
            self.rates
                .lock()
                .pop()
                .unwrap_or_else(|| Err(SpvError::Api("exhausted".into())))
        }
    }

    fn syncer(rates: Vec<Result<FeeRate>>) -> (Arc<FeeRateSyncer>, Arc<Storage>) {
        let storage = Arc::new(Storage::in_memory("fees"));
        let provider = Arc::new(StaticProvider { rates: Mutex::new(rates) });
        (
            Arc::new(FeeRateSyncer::new(storage.clone(), provider, Duration::from_secs(180))),
            storage,
        )
    }

    fn rate(value: u64) -> FeeRate {
        FeeRate {
            low: value,
            medium: value * 2,
            high: value * 3,
            date: 0,
        }
    }

    #[tokio::test]
    async fn test_refresh_stores_rate() {
        let (syncer, storage) = syncer(vec![Ok(rate(5))]);
        assert_eq!(syncer.fee_rate().medium, DEFAULT_FEE_RATE);

        let fresh = syncer.refresh().await.unwrap();
        assert_eq!(fresh.medium, 10);
        assert!(fresh.date > 0);
        assert_eq!(storage.read(|records| records.fee_rate()).map(|rate| rate.high), Some(15));
    }

    #[tokio::test]
    async fn test_failed_or_zero_refresh_keeps_previous() {
        let (syncer, _) = syncer(vec![Err(SpvError::Api("down".into())), Ok(rate(0)), Ok(rate(4))]);
        assert_eq!(syncer.refresh().await.unwrap().low, 4);
        // Zero rate is ignored
        assert_eq!(syncer.refresh().await.unwrap().low, 4);
        assert!(syncer.refresh().await.is_err());
        assert_eq!(syncer.fee_rate().low, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh_while_connected() {
        let (syncer, storage) = syncer(vec![Ok(rate(7)), Ok(rate(6))]);
        let (connectivity_tx, connectivity_rx) = watch::channel(true);
        let task = syncer.clone().spawn(connectivity_rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(storage.read(|records| records.fee_rate()).map(|rate| rate.low), Some(6));
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(storage.read(|records| records.fee_rate()).map(|rate| rate.low), Some(7));

        drop(connectivity_tx);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(task.is_finished());
    }
}
