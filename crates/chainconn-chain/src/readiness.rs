//! Readiness join between the two backends.

use std::sync::Arc;

use chainconn_core::ApiInfo;
use tokio::sync::watch;

use crate::backend::BackendKind;
use crate::error::ChainError;

/// Two one-shot flags released together exactly once per cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadinessBarrier {
    legacy: bool,
    dynamic: bool,
    released: bool,
}

impl ReadinessBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `kind` is ready. Returns `true` only on the call that
    /// completes the pair.
    pub fn signal(&mut self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Legacy => self.legacy = true,
            BackendKind::Dynamic => self.dynamic = true,
        }
        if self.legacy && self.dynamic && !self.released {
            self.released = true;
            return true;
        }
        false
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Readiness of the current cycle. A new cycle starts on every disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    Pending { cycle: u64 },
    Ready { cycle: u64, info: Arc<ApiInfo> },
    Failed { cycle: u64, error: String },
}

impl ReadyState {
    pub fn cycle(&self) -> u64 {
        match self {
            ReadyState::Pending { cycle }
            | ReadyState::Ready { cycle, .. }
            | ReadyState::Failed { cycle, .. } => *cycle,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ReadyState::Ready { .. })
    }
}

/// Wait for the cycle current at call time to settle.
///
/// If that cycle is abandoned for a newer one the future never resolves.
pub(crate) fn wait_ready(
    mut rx: watch::Receiver<ReadyState>,
) -> impl Future<Output = Result<Arc<ApiInfo>, ChainError>> + Send + 'static {
    let cycle = rx.borrow_and_update().cycle();

    async move {
        loop {
            let settled = match &*rx.borrow_and_update() {
                ReadyState::Ready { cycle: c, info } if *c == cycle => Some(Ok(info.clone())),
                ReadyState::Failed { cycle: c, error } if *c == cycle => {
                    Some(Err(ChainError::NotReady(error.clone())))
                }
                _ => None,
            };
            if let Some(result) = settled {
                return result;
            }
            if rx.borrow().cycle() != cycle {
                tracing::debug!("Readiness cycle {} abandoned", cycle);
                return std::future::pending().await;
            }

            if rx.changed().await.is_err() {
                return Err(ChainError::Connection("Connection closed".into()));
            }
        }
    }
}

/// Wait for the first settled cycle at or after `min_cycle`.
///
/// Unlike [`wait_ready`] this follows newer cycles instead of staying pending.
pub(crate) async fn wait_settled(
    mut rx: watch::Receiver<ReadyState>,
    min_cycle: u64,
) -> Result<Arc<ApiInfo>, ChainError> {
    let state = rx
        .wait_for(|s| s.cycle() >= min_cycle && !matches!(s, ReadyState::Pending { .. }))
        .await
        .map_err(|_| ChainError::Connection("Connection closed".into()))?;

    match &*state {
        ReadyState::Ready { info, .. } => Ok(info.clone()),
        ReadyState::Failed { error, .. } => Err(ChainError::NotReady(error.clone())),
        ReadyState::Pending { cycle } => Err(ChainError::NotReady(format!("cycle {} pending", cycle))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainconn_core::{ChainProperties, DefaultFormatBalance};
    use std::time::Duration;

    fn info() -> Arc<ApiInfo> {
        Arc::new(ApiInfo {
            chain_slug: "polkadot".into(),
            spec_name: "polkadot".into(),
            spec_version: "1".into(),
            system_chain: "Polkadot".into(),
            system_name: "Parity Polkadot".into(),
            system_version: "1.0.0".into(),
            properties: ChainProperties::default(),
            default_format_balance: DefaultFormatBalance {
                decimals: vec![12],
                unit: "UNIT".into(),
            },
        })
    }

    #[test]
    fn test_barrier_releases_once() {
        let mut barrier = ReadinessBarrier::new();
        assert!(!barrier.signal(BackendKind::Legacy));
        assert!(!barrier.signal(BackendKind::Legacy));
        assert!(barrier.signal(BackendKind::Dynamic));
        assert!(barrier.is_released());
        assert!(!barrier.signal(BackendKind::Dynamic));
        assert!(!barrier.signal(BackendKind::Legacy));

        barrier.reset();
        assert!(!barrier.is_released());
        assert!(!barrier.signal(BackendKind::Dynamic));
        assert!(barrier.signal(BackendKind::Legacy));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_ready() {
        let (tx, rx) = watch::channel(ReadyState::Pending { cycle: 0 });
        let waiter = tokio::spawn(wait_ready(rx));
        tx.send_replace(ReadyState::Ready {
            cycle: 0,
            info: info(),
        });
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.system_chain, "Polkadot");
    }

    #[tokio::test]
    async fn test_wait_rejects_on_failure() {
        let (tx, rx) = watch::channel(ReadyState::Pending { cycle: 3 });
        let waiter = tokio::spawn(wait_ready(rx));
        tx.send_replace(ReadyState::Failed {
            cycle: 3,
            error: "boom".into(),
        });
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_abandoned_cycle_stays_pending() {
        let (tx, rx) = watch::channel(ReadyState::Pending { cycle: 0 });
        let waiter = tokio::spawn(wait_ready(rx));
        tokio::task::yield_now().await;
        tx.send_replace(ReadyState::Pending { cycle: 1 });
        tx.send_replace(ReadyState::Ready {
            cycle: 1,
            info: info(),
        });

        let result = tokio::time::timeout(Duration::from_millis(50), waiter).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_wait_settled_follows_newer_cycles() {
        let (tx, rx) = watch::channel(ReadyState::Pending { cycle: 2 });
        let waiter = tokio::spawn(wait_settled(rx, 2));
        tx.send_replace(ReadyState::Pending { cycle: 3 });
        tx.send_replace(ReadyState::Ready {
            cycle: 3,
            info: info(),
        });
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_settled_skips_older_cycles() {
        let (tx, rx) = watch::channel(ReadyState::Failed {
            cycle: 1,
            error: "old".into(),
        });
        let waiter = tokio::spawn(wait_settled(rx, 2));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        tx.send_replace(ReadyState::Ready {
            cycle: 2,
            info: info(),
        });
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_fails_when_closed() {
        let (tx, rx) = watch::channel(ReadyState::Pending { cycle: 0 });
        drop(tx);
        assert!(matches!(
            wait_ready(rx).await,
            Err(ChainError::Connection(_))
        ));
    }
}
