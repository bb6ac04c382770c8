use std::ops::Deref;

use async_trait::async_trait;

use crate::controller::HealthState;
use crate::snapshot::IngressSnapshot;

/// A backend that converges one external system toward an [`IngressSnapshot`].
///
/// `start` and `stop` are called at most once each. `update` may be abandoned at any await
/// point when it runs past the cycle deadline, so whatever it changes externally must be
/// safe to redo from scratch on the next call.
#[async_trait]
pub trait Updater: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn update(&self, snapshot: &IngressSnapshot) -> anyhow::Result<()>;

    fn health(&self) -> HealthState;
}

#[async_trait]
impl<U, T> Updater for T
where
    T: Deref<Target = U> + Send + Sync,
    U: Updater + ?Sized + 'static,
{
    fn name(&self) -> &str {
        self.deref().name()
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.deref().start().await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.deref().stop().await
    }

    async fn update(&self, snapshot: &IngressSnapshot) -> anyhow::Result<()> {
        self.deref().update(snapshot).await
    }

    fn health(&self) -> HealthState {
        self.deref().health()
    }
}
