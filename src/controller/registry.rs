//! Registry of controllers, one per declared-resource kind.
//!
//! The registry is built once at process startup and then run to
//! completion; controller wiring is explicit, never ambient global state.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::external::ExternalKind;
use crate::Error;

use super::Controller;

/// Object-safe handle for a registered controller.
#[async_trait]
trait RunnableController: Send + Sync {
    fn name(&self) -> &str;
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), Error>;
}

#[async_trait]
impl<K: ExternalKind> RunnableController for Controller<K> {
    fn name(&self) -> &str {
        Controller::name(self)
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), Error> {
        (*self).run(cancel).await
    }
}

/// Explicit set of controllers built once at startup.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: Vec<Box<dyn RunnableController>>,
}

impl ControllerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the controller for one kind. Controller names must be
    /// unique; registering a second controller under an existing name is a
    /// wiring defect.
    pub fn register<K: ExternalKind>(&mut self, controller: Controller<K>) -> Result<(), Error> {
        if self.controllers.iter().any(|c| c.name() == controller.name()) {
            return Err(Error::validation(format!(
                "controller {} is already registered",
                controller.name()
            )));
        }
        self.controllers.push(Box::new(controller));
        Ok(())
    }

    /// Names of all registered controllers.
    pub fn names(&self) -> Vec<&str> {
        self.controllers.iter().map(|c| c.name()).collect()
    }

    /// Number of registered controllers.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Whether no controllers have been registered.
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Run every registered controller concurrently until the token is
    /// cancelled; failures of one controller are logged and do not stop the
    /// others.
    pub async fn run(self, cancel: CancellationToken) {
        info!(controllers = self.controllers.len(), "starting controllers");
        let handles = self.controllers.into_iter().map(|controller| {
            let cancel = cancel.clone();
            async move {
                let name = controller.name().to_string();
                match controller.run(cancel).await {
                    Ok(()) => info!(controller = %name, "controller completed"),
                    Err(e) => error!(controller = %name, error = %e, "controller failed"),
                }
            }
        });
        futures::future::join_all(handles).await;
    }
}
