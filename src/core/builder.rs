use std::sync::Arc;

use crate::{
    config::Config,
    error::PropagationError,
    events::{HandlerRef, LocalBus},
    transport::TransportRef,
};
use super::{listener::Listener, registry::SessionRegistry};

/// Builder for constructing a [`Listener`] with optional shared parts.
pub struct ListenerBuilder {
    cfg: Config,
    transport: TransportRef,
    bus: Option<Arc<LocalBus>>,
    registry: Option<Arc<SessionRegistry>>,
    handlers: Vec<HandlerRef>,
}

impl ListenerBuilder {
    /// Creates a new builder with the given configuration and transport.
    pub fn new(cfg: Config, transport: TransportRef) -> Self {
        Self {
            cfg,
            transport,
            bus: None,
            registry: None,
            handlers: Vec::new(),
        }
    }

    /// Uses an existing bus instead of creating one.
    pub fn with_bus(mut self, bus: Arc<LocalBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Uses an existing session registry instead of creating one.
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Handlers registered on the bus at build time.
    pub fn with_handlers(mut self, handlers: Vec<HandlerRef>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Builds the listener.
    ///
    /// Must run inside a tokio runtime when no bus was supplied (the bus spawns
    /// its dispatcher). Fails with `Canceled` if a supplied bus or registry is
    /// already finalized.
    pub fn build(self) -> Result<Listener, PropagationError> {
        let bus = match self.bus {
            Some(bus) => bus,
            None => LocalBus::new(self.cfg.dispatch_capacity_clamped()),
        };
        let registry = self.registry.unwrap_or_else(SessionRegistry::new);
        if registry.is_disabled() {
            return Err(PropagationError::Canceled);
        }

        for h in self.handlers {
            bus.register(h)?;
        }

        Ok(Listener::from_parts(self.cfg, self.transport, registry, bus))
    }
}
