//! A fixed pool of multiplexer loops.

use super::{Multiplexer, MultiplexerConfiguration, MultiplexerHandle, Registry};
use crate::connection::{
    ConnectionConfiguration, ConnectionError, ConnectionHandler, ConnectionId,
};
use crate::endpoint::ProtocolEndpoint;
use crate::rate::{RateConfiguration, SharedRateController};
use crate::transport::{Origin, TransportEndpoint};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::task::JoinHandle;

/// Several multiplexer loops sharing one rate controller.
///
/// Connections are routed to a loop by hash of their endpoint, so every
/// connection to the same peer address lands on the same loop.
#[derive(Debug)]
pub struct MultiplexerPool {
    handles: Vec<MultiplexerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl MultiplexerPool {
    /// Spawn `size` loops onto the current tokio runtime.
    ///
    /// A `size` of zero is treated as one.
    pub fn spawn(
        size: usize,
        configuration: MultiplexerConfiguration,
        rate: SharedRateController,
    ) -> Self {
        let size = size.max(1);
        let mut handles = Vec::with_capacity(size);
        let mut tasks = Vec::with_capacity(size);
        for _ in 0..size {
            let (multiplexer, handle) = Multiplexer::new(configuration, rate.clone());
            tasks.push(tokio::spawn(multiplexer.run()));
            handles.push(handle);
        }
        log::debug!("Spawned {size} multiplexer loops");
        Self { handles, tasks }
    }

    /// Number of loops.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// The loop responsible for `endpoint`.
    pub fn handle_for(&self, endpoint: &ProtocolEndpoint) -> &MultiplexerHandle {
        let mut hasher = DefaultHasher::new();
        endpoint.hash(&mut hasher);
        let index = (hasher.finish() % self.handles.len() as u64) as usize;
        &self.handles[index]
    }

    /// Register a connected endpoint with its loop.
    pub fn register(
        &self,
        endpoint: TransportEndpoint,
        origin: Origin,
        configuration: ConnectionConfiguration,
        handler: impl ConnectionHandler + 'static,
    ) -> Result<ConnectionId, ConnectionError> {
        self.register_endpoint(endpoint, origin, configuration, Box::new(handler))
    }

    /// Dial `endpoint` and register it with its loop.
    pub async fn connect(
        &self,
        endpoint: ProtocolEndpoint,
        configuration: ConnectionConfiguration,
        handler: impl ConnectionHandler + 'static,
    ) -> Result<ConnectionId, ConnectionError> {
        self.handle_for(&endpoint)
            .connect(endpoint, configuration, handler)
            .await
    }

    /// Close a registered connection by id, established or not.
    ///
    /// The pool does not track which loop owns `id`, so every loop is asked.
    /// Loops that don't know the id ignore the request.
    pub fn close(&self, id: ConnectionId, reason: impl Into<String>) -> Result<(), ConnectionError> {
        let reason = reason.into();
        let mut queued = false;
        for handle in &self.handles {
            queued |= handle.close(id, reason.clone()).is_ok();
        }
        if queued {
            Ok(())
        } else {
            Err(ConnectionError::MultiplexerShutdown)
        }
    }

    /// Replace the shared rate limits.
    pub fn set_rate_limits(&self, configuration: RateConfiguration) -> Result<(), ConnectionError> {
        // The controller is shared, any one loop can apply the change.
        self.handles
            .iter()
            .find(|handle| !handle.is_closed())
            .ok_or(ConnectionError::MultiplexerShutdown)?
            .set_rate_limits(configuration)
    }

    /// Shut every loop down and wait for them to finish.
    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.shutdown();
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Multiplexer loop failed: {e}");
            }
        }
    }
}

impl Registry for MultiplexerPool {
    fn register_endpoint(
        &self,
        endpoint: TransportEndpoint,
        origin: Origin,
        configuration: ConnectionConfiguration,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<ConnectionId, ConnectionError> {
        let handle = self.handle_for(endpoint.protocol_endpoint());
        handle.register_endpoint(endpoint, origin, configuration, handler)
    }
}
