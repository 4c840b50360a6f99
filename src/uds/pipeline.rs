//! Serializes concurrent UDS submissions onto one adapter.
//!
//! The adapter driver is strictly single-request; [UdsPipeline] is the shared
//! front door callers clone freely. Only one [UdsPipeline::send] runs at any
//! time, everything else queues on the internal mutex.

use std::sync::{Arc, Mutex};

use crate::elm327::Elm327;
use crate::message::{Header, Message};
use crate::{TransportError, TransportResult};

/// Cloneable, thread safe handle serializing access to one [Elm327]
#[derive(Debug, Clone)]
pub struct UdsPipeline {
    adapter: Arc<Mutex<Elm327>>,
}

impl UdsPipeline {
    /// Wraps a (typically already connected) adapter
    pub fn new(adapter: Elm327) -> Self {
        Self {
            adapter: Arc::new(Mutex::new(adapter)),
        }
    }

    /// Sends one UDS service to `to`, accepting replies from `reply`
    /// (zero accepts any). Adapter errors propagate unchanged
    pub fn send(&self, to: Header, reply: Header, service: &[u8]) -> TransportResult<Message> {
        let mut adapter = self.lock()?;
        adapter.send_uds(&Message::with_reply(to, reply, service.to_vec()))
    }

    /// Largest service payload one [UdsPipeline::send] can carry; callers
    /// chunk above this at the UDS layer
    pub fn mtu(&self) -> TransportResult<usize> {
        Ok(self.lock()?.mtu())
    }

    /// Runs `f` with exclusive access to the underlying adapter
    pub fn with_adapter<T>(&self, f: impl FnOnce(&mut Elm327) -> T) -> TransportResult<T> {
        let mut adapter = self.lock()?;
        Ok(f(&mut adapter))
    }

    /// Shuts the adapter (and its queue worker) down
    pub fn shutdown(&self) -> TransportResult<()> {
        self.lock()?.shutdown();
        Ok(())
    }

    fn lock(&self) -> TransportResult<std::sync::MutexGuard<'_, Elm327>> {
        self.adapter
            .lock()
            .map_err(|_| TransportError::Communication("adapter mutex poisoned".into()))
    }
}
