//! Device registry: owns the transport and tracks which devices have a
//! live session.

use crate::session::{DeviceSession, SessionError};
use crate::transport::{DeviceCandidate, DeviceId, TransportError, UsbTransport};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Entry point for device access. Sessions borrow the registry, so it
/// cannot be torn down while any of them is alive.
pub struct DeviceRegistry<T: UsbTransport> {
    transport: T,
    open: Mutex<HashSet<DeviceId>>,
}

impl<T: UsbTransport> DeviceRegistry<T> {
    pub fn init(transport: T) -> Self {
        tracing::debug!("device registry initialized");
        Self {
            transport,
            open: Mutex::new(HashSet::new()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Attached devices exposing a video class interface.
    pub fn devices(&self) -> Result<Vec<DeviceCandidate<T::Device>>, TransportError> {
        self.transport.enumerate()
    }

    /// Open a session on `candidate`, claiming its VideoControl interface.
    ///
    /// Fails with [`SessionError::DeviceBusy`] if a session is already open
    /// on the device.
    pub fn open(
        &self,
        candidate: &DeviceCandidate<T::Device>,
    ) -> Result<DeviceSession<'_, T>, SessionError> {
        if !self.open_set().insert(candidate.id) {
            tracing::warn!(device = %candidate.id, "device already has an open session");
            return Err(SessionError::DeviceBusy);
        }

        DeviceSession::open(self, candidate.clone()).map_err(|e| {
            tracing::warn!(device = %candidate.id, error = %e, "failed to open device");
            self.release(candidate.id);
            e
        })
    }

    pub fn is_open(&self, id: DeviceId) -> bool {
        self.open_set().contains(&id)
    }

    pub(crate) fn release(&self, id: DeviceId) {
        self.open_set().remove(&id);
    }

    /// Drop the registry and its transport.
    pub fn teardown(self) {
        tracing::debug!("device registry torn down");
    }

    fn open_set(&self) -> MutexGuard<'_, HashSet<DeviceId>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
