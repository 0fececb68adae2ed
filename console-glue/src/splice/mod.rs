//! Glue between two duplex connections.
//!
//! A [`SpliceUnit`] sits on each connection of a pair produced by
//! [`matched_pair`]. Whatever one connection reads is written to the other,
//! and reads are only requested while the other side can take more data.
//! End of input, disconnects and errors are turned into a half-close or a full
//! close of the partner connection.

use std::fmt;
use std::io;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{trace, warn};

mod adapter;

pub use adapter::ChannelAdapter;

type SharedState = Arc<Mutex<UnitState>>;

#[derive(Default)]
struct UnitState {
    adapter: Option<Arc<dyn ChannelAdapter>>,
    partner: Option<Weak<Mutex<UnitState>>>,
    pending_read: bool,
}

/// One half of a spliced pair.
///
/// Clones are handles to the same unit. The link to the partner does not keep
/// the partner alive: once the partner is dropped or detached, everything sent
/// its way is silently discarded.
#[derive(Clone)]
pub struct SpliceUnit {
    inner: SharedState,
}

/// Create two units, each one the partner of the other.
pub fn matched_pair() -> (SpliceUnit, SpliceUnit) {
    let first = SpliceUnit::unattached();
    let second = SpliceUnit::unattached();

    first.inner.lock().partner = Some(Arc::downgrade(&second.inner));
    second.inner.lock().partner = Some(Arc::downgrade(&first.inner));

    (first, second)
}

impl SpliceUnit {
    fn unattached() -> Self {
        Self {
            inner: Arc::new(Mutex::new(UnitState::default())),
        }
    }

    /// Bind this unit to the connection it relays from.
    ///
    /// # Panics
    ///
    /// If the unit is already attached.
    pub fn attach(&self, adapter: Arc<dyn ChannelAdapter>) {
        let mut state = self.inner.lock();
        assert!(state.adapter.is_none(), "splice unit is already attached");
        state.adapter = Some(adapter);
    }

    /// Forget both the connection and the partner. The partner is not told.
    pub fn detach(&self) {
        let mut state = self.inner.lock();
        state.adapter = None;
        state.partner = None;
    }

    #[cfg(test)]
    pub fn is_attached(&self) -> bool {
        self.inner.lock().adapter.is_some()
    }

    pub fn pending_read(&self) -> bool {
        self.inner.lock().pending_read
    }

    #[cfg(test)]
    pub fn is_partnered_with(&self, other: &SpliceUnit) -> bool {
        self.partner()
            .is_some_and(|partner| Arc::ptr_eq(&partner.0, &other.inner))
    }

    fn partner(&self) -> Option<Partner> {
        self.inner
            .lock()
            .partner
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Partner)
    }

    pub fn channel_read(&self, data: Bytes) {
        if let Some(partner) = self.partner() {
            partner.write(data);
        }
    }

    /// End of a read batch: push what was forwarded so far to the wire.
    pub fn channel_read_complete(&self) {
        if let Some(partner) = self.partner() {
            partner.flush();
        }
    }

    pub fn input_closed(&self) {
        trace!("input closed, half-closing partner");
        if let Some(partner) = self.partner() {
            partner.close_output();
        }
    }

    pub fn channel_inactive(&self) {
        trace!("channel inactive, closing partner");
        if let Some(partner) = self.partner() {
            partner.close();
        }
    }

    pub fn error_caught(&self, err: &io::Error) {
        warn!("error in splice: {:?}", err);
        if let Some(partner) = self.partner() {
            partner.close();
        }
    }

    pub fn writability_changed(&self) {
        let writable = self
            .inner
            .lock()
            .adapter
            .as_ref()
            .is_some_and(|adapter| adapter.is_writable());

        if writable {
            if let Some(partner) = self.partner() {
                partner.became_writable();
            }
        }
    }

    /// Read demand from our own connection. Only passed on while the partner
    /// can absorb what we would read, otherwise remembered until it can.
    pub fn read(&self) {
        let partner_adapter = self.partner().and_then(|partner| partner.adapter());

        // The writability check and the pending flag change under our own lock,
        // which `became_writable` also takes.
        let mut state = self.inner.lock();
        let partner_writable = partner_adapter.is_some_and(|adapter| adapter.is_writable());
        if partner_writable {
            if let Some(adapter) = &state.adapter {
                adapter.read();
                return;
            }
        } else if let Some(adapter) = &state.adapter {
            adapter.stop_reading();
        }
        state.pending_read = true;
    }
}

impl fmt::Debug for SpliceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SpliceUnit")
            .field("attached", &state.adapter.is_some())
            .field(
                "partnered",
                &state.partner.as_ref().is_some_and(|p| p.strong_count() > 0),
            )
            .field("pending_read", &state.pending_read)
            .finish()
    }
}

/// Operations a unit performs on its partner's connection.
struct Partner(SharedState);

impl Partner {
    fn adapter(&self) -> Option<Arc<dyn ChannelAdapter>> {
        self.0.lock().adapter.clone()
    }

    fn write(&self, data: Bytes) {
        if let Some(adapter) = self.adapter() {
            adapter.write(data);
        }
    }

    fn flush(&self) {
        if let Some(adapter) = self.adapter() {
            adapter.flush();
        }
    }

    fn close_output(&self) {
        if let Some(adapter) = self.adapter() {
            adapter.close_output();
        }
    }

    fn close(&self) {
        if let Some(adapter) = self.adapter() {
            adapter.close();
        }
    }

    fn became_writable(&self) {
        let mut state = self.0.lock();
        if state.pending_read {
            state.pending_read = false;
            if let Some(adapter) = &state.adapter {
                adapter.read();
            }
        }
    }
}
