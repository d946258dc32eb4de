//! Per-client message filters and the fan-out distributor.
//!
//! Every downstream client owns a `Filter`; the distributor delivers each
//! decoded message to the clients whose filter accepts it and pushes the
//! union of all live filters upstream so the receiver only transmits what
//! somebody wants.

use crate::message::{Message, MessageKind};

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// What a client wants to receive. Defaults to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub receive_df: [bool; 32],
    pub receive_modeac: bool,
    pub receive_bad_crc: bool,
    pub receive_fec: bool,
    pub receive_status: bool,
    pub receive_gps_timestamps: bool,
    pub receive_position: bool,
}

impl Default for Filter {
    fn default() -> Filter {
        Filter {
            receive_df: [false; 32],
            receive_modeac: false,
            receive_bad_crc: false,
            receive_fec: false,
            receive_status: false,
            receive_gps_timestamps: false,
            receive_position: false,
        }
    }
}

impl Filter {
    /// Does this filter pass the given message?
    pub fn accepts(&self, message: &Message) -> bool {
        match message.kind() {
            MessageKind::ModeAC => self.receive_modeac,
            MessageKind::Status => self.receive_status,
            MessageKind::Position => self.receive_position,
            MessageKind::ModeSShort | MessageKind::ModeSLong => match message.df() {
                Some(df) => {
                    self.receive_df[df as usize] && (!message.crc_bad() || self.receive_bad_crc)
                }
                None => false,
            },
        }
    }

    /// Field-wise OR with another filter.
    pub fn combine(&mut self, other: &Filter) {
        for (mine, theirs) in self.receive_df.iter_mut().zip(other.receive_df.iter()) {
            *mine = *mine || *theirs;
        }
        self.receive_modeac |= other.receive_modeac;
        self.receive_bad_crc |= other.receive_bad_crc;
        self.receive_fec |= other.receive_fec;
        self.receive_status |= other.receive_status;
        self.receive_gps_timestamps |= other.receive_gps_timestamps;
        self.receive_position |= other.receive_position;
    }
}

// ---------------------------------------------------------------------------
// FilterDistributor
// ---------------------------------------------------------------------------

/// Opaque client handle, allocated monotonically.
pub type Handle = u32;

/// A client's message sink. Returns `false` once the client is gone; the
/// distributor then marks it deleted and sweeps it after the current
/// broadcast pass, so a client failing during its own delivery is safe.
pub type MessageSink = Box<dyn FnMut(&Message) -> bool>;

/// Receives the upstream union filter after any client change.
pub type FilterNotifier = Box<dyn Fn(&Filter)>;

struct ClientEntry {
    handle: Handle,
    sink: MessageSink,
    filter: Filter,
    deleted: bool,
}

/// Registry of downstream clients with deferred deletion under iteration.
#[derive(Default)]
pub struct FilterDistributor {
    next_handle: Handle,
    clients: Vec<ClientEntry>,
    filter_notifier: Option<FilterNotifier>,
}

impl FilterDistributor {
    pub fn new() -> FilterDistributor {
        FilterDistributor::default()
    }

    pub fn set_filter_notifier(&mut self, f: impl Fn(&Filter) + 'static) {
        self.filter_notifier = Some(Box::new(f));
    }

    /// Register a client; recomputes and pushes the upstream union.
    pub fn add_client(
        &mut self,
        sink: impl FnMut(&Message) -> bool + 'static,
        initial_filter: Filter,
    ) -> Handle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.clients.push(ClientEntry {
            handle,
            sink: Box::new(sink),
            filter: initial_filter,
            deleted: false,
        });
        self.update_upstream_filter();
        handle
    }

    /// Replace a client's filter. Structurally unchanged filters are a
    /// no-op; otherwise the upstream union is recomputed.
    pub fn update_client_filter(&mut self, handle: Handle, new_filter: Filter) {
        let Some(entry) = self
            .clients
            .iter_mut()
            .find(|c| c.handle == handle && !c.deleted)
        else {
            return;
        };
        if entry.filter == new_filter {
            return;
        }
        entry.filter = new_filter;
        self.update_upstream_filter();
    }

    /// Mark a client deleted. The entry is physically erased by the next
    /// `broadcast` traversal; the union narrows immediately.
    pub fn remove_client(&mut self, handle: Handle) {
        let Some(entry) = self
            .clients
            .iter_mut()
            .find(|c| c.handle == handle && !c.deleted)
        else {
            return;
        };
        entry.deleted = true;
        self.update_upstream_filter();
    }

    /// Deliver one message to every live client whose filter accepts it, in
    /// insertion order, then sweep deleted entries.
    pub fn broadcast(&mut self, message: &Message) {
        let mut sink_failed = false;
        for entry in self.clients.iter_mut() {
            if !entry.deleted && entry.filter.accepts(message) && !(entry.sink)(message) {
                entry.deleted = true;
                sink_failed = true;
            }
        }
        self.clients.retain(|c| !c.deleted);
        if sink_failed {
            self.update_upstream_filter();
        }
    }

    /// The current union of all live clients' filters.
    pub fn upstream_filter(&self) -> Filter {
        let mut union = Filter::default();
        for entry in &self.clients {
            if !entry.deleted {
                union.combine(&entry.filter);
            }
        }
        union
    }

    fn update_upstream_filter(&self) {
        if let Some(notifier) = &self.filter_notifier {
            notifier(&self.upstream_filter());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
