//! Local TCP port tables
//!
//! A [`PortTableProvider`] answers one question: which local ports exist
//! right now, and in what TCP state. How it finds out (reading procfs,
//! shelling out to `netstat`, ...) is its own business; the scan engine only
//! sees `(port, state)` pairs.
//!
//! Providers write into a caller-owned, bounded [`PortTable`]. When the table
//! is too small they report the size they need, and the caller decides
//! whether to grow and retry.

mod netstat;
mod procfs;

pub use netstat::NetstatProvider;
pub use procfs::ProcNetProvider;

use serde::Deserialize;
use std::fmt;

/// Address family of the sockets to enumerate
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[serde(alias = "inet", alias = "v4")]
    Ipv4,
    #[serde(alias = "inet6", alias = "v6")]
    Ipv6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "ipv4"),
            AddressFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// TCP connection state, reduced to what the scanner cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    Established,
    Other,
}

impl TcpState {
    /// Whether a socket in this state means "a service lives on this port"
    pub fn is_occupied(&self) -> bool {
        matches!(self, TcpState::Listen | TcpState::Established)
    }
}

/// One row of a port table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortEntry {
    pub port: u16,
    pub state: TcpState,
}

impl PortEntry {
    pub fn new(port: u16, state: TcpState) -> Self {
        Self { port, state }
    }
}

/// Errors reported by a port table provider
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The table passed in cannot hold every row; `required` rows are needed
    #[error("port table too small: {required} entries required, {capacity} available")]
    InsufficientBuffer { required: usize, capacity: usize },

    #[error("failed to read port table: {0}")]
    Io(#[from] std::io::Error),

    #[error("port table command failed: {0}")]
    Command(String),
}

/// Fixed-capacity buffer filled by a provider
#[derive(Debug, Clone)]
pub struct PortTable {
    entries: Vec<PortEntry>,
    capacity: usize,
}

impl PortTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PortEntry] {
        &self.entries
    }

    /// Replace the table contents with `rows`.
    ///
    /// If there are more rows than the table can hold, the table is left
    /// empty and `InsufficientBuffer` carries the row count.
    pub fn fill<I>(&mut self, rows: I) -> Result<(), ProviderError>
    where
        I: IntoIterator<Item = PortEntry>,
    {
        self.entries.clear();
        let rows: Vec<PortEntry> = rows.into_iter().collect();
        if rows.len() > self.capacity {
            return Err(ProviderError::InsufficientBuffer {
                required: rows.len(),
                capacity: self.capacity,
            });
        }
        self.entries.extend(rows);
        Ok(())
    }
}

/// Producer of the current local port table for one address family
pub trait PortTableProvider: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Fill `table` with the current `(port, state)` rows for `family`
    fn query(&self, family: AddressFamily, table: &mut PortTable) -> Result<(), ProviderError>;
}

/// Which provider implementation to use
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// procfs on Linux, netstat everywhere else
    #[default]
    Auto,
    Procfs,
    Netstat,
}

impl ProviderKind {
    /// Build the provider this kind stands for
    pub fn build(self) -> Box<dyn PortTableProvider> {
        match self {
            ProviderKind::Procfs => Box::new(ProcNetProvider::new()),
            ProviderKind::Netstat => Box::new(NetstatProvider::new()),
            ProviderKind::Auto => {
                if cfg!(target_os = "linux") {
                    Box::new(ProcNetProvider::new())
                } else {
                    Box::new(NetstatProvider::new())
                }
            }
        }
    }
}
