//! Port allocation for concurrently running scenarios
//!
//! Every scenario gets a contiguous block of ports. The allocator walks a
//! monotonic block cursor and hands out the first block whose ports were all
//! observed unbound. Probing is best-effort: a port can still be taken between
//! the probe and the moment the owning process binds it.

use crate::config::PortConfig;
use crate::error::{HarnessError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::net::TcpListener;
use tracing::{debug, info};

const MAX_PORT: u32 = 65535;

/// Named port roles within a block, in offset order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortRole {
    /// Backend application server
    Backend,
    /// Client proxy administrative endpoint
    ClientAdmin,
    /// Listener the application sends traffic to on the client proxy
    AppToClientProxy,
    /// Listener on the server proxy receiving client proxy traffic
    ClientToServerProxy,
    /// Server proxy administrative endpoint
    ServerAdmin,
    /// Discovery (xDS) server
    Discovery,
    /// Secret discovery server
    SecretDiscovery,
}

impl PortRole {
    pub const ALL: [PortRole; 7] = [
        PortRole::Backend,
        PortRole::ClientAdmin,
        PortRole::AppToClientProxy,
        PortRole::ClientToServerProxy,
        PortRole::ServerAdmin,
        PortRole::Discovery,
        PortRole::SecretDiscovery,
    ];

    /// Offset of this role from the block base
    pub fn offset(self) -> u16 {
        match self {
            PortRole::Backend => 0,
            PortRole::ClientAdmin => 1,
            PortRole::AppToClientProxy => 2,
            PortRole::ClientToServerProxy => 3,
            PortRole::ServerAdmin => 4,
            PortRole::Discovery => 5,
            PortRole::SecretDiscovery => 6,
        }
    }
}

/// A contiguous range of ports reserved for one scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBlock {
    index: u32,
    base: u16,
    size: u16,
}

impl PortBlock {
    /// Position of this block in the allocator's cursor space
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn port(&self, role: PortRole) -> u16 {
        self.base + role.offset()
    }

    pub fn backend(&self) -> u16 {
        self.port(PortRole::Backend)
    }

    pub fn client_admin(&self) -> u16 {
        self.port(PortRole::ClientAdmin)
    }

    pub fn app_to_client_proxy(&self) -> u16 {
        self.port(PortRole::AppToClientProxy)
    }

    pub fn client_to_server_proxy(&self) -> u16 {
        self.port(PortRole::ClientToServerProxy)
    }

    pub fn server_admin(&self) -> u16 {
        self.port(PortRole::ServerAdmin)
    }

    pub fn discovery(&self) -> u16 {
        self.port(PortRole::Discovery)
    }

    pub fn secret_discovery(&self) -> u16 {
        self.port(PortRole::SecretDiscovery)
    }

    /// Whether `port` falls inside this block
    pub fn contains(&self, port: u16) -> bool {
        let port = u32::from(port);
        port >= u32::from(self.base) && port < self.end()
    }

    /// Whether two blocks share any port
    pub fn overlaps(&self, other: &PortBlock) -> bool {
        u32::from(self.base) < other.end() && u32::from(other.base) < self.end()
    }

    fn end(&self) -> u32 {
        u32::from(self.base) + u32::from(self.size)
    }
}

impl fmt::Display for PortBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.base, self.end())
    }
}

/// Checks whether a port is currently free
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding 127.0.0.1:port and releasing it immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

impl<F> PortProbe for F
where
    F: Fn(u16) -> bool + Send + Sync,
{
    fn is_free(&self, port: u16) -> bool {
        self(port)
    }
}

/// Hands out disjoint port blocks.
///
/// Meant to be shared by reference (usually behind an `Arc`) between every
/// scenario of a test process; the cursor is the only mutable state and is
/// guarded by a mutex.
pub struct PortAllocator<P = BindProbe> {
    base: u16,
    block_size: u16,
    next_index: Mutex<u32>,
    probe: P,
}

impl PortAllocator<BindProbe> {
    pub fn new(config: &PortConfig) -> Self {
        Self::with_probe(config, BindProbe)
    }
}

impl Default for PortAllocator<BindProbe> {
    fn default() -> Self {
        Self::new(&PortConfig::default())
    }
}

impl<P: PortProbe> PortAllocator<P> {
    pub fn with_probe(config: &PortConfig, probe: P) -> Self {
        Self {
            base: config.base,
            block_size: config.block_size,
            next_index: Mutex::new(0),
            probe,
        }
    }

    /// Allocate the next block whose ports are all free
    pub fn allocate(&self) -> Result<PortBlock> {
        // Held across probing so concurrent callers never see the same cursor.
        let mut next_index = self.next_index.lock();
        let mut index = *next_index;

        loop {
            let base = u32::from(self.base) + index * u32::from(self.block_size);
            if base + u32::from(self.block_size) > MAX_PORT {
                return Err(HarnessError::NoPortRange {
                    base,
                    block_size: self.block_size,
                });
            }
            let base = base as u16;

            match self.first_busy(base) {
                None => {
                    *next_index = index + 1;
                    let block = PortBlock {
                        index,
                        base,
                        size: self.block_size,
                    };
                    info!(index, %block, "Allocated port block");
                    return Ok(block);
                }
                Some(port) => {
                    debug!(index, port, "Port in use, skipping block");
                    index += 1;
                }
            }
        }
    }

    fn first_busy(&self, base: u16) -> Option<u16> {
        (0..self.block_size)
            .map(|offset| base + offset)
            .find(|&port| !self.probe.is_free(port))
    }
}
