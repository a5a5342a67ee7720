//! Kernel notification transport
//!
//! The [`Transport`] trait is the seam between the cache manager and the
//! kernel channel. [`crate::netlink::NetlinkSession`] implements it on
//! rtnetlink; [`MemoryTransport`] implements it in-process so the manager,
//! reconciliation and event loop can be driven without a kernel.

use crate::cache::{LinkCache, RouteCache};
use crate::error::{NlmonError, Result};
use crate::types::{CacheKind, ChangeRecord, Link, Object, Route};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Socket receive buffer size for the notification channel (320 KiB)
pub const RECV_BUFFER_SIZE: usize = 320 << 10;

/// Records drained from the transport in one pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Received {
    /// Decoded records in arrival order
    pub records: Vec<ChangeRecord>,
    /// Kernel reported a receive buffer overrun; records may have been dropped
    pub overrun: bool,
}

/// Kernel change-notification channel
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Pollable descriptor, stable for the life of the session
    fn as_raw_fd(&self) -> RawFd;

    /// Drain every record currently queued without blocking
    fn recv_records(&mut self) -> Result<Received>;

    /// Full dump of one kernel table
    fn dump(&mut self, kind: CacheKind) -> Result<Vec<Object>>;
}

/// Descriptor reported by [`MemoryTransport`]; never polled
const PLACEHOLDER_FD: RawFd = RawFd::MAX;

/// Simulated kernel tables follow the same fold rules as the caches, so an
/// appended IPv6 next-hop joins its route here as it does in the kernel
#[derive(Debug)]
struct MemoryState {
    links: LinkCache,
    routes: RouteCache,
    pending: VecDeque<ChangeRecord>,
    overrun: bool,
    recv_error: Option<i32>,
    dump_error: Option<(CacheKind, i32)>,
    dumps: usize,
}

/// In-process transport with a simulated kernel table
///
/// Clones share state, so a test can keep one handle and hand another to the
/// cache manager.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MemoryState {
                links: LinkCache::new(),
                routes: RouteCache::new(),
                pending: VecDeque::new(),
                overrun: false,
                recv_error: None,
                dump_error: None,
                dumps: 0,
            })),
        }
    }

    /// Seed the kernel link table without queueing notifications
    pub fn with_links(self, links: Vec<Link>) -> Self {
        self.state.borrow_mut().links.refill(links);
        self
    }

    /// Seed the kernel route table without queueing notifications
    pub fn with_routes(self, routes: Vec<Route>) -> Self {
        self.state.borrow_mut().routes.refill(routes);
        self
    }

    /// Change the kernel table and queue the matching notification
    pub fn push(&self, record: ChangeRecord) {
        let mut state = self.state.borrow_mut();
        state.update_table(&record);
        state.pending.push_back(record);
    }

    /// Change the kernel table but lose the notification, as on overrun
    pub fn drop_record(&self, record: ChangeRecord) {
        let mut state = self.state.borrow_mut();
        state.update_table(&record);
        state.overrun = true;
    }

    /// Fail the next drain with `errno`
    pub fn fail_next_recv(&self, errno: i32) {
        self.state.borrow_mut().recv_error = Some(errno);
    }

    /// Fail every dump of `kind` with `errno`
    pub fn fail_dump(&self, kind: CacheKind, errno: i32) {
        self.state.borrow_mut().dump_error = Some((kind, errno));
    }

    /// Number of records queued but not yet drained
    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Number of dumps served so far
    pub fn dump_count(&self) -> usize {
        self.state.borrow().dumps
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryState {
    fn update_table(&mut self, record: &ChangeRecord) {
        match &record.object {
            Object::Link(link) => {
                self.links.apply(record.kind, link.clone());
            }
            Object::Route(route) => {
                self.routes.apply(record.kind, route.clone());
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn as_raw_fd(&self) -> RawFd {
        PLACEHOLDER_FD
    }

    fn recv_records(&mut self) -> Result<Received> {
        let mut state = self.state.borrow_mut();
        if let Some(errno) = state.recv_error.take() {
            return Err(NlmonError::Transport(io::Error::from_raw_os_error(errno)));
        }

        Ok(Received {
            records: state.pending.drain(..).collect(),
            overrun: std::mem::take(&mut state.overrun),
        })
    }

    fn dump(&mut self, kind: CacheKind) -> Result<Vec<Object>> {
        let mut state = self.state.borrow_mut();
        if let Some((failing, errno)) = state.dump_error {
            if failing == kind {
                return Err(NlmonError::Transport(io::Error::from_raw_os_error(errno)));
            }
        }

        state.dumps += 1;
        let objects = match kind {
            CacheKind::Link => state.links.iter().cloned().map(Object::Link).collect(),
            CacheKind::Route => state.routes.iter().cloned().map(Object::Route).collect(),
        };
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NextHop, RecordKind, RouteFamily};
    use std::net::{IpAddr, Ipv6Addr};

    #[test]
    fn test_memory_transport_drains_in_order() {
        let mut transport = MemoryTransport::new();
        transport.push(ChangeRecord::new(Link::new(2, "eth0")));
        transport.push(ChangeRecord::delete(Link::new(2, "eth0")));

        let received = transport.recv_records().unwrap();
        assert_eq!(received.records.len(), 2);
        assert_eq!(received.records[0].kind, RecordKind::New);
        assert_eq!(received.records[1].kind, RecordKind::Delete);
        assert!(!received.overrun);
        assert_eq!(transport.pending(), 0);
    }

    #[test]
    fn test_memory_transport_dump_tracks_table() {
        let mut transport = MemoryTransport::new().with_links(vec![Link::new(1, "lo")]);
        transport.push(ChangeRecord::new(Link::new(2, "eth0")));
        transport.push(ChangeRecord::delete(Link::new(1, "lo")));

        let links = transport.dump(CacheKind::Link).unwrap();
        assert_eq!(links, vec![Object::Link(Link::new(2, "eth0"))]);
        assert_eq!(transport.dump_count(), 1);
    }

    #[test]
    fn test_memory_transport_overrun_flag_resets() {
        let mut transport = MemoryTransport::new();
        transport.drop_record(ChangeRecord::new(Route::default_route(RouteFamily::Inet)));

        assert!(transport.recv_records().unwrap().overrun);
        assert!(!transport.recv_records().unwrap().overrun);
        assert_eq!(transport.dump(CacheKind::Route).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_transport_recv_failure() {
        let mut transport = MemoryTransport::new();
        transport.fail_next_recv(libc::EIO);

        let err = transport.recv_records().unwrap_err();
        assert_eq!(err.os_error(), Some(libc::EIO));
        assert!(transport.recv_records().is_ok());
    }

    #[test]
    fn test_memory_transport_dump_failure() {
        let mut transport = MemoryTransport::new();
        transport.fail_dump(CacheKind::Route, libc::ENOMEM);

        assert!(transport.dump(CacheKind::Link).is_ok());
        assert!(transport.dump(CacheKind::Route).is_err());
    }

    #[test]
    fn test_memory_transport_folds_ipv6_nexthops() {
        let route = |last| {
            let gateway = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, last));
            Route::default_route(RouteFamily::Inet6)
                .with_nexthop(NextHop::new(Some(gateway), Some(3)))
        };

        let mut transport = MemoryTransport::new().with_routes(vec![route(1)]);
        transport.push(ChangeRecord::new(route(2)));
        transport.push(ChangeRecord::delete(route(1)));

        let routes = transport.dump(CacheKind::Route).unwrap();
        assert_eq!(routes, vec![Object::Route(route(2))]);
    }
}
