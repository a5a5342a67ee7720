//! rtnetlink transport session
//!
//! Owns two `NETLINK_ROUTE` sockets: a non-blocking event socket subscribed
//! to link and route multicast groups, and a blocking sync socket used for
//! table dumps so dump replies never interleave with notifications.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Kernel interface for network state
//! - SC-5: DoS Protection - Receive buffer sizing and overrun detection
//! - SI-4: System Monitoring - Link and route change notifications

use crate::error::{NlmonError, Result, SetupStage};
use crate::transport::{RECV_BUFFER_SIZE, Received, Transport};
use crate::types::{
    CacheKind, ChangeRecord, Link, NextHop, Object, OperStatus, RecordKind, Route, RouteFamily,
};
use netlink_packet_core::{NLM_F_DUMP, NLM_F_REQUEST, NetlinkHeader, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage, State};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteNextHop};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, instrument, trace, warn};

/// RTMGRP_LINK multicast group bitmask
const RTMGRP_LINK: u32 = 0x0000_0001;
/// RTMGRP_IPV4_ROUTE multicast group bitmask
const RTMGRP_IPV4_ROUTE: u32 = 0x0000_0040;
/// RTMGRP_IPV6_ROUTE multicast group bitmask
const RTMGRP_IPV6_ROUTE: u32 = 0x0000_0400;

const NOTIFY_GROUPS: u32 = RTMGRP_LINK | RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE;

/// Size of a single datagram read
const DATAGRAM_BUFFER_SIZE: usize = 65536;

/// Set on dump replies when the table changed while the dump was running
const NLM_F_DUMP_INTR: u16 = 0x10;

/// Dump attempts before an interrupted dump is reported as an error
const DUMP_ATTEMPTS: u32 = 5;

/// Netlink session bound to link and route notifications
pub struct NetlinkSession {
    events: Socket,
    sync: Socket,
    buffer: Vec<u8>,
    sequence: u32,
}

impl NetlinkSession {
    /// Open the event and sync sockets
    ///
    /// The event socket is non-blocking with a [`RECV_BUFFER_SIZE`] receive
    /// buffer.
    #[instrument]
    pub fn open() -> Result<Self> {
        let mut events =
            Socket::new(NETLINK_ROUTE).map_err(|e| NlmonError::setup(SetupStage::Socket, e))?;
        events
            .bind(&SocketAddr::new(0, NOTIFY_GROUPS))
            .map_err(|e| NlmonError::setup(SetupStage::Socket, e))?;

        let mut sync =
            Socket::new(NETLINK_ROUTE).map_err(|e| NlmonError::setup(SetupStage::SyncSocket, e))?;
        sync.bind_auto()
            .map_err(|e| NlmonError::setup(SetupStage::SyncSocket, e))?;
        sync.connect(&SocketAddr::new(0, 0))
            .map_err(|e| NlmonError::setup(SetupStage::SyncSocket, e))?;

        let session = Self {
            events,
            sync,
            buffer: vec![0u8; DATAGRAM_BUFFER_SIZE],
            sequence: 0,
        };

        session.set_nonblocking()?;
        session.set_buffer_size(RECV_BUFFER_SIZE);

        debug!(groups = NOTIFY_GROUPS, "Netlink session open");
        Ok(session)
    }

    /// Set the event socket to non-blocking mode
    fn set_nonblocking(&self) -> Result<()> {
        let fd = self.events.as_raw_fd();
        // SAFETY: fd is owned by self.events and open for the life of self
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                return Err(NlmonError::setup(
                    SetupStage::Socket,
                    io::Error::last_os_error(),
                ));
            }
            if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(NlmonError::setup(
                    SetupStage::Socket,
                    io::Error::last_os_error(),
                ));
            }
        }
        Ok(())
    }

    /// Set the event socket receive buffer
    ///
    /// A failure leaves the kernel default in place and is only logged.
    pub fn set_buffer_size(&self, bytes: usize) {
        let fd = self.events.as_raw_fd();
        let size = bytes as libc::c_int;
        // SAFETY: fd is a valid socket and size outlives the call
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            warn!(
                error = %io::Error::last_os_error(),
                "Failed to set SO_RCVBUF, using default buffer size"
            );
        } else {
            debug!(size = bytes, "Set socket receive buffer");
        }
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    fn send_dump_request(&mut self, kind: CacheKind) -> Result<()> {
        let payload = match kind {
            CacheKind::Link => RouteNetlinkMessage::GetLink(LinkMessage::default()),
            CacheKind::Route => RouteNetlinkMessage::GetRoute(RouteMessage::default()),
        };

        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_DUMP;
        header.sequence_number = self.next_sequence();

        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
        packet.finalize();

        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf[..]);

        self.sync.send(&buf, 0).map_err(NlmonError::Transport)?;
        Ok(())
    }

    /// One dump request; `None` if the kernel flagged it as interrupted
    fn dump_once(&mut self, kind: CacheKind) -> Result<Option<Vec<Object>>> {
        self.send_dump_request(kind)?;

        let mut collector = DumpCollector::default();
        loop {
            let len = self
                .sync
                .recv(&mut &mut self.buffer[..], 0)
                .map_err(NlmonError::Transport)?;

            if collector.feed(&self.buffer[..len])? == DumpProgress::Done {
                break;
            }
        }

        if collector.interrupted {
            return Ok(None);
        }
        debug!(entries = collector.objects.len(), "Dump complete");
        Ok(Some(collector.objects))
    }
}

impl Transport for NetlinkSession {
    fn as_raw_fd(&self) -> RawFd {
        self.events.as_raw_fd()
    }

    #[instrument(skip(self))]
    fn recv_records(&mut self) -> Result<Received> {
        let mut received = Received::default();

        loop {
            let result = self.events.recv(&mut &mut self.buffer[..], libc::MSG_DONTWAIT);
            match result {
                Ok(0) => break,
                Ok(len) => decode_datagram(&self.buffer[..len], &mut received.records),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    warn!("Netlink receive buffer overrun, records may have been dropped");
                    received.overrun = true;
                }
                Err(e) => return Err(NlmonError::Transport(e)),
            }
        }

        trace!(count = received.records.len(), "Drained netlink records");
        Ok(received)
    }

    /// Full dump of one table, restarted while the kernel flags it as
    /// interrupted
    #[instrument(skip(self))]
    fn dump(&mut self, kind: CacheKind) -> Result<Vec<Object>> {
        for attempt in 1..=DUMP_ATTEMPTS {
            if let Some(objects) = self.dump_once(kind)? {
                return Ok(objects);
            }
            warn!(attempt, "Dump interrupted by a concurrent change, restarting");
        }

        Err(NlmonError::Transport(io::Error::from_raw_os_error(libc::EINTR)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DumpProgress {
    More,
    Done,
}

/// Accumulates the objects of one dump across reply datagrams
#[derive(Debug, Default)]
struct DumpCollector {
    objects: Vec<Object>,
    interrupted: bool,
}

impl DumpCollector {
    fn feed(&mut self, datagram: &[u8]) -> Result<DumpProgress> {
        let mut offset = 0;
        while offset < datagram.len() {
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&datagram[offset..])
                .map_err(|e| NlmonError::Decode(format!("dump reply: {e:?}")))?;

            let msg_len = msg.header.length as usize;
            if msg_len == 0 {
                break;
            }
            offset += align(msg_len);

            if msg.header.flags & NLM_F_DUMP_INTR != 0 {
                self.interrupted = true;
            }

            match msg.payload {
                NetlinkPayload::Done(_) => return Ok(DumpProgress::Done),
                NetlinkPayload::Error(err) => match err.code {
                    // Acknowledgement
                    None => {}
                    Some(code) => {
                        return Err(NlmonError::Transport(io::Error::from_raw_os_error(
                            code.get().abs(),
                        )));
                    }
                },
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                    self.objects.push(Object::Link(decode_link(&link)));
                }
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
                    self.objects.push(Object::Route(decode_route(&route)));
                }
                _ => {}
            }
        }

        Ok(DumpProgress::More)
    }
}

impl Drop for NetlinkSession {
    fn drop(&mut self) {
        debug!("Closing netlink session");
    }
}

/// Netlink messages are 4-byte aligned
#[inline]
fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Decode every message in one datagram, in order
///
/// A message that fails to parse ends decoding of its datagram; the offset of
/// the next message cannot be trusted after that.
fn decode_datagram(buffer: &[u8], out: &mut Vec<ChangeRecord>) {
    let mut offset = 0;

    while offset < buffer.len() {
        let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buffer[offset..]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = ?e, offset, "Failed to parse netlink message");
                return;
            }
        };

        let msg_len = msg.header.length as usize;
        if msg_len == 0 {
            return;
        }
        offset += align(msg_len);

        if let Some(record) = decode_record(msg.payload) {
            out.push(record);
        }
    }
}

fn decode_record(payload: NetlinkPayload<RouteNetlinkMessage>) -> Option<ChangeRecord> {
    let (kind, object) = match payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
            (RecordKind::New, Object::Link(decode_link(&link)))
        }
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
            (RecordKind::Delete, Object::Link(decode_link(&link)))
        }
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
            (RecordKind::New, Object::Route(decode_route(&route)))
        }
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelRoute(route)) => {
            (RecordKind::Delete, Object::Route(decode_route(&route)))
        }
        _ => return None,
    };

    Some(ChangeRecord { kind, object })
}

fn decode_link(msg: &LinkMessage) -> Link {
    let mut link = Link::new(msg.header.index, String::new()).with_flags(msg.header.flags.bits());

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name.clone(),
            LinkAttribute::OperState(state) => link.oper_status = oper_status(state),
            LinkAttribute::LinkInfo(infos) => {
                link.is_veth = infos
                    .iter()
                    .any(|info| matches!(info, LinkInfo::Kind(InfoKind::Veth)));
            }
            _ => {}
        }
    }

    link
}

fn oper_status(state: &State) -> OperStatus {
    match state {
        State::NotPresent => OperStatus::NotPresent,
        State::Down => OperStatus::Down,
        State::LowerLayerDown => OperStatus::LowerLayerDown,
        State::Testing => OperStatus::Testing,
        State::Dormant => OperStatus::Dormant,
        State::Up => OperStatus::Up,
        _ => OperStatus::Unknown,
    }
}

fn decode_route(msg: &RouteMessage) -> Route {
    let family = match msg.header.address_family {
        AddressFamily::Inet => RouteFamily::Inet,
        AddressFamily::Inet6 => RouteFamily::Inet6,
        other => RouteFamily::Other(u8::from(other)),
    };

    let mut route = Route::new(family, None, msg.header.destination_prefix_length);
    route.table = u32::from(msg.header.table);
    route.tos = msg.header.tos;

    let mut single = NextHop::default();
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(addr) => route.destination = route_address(addr),
            RouteAttribute::Gateway(addr) => single.gateway = route_address(addr),
            RouteAttribute::Oif(index) => single.oif = Some(*index),
            RouteAttribute::Priority(priority) => route.priority = *priority,
            RouteAttribute::Table(table) => route.table = *table,
            RouteAttribute::MultiPath(hops) => {
                route.nexthops.extend(hops.iter().map(decode_nexthop));
            }
            _ => {}
        }
    }

    if single != NextHop::default() {
        route.nexthops.insert(0, single);
    }

    route
}

fn decode_nexthop(hop: &RouteNextHop) -> NextHop {
    let gateway = hop.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Gateway(addr) => route_address(addr),
        _ => None,
    });
    let oif = (hop.interface_index != 0).then_some(hop.interface_index);

    NextHop::new(gateway, oif)
}

fn route_address(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}
