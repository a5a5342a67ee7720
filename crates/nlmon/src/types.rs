//! Core types for link and route monitoring
//!
//! These are the decoded forms of the kernel's link and route objects. They
//! carry only the attributes the monitor reports on or needs to tell two
//! versions of the same object apart.

use std::net::IpAddr;

/// Interface is administratively up
pub const IFF_UP: u32 = libc::IFF_UP as u32;

/// Interface has carrier (operationally running)
pub const IFF_RUNNING: u32 = libc::IFF_RUNNING as u32;

/// Main routing table id
pub const RT_TABLE_MAIN: u32 = 254;

/// RFC 2863 operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperStatus {
    #[default]
    Unknown,
    NotPresent,
    Down,
    LowerLayerDown,
    Testing,
    Dormant,
    Up,
}

/// Network interface as mirrored in the link cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Kernel interface index (cache key)
    pub index: u32,
    /// Interface name (e.g., "eth0")
    pub name: String,
    /// IFF_* flag bitset
    pub flags: u32,
    /// Link-info kind is "veth"
    pub is_veth: bool,
    /// Operational status
    pub oper_status: OperStatus,
}

impl Link {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            flags: 0,
            is_veth: false,
            oper_status: OperStatus::Unknown,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_veth(mut self, is_veth: bool) -> Self {
        self.is_veth = is_veth;
        self
    }

    pub fn with_oper_status(mut self, oper_status: OperStatus) -> Self {
        self.oper_status = oper_status;
        self
    }

    /// Administratively up (IFF_UP)
    #[inline]
    pub fn is_up(&self) -> bool {
        self.flags & IFF_UP != 0
    }

    /// Operationally running (IFF_RUNNING)
    #[inline]
    pub fn is_running(&self) -> bool {
        self.flags & IFF_RUNNING != 0
    }
}

/// Address family of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RouteFamily {
    Inet,
    Inet6,
    Other(u8),
}

/// Identity of a route within the route cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteKey {
    pub family: RouteFamily,
    pub table: u32,
    pub destination: Option<IpAddr>,
    pub prefix_len: u8,
    pub tos: u8,
    pub priority: u32,
}

/// One forwarding path of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NextHop {
    pub gateway: Option<IpAddr>,
    /// Output interface index
    pub oif: Option<u32>,
}

impl NextHop {
    pub fn new(gateway: Option<IpAddr>, oif: Option<u32>) -> Self {
        Self { gateway, oif }
    }
}

/// Routing table entry as mirrored in the route cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub family: RouteFamily,
    /// Routing table id
    pub table: u32,
    /// Destination address; absent for the default route
    pub destination: Option<IpAddr>,
    /// Destination prefix length
    pub prefix_len: u8,
    pub tos: u8,
    /// Route metric
    pub priority: u32,
    /// Forwarding paths; more than one for a multipath route
    pub nexthops: Vec<NextHop>,
}

impl Route {
    pub fn new(family: RouteFamily, destination: Option<IpAddr>, prefix_len: u8) -> Self {
        Self {
            family,
            table: RT_TABLE_MAIN,
            destination,
            prefix_len,
            tos: 0,
            priority: 0,
            nexthops: Vec::new(),
        }
    }

    /// Default route for `family` (zero-length destination prefix)
    pub fn default_route(family: RouteFamily) -> Self {
        Self::new(family, None, 0)
    }

    /// Set the gateway of the first next-hop
    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.primary_hop().gateway = Some(gateway);
        self
    }

    /// Set the output interface of the first next-hop
    pub fn with_oif(mut self, oif: u32) -> Self {
        self.primary_hop().oif = Some(oif);
        self
    }

    /// Append a further next-hop
    pub fn with_nexthop(mut self, hop: NextHop) -> Self {
        self.nexthops.push(hop);
        self
    }

    fn primary_hop(&mut self) -> &mut NextHop {
        if self.nexthops.is_empty() {
            self.nexthops.push(NextHop::default());
        }
        &mut self.nexthops[0]
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn key(&self) -> RouteKey {
        RouteKey {
            family: self.family,
            table: self.table,
            destination: self.destination,
            prefix_len: self.prefix_len,
            tos: self.tos,
            priority: self.priority,
        }
    }

    /// Destination is the zero/any prefix
    #[inline]
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }
}

/// Which mirrored table an object belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheKind {
    Link,
    Route,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Link => "link",
            CacheKind::Route => "route",
        }
    }
}

/// Decoded kernel object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Link(Link),
    Route(Route),
}

impl Object {
    pub fn kind(&self) -> CacheKind {
        match self {
            Object::Link(_) => CacheKind::Link,
            Object::Route(_) => CacheKind::Route,
        }
    }
}

impl From<Link> for Object {
    fn from(link: Link) -> Self {
        Object::Link(link)
    }
}

impl From<Route> for Object {
    fn from(route: Route) -> Self {
        Object::Route(route)
    }
}

/// Kernel message kind of an incremental change record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// RTM_NEWLINK / RTM_NEWROUTE
    New,
    /// RTM_DELLINK / RTM_DELROUTE
    Delete,
}

/// One incremental change delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub kind: RecordKind,
    pub object: Object,
}

impl ChangeRecord {
    pub fn new(object: impl Into<Object>) -> Self {
        Self {
            kind: RecordKind::New,
            object: object.into(),
        }
    }

    pub fn delete(object: impl Into<Object>) -> Self {
        Self {
            kind: RecordKind::Delete,
            object: object.into(),
        }
    }
}

/// Action tag passed to change handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Object appeared in the cache
    New,
    /// Object left the cache
    Delete,
    /// Cached object was replaced by a different version
    Change,
    /// Unclassified; handlers ignore it
    Unspec,
}
