//! Kernel link and default route monitor
//!
//! nlmon mirrors the kernel's network interface table and routing table in
//! user space through netlink, and prints one line to stderr for every change
//! of interest: interfaces appearing, disappearing or changing state, and the
//! default route being added or removed.
//!
//! A reload request (SIGHUP) rebuilds both mirrors from full kernel dumps and
//! re-announces every entry. A receive buffer overrun triggers the same
//! resynchronization. SIGINT and SIGTERM stop the monitor cleanly.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! This module implements the following security controls:
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AC-3 | Access Enforcement | Kernel netlink multicast groups |
//! | AU-3 | Content of Audit Records | Structured logging with object details |
//! | AU-12 | Audit Record Generation | Every in-scope change reported |
//! | CM-8 | System Component Inventory | Mirrored interface and route tables |
//! | CP-10 | System Recovery | Reconciliation on reload or overrun |
//! | SI-4 | System Monitoring | Real-time link and route monitoring |
//! | SI-11 | Error Handling | Structured error types |
//!
//! # Architecture
//!
//! ```text
//! +-----------------+     +----------------------------------------+
//! |  Linux Kernel   |     |                 nlmon                  |
//! |                 |     |                                        |
//! |  RTM_NEWLINK    |---->| NetlinkSession --> CacheManager        |
//! |  RTM_DELLINK    |     |        ^            |  LinkCache       |
//! |  RTM_NEWROUTE   |     |        |            |  RouteCache      |
//! |  RTM_DELROUTE   |     |   EventSource       v                  |
//! |                 |     |   (fd, signals) LinkReporter           |
//! |  dump requests  |<----|        |        RouteReporter --> stderr|
//! +-----------------+     |        +--> Monitor (dispatch loop)    |
//!                         +----------------------------------------+
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod monitor;
#[cfg(target_os = "linux")]
pub mod netlink;
pub mod reconcile;
pub mod reporter;
pub mod transport;
pub mod types;

pub use cache::{Cache, Cacheable, LinkCache, RouteCache};
pub use config::{Cli, Command, MonitorConfig, USAGE, parse_args, print_usage};
pub use error::{NlmonError, Result, SetupStage};
pub use manager::{CacheManager, ChangeHandler, DrainReport, FromObject};
#[cfg(unix)]
pub use monitor::SignalEventSource;
pub use monitor::{EventSource, Monitor, MonitorEvent, MonitorStats, ScriptedEvents};
#[cfg(target_os = "linux")]
pub use netlink::NetlinkSession;
pub use reconcile::{ReconcileSummary, reconcile};
pub use reporter::{
    LinkReporter, MemoryNotifier, Notifier, RouteReporter, StderrNotifier, render_link,
    render_route,
};
pub use transport::{MemoryTransport, RECV_BUFFER_SIZE, Received, Transport};
pub use types::{
    Action, CacheKind, ChangeRecord, IFF_RUNNING, IFF_UP, Link, NextHop, Object, OperStatus,
    RecordKind, Route, RouteFamily, RouteKey,
};
