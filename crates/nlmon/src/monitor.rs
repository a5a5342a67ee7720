//! Monitor context and dispatch loop
//!
//! Descriptor readiness and signals are turned into [`MonitorEvent`]s by an
//! [`EventSource`] and consumed one at a time by [`Monitor::run`]. All cache
//! mutation and reporting happens on the calling task; the only suspension
//! point is waiting for the next event.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Event loop for monitoring
//! - CP-10: System Recovery - Reload-triggered reconciliation
//! - AU-12: Audit Record Generation - Log lifecycle events

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::manager::CacheManager;
use crate::reconcile::reconcile;
use crate::reporter::{LinkReporter, Notifier, RouteReporter};
use crate::transport::Transport;
use crate::types::{Link, Route};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::rc::Rc;
use tracing::{debug, info, instrument, warn};

/// Input to the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Transport descriptor is readable
    Readable,
    /// Reload requested (SIGHUP)
    Reload,
    /// Terminate requested (SIGINT/SIGTERM)
    Terminate,
}

/// Produces the next event for the dispatch loop
#[async_trait(?Send)]
pub trait EventSource {
    async fn next_event(&mut self) -> Result<MonitorEvent>;
}

/// Replays a fixed sequence of events, then reports [`MonitorEvent::Terminate`]
#[derive(Debug, Clone, Default)]
pub struct ScriptedEvents {
    events: VecDeque<MonitorEvent>,
}

impl ScriptedEvents {
    pub fn new(events: impl IntoIterator<Item = MonitorEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }

    /// Events not yet delivered
    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

#[async_trait(?Send)]
impl EventSource for ScriptedEvents {
    async fn next_event(&mut self) -> Result<MonitorEvent> {
        Ok(self.events.pop_front().unwrap_or(MonitorEvent::Terminate))
    }
}

/// Counters kept over the life of a monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub drains: u64,
    pub records: u64,
    pub reconciliations: u64,
    pub overruns: u64,
}

/// Process-wide monitor context
///
/// Owns the cache manager and through it the session. The filter setting
/// lives in the reporters. Dropping the monitor releases caches, then the
/// session.
pub struct Monitor<S: Transport> {
    manager: CacheManager<S>,
    stats: MonitorStats,
}

impl<S: Transport> Monitor<S> {
    /// Create the cache manager on `session` and register the link and route
    /// caches with their reporters
    #[instrument(skip_all, fields(veth_only = config.veth_only))]
    pub fn new(session: S, config: &MonitorConfig, notifier: Rc<dyn Notifier>) -> Result<Self> {
        let mut manager = CacheManager::new(session)?;

        let links = manager
            .register_cache::<Link, _>(LinkReporter::new(config.veth_only, notifier.clone()))?;
        let routes =
            manager.register_cache::<Route, _>(RouteReporter::new(config.veth_only, notifier))?;

        info!(links, routes, "Monitor initialized");
        Ok(Self {
            manager,
            stats: MonitorStats::default(),
        })
    }

    pub fn manager(&self) -> &CacheManager<S> {
        &self.manager
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    /// Handle one event
    ///
    /// Returns [`ControlFlow::Break`] once termination was requested.
    pub fn dispatch(&mut self, event: MonitorEvent) -> Result<ControlFlow<()>> {
        match event {
            MonitorEvent::Readable => {
                let report = self.manager.data_ready()?;
                self.stats.drains += 1;
                self.stats.records += report.received as u64;
                debug!(
                    received = report.received,
                    dispatched = report.dispatched,
                    "Processed netlink records"
                );

                if report.overrun {
                    self.stats.overruns += 1;
                    warn!("Records may have been dropped, resynchronizing caches");
                    self.reconcile()?;
                }
                Ok(ControlFlow::Continue(()))
            }
            MonitorEvent::Reload => {
                info!("Reload requested");
                self.reconcile()?;
                Ok(ControlFlow::Continue(()))
            }
            MonitorEvent::Terminate => {
                info!("Terminate requested");
                Ok(ControlFlow::Break(()))
            }
        }
    }

    fn reconcile(&mut self) -> Result<()> {
        reconcile(&mut self.manager)?;
        self.stats.reconciliations += 1;
        Ok(())
    }

    /// Dispatch events from `source` until terminate or an error
    pub async fn run<E: EventSource + ?Sized>(&mut self, source: &mut E) -> Result<()> {
        info!("Listening to link and route events");

        loop {
            let event = source.next_event().await?;
            if self.dispatch(event)?.is_break() {
                break;
            }
        }

        info!(
            drains = self.stats.drains,
            records = self.stats.records,
            reconciliations = self.stats.reconciliations,
            overruns = self.stats.overruns,
            "Monitor stopped"
        );
        Ok(())
    }
}

#[cfg(unix)]
mod signals {
    use super::{EventSource, MonitorEvent};
    use crate::error::{NlmonError, Result, SetupStage};
    use async_trait::async_trait;
    use std::io;
    use std::os::fd::{FromRawFd, OwnedFd, RawFd};
    use tokio::io::Interest;
    use tokio::io::unix::AsyncFd;
    use tokio::signal::unix::{Signal, SignalKind, signal};
    use tracing::debug;

    /// Readiness of the transport descriptor plus SIGHUP/SIGINT/SIGTERM
    ///
    /// Must be created inside a tokio runtime.
    pub struct SignalEventSource {
        fd: AsyncFd<OwnedFd>,
        reload: Signal,
        interrupt: Signal,
        terminate: Signal,
    }

    impl SignalEventSource {
        /// Watch `fd` for readability
        ///
        /// The descriptor is duplicated so the session keeps ownership of its
        /// socket.
        pub fn new(fd: RawFd) -> Result<Self> {
            // SAFETY: dup returns a new descriptor we own exclusively
            let owned = unsafe {
                let new_fd = libc::dup(fd);
                if new_fd < 0 {
                    return Err(NlmonError::setup(
                        SetupStage::EventLoop,
                        io::Error::last_os_error(),
                    ));
                }
                OwnedFd::from_raw_fd(new_fd)
            };

            let fd = AsyncFd::with_interest(owned, Interest::READABLE)
                .map_err(|e| NlmonError::setup(SetupStage::EventLoop, e))?;

            let reload = signal(SignalKind::hangup()).map_err(NlmonError::Signal)?;
            let interrupt = signal(SignalKind::interrupt()).map_err(NlmonError::Signal)?;
            let terminate = signal(SignalKind::terminate()).map_err(NlmonError::Signal)?;

            debug!("Registered descriptor and signal watchers");
            Ok(Self {
                fd,
                reload,
                interrupt,
                terminate,
            })
        }
    }

    #[async_trait(?Send)]
    impl EventSource for SignalEventSource {
        async fn next_event(&mut self) -> Result<MonitorEvent> {
            tokio::select! {
                biased;

                _ = self.terminate.recv() => Ok(MonitorEvent::Terminate),
                _ = self.interrupt.recv() => Ok(MonitorEvent::Terminate),
                _ = self.reload.recv() => Ok(MonitorEvent::Reload),
                guard = self.fd.readable() => {
                    // The drain that follows reads until EAGAIN
                    guard.map_err(NlmonError::Transport)?.clear_ready();
                    Ok(MonitorEvent::Readable)
                }
            }
        }
    }
}

#[cfg(unix)]
pub use signals::SignalEventSource;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NlmonError;
    use crate::reporter::MemoryNotifier;
    use crate::transport::MemoryTransport;
    use crate::types::{ChangeRecord, IFF_UP, RouteFamily};

    fn monitor(
        transport: MemoryTransport,
        veth_only: bool,
    ) -> (Monitor<MemoryTransport>, MemoryNotifier) {
        let notifier = MemoryNotifier::new();
        let config = MonitorConfig { veth_only };
        let monitor = Monitor::new(transport, &config, Rc::new(notifier.clone())).unwrap();
        (monitor, notifier)
    }

    #[test]
    fn test_dispatch_readable_reports_changes() {
        let transport = MemoryTransport::new().with_links(vec![Link::new(2, "eth0")]);
        let (mut monitor, notifier) = monitor(transport.clone(), false);

        transport.push(ChangeRecord::new(Link::new(2, "eth0").with_flags(IFF_UP)));
        let flow = monitor.dispatch(MonitorEvent::Readable).unwrap();

        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(
            notifier.lines(),
            vec!["iface eth0 changed state UP link OFF"]
        );
        assert_eq!(monitor.stats().drains, 1);
        assert_eq!(monitor.stats().records, 1);
    }

    #[test]
    fn test_dispatch_terminate_breaks() {
        let (mut monitor, notifier) = monitor(MemoryTransport::new(), false);
        let flow = monitor.dispatch(MonitorEvent::Terminate).unwrap();
        assert!(flow.is_break());
        assert!(notifier.lines().is_empty());
    }

    #[test]
    fn test_overrun_triggers_reconcile() {
        let transport = MemoryTransport::new();
        let (mut monitor, notifier) = monitor(transport.clone(), false);

        transport.drop_record(ChangeRecord::new(Route::default_route(RouteFamily::Inet)));
        monitor.dispatch(MonitorEvent::Readable).unwrap();

        assert_eq!(notifier.lines(), vec!["default route added"]);
        assert_eq!(monitor.stats().overruns, 1);
        assert_eq!(monitor.stats().reconciliations, 1);
    }

    #[test]
    fn test_setup_failure_on_cache_fill() {
        let transport = MemoryTransport::new();
        transport.fail_dump(crate::types::CacheKind::Link, libc::ENOMEM);

        let config = MonitorConfig::default();
        let result = Monitor::new(transport, &config, Rc::new(MemoryNotifier::new()));
        assert!(matches!(result, Err(NlmonError::Setup { .. })));
    }

    #[tokio::test]
    async fn test_run_stops_on_terminate() {
        let transport = MemoryTransport::new();
        let (mut monitor, notifier) = monitor(transport.clone(), false);
        transport.push(ChangeRecord::new(Link::new(3, "eth1")));

        let mut events = ScriptedEvents::new([
            MonitorEvent::Readable,
            MonitorEvent::Terminate,
            MonitorEvent::Readable,
        ]);
        transport.push(ChangeRecord::new(Link::new(4, "eth2")));

        monitor.run(&mut events).await.unwrap();

        assert_eq!(events.remaining(), 1);
        assert_eq!(notifier.lines(), vec!["iface eth1 added", "iface eth2 added"]);
    }

    #[tokio::test]
    async fn test_run_propagates_transport_error() {
        let transport = MemoryTransport::new();
        let (mut monitor, _notifier) = monitor(transport.clone(), false);
        transport.fail_next_recv(libc::EIO);

        let mut events = ScriptedEvents::new([MonitorEvent::Readable]);
        let err = monitor.run(&mut events).await.unwrap_err();
        assert!(matches!(err, NlmonError::Transport(_)));
    }
}
