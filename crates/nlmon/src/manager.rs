//! Cache manager
//!
//! Binds the mirrored caches to one transport session. On readiness it drains
//! the session, applies each record to its cache in arrival order and calls
//! the registered handler for every change that actually altered a cache.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Incremental kernel state tracking
//! - CM-8: System Component Inventory - Interface and route inventory

use crate::cache::{Cache, Cacheable};
use crate::error::{NlmonError, Result, SetupStage};
use crate::transport::Transport;
use crate::types::{Action, CacheKind, Link, Object, RecordKind, Route};
use std::any::Any;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use tracing::{debug, info, instrument, trace};

/// Receives one callback per applied cache change
pub trait ChangeHandler<T> {
    fn on_change(&self, object: &T, action: Action);
}

/// Narrowing from the transport's object enum to one cached type
pub trait FromObject: Sized {
    fn from_object(object: Object) -> Option<Self>;
}

impl FromObject for Link {
    fn from_object(object: Object) -> Option<Self> {
        match object {
            Object::Link(link) => Some(link),
            Object::Route(_) => None,
        }
    }
}

impl FromObject for Route {
    fn from_object(object: Object) -> Option<Self> {
        match object {
            Object::Route(route) => Some(route),
            Object::Link(_) => None,
        }
    }
}

/// Outcome of one [`CacheManager::data_ready`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Records drained from the session
    pub received: usize,
    /// Handler callbacks made
    pub dispatched: usize,
    /// Kernel signalled that records may have been dropped
    pub overrun: bool,
}

/// Type-erased (cache, handler) pair
trait Registration {
    fn apply(&mut self, kind: RecordKind, object: Object) -> bool;
    fn refill(&mut self, objects: Vec<Object>);
    fn announce_all(&self) -> usize;
    fn len(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

struct Registered<T: Cacheable> {
    cache: Cache<T>,
    handler: Box<dyn ChangeHandler<T>>,
}

impl<T> Registration for Registered<T>
where
    T: Cacheable + FromObject + 'static,
{
    fn apply(&mut self, kind: RecordKind, object: Object) -> bool {
        let Some(object) = T::from_object(object) else {
            return false;
        };

        match self.cache.apply(kind, object) {
            Some((action, object)) => {
                debug!(cache = T::KIND.as_str(), ?action, ?object, "Applied change");
                self.handler.on_change(&object, action);
                true
            }
            None => {
                trace!(cache = T::KIND.as_str(), ?kind, "Record left cache unchanged");
                false
            }
        }
    }

    fn refill(&mut self, objects: Vec<Object>) {
        self.cache
            .refill(objects.into_iter().filter_map(T::from_object));
    }

    fn announce_all(&self) -> usize {
        for object in self.cache.iter() {
            self.handler.on_change(object, Action::New);
        }
        self.cache.len()
    }

    fn len(&self) -> usize {
        self.cache.len()
    }

    fn as_any(&self) -> &dyn Any {
        &self.cache
    }
}

/// Owns the transport session and every registered cache
///
/// Dropping the manager releases the caches first, then the session.
pub struct CacheManager<S: Transport> {
    caches: BTreeMap<CacheKind, Box<dyn Registration>>,
    session: S,
}

impl<S: Transport> CacheManager<S> {
    /// Bind a manager to `session`
    ///
    /// Fails if the session has no valid pollable descriptor.
    pub fn new(session: S) -> Result<Self> {
        let fd = session.as_raw_fd();
        if fd < 0 {
            return Err(NlmonError::setup(
                SetupStage::Descriptor,
                io::Error::from_raw_os_error(libc::EBADF),
            ));
        }

        Ok(Self {
            caches: BTreeMap::new(),
            session,
        })
    }

    /// Pollable descriptor of the underlying session
    pub fn as_raw_fd(&self) -> RawFd {
        self.session.as_raw_fd()
    }

    /// Allocate a cache for `T`, fill it from a dump and attach `handler`
    ///
    /// The initial fill does not invoke the handler. Returns the number of
    /// entries loaded.
    #[instrument(skip_all, fields(cache = T::KIND.as_str()))]
    pub fn register_cache<T, H>(&mut self, handler: H) -> Result<usize>
    where
        T: Cacheable + FromObject + 'static,
        H: ChangeHandler<T> + 'static,
    {
        let stage = match T::KIND {
            CacheKind::Link => SetupStage::LinkCache,
            CacheKind::Route => SetupStage::RouteCache,
        };

        let objects = self
            .session
            .dump(T::KIND)
            .map_err(|e| into_setup_error(stage, e))?;

        let mut registered = Registered {
            cache: Cache::<T>::new(),
            handler: Box::new(handler),
        };
        registered.refill(objects);

        let entries = registered.len();
        info!(entries, "Registered cache");
        self.caches.insert(T::KIND, Box::new(registered));

        Ok(entries)
    }

    pub fn is_registered(&self, kind: CacheKind) -> bool {
        self.caches.contains_key(&kind)
    }

    /// Drain all pending records and dispatch the resulting changes
    ///
    /// Records are applied and reported in arrival order before this returns.
    /// Records for a kind with no registered cache are discarded.
    #[instrument(skip(self))]
    pub fn data_ready(&mut self) -> Result<DrainReport> {
        let received = self.session.recv_records()?;

        let mut report = DrainReport {
            received: received.records.len(),
            dispatched: 0,
            overrun: received.overrun,
        };

        for record in received.records {
            let Some(registration) = self.caches.get_mut(&record.object.kind()) else {
                trace!(kind = ?record.object.kind(), "No cache registered for record");
                continue;
            };

            if registration.apply(record.kind, record.object) {
                report.dispatched += 1;
            }
        }

        Ok(report)
    }

    /// Discard and rebuild the `kind` cache from a full dump
    ///
    /// Returns the new number of entries. Unregistered kinds are left alone.
    #[instrument(skip(self))]
    pub fn refill(&mut self, kind: CacheKind) -> Result<usize> {
        if !self.caches.contains_key(&kind) {
            return Ok(0);
        }

        let objects = self.session.dump(kind)?;
        let Some(registration) = self.caches.get_mut(&kind) else {
            return Ok(0);
        };
        registration.refill(objects);

        debug!(entries = registration.len(), "Refilled cache");
        Ok(registration.len())
    }

    /// Report every entry of the `kind` cache to its handler as [`Action::New`]
    pub fn announce_all(&self, kind: CacheKind) -> usize {
        self.caches
            .get(&kind)
            .map(|registration| registration.announce_all())
            .unwrap_or(0)
    }

    /// Typed read access to a registered cache
    pub fn cache<T: Cacheable + 'static>(&self) -> Option<&Cache<T>> {
        self.caches
            .get(&T::KIND)
            .and_then(|registration| registration.as_any().downcast_ref::<Cache<T>>())
    }

    pub fn links(&self) -> Option<&Cache<Link>> {
        self.cache::<Link>()
    }

    pub fn routes(&self) -> Option<&Cache<Route>> {
        self.cache::<Route>()
    }
}

fn into_setup_error(stage: SetupStage, err: NlmonError) -> NlmonError {
    match err {
        NlmonError::Transport(source) | NlmonError::Signal(source) => {
            NlmonError::setup(stage, source)
        }
        NlmonError::Setup { source, .. } => NlmonError::setup(stage, source),
        NlmonError::Decode(msg) | NlmonError::Usage(msg) | NlmonError::Config(msg) => {
            NlmonError::setup(stage, io::Error::new(io::ErrorKind::InvalidData, msg))
        }
    }
}
