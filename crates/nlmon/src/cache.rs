//! Mirrored kernel state caches
//!
//! A [`Cache`] holds the last-known full table of links or routes. It is only
//! ever mutated by applying change records in arrival order or by a full
//! refill from a kernel dump.

use crate::types::{Action, CacheKind, Link, RecordKind, Route, RouteFamily, RouteKey};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt::Debug;

/// Object that can be mirrored in a [`Cache`]
pub trait Cacheable: Clone + PartialEq + Debug {
    /// Identity of the object within its table
    type Key: Ord + Clone + Debug;

    /// Table this object lives in
    const KIND: CacheKind;

    fn cache_key(&self) -> Self::Key;

    /// Fold a newer version of the same object into `self`
    ///
    /// Returns `false` when `self` is left unchanged.
    fn merge(&mut self, update: Self) -> bool {
        if *self == update {
            return false;
        }
        *self = update;
        true
    }

    /// Remove the part of `self` named by a delete record
    ///
    /// Returns `true` if the entry survives with less content. When it
    /// returns `false` the whole entry is gone and `self` is untouched.
    fn withdraw(&mut self, _removal: &Self) -> bool {
        false
    }
}

impl Cacheable for Link {
    type Key = u32;
    const KIND: CacheKind = CacheKind::Link;

    fn cache_key(&self) -> u32 {
        self.index
    }
}

impl Cacheable for Route {
    type Key = RouteKey;
    const KIND: CacheKind = CacheKind::Route;

    fn cache_key(&self) -> RouteKey {
        self.key()
    }

    /// IPv6 announces each appended next-hop as its own route message with
    /// the key of the existing route; such a message adds a path.
    fn merge(&mut self, update: Route) -> bool {
        if self.family == RouteFamily::Inet6 {
            if let [hop] = update.nexthops.as_slice() {
                if self.nexthops.contains(hop) {
                    return false;
                }
                self.nexthops.push(*hop);
                return true;
            }
        }

        if *self == update {
            return false;
        }
        *self = update;
        true
    }

    /// An IPv6 delete naming some of several next-hops removes only those.
    fn withdraw(&mut self, removal: &Route) -> bool {
        if self.family != RouteFamily::Inet6 || self.nexthops.len() < 2 {
            return false;
        }

        let remaining: Vec<_> = self
            .nexthops
            .iter()
            .filter(|hop| !removal.nexthops.contains(hop))
            .copied()
            .collect();

        if remaining.is_empty() || remaining.len() == self.nexthops.len() {
            return false;
        }
        self.nexthops = remaining;
        true
    }
}

/// Ordered mirror of one kernel table
#[derive(Debug, Clone, PartialEq)]
pub struct Cache<T: Cacheable> {
    entries: BTreeMap<T::Key, T>,
}

pub type LinkCache = Cache<Link>;
pub type RouteCache = Cache<Route>;

impl<T: Cacheable> Cache<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> CacheKind {
        T::KIND
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.entries.get(key)
    }

    /// Entries in key order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    /// Apply one incremental change record
    ///
    /// Returns the action and object to report, or `None` when the record
    /// leaves the table unchanged (re-announced identical object, or delete
    /// of an unknown key). A delete reports the cached version of the object.
    pub fn apply(&mut self, kind: RecordKind, object: T) -> Option<(Action, T)> {
        match (kind, self.entries.entry(object.cache_key())) {
            (RecordKind::New, Entry::Vacant(slot)) => {
                slot.insert(object.clone());
                Some((Action::New, object))
            }
            (RecordKind::New, Entry::Occupied(mut slot)) => slot
                .get_mut()
                .merge(object)
                .then(|| (Action::Change, slot.get().clone())),
            (RecordKind::Delete, Entry::Vacant(_)) => None,
            (RecordKind::Delete, Entry::Occupied(mut slot)) => {
                if slot.get_mut().withdraw(&object) {
                    Some((Action::Change, slot.get().clone()))
                } else {
                    Some((Action::Delete, slot.remove()))
                }
            }
        }
    }

    /// Discard all entries and rebuild from a full dump
    ///
    /// Dump entries sharing a key are merged as if they arrived as records.
    pub fn refill(&mut self, objects: impl IntoIterator<Item = T>) {
        self.entries.clear();
        for object in objects {
            match self.entries.entry(object.cache_key()) {
                Entry::Vacant(slot) => {
                    slot.insert(object);
                }
                Entry::Occupied(mut slot) => {
                    slot.get_mut().merge(object);
                }
            }
        }
    }
}

impl<T: Cacheable> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IFF_RUNNING, IFF_UP, NextHop};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn v6_hop(last: u16, oif: u32) -> NextHop {
        NextHop::new(
            Some(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 9, 0, 0, 0, 0, last))),
            Some(oif),
        )
    }

    fn v6_default(hop: NextHop) -> Route {
        Route::default_route(RouteFamily::Inet6)
            .with_priority(500)
            .with_nexthop(hop)
    }

    #[test]
    fn test_apply_new_link() {
        let mut cache = LinkCache::new();
        let link = Link::new(2, "eth0");

        let applied = cache.apply(RecordKind::New, link.clone());
        assert_eq!(applied, Some((Action::New, link.clone())));
        assert_eq!(cache.get(&2), Some(&link));
    }

    #[test]
    fn test_apply_changed_link() {
        let mut cache = LinkCache::new();
        cache.apply(RecordKind::New, Link::new(2, "eth0"));

        let up = Link::new(2, "eth0").with_flags(IFF_UP | IFF_RUNNING);
        let applied = cache.apply(RecordKind::New, up.clone());
        assert_eq!(applied, Some((Action::Change, up)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_apply_identical_link_is_silent() {
        let mut cache = LinkCache::new();
        let link = Link::new(2, "eth0").with_flags(IFF_UP);
        cache.apply(RecordKind::New, link.clone());

        assert_eq!(cache.apply(RecordKind::New, link), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_apply_delete_reports_cached_object() {
        let mut cache = LinkCache::new();
        let cached = Link::new(5, "veth1").with_veth(true);
        cache.apply(RecordKind::New, cached.clone());

        // Delete notifications may carry fewer attributes than the cached copy
        let applied = cache.apply(RecordKind::Delete, Link::new(5, "veth1"));
        assert_eq!(applied, Some((Action::Delete, cached)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_apply_delete_unknown_is_silent() {
        let mut cache = LinkCache::new();
        assert_eq!(cache.apply(RecordKind::Delete, Link::new(9, "gone0")), None);
    }

    #[test]
    fn test_refill_replaces_contents() {
        let mut cache = LinkCache::new();
        cache.apply(RecordKind::New, Link::new(1, "lo"));
        cache.apply(RecordKind::New, Link::new(7, "stale0"));

        cache.refill(vec![Link::new(1, "lo"), Link::new(2, "eth0")]);

        let names: Vec<_> = cache.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["lo", "eth0"]);
    }

    #[test]
    fn test_route_cache_keyed_by_destination() {
        let mut cache = RouteCache::new();
        let default = Route::default_route(RouteFamily::Inet);
        let net = Route::new(RouteFamily::Inet, Some(Ipv4Addr::new(10, 0, 0, 0).into()), 8);

        cache.apply(RecordKind::New, default.clone());
        cache.apply(RecordKind::New, net);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.kind(), CacheKind::Route);

        cache.apply(RecordKind::Delete, default);
        assert_eq!(cache.len(), 1);
        assert!(cache.iter().all(|r| !r.is_default()));
    }

    #[test]
    fn test_ipv6_append_then_partial_delete() {
        let mut cache = RouteCache::new();
        let first = v6_hop(1, 4);
        let second = v6_hop(3, 4);

        let applied = cache.apply(RecordKind::New, v6_default(first));
        assert_eq!(applied.map(|(action, _)| action), Some(Action::New));

        let (action, merged) = cache.apply(RecordKind::New, v6_default(second)).unwrap();
        assert_eq!(action, Action::Change);
        assert_eq!(merged.nexthops, vec![first, second]);
        assert_eq!(cache.len(), 1);

        let (action, remaining) = cache.apply(RecordKind::Delete, v6_default(second)).unwrap();
        assert_eq!(action, Action::Change);
        assert_eq!(remaining.nexthops, vec![first]);
        assert_eq!(cache.len(), 1);
        assert!(cache.iter().all(|route| route.is_default()));

        let (action, gone) = cache.apply(RecordKind::Delete, v6_default(first)).unwrap();
        assert_eq!(action, Action::Delete);
        assert_eq!(gone.nexthops, vec![first]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ipv6_repeated_nexthop_is_silent() {
        let mut cache = RouteCache::new();
        cache.apply(RecordKind::New, v6_default(v6_hop(1, 4)));

        assert_eq!(cache.apply(RecordKind::New, v6_default(v6_hop(1, 4))), None);
        assert_eq!(cache.get(&v6_default(v6_hop(1, 4)).key()).unwrap().nexthops.len(), 1);
    }

    #[test]
    fn test_ipv6_delete_of_unknown_nexthop_drops_entry() {
        let mut cache = RouteCache::new();
        cache.apply(RecordKind::New, v6_default(v6_hop(1, 4)));
        cache.apply(RecordKind::New, v6_default(v6_hop(3, 4)));

        let applied = cache.apply(RecordKind::Delete, v6_default(v6_hop(9, 4)));
        assert_eq!(applied.map(|(action, _)| action), Some(Action::Delete));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ipv4_route_update_replaces_nexthop() {
        let mut cache = RouteCache::new();
        let gw = |last| IpAddr::V4(Ipv4Addr::new(192, 0, 2, last));
        cache.apply(RecordKind::New, Route::default_route(RouteFamily::Inet).with_gateway(gw(1)));

        let (action, route) = cache
            .apply(RecordKind::New, Route::default_route(RouteFamily::Inet).with_gateway(gw(2)))
            .unwrap();
        assert_eq!(action, Action::Change);
        assert_eq!(route.nexthops, vec![NextHop::new(Some(gw(2)), None)]);
    }

    #[test]
    fn test_refill_merges_split_ipv6_dump() {
        let mut cache = RouteCache::new();
        cache.refill(vec![v6_default(v6_hop(1, 4)), v6_default(v6_hop(3, 4))]);

        assert_eq!(cache.len(), 1);
        let route = cache.iter().next().unwrap();
        assert_eq!(route.nexthops, vec![v6_hop(1, 4), v6_hop(3, 4)]);
    }
}
