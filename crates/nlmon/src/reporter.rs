//! Change classification and event reporting
//!
//! Decides per change whether it is in scope and renders the single-line
//! notification. The line formats are a stable external contract:
//!
//! ```text
//! [veth ]iface NAME added
//! [veth ]iface NAME deleted
//! [veth ]iface NAME changed state {UP|DOWN} link {ON|OFF}
//! default route added
//! default route removed
//! ```

use crate::manager::ChangeHandler;
use crate::types::{Action, Link, Route};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Program name prefixed to every notification on stderr
pub const PROGRAM_NAME: &str = "nlmon";

/// Render the notification for a link change, or `None` if out of scope
pub fn render_link(link: &Link, action: Action, veth_only: bool) -> Option<String> {
    if veth_only && !link.is_veth {
        return None;
    }

    let prefix = if link.is_veth { "veth " } else { "" };
    match action {
        Action::Delete => Some(format!("{prefix}iface {} deleted", link.name)),
        Action::New => Some(format!("{prefix}iface {} added", link.name)),
        Action::Change => Some(format!(
            "{prefix}iface {} changed state {} link {}",
            link.name,
            if link.is_up() { "UP" } else { "DOWN" },
            if link.is_running() { "ON" } else { "OFF" },
        )),
        Action::Unspec => None,
    }
}

/// Render the notification for a route change, or `None` if out of scope
///
/// Only default routes are reported, and nothing is reported in veth-only mode.
pub fn render_route(route: &Route, action: Action, veth_only: bool) -> Option<String> {
    if veth_only || !route.is_default() {
        return None;
    }

    match action {
        Action::Delete => Some("default route removed".to_string()),
        _ => Some("default route added".to_string()),
    }
}

/// Sink for rendered notification lines
pub trait Notifier {
    fn notify(&self, line: &str);
}

/// Writes `nlmon: LINE` to stderr
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn notify(&self, line: &str) {
        let mut stderr = std::io::stderr().lock();
        // Nothing sensible to do if stderr is gone
        let _ = writeln!(stderr, "{PROGRAM_NAME}: {line}");
    }
}

/// Collects lines in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    lines: Rc<RefCell<Vec<String>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines collected so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    /// Take and clear the collected lines
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.borrow_mut())
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }
}

/// Link cache handler
pub struct LinkReporter {
    veth_only: bool,
    notifier: Rc<dyn Notifier>,
}

impl LinkReporter {
    pub fn new(veth_only: bool, notifier: Rc<dyn Notifier>) -> Self {
        Self {
            veth_only,
            notifier,
        }
    }
}

impl ChangeHandler<Link> for LinkReporter {
    fn on_change(&self, link: &Link, action: Action) {
        if let Some(line) = render_link(link, action, self.veth_only) {
            self.notifier.notify(&line);
        }
    }
}

/// Route cache handler
pub struct RouteReporter {
    veth_only: bool,
    notifier: Rc<dyn Notifier>,
}

impl RouteReporter {
    pub fn new(veth_only: bool, notifier: Rc<dyn Notifier>) -> Self {
        Self {
            veth_only,
            notifier,
        }
    }
}

impl ChangeHandler<Route> for RouteReporter {
    fn on_change(&self, route: &Route, action: Action) {
        if let Some(line) = render_route(route, action, self.veth_only) {
            self.notifier.notify(&line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IFF_RUNNING, IFF_UP, RouteFamily};
    use std::net::Ipv4Addr;

    #[test]
    fn test_link_added() {
        let link = Link::new(2, "eth0");
        assert_eq!(
            render_link(&link, Action::New, false).as_deref(),
            Some("iface eth0 added")
        );
    }

    #[test]
    fn test_link_filtered_when_not_veth() {
        let link = Link::new(2, "eth0");
        assert_eq!(render_link(&link, Action::New, true), None);
        assert_eq!(render_link(&link, Action::Delete, true), None);
    }

    #[test]
    fn test_veth_deleted_any_filter() {
        let link = Link::new(5, "veth1").with_veth(true);
        for veth_only in [false, true] {
            assert_eq!(
                render_link(&link, Action::Delete, veth_only).as_deref(),
                Some("veth iface veth1 deleted")
            );
        }
    }

    #[test]
    fn test_link_changed_flag_combinations() {
        let cases = [
            (0, "iface eth0 changed state DOWN link OFF"),
            (IFF_UP, "iface eth0 changed state UP link OFF"),
            (IFF_RUNNING, "iface eth0 changed state DOWN link ON"),
            (IFF_UP | IFF_RUNNING, "iface eth0 changed state UP link ON"),
        ];

        for (flags, expected) in cases {
            let link = Link::new(2, "eth0").with_flags(flags);
            assert_eq!(
                render_link(&link, Action::Change, false).as_deref(),
                Some(expected)
            );
        }
    }

    #[test]
    fn test_veth_changed_has_prefix() {
        let link = Link::new(5, "veth1")
            .with_veth(true)
            .with_flags(IFF_UP | IFF_RUNNING);
        assert_eq!(
            render_link(&link, Action::Change, true).as_deref(),
            Some("veth iface veth1 changed state UP link ON")
        );
    }

    #[test]
    fn test_link_unspec_suppressed() {
        let link = Link::new(2, "eth0");
        assert_eq!(render_link(&link, Action::Unspec, false), None);
    }

    #[test]
    fn test_default_route_added_and_removed() {
        let route = Route::default_route(RouteFamily::Inet);
        assert_eq!(
            render_route(&route, Action::New, false).as_deref(),
            Some("default route added")
        );
        assert_eq!(
            render_route(&route, Action::Change, false).as_deref(),
            Some("default route added")
        );
        assert_eq!(
            render_route(&route, Action::Delete, false).as_deref(),
            Some("default route removed")
        );
    }

    #[test]
    fn test_route_suppressed_in_veth_mode() {
        let route = Route::default_route(RouteFamily::Inet6);
        assert_eq!(render_route(&route, Action::New, true), None);
    }

    #[test]
    fn test_non_default_route_suppressed() {
        let route = Route::new(
            RouteFamily::Inet,
            Some(Ipv4Addr::new(192, 168, 1, 0).into()),
            24,
        );
        for veth_only in [false, true] {
            assert_eq!(render_route(&route, Action::Delete, veth_only), None);
        }
    }

    #[test]
    fn test_reporters_write_to_notifier() {
        let notifier = MemoryNotifier::new();
        let links = LinkReporter::new(false, Rc::new(notifier.clone()));
        let routes = RouteReporter::new(false, Rc::new(notifier.clone()));

        links.on_change(&Link::new(2, "eth0"), Action::New);
        routes.on_change(&Route::default_route(RouteFamily::Inet), Action::Delete);

        assert_eq!(
            notifier.take(),
            vec!["iface eth0 added", "default route removed"]
        );
        assert!(notifier.lines().is_empty());
    }
}
