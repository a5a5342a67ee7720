//! Error types for nlmon

use std::io;
use thiserror::Error;

/// Setup step that failed before the event loop started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    /// Allocating or binding the notification socket
    Socket,
    /// Allocating or binding the dump socket
    SyncSocket,
    /// Retrieving the pollable descriptor
    Descriptor,
    /// Allocating the link cache
    LinkCache,
    /// Allocating the route cache
    RouteCache,
    /// Registering with the event loop
    EventLoop,
}

impl SetupStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupStage::Socket => "netlink socket",
            SetupStage::SyncSocket => "netlink sync socket",
            SetupStage::Descriptor => "netlink descriptor",
            SetupStage::LinkCache => "link cache",
            SetupStage::RouteCache => "route cache",
            SetupStage::EventLoop => "event loop",
        }
    }
}

impl std::fmt::Display for SetupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitor errors
#[derive(Error, Debug)]
pub enum NlmonError {
    /// Fatal failure while setting up the session, manager or caches
    #[error("{stage} failed: {source}")]
    Setup {
        stage: SetupStage,
        #[source]
        source: io::Error,
    },

    /// Receive or send failure on an established session
    #[error("Netlink transport error: {0}")]
    Transport(#[source] io::Error),

    /// Kernel message that could not be decoded
    #[error("Netlink decode error: {0}")]
    Decode(String),

    /// Invalid command line
    #[error("Usage error: {0}")]
    Usage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signal handler installation failed
    #[error("Signal error: {0}")]
    Signal(#[source] io::Error),
}

impl NlmonError {
    /// Build a setup error for `stage`
    pub fn setup(stage: SetupStage, source: io::Error) -> Self {
        NlmonError::Setup { stage, source }
    }

    /// Underlying OS error code, when there is one
    pub fn os_error(&self) -> Option<i32> {
        match self {
            NlmonError::Setup { source, .. } => source.raw_os_error(),
            NlmonError::Transport(e) | NlmonError::Signal(e) => e.raw_os_error(),
            NlmonError::Decode(_) | NlmonError::Usage(_) | NlmonError::Config(_) => None,
        }
    }

    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        1
    }
}

/// Result type for nlmon operations
pub type Result<T> = std::result::Result<T, NlmonError>;
