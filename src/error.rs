use std::{fmt, io, path::PathBuf};

use thiserror::Error;

use crate::{completion::CompletionError, exchange::ExchangeError};

/// Hardware resources owned by a connection context, in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// The opened device context
    Device,
    /// Protection domain
    ProtectionDomain,
    /// The single registered memory region
    MemoryRegion,
    /// Completion queue shared by send and receive
    CompletionQueue,
    /// Shared receive queue
    SharedReceiveQueue,
    /// The reliable-connection queue pair
    QueuePair,
}

impl fmt::Display for Resource {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::Device => "device",
            Self::ProtectionDomain => "protection domain",
            Self::MemoryRegion => "memory region",
            Self::CompletionQueue => "completion queue",
            Self::SharedReceiveQueue => "shared receive queue",
            Self::QueuePair => "queue pair",
        };
        f.write_str(name)
    }
}

/// Queue pair state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// RESET -> INIT
    ResetToInit,
    /// INIT -> RTR
    InitToRtr,
    /// RTR -> RTS
    RtrToRts,
}

impl fmt::Display for Transition {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::ResetToInit => "RESET->INIT",
            Self::InitToRtr => "INIT->RTR",
            Self::RtrToRts => "RTR->RTS",
        };
        f.write_str(name)
    }
}

/// A single failed step of a best-effort teardown
#[derive(Debug)]
pub struct TeardownFailure {
    /// The resource that could not be released
    pub resource: Resource,
    /// The provider error
    pub source: io::Error,
}

impl fmt::Display for TeardownFailure {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.source)
    }
}

/// Errors of connection setup and transfer
#[derive(Debug, Error)]
pub enum Error {
    /// No device carries the requested name
    #[error("RDMA device `{0}` not found")]
    DeviceNotFound(String),
    /// Device enumeration, open or query failed
    #[error("device {step} failed: {source}")]
    Device {
        /// The failing step
        step: &'static str,
        /// Provider error
        #[source]
        source: io::Error,
    },
    /// Creating a PD, MR, CQ, SRQ or QP failed
    #[error("failed to create {resource}: {source}")]
    ResourceSetup {
        /// The resource being created
        resource: Resource,
        /// Provider error
        #[source]
        source: io::Error,
    },
    /// The provider refused a queue pair state transition
    #[error("queue pair transition {transition} failed: {source}")]
    QpTransition {
        /// The failing transition
        transition: Transition,
        /// Provider error
        #[source]
        source: io::Error,
    },
    /// A transition was attempted out of order or without the data it needs
    #[error("queue pair transition {transition} rejected: {reason}")]
    TransitionRejected {
        /// The rejected transition
        transition: Transition,
        /// Why it was rejected
        reason: &'static str,
    },
    /// The out-of-band parameter exchange failed
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    /// A polled completion reported failure
    #[error(transparent)]
    Completion(#[from] CompletionError),
    /// Posting a work request failed
    #[error("failed to post {what}: {source}")]
    Post {
        /// What was being posted
        what: &'static str,
        /// Provider error
        #[source]
        source: io::Error,
    },
    /// Polling the completion queue failed
    #[error("failed to poll completion queue: {0}")]
    Poll(#[source] io::Error),
    /// Local file I/O during bulk send
    #[error("{}: {source}", .path.display())]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The peer or the local bookkeeping broke the transfer protocol
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Some resources could not be released during teardown
    #[error("teardown finished with {} failure(s): {}", .0.len(), join_failures(.0))]
    Teardown(Vec<TeardownFailure>),
}

/// Render teardown failures on one line
fn join_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
