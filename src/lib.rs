//! File transfer over an RDMA reliable connection.
//!
//! Two processes open the same kind of RDMA device, swap queue-pair addressing over a TCP
//! side channel and drive their queue pairs to RTS. The client then streams a file as
//! SEND-with-immediate chunks while the server keeps a shared receive queue topped up.
//! Both sides are paced purely by completions: a START rendezvous before the data and a
//! STOP barrier after it.
//!
//! * [`ConnectionContext`] owns every verbs resource and tears it down in reverse order.
//!
//! * [`TransferEngine`] runs the completion loops on top of a connected context.
//!
//! * [`exchange`] and [`TcpControlChannel`] carry [`ConnectionParameters`] between peers.
//!
//! * [`Provider`] is the seam between the protocol and the verbs library; [`IbvProvider`]
//!   is the real one.
//!
//! #### Example
//! ```no_run
//! use rdma_transfer::{
//!     exchange, ConnectionContext, ContextConfigBuilder, EngineConfig, IbvProvider, Role,
//!     TransferEngine,
//! };
//!
//! fn serve() -> anyhow::Result<()> {
//!     let config = ContextConfigBuilder::default()
//!         .device_name("mlx5_0")
//!         .mr_size(1 << 20)
//!         .build()?;
//!     let mut ctx = ConnectionContext::open(IbvProvider::new(), &config)?;
//!     let role = Role::Responder {
//!         bind: "0.0.0.0:8080".parse()?,
//!     };
//!     let remote = exchange(&ctx.local_parameters(), role)?;
//!     ctx.connect(&remote)?;
//!     let stats = TransferEngine::new(&mut ctx, EngineConfig::default())?.run_responder()?;
//!     println!("received {} messages", stats.received());
//!     ctx.close()?;
//!     Ok(())
//! }
//! ```
#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences,

    warnings, // treat all wanings as errors

    clippy::all,
    clippy::restriction,
    clippy::pedantic,
    clippy::cargo,
    unreachable_pub,
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::blanket_clippy_restriction_lints, // allow clippy::restriction
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::panic_in_result_fn,
    clippy::shadow_same, // Not too much bad
    clippy::shadow_reuse, // Not too much bad
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::indexing_slicing,
    clippy::question_mark_used, // `?` is how errors travel in this crate
    clippy::std_instead_of_core, // std is always available here
    clippy::std_instead_of_alloc, // same as above
    clippy::pub_use, // the crate root re-exports its private modules
    clippy::separated_literal_suffix, // `0_i32` is the house style
    clippy::single_call_fn, // setup steps read better as named functions
    clippy::min_ident_chars, // `f` in `fmt` impls
    clippy::absolute_paths, // `rdma_sys::` calls stay explicit at the FFI boundary
    clippy::error_impl_error, // the crate error is named `Error`
    clippy::impl_trait_in_params,
    clippy::missing_trait_methods,
    clippy::arbitrary_source_item_ordering,
    clippy::pattern_type_mismatch,
    clippy::ref_patterns,
    clippy::mod_module_files,
    clippy::tests_outside_test_module, // integration tests live in tests/
    clippy::unwrap_used, // only in #[cfg(test)] code
    clippy::expect_used, // only in #[cfg(test)] code
    clippy::allow_attributes_without_reason,
    clippy::semicolon_outside_block,
    clippy::multiple_unsafe_ops_per_block, // FFI blocks read fields of one struct
)]

/// Memory and queue pair access flags
mod access;
/// Fixed-size slots of the registered buffer
mod buffer_pool;
/// Cutting a file into sends
mod chunk;
/// Work completions
mod completion;
/// Process configuration
mod config;
/// The connection resources and the queue pair state machine
mod context;
/// Device discovery
mod device;
/// Crate errors
mod error;
/// Errno logging helpers
mod error_utilities;
/// TCP exchange of connection parameters
mod exchange;
/// Gid for device
mod gid;
/// The libibverbs provider
mod ibv;
/// Subscriber construction
pub mod logging;
/// Immediate data and work request id encoding
mod message;
/// Per-peer signal tracking
mod peer_set;
/// The verbs seam
mod provider;
/// Queue pair attributes and transitions
mod queue_pair;
/// The completion-driven transfer protocol
mod transfer;
/// Work request descriptions
mod work_request;

pub use access::{mr_access, qp_access, AccessFlag};
pub use buffer_pool::{SlotPool, SlotUse};
pub use chunk::ChunkPlan;
pub use completion::{CompletionError, CompletionRecord, WCError, WcOpcode, WcStatus};
pub use config::{Config, Mode};
pub use context::{ConnectionContext, ContextConfig, ContextConfigBuilder};
pub use error::{Error, Resource, Result, TeardownFailure, Transition};
pub use exchange::{
    decode_line, encode_line, exchange, initiate, respond, ControlChannel, ExchangeError, Role,
    TcpControlChannel,
};
pub use gid::Gid;
pub use ibv::{IbvCq, IbvDevice, IbvMr, IbvPd, IbvProvider, IbvQp, IbvSrq};
pub use message::{
    ControlKind, ImmMessage, PeerId, WorkRequestId, WorkRequestTag, IB_WR_ID_START, IB_WR_ID_STOP,
    MSG_CLIENT_START, MSG_CLIENT_STOP,
};
pub use peer_set::{Admission, PeerSet};
pub use provider::{DeviceAttr, MrKeys, PortAttr, Provider};
pub use queue_pair::{
    AddressHandler, ConnectionParameters, GlobalRouteHeader, InitAttr, QpCaps, QpTransition,
    QueuePairState, RQAttr, SQAttr, MTU,
};
pub use transfer::{
    EngineConfig, EngineConfigBuilder, Event, TransferEngine, TransferStats, DEFAULT_POLL_BATCH,
    DEFAULT_SLOT_COUNT, MAX_POLL_BATCH, TOT_NUM_OPS,
};
pub use work_request::{RecvRequest, SendRequest, Sge};
