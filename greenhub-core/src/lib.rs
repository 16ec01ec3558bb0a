#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    missing_debug_implementations,
    missing_docs,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
)]
#![warn(
    // elided_lifetimes_in_paths, // allow anonymous lifetime
    missing_copy_implementations,
    single_use_lifetimes,
    // trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    // unsafe_code,
    unused_qualifications,
    unused_results,

    clippy::all,
    // clippy::restriction,
    clippy::pedantic,
    // clippy::nursery, // It's still under development
    clippy::cargo,
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::blanket_clippy_restriction_lints, // allow clippy::restriction
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::panic_in_result_fn,
    clippy::shadow_same, // Not too much bad
    clippy::shadow_reuse, // Not too much bad
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::separated_literal_suffix, // conflicts with clippy::unseparated_literal_suffix
    clippy::missing_errors_doc,
)]

//! A single threaded hub that multiplexes stackful fibers over one readiness backend.
//!
//! Fibers suspend on fd readiness, deadlines, joins or parks, and the hub resumes them
//! from its loop. The backend is one of `select`, `poll`, `epoll`, `kqueue` or a host
//! event loop driven through [`net::external::ExternalLoop`]. Other threads reach a hub
//! only through its [`RemoteHandle`].

cfg_if::cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("greenhub-core only supports unix targets");
    }
}

#[allow(missing_docs)]
pub mod log;

/// Common traits and impl.
pub mod common;

/// Errors.
pub mod error;

/// Hub configuration.
pub mod config;

/// Readiness backends.
pub mod net;

/// Fiber abstraction and impl.
pub mod fiber;

/// The hub and its primitives.
pub mod hub;

/// Cross thread wake ups.
pub mod wake;

pub use config::Config;
pub use error::{HubError, Result};
pub use fiber::constants::{FiberState, WakeCause};
pub use fiber::{FiberHandle, FiberId};
pub use hub::listener::{FailurePolicy, FailureSink, Listener, LogSink};
pub use hub::{Hub, HubHandle};
#[cfg(feature = "host-loop")]
pub use net::host::PollingHostLoop;
pub use net::external::ExternalLoop;
pub use net::{BackendKind, Direction};
pub use wake::RemoteHandle;
