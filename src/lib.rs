//! A client-side transport and request/response multiplexer for the
//! iiod industrial-I/O daemon protocol, suitable for building context,
//! device and channel abstractions on top of.

#![warn(
    anonymous_parameters,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_qualifications,
    variant_size_differences
)]
// The wire types (`CommandHeader`, `Opcode`, queue/slot internals) are
// plain data and control-flow state; requiring `Copy`/`Debug`/doc
// comments on every one of them would fight the grain of this crate
// more than it would help a reader.
#![allow(missing_copy_implementations, missing_debug_implementations)]

pub mod cancel;
pub mod codec;
pub mod context;
pub mod error;
pub mod net;
pub mod port;
pub mod registry;
pub mod responder;
pub mod scan;
pub mod slot;
pub mod uri;
pub mod usb;

pub use codec::{CommandHeader, Opcode};
pub use context::{Context, ContextParams, DeviceHandle};
pub use error::{IiodError, Result};
pub use port::Port;
pub use responder::Responder;
pub use uri::{parse as parse_uri, Uri};

/// Reads the default responder URI from `$IIOD_REMOTE`, mirroring how
/// environment-based discovery is conventionally wired: a single
/// well-known variable names the remote, falling back to local
/// discovery when unset.
pub fn iiod_uri_from_env() -> Option<String> {
    std::env::var("IIOD_REMOTE").ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    // A single test: `std::env::set_var` is process-global, and cargo
    // runs tests within a crate on multiple threads by default, so two
    // tests touching the same variable would race.
    #[test]
    fn iiod_uri_from_env_reads_or_ignores_empty() {
        std::env::set_var("IIOD_REMOTE", "");
        assert_eq!(iiod_uri_from_env(), None);

        std::env::set_var("IIOD_REMOTE", "ip:192.168.1.1");
        assert_eq!(iiod_uri_from_env().as_deref(), Some("ip:192.168.1.1"));

        std::env::remove_var("IIOD_REMOTE");
    }
}
