//! TCP socket transport (half of component C8): the `ip:` URI scheme.

mod transport;

pub use transport::NetPort;
