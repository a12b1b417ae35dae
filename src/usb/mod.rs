//! USB transport (component C6 + USB half of C8): the `usb:` URI
//! scheme, endpoint arbitration, and bulk/control transfers.

pub mod arbiter;
pub mod transport;

pub use arbiter::{CoupleHandle, EndpointArbiter, EndpointCouple};
pub use transport::{discover_iio_interface, reset_pipes, DiscoveredInterface, UsbPort, MAX_BULK_TRANSFER};
