//! USB bulk-endpoint transport (component C8, USB half), built on
//! `rusb`'s synchronous transfer API.
//!
//! Bulk transfers are capped at 1 MiB per submission (kernel URB
//! allocation constraint) and segmented transparently by [`UsbPort`]'s
//! `read`/`write`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rusb::{Direction, Recipient, RequestType, UsbContext};

use crate::error::{IiodError, Result};
use crate::port::Port;
use crate::usb::arbiter::CoupleHandle;

/// Maximum size of a single bulk submission; larger reads/writes are
/// segmented into multiple sub-transfers by [`UsbPort`].
pub const MAX_BULK_TRANSFER: usize = 1024 * 1024;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

#[repr(u8)]
enum VendorRequest {
    ResetPipes = 0,
    OpenPipe = 1,
    ClosePipe = 2,
}

/// One USB bulk-couple transport, cancellable by setting a latch that
/// is checked before every submission (and between the chunks of a
/// segmented transfer), per the per-endpoint cancellation contract in
/// spec 4.7: libusb's synchronous transfer API gives no transfer handle
/// to abort mid-flight, so cancellation here takes effect at the next
/// chunk boundary rather than preempting an in-flight URB.
pub struct UsbPort<T: UsbContext> {
    handle: std::sync::Arc<rusb::DeviceHandle<T>>,
    couple: Mutex<Option<CoupleHandle>>,
    data_timeout: Duration,
    cancelled: AtomicBool,
}

impl<T: UsbContext> UsbPort<T> {
    /// Claims `couple` by sending `OPEN_PIPE(pipe_id)`, then returns a
    /// transport bound to its bulk endpoints.
    pub fn open(
        handle: std::sync::Arc<rusb::DeviceHandle<T>>,
        interface_number: u8,
        couple: CoupleHandle,
        data_timeout: Duration,
    ) -> Result<Self> {
        let pipe_id = couple.couple().pipe_id;
        send_vendor_request(
            &handle,
            interface_number,
            VendorRequest::OpenPipe,
            pipe_id as u16,
        )?;
        Ok(UsbPort {
            handle,
            couple: Mutex::new(Some(couple)),
            data_timeout,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Sends `CLOSE_PIPE` and releases the couple back to the arbiter.
    /// Idempotent: calling `close` more than once, or dropping the port
    /// without calling it, leaves the couple released exactly once.
    pub fn close(&self, interface_number: u8) -> Result<()> {
        let mut guard = self.couple.lock().unwrap();
        if let Some(mut couple) = guard.take() {
            send_vendor_request(
                &self.handle,
                interface_number,
                VendorRequest::ClosePipe,
                couple.couple().pipe_id as u16,
            )?;
            couple.release();
        }
        Ok(())
    }

    /// Marks this endpoint permanently cancelled. Per spec 4.7 this is
    /// a one-way latch; the only way back is to close and reopen the
    /// device.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_not_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(IiodError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn addrs(&self) -> Result<(u8, u8)> {
        let guard = self.couple.lock().unwrap();
        match guard.as_ref() {
            Some(couple) => {
                let c = couple.couple();
                Ok((c.in_addr, c.out_addr))
            }
            None => Err(IiodError::NoDevice),
        }
    }
}

impl<T: UsbContext> Port for UsbPort<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_not_cancelled()?;
        let (in_addr, _) = self.addrs()?;
        let want = buf.len().min(MAX_BULK_TRANSFER);
        match self.handle.read_bulk(in_addr, &mut buf[..want], self.data_timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Err(IiodError::Timeout),
            Err(rusb::Error::Pipe) => Err(IiodError::BrokenPipe),
            Err(rusb::Error::NoDevice) => Err(IiodError::NoDevice),
            Err(e) => Err(IiodError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_not_cancelled()?;
        let (_, out_addr) = self.addrs()?;
        let mut total = 0;
        for chunk in buf.chunks(MAX_BULK_TRANSFER) {
            self.check_not_cancelled()?;
            let n = match self.handle.write_bulk(out_addr, chunk, self.data_timeout) {
                Ok(n) => n,
                Err(rusb::Error::Timeout) => return Err(IiodError::Timeout),
                Err(rusb::Error::Pipe) => return Err(IiodError::BrokenPipe),
                Err(rusb::Error::NoDevice) => return Err(IiodError::NoDevice),
                Err(e) => return Err(IiodError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
            };
            total += n;
            if n < chunk.len() {
                break;
            }
        }
        Ok(total)
    }

    fn try_clone(&self) -> Result<Box<dyn Port>> {
        // A USB couple is exclusively owned for its open/close window
        // (spec 5's shared-resource policy); there is no independent
        // reader/writer duplication the way a socket fd has one. The
        // couple's bulk-in and bulk-out endpoints are already addressed
        // independently, so the single handle already safely serves
        // both the reader and writer threads concurrently.
        Err(IiodError::Unsupported)
    }
}

fn send_vendor_request<T: UsbContext>(
    handle: &rusb::DeviceHandle<T>,
    interface_number: u8,
    request: VendorRequest,
    value: u16,
) -> Result<()> {
    let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Interface);
    handle
        .write_control(
            request_type,
            request as u8,
            value,
            interface_number as u16,
            &[],
            CONTROL_TIMEOUT,
        )
        .map_err(|e| match e {
            rusb::Error::Timeout => IiodError::Timeout,
            rusb::Error::NoDevice => IiodError::NoDevice,
            other => IiodError::Io(std::io::Error::new(std::io::ErrorKind::Other, other)),
        })?;
    Ok(())
}

/// Issues `RESET_PIPES`, closing every open pipe. Called at context
/// teardown.
pub fn reset_pipes<T: UsbContext>(handle: &rusb::DeviceHandle<T>, interface_number: u8) -> Result<()> {
    send_vendor_request(handle, interface_number, VendorRequest::ResetPipes, 0)
}

/// A discovered bulk couple plus the interface it lives on, produced by
/// [`discover_iio_interface`].
pub struct DiscoveredInterface {
    pub interface_number: u8,
    pub couples: Vec<crate::usb::arbiter::EndpointCouple>,
}

/// Scans `device`'s active configuration for an interface whose string
/// descriptor equals `"IIO"`, per spec 6's USB interface discovery
/// rule. The interface must expose an even number of bulk endpoints,
/// at least two, alternating IN/OUT; adjacent `(in, out)` pairs become
/// couples, couple 0 first.
pub fn discover_iio_interface<T: UsbContext>(
    device: &rusb::Device<T>,
    handle: &rusb::DeviceHandle<T>,
) -> Result<DiscoveredInterface> {
    let config = device
        .active_config_descriptor()
        .map_err(|e| IiodError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            let is_iio = match descriptor.description_string_index() {
                Some(idx) => handle
                    .read_string_descriptor_ascii(idx)
                    .map(|s| s == "IIO")
                    .unwrap_or(false),
                None => false,
            };
            if !is_iio {
                continue;
            }

            let mut in_addrs = Vec::new();
            let mut out_addrs = Vec::new();
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != rusb::TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    rusb::Direction::In => in_addrs.push(endpoint.address()),
                    rusb::Direction::Out => out_addrs.push(endpoint.address()),
                }
            }

            if in_addrs.is_empty() || in_addrs.len() != out_addrs.len() {
                return Err(IiodError::ProtocolViolation(
                    "IIO interface does not expose matching bulk IN/OUT endpoint pairs".into(),
                ));
            }

            let couples = in_addrs
                .into_iter()
                .zip(out_addrs)
                .enumerate()
                .map(|(pipe_id, (in_addr, out_addr))| crate::usb::arbiter::EndpointCouple {
                    in_addr,
                    out_addr,
                    pipe_id: pipe_id as u8,
                })
                .collect();

            return Ok(DiscoveredInterface {
                interface_number: interface.number(),
                couples,
            });
        }
    }

    Err(IiodError::NotFound)
}
