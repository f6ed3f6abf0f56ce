//! [`Transport`] over the USB-to-I2C bridge.
//!
//! Requests go out on bulk OUT endpoint 0x01 and responses come back on
//! bulk IN endpoint 0x81, one postcard message per transfer. Submitting a
//! transaction only sends the request; the response is collected by
//! [`Transport::wait_complete`].
//!
//! A response that misses its deadline may still arrive later. After a
//! timeout the bridge drains the IN endpoint before the next request so
//! that every response read belongs to the request just sent.

use crate::transport::{BusConfig, Transport};
use crate::{BusError, Result};
use embedded_hal::i2c::SevenBitAddress;
use grideye_bridge_protocol::{
    BRIDGE_PID, BRIDGE_VID, I2cOpcode, I2cRequest, Request, Response, SetConfigRequest, Status,
};
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, In, Out};
use nusb::{DeviceInfo, MaybeFuture, list_devices};
use postcard::{from_bytes, to_stdvec};
use std::io::{self, Read, Write};
use std::time::Duration;

const USB_BUFFER_SIZE: usize = 4096;

// Stand-in for "no timeout"; nusb always arms a timer.
const FOREVER: Duration = Duration::from_secs(60 * 60 * 24 * 365);

// How long an empty IN endpoint must stay quiet to count as drained.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

/// Message pipe to the bridge.
pub trait Link {
    /// Send one whole message.
    fn send(&mut self, message: &[u8]) -> io::Result<()>;

    /// Receive one message into `buf`, failing with
    /// `io::ErrorKind::TimedOut` if none arrives within `timeout`.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

impl<L: Link + ?Sized> Link for &mut L {
    fn send(&mut self, message: &[u8]) -> io::Result<()> {
        L::send(self, message)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        L::receive(self, buf, timeout)
    }
}

/// [`Link`] over the bridge's bulk endpoints.
pub struct UsbLink {
    writer: EndpointWrite<Bulk>,
    reader: EndpointRead<Bulk>,
}

impl Link for UsbLink {
    fn send(&mut self, message: &[u8]) -> io::Result<()> {
        self.writer.write_all(message)?;
        self.writer.flush()
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.reader.set_read_timeout(timeout);
        self.reader.read(buf)
    }
}

pub struct Bridge<L = UsbLink> {
    link: L,
    pending: Option<usize>,
    stale: bool,
}

impl Bridge<UsbLink> {
    /// Open the first bridge found.
    pub fn open() -> Result<Self> {
        Self::open_matching(|_| true)
    }

    /// Open the bridge with the given serial number.
    pub fn open_with_serial_number(serial_number: &str) -> Result<Self> {
        Self::open_matching(|dev| dev.serial_number() == Some(serial_number))
    }

    fn open_matching<F: FnMut(&DeviceInfo) -> bool>(mut func: F) -> Result<Self> {
        let device = list_devices()
            .wait()
            .map_err(BusError::Usb)?
            .find(|dev| dev.vendor_id() == BRIDGE_VID && dev.product_id() == BRIDGE_PID && func(dev))
            .ok_or(BusError::DeviceNotFound)?;

        tracing::info!("opening bridge {:?}", device.serial_number());

        let device = device.open().wait().map_err(BusError::Usb)?;
        let intf = device.claim_interface(0).wait().map_err(BusError::Usb)?;
        let writer = intf
            .endpoint::<Bulk, Out>(0x01)
            .map_err(|_| BusError::Init)?
            .writer(USB_BUFFER_SIZE);
        let reader = intf
            .endpoint::<Bulk, In>(0x81)
            .map_err(|_| BusError::Init)?
            .reader(USB_BUFFER_SIZE);

        Ok(Self::new(UsbLink { writer, reader }))
    }
}

impl<L: Link> Bridge<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            pending: None,
            stale: false,
        }
    }

    fn send(&mut self, request: &Request<'_>) -> Result<()> {
        let output: Vec<u8> = to_stdvec(request).map_err(|_| BusError::Protocol)?;

        if self.stale {
            self.drain()?;
        }
        self.link.send(&output)?;

        Ok(())
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut rx_buf = vec![0; USB_BUFFER_SIZE];
        let size = self
            .link
            .receive(&mut rx_buf, timeout.unwrap_or(FOREVER))
            .map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut => {
                    self.stale = true;
                    BusError::Timeout
                }
                _ => BusError::Io(e),
            })?;
        rx_buf.truncate(size);

        Ok(rx_buf)
    }

    /// Discard responses to requests that already timed out.
    fn drain(&mut self) -> Result<()> {
        let mut rx_buf = vec![0; USB_BUFFER_SIZE];

        loop {
            match self.link.receive(&mut rx_buf, DRAIN_TIMEOUT) {
                Ok(size) => tracing::debug!("discarding {size} byte late response"),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(BusError::Io(e)),
            }
        }

        self.stale = false;
        Ok(())
    }

    fn submit(&mut self, opcode: I2cOpcode, address: SevenBitAddress, bytes: &[u8], read_len: usize) -> Result<()> {
        if self.pending.is_some() {
            return Err(BusError::Busy);
        }

        let request = Request::I2c(I2cRequest {
            opcode,
            address: u16::from(address),
            size: u16::try_from(read_len).map_err(|_| BusError::Protocol)?,
            data: Some(bytes),
        });

        self.send(&request)?;
        self.pending = Some(read_len);

        Ok(())
    }
}

impl<L: Link> Transport for Bridge<L> {
    fn init(&mut self, config: &BusConfig) -> Result<()> {
        let request = Request::SetConfig(SetConfigRequest {
            i2c_frequency: config.frequency,
        });

        self.pending = None;
        self.send(&request)?;
        let rx_buf = self.receive(config.timeout)?;

        decode_set_config(&rx_buf)
    }

    fn write(&mut self, address: SevenBitAddress, bytes: &[u8]) -> Result<()> {
        self.submit(I2cOpcode::Write, address, bytes, 0)
    }

    fn write_read(&mut self, address: SevenBitAddress, bytes: &[u8], read_len: usize) -> Result<()> {
        self.submit(I2cOpcode::WriteRead, address, bytes, read_len)
    }

    fn wait_complete(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let read_len = self.pending.take().ok_or(BusError::Idle)?;
        let rx_buf = self.receive(timeout)?;

        decode_i2c(&rx_buf, read_len)
    }
}

fn status_to_result(status: Status) -> Result<()> {
    match status {
        Status::Success => Ok(()),
        Status::NoAcknowledge => Err(BusError::NoAcknowledge),
        Status::ArbitrationLoss => Err(BusError::ArbitrationLoss),
        Status::Fail => Err(BusError::Other),
    }
}

fn decode_set_config(rx_buf: &[u8]) -> Result<()> {
    let response: Response = from_bytes(rx_buf).map_err(|_| BusError::Protocol)?;

    match response {
        Response::SetConfig(set_config) => status_to_result(set_config.status).map_err(|e| {
            tracing::error!("bridge rejected configuration: {e}");
            BusError::Init
        }),
        _ => {
            tracing::error!("Invalid response");
            Err(BusError::Protocol)
        }
    }
}

fn decode_i2c(rx_buf: &[u8], read_len: usize) -> Result<Vec<u8>> {
    let response: Response = from_bytes(rx_buf).map_err(|_| BusError::Protocol)?;

    match response {
        Response::I2c(i2c_response) => {
            status_to_result(i2c_response.status)?;

            let data = i2c_response.data.unwrap_or_default();
            if data.len() != read_len {
                tracing::error!("expected {read_len} bytes, bridge sent {}", data.len());
                return Err(BusError::Protocol);
            }

            Ok(data.to_vec())
        }
        _ => {
            tracing::error!("Invalid response");
            Err(BusError::Protocol)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Application, Config, GridEye, Shutdown, Sleep, Strictness};
    use grideye_bridge_protocol::{I2cResponse, SetConfigResponse};
    use std::collections::VecDeque;

    fn encode(response: &Response<'_>) -> Vec<u8> {
        to_stdvec(response).unwrap()
    }

    fn pixel(value: u8) -> Vec<u8> {
        let data = [value];
        encode(&Response::I2c(I2cResponse {
            status: Status::Success,
            data: Some(&data),
        }))
    }

    fn written() -> Vec<u8> {
        encode(&Response::I2c(I2cResponse {
            status: Status::Success,
            data: None,
        }))
    }

    fn configured() -> Vec<u8> {
        encode(&Response::SetConfig(SetConfigResponse { status: Status::Success }))
    }

    enum Reply {
        /// Queued as soon as the request is sent.
        Now(Vec<u8>),
        /// Queued only after the first read times out.
        Late(Vec<u8>),
    }

    #[derive(Default)]
    struct FakeLink {
        replies: VecDeque<Reply>,
        inbox: VecDeque<Vec<u8>>,
        late: Option<Vec<u8>>,
        sent: usize,
    }

    impl FakeLink {
        fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
            Self {
                replies: replies.into_iter().collect(),
                ..Default::default()
            }
        }
    }

    impl Link for FakeLink {
        fn send(&mut self, _message: &[u8]) -> io::Result<()> {
            self.sent += 1;
            match self.replies.pop_front() {
                Some(Reply::Now(frame)) => self.inbox.push_back(frame),
                Some(Reply::Late(frame)) => self.late = Some(frame),
                None => {}
            }
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            match self.inbox.pop_front() {
                Some(frame) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(frame.len())
                }
                None => {
                    if let Some(frame) = self.late.take() {
                        self.inbox.push_back(frame);
                    }
                    Err(io::ErrorKind::TimedOut.into())
                }
            }
        }
    }

    #[test]
    fn late_response_is_discarded_after_timeout() {
        let mut link = FakeLink::new([Reply::Late(pixel(1)), Reply::Now(pixel(2))]);
        let mut sensor = GridEye::new(Bridge::new(&mut link));

        assert!(matches!(sensor.read(0x80), Err(BusError::Timeout)));
        assert_eq!(sensor.read(0x80).unwrap(), 2);

        drop(sensor);
        assert_eq!(link.sent, 2);
        assert!(link.inbox.is_empty());
    }

    #[test]
    fn lenient_poll_after_timeout_prints_fresh_value() {
        let mut link = FakeLink::new([
            Reply::Now(configured()),
            Reply::Now(written()),
            Reply::Now(written()),
            Reply::Late(pixel(1)),
            Reply::Now(pixel(2)),
        ]);
        let config = Config::default()
            .with_strictness(Strictness::Lenient)
            .with_poll_interval(Duration::ZERO)
            .with_max_polls(Some(2));
        let mut output = Vec::new();

        let mut app = Application::new(Bridge::new(&mut link), &mut output, Sleep, config);
        app.run(&Shutdown::new()).unwrap();
        drop(app);

        assert_eq!(std::str::from_utf8(&output).unwrap(), "Pixel 0 Data: 2\n");
    }

    #[test]
    fn no_drain_without_timeout() {
        let mut link = FakeLink::new([Reply::Now(pixel(3)), Reply::Now(pixel(4))]);
        let mut sensor = GridEye::new(Bridge::new(&mut link));

        assert_eq!(sensor.read(0x80).unwrap(), 3);
        assert_eq!(sensor.read(0x80).unwrap(), 4);
    }

    #[test]
    fn read_response_yields_data() {
        let rx_buf = encode(&Response::I2c(I2cResponse {
            status: Status::Success,
            data: Some(&[42]),
        }));

        assert_eq!(decode_i2c(&rx_buf, 1).unwrap(), [42]);
    }

    #[test]
    fn write_response_has_no_data() {
        let rx_buf = encode(&Response::I2c(I2cResponse {
            status: Status::Success,
            data: None,
        }));

        assert!(decode_i2c(&rx_buf, 0).unwrap().is_empty());
    }

    #[test]
    fn short_read_is_protocol_error() {
        let rx_buf = encode(&Response::I2c(I2cResponse {
            status: Status::Success,
            data: None,
        }));

        assert!(matches!(decode_i2c(&rx_buf, 1), Err(BusError::Protocol)));
    }

    #[test]
    fn nack_status_maps_to_bus_error() {
        let rx_buf = encode(&Response::I2c(I2cResponse {
            status: Status::NoAcknowledge,
            data: None,
        }));

        assert!(matches!(decode_i2c(&rx_buf, 1), Err(BusError::NoAcknowledge)));
    }

    #[test]
    fn wrong_response_kind_is_rejected() {
        let rx_buf = encode(&Response::InvalidRequest);

        assert!(matches!(decode_i2c(&rx_buf, 1), Err(BusError::Protocol)));
        assert!(matches!(decode_set_config(&rx_buf), Err(BusError::Protocol)));
    }

    #[test]
    fn rejected_config_is_init_failure() {
        let ok = encode(&Response::SetConfig(SetConfigResponse { status: Status::Success }));
        let fail = encode(&Response::SetConfig(SetConfigResponse { status: Status::Fail }));

        assert!(decode_set_config(&ok).is_ok());
        assert!(matches!(decode_set_config(&fail), Err(BusError::Init)));
    }

    #[test]
    fn garbage_is_protocol_error() {
        assert!(matches!(decode_i2c(&[0xff, 0xff, 0xff], 1), Err(BusError::Protocol)));
    }
}
