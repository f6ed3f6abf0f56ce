//! Wire types exchanged with the USB-to-I2C bridge.
//!
//! Every USB bulk transfer carries exactly one postcard-encoded
//! [`Request`] (host to bridge) or [`Response`] (bridge to host). The
//! variant order of each enum is its tag on the wire, so new variants
//! may only be appended.

#![no_std]

use serde::{Deserialize, Serialize};

/// USB vendor ID of the bridge.
pub const BRIDGE_VID: u16 = 0x045e;

/// USB product ID of the bridge.
pub const BRIDGE_PID: u16 = 0x7069;

/// Outcome of a request as seen by the bridge.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Success,
    NoAcknowledge,
    ArbitrationLoss,
    Fail,
}

/// Request representation.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request<'a> {
    #[serde(borrow)]
    I2c(I2cRequest<'a>),
    SetConfig(SetConfigRequest),
}

/// Response representation.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response<'a> {
    InvalidRequest,
    #[serde(borrow)]
    I2c(I2cResponse<'a>),
    SetConfig(SetConfigResponse),
}

/// I2c Request.
///
/// `size` is the number of bytes to read for [`I2cOpcode::Read`] and
/// [`I2cOpcode::WriteRead`], and zero for [`I2cOpcode::Write`]. `data`
/// carries the bytes to write. Every transaction ends with a stop
/// condition, releasing the bus.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct I2cRequest<'a> {
    pub opcode: I2cOpcode,
    pub address: u16,
    pub size: u16,
    #[serde(borrow)]
    pub data: Option<&'a [u8]>,
}

/// I2c Response.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct I2cResponse<'a> {
    pub status: Status,
    #[serde(borrow)]
    pub data: Option<&'a [u8]>,
}

/// I2c opcodes.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum I2cOpcode {
    Read = 0,
    Write = 1,
    /// Write followed by a repeated start and a read.
    WriteRead = 2,
}

/// Bus parameters applied before the first transaction.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetConfigRequest {
    pub i2c_frequency: u32,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetConfigResponse {
    pub status: Status,
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use postcard::{from_bytes, to_stdvec};

    #[test]
    fn register_write_layout() {
        let request = Request::I2c(I2cRequest {
            opcode: I2cOpcode::Write,
            address: 0x69,
            size: 0,
            data: Some(&[0x01, 0x3f]),
        });

        let bytes = to_stdvec(&request).unwrap();
        assert_eq!(bytes, [0x00, 0x01, 0x69, 0x00, 0x01, 0x02, 0x01, 0x3f]);
    }

    #[test]
    fn set_config_layout() {
        let request = Request::SetConfig(SetConfigRequest { i2c_frequency: 400_000 });

        let bytes = to_stdvec(&request).unwrap();
        assert_eq!(bytes, [0x01, 0x80, 0xb5, 0x18]);
    }

    #[test]
    fn decode_read_response() {
        let response: Response = from_bytes(&[0x01, 0x00, 0x01, 0x01, 42]).unwrap();

        assert_eq!(
            response,
            Response::I2c(I2cResponse {
                status: Status::Success,
                data: Some(&[42]),
            })
        );
    }

    #[test]
    fn decode_nack() {
        let response: Response = from_bytes(&[0x01, 0x01, 0x00]).unwrap();

        assert_eq!(
            response,
            Response::I2c(I2cResponse {
                status: Status::NoAcknowledge,
                data: None,
            })
        );
    }
}
