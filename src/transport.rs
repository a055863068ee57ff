//! The seam between this crate and whatever moves ADS messages to a device.
//!
//! A transport could be the AMS router library of the host, an AMS/TCP
//! connection, or a simulated device in tests.  It only has to execute one
//! command at a time and, optionally, push incoming notifications.

use std::time::Duration;

use crossbeam_channel::Receiver;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::client::AdsVersion;
use crate::notif::Notification;
use crate::{AmsAddr, Error, Result};

/// The ADS commands, with their protocol numbers.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    DevInfo = 1,
    Read = 2,
    Write = 3,
    ReadState = 4,
    WriteControl = 5,
    AddNotification = 6,
    DeleteNotification = 7,
    /// Only ever sent by devices.
    Notification = 8,
    /// Write, then read back in the same request.
    ReadWrite = 9,
}

impl Command {
    pub(crate) fn action(self) -> &'static str {
        match self {
            Command::DevInfo => "get device info",
            Command::Read => "read data",
            Command::Write => "write data",
            Command::ReadState => "read state",
            Command::WriteControl => "write control",
            Command::AddNotification => "add notification",
            Command::DeleteNotification => "delete notification",
            Command::Notification => "notification",
            Command::ReadWrite => "write and read data",
        }
    }
}

/// Router status code for an expired request timeout.
pub const TIMEOUT_ELAPSED: u32 = 0x745;

/// Moves ADS commands to devices and back.
///
/// `request` sends the command payload (index group and offset included, in
/// the standard ADS layout) to `target` and blocks until the reply arrives.
/// The reply is the ADS response payload, starting with its 32-bit result
/// field.  `Err` carries a status code from the transport or router itself,
/// e.g. [`TIMEOUT_ELAPSED`].  Correlating replies with concurrent requests is
/// the transport's job.
///
/// The remaining methods are optional capabilities.
pub trait Transport: Send + Sync {
    fn request(&self, target: AmsAddr, command: Command, data: &[u8])
               -> std::result::Result<Vec<u8>, u32>;

    /// The channel on which the transport pushes device notifications.
    fn notifications(&self) -> Result<Receiver<Notification>> {
        Err(Error::UnsupportedPlatform("notification delivery"))
    }

    /// Set the timeout applied to every blocking request.
    fn set_timeout(&self, _timeout: Duration) -> Result<()> {
        Err(Error::UnsupportedPlatform("setting the request timeout"))
    }

    /// The source address the router assigned to this client.
    fn local_address(&self) -> Result<AmsAddr> {
        Err(Error::UnsupportedPlatform("querying the local address"))
    }

    /// Version of the local ADS library, if the transport is backed by one.
    fn dll_version(&self) -> Result<AdsVersion> {
        Err(Error::UnsupportedPlatform("querying the ADS library version"))
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn request(&self, target: AmsAddr, command: Command, data: &[u8])
               -> std::result::Result<Vec<u8>, u32> {
        (**self).request(target, command, data)
    }

    fn notifications(&self) -> Result<Receiver<Notification>> {
        (**self).notifications()
    }

    fn set_timeout(&self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn local_address(&self) -> Result<AmsAddr> {
        (**self).local_address()
    }

    fn dll_version(&self) -> Result<AdsVersion> {
        (**self).dll_version()
    }
}

// Fixed layouts of the command payloads, pub(crate) for the test suite.

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug)]
#[repr(C)]
pub(crate) struct IndexLength {
    pub index_group: U32,
    pub index_offset: U32,
    pub length: U32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug)]
#[repr(C)]
pub(crate) struct IndexLengthRW {
    pub index_group: U32,
    pub index_offset: U32,
    pub read_length: U32,
    pub write_length: U32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug)]
#[repr(C)]
pub(crate) struct DeviceInfoRaw {
    pub major: u8,
    pub minor: u8,
    pub version: U16,
    pub name: [u8; 16],
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug)]
#[repr(C)]
pub(crate) struct ReadState {
    pub ads_state: U16,
    pub dev_state: U16,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug)]
#[repr(C)]
pub(crate) struct WriteControl {
    pub ads_state: U16,
    pub dev_state: U16,
    pub data_length: U32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug)]
#[repr(C)]
pub(crate) struct AddNotif {
    pub index_group: U32,
    pub index_offset: U32,
    pub length: U32,
    pub trans_mode: U32,
    pub max_delay: U32,
    pub cycle_time: U32,
    pub reserved: [u8; 16],
}
