//! The request layer: typed read, write, read-write and write-control
//! requests, plus device and state queries.

use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LE};
use log::{debug, trace};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

use crate::errors::{ads_error, ErrContext};
use crate::notif::{self, Registry};
use crate::transport::{Command, DeviceInfoRaw, IndexLength, IndexLengthRW, ReadState,
                       Transport, WriteControl};
use crate::types::{decode, decode_string, encode, PlcType, Value};
use crate::{AmsAddr, Error, Result};

/// An ADS client on top of some [`Transport`].
///
/// All methods take `&self`, and the client is `Send + Sync`, so it can be
/// shared between threads that issue requests concurrently.  Wrappers such as
/// [`Device`] borrow the client.
///
/// If the transport delivers notifications, a background thread dispatches
/// them to the callbacks registered with [`Device::subscribe`].  It exits when
/// the transport closes its notification channel.
pub struct Client {
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
}

impl Client {
    /// Create a client with its own notification registry.
    pub fn new(transport: impl Transport + 'static) -> Result<Self> {
        Self::with_registry(transport, Arc::new(Registry::new()))
    }

    /// Create a client that registers its subscriptions in `registry`.
    pub fn with_registry(transport: impl Transport + 'static, registry: Arc<Registry>) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        match transport.notifications() {
            Ok(receiver) => {
                let registry = registry.clone();
                std::thread::Builder::new()
                    .name("ads notification dispatch".into())
                    .spawn(move || notif::run_dispatcher(receiver, &registry))
                    .ctx("starting notification dispatcher")?;
            }
            Err(e) => debug!("notifications disabled: {}", e),
        }
        Ok(Client { transport, registry })
    }

    /// The registry holding the callbacks of active subscriptions.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Return a wrapper that executes operations for the target device.
    pub fn device(&self, addr: AmsAddr) -> Device<'_> {
        Device { client: self, addr }
    }

    /// Set the timeout for all blocking requests of the transport.
    ///
    /// An expired timeout is reported like a device error, with code
    /// [`TIMEOUT_ELAPSED`](crate::transport::TIMEOUT_ELAPSED).
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.transport.set_timeout(timeout)
    }

    /// Return the local source address used by the transport.
    pub fn local_address(&self) -> Result<AmsAddr> {
        self.transport.local_address()
    }

    /// Return version, revision and build of the local ADS library.
    pub fn dll_version(&self) -> Result<AdsVersion> {
        self.transport.dll_version()
    }

    /// Low-level function to execute an ADS command.
    ///
    /// The input buffers are sent back to back.  Both a transport failure and
    /// a nonzero result field in the reply are turned into `Error::Device`.
    /// On success the reply payload following the result field is returned.
    pub fn communicate(&self, cmd: Command, target: AmsAddr, data_in: &[&[u8]]) -> Result<Vec<u8>> {
        let request = data_in.concat();
        u32::try_from(request.len())?;
        trace!("{} at {}: sending {} bytes", cmd.action(), target, request.len());

        let mut reply = match self.transport.request(target, cmd, &request) {
            Ok(reply) => reply,
            Err(code) => return ads_error(cmd.action(), code),
        };
        if reply.len() < 4 {
            return Err(Error::Reply(cmd.action(), "reply without result field", reply.len() as u32));
        }
        let result = LE::read_u32(&reply);
        if result != 0 {
            return ads_error(cmd.action(), result);
        }
        reply.drain(..4);
        Ok(reply)
    }
}

/// A `Client` wrapper that talks to a specific ADS device.
#[derive(Clone, Copy)]
pub struct Device<'c> {
    /// The underlying `Client`.
    pub client: &'c Client,
    addr: AmsAddr,
}

impl<'c> Device<'c> {
    /// The address all requests of this wrapper go to.
    pub fn addr(&self) -> AmsAddr {
        self.addr
    }

    pub(crate) fn communicate(&self, cmd: Command, data_in: &[&[u8]]) -> Result<Vec<u8>> {
        self.client.communicate(cmd, self.addr, data_in)
    }

    /// Read the device's name and version.
    pub fn get_info(&self) -> Result<DeviceInfo> {
        let reply = self.communicate(Command::DevInfo, &[])?;
        let (raw, _) = DeviceInfoRaw::read_from_prefix(&reply).map_err(
            |_| Error::Reply("get device info", "got less data than expected", reply.len() as u32))?;

        Ok(DeviceInfo {
            name: decode_string(&raw.name),
            version: AdsVersion { version: raw.major, revision: raw.minor, build: raw.version.get() },
        })
    }

    /// Return the ADS and device state of the device.
    pub fn get_state(&self) -> Result<(AdsState, u16)> {
        let reply = self.communicate(Command::ReadState, &[])?;
        let (state, _) = ReadState::read_from_prefix(&reply).map_err(
            |_| Error::Reply("read state", "got less data than expected", reply.len() as u32))?;
        let ads_state = AdsState::try_from(state.ads_state.get())
            .map_err(|e| Error::Reply("read state", e, state.ads_state.get().into()))?;
        Ok((ads_state, state.dev_state.get()))
    }

    /// Read up to `length` bytes at a given index group/offset.  The device may
    /// return less.
    pub fn read_raw(&self, index_group: u32, index_offset: u32, length: usize) -> Result<Vec<u8>> {
        let header = IndexLength {
            index_group: U32::new(index_group),
            index_offset: U32::new(index_offset),
            length: U32::new(length.try_into()?),
        };
        let reply = self.communicate(Command::Read, &[header.as_bytes()])?;
        with_length("read data", reply)
    }

    /// Read a value of the given type.
    pub fn read(&self, index_group: u32, index_offset: u32, ty: &PlcType) -> Result<Value> {
        let data = self.read_raw(index_group, index_offset, ty.size())?;
        decode(&data, ty)
    }

    /// Write some data to a given index group/offset.
    pub fn write_raw(&self, index_group: u32, index_offset: u32, data: &[u8]) -> Result<()> {
        let header = IndexLength {
            index_group: U32::new(index_group),
            index_offset: U32::new(index_offset),
            length: U32::new(data.len().try_into()?),
        };
        self.communicate(Command::Write, &[header.as_bytes(), data])?;
        Ok(())
    }

    /// Write a value as the given type.
    pub fn write(&self, index_group: u32, index_offset: u32, value: &Value, ty: &PlcType) -> Result<()> {
        self.write_raw(index_group, index_offset, &encode(value, ty)?)
    }

    /// Write some data and read back up to `read_length` bytes in one request.
    ///
    /// This is not the same as a write followed by a read; it is used as a
    /// kind of RPC call.
    pub fn write_read_raw(&self, index_group: u32, index_offset: u32,
                          write_data: &[u8], read_length: usize) -> Result<Vec<u8>> {
        let header = IndexLengthRW {
            index_group: U32::new(index_group),
            index_offset: U32::new(index_offset),
            read_length: U32::new(read_length.try_into()?),
            write_length: U32::new(write_data.len().try_into()?),
        };
        let reply = self.communicate(Command::ReadWrite, &[header.as_bytes(), write_data])?;
        with_length("write and read data", reply)
    }

    /// Write `value` as `write_ty` and decode the reply as `read_ty`.
    pub fn read_write(&self, index_group: u32, index_offset: u32, read_ty: &PlcType,
                      value: &Value, write_ty: &PlcType) -> Result<Value> {
        let data = self.write_read_raw(index_group, index_offset,
                                       &encode(value, write_ty)?, read_ty.size())?;
        decode(&data, read_ty)
    }

    /// (Try to) set the ADS and device state of the device.
    pub fn write_control(&self, ads_state: AdsState, dev_state: u16) -> Result<()> {
        self.write_control_raw(ads_state, dev_state, &[])
    }

    /// Set the ADS and device state, sending an additional value along.
    ///
    /// Current devices ignore the additional data.
    pub fn write_control_with(&self, ads_state: AdsState, dev_state: u16,
                              value: &Value, ty: &PlcType) -> Result<()> {
        self.write_control_raw(ads_state, dev_state, &encode(value, ty)?)
    }

    fn write_control_raw(&self, ads_state: AdsState, dev_state: u16, data: &[u8]) -> Result<()> {
        let header = WriteControl {
            ads_state: U16::new(ads_state as _),
            dev_state: U16::new(dev_state),
            data_length: U32::new(data.len().try_into()?),
        };
        self.communicate(Command::WriteControl, &[header.as_bytes(), data])?;
        Ok(())
    }
}

// Split a read reply into its length field and the data it announces.
fn with_length(action: &'static str, mut reply: Vec<u8>) -> Result<Vec<u8>> {
    if reply.len() < 4 {
        return Err(Error::Reply(action, "reply without length field", reply.len() as u32));
    }
    let length = LE::read_u32(&reply);
    if reply.len() - 4 < length as usize {
        return Err(Error::Reply(action, "got less data than announced", length));
    }
    reply.truncate(4 + length as usize);
    reply.drain(..4);
    Ok(reply)
}

/// Version triple of a device or of the ADS library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdsVersion {
    pub version: u8,
    pub revision: u8,
    pub build: u16,
}

impl fmt::Display for AdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.version, self.revision, self.build)
    }
}

/// Device info returned from an ADS server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Name of the ADS device/service.
    pub name: String,
    pub version: AdsVersion,
}

macro_rules! ads_states {
    ($($name:ident = $value:literal, $text:literal;)*) => {
        /// The ADS state of a device.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[allow(missing_docs)]
        #[repr(u16)]
        pub enum AdsState {
            $($name = $value,)*
        }

        impl TryFrom<u16> for AdsState {
            type Error = &'static str;

            fn try_from(value: u16) -> std::result::Result<Self, &'static str> {
                match value {
                    $($value => Ok(AdsState::$name),)*
                    _ => Err("invalid state constant"),
                }
            }
        }

        impl FromStr for AdsState {
            type Err = &'static str;

            fn from_str(s: &str) -> std::result::Result<Self, &'static str> {
                match &*s.to_ascii_lowercase() {
                    $($text => Ok(AdsState::$name),)*
                    _ => Err("invalid state name"),
                }
            }
        }

        impl fmt::Display for AdsState {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(match self {
                    $(AdsState::$name => $text,)*
                })
            }
        }
    };
}

ads_states! {
    Invalid = 0, "invalid";
    Idle = 1, "idle";
    Reset = 2, "reset";
    Init = 3, "init";
    Start = 4, "start";
    Run = 5, "run";
    Stop = 6, "stop";
    SaveCfg = 7, "savecfg";
    LoadCfg = 8, "loadcfg";
    PowerFail = 9, "powerfail";
    PowerGood = 10, "powergood";
    Error = 11, "error";
    Shutdown = 12, "shutdown";
    Suspend = 13, "suspend";
    Resume = 14, "resume";
    Config = 15, "config";
    Reconfig = 16, "reconfig";
    Stopping = 17, "stopping";
    Incompatible = 18, "incompatible";
    Exception = 19, "exception";
}
