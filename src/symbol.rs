//! Access to PLC variables by symbolic name.
//!
//! A name is resolved to a device-side handle, the value is read or written
//! through the handle, and the handle is released again.  Handles occupy
//! resources on the device, so every handle that was resolved must be released
//! exactly once, also when the operation in between failed.

use std::convert::TryInto;
use std::fmt;

use byteorder::{ByteOrder, LE};
use log::{debug, warn};

use crate::errors::merge_cleanup;
use crate::types::{PlcType, Value};
use crate::{index, Device, Error, Result};

/// A handle to a variable within the ADS device.
///
/// Handles are plain numbers and do not release themselves; use
/// [`Device::release`] when done.  They become invalid when the PLC program is
/// reloaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Device<'_> {
    /// Resolve a symbol name to a handle.
    pub fn resolve(&self, symbol: &str) -> Result<Handle> {
        // The name is sent with its terminator.
        let name_type = PlcType::String(symbol.len() + 1);
        let handle = self.read_write(index::GET_SYMHANDLE_BYNAME, 0, &PlcType::UInt32,
                                     &Value::from(symbol), &name_type)?;
        match handle {
            Value::UInt32(raw) => {
                debug!("resolved {} at {} to handle {:#x}", symbol, self.addr(), raw);
                Ok(Handle(raw))
            }
            other => Err(Error::type_mismatch(&PlcType::UInt32, other.kind())),
        }
    }

    /// Release a handle on the device.
    ///
    /// The device decides what releasing an unknown or already released handle
    /// means; its result code is returned unchanged.
    pub fn release(&self, handle: Handle) -> Result<()> {
        debug!("releasing handle {} at {}", handle, self.addr());
        self.write(index::RELEASE_SYMHANDLE, 0, &Value::UInt32(handle.0), &PlcType::UInt32)
    }

    /// Read the value behind a handle.
    pub fn read_handle(&self, handle: Handle, ty: &PlcType) -> Result<Value> {
        self.read(index::RW_SYMVAL_BYHANDLE, handle.0, ty)
    }

    /// Write the value behind a handle.
    pub fn write_handle(&self, handle: Handle, value: &Value, ty: &PlcType) -> Result<()> {
        self.write(index::RW_SYMVAL_BYHANDLE, handle.0, value, ty)
    }

    /// Read a variable by name.
    ///
    /// If reading fails, the handle is still released before the error is
    /// returned; a failed release is attached to it as cleanup error.
    pub fn read_by_name(&self, symbol: &str, ty: &PlcType) -> Result<Value> {
        self.with_handle(symbol, |handle| self.read_handle(handle, ty))
    }

    /// Write a variable by name, with the same cleanup as `read_by_name`.
    pub fn write_by_name(&self, symbol: &str, value: &Value, ty: &PlcType) -> Result<()> {
        self.with_handle(symbol, |handle| self.write_handle(handle, value, ty))
    }

    fn with_handle<T>(&self, symbol: &str, f: impl FnOnce(Handle) -> Result<T>) -> Result<T> {
        let handle = self.resolve(symbol)?;
        let result = f(handle);
        let released = self.release(handle);
        if let Err(e) = &released {
            warn!("could not release handle {} of {}: {}", handle, symbol, e);
        }
        merge_cleanup(result, released)
    }
}

/// Get symbol size by name.
pub fn get_size(device: Device<'_>, symbol: &str) -> Result<usize> {
    let buf = symbol_info(device, symbol)?;
    Ok(LE::read_u32(&buf[8..]) as usize)
}

/// Get symbol location (index group and index offset) by name.
pub fn get_location(device: Device<'_>, symbol: &str) -> Result<(u32, u32)> {
    let buf = symbol_info(device, symbol)?;
    Ok((LE::read_u32(&buf[0..4]), LE::read_u32(&buf[4..8])))
}

fn symbol_info(device: Device<'_>, symbol: &str) -> Result<[u8; 12]> {
    let data = device.write_read_raw(index::GET_SYMINFO_BYNAME, 0, symbol.as_bytes(), 12)?;
    data.as_slice().try_into()
        .map_err(|_| Error::Reply("get symbol info", "got less data than expected", data.len() as u32))
}
