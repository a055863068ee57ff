//! Work with PLC variables over the ADS protocol
//!
//! # Introduction
//!
//! ADS is the native protocol used by programmable logic controllers (PLCs) and
//! the TwinCAT automation system produced by [Beckhoff GmbH](https://www.beckhoff.com/).
//!
//! This crate implements the client side of the ADS semantics: typed reads
//! and writes, access to variables by symbolic name through handles, device
//! state queries, and change notifications delivered to callbacks.  Moving the
//! bytes to the device is left to an implementation of [`Transport`].
//!
//! ```rust,ignore
//! let client = Client::new(my_transport)?;
//! let plc = client.device(AmsAddr::new(AmsNetId::local(), ports::TC3_PLC1));
//! plc.write_by_name("MAIN.bVar", &Value::Bool(true), &PlcType::Bool)?;
//! assert_eq!(plc.read_by_name("MAIN.bVar", &PlcType::Bool)?, Value::Bool(true));
//! ```

pub mod client;
pub mod errors;
pub mod index;
pub mod netid;
pub mod notif;
pub mod ports;
pub mod symbol;
pub mod transport;
pub mod types;

pub use client::{AdsState, AdsVersion, Client, Device, DeviceInfo};
pub use errors::{Error, Result};
pub use netid::{AmsAddr, AmsNetId, AmsPort};
pub use notif::{Attributes, Event, Registry, Subscription, TransmissionMode};
pub use transport::{Command, Transport};
pub use types::{PlcType, Value};

#[cfg(test)]
mod test;
