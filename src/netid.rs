//! AMS addressing: the NetID identifying a device and the port of a service
//! running on it.

use std::convert::TryInto;
use std::fmt::{self, Display};
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::str::FromStr;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use itertools::Itertools;

/// Six-byte identity of an ADS device, written like `5.62.215.36.1.1`.
///
/// The first four bytes frequently equal the device's IPv4 address, but
/// nothing requires that.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct AmsNetId(pub [u8; 6]);

/// AMS ports select a service on a device, e.g. a PLC runtime.
pub type AmsPort = u16;

impl AmsNetId {
    /// Create a NetID from six bytes.
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        AmsNetId([a, b, c, d, e, f])
    }

    /// The NetID `127.0.0.1.1.1`, which routers map to the local system.
    pub const fn local() -> Self {
        AmsNetId([127, 0, 0, 1, 1, 1])
    }

    /// Create a NetID from a slice of exactly six bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        slice.try_into().ok().map(AmsNetId)
    }

    /// Create a NetID from an IPv4 address plus the two trailing bytes.
    pub fn from_ip(ip: Ipv4Addr, e: u8, f: u8) -> Self {
        let [a, b, c, d] = ip.octets();
        Self::new(a, b, c, d, e, f)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl FromStr for AmsNetId {
    type Err = &'static str;

    /// Parse `a.b.c.d.e.f`.  Trailing bytes may be left out, they default to 1
    /// so that `10.0.0.5` means `10.0.0.5.1.1`.
    fn from_str(s: &str) -> Result<AmsNetId, &'static str> {
        let mut bytes = [1; 6];
        let mut parts = s.split('.');
        for (slot, part) in bytes.iter_mut().zip(parts.by_ref()) {
            *slot = part.parse().map_err(|_| "invalid NetID string")?;
        }
        if parts.next().is_some() {
            return Err("invalid NetID string");
        }
        Ok(AmsNetId(bytes))
    }
}

impl From<[u8; 6]> for AmsNetId {
    fn from(array: [u8; 6]) -> Self {
        Self(array)
    }
}

impl Display for AmsNetId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.iter().format("."))
    }
}

/// Routing key of every request: a NetID plus the port of the target service.
///
/// Addresses do not own any connection; they are plain values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AmsAddr {
    netid: AmsNetId,
    port: AmsPort,
}

impl AmsAddr {
    pub const fn new(netid: AmsNetId, port: AmsPort) -> Self {
        Self { netid, port }
    }

    pub fn netid(&self) -> AmsNetId {
        self.netid
    }

    pub fn port(&self) -> AmsPort {
        self.port
    }

    /// Return the same NetID with a different port.
    pub fn with_port(self, port: AmsPort) -> Self {
        Self { port, ..self }
    }

    /// Write the 8-byte wire form (NetID, then port in little endian).
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.netid.0)?;
        w.write_u16::<LE>(self.port)
    }

    /// Read the 8-byte wire form.
    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let mut netid = [0; 6];
        r.read_exact(&mut netid)?;
        let port = r.read_u16::<LE>()?;
        Ok(Self::new(AmsNetId(netid), port))
    }
}

impl FromStr for AmsAddr {
    type Err = &'static str;

    /// Parse `netid:port`.
    fn from_str(s: &str) -> Result<AmsAddr, &'static str> {
        let (netid, port) = s.split(':').collect_tuple().ok_or("invalid AMS addr string")?;
        Ok(Self::new(netid.parse()?, port.parse().map_err(|_| "invalid port number")?))
    }
}

impl Display for AmsAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.netid, self.port)
    }
}
