//! Well-known AMS ports of TwinCAT services.

use crate::netid::AmsPort;

/// First PLC runtime of TwinCAT 2 (further runtimes use 811, 821, ...).
pub const TC2_PLC1: AmsPort = 801;
/// First PLC runtime of TwinCAT 3 (further runtimes use 852, 853, ...).
pub const TC3_PLC1: AmsPort = 851;
/// The system service, which answers device info and state queries.
pub const SYSTEM_SERVICE: AmsPort = 10000;
