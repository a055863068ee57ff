//! Index groups used with read, write and read-write requests.
//!
//! The symbol groups must match the device bit for bit; see the Beckhoff
//! `AdsDef.h` header.

/// PLC: Read/write PLC memory (%M fields).
pub const PLC_RW_M: u32 = 0x4020;

/// Resolve the symbol name in the write data to a u32 handle.  Offset is 0.
pub const GET_SYMHANDLE_BYNAME: u32 = 0xF003;
/// Read/write the value of a symbol; the handle goes into the index offset.
pub const RW_SYMVAL_BYHANDLE: u32 = 0xF005;
/// Release a handle, given as the write data.  Offset is 0.
pub const RELEASE_SYMHANDLE: u32 = 0xF006;
/// Return group, offset and size of the named symbol.  Offset is 0.
pub const GET_SYMINFO_BYNAME: u32 = 0xF007;
