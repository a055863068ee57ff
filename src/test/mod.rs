// Code used in the crate test suite.

use std::collections::HashMap;
use std::convert::{TryFrom, TryInto};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{WriteBytesExt, LE};
use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::client::AdsVersion;
use crate::notif::Notification;
use crate::transport::{AddNotif, IndexLength, IndexLengthRW, WriteControl};
use crate::{index, AdsState, AmsAddr, AmsNetId, Client, Command, Device, Result, Transport};


pub const PLC: AmsAddr = AmsAddr::new(AmsNetId::new(1, 2, 3, 4, 5, 6), 851);
pub const TEST_STAMP: u64 = 133_000_000_000_000_000;

// Symbols known to the simulated PLC: name -> (offset in %M, size).
static SYMBOLS: Lazy<HashMap<&'static str, (usize, usize)>> = Lazy::new(|| {
    [
        ("MAIN.bVar", (100, 1)),
        ("MAIN.nCount", (104, 4)),
        ("MAIN.fTemp", (112, 8)),
        ("MAIN.sName", (120, 21)),
        ("MAIN.aValues", (144, 10)),
        ("MAIN.nOther", (160, 4)),
    ].iter().cloned().collect()
});

// Configures different ways the device should misbehave.
#[derive(Default)]
pub struct DeviceOpts {
    /// Every request fails in the transport with this code.
    pub transport_error: Option<u32>,
    /// Reads and writes through handles fail with this code.
    pub symval_error: Option<u32>,
    pub release_error: Option<u32>,
    pub add_notif_error: Option<u32>,
    pub del_notif_error: Option<u32>,
    /// Answer AddNotification requests only after this long.
    pub add_notif_delay: Option<Duration>,
    /// Hand out this notification handle instead of a fresh one.
    pub fixed_notif_handle: Option<u32>,
    /// Return exactly these bytes for plain reads.
    pub read_data: Option<Vec<u8>>,
}

struct Notif {
    offset: usize,
    length: usize,
    // A sample has to be sent after the current request.
    pending: bool,
}

struct DeviceState {
    memory: Vec<u8>,
    handles: HashMap<u32, &'static str>,
    next_handle: u32,
    notifs: HashMap<u32, Notif>,
    next_notif: u32,
    state: (AdsState, u16),
    log: Vec<(Command, Vec<u8>)>,
}

/// An ADS device simulated in-process.
pub struct TestDevice {
    opts: Mutex<DeviceOpts>,
    state: Mutex<DeviceState>,
    push: bool,
    notif_send: Sender<Notification>,
    notif_recv: Receiver<Notification>,
}

impl TestDevice {
    pub fn new() -> Arc<Self> {
        Self::create(true)
    }

    /// A device whose transport cannot push notifications.
    pub fn without_notifications() -> Arc<Self> {
        Self::create(false)
    }

    fn create(push: bool) -> Arc<Self> {
        let (notif_send, notif_recv) = unbounded();
        Arc::new(TestDevice {
            opts: Mutex::default(),
            state: Mutex::new(DeviceState {
                memory: vec![0; 1024],
                handles: HashMap::new(),
                next_handle: 1001,
                notifs: HashMap::new(),
                next_notif: 132,
                state: (AdsState::Run, 0),
                log: Vec::new(),
            }),
            push,
            notif_send,
            notif_recv,
        })
    }

    pub fn configure(&self, opts: DeviceOpts) {
        *self.opts.lock().unwrap() = opts;
    }

    /// Payloads of all requests with the given command.
    pub fn requests(&self, cmd: Command) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().log.iter()
            .filter(|(c, _)| *c == cmd).map(|(_, d)| d.clone()).collect()
    }

    /// Raw handles of all release requests.
    pub fn releases(&self) -> Vec<u32> {
        self.requests(Command::Write).iter()
            .filter(|d| u32::from_le_bytes(d[..4].try_into().unwrap()) == index::RELEASE_SYMHANDLE)
            .map(|d| u32::from_le_bytes(d[12..16].try_into().unwrap()))
            .collect()
    }

    pub fn open_handles(&self) -> usize {
        self.state.lock().unwrap().handles.len()
    }

    pub fn open_notifications(&self) -> usize {
        self.state.lock().unwrap().notifs.len()
    }

    pub fn memory(&self, offset: usize, len: usize) -> Vec<u8> {
        self.state.lock().unwrap().memory[offset..][..len].to_vec()
    }

    /// Push a notification as if the device had sent it.
    pub fn push(&self, notification: Notification) {
        self.notif_send.send(notification).unwrap();
    }
}

impl Transport for TestDevice {
    fn request(&self, target: AmsAddr, command: Command, data: &[u8])
               -> std::result::Result<Vec<u8>, u32> {
        let opts = self.opts.lock().unwrap();
        if let (Command::AddNotification, Some(delay)) = (command, opts.add_notif_delay) {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock().unwrap();
        state.log.push((command, data.to_vec()));
        if let Some(code) = opts.transport_error {
            return Err(code);
        }
        let reply = match command {
            Command::DevInfo => do_devinfo(data),
            Command::ReadState => state.do_read_state(data),
            Command::WriteControl => state.do_write_control(data),
            Command::Read => state.do_read(&opts, data),
            Command::Write => state.do_write(&opts, data),
            Command::ReadWrite => state.do_read_write(data),
            Command::AddNotification => state.do_add_notif(&opts, data),
            Command::DeleteNotification => state.do_del_notif(&opts, data),
            Command::Notification => Err(0x701),
        };
        let notifications = state.pending_notifications(target);
        if self.push {
            for notification in notifications {
                self.notif_send.send(notification).unwrap();
            }
        }
        Ok(reply.unwrap_or_else(|code| code.to_le_bytes().to_vec()))
    }

    fn notifications(&self) -> Result<Receiver<Notification>> {
        if self.push {
            Ok(self.notif_recv.clone())
        } else {
            Err(crate::Error::UnsupportedPlatform("notification delivery"))
        }
    }

    fn dll_version(&self) -> Result<AdsVersion> {
        Ok(AdsVersion { version: 3, revision: 1, build: 4024 })
    }
}

type Reply = std::result::Result<Vec<u8>, u32>;

fn ok_with(data: &[u8]) -> Reply {
    let mut out = 0u32.to_le_bytes().to_vec();
    out.extend(data);
    Ok(out)
}

fn ok_with_length(data: &[u8]) -> Reply {
    let mut out = 0u32.to_le_bytes().to_vec();
    out.write_u32::<LE>(data.len() as u32).unwrap();
    out.extend(data);
    Ok(out)
}

fn do_devinfo(data: &[u8]) -> Reply {
    if !data.is_empty() {
        return Err(0x706);
    }
    // major 7, minor 1
    let mut out = vec![7, 1];
    out.write_u16::<LE>(4024).unwrap();
    out.extend(b"Nice device\0\0\0\0\0");
    ok_with(&out)
}

impl DeviceState {
    fn pending_notifications(&mut self, source: AmsAddr) -> Vec<Notification> {
        let memory = &self.memory;
        self.notifs.iter_mut()
            .filter(|(_, n)| n.pending)
            .map(|(&handle, n)| {
                n.pending = false;
                make_notification(source, &[(handle, &memory[n.offset..][..n.length])])
            })
            .collect()
    }

    fn touch(&mut self, offset: usize, length: usize) {
        for notif in self.notifs.values_mut() {
            if offset < notif.offset + notif.length && notif.offset < offset + length {
                notif.pending = true;
            }
        }
    }

    fn symbol(&self, handle: u32) -> std::result::Result<(usize, usize), u32> {
        self.handles.get(&handle).map(|name| SYMBOLS[name]).ok_or(0x710)
    }

    fn do_read_state(&self, data: &[u8]) -> Reply {
        if !data.is_empty() {
            return Err(0x706);
        }
        let mut out = vec![];
        out.write_u16::<LE>(self.state.0 as u16).unwrap();
        out.write_u16::<LE>(self.state.1).unwrap();
        ok_with(&out)
    }

    fn do_write_control(&mut self, data: &[u8]) -> Reply {
        let (header, rest) = WriteControl::read_from_prefix(data).map_err(|_| 0x706u32)?;
        if rest.len() != header.data_length.get() as usize {
            return Err(0x706);
        }
        match AdsState::try_from(header.ads_state.get()) {
            Err(_) | Ok(AdsState::Invalid) => Err(0x70B),
            Ok(state) => {
                self.state = (state, header.dev_state.get());
                ok_with(&[])
            }
        }
    }

    fn do_read(&mut self, opts: &DeviceOpts, data: &[u8]) -> Reply {
        let request = IndexLength::read_from_bytes(data).map_err(|_| 0x706u32)?;
        let mut off = request.index_offset.get() as usize;
        let len = request.length.get() as usize;
        match request.index_group.get() {
            index::RW_SYMVAL_BYHANDLE => {
                if let Some(code) = opts.symval_error {
                    return Err(code);
                }
                let (sym_off, sym_len) = self.symbol(off as u32)?;
                if len != sym_len {
                    return Err(0x705);
                }
                off = sym_off;
            }
            index::PLC_RW_M => {
                if let Some(data) = &opts.read_data {
                    return ok_with_length(data);
                }
            }
            _ => return Err(0x702),
        }
        if off + len > self.memory.len() {
            return Err(0x703);
        }
        ok_with_length(&self.memory[off..][..len])
    }

    fn do_write(&mut self, opts: &DeviceOpts, data: &[u8]) -> Reply {
        let (request, payload) = IndexLength::read_from_prefix(data).map_err(|_| 0x706u32)?;
        let mut off = request.index_offset.get() as usize;
        let len = request.length.get() as usize;
        if payload.len() != len {
            return Err(0x706);
        }
        match request.index_group.get() {
            index::RW_SYMVAL_BYHANDLE => {
                if let Some(code) = opts.symval_error {
                    return Err(code);
                }
                let (sym_off, sym_len) = self.symbol(off as u32)?;
                if len != sym_len {
                    return Err(0x705);
                }
                off = sym_off;
            }
            index::RELEASE_SYMHANDLE => {
                if let Some(code) = opts.release_error {
                    return Err(code);
                }
                if len != 4 {
                    return Err(0x705);
                }
                let handle = u32::from_le_bytes(payload.try_into().unwrap());
                return match self.handles.remove(&handle) {
                    Some(_) => ok_with(&[]),
                    None => Err(0x710),
                };
            }
            index::PLC_RW_M => (),
            _ => return Err(0x702),
        }
        if off + len > self.memory.len() {
            return Err(0x703);
        }
        self.memory[off..][..len].copy_from_slice(payload);
        self.touch(off, len);
        ok_with(&[])
    }

    fn do_read_write(&mut self, data: &[u8]) -> Reply {
        let (request, payload) = IndexLengthRW::read_from_prefix(data).map_err(|_| 0x706u32)?;
        if payload.len() != request.write_length.get() as usize {
            return Err(0x706);
        }
        match request.index_group.get() {
            index::GET_SYMHANDLE_BYNAME => {
                // Names arrive with their terminator.
                let name = payload.strip_suffix(&[0]).ok_or(0x706u32)?;
                let (&name, _) = SYMBOLS.get_key_value(std::str::from_utf8(name).map_err(|_| 0x710u32)?)
                                        .ok_or(0x710u32)?;
                let handle = self.next_handle;
                self.next_handle += 1;
                self.handles.insert(handle, name);
                ok_with_length(&handle.to_le_bytes())
            }
            index::GET_SYMINFO_BYNAME => {
                let name = std::str::from_utf8(payload).map_err(|_| 0x710u32)?;
                let (off, len) = *SYMBOLS.get(name).ok_or(0x710u32)?;
                let mut out = vec![];
                out.write_u32::<LE>(index::PLC_RW_M).unwrap();
                out.write_u32::<LE>(off as u32).unwrap();
                out.write_u32::<LE>(len as u32).unwrap();
                ok_with_length(&out)
            }
            _ => Err(0x702),
        }
    }

    fn do_add_notif(&mut self, opts: &DeviceOpts, data: &[u8]) -> Reply {
        let request = AddNotif::read_from_bytes(data).map_err(|_| 0x706u32)?;
        if let Some(code) = opts.add_notif_error {
            return Err(code);
        }
        if request.index_group.get() != index::RW_SYMVAL_BYHANDLE {
            return Err(0x702);
        }
        let (offset, length) = self.symbol(request.index_offset.get())?;
        if request.length.get() as usize != length {
            return Err(0x705);
        }
        let handle = opts.fixed_notif_handle.unwrap_or(self.next_notif);
        self.next_notif += 1;
        // Like real devices, send the current value right away.
        self.notifs.insert(handle, Notif { offset, length, pending: true });
        ok_with(&handle.to_le_bytes())
    }

    fn do_del_notif(&mut self, opts: &DeviceOpts, data: &[u8]) -> Reply {
        if data.len() != 4 {
            return Err(0x706);
        }
        if let Some(code) = opts.del_notif_error {
            return Err(code);
        }
        let handle = u32::from_le_bytes(data.try_into().unwrap());
        match self.notifs.remove(&handle) {
            Some(_) => ok_with(&[]),
            None => Err(0x714),
        }
    }
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug)]
#[repr(C)]
struct StampHdr {
    stamp: U64,
    samples: U32,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug)]
#[repr(C)]
struct SampleHdr {
    handle: U32,
    size: U32,
}

/// Build a notification with one stamp holding the given samples.
pub fn make_notification(source: AmsAddr, samples: &[(u32, &[u8])]) -> Notification {
    let mut body = StampHdr { stamp: U64::new(TEST_STAMP), samples: U32::new(samples.len() as u32) }
        .as_bytes().to_vec();
    for (handle, data) in samples {
        body.extend(SampleHdr { handle: U32::new(*handle), size: U32::new(data.len() as u32) }.as_bytes());
        body.extend(*data);
    }
    let mut payload = vec![];
    payload.write_u32::<LE>(body.len() as u32 + 4).unwrap();
    payload.write_u32::<LE>(1).unwrap();
    payload.extend(body);
    Notification::new(source, payload).unwrap()
}

pub fn run_test(opts: DeviceOpts, f: impl FnOnce(Device, &TestDevice)) {
    let sim = TestDevice::new();
    sim.configure(opts);
    let client = Client::new(sim.clone()).unwrap();
    f(client.device(PLC), &*sim);
}

/// Wait for a value sent from a notification callback.
pub fn recv<T>(chan: &Receiver<T>) -> T {
    chan.recv_timeout(Duration::from_secs(5)).expect("notification not delivered")
}
