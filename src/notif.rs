//! Everything to do with ADS notifications.
//!
//! A subscription resolves a symbol, asks the device to watch it, and stores
//! the callback in a [`Registry`].  The transport pushes [`Notification`]
//! messages, which the registry takes apart and hands to the callbacks.

use std::collections::HashMap;
use std::convert::TryInto;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{ReadBytesExt, LE};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, trace, warn};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, IntoBytes};

use crate::errors::{merge_cleanup, ErrContext};
use crate::symbol;
use crate::transport::{AddNotif, Command};
use crate::types::{decode, PlcType, Value};
use crate::{index, AmsAddr, Client, Device, Error, Result};

/// Device-assigned number identifying a registered notification.
pub type Handle = u32;

/// What the device should watch, and how often it reports.
#[derive(Clone, Debug)]
pub struct Attributes {
    /// Number of bytes watched, starting at the index offset.
    pub length: usize,
    pub trans_mode: TransmissionMode,
    /// Upper bound for the time between a change and its report.
    pub max_delay: Duration,
    /// How often the device checks the value.
    pub cycle_time: Duration,
}

impl Attributes {
    pub const fn new(length: usize, trans_mode: TransmissionMode,
                     max_delay: Duration, cycle_time: Duration) -> Self {
        Attributes { length, trans_mode, max_delay, cycle_time }
    }

    /// Attributes watching a whole value of the given type.
    pub fn for_type(ty: &PlcType, trans_mode: TransmissionMode,
                    max_delay: Duration, cycle_time: Duration) -> Self {
        Self::new(ty.size(), trans_mode, max_delay, cycle_time)
    }
}

/// Transmission modes understood by the device.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmissionMode {
    /// Report every cycle, changed or not.
    ServerCycle = 3,
    /// Report only values that changed since the last cycle.
    ServerOnChange = 4,
}

/// Payload of a notification command pushed by a device.
///
/// Layout: total length and stamp count, then per stamp a FILETIME timestamp
/// and a sample count, then per sample the notification handle, the data size
/// and the data.  All numbers are little endian.
pub struct Notification {
    source: AmsAddr,
    data: Vec<u8>,
    // Where each sample's data lies in `data`.
    index: Vec<SamplePos>,
}

struct SamplePos {
    timestamp: u64,
    handle: Handle,
    start: usize,
    end: usize,
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notification")
         .field("source", &self.source)
         .field("samples", &self.samples().collect::<Vec<_>>())
         .finish()
    }
}

impl Notification {
    /// Validate and index the payload of a notification sent by `source`.
    ///
    /// Fails if the length field does not match, a sample runs past the end,
    /// or bytes are left over after the last stamp.
    pub fn new(source: AmsAddr, data: impl Into<Vec<u8>>) -> Result<Self> {
        let data = data.into();
        let total = data.len();
        let mut rest = &data[..];
        let length = rest.read_u32::<LE>().ctx("parsing notification")?;
        if length as usize != rest.len() {
            return Err(Error::Reply("parsing notification", "inconsistent length", length));
        }

        let mut index = Vec::new();
        for _ in 0..rest.read_u32::<LE>().ctx("parsing notification")? {
            let timestamp = rest.read_u64::<LE>().ctx("parsing notification")?;
            for _ in 0..rest.read_u32::<LE>().ctx("parsing notification")? {
                let handle = rest.read_u32::<LE>().ctx("parsing notification")?;
                let size = rest.read_u32::<LE>().ctx("parsing notification")? as usize;
                if size > rest.len() {
                    return Err(Error::Io("parsing notification",
                                         io::ErrorKind::UnexpectedEof.into()));
                }
                let start = total - rest.len();
                index.push(SamplePos { timestamp, handle, start, end: start + size });
                rest = &rest[size..];
            }
        }
        if !rest.is_empty() {
            return Err(Error::Reply("parsing notification", "trailing data", rest.len() as u32));
        }
        Ok(Notification { source, data, index })
    }

    pub fn source(&self) -> AmsAddr {
        self.source
    }

    /// All samples, in the order the device sent them.
    pub fn samples(&self) -> impl Iterator<Item = Sample<'_>> + '_ {
        self.index.iter().map(move |pos| Sample {
            handle: pos.handle,
            timestamp: pos.timestamp,
            data: &self.data[pos.start..pos.end],
        })
    }
}

/// One value reported for a notification handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample<'a> {
    pub handle: Handle,
    /// Time of the report, in 100ns intervals since 1601-01-01.
    pub timestamp: u64,
    pub data: &'a [u8],
}

// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

/// Convert a notification timestamp to `SystemTime`.  Returns `None` for
/// stamps before 1970.
pub fn timestamp_to_system_time(timestamp: u64) -> Option<SystemTime> {
    let since_1601 = Duration::new(timestamp / 10_000_000, (timestamp % 10_000_000) as u32 * 100);
    let since_1970 = since_1601.checked_sub(Duration::from_secs(FILETIME_EPOCH_OFFSET))?;
    UNIX_EPOCH.checked_add(since_1970)
}

/// What a subscription's callback gets for every sample.
#[derive(Debug)]
pub struct Event<'a> {
    /// The device that sent the sample.
    pub source: AmsAddr,
    pub notification_handle: Handle,
    /// The user handle given at subscription time.
    pub user_handle: u32,
    /// Timestamp of generation (100ns intervals since 01/01/1601).
    pub timestamp: u64,
    /// The sample decoded with the subscription's type.
    pub value: Value,
    /// The raw sample data.
    pub data: &'a [u8],
}

/// A notification callback.  It runs on the dispatcher thread, concurrently
/// with whatever the rest of the program does.  A panicking callback only
/// loses the sample it was called with.
pub type Callback = Arc<dyn Fn(&Event<'_>) + Send + Sync>;

struct Entry {
    user_handle: u32,
    ty: PlcType,
    callback: Callback,
}

type Key = (AmsAddr, Handle);

// A sample kept until its subscription is stored.
struct Parked {
    timestamp: u64,
    data: Vec<u8>,
}

// Upper bound for samples waiting on registrations in flight.
const MAX_PARKED: usize = 256;

#[derive(Default)]
struct Table {
    entries: HashMap<Key, Arc<Entry>>,
    parked: HashMap<Key, Vec<Parked>>,
    nparked: usize,
    // Subscriptions between the add-notification request and insertion.
    registering: usize,
}

impl Table {
    fn take_parked(&mut self, key: &Key) -> Vec<Parked> {
        let samples = self.parked.remove(key).unwrap_or_default();
        self.nparked -= samples.len();
        samples
    }
}

/// Callbacks of the active subscriptions, keyed by device address and
/// notification handle.
///
/// Entries live from a successful subscription until it is unsubscribed.  A
/// registry can be shared between several clients.
///
/// A device may report a new notification before the reply to its
/// registration arrives.  While registrations are in flight, samples for
/// unknown handles are therefore kept and delivered once their subscription
/// is stored; otherwise they are dropped right away.
pub struct Registry {
    table: Mutex<Table>,
    // Tells the dispatcher that parked samples became deliverable.
    wake_send: Sender<()>,
    wake_recv: Receiver<()>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        let (wake_send, wake_recv) = bounded(1);
        Registry {
            table: Mutex::default(),
            wake_send,
            wake_recv,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        // Callbacks never run under this lock, so poisoning leaves no broken state.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_registration(&self) {
        self.table().registering += 1;
    }

    fn end_registration(&self) {
        let mut table = self.table();
        table.registering -= 1;
        if table.registering > 0 {
            return;
        }
        let Table { entries, parked, nparked, .. } = &mut *table;
        let before = *nparked;
        parked.retain(|key, _| entries.contains_key(key));
        *nparked = parked.values().map(Vec::len).sum();
        if before > *nparked {
            self.dropped.fetch_add((before - *nparked) as u64, Ordering::Relaxed);
            debug!("dropped {} samples for notification handles nobody registered",
                   before - *nparked);
        }
    }

    fn insert(&self, addr: AmsAddr, handle: Handle, entry: Entry) -> Result<()> {
        let mut table = self.table();
        if table.entries.contains_key(&(addr, handle)) {
            return Err(Error::InvalidCallback("notification handle already has a callback"));
        }
        table.entries.insert((addr, handle), Arc::new(entry));
        if table.parked.contains_key(&(addr, handle)) {
            // Full means a wakeup is pending already.
            let _ = self.wake_send.try_send(());
        }
        Ok(())
    }

    fn remove(&self, addr: AmsAddr, handle: Handle) -> bool {
        let mut table = self.table();
        table.take_parked(&(addr, handle));
        table.entries.remove(&(addr, handle)).is_some()
    }

    /// Check if a callback is registered for the notification handle.
    pub fn contains(&self, addr: AmsAddr, handle: Handle) -> bool {
        self.table().entries.contains_key(&(addr, handle))
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of samples handed to a callback so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Number of samples dropped so far: no callback was registered for their
    /// handle, their data did not decode, or the callback panicked.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Invoke the callbacks for all samples of a notification.
    ///
    /// Callbacks are called without any lock held, so they may subscribe and
    /// unsubscribe themselves.  A callback that is already running when its
    /// subscription is removed still runs to completion.
    pub fn dispatch(&self, notification: &Notification) {
        let source = notification.source();
        for sample in notification.samples() {
            let key = (source, sample.handle);
            let (entry, earlier) = {
                let mut table = self.table();
                match table.entries.get(&key).cloned() {
                    Some(entry) => (entry, table.take_parked(&key)),
                    None if table.registering > 0 && table.nparked < MAX_PARKED => {
                        trace!("parking sample for notification handle {} from {}",
                               sample.handle, source);
                        table.parked.entry(key).or_default()
                             .push(Parked { timestamp: sample.timestamp, data: sample.data.to_vec() });
                        table.nparked += 1;
                        continue;
                    }
                    None => {
                        drop(table);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("dropping sample for unknown notification handle {} from {}",
                               sample.handle, source);
                        continue;
                    }
                }
            };
            for parked in &earlier {
                self.deliver(&entry, key, parked.timestamp, &parked.data);
            }
            self.deliver(&entry, key, sample.timestamp, sample.data);
        }
    }

    /// Deliver parked samples whose subscription has been stored since.
    pub(crate) fn flush_parked(&self) {
        let mut ready = Vec::new();
        {
            let mut table = self.table();
            let keys: Vec<Key> = table.parked.keys()
                                      .filter(|key| table.entries.contains_key(*key))
                                      .copied().collect();
            for key in keys {
                if let Some(entry) = table.entries.get(&key).cloned() {
                    ready.push((key, entry, table.take_parked(&key)));
                }
            }
        }
        for (key, entry, samples) in ready {
            for parked in samples {
                self.deliver(&entry, key, parked.timestamp, &parked.data);
            }
        }
    }

    fn deliver(&self, entry: &Entry, (source, handle): Key, timestamp: u64, data: &[u8]) {
        let value = match decode(data, &entry.ty) {
            Ok(value) => value,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("dropping sample for notification handle {} from {}: {}", handle, source, e);
                return;
            }
        };
        trace!("notification {} from {}: {:?}", handle, source, value);
        let event = Event {
            source,
            notification_handle: handle,
            user_handle: entry.user_handle,
            timestamp,
            value,
            data,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| (entry.callback)(&event))) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("callback for notification handle {} from {} panicked", handle, source);
            }
        }
    }
}

/// Dispatch notifications from the channel until it is disconnected.
pub(crate) fn run_dispatcher(receiver: Receiver<Notification>, registry: &Registry) {
    let wake = registry.wake_recv.clone();
    loop {
        select! {
            recv(receiver) -> notification => match notification {
                Ok(notification) => registry.dispatch(&notification),
                Err(_) => break,
            },
            recv(wake) -> _ => registry.flush_parked(),
        }
    }
    debug!("notification channel closed, dispatcher exiting");
}

/// An active subscription to value changes of a symbol.
///
/// It keeps the symbol handle and the notification alive on the device until
/// passed to [`Client::unsubscribe`]; dropping it leaks both.
#[must_use = "the subscription stays active on the device until unsubscribed"]
#[derive(Debug, PartialEq, Eq)]
pub struct Subscription {
    addr: AmsAddr,
    notification_handle: Handle,
    user_handle: u32,
    handle: symbol::Handle,
}

impl Subscription {
    pub fn addr(&self) -> AmsAddr {
        self.addr
    }

    pub fn notification_handle(&self) -> Handle {
        self.notification_handle
    }

    pub fn user_handle(&self) -> u32 {
        self.user_handle
    }

    /// The symbol handle the notification watches.
    pub fn handle(&self) -> symbol::Handle {
        self.handle
    }
}

impl Device<'_> {
    /// Ask the device to report changes of an index group/offset.
    ///
    /// Only the device side is set up; without a callback registered via
    /// [`Device::subscribe`] the samples are dropped.
    pub fn add_notification(&self, index_group: u32, index_offset: u32,
                            attributes: &Attributes) -> Result<Handle> {
        let request = AddNotif {
            index_group: U32::new(index_group),
            index_offset: U32::new(index_offset),
            length: U32::new(attributes.length.try_into()?),
            trans_mode: U32::new(attributes.trans_mode as u32),
            max_delay: U32::new(attributes.max_delay.as_millis().try_into()?),
            cycle_time: U32::new(attributes.cycle_time.as_millis().try_into()?),
            reserved: [0; 16],
        };
        let reply = self.communicate(Command::AddNotification, &[request.as_bytes()])?;
        let (handle, _) = U32::read_from_prefix(&reply).map_err(
            |_| Error::Reply("add notification", "got less data than expected", reply.len() as u32))?;
        Ok(handle.get())
    }

    /// Stop the reports of a notification.
    pub fn delete_notification(&self, handle: Handle) -> Result<()> {
        self.communicate(Command::DeleteNotification, &[U32::new(handle).as_bytes()])?;
        Ok(())
    }

    /// Subscribe `callback` to changes of the named symbol.
    ///
    /// Samples are decoded as `ty`.  The callback receives `user_handle`, which
    /// defaults to the raw symbol handle.  If the device refuses the
    /// notification, the symbol handle is released before the error is
    /// returned.
    pub fn subscribe<F>(&self, symbol: &str, ty: &PlcType, attributes: &Attributes,
                        user_handle: Option<u32>, callback: F) -> Result<Subscription>
    where F: Fn(&Event<'_>) + Send + Sync + 'static
    {
        let handle = self.resolve(symbol)?;
        let user_handle = user_handle.unwrap_or_else(|| handle.raw());
        let entry = Entry { user_handle, ty: ty.clone(), callback: Arc::new(callback) };

        match self.register(handle, attributes, entry) {
            Ok(notification_handle) => {
                debug!("subscribed to {} at {} with notification handle {}",
                       symbol, self.addr(), notification_handle);
                Ok(Subscription { addr: self.addr(), notification_handle, user_handle, handle })
            }
            Err(e) => {
                let released = self.release(handle);
                if let Err(re) = &released {
                    warn!("could not release handle {} of {}: {}", handle, symbol, re);
                }
                Err(e.with_cleanup(released))
            }
        }
    }

    fn register(&self, handle: symbol::Handle, attributes: &Attributes, entry: Entry) -> Result<Handle> {
        let registry = self.client.registry();
        registry.begin_registration();
        let result = self.add_notification(index::RW_SYMVAL_BYHANDLE, handle.raw(), attributes)
            .and_then(|notification_handle| {
                match registry.insert(self.addr(), notification_handle, entry) {
                    Ok(()) => Ok(notification_handle),
                    Err(e) => Err(e.with_cleanup(self.delete_notification(notification_handle))),
                }
            });
        registry.end_registration();
        result
    }
}

impl Client {
    /// End a subscription.
    ///
    /// The notification is deleted on the device and the callback is removed
    /// from the registry, also if the device reports an error; then the symbol
    /// handle is released.  The first error is returned, with a release
    /// failure attached to it.
    pub fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        let device = self.device(subscription.addr);
        let deleted = device.delete_notification(subscription.notification_handle);
        self.registry().remove(subscription.addr, subscription.notification_handle);
        if let Err(e) = &deleted {
            warn!("deleting notification {} at {} failed: {}",
                  subscription.notification_handle, subscription.addr, e);
        }
        let released = device.release(subscription.handle);
        if let Err(e) = &released {
            warn!("could not release handle {} at {}: {}", subscription.handle, subscription.addr, e);
        }
        merge_cleanup(deleted, released)
    }
}
