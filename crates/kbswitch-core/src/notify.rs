// Kbswitch Cross-Instance Notifier
// Settings-changed signalling between processes sharing one store

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::statefile::default_state_dir;

/// Result type for notifier operations
pub type NotifyResult<T> = Result<T, NotifyError>;

/// Errors from the cross-instance channel
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no state directory available")]
    NoStateDir,
}

/// System-wide "settings changed" channel.
///
/// Delivery is best-effort and carries no payload: a signal only means
/// "reload the store". `pause`/`resume` bracket self-caused writes so an
/// instance never reloads in response to its own save — while paused,
/// signals are not queued for this subscriber at all.
pub trait SettingsBus: Send {
    /// Broadcast a settings-changed signal to every subscriber.
    fn publish(&mut self);

    /// Stop queueing signals for this subscriber.
    fn pause(&mut self);

    /// Resume queueing signals for this subscriber.
    fn resume(&mut self);

    /// Consume pending signals; `true` when at least one arrived.
    fn drain(&mut self) -> bool;

    /// File descriptor to poll for pending signals, when the backend has one.
    fn poll_fd(&self) -> Option<RawFd>;
}

/// RAII bracket around a self-caused store write.
///
/// Pauses the bus on construction and resumes it on drop, so every exit
/// path — including an early return on a failed save — restores the
/// subscription.
pub struct SuppressGuard<'a> {
    bus: &'a mut dyn SettingsBus,
}

impl<'a> SuppressGuard<'a> {
    pub fn new(bus: &'a mut dyn SettingsBus) -> Self {
        bus.pause();
        Self { bus }
    }

    /// Publish from inside the bracket (the usual save-then-notify shape).
    pub fn publish(&mut self) {
        self.bus.publish();
    }
}

impl Drop for SuppressGuard<'_> {
    fn drop(&mut self) {
        self.bus.resume();
    }
}

/// Inotify-backed bus over a signal file beside the state file.
///
/// `publish` rewrites the file; subscribers watch it for close-after-write.
/// `pause` removes the watch entirely, so signals raised while paused are
/// never queued — true suppression rather than drain-and-hope.
pub struct FileBus {
    inotify_fd: RawFd,
    watch: Option<libc::c_int>,
    path: PathBuf,
    serial: u64,
}

impl FileBus {
    pub fn open(path: impl Into<PathBuf>) -> NotifyResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            fs::write(&path, "0\n")?;
        }

        let inotify_fd =
            unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if inotify_fd < 0 {
            return Err(NotifyError::Io(std::io::Error::last_os_error()));
        }

        let mut bus = Self {
            inotify_fd,
            watch: None,
            path,
            serial: 0,
        };
        bus.add_watch()?;
        Ok(bus)
    }

    /// Open the bus at the default location,
    /// `$XDG_STATE_HOME/kbswitch/settings.signal`.
    pub fn open_default() -> NotifyResult<Self> {
        let dir = default_state_dir().map_err(|_| NotifyError::NoStateDir)?;
        Self::open(dir.join("settings.signal"))
    }

    fn add_watch(&mut self) -> NotifyResult<()> {
        let cpath = CString::new(self.path.as_os_str().as_bytes())
            .map_err(|_| NotifyError::Io(std::io::ErrorKind::InvalidInput.into()))?;
        let wd = unsafe {
            libc::inotify_add_watch(self.inotify_fd, cpath.as_ptr(), libc::IN_CLOSE_WRITE)
        };
        if wd < 0 {
            return Err(NotifyError::Io(std::io::Error::last_os_error()));
        }
        self.watch = Some(wd);
        Ok(())
    }
}

// inotify_event structs must be read through an int-aligned buffer.
#[repr(align(4))]
struct EventBuf([u8; 4096]);

impl SettingsBus for FileBus {
    fn publish(&mut self) {
        self.serial = self.serial.wrapping_add(1);
        let payload = format!("{} {}\n", std::process::id(), self.serial);
        if let Err(e) = fs::write(&self.path, payload) {
            log::warn!("failed to publish settings change: {e}");
        }
    }

    fn pause(&mut self) {
        if let Some(wd) = self.watch.take() {
            unsafe { libc::inotify_rm_watch(self.inotify_fd, wd) };
        }
    }

    fn resume(&mut self) {
        if self.watch.is_none() {
            if let Err(e) = self.add_watch() {
                log::warn!("failed to resubscribe to settings changes: {e}");
            }
        }
    }

    fn drain(&mut self) -> bool {
        let mut seen = false;
        let mut buf = EventBuf([0u8; 4096]);
        loop {
            let n = unsafe {
                libc::read(
                    self.inotify_fd,
                    buf.0.as_mut_ptr() as *mut libc::c_void,
                    buf.0.len(),
                )
            };
            if n <= 0 {
                break;
            }

            let mut offset = 0usize;
            let header = std::mem::size_of::<libc::inotify_event>();
            while offset + header <= n as usize {
                let event =
                    unsafe { &*(buf.0.as_ptr().add(offset) as *const libc::inotify_event) };
                // Removing a watch queues IN_IGNORED; only writes count.
                if event.mask & libc::IN_CLOSE_WRITE != 0 {
                    seen = true;
                }
                offset += header + event.len as usize;
            }
        }
        seen
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.inotify_fd)
    }
}

impl Drop for FileBus {
    fn drop(&mut self) {
        self.pause();
        unsafe { libc::close(self.inotify_fd) };
    }
}

#[derive(Default)]
struct Slot {
    pending: AtomicUsize,
    paused: AtomicBool,
}

/// In-process hub connecting `MemoryBus` subscribers.
///
/// Faithfully models the system channel: a publish is delivered to every
/// subscriber, the publisher included, unless that subscriber is paused.
#[derive(Clone, Default)]
pub struct MemoryHub {
    slots: Arc<Mutex<Vec<Arc<Slot>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber.
    pub fn bus(&self) -> MemoryBus {
        let slot = Arc::new(Slot::default());
        self.slots.lock().push(slot.clone());
        MemoryBus {
            hub: self.clone(),
            slot,
        }
    }
}

/// In-memory bus backend for tests and multi-instance simulation.
pub struct MemoryBus {
    hub: MemoryHub,
    slot: Arc<Slot>,
}

impl SettingsBus for MemoryBus {
    fn publish(&mut self) {
        for slot in self.hub.slots.lock().iter() {
            if !slot.paused.load(Ordering::SeqCst) {
                slot.pending.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn pause(&mut self) {
        self.slot.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&mut self) {
        self.slot.paused.store(false, Ordering::SeqCst);
    }

    fn drain(&mut self) -> bool {
        self.slot.pending.swap(0, Ordering::SeqCst) > 0
    }

    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}
