//! Interact with `shm_*` and the few process calls the lock block needs.
use core::ffi::c_int;
use std::ffi::CStr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

/// Interact with `shm*` and related calls.
#[derive(Clone)]
pub struct Shm {
    inner: Arc<ShmInner>,
}

struct ShmInner {
    vtable: ShmVTable,
}

/// An error returned when interacting with a shared memory object, the `errno` of the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShmError(pub c_int);

/// *Fixed* type, not platform dependent.
type OffT = i64;

#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct Stat {
    pub st_mode: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: OffT,
}

/// A table of OS functions.
///
/// This enumerates the functions required to find, create and size the shared memory objects
/// holding lock state. A vtable must contain functions that behave according the POSIX/libc's
/// specification of the correspondingly named functions, see Safety precondition of
/// [`Shm::new_unchecked`]. Note that a default table can be initialized from `libc`.
///
/// Tests swap single entries to simulate failing system calls.
#[non_exhaustive]
pub struct ShmVTable {
    /// `shm_open` read-write; with `create` the call must fail with `EEXIST` for existing objects.
    pub open: fn(name: &CStr, create: bool) -> c_int,
    pub unlink: fn(name: &CStr) -> c_int,
    pub fstat: fn(c_int, Option<&mut Stat>) -> c_int,
    pub ftruncate: fn(c_int, OffT) -> c_int,
    /// Whether a process with this id still exists.
    pub alive: fn(u32) -> bool,
    pub getpid: fn() -> u32,
    pub errno: fn() -> c_int,
}

impl Shm {
    /// Create an `Shm` from a customized vtable.
    ///
    /// # Safety
    ///
    /// The VTable must contain functions that implement the `shm*` interface. In particular a
    /// returned non-negative descriptor must be owned by the caller.
    pub unsafe fn new_unchecked(vtable: ShmVTable) -> Self {
        Shm {
            inner: Arc::new(ShmInner { vtable }),
        }
    }

    pub fn new() -> Self {
        unsafe { Self::new_unchecked(ShmVTable::new_libc()) }
    }

    /// Open an existing object.
    pub fn open(&self, name: &CStr) -> Result<OwnedFd, ShmError> {
        self.wrap_fd((self.inner.vtable.open)(name, false))
    }

    /// Create an object, failing if it already exists.
    pub fn create_new(&self, name: &CStr) -> Result<OwnedFd, ShmError> {
        self.wrap_fd((self.inner.vtable.open)(name, true))
    }

    pub fn unlink(&self, name: &CStr) -> Result<(), ShmError> {
        match (self.inner.vtable.unlink)(name) {
            0 => Ok(()),
            _ => Err(self.last_error()),
        }
    }

    pub fn stat(&self, fd: &OwnedFd) -> Result<Stat, ShmError> {
        let mut stat = Stat::default();
        let inner = (self.inner.vtable.fstat)(fd.as_raw_fd(), Some(&mut stat));

        if inner < 0 {
            Err(self.last_error())
        } else {
            Ok(stat)
        }
    }

    pub fn set_len(&self, fd: &OwnedFd, len: u64) -> Result<(), ShmError> {
        let len = OffT::try_from(len).map_err(|_| ShmError(libc::EFBIG))?;
        match (self.inner.vtable.ftruncate)(fd.as_raw_fd(), len) {
            0 => Ok(()),
            _ => Err(self.last_error()),
        }
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        (self.inner.vtable.alive)(pid)
    }

    pub fn pid(&self) -> u32 {
        (self.inner.vtable.getpid)()
    }

    fn wrap_fd(&self, fd: c_int) -> Result<OwnedFd, ShmError> {
        if fd < 0 {
            return Err(self.last_error());
        }

        // Safety: the vtable contract hands us ownership of non-negative descriptors.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn last_error(&self) -> ShmError {
        ShmError((self.inner.vtable.errno)())
    }
}

impl Default for Shm {
    fn default() -> Self {
        Shm::new()
    }
}

impl ShmError {
    pub fn is_not_found(&self) -> bool {
        self.0 == libc::ENOENT
    }

    pub fn already_exists(&self) -> bool {
        self.0 == libc::EEXIST
    }
}

impl From<ShmError> for std::io::Error {
    fn from(err: ShmError) -> Self {
        std::io::Error::from_raw_os_error(err.0)
    }
}

impl ShmVTable {
    pub fn new_libc() -> Self {
        fn _open(name: &CStr, create: bool) -> c_int {
            let flags = if create {
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL
            } else {
                libc::O_RDWR
            };

            #[cfg(target_vendor = "apple")]
            let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o666 as libc::c_uint) };
            #[cfg(not(target_vendor = "apple"))]
            let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o666 as libc::mode_t) };

            fd
        }

        fn _unlink(name: &CStr) -> c_int {
            unsafe { libc::shm_unlink(name.as_ptr()) }
        }

        fn _fstat(fd: c_int, stat: Option<&mut Stat>) -> c_int {
            let mut uninit = core::mem::MaybeUninit::<libc::stat>::zeroed();
            // Safety: passing the correct pointer to a struct of libc::stat.
            let ret = unsafe { libc::fstat(fd, uninit.as_mut_ptr()) };

            if ret == 0 {
                // Safety: always initialized on return with success.
                let lstat = unsafe { uninit.assume_init() };
                if let Some(stat) = stat {
                    *stat = Stat {
                        st_mode: lstat.st_mode as u32,
                        st_uid: lstat.st_uid,
                        st_gid: lstat.st_gid,
                        st_size: lstat.st_size as OffT,
                    };
                };
            }

            ret
        }

        fn _ftruncate(fd: c_int, len: OffT) -> c_int {
            unsafe { libc::ftruncate(fd, len as libc::off_t) }
        }

        fn _alive(pid: u32) -> bool {
            // Zero and negative ids address process groups, not a process.
            let Ok(pid) = libc::pid_t::try_from(pid) else {
                return false;
            };

            if pid == 0 {
                return false;
            }

            // Signal 0 only performs the existence and permission checks.
            if unsafe { libc::kill(pid, 0) } == 0 {
                return true;
            }

            _errno() == libc::EPERM
        }

        fn _getpid() -> u32 {
            std::process::id()
        }

        fn _errno() -> c_int {
            std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
        }

        ShmVTable {
            open: _open,
            unlink: _unlink,
            fstat: _fstat,
            ftruncate: _ftruncate,
            alive: _alive,
            getpid: _getpid,
            errno: _errno,
        }
    }
}

#[test]
fn own_process_is_alive() {
    let shm = Shm::new();
    assert!(shm.is_alive(shm.pid()));
    assert!(!shm.is_alive(0x7fff_fff0));
}
