//! The virtual file descriptor table.
//!
//! Guests never see host file descriptors: the file system calls hand
//! out small virtual fds and translate them back at the host
//! boundary. Virtual fds 0, 1 and 2 are the machine's own standard
//! streams and pass through untranslated (as does `AT_FDCWD`, which
//! is negative). The table owns its host fds and closes them when the
//! machine goes away.

use std::collections::BTreeMap;

/// Path predicate for `openat`/`readlinkat` filtering.
pub type PathFilter = Box<dyn FnMut(&str) -> bool + Send>;
/// Request predicate for `ioctl` filtering.
pub type IoctlFilter = Box<dyn FnMut(u64) -> bool + Send>;

/// Mapping from virtual fd to host fd, plus the sandbox policy the
/// file system calls consult.
pub struct FileDescriptors {
    translation: BTreeMap<i32, i32>,
    /// Master switch for `openat`.
    pub permit_filesystem: bool,
    /// Allows `write`/`writev` to virtual fds >= 3.
    pub permit_file_write: bool,
    /// Invoked with the guest path before `openat` and `readlinkat`;
    /// returning false yields `-EPERM`.
    pub filter_open: Option<PathFilter>,
    /// Invoked with the guest path before `statx`.
    pub filter_stat: Option<PathFilter>,
    /// Invoked with the request number before `ioctl`.
    pub filter_ioctl: Option<IoctlFilter>,
}

/// First virtual fd handed out; 0..=2 are reserved for the standard
/// streams.
const FIRST_VFD: i32 = 3;

impl FileDescriptors {
    pub fn new() -> FileDescriptors {
        FileDescriptors {
            translation: BTreeMap::new(),
            permit_filesystem: true,
            permit_file_write: false,
            filter_open: None,
            filter_stat: None,
            filter_ioctl: None,
        }
    }

    /// Record an open host fd and return the smallest free virtual fd.
    pub fn assign(&mut self, host_fd: i32) -> i32 {
        let mut vfd = FIRST_VFD;
        for (&used, _) in self.translation.range(FIRST_VFD..) {
            if used != vfd {
                break;
            }
            vfd += 1;
        }
        self.translation.insert(vfd, host_fd);
        vfd
    }

    /// Resolve a virtual fd to the host fd to operate on. The
    /// standard streams and `AT_FDCWD` pass through unchanged.
    pub fn translate(&self, vfd: i32) -> Option<i32> {
        if vfd < FIRST_VFD {
            Some(vfd)
        } else {
            self.translation.get(&vfd).copied()
        }
    }

    /// Close a virtual fd, closing the host fd behind it. Returns 0 or
    /// `-EBADF`.
    pub fn close(&mut self, vfd: i32) -> i32 {
        match self.translation.remove(&vfd) {
            Some(host_fd) => {
                // SAFETY: the fd came from the host and is owned by
                // this table.
                unsafe { libc::close(host_fd) };
                0
            }
            None => -libc::EBADF,
        }
    }

    /// Number of translated descriptors currently open.
    pub fn open_count(&self) -> usize {
        self.translation.len()
    }
}

impl Default for FileDescriptors {
    fn default() -> Self {
        FileDescriptors::new()
    }
}

impl Drop for FileDescriptors {
    fn drop(&mut self) {
        for (_, host_fd) in std::mem::take(&mut self.translation) {
            // SAFETY: as in close().
            unsafe { libc::close(host_fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_picks_smallest_free() {
        let mut fds = FileDescriptors::new();
        // Use fds we do not own so drop-closing them is harmless.
        assert_eq!(fds.assign(-1), 3);
        assert_eq!(fds.assign(-1), 4);
        assert_eq!(fds.assign(-1), 5);
        fds.translation.remove(&4);
        assert_eq!(fds.assign(-1), 4);
        fds.translation.clear();
    }

    #[test]
    fn standard_streams_pass_through() {
        let fds = FileDescriptors::new();
        assert_eq!(fds.translate(0), Some(0));
        assert_eq!(fds.translate(2), Some(2));
        assert_eq!(fds.translate(libc::AT_FDCWD), Some(libc::AT_FDCWD));
        assert_eq!(fds.translate(7), None);
    }
}
