//! The POSIX-like system call layer.
//!
//! `ECALL` lands in a numeric handler table indexed by `a7`; handlers
//! read their arguments out of `a0..a5`, do their work (often against
//! guest memory through gather buffers), and leave a result in `a0`.
//! Negative results are negated errno values; host failures never
//! escape as Rust errors. The table comes in three nested profiles:
//! minimal (enough for a bare `_start` program), newlib (adds the
//! brk/mmap group), and Linux (adds the file, time and identity
//! calls, with the file system gated behind the fd table policy).

use std::ffi::CString;

use log::{debug, trace};

use crate::address::Address;
use crate::cpu::REG_A7;
use crate::file_descriptors::FileDescriptors;
use crate::machine::{Machine, MachineException};
use crate::memory::{PageAttributes, VBuffer, PAGE_SIZE};

/// Reserved handler slot dispatched by the EBREAK instruction, so an
/// embedder can install a debug hook for it.
pub const SYSCALL_EBREAK: u64 = 0;

pub(crate) const SYSCALL_TABLE_SIZE: usize = 512;

/// Longest guest path accepted by the file system calls.
const PATH_MAX: usize = 4096;

/// Linux system call numbers for the RISC-V ABI.
pub mod nr {
    pub const GETCWD: usize = 17;
    pub const DUP: usize = 23;
    pub const FCNTL: usize = 25;
    pub const IOCTL: usize = 29;
    pub const FACCESSAT: usize = 48;
    pub const OPENAT: usize = 56;
    pub const CLOSE: usize = 57;
    pub const LSEEK: usize = 62;
    pub const READ: usize = 63;
    pub const WRITE: usize = 64;
    pub const WRITEV: usize = 66;
    pub const READLINKAT: usize = 78;
    pub const FSTATAT: usize = 79;
    pub const FSTAT: usize = 80;
    pub const EXIT: usize = 93;
    pub const CLOCK_GETTIME: usize = 113;
    pub const RT_SIGACTION: usize = 134;
    pub const RT_SIGPROCMASK: usize = 135;
    pub const UNAME: usize = 160;
    pub const MREMAP: usize = 163;
    pub const GETTIMEOFDAY: usize = 169;
    pub const GETPID: usize = 172;
    pub const GETUID: usize = 174;
    pub const GETEUID: usize = 175;
    pub const GETGID: usize = 176;
    pub const GETEGID: usize = 177;
    pub const BRK: usize = 214;
    pub const MUNMAP: usize = 215;
    pub const MMAP: usize = 222;
    pub const MPROTECT: usize = 226;
    pub const MADVISE: usize = 233;
    pub const STATX: usize = 291;
}

/// View a plain `repr(C)` value as bytes for copying into the guest.
fn struct_bytes<T: Copy>(value: &T) -> &[u8] {
    // SAFETY: only used on plain-old-data structs; the guest receives
    // the host in-memory layout, which is exactly what the
    // stat/statx/time pass-through calls want.
    unsafe {
        std::slice::from_raw_parts(
            value as *const T as *const u8,
            std::mem::size_of::<T>(),
        )
    }
}

fn errno_result(errno: i32) -> i64 {
    -(errno as i64)
}

pub fn syscall_stub_zero<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    trace!("SYSCALL stubbed (zero): {}", machine.cpu.reg(REG_A7));
    machine.set_result(0i64);
    Ok(())
}

pub fn syscall_stub_nosys<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    trace!("SYSCALL stubbed (nosys): {}", machine.cpu.reg(REG_A7));
    machine.set_result(errno_result(libc::ENOSYS));
    Ok(())
}

/// Stop sets the max instruction counter to zero, allowing most
/// instruction loops to end. It is not the only way to exit a guest;
/// tighter integrations install their own handler here.
fn syscall_exit<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    debug!("program exit, status {}", machine.sysarg::<i32>(0));
    machine.stop();
    Ok(())
}

pub fn syscall_ebreak<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    Err(MachineException::UnhandledSyscall {
        pc: machine.cpu.pc().to_u64(),
        number: SYSCALL_EBREAK,
    })
}

// SIGILL, SIGABRT, SIGFPE, SIGSEGV
fn is_exception_signal(signal: i32) -> bool {
    signal == 4 || signal == 6 || signal == 8 || signal == 11
}

/// There is typically only one relevant handler, and languages use it
/// to print backtraces. The address is recorded, never invoked.
fn syscall_sigaction<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let signal = machine.sysarg::<i32>(0);
    let buffer = machine.sysarg_addr(1);
    trace!("SYSCALL rt_sigaction, signal: {signal}");
    if is_exception_signal(signal) && buffer != A::ZERO {
        // sa_handler is the first field of the guest sigaction.
        let handler = machine.memory.read_address(buffer)?;
        machine.set_sighandler(handler);
    }
    machine.set_result(0i64);
    Ok(())
}

/// Resolve a virtual fd for a pass-through call. Without an fd table
/// only the standard streams resolve.
fn translate_fd<A: Address>(machine: &Machine<A>, vfd: i32) -> Option<i32> {
    match machine.fds.as_ref() {
        Some(fds) => fds.translate(vfd),
        None if (0..=2).contains(&vfd) => Some(vfd),
        None => None,
    }
}

fn syscall_lseek<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let vfd = machine.sysarg::<i32>(0);
    let offset = machine.sysarg::<i64>(1);
    let whence = machine.sysarg::<i32>(2);
    trace!("SYSCALL lseek, fd: {vfd}, offset: {offset:#x}, whence: {whence}");

    match translate_fd(machine, vfd) {
        Some(real_fd) => {
            let res = unsafe {
                libc::lseek(real_fd, offset as libc::off_t, whence)
            };
            machine.set_result_or_error(res as i64);
        }
        None => machine.set_result(errno_result(libc::EBADF)),
    }
    Ok(())
}

fn syscall_read<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let vfd = machine.sysarg::<i32>(0);
    let address = machine.sysarg_addr(1);
    let len = machine.sysarg::<usize>(2);
    trace!("SYSCALL read, fd: {vfd}, addr: {address:#x}, len: {len}");

    if vfd == 0 {
        // Drain the machine's stdin source into up to 64kb of pages.
        let mut buffers = [VBuffer::NULL; 16];
        let cnt = machine
            .memory
            .gather_buffers_from_range(&mut buffers, address, len)?;
        let mut bytes = 0usize;
        for buffer in &buffers[..cnt] {
            // SAFETY: the buffers reference pages materialized by the
            // gather call just above; nothing below touches memory.
            let slice = unsafe { buffer.as_mut_slice() };
            let n = machine.stdin_read(slice);
            bytes += n;
            if n < slice.len() {
                break;
            }
        }
        machine.set_result(bytes);
        return Ok(());
    }
    // The fd table is only consulted for vfd >= 3; the standard
    // streams never resolve to host descriptors here.
    if vfd >= 3 && machine.has_file_descriptors() {
        let Some(real_fd) = translate_fd(machine, vfd) else {
            machine.set_result(errno_result(libc::EBADF));
            return Ok(());
        };
        // Up to 1MB of pages per call.
        let mut buffers = [VBuffer::NULL; 256];
        let cnt = machine
            .memory
            .gather_buffers_from_range(&mut buffers, address, len)?;
        let mut bytes = 0i64;
        for buffer in &buffers[..cnt] {
            // SAFETY: as above; the host reads into the page bytes.
            let res = unsafe {
                libc::read(real_fd, buffer.ptr as *mut libc::c_void, buffer.len)
            };
            if res < 0 {
                machine.set_result_or_error(res as i64);
                return Ok(());
            }
            bytes += res as i64;
            if (res as usize) < buffer.len {
                break;
            }
        }
        machine.set_result(bytes);
        return Ok(());
    }
    machine.set_result(errno_result(libc::EBADF));
    Ok(())
}

fn syscall_write<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let vfd = machine.sysarg::<i32>(0);
    let address = machine.sysarg_addr(1);
    let len = machine.sysarg::<usize>(2);
    trace!("SYSCALL write, fd: {vfd}, addr: {address:#x}, len: {len}");

    if vfd == 1 || vfd == 2 {
        // Zero-copy retrieval of buffers (64kb).
        let mut buffers = [VBuffer::NULL; 16];
        let cnt = machine
            .memory
            .gather_buffers_from_range(&mut buffers, address, len)?;
        for buffer in &buffers[..cnt] {
            // SAFETY: pages stay resident; the sink only reads.
            let slice = unsafe { buffer.as_slice() };
            machine.print(slice);
        }
        machine.set_result(len);
        return Ok(());
    }
    let write_permitted = machine
        .fds
        .as_ref()
        .map(|fds| fds.permit_file_write)
        .unwrap_or(false);
    // Only vfds >= 3 may reach the host; stdin in particular is not a
    // writable descriptor.
    if vfd >= 3 && write_permitted {
        let Some(real_fd) = translate_fd(machine, vfd) else {
            machine.set_result(errno_result(libc::EBADF));
            return Ok(());
        };
        // Zero-copy retrieval of buffers (256kb).
        let mut buffers = [VBuffer::NULL; 64];
        let cnt = machine
            .memory
            .gather_buffers_from_range(&mut buffers, address, len)?;
        let mut bytes = 0i64;
        for buffer in &buffers[..cnt] {
            let res = unsafe {
                libc::write(
                    real_fd,
                    buffer.ptr as *const libc::c_void,
                    buffer.len,
                )
            };
            if res < 0 {
                machine.set_result_or_error(res as i64);
                return Ok(());
            }
            bytes += res as i64;
            // Stop on a partial write.
            if (res as usize) < buffer.len {
                break;
            }
        }
        machine.set_result(bytes);
        return Ok(());
    }
    machine.set_result(errno_result(libc::EBADF));
    Ok(())
}

fn syscall_writev<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let vfd = machine.sysarg::<i32>(0);
    let iov_g = machine.sysarg_addr(1);
    let count = machine.sysarg::<i32>(2);
    trace!("SYSCALL writev, fd: {vfd}, iov: {iov_g:#x}, count: {count}");
    if !(0..=256).contains(&count) {
        machine.set_result(errno_result(libc::EINVAL));
        return Ok(());
    }

    let iovec_size = (2 * A::BYTES) as u64;
    if vfd == 1 || vfd == 2 {
        let mut total = 0i64;
        for i in 0..count as u64 {
            let entry = iov_g.wrapping_add(A::from_u64(i * iovec_size));
            let base = machine.memory.read_address(entry)?;
            let iov_len = machine
                .memory
                .read_address(entry.wrapping_add(A::from_u64(A::BYTES as u64)))?
                .to_u64() as usize;
            let mut buffers = [VBuffer::NULL; 4];
            let cnt = machine
                .memory
                .gather_buffers_from_range(&mut buffers, base, iov_len)?;
            for buffer in &buffers[..cnt] {
                // SAFETY: as in write().
                let slice = unsafe { buffer.as_slice() };
                machine.print(slice);
            }
            total += iov_len as i64;
        }
        machine.set_result(total);
        return Ok(());
    }
    let write_permitted = machine
        .fds
        .as_ref()
        .map(|fds| fds.permit_file_write)
        .unwrap_or(false);
    // As in write(): vfds below 3 never reach the host.
    if vfd >= 3 && write_permitted {
        let Some(real_fd) = translate_fd(machine, vfd) else {
            machine.set_result(errno_result(libc::EBADF));
            return Ok(());
        };
        let mut bytes = 0i64;
        'entries: for i in 0..count as u64 {
            let entry = iov_g.wrapping_add(A::from_u64(i * iovec_size));
            let base = machine.memory.read_address(entry)?;
            let iov_len = machine
                .memory
                .read_address(entry.wrapping_add(A::from_u64(A::BYTES as u64)))?
                .to_u64() as usize;
            let mut buffers = [VBuffer::NULL; 4];
            let cnt = machine
                .memory
                .gather_buffers_from_range(&mut buffers, base, iov_len)?;
            for buffer in &buffers[..cnt] {
                let res = unsafe {
                    libc::write(
                        real_fd,
                        buffer.ptr as *const libc::c_void,
                        buffer.len,
                    )
                };
                if res < 0 {
                    machine.set_result_or_error(res as i64);
                    return Ok(());
                }
                bytes += res as i64;
                if (res as usize) < buffer.len {
                    break 'entries;
                }
            }
        }
        machine.set_result(bytes);
        return Ok(());
    }
    machine.set_result(errno_result(libc::EBADF));
    Ok(())
}

fn syscall_openat<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let dir_fd = machine.sysarg::<i32>(0);
    let g_path = machine.sysarg_addr(1);
    let flags = machine.sysarg::<i32>(2);
    let mode = machine.sysarg::<u32>(3);
    let path = machine.memory.memcstring(g_path, PATH_MAX)?;
    trace!("SYSCALL openat, dir_fd: {dir_fd} path: {path} flags: {flags:#x}");

    let allowed = match machine.fds.as_mut() {
        Some(fds) if fds.permit_filesystem => match fds.filter_open.as_mut() {
            Some(filter) => filter(&path),
            None => true,
        },
        _ => {
            machine.set_result(errno_result(libc::EBADF));
            return Ok(());
        }
    };
    if !allowed {
        machine.set_result(errno_result(libc::EPERM));
        return Ok(());
    }
    let Some(real_dir) = translate_fd(machine, dir_fd) else {
        machine.set_result(errno_result(libc::EBADF));
        return Ok(());
    };
    let Ok(c_path) = CString::new(path) else {
        machine.set_result(errno_result(libc::EINVAL));
        return Ok(());
    };
    let real_fd = unsafe {
        libc::openat(real_dir, c_path.as_ptr(), flags, mode as libc::c_uint)
    };
    if real_fd >= 0 {
        let vfd = machine.fds.as_mut().map(|fds| fds.assign(real_fd));
        match vfd {
            Some(vfd) => machine.set_result(vfd),
            None => {
                // SAFETY: we own this freshly opened host fd.
                unsafe { libc::close(real_fd) };
                machine.set_result(errno_result(libc::EBADF));
            }
        }
    } else {
        // Translate errno into a kernel API return value.
        machine.set_result_or_error(real_fd as i64);
    }
    Ok(())
}

fn syscall_close<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let vfd = machine.sysarg::<i32>(0);
    trace!("SYSCALL close, fd: {vfd}");
    // The standard streams belong to the machine, not the guest.
    if (0..=2).contains(&vfd) {
        machine.set_result(0i64);
        return Ok(());
    }
    let result = match machine.fds.as_mut() {
        Some(fds) => fds.close(vfd),
        None => -libc::EBADF,
    };
    machine.set_result(result);
    Ok(())
}

fn syscall_dup<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let vfd = machine.sysarg::<i32>(0);
    trace!("SYSCALL dup, fd: {vfd}");
    if !machine.has_file_descriptors() {
        machine.set_result(errno_result(libc::EBADF));
        return Ok(());
    }
    let Some(real_fd) = translate_fd(machine, vfd) else {
        machine.set_result(errno_result(libc::EBADF));
        return Ok(());
    };
    let res = unsafe { libc::dup(real_fd) };
    if res >= 0 {
        let new_vfd = machine.fds.as_mut().map(|fds| fds.assign(res));
        match new_vfd {
            Some(new_vfd) => machine.set_result(new_vfd),
            None => {
                // SAFETY: we own the duplicate.
                unsafe { libc::close(res) };
                machine.set_result(errno_result(libc::EBADF));
            }
        }
    } else {
        machine.set_result_or_error(res as i64);
    }
    Ok(())
}

fn syscall_fcntl<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let vfd = machine.sysarg::<i32>(0);
    let cmd = machine.sysarg::<i32>(1);
    let arg1 = machine.sysarg::<usize>(2);
    trace!("SYSCALL fcntl, fd: {vfd}, cmd: {cmd:#x}");
    if !machine.has_file_descriptors() {
        machine.set_result(errno_result(libc::EBADF));
        return Ok(());
    }
    match translate_fd(machine, vfd) {
        Some(real_fd) => {
            let res = unsafe { libc::fcntl(real_fd, cmd, arg1) };
            machine.set_result_or_error(res as i64);
        }
        None => machine.set_result(errno_result(libc::EBADF)),
    }
    Ok(())
}

fn syscall_ioctl<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let vfd = machine.sysarg::<i32>(0);
    let request = machine.sysarg::<u64>(1);
    let arg1 = machine.sysarg::<usize>(2);
    trace!("SYSCALL ioctl, fd: {vfd}, req: {request:#x}");
    if !machine.has_file_descriptors() {
        machine.set_result(errno_result(libc::EBADF));
        return Ok(());
    }
    let allowed = match machine.fds.as_mut() {
        Some(fds) => match fds.filter_ioctl.as_mut() {
            Some(filter) => filter(request),
            None => true,
        },
        None => false,
    };
    if !allowed {
        machine.set_result(errno_result(libc::EPERM));
        return Ok(());
    }
    match translate_fd(machine, vfd) {
        Some(real_fd) => {
            let res = unsafe {
                libc::ioctl(real_fd, request as libc::c_ulong, arg1)
            };
            machine.set_result_or_error(res as i64);
        }
        None => machine.set_result(errno_result(libc::EBADF)),
    }
    Ok(())
}

fn syscall_readlinkat<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let vfd = machine.sysarg::<i32>(0);
    let g_path = machine.sysarg_addr(1);
    let g_buf = machine.sysarg_addr(2);
    let bufsize = machine.sysarg::<usize>(3);
    let path = machine.memory.memcstring(g_path, PATH_MAX)?;
    trace!(
        "SYSCALL readlinkat, fd: {vfd} path: {path} buffer: {g_buf:#x} size: {bufsize}"
    );

    if bufsize > 16384 {
        machine.set_result(errno_result(libc::ENOMEM));
        return Ok(());
    }
    if !machine.has_file_descriptors() {
        machine.set_result(errno_result(libc::ENOSYS));
        return Ok(());
    }
    let allowed = match machine.fds.as_mut() {
        Some(fds) => match fds.filter_open.as_mut() {
            Some(filter) => filter(&path),
            None => true,
        },
        None => false,
    };
    if !allowed {
        machine.set_result(errno_result(libc::EPERM));
        return Ok(());
    }
    let Some(real_fd) = translate_fd(machine, vfd) else {
        machine.set_result(errno_result(libc::EBADF));
        return Ok(());
    };
    let Ok(c_path) = CString::new(path) else {
        machine.set_result(errno_result(libc::EINVAL));
        return Ok(());
    };
    let mut scratch = vec![0u8; bufsize];
    let res = unsafe {
        libc::readlinkat(
            real_fd,
            c_path.as_ptr(),
            scratch.as_mut_ptr() as *mut libc::c_char,
            scratch.len(),
        )
    };
    if res > 0 {
        machine.copy_to_guest(g_buf, &scratch[..res as usize])?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// The RISC-V stat structure differs from the host's; the fields are
/// converted one by one.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RiscvStat {
    st_dev: u64,
    st_ino: u64,
    st_mode: u32,
    st_nlink: u32,
    st_uid: u32,
    st_gid: u32,
    st_rdev: u64,
    _pad1: u64,
    st_size: i64,
    st_blksize: i32,
    _pad2: i32,
    st_blocks: i64,
    rv_atime: i64,
    rv_atime_nsec: u64,
    rv_mtime: i64,
    rv_mtime_nsec: u64,
    rv_ctime: i64,
    rv_ctime_nsec: u64,
    _pad3: u32,
    _pad4: u32,
}

impl RiscvStat {
    // Field types vary slightly across host architectures, hence the
    // blanket casts.
    #[allow(clippy::unnecessary_cast)]
    fn from_host(st: &libc::stat) -> RiscvStat {
        RiscvStat {
            st_dev: st.st_dev as u64,
            st_ino: st.st_ino as u64,
            st_mode: st.st_mode as u32,
            st_nlink: st.st_nlink as u32,
            st_uid: st.st_uid as u32,
            st_gid: st.st_gid as u32,
            st_rdev: st.st_rdev as u64,
            st_size: st.st_size as i64,
            st_blksize: st.st_blksize as i32,
            st_blocks: st.st_blocks as i64,
            rv_atime: st.st_atime as i64,
            rv_atime_nsec: st.st_atime_nsec as u64,
            rv_mtime: st.st_mtime as i64,
            rv_mtime_nsec: st.st_mtime_nsec as u64,
            rv_ctime: st.st_ctime as i64,
            rv_ctime_nsec: st.st_ctime_nsec as u64,
            ..Default::default()
        }
    }
}

fn syscall_fstatat<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let vfd = machine.sysarg::<i32>(0);
    let g_path = machine.sysarg_addr(1);
    let g_buf = machine.sysarg_addr(2);
    let flags = machine.sysarg::<i32>(3);
    let path = machine.memory.memcstring(g_path, PATH_MAX)?;
    trace!(
        "SYSCALL fstatat, fd: {vfd} path: {path} buf: {g_buf:#x} flags: {flags:#x}"
    );

    if !machine.has_file_descriptors() {
        machine.set_result(errno_result(libc::ENOSYS));
        return Ok(());
    }
    let Some(real_fd) = translate_fd(machine, vfd) else {
        machine.set_result(errno_result(libc::EBADF));
        return Ok(());
    };
    let Ok(c_path) = CString::new(path) else {
        machine.set_result(errno_result(libc::EINVAL));
        return Ok(());
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let res =
        unsafe { libc::fstatat(real_fd, c_path.as_ptr(), &mut st, flags) };
    if res == 0 {
        let rst = RiscvStat::from_host(&st);
        machine.copy_to_guest(g_buf, struct_bytes(&rst))?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

fn syscall_fstat<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let vfd = machine.sysarg::<i32>(0);
    let g_buf = machine.sysarg_addr(1);
    trace!("SYSCALL fstat, fd: {vfd} buf: {g_buf:#x}");

    if !machine.has_file_descriptors() {
        machine.set_result(errno_result(libc::ENOSYS));
        return Ok(());
    }
    let Some(real_fd) = translate_fd(machine, vfd) else {
        machine.set_result(errno_result(libc::EBADF));
        return Ok(());
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::fstat(real_fd, &mut st) };
    if res == 0 {
        let rst = RiscvStat::from_host(&st);
        machine.copy_to_guest(g_buf, struct_bytes(&rst))?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

fn syscall_statx<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let dir_fd = machine.sysarg::<i32>(0);
    let g_path = machine.sysarg_addr(1);
    let flags = machine.sysarg::<i32>(2);
    let mask = machine.sysarg::<u32>(3);
    let g_buf = machine.sysarg_addr(4);
    let path = machine.memory.memcstring(g_path, PATH_MAX)?;
    trace!(
        "SYSCALL statx, fd: {dir_fd} path: {path} flags: {flags:#x} buf: {g_buf:#x}"
    );

    if !machine.has_file_descriptors() {
        machine.set_result(errno_result(libc::ENOSYS));
        return Ok(());
    }
    let allowed = match machine.fds.as_mut() {
        Some(fds) => match fds.filter_stat.as_mut() {
            Some(filter) => filter(&path),
            None => true,
        },
        None => false,
    };
    if !allowed {
        machine.set_result(errno_result(libc::EPERM));
        return Ok(());
    }
    let Some(real_dir) = translate_fd(machine, dir_fd) else {
        machine.set_result(errno_result(libc::EBADF));
        return Ok(());
    };
    let Ok(c_path) = CString::new(path) else {
        machine.set_result(errno_result(libc::EINVAL));
        return Ok(());
    };
    let mut stx: libc::statx = unsafe { std::mem::zeroed() };
    let res = unsafe {
        libc::statx(real_dir, c_path.as_ptr(), flags, mask, &mut stx)
    };
    if res == 0 {
        // The statx layout is identical on the guest; copy verbatim.
        machine.copy_to_guest(g_buf, struct_bytes(&stx))?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

fn syscall_gettimeofday<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let buffer = machine.sysarg_addr(0);
    trace!("SYSCALL gettimeofday, buffer: {buffer:#x}");
    let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
    let res =
        unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    if res >= 0 {
        if A::BYTES == 4 {
            let timeval32 = [tv.tv_sec as i32, tv.tv_usec as i32];
            machine.copy_to_guest(buffer, struct_bytes(&timeval32))?;
        } else {
            machine.copy_to_guest(buffer, struct_bytes(&tv))?;
        }
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

fn syscall_clock_gettime<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let clkid = machine.sysarg::<i32>(0);
    let buffer = machine.sysarg_addr(1);
    trace!("SYSCALL clock_gettime, clkid: {clkid:#x} buffer: {buffer:#x}");
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::clock_gettime(clkid, &mut ts) };
    if res >= 0 {
        machine.copy_to_guest(buffer, struct_bytes(&ts))?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

const UTSLEN: usize = 65;

#[repr(C)]
#[derive(Clone, Copy)]
struct Utsname {
    sysname: [u8; UTSLEN],
    nodename: [u8; UTSLEN],
    release: [u8; UTSLEN],
    version: [u8; UTSLEN],
    machine: [u8; UTSLEN],
    domain: [u8; UTSLEN],
}

fn uts_field(s: &str) -> [u8; UTSLEN] {
    let mut field = [0u8; UTSLEN];
    let n = s.len().min(UTSLEN - 1);
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
    field
}

fn syscall_uname<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let buffer = machine.sysarg_addr(0);
    trace!("SYSCALL uname, buffer: {buffer:#x}");
    let uts = Utsname {
        sysname: uts_field("RISC-V C++ Emulator"),
        nodename: uts_field("libriscv"),
        release: uts_field("5.0.0"),
        version: uts_field(""),
        machine: uts_field(A::MACHINE),
        domain: uts_field("(none)"),
    };
    machine.copy_to_guest(buffer, struct_bytes(&uts))?;
    machine.set_result(0i64);
    Ok(())
}

fn syscall_brk<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let new_end = machine.sysarg_addr(0);
    let end = machine.memory.brk(new_end);
    trace!("SYSCALL brk, requested: {new_end:#x} -> {end:#x}");
    machine.set_result(end.to_u64());
    Ok(())
}

fn page_aligned(value: u64) -> bool {
    value % PAGE_SIZE as u64 == 0
}

fn round_to_pages(value: u64) -> u64 {
    (value + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

fn syscall_munmap<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let addr = machine.sysarg_addr(0);
    let len = machine.sysarg::<u64>(1);
    trace!(">>> munmap({:#x}, len={})", addr.to_u64(), len);
    machine.memory.free_pages(addr, len);
    // Retract the arena pointer when the tail mapping goes away, but
    // never below the end of the brk arena.
    let floor =
        machine.memory.heap_address().to_u64() + machine.memory.brk_max();
    let nextfree = machine.memory.mmap_address();
    if addr.to_u64() + len == nextfree.to_u64() {
        *nextfree = A::from_u64(addr.to_u64().max(floor));
    }
    machine.set_result(0i64);
    Ok(())
}

fn syscall_mmap<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let addr_g = machine.sysarg_addr(0);
    let length = machine.sysarg::<u64>(1);
    let prot = machine.sysarg::<i32>(2);
    let flags = machine.sysarg::<i32>(3);
    trace!(
        ">>> mmap(addr {:#x}, len {}, prot {:#x}, flags {:#x})",
        addr_g.to_u64(),
        length,
        prot,
        flags
    );
    if !page_aligned(addr_g.to_u64()) || !page_aligned(length) {
        machine.set_result(-1i64); // MAP_FAILED
        return Ok(());
    }
    let length = round_to_pages(length);
    let nextfree = *machine.memory.mmap_address();
    if addr_g == A::ZERO || addr_g == nextfree {
        // MAP_ANONYMOUS pages need to be zeroed, but they already are
        // through the zero-page CoW discipline.
        machine.set_result(nextfree.to_u64());
        *machine.memory.mmap_address() =
            nextfree.wrapping_add(A::from_u64(length));
    } else if addr_g < nextfree {
        debug!("invalid mapping attempted at {:#x}", addr_g.to_u64());
        machine.set_result(-1i64);
    } else {
        // A fixed hint above the arena: the pages there are anonymous
        // and materialize on demand.
        machine.set_result(addr_g.to_u64());
    }
    Ok(())
}

fn syscall_mremap<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let old_addr = machine.sysarg_addr(0);
    let old_size = machine.sysarg::<u64>(1);
    let new_size = machine.sysarg::<u64>(2);
    let flags = machine.sysarg::<i32>(3);
    trace!(
        ">>> mremap(addr {:#x}, len {}, newsize {}, flags {:#x})",
        old_addr.to_u64(),
        old_size,
        new_size,
        flags
    );
    // Only the common case of growing or shrinking the last mapping
    // in place is supported.
    let nextfree = machine.memory.mmap_address();
    if old_addr.to_u64() + old_size == nextfree.to_u64() {
        *nextfree =
            A::from_u64(old_addr.to_u64() + round_to_pages(new_size));
        machine.set_result(old_addr.to_u64());
    } else {
        machine.set_result(-1i64);
    }
    Ok(())
}

fn syscall_mprotect<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let addr = machine.sysarg_addr(0);
    let len = machine.sysarg::<u64>(1);
    let prot = machine.sysarg::<i32>(2);
    trace!(">>> mprotect({:#x}, len={}, prot={:#x})", addr.to_u64(), len, prot);
    machine
        .memory
        .set_page_attr(addr, len, PageAttributes::from_prot(prot))?;
    machine.set_result(0i64);
    Ok(())
}

fn syscall_madvise<A: Address>(
    machine: &mut Machine<A>,
) -> Result<(), MachineException> {
    let addr = machine.sysarg_addr(0);
    let len = machine.sysarg::<u64>(1);
    let advice = machine.sysarg::<i32>(2);
    trace!(
        ">>> madvise({:#x}, len={}, advice={:#x})",
        addr.to_u64(),
        len,
        advice
    );
    match advice {
        libc::MADV_NORMAL
        | libc::MADV_RANDOM
        | libc::MADV_SEQUENTIAL
        | libc::MADV_WILLNEED => {
            machine.set_result(0i64);
        }
        libc::MADV_DONTNEED | libc::MADV_REMOVE => {
            machine.memory.free_pages(addr, len);
            machine.set_result(0i64);
        }
        _ => machine.set_result(errno_result(libc::EINVAL)),
    }
    Ok(())
}

impl<A: Address> Machine<A> {
    fn add_mman_syscalls(&mut self) {
        self.install_syscall_handler(nr::MUNMAP, syscall_munmap);
        self.install_syscall_handler(nr::MMAP, syscall_mmap);
        self.install_syscall_handler(nr::MREMAP, syscall_mremap);
        self.install_syscall_handler(nr::MPROTECT, syscall_mprotect);
        self.install_syscall_handler(nr::MADVISE, syscall_madvise);
    }

    /// Enough to run a freestanding `_start` program: EBREAK trap,
    /// lseek/read/write on the standard streams, exit.
    pub fn setup_minimal_syscalls(&mut self) {
        self.install_syscall_handler(SYSCALL_EBREAK as usize, syscall_ebreak);
        self.install_syscall_handler(nr::LSEEK, syscall_lseek);
        self.install_syscall_handler(nr::READ, syscall_read);
        self.install_syscall_handler(nr::WRITE, syscall_write);
        self.install_syscall_handler(nr::EXIT, syscall_exit);
    }

    /// The minimal profile plus the heap calls newlib's sbrk/malloc
    /// need.
    pub fn setup_newlib_syscalls(&mut self) {
        self.setup_minimal_syscalls();
        self.install_syscall_handler(nr::BRK, syscall_brk);
        self.add_mman_syscalls();
    }

    /// The profile for statically linked Linux binaries. `filesystem`
    /// (or `sockets`) constructs the fd table; socket system calls
    /// themselves are not part of this layer.
    pub fn setup_linux_syscalls(&mut self, filesystem: bool, sockets: bool) {
        self.setup_minimal_syscalls();

        self.install_syscall_handler(nr::GETCWD, syscall_stub_zero);
        self.install_syscall_handler(nr::DUP, syscall_dup);
        self.install_syscall_handler(nr::FCNTL, syscall_fcntl);
        self.install_syscall_handler(nr::IOCTL, syscall_ioctl);
        self.install_syscall_handler(nr::FACCESSAT, syscall_stub_nosys);

        self.install_syscall_handler(nr::OPENAT, syscall_openat);
        self.install_syscall_handler(nr::CLOSE, syscall_close);
        self.install_syscall_handler(nr::WRITEV, syscall_writev);
        self.install_syscall_handler(nr::READLINKAT, syscall_readlinkat);
        self.install_syscall_handler(nr::FSTATAT, syscall_fstatat);
        self.install_syscall_handler(nr::FSTAT, syscall_fstat);

        self.install_syscall_handler(nr::CLOCK_GETTIME, syscall_clock_gettime);
        self.install_syscall_handler(nr::RT_SIGACTION, syscall_sigaction);
        self.install_syscall_handler(nr::RT_SIGPROCMASK, syscall_stub_zero);

        self.install_syscall_handler(nr::UNAME, syscall_uname);
        self.install_syscall_handler(nr::GETTIMEOFDAY, syscall_gettimeofday);
        self.install_syscall_handler(nr::GETPID, syscall_stub_zero);
        self.install_syscall_handler(nr::GETUID, syscall_stub_zero);
        self.install_syscall_handler(nr::GETEUID, syscall_stub_zero);
        self.install_syscall_handler(nr::GETGID, syscall_stub_zero);
        self.install_syscall_handler(nr::GETEGID, syscall_stub_zero);

        self.install_syscall_handler(nr::BRK, syscall_brk);
        self.add_mman_syscalls();

        if filesystem || sockets {
            let mut fds = FileDescriptors::new();
            // A sockets-only table must still refuse filesystem opens.
            fds.permit_filesystem = filesystem;
            self.install_file_descriptors(fds);
        }

        self.install_syscall_handler(nr::STATX, syscall_statx);
    }
}
