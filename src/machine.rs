//! The top-level container: one CPU, one address space, one system
//! call table, and the host-facing configuration (output sinks, stdin
//! source, file descriptor table, user data).

use std::any::Any;
use std::io::Write;

use thiserror::Error;

use crate::address::Address;
use crate::cpu::{Cpu, REG_A0, REG_A7, REG_SP};
use crate::file_descriptors::FileDescriptors;
use crate::memory::{Memory, PageAttributes, PAGE_SIZE};
use crate::syscalls;

/// Machine-level traps. These terminate `simulate()` and propagate to
/// the embedder; guest-visible failures are negative errno values in
/// `a0` and never surface here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MachineException {
    #[error("illegal opcode {bits:#010x} at pc {pc:#x}")]
    IllegalOpcode { pc: u64, bits: u32 },
    #[error("illegal operation in instruction {bits:#010x} at pc {pc:#x}")]
    IllegalOperation { pc: u64, bits: u32 },
    #[error("unimplemented instruction {bits:#010x} at pc {pc:#x}")]
    UnimplementedInstruction { pc: u64, bits: u32 },
    #[error("protection fault at address {addr:#x}")]
    ProtectionFault { addr: u64 },
    #[error("execution space protection fault at pc {pc:#x}")]
    ExecutionSpaceProtectionFault { pc: u64 },
    #[error("misaligned jump to {target:#x} from pc {pc:#x}")]
    MisalignedInstruction { pc: u64, target: u64 },
    #[error("unhandled system call {number} at pc {pc:#x}")]
    UnhandledSyscall { pc: u64, number: u64 },
    #[error("out of memory: {pages} pages in use of {max} allowed")]
    OutOfMemory { pages: usize, max: usize },
}

/// A system call handler: receives the whole machine and mutates it,
/// normally by writing a result into `a0`. Only machine-level traps
/// (EBREAK, debugger hooks) return `Err`; host failures become
/// negative errno results.
pub type SyscallHandler<A> =
    fn(&mut Machine<A>) -> Result<(), MachineException>;

/// Construction-time configuration.
pub struct MachineOptions<A: Address> {
    /// Budget for guest memory, in bytes. Materialized pages beyond
    /// this raise [`MachineException::OutOfMemory`].
    pub memory_max: u64,
    /// Where the flat program image is placed, and the initial PC.
    pub load_address: A,
    /// Initial stack pointer. The stack lives in anonymous memory, so
    /// any page-aligned address in the upper part of the address
    /// space works; the default is the top page.
    pub stack_address: A,
    /// Ceiling on `brk` growth above the heap base.
    pub brk_max: u64,
}

impl<A: Address> Default for MachineOptions<A> {
    fn default() -> Self {
        MachineOptions {
            memory_max: 64 << 20,
            load_address: A::from_u64(0x10000),
            stack_address: A::MAX & !A::from_u64(0xFFF),
            brk_max: Memory::<A>::BRK_MAX,
        }
    }
}

type PrintSink = Box<dyn FnMut(&[u8]) + Send>;
type StdinSource = Box<dyn FnMut(&mut [u8]) -> usize + Send>;

/// A complete guest: CPU, paged memory, system call table, optional
/// file descriptor table, and host-facing I/O configuration.
///
/// One machine is driven by one host thread at a time. It may be moved
/// between threads between `simulate()` calls but never shared.
pub struct Machine<A: Address> {
    pub cpu: Cpu<A>,
    pub memory: Memory<A>,
    pub(crate) handlers: Vec<SyscallHandler<A>>,
    pub(crate) fds: Option<FileDescriptors>,
    sighandler: A,
    userdata: Option<Box<dyn Any + Send>>,
    print_sink: PrintSink,
    stdin_source: StdinSource,
}

impl<A: Address> Machine<A> {
    /// Build a machine from a flat program image. The image is copied
    /// to `load_address` with read+exec attributes, the heap begins at
    /// the first page boundary after it, and the PC and stack pointer
    /// are primed. ELF loading is the embedder's business; an ELF
    /// loader materializes segments with `copy_to_guest` and
    /// `set_page_attr`.
    pub fn new(
        image: &[u8],
        options: MachineOptions<A>,
    ) -> Result<Machine<A>, MachineException> {
        let mut memory = Memory::new(
            options.memory_max,
            options.brk_max,
            options.stack_address,
        );
        memory.load_image(
            options.load_address,
            image,
            PageAttributes::readable_executable(),
        )?;
        let image_end = options.load_address.to_u64() + image.len() as u64;
        let heap_base =
            image_end.wrapping_add(PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        memory.set_heap_region(A::from_u64(heap_base));

        let mut cpu = Cpu::new();
        cpu.set_pc(options.load_address);
        cpu.set_reg(REG_SP, options.stack_address);

        let mut handlers: Vec<SyscallHandler<A>> = vec![
            syscalls::syscall_stub_nosys::<A> as SyscallHandler<A>;
            syscalls::SYSCALL_TABLE_SIZE
        ];
        handlers[syscalls::SYSCALL_EBREAK as usize] = syscalls::syscall_ebreak;

        Ok(Machine {
            cpu,
            memory,
            handlers,
            fds: None,
            sighandler: A::ZERO,
            userdata: None,
            print_sink: Box::new(|bytes| {
                let _ = std::io::stdout().write_all(bytes);
            }),
            stdin_source: Box::new(|_| 0),
        })
    }

    /// Install a handler in the numeric dispatch table.
    ///
    /// The table is meant to be populated before the first `simulate`
    /// call or between calls, not from inside a running guest.
    pub fn install_syscall_handler(
        &mut self,
        number: usize,
        handler: SyscallHandler<A>,
    ) {
        assert!(
            number < self.handlers.len(),
            "system call number {number} outside the dispatch table"
        );
        self.handlers[number] = handler;
    }

    /// Look up and invoke the handler for `number`. Numbers outside
    /// the table resolve to the `-ENOSYS` stub.
    pub fn system_call(
        &mut self,
        number: u64,
    ) -> Result<(), MachineException> {
        let handler = self.handlers.get(number as usize).copied();
        match handler {
            Some(handler) => handler(self),
            None => {
                self.set_result(-(libc::ENOSYS as i64));
                Ok(())
            }
        }
    }

    /// Argument register `a[index]`, decoded as `T`.
    pub fn sysarg<T: FromRegister<A>>(&self, index: usize) -> T {
        T::from_register(self.cpu.reg(REG_A0 + index))
    }
    /// Argument register `a[index]` as a guest address.
    pub fn sysarg_addr(&self, index: usize) -> A {
        self.cpu.reg(REG_A0 + index)
    }
    /// The system call number register `a7`.
    pub fn syscall_number(&self) -> u64 {
        self.cpu.reg(REG_A7).to_u64()
    }

    /// Write a system call result into `a0`. Negative values are
    /// sign-extended so they read back as `-errno` at every width.
    pub fn set_result<T: IntoRegister<A>>(&mut self, value: T) {
        let value = value.into_register();
        self.cpu.set_reg(REG_A0, value);
    }
    /// Translate a host return code: negative means "fetch errno and
    /// return its negation", non-negative passes through.
    pub fn set_result_or_error(&mut self, rc: i64) {
        if rc < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            self.set_result(-(errno as i64));
        } else {
            self.set_result(rc);
        }
    }

    /// Cooperative cancellation: zero the instruction budget so the
    /// execution loop ends at the next boundary. This is also how the
    /// `exit` system call stops the guest.
    pub fn stop(&mut self) {
        self.cpu.set_max_instructions(0);
    }
    /// Number of instructions retired so far.
    pub fn instruction_counter(&self) -> u64 {
        self.cpu.instruction_counter()
    }

    /// Record the guest's exception-signal handler address. It is
    /// stored, not invoked; languages install one to print backtraces
    /// and query it back.
    pub fn set_sighandler(&mut self, addr: A) {
        self.sighandler = addr;
    }
    pub fn sighandler(&self) -> A {
        self.sighandler
    }

    /// Copy guest memory into a host buffer.
    pub fn copy_from_guest(
        &self,
        dst: &mut [u8],
        src: A,
    ) -> Result<(), MachineException> {
        self.memory.memcpy_in(dst, src)
    }
    /// Copy a host buffer into guest memory.
    pub fn copy_to_guest(
        &mut self,
        dst: A,
        src: &[u8],
    ) -> Result<(), MachineException> {
        self.memory.memcpy_out(dst, src)
    }

    /// Emit bytes on the guest's stdout/stderr sink.
    pub fn print(&mut self, bytes: &[u8]) {
        (self.print_sink)(bytes);
    }
    /// Pull bytes from the guest's stdin source; returns the number
    /// supplied.
    pub fn stdin_read(&mut self, buf: &mut [u8]) -> usize {
        (self.stdin_source)(buf)
    }
    pub fn set_print_sink(&mut self, sink: PrintSink) {
        self.print_sink = sink;
    }
    pub fn set_stdin_source(&mut self, source: StdinSource) {
        self.stdin_source = source;
    }

    /// Attach an opaque embedder value, retrievable from filter
    /// callbacks and system call handlers via [`Machine::userdata`].
    pub fn set_userdata<T: Any + Send>(&mut self, value: T) {
        self.userdata = Some(Box::new(value));
    }
    pub fn userdata<T: Any + Send>(&self) -> Option<&T> {
        self.userdata.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    /// Whether a file descriptor table has been constructed (it is,
    /// when the Linux profile is installed with `filesystem` or
    /// `sockets` enabled).
    pub fn has_file_descriptors(&self) -> bool {
        self.fds.is_some()
    }
    pub fn fds(&self) -> Option<&FileDescriptors> {
        self.fds.as_ref()
    }
    pub fn fds_mut(&mut self) -> Option<&mut FileDescriptors> {
        self.fds.as_mut()
    }
    /// Install (or replace) the file descriptor table.
    pub fn install_file_descriptors(&mut self, fds: FileDescriptors) {
        self.fds = Some(fds);
    }

    /// A copy-on-write duplicate of this machine: registers and pages
    /// are copied/shared, the system call table is carried over, and
    /// the host-facing parts (sinks, fd table, user data) reset to
    /// defaults since they cannot be duplicated meaningfully.
    pub fn fork(&self) -> Machine<A> {
        Machine {
            cpu: self.cpu.clone(),
            memory: self.memory.fork(),
            handlers: self.handlers.clone(),
            fds: None,
            sighandler: self.sighandler,
            userdata: None,
            print_sink: Box::new(|bytes| {
                let _ = std::io::stdout().write_all(bytes);
            }),
            stdin_source: Box::new(|_| 0),
        }
    }
}

/// Decoding of an argument register into a host-side type, with the
/// C-style truncation/extension conventions the handlers expect.
pub trait FromRegister<A: Address> {
    fn from_register(reg: A) -> Self;
}

impl<A: Address> FromRegister<A> for i32 {
    fn from_register(reg: A) -> i32 {
        reg.to_u64() as u32 as i32
    }
}
impl<A: Address> FromRegister<A> for u32 {
    fn from_register(reg: A) -> u32 {
        reg.to_u64() as u32
    }
}
impl<A: Address> FromRegister<A> for i64 {
    fn from_register(reg: A) -> i64 {
        reg.to_i64()
    }
}
impl<A: Address> FromRegister<A> for u64 {
    fn from_register(reg: A) -> u64 {
        reg.to_u64()
    }
}
impl<A: Address> FromRegister<A> for usize {
    fn from_register(reg: A) -> usize {
        reg.to_u64() as usize
    }
}

/// Encoding of a host-side value into the result register.
pub trait IntoRegister<A: Address> {
    fn into_register(self) -> A;
}

impl<A: Address> IntoRegister<A> for i32 {
    fn into_register(self) -> A {
        A::from_i64(self as i64)
    }
}
impl<A: Address> IntoRegister<A> for u32 {
    fn into_register(self) -> A {
        A::from_u32(self)
    }
}
impl<A: Address> IntoRegister<A> for i64 {
    fn into_register(self) -> A {
        A::from_i64(self)
    }
}
impl<A: Address> IntoRegister<A> for u64 {
    fn into_register(self) -> A {
        A::from_u64(self)
    }
}
impl<A: Address> IntoRegister<A> for usize {
    fn into_register(self) -> A {
        A::from_u64(self as u64)
    }
}
