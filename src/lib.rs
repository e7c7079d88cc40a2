/*!

`uriscv` is a user-mode RISC-V machine emulator: it loads a program
image, executes RV32IMAFDC or RV64IMAFDC instructions against a
simulated CPU and a copy-on-write paged memory, and services guest
system calls by translating them to host operations. It is meant to be
embedded in host applications that want to run untrusted or sandboxed
RISC-V code with fine-grained control over memory, system calls and
scheduling budget.

The address width is a type parameter: instantiate `Machine<u32>` for
RV32, `Machine<u64>` for RV64 (or `Machine<u128>` with the `rv128`
feature, which reuses the RV64 decoder at 128-bit register width).

```no_run
use uriscv::{Machine, MachineOptions};

let image = std::fs::read("program.bin").unwrap();
let mut machine: Machine<u64> =
    Machine::new(&image, MachineOptions::default()).unwrap();
machine.setup_linux_syscalls(false, false);
machine.simulate(50_000_000).unwrap();
```

`simulate` runs until the instruction budget is exhausted (resume by
calling it again), the guest exits (`Machine::stop` zeroes the
budget), or a machine exception surfaces. System call handlers are
plain functions installed in a numeric table; the three built-in
profiles (`setup_minimal_syscalls`, `setup_newlib_syscalls`,
`setup_linux_syscalls`) cover statically linked newlib and musl
binaries, and embedders can install their own handlers over them. The
guest's stdout/stderr land in a byte sink closure, stdin is pulled
from a source closure, and the optional file descriptor table keeps
the guest's descriptors virtual with filter callbacks at the host
boundary.

ELF loading is deliberately left to the embedder: `Machine::new` takes
a flat image, and the memory API (`set_page_attr`, `copy_to_guest`)
is sufficient to materialize ELF segments.

# Feature Flags

By default, the `C` and `float` features are enabled.

## `C`

Compiles in the C (compressed instructions) extension. Compressed
parcels are widened to their 32-bit aliases during decode.

## `float`

Compiles in the F and D extensions. Arithmetic goes through
`rustc_apfloat` rather than the host FPU, so guest results do not
depend on the host architecture's floating point quirks.

## `serde`

Implements [Serde](https://serde.rs)'s `Serialize` and `Deserialize`
for `Cpu`, the practical way to save and restore a guest's register
state. Disabled by default because `serde` is a relatively hefty
dependency.

## `rv128`

Implements the address trait for `u128`. Experimental: the RV128-only
instructions are not decoded, but the whole memory and system call
layer works at that width.

*/

mod address;
pub use address::*;
mod cpu;
pub use cpu::*;
#[cfg(feature = "C")]
mod compressed;
mod execution;
mod file_descriptors;
pub use file_descriptors::*;
#[cfg(feature = "float")]
mod float;
mod machine;
pub use machine::*;
mod memory;
pub use memory::*;
mod syscalls;
pub use syscalls::{
    nr, syscall_ebreak, syscall_stub_nosys, syscall_stub_zero, SYSCALL_EBREAK,
};
