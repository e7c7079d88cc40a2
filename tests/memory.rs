//! Paged memory laws: round trips, gather buffers, copy-on-write,
//! attributes, and the brk/mmap arena arithmetic.

mod common;

use common::*;
use uriscv::{
    Machine, MachineException, MachineOptions, PageAttributes, VBuffer,
    PAGE_SIZE, REG_A0, REG_A7,
};

fn empty_machine() -> Machine<u64> {
    Machine::new(&[], MachineOptions::default()).unwrap()
}

#[test]
fn read_write_round_trip() {
    let mut machine = empty_machine();
    let heap = machine.memory.heap_address();
    machine.memory.write::<u8>(heap, 0xAB).unwrap();
    machine.memory.write::<u16>(heap + 2, 0x1234).unwrap();
    machine.memory.write::<u32>(heap + 4, 0xDEAD_BEEF).unwrap();
    machine
        .memory
        .write::<u64>(heap + 8, 0x0123_4567_89AB_CDEF)
        .unwrap();
    assert_eq!(machine.memory.read::<u8>(heap).unwrap(), 0xAB);
    assert_eq!(machine.memory.read::<u16>(heap + 2).unwrap(), 0x1234);
    assert_eq!(machine.memory.read::<u32>(heap + 4).unwrap(), 0xDEAD_BEEF);
    assert_eq!(
        machine.memory.read::<u64>(heap + 8).unwrap(),
        0x0123_4567_89AB_CDEF
    );
}

#[test]
fn writes_straddle_page_boundaries() {
    let mut machine = empty_machine();
    let boundary = machine.memory.heap_address() + PAGE_SIZE as u64 - 2;
    machine.memory.write::<u32>(boundary, 0xCAFE_F00D).unwrap();
    assert_eq!(machine.memory.read::<u32>(boundary).unwrap(), 0xCAFE_F00D);
    assert_eq!(machine.memory.read::<u16>(boundary).unwrap(), 0xF00D);
    assert_eq!(
        machine.memory.read::<u16>(boundary + 2).unwrap(),
        0xCAFE
    );
}

#[test]
fn unmapped_anonymous_reads_are_zero() {
    let machine = empty_machine();
    let heap = machine.memory.heap_address();
    assert_eq!(machine.memory.read::<u64>(heap + 0x100000).unwrap(), 0);
    // Reading materializes nothing.
    assert_eq!(machine.memory.pages_active(), 0);
}

#[test]
fn unmapped_reads_below_the_heap_fault() {
    let machine = empty_machine();
    match machine.memory.read::<u32>(0x1000) {
        Err(MachineException::ProtectionFault { addr }) => {
            assert_eq!(addr, 0x1000)
        }
        other => panic!("expected a protection fault, got {other:?}"),
    }
}

#[test]
fn gather_concatenation_reproduces_the_range() {
    let mut machine = empty_machine();
    let heap = machine.memory.heap_address();
    let pattern: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();
    machine.memory.memcpy_out(heap + 123, &pattern).unwrap();

    let mut buffers = [VBuffer::NULL; 8];
    let cnt = machine
        .memory
        .gather_buffers_from_range(&mut buffers, heap + 123, pattern.len())
        .unwrap();
    assert!(cnt >= 3, "10_000 bytes span at least three pages");

    let mut gathered = Vec::new();
    for buffer in &buffers[..cnt] {
        // SAFETY: the memory is not touched while the slices live.
        gathered.extend_from_slice(unsafe { buffer.as_slice() });
    }
    assert_eq!(gathered, pattern);
}

#[test]
fn gather_of_unmapped_range_returns_zero() {
    let mut machine = empty_machine();
    let mut buffers = [VBuffer::NULL; 4];
    let cnt = machine
        .memory
        .gather_buffers_from_range(&mut buffers, 0x1000, 64)
        .unwrap();
    assert_eq!(cnt, 0);
}

#[test]
fn page_attributes_are_enforced() {
    let mut machine = empty_machine();
    let heap = machine.memory.heap_address();
    machine.memory.write::<u32>(heap, 7).unwrap();
    let read_only = PageAttributes {
        read: true,
        write: false,
        exec: false,
    };
    machine
        .memory
        .set_page_attr(heap, PAGE_SIZE as u64, read_only)
        .unwrap();
    assert!(machine.memory.read::<u32>(heap).is_ok());
    assert!(matches!(
        machine.memory.write::<u32>(heap, 8),
        Err(MachineException::ProtectionFault { .. })
    ));
    // Restoring the write bit unblocks the page.
    machine
        .memory
        .set_page_attr(heap, PAGE_SIZE as u64, PageAttributes::default())
        .unwrap();
    machine.memory.write::<u32>(heap, 8).unwrap();
}

#[test]
fn freed_code_pages_fault_on_access() {
    let mut machine = machine64(&[addi(1, 0, 1)]);
    assert!(machine.memory.read::<u32>(LOAD_ADDRESS).is_ok());
    machine.memory.free_pages(LOAD_ADDRESS, PAGE_SIZE as u64);
    assert!(machine.memory.read::<u32>(LOAD_ADDRESS).is_err());
    assert!(machine.simulate(1).is_err());
}

#[test]
fn executing_unmapped_memory_faults() {
    let mut machine = empty_machine();
    match machine.simulate(1) {
        Err(MachineException::ExecutionSpaceProtectionFault { pc }) => {
            assert_eq!(pc, LOAD_ADDRESS)
        }
        other => panic!("expected an exec fault, got {other:?}"),
    }
}

#[test]
fn data_pages_are_not_executable() {
    let mut machine = empty_machine();
    let heap = machine.memory.heap_address();
    machine.memory.write::<u32>(heap, addi(1, 0, 1)).unwrap();
    machine.cpu.set_pc(heap);
    assert!(matches!(
        machine.simulate(1),
        Err(MachineException::ExecutionSpaceProtectionFault { .. })
    ));
}

#[test]
fn cow_pages_diverge_after_fork() {
    let mut machine = empty_machine();
    let heap = machine.memory.heap_address();
    machine.memory.write::<u32>(heap, 0xAAAA_AAAA).unwrap();

    let mut fork = machine.memory.fork();
    assert_eq!(fork.read::<u32>(heap).unwrap(), 0xAAAA_AAAA);

    fork.write::<u32>(heap, 0xBBBB_BBBB).unwrap();
    assert_eq!(fork.read::<u32>(heap).unwrap(), 0xBBBB_BBBB);
    assert_eq!(machine.memory.read::<u32>(heap).unwrap(), 0xAAAA_AAAA);

    machine.memory.write::<u32>(heap + 4, 0xCCCC_CCCC).unwrap();
    assert_eq!(fork.read::<u32>(heap + 4).unwrap(), 0);
}

#[test]
fn memcstring_stops_at_the_terminator() {
    let mut machine = empty_machine();
    let heap = machine.memory.heap_address();
    machine.memory.memcpy_out(heap, b"/tmp/file\0junk").unwrap();
    assert_eq!(machine.memory.memcstring(heap, 4096).unwrap(), "/tmp/file");
    // A string in untouched anonymous memory reads as empty.
    assert_eq!(
        machine.memory.memcstring(heap + 0x2000, 4096).unwrap(),
        ""
    );
}

#[test]
fn mmap_results_are_monotonic_and_page_aligned() {
    let mut machine = empty_machine();
    machine.setup_newlib_syscalls();
    let arena =
        machine.memory.heap_address() + machine.memory.brk_max();

    let mut results = Vec::new();
    for len in [0x1000u64, 0x3000, 0x2000] {
        machine.cpu.set_reg(REG_A0, 0);
        machine.cpu.set_reg(REG_A0 + 1, len);
        machine.cpu.set_reg(REG_A0 + 2, 3); // PROT_READ|PROT_WRITE
        machine.cpu.set_reg(REG_A0 + 3, 0x22); // MAP_PRIVATE|MAP_ANONYMOUS
        machine.cpu.set_reg(REG_A7, 222);
        machine.system_call(222).unwrap();
        results.push(machine.cpu.reg(REG_A0));
    }
    assert_eq!(results, vec![arena, arena + 0x1000, arena + 0x4000]);
    for result in &results {
        assert_eq!(result % PAGE_SIZE as u64, 0);
    }
}

#[test]
fn mmap_rejects_unaligned_requests() {
    let mut machine = empty_machine();
    machine.setup_newlib_syscalls();
    machine.cpu.set_reg(REG_A0, 0);
    machine.cpu.set_reg(REG_A0 + 1, 100); // not page-sized
    machine.system_call(222).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), u64::MAX); // MAP_FAILED
}

#[test]
fn mmap_hint_at_arena_pointer_advances_it() {
    let mut machine = empty_machine();
    machine.setup_newlib_syscalls();
    let arena =
        machine.memory.heap_address() + machine.memory.brk_max();

    machine.cpu.set_reg(REG_A0, arena);
    machine.cpu.set_reg(REG_A0 + 1, 0x2000);
    machine.system_call(222).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), arena);

    // The next anonymous mapping does not overlap.
    machine.cpu.set_reg(REG_A0, 0);
    machine.cpu.set_reg(REG_A0 + 1, 0x1000);
    machine.system_call(222).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), arena + 0x2000);

    // A hint below the arena pointer fails.
    machine.cpu.set_reg(REG_A0, arena);
    machine.cpu.set_reg(REG_A0 + 1, 0x1000);
    machine.system_call(222).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), u64::MAX);
}

#[test]
fn munmap_retracts_the_tail_but_not_below_the_brk_arena() {
    let mut machine = empty_machine();
    machine.setup_newlib_syscalls();
    let arena =
        machine.memory.heap_address() + machine.memory.brk_max();

    machine.cpu.set_reg(REG_A0, 0);
    machine.cpu.set_reg(REG_A0 + 1, 0x3000);
    machine.system_call(222).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), arena);

    // Unmapping the tail rewinds the arena pointer.
    machine.cpu.set_reg(REG_A0, arena);
    machine.cpu.set_reg(REG_A0 + 1, 0x3000);
    machine.system_call(215).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0);
    machine.cpu.set_reg(REG_A0, 0);
    machine.cpu.set_reg(REG_A0 + 1, 0x1000);
    machine.system_call(222).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), arena);

    // A tail unmapping that reaches below the brk arena clamps the
    // pointer at the arena floor instead of underflowing it. The
    // pointer currently sits at arena + 0x1000 from the mapping above.
    machine.cpu.set_reg(REG_A0, arena - 0x2000);
    machine.cpu.set_reg(REG_A0 + 1, 0x3000);
    machine.system_call(215).unwrap();
    machine.cpu.set_reg(REG_A0, 0);
    machine.cpu.set_reg(REG_A0 + 1, 0x1000);
    machine.system_call(222).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), arena);
}

#[test]
fn mremap_extends_only_the_last_mapping() {
    let mut machine = empty_machine();
    machine.setup_newlib_syscalls();
    let arena =
        machine.memory.heap_address() + machine.memory.brk_max();

    machine.cpu.set_reg(REG_A0, 0);
    machine.cpu.set_reg(REG_A0 + 1, 0x2000);
    machine.system_call(222).unwrap();

    // Grow in place.
    machine.cpu.set_reg(REG_A0, arena);
    machine.cpu.set_reg(REG_A0 + 1, 0x2000);
    machine.cpu.set_reg(REG_A0 + 2, 0x5000);
    machine.system_call(163).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), arena);
    machine.cpu.set_reg(REG_A0, 0);
    machine.cpu.set_reg(REG_A0 + 1, 0x1000);
    machine.system_call(222).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), arena + 0x5000);

    // Anything that is not the tail mapping fails.
    machine.cpu.set_reg(REG_A0, arena);
    machine.cpu.set_reg(REG_A0 + 1, 0x2000);
    machine.cpu.set_reg(REG_A0 + 2, 0x8000);
    machine.system_call(163).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), u64::MAX);
}

#[test]
fn madvise_advice_mapping() {
    let mut machine = empty_machine();
    machine.setup_newlib_syscalls();
    let heap = machine.memory.heap_address();
    machine.memory.write::<u32>(heap, 0x1234_5678).unwrap();

    // WILLNEED is a no-op.
    machine.cpu.set_reg(REG_A0, heap);
    machine.cpu.set_reg(REG_A0 + 1, PAGE_SIZE as u64);
    machine.cpu.set_reg(REG_A0 + 2, 3);
    machine.system_call(233).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0);
    assert_eq!(machine.memory.read::<u32>(heap).unwrap(), 0x1234_5678);

    // DONTNEED frees; anonymous memory reads back as zero.
    machine.cpu.set_reg(REG_A0, heap);
    machine.cpu.set_reg(REG_A0 + 1, PAGE_SIZE as u64);
    machine.cpu.set_reg(REG_A0 + 2, 4);
    machine.system_call(233).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0);
    assert_eq!(machine.memory.read::<u32>(heap).unwrap(), 0);

    // Unknown advice is rejected.
    machine.cpu.set_reg(REG_A0 + 2, 1234);
    machine.system_call(233).unwrap();
    assert_eq!(
        machine.cpu.reg(REG_A0),
        -(libc::EINVAL as i64) as u64
    );
}

#[test]
fn mprotect_applies_prot_bits() {
    let mut machine = empty_machine();
    machine.setup_newlib_syscalls();
    let heap = machine.memory.heap_address();
    machine.memory.write::<u32>(heap, 1).unwrap();

    machine.cpu.set_reg(REG_A0, heap);
    machine.cpu.set_reg(REG_A0 + 1, PAGE_SIZE as u64);
    machine.cpu.set_reg(REG_A0 + 2, 1); // PROT_READ
    machine.system_call(226).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0);
    assert!(machine.memory.write::<u32>(heap, 2).is_err());
    assert_eq!(machine.memory.read::<u32>(heap).unwrap(), 1);
}

#[test]
fn memory_budget_is_enforced() {
    let options = MachineOptions::<u64> {
        memory_max: 4 * PAGE_SIZE as u64,
        ..Default::default()
    };
    let mut machine = Machine::new(&[], options).unwrap();
    let heap = machine.memory.heap_address();
    for page in 0..4u64 {
        machine
            .memory
            .write::<u8>(heap + page * PAGE_SIZE as u64, 1)
            .unwrap();
    }
    assert!(matches!(
        machine.memory.write::<u8>(heap + 4 * PAGE_SIZE as u64, 1),
        Err(MachineException::OutOfMemory { .. })
    ));
}
