//! End-to-end scenarios: programs running through the execution
//! engine into the system call layer.

mod common;

use common::*;
use uriscv::{
    Address, Machine, MachineException, MachineOptions, REG_A0, REG_A7,
    REG_SP,
};

#[test]
fn hello_via_write() {
    let mut machine = machine64(&[ecall()]);
    machine.setup_linux_syscalls(false, false);
    let out = capture_output(&mut machine);

    let buffer = machine.memory.heap_address();
    machine.copy_to_guest(buffer, b"hello\n").unwrap();
    machine.cpu.set_reg(REG_A0, 1);
    machine.cpu.set_reg(REG_A0 + 1, buffer);
    machine.cpu.set_reg(REG_A0 + 2, 6);
    machine.cpu.set_reg(REG_A7, 64);
    machine.simulate(1).unwrap();

    assert_eq!(
        out.lock().unwrap().as_slice(),
        &[0x68, 0x65, 0x6C, 0x6C, 0x6F, 0x0A]
    );
    assert_eq!(machine.cpu.reg(REG_A0), 6);
}

#[test]
fn unknown_syscall_is_enosys() {
    let mut machine = machine64(&[ecall()]);
    machine.setup_linux_syscalls(false, false);
    machine.cpu.set_reg(REG_A7, 999);
    machine.simulate(1).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0).to_i64(), -38);
}

#[test]
fn read_from_bad_fd_is_ebadf() {
    let mut machine = machine64(&[ecall()]);
    machine.setup_minimal_syscalls();
    let buffer = machine.memory.heap_address();
    machine.cpu.set_reg(REG_A0, 42);
    machine.cpu.set_reg(REG_A0 + 1, buffer);
    machine.cpu.set_reg(REG_A0 + 2, 16);
    machine.cpu.set_reg(REG_A7, 63);
    machine.simulate(1).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0).to_i64(), -9);
}

#[test]
fn read_drains_the_stdin_source() {
    let mut machine = machine64(&[ecall()]);
    machine.setup_minimal_syscalls();
    machine.set_stdin_source(Box::new(|buf| {
        let n = buf.len().min(4);
        buf[..n].copy_from_slice(&b"data"[..n]);
        n
    }));
    let buffer = machine.memory.heap_address();
    machine.cpu.set_reg(REG_A0, 0);
    machine.cpu.set_reg(REG_A0 + 1, buffer);
    machine.cpu.set_reg(REG_A0 + 2, 16);
    machine.cpu.set_reg(REG_A7, 63);
    machine.simulate(1).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 4);
    let mut readback = [0u8; 4];
    machine.copy_from_guest(&mut readback, buffer).unwrap();
    assert_eq!(&readback, b"data");
}

#[test]
fn writev_concatenates_iovecs() {
    let mut machine = machine64(&[ecall()]);
    machine.setup_linux_syscalls(false, false);
    let out = capture_output(&mut machine);

    let heap = machine.memory.heap_address();
    machine.copy_to_guest(heap, b"foo").unwrap();
    machine.copy_to_guest(heap + 8, b"bars").unwrap();
    // Two iovecs at heap + 64.
    let iov = heap + 64;
    let entries: [u64; 4] = [heap, 3, heap + 8, 4];
    let mut bytes = Vec::new();
    for entry in entries {
        bytes.extend_from_slice(&entry.to_le_bytes());
    }
    machine.copy_to_guest(iov, &bytes).unwrap();

    machine.cpu.set_reg(REG_A0, 1);
    machine.cpu.set_reg(REG_A0 + 1, iov);
    machine.cpu.set_reg(REG_A0 + 2, 2);
    machine.cpu.set_reg(REG_A7, 66);
    machine.simulate(1).unwrap();

    assert_eq!(out.lock().unwrap().as_slice(), b"foobars");
    assert_eq!(machine.cpu.reg(REG_A0), 7);
}

#[test]
fn writev_rejects_out_of_range_counts() {
    let mut machine = machine64(&[ecall()]);
    machine.setup_linux_syscalls(false, false);
    machine.cpu.set_reg(REG_A0, 1);
    machine.cpu.set_reg(REG_A0 + 2, 257);
    machine.cpu.set_reg(REG_A7, 66);
    machine.simulate(1).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0).to_i64(), -(libc::EINVAL as i64));
}

#[test]
fn c_andi_covers_all_immediates() {
    for imm in 0..64i32 {
        let sign_extended = (imm << 26) >> 26;
        let half = c_andi(2, imm); // rd' 2 is a0
        let mut machine: Machine<u32> =
            Machine::new(&half.to_le_bytes(), MachineOptions::default())
                .expect("machine construction");
        machine.cpu.set_reg(REG_A0, 0xFFFF_FFFF);
        machine.simulate(1).unwrap();
        assert_eq!(
            machine.cpu.reg(REG_A0),
            0xFFFF_FFFFu32 & sign_extended as u32,
            "c.andi immediate {imm}"
        );
    }
}

#[test]
fn brk_clamps_to_the_arena() {
    let options = MachineOptions::<u64> {
        brk_max: 0x1000,
        ..Default::default()
    };
    let mut machine = Machine::new(&[], options).unwrap();
    machine.setup_newlib_syscalls();
    assert_eq!(machine.memory.heap_address(), 0x10000);

    machine.cpu.set_reg(REG_A0, 0x1000);
    machine.cpu.set_reg(REG_A7, 214);
    machine.system_call(214).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0x10000);

    machine.cpu.set_reg(REG_A0, 0x20000);
    machine.system_call(214).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0x11000);

    // Idempotence, and brk(0) reports the current break.
    machine.cpu.set_reg(REG_A0, 0x20000);
    machine.system_call(214).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0x11000);
    machine.cpu.set_reg(REG_A0, 0);
    machine.system_call(214).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0x11000);
}

#[test]
fn uname_reports_the_isa_string() {
    let mut machine = Machine::<u64>::new(&[], MachineOptions::default())
        .unwrap();
    machine.setup_linux_syscalls(false, false);
    let buffer = machine.memory.heap_address();
    machine.cpu.set_reg(REG_A0, buffer);
    machine.system_call(160).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0);

    let mut field = [0u8; 65];
    machine
        .copy_from_guest(&mut field, buffer + 4 * 65)
        .unwrap();
    assert_eq!(&field[..10], b"rv64imafdc");
    assert!(field[10..].iter().all(|&b| b == 0));

    let mut sysname = [0u8; 19];
    machine.copy_from_guest(&mut sysname, buffer).unwrap();
    assert_eq!(&sysname, b"RISC-V C++ Emulator");
}

#[test]
fn register_zero_ignores_writes() {
    let mut machine = machine64(&[addi(0, 0, 5), addi(1, 0, 7)]);
    machine.simulate(2).unwrap();
    assert_eq!(machine.cpu.reg(0), 0);
    assert_eq!(machine.cpu.reg(1), 7);
}

#[test]
fn pc_advances_by_instruction_width() {
    let mut machine = machine64(&[addi(1, 0, 1)]);
    machine.simulate(1).unwrap();
    assert_eq!(machine.cpu.pc(), LOAD_ADDRESS + 4);

    let mut machine: Machine<u64> =
        Machine::new(&c_nop().to_le_bytes(), MachineOptions::default())
            .unwrap();
    machine.simulate(1).unwrap();
    assert_eq!(machine.cpu.pc(), LOAD_ADDRESS + 2);
}

#[test]
fn budget_bounds_execution_and_resumes() {
    let program: Vec<u32> = (0..8).map(|_| addi(1, 1, 1)).collect();
    let mut machine = machine64(&program);
    machine.simulate(3).unwrap();
    assert_eq!(machine.instruction_counter(), 3);
    assert_eq!(machine.cpu.reg(1), 3);
    assert_eq!(machine.cpu.pc(), LOAD_ADDRESS + 12);

    machine.simulate(2).unwrap();
    assert_eq!(machine.instruction_counter(), 5);
    assert_eq!(machine.cpu.reg(1), 5);
}

#[test]
fn exit_stops_the_machine_mid_budget() {
    let mut machine = machine64(&[ecall(), addi(1, 0, 1)]);
    machine.setup_minimal_syscalls();
    machine.cpu.set_reg(REG_A7, 93);
    machine.simulate(100).unwrap();
    // Only the ecall retired; the addi never ran.
    assert_eq!(machine.instruction_counter(), 1);
    assert_eq!(machine.cpu.reg(1), 0);
}

#[test]
fn ebreak_without_debug_hook_traps() {
    let mut machine = machine64(&[ebreak()]);
    machine.setup_minimal_syscalls();
    match machine.simulate(1) {
        Err(MachineException::UnhandledSyscall { number, .. }) => {
            assert_eq!(number, 0);
        }
        other => panic!("expected an unhandled-syscall trap, got {other:?}"),
    }
}

#[test]
fn illegal_instruction_reports_pc_and_bits() {
    let mut machine = machine64(&[0xFFFF_FFFF]);
    match machine.simulate(1) {
        Err(MachineException::IllegalOpcode { pc, bits }) => {
            assert_eq!(pc, LOAD_ADDRESS);
            assert_eq!(bits, 0xFFFF_FFFF);
        }
        other => panic!("expected an illegal-opcode trap, got {other:?}"),
    }
}

#[test]
fn branch_loop_runs_to_completion() {
    // a0 counts to a1 == 5.
    let program = [
        addi(10, 0, 0),
        addi(11, 0, 5),
        addi(10, 10, 1),
        blt(10, 11, -4),
        ecall(),
    ];
    let mut machine = machine64(&program);
    machine.setup_minimal_syscalls();
    machine.cpu.set_reg(REG_A7, 93);
    machine.simulate(1000).unwrap();
    assert_eq!(machine.cpu.reg(10), 5);
}

#[test]
fn division_edge_cases_via_instructions() {
    // div a0, a1, a2 with a2 = 0 yields all ones.
    let mut machine = machine64(&[div(10, 11, 12)]);
    machine.cpu.set_reg(11, 1234);
    machine.cpu.set_reg(12, 0);
    machine.simulate(1).unwrap();
    assert_eq!(machine.cpu.reg(10), u64::MAX);

    // Overflow: i64::MIN / -1 yields i64::MIN.
    let mut machine = machine64(&[div(10, 11, 12)]);
    machine.cpu.set_reg(11, i64::MIN as u64);
    machine.cpu.set_reg(12, -1i64 as u64);
    machine.simulate(1).unwrap();
    assert_eq!(machine.cpu.reg(10), i64::MIN as u64);
}

#[test]
fn word_ops_sign_extend() {
    let mut machine = machine64(&[addiw(10, 0, -1)]);
    machine.simulate(1).unwrap();
    assert_eq!(machine.cpu.reg(10), u64::MAX);

    // mul of 32-bit values stays 64-bit wide with MUL proper.
    let mut machine = machine64(&[mul(10, 11, 12)]);
    machine.cpu.set_reg(11, 0x1_0000_0000);
    machine.cpu.set_reg(12, 2);
    machine.simulate(1).unwrap();
    assert_eq!(machine.cpu.reg(10), 0x2_0000_0000);
}

#[test]
fn loads_and_stores_round_trip_through_the_program() {
    // sw a1, 0(a0); lw a2, 0(a0)
    let program = [sw(10, 11, 0), lw(12, 10, 0)];
    let mut machine = machine64(&program);
    let heap = machine.memory.heap_address();
    machine.cpu.set_reg(10, heap);
    machine.cpu.set_reg(11, 0xDEAD_BEEF);
    machine.simulate(2).unwrap();
    // lw sign-extends.
    assert_eq!(machine.cpu.reg(12), 0xFFFF_FFFF_DEAD_BEEF);
}

#[test]
fn sighandler_is_recorded_not_invoked() {
    let mut machine = Machine::<u64>::new(&[], MachineOptions::default())
        .unwrap();
    machine.setup_linux_syscalls(false, false);
    let buffer = machine.memory.heap_address();
    // A guest sigaction whose first field is the handler address.
    machine
        .copy_to_guest(buffer, &0x4242_4242u64.to_le_bytes())
        .unwrap();
    machine.cpu.set_reg(REG_A0, 11); // SIGSEGV
    machine.cpu.set_reg(REG_A0 + 1, buffer);
    machine.system_call(134).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0);
    assert_eq!(machine.sighandler(), 0x4242_4242);

    // Non-exception signals are accepted but not recorded.
    machine.set_sighandler(0);
    machine.cpu.set_reg(REG_A0, 15); // SIGTERM
    machine.system_call(134).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0);
    assert_eq!(machine.sighandler(), 0);
}

#[test]
fn stack_pointer_is_primed() {
    let machine = machine64(&[]);
    assert_eq!(machine.cpu.reg(REG_SP), machine.memory.stack_initial());
    assert_eq!(machine.cpu.reg(REG_SP) & 0xFFF, 0);
}

#[test]
fn standard_streams_never_resolve_to_host_fds() {
    let mut machine = machine64(&[ecall()]);
    machine.setup_linux_syscalls(true, false);
    if let Some(fds) = machine.fds_mut() {
        fds.permit_file_write = true;
    }
    let buffer = machine.memory.heap_address();

    // read(1, ...) and read(2, ...): the table is only consulted for
    // vfd >= 3, so these are bad descriptors even with a table
    // installed.
    for vfd in [1u64, 2] {
        machine.cpu.set_reg(REG_A0, vfd);
        machine.cpu.set_reg(REG_A0 + 1, buffer);
        machine.cpu.set_reg(REG_A0 + 2, 8);
        machine.system_call(63).unwrap();
        assert_eq!(machine.cpu.reg(REG_A0).to_i64(), -9, "read({vfd})");
    }

    // write(0, ...) stays -EBADF even with file writes permitted.
    machine.copy_to_guest(buffer, b"x").unwrap();
    machine.cpu.set_reg(REG_A0, 0);
    machine.cpu.set_reg(REG_A0 + 1, buffer);
    machine.cpu.set_reg(REG_A0 + 2, 1);
    machine.system_call(64).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0).to_i64(), -9);

    // writev(0, ...) likewise.
    let iov = buffer + 64;
    let mut entry = Vec::new();
    entry.extend_from_slice(&buffer.to_le_bytes());
    entry.extend_from_slice(&1u64.to_le_bytes());
    machine.copy_to_guest(iov, &entry).unwrap();
    machine.cpu.set_reg(REG_A0, 0);
    machine.cpu.set_reg(REG_A0 + 1, iov);
    machine.cpu.set_reg(REG_A0 + 2, 1);
    machine.system_call(66).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0).to_i64(), -9);
}

#[test]
fn filesystem_flag_gates_openat() {
    // A sockets-only table must refuse filesystem opens.
    let mut machine = Machine::<u64>::new(&[], MachineOptions::default())
        .unwrap();
    machine.setup_linux_syscalls(false, true);
    assert!(machine.has_file_descriptors());
    let path = machine.memory.heap_address();
    machine.copy_to_guest(path, b"/dev/null\0").unwrap();
    machine.cpu.set_reg(REG_A0, -100i64 as u64); // AT_FDCWD
    machine.cpu.set_reg(REG_A0 + 1, path);
    machine.cpu.set_reg(REG_A0 + 2, 0); // O_RDONLY
    machine.system_call(56).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0).to_i64(), -9);

    // With the filesystem enabled the same open hands out vfd 3.
    let mut machine = Machine::<u64>::new(&[], MachineOptions::default())
        .unwrap();
    machine.setup_linux_syscalls(true, false);
    let path = machine.memory.heap_address();
    machine.copy_to_guest(path, b"/dev/null\0").unwrap();
    machine.cpu.set_reg(REG_A0, -100i64 as u64);
    machine.cpu.set_reg(REG_A0 + 1, path);
    machine.cpu.set_reg(REG_A0 + 2, 0);
    machine.system_call(56).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 3);

    machine.cpu.set_reg(REG_A0, 3);
    machine.system_call(57).unwrap();
    assert_eq!(machine.cpu.reg(REG_A0), 0);
}

#[test]
fn fork_shares_syscall_table_and_registers() {
    let mut machine = machine64(&[ecall()]);
    machine.setup_linux_syscalls(false, false);
    machine.cpu.set_reg(REG_A7, 999);
    let mut fork = machine.fork();
    fork.simulate(1).unwrap();
    assert_eq!(fork.cpu.reg(REG_A0).to_i64(), -38);
    // The original has not executed anything.
    assert_eq!(machine.instruction_counter(), 0);
}
