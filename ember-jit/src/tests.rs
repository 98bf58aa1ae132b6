//! Engine-level tests driving the dispatcher, block store and generated
//! code together through the raw-IR lifter.

use std::sync::atomic::Ordering;

use ember_cpu::{
    Cpu, ExceptionCode, GuestMemory, IrInst, IrOp, RawIrLifter, GUEST_INST_BYTES,
};

use crate::backend::BlockEnd;
use crate::dispatch::{Dispatcher, VmExit};
use crate::{CompileError, Jit, JitOptions};

const RAM_BASE: u32 = 0x1000;
const RAM_SIZE: usize = 0x8000;

fn inst(op: IrOp, dest: u8, src1: u8, src2: u8, imm: u32) -> IrInst {
    IrInst::new(op, dest, src1, src2, imm)
}

fn write_program(mem: &mut GuestMemory, addr: u32, insts: &[IrInst]) {
    for (i, ir) in insts.iter().enumerate() {
        mem.write_u64(addr + i as u32 * GUEST_INST_BYTES, ir.encode()).unwrap();
    }
}

fn new_cpu() -> Box<Cpu> {
    Cpu::new(GuestMemory::new(RAM_BASE, RAM_SIZE))
}

fn new_jit() -> Jit {
    Jit::new(JitOptions { code_size: 0x20000, ..JitOptions::default() }).unwrap()
}

fn refill(amount: i64) -> Dispatcher {
    Dispatcher::new(move |cpu: &mut Cpu| cpu.downcount = amount)
}

#[test]
fn compiles_and_executes_straight_line_code() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    write_program(&mut cpu.mem, 0x2000, &[
        inst(IrOp::SetConst, 1, 0, 0, 5),
        inst(IrOp::SetConst, 2, 0, 0, 37),
        inst(IrOp::Add, 3, 1, 2, 0),
        inst(IrOp::SltImm, 4, 3, 0, 100),
        inst(IrOp::ExitToConst, 0, 0, 0, 0x7000),
    ]);

    let entry = jit.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
    cpu.downcount = 100;
    assert_eq!(jit.enter(entry, &mut cpu), BlockEnd::Dispatch);
    assert_eq!(cpu.regs.gpr[3], 42);
    assert_eq!(cpu.regs.gpr[4], 1);
    assert_eq!(cpu.read_pc(), 0x7000);
    assert_eq!(cpu.icount, 5);
}

#[test]
fn generated_code_matches_the_interpreter() {
    let program = [
        inst(IrOp::SetConst, 1, 0, 0, 0xffff_fff0),
        inst(IrOp::AddImm, 2, 1, 0, 0x30),
        inst(IrOp::Sub, 3, 2, 1, 0),
        inst(IrOp::Xor, 4, 1, 2, 0),
        inst(IrOp::SarImm, 5, 1, 0, 3),
        inst(IrOp::Mul, 6, 2, 3, 0),
        inst(IrOp::SltU, 7, 1, 2, 0),
        inst(IrOp::Store32, 4, 0, 0, RAM_BASE + 0x100),
        inst(IrOp::Load16, 8, 0, 0, RAM_BASE + 0x100),
        inst(IrOp::ExitToConst, 0, 0, 0, 0x7000),
    ];

    let mut reference = new_cpu();
    for ir in &program {
        if ember_cpu::interp::interpret(&mut reference, *ir) {
            break;
        }
    }

    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;
    write_program(&mut cpu.mem, 0x2000, &program);
    let entry = jit.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
    cpu.downcount = 100;
    assert_eq!(jit.enter(entry, &mut cpu), BlockEnd::Dispatch);

    assert_eq!(cpu.regs.gpr, reference.regs.gpr);
    assert_eq!(cpu.mem.read_u32(RAM_BASE + 0x100).unwrap(), cpu.regs.gpr[4]);
}

#[test]
fn float_and_vector_ops_round_trip() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    // Vector ops take the interpreter fallback; floats are specialized.
    write_program(&mut cpu.mem, 0x2000, &[
        inst(IrOp::FAdd, 2, 0, 1, 0),
        inst(IrOp::FMul, 3, 2, 2, 0),
        inst(IrOp::FSqrt, 4, 3, 0, 0),
        inst(IrOp::FCmpLt, 5, 0, 2, 0),
        inst(IrOp::Vec4Add, 8, 12, 16, 0),
        inst(IrOp::ExitToConst, 0, 0, 0, 0x7000),
    ]);
    cpu.regs.fpr[0] = 1.5;
    cpu.regs.fpr[1] = 2.5;
    for lane in 0..4 {
        cpu.regs.fpr[12 + lane] = lane as f32;
        cpu.regs.fpr[16 + lane] = 10.0;
    }

    let entry = jit.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
    cpu.downcount = 100;
    assert_eq!(jit.enter(entry, &mut cpu), BlockEnd::Dispatch);

    assert_eq!(cpu.regs.fpr[2], 4.0);
    assert_eq!(cpu.regs.fpr[3], 16.0);
    assert_eq!(cpu.regs.fpr[4], 4.0);
    assert_eq!(cpu.regs.gpr[5], 1);
    for lane in 0..4 {
        assert_eq!(cpu.regs.fpr[8 + lane], 10.0 + lane as f32);
    }
}

#[test]
fn register_pressure_spills_and_restores() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    // More live values than the backend has integer registers.
    let mut program = Vec::new();
    for i in 0..12u8 {
        program.push(inst(IrOp::SetConst, i + 1, 0, 0, 1000 + i as u32));
    }
    for i in 0..12u8 {
        program.push(inst(IrOp::AddImm, i + 13, i + 1, 0, 1));
    }
    program.push(inst(IrOp::ExitToConst, 0, 0, 0, 0x7000));
    write_program(&mut cpu.mem, 0x2000, &program);

    let entry = jit.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
    cpu.downcount = 100;
    assert_eq!(jit.enter(entry, &mut cpu), BlockEnd::Dispatch);
    for i in 0..12usize {
        assert_eq!(cpu.regs.gpr[i + 1], 1000 + i as u32);
        assert_eq!(cpu.regs.gpr[i + 13], 1001 + i as u32);
    }
}

#[test]
fn dispatcher_runs_a_linked_loop_to_completion() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    write_program(&mut cpu.mem, 0x2000, &[
        inst(IrOp::Downcount, 0, 0, 0, 1),
        inst(IrOp::AddImm, 1, 1, 0, 1),
        inst(IrOp::SltImm, 2, 1, 0, 10),
        inst(IrOp::ExitIfNeq, 0, 2, 0, 0x2000),
        inst(IrOp::ExitToConst, 0, 0, 0, 0x3000),
    ]);
    write_program(&mut cpu.mem, 0x3000, &[inst(IrOp::Syscall, 0, 0, 0, 0x9999)]);

    cpu.write_pc(0x2000);
    let mut dispatcher = refill(4);
    let exit = dispatcher.run(&mut jit, &mut cpu, &mut lifter);

    match exit {
        VmExit::Exception(e) => assert_eq!(e.code, ExceptionCode::Syscall as u32),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert_eq!(cpu.regs.gpr[1], 10);
    assert_eq!(cpu.read_pc(), 0x9999);

    // The loop edge was compiled once and self-linked; ten iterations did
    // not mean ten lookups.
    let stats = jit.stats();
    assert_eq!(stats.blocks_compiled.load(Ordering::Relaxed), 2);
    assert!(stats.lookup_misses.load(Ordering::Relaxed) <= 2);
}

#[test]
fn pending_exits_link_once_the_target_compiles() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    // Two outbound exits to the same not-yet-compiled target.
    write_program(&mut cpu.mem, 0x2000, &[
        inst(IrOp::ExitIfEq, 0, 1, 0, 0x3000),
        inst(IrOp::ExitToConst, 0, 0, 0, 0x3000),
    ]);
    write_program(&mut cpu.mem, 0x3000, &[
        inst(IrOp::SetConst, 9, 0, 0, 7),
        inst(IrOp::Syscall, 0, 0, 0, 0x9999),
    ]);

    jit.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
    let id = jit.store().find(0x2000).unwrap();
    {
        let block = jit.store().get(id).unwrap();
        assert_eq!(block.exits.len(), 2);
        assert!(block.exits.iter().all(|e| e.target == 0x3000 && !e.linked));
    }

    // First run takes the fallthrough exit and faults the target in.
    cpu.write_pc(0x2000);
    cpu.regs.gpr[1] = 1;
    let mut dispatcher = refill(8);
    match dispatcher.run(&mut jit, &mut cpu, &mut lifter) {
        VmExit::Exception(e) => assert_eq!(e.code, ExceptionCode::Syscall as u32),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert!(jit.store().get(id).unwrap().exits.iter().all(|e| e.linked));

    // Second run, now through the conditional exit: one `enter` chains both
    // blocks without returning to the dispatcher.
    let entry = jit.lookup(0x2000).unwrap();
    cpu.exception.clear();
    cpu.regs.gpr[1] = 0;
    cpu.regs.gpr[9] = 0;
    cpu.downcount = 8;
    cpu.write_pc(0x2000);
    assert_eq!(jit.enter(entry, &mut cpu), BlockEnd::Exception);
    assert_eq!(cpu.regs.gpr[9], 7);
    assert_eq!(cpu.read_pc(), 0x9999);
}

#[test]
fn invalidation_unlinks_and_trampolines() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    write_program(&mut cpu.mem, 0x2000, &[inst(IrOp::ExitToConst, 0, 0, 0, 0x3000)]);
    write_program(&mut cpu.mem, 0x3000, &[
        inst(IrOp::SetConst, 9, 0, 0, 7),
        inst(IrOp::Syscall, 0, 0, 0, 0x9999),
    ]);

    let entry_a = jit.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
    let entry_x = jit.compile(&mut lifter, &cpu.mem, 0x3000).unwrap();
    let id_a = jit.store().find(0x2000).unwrap();
    let id_x = jit.store().find(0x3000).unwrap();
    assert!(jit.store().get(id_a).unwrap().exits[0].linked);

    jit.invalidate(id_x);
    assert!(jit.store().find(0x3000).is_none());
    assert!(!jit.store().get(id_a).unwrap().exits[0].linked);

    // The source block now falls back to the dispatcher instead of chaining
    // into stale code.
    cpu.downcount = 8;
    assert_eq!(jit.enter(entry_a, &mut cpu), BlockEnd::Dispatch);
    assert_eq!(cpu.read_pc(), 0x3000);
    assert_eq!(cpu.regs.gpr[9], 0);

    // Stale callers that still jump at the invalidated entry execute the
    // trampoline and land back in the dispatcher with the right PC.
    cpu.write_pc(0);
    assert_eq!(jit.enter(entry_x, &mut cpu), BlockEnd::Dispatch);
    assert_eq!(cpu.read_pc(), 0x3000);

    // Invalidating the same id again is a no-op.
    jit.invalidate(id_x);
    assert!(jit.store().get(id_x).is_none());
}

#[test]
fn guest_write_recompiles_with_new_code() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    write_program(&mut cpu.mem, 0x2000, &[
        inst(IrOp::SetConst, 1, 0, 0, 111),
        inst(IrOp::Syscall, 0, 0, 0, 0x9999),
    ]);

    cpu.write_pc(0x2000);
    let mut dispatcher = refill(8);
    match dispatcher.run(&mut jit, &mut cpu, &mut lifter) {
        VmExit::Exception(e) => assert_eq!(e.code, ExceptionCode::Syscall as u32),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert_eq!(cpu.regs.gpr[1], 111);

    // A second thread observes the guest write and posts the range.
    write_program(&mut cpu.mem, 0x2000, &[inst(IrOp::SetConst, 1, 0, 0, 222)]);
    let queue = dispatcher.invalidation_queue();
    std::thread::spawn(move || queue.request(0x2000, GUEST_INST_BYTES))
        .join()
        .unwrap();

    cpu.exception.clear();
    cpu.write_pc(0x2000);
    match dispatcher.run(&mut jit, &mut cpu, &mut lifter) {
        VmExit::Exception(e) => assert_eq!(e.code, ExceptionCode::Syscall as u32),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert_eq!(cpu.regs.gpr[1], 222);
    assert_eq!(jit.stats().blocks_compiled.load(Ordering::Relaxed), 2);
    assert_eq!(jit.stats().blocks_invalidated.load(Ordering::Relaxed), 1);
}

#[test]
fn recompilation_reproduces_observable_behavior() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    write_program(&mut cpu.mem, 0x2000, &[
        inst(IrOp::SetConst, 1, 0, 0, 0x1234),
        inst(IrOp::AddImm, 2, 1, 0, 0x10),
        inst(IrOp::Store32, 2, 0, 0, RAM_BASE + 0x40),
        inst(IrOp::ExitToConst, 0, 0, 0, 0x7000),
    ]);

    let entry = jit.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
    cpu.downcount = 100;
    jit.enter(entry, &mut cpu);
    let first = (cpu.regs.gpr, cpu.mem.read_u32(RAM_BASE + 0x40).unwrap(), cpu.read_pc());

    let id = jit.store().find(0x2000).unwrap();
    jit.invalidate(id);

    let mut cpu = new_cpu();
    write_program(&mut cpu.mem, 0x2000, &[
        inst(IrOp::SetConst, 1, 0, 0, 0x1234),
        inst(IrOp::AddImm, 2, 1, 0, 0x10),
        inst(IrOp::Store32, 2, 0, 0, RAM_BASE + 0x40),
        inst(IrOp::ExitToConst, 0, 0, 0, 0x7000),
    ]);
    let entry = jit.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
    cpu.downcount = 100;
    jit.enter(entry, &mut cpu);
    let second = (cpu.regs.gpr, cpu.mem.read_u32(RAM_BASE + 0x40).unwrap(), cpu.read_pc());

    assert_eq!(first, second);
}

#[test]
fn exhaustion_fails_cleanly_and_clear_recovers() {
    // Size the arena so two large blocks fit and a third cannot.
    let mut probe = Jit::new(JitOptions { code_size: 0x10000, ..JitOptions::default() }).unwrap();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    let big_block = |exit: u32| {
        let mut program = Vec::new();
        for i in 0..80u8 {
            program.push(inst(IrOp::SetConst, i % 24, 0, 0, i as u32));
        }
        program.push(inst(IrOp::ExitToConst, 0, 0, 0, exit));
        program
    };

    write_program(&mut cpu.mem, 0x2000, &big_block(0x3000));
    let used_before = probe.arena().cursor();
    probe.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
    let block_bytes = probe.arena().cursor() - used_before;

    let mut jit =
        Jit::new(JitOptions { code_size: used_before + 2 * block_bytes + 40, ..Default::default() })
            .unwrap();
    write_program(&mut cpu.mem, 0x3000, &big_block(0x4000));
    write_program(&mut cpu.mem, 0x4000, &big_block(0x2000));

    jit.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
    jit.compile(&mut lifter, &cpu.mem, 0x3000).unwrap();
    let cursor_after_two = jit.arena().cursor();

    // The third block must fail cleanly: no partial code, cursor unmoved,
    // tail still poisoned.
    match jit.compile(&mut lifter, &cpu.mem, 0x4000) {
        Err(CompileError::Code(_)) => {}
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(jit.arena().cursor(), cursor_after_two);
    let trap = jit.arena().trap_byte();
    assert!(jit.arena().exec_slice()[cursor_after_two..].iter().all(|&b| b == trap));

    // A full clear makes the compile succeed and unmaps the earlier blocks.
    jit.clear_all();
    jit.compile(&mut lifter, &cpu.mem, 0x4000).unwrap();
    assert!(jit.store().find(0x2000).is_none());
    assert!(jit.store().find(0x3000).is_none());
    assert!(jit.store().find(0x4000).is_some());
}

#[test]
fn dispatcher_self_heals_exhaustion() {
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    // Chain of three fat blocks, sized so the third forces a clear+retry.
    let big_block = |last: IrInst| {
        let mut program = Vec::new();
        for i in 0..80u8 {
            program.push(inst(IrOp::SetConst, i % 24, 0, 0, i as u32));
        }
        program.push(last);
        program
    };
    write_program(&mut cpu.mem, 0x2000, &big_block(inst(IrOp::ExitToConst, 0, 0, 0, 0x3000)));
    write_program(&mut cpu.mem, 0x3000, &big_block(inst(IrOp::ExitToConst, 0, 0, 0, 0x4000)));
    write_program(&mut cpu.mem, 0x4000, &big_block(inst(IrOp::Syscall, 0, 0, 0, 0x9999)));

    let mut probe = Jit::new(JitOptions { code_size: 0x10000, ..JitOptions::default() }).unwrap();
    let base = probe.arena().cursor();
    probe.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
    let block_bytes = probe.arena().cursor() - base;

    let mut jit =
        Jit::new(JitOptions { code_size: base + 2 * block_bytes + 40, ..Default::default() })
            .unwrap();
    cpu.write_pc(0x2000);
    let mut dispatcher = refill(1000);
    match dispatcher.run(&mut jit, &mut cpu, &mut lifter) {
        VmExit::Exception(e) => assert_eq!(e.code, ExceptionCode::Syscall as u32),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert_eq!(jit.stats().cache_clears.load(Ordering::Relaxed), 1);
}

#[test]
fn computed_exits_go_through_the_dispatcher() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    write_program(&mut cpu.mem, 0x2000, &[
        inst(IrOp::SetConst, 5, 0, 0, 0x3000),
        inst(IrOp::ExitToReg, 0, 5, 0, 0),
    ]);
    write_program(&mut cpu.mem, 0x3000, &[inst(IrOp::Break, 0, 0, 0, 0x3000)]);

    cpu.write_pc(0x2000);
    let mut dispatcher = refill(8);
    match dispatcher.run(&mut jit, &mut cpu, &mut lifter) {
        VmExit::Exception(e) => {
            assert_eq!(e.code, ExceptionCode::Break as u32);
            assert_eq!(e.value, 0x3000);
        }
        other => panic!("unexpected exit: {other:?}"),
    }
    // Computed exits never get link records.
    let id = jit.store().find(0x2000).unwrap();
    assert!(jit.store().get(id).unwrap().exits.is_empty());
}

#[test]
fn guest_faults_surface_with_the_faulting_address() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    write_program(&mut cpu.mem, 0x2000, &[
        inst(IrOp::SetConst, 1, 0, 0, 0x9000_0000),
        inst(IrOp::Load32, 2, 1, 0, 4),
        inst(IrOp::ExitToConst, 0, 0, 0, 0x7000),
    ]);

    cpu.write_pc(0x2000);
    let mut dispatcher = refill(8);
    match dispatcher.run(&mut jit, &mut cpu, &mut lifter) {
        VmExit::Exception(e) => {
            assert_eq!(e.code, ExceptionCode::ReadFault as u32);
            assert_eq!(e.value, 0x9000_0004);
        }
        other => panic!("unexpected exit: {other:?}"),
    }
}

#[test]
fn stop_flag_halts_at_a_yield_point() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    let mut dispatcher = refill(8);
    let stop = dispatcher.stop_flag();
    std::thread::spawn(move || stop.store(true, Ordering::Relaxed)).join().unwrap();
    match dispatcher.run(&mut jit, &mut cpu, &mut lifter) {
        VmExit::Halt => {}
        other => panic!("unexpected exit: {other:?}"),
    }
}

#[test]
fn starved_budget_exits_after_outer_advance() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    let mut dispatcher = Dispatcher::new(|_: &mut Cpu| {});
    match dispatcher.run(&mut jit, &mut cpu, &mut lifter) {
        VmExit::InstructionLimit => {}
        other => panic!("unexpected exit: {other:?}"),
    }
}

#[test]
fn unmapped_pc_reports_a_lift_error() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    cpu.write_pc(0xdead_0000);
    let mut dispatcher = refill(8);
    match dispatcher.run(&mut jit, &mut cpu, &mut lifter) {
        VmExit::Lift(ember_cpu::LiftError::BadAddress(0xdead_0000)) => {}
        other => panic!("unexpected exit: {other:?}"),
    }
}

#[test]
fn describe_offset_labels_everything() {
    let mut jit = new_jit();
    let mut cpu = new_cpu();
    let mut lifter = RawIrLifter;

    write_program(&mut cpu.mem, 0x2000, &[inst(IrOp::ExitToConst, 0, 0, 0, 0x7000)]);
    let entry = jit.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();

    assert_eq!(jit.describe_offset(0), "dispatcher");
    let label = jit.describe_offset(entry);
    assert!(label.contains("block") && label.contains("0x00002000"), "got: {label}");
    assert_eq!(jit.describe_offset(u32::MAX), "outside generated code");

    let block_end = {
        let id = jit.store().find(0x2000).unwrap();
        let block = jit.store().get(id).unwrap();
        block.checked_offset + block.code_len
    };
    assert_eq!(jit.guest_addr_for_offset(entry), Some(0x2000));
    assert_eq!(jit.guest_addr_for_offset(block_end - 1), Some(0x2000));
    assert_eq!(jit.guest_addr_for_offset(u32::MAX), None);

    let id = jit.store().find(0x2000).unwrap();
    jit.invalidate(id);
    assert!(jit.describe_offset(entry).contains("invalidated block"));

    let stats = jit.cache_stats();
    assert_eq!(stats.blocks, 1);
    assert_eq!(stats.valid_blocks, 0);
}

#[test]
fn forced_flush_mode_produces_identical_results() {
    let program = [
        inst(IrOp::SetConst, 1, 0, 0, 9),
        inst(IrOp::AddImm, 2, 1, 0, 3),
        inst(IrOp::Mul, 3, 1, 2, 0),
        inst(IrOp::ExitToConst, 0, 0, 0, 0x7000),
    ];

    let mut results = Vec::new();
    for always_flush_regs in [false, true] {
        let mut jit = Jit::new(JitOptions {
            code_size: 0x20000,
            always_flush_regs,
            ..JitOptions::default()
        })
        .unwrap();
        let mut cpu = new_cpu();
        let mut lifter = RawIrLifter;
        write_program(&mut cpu.mem, 0x2000, &program);
        let entry = jit.compile(&mut lifter, &cpu.mem, 0x2000).unwrap();
        cpu.downcount = 100;
        assert_eq!(jit.enter(entry, &mut cpu), BlockEnd::Dispatch);
        results.push(cpu.regs.gpr);
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0][3], 108);
}
