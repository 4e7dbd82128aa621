#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use norvault_core::{EngineBuilder, FlashLayout, MemoryFlash};

#[derive(Debug, Arbitrary)]
enum Op {
    PinFailure,
    PinReset,
    U2fNext,
    SetU2f(u32),
    SetLabel(String),
    Flags(u32),
    Commit,
    Reload,
}

fuzz_target!(|ops: Vec<Op>| {
    let layout = FlashLayout::compact();
    let mut engine = EngineBuilder::new()
        .layout(layout)
        .open(MemoryFlash::new(layout))
        .unwrap();

    for op in ops.into_iter().take(512) {
        match op {
            Op::PinFailure => {
                let addr = engine.pin_fail_address().unwrap();
                engine.record_pin_failure(addr).unwrap();
            }
            Op::PinReset => {
                let addr = engine.pin_fail_address().unwrap();
                engine.reset_pin_failures(addr).unwrap();
                assert_eq!(engine.pin_fail_count().unwrap(), 0);
            }
            Op::U2fNext => {
                let before = engine.u2f_counter().unwrap();
                let after = engine.next_u2f_counter().unwrap();
                assert_eq!(after, before.wrapping_add(1));
            }
            Op::SetU2f(value) => {
                engine.set_u2f_counter(value);
                engine.commit().unwrap();
                assert_eq!(engine.u2f_counter().unwrap(), value);
            }
            Op::SetLabel(label) => engine.set_label(&label),
            Op::Flags(flags) => {
                engine.apply_flags(flags).unwrap();
            }
            Op::Commit => engine.commit().unwrap(),
            Op::Reload => {
                engine = EngineBuilder::new()
                    .layout(layout)
                    .open(engine.into_flash())
                    .unwrap();
            }
        }
    }
});
