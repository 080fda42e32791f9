// Demo debuggee
//
// The program the console launches on the simulated target: main calls
// `tick` three times, each call writes a line to stdout and stores the
// remaining count.

use team_debugger::sim::{Program, ProgramBuilder, SYS_WRITE};
use team_debugger::DebuggerResult;

pub const DEMO_BASE: u64 = 0x1000;

pub fn demo_program() -> DebuggerResult<Program> {
    let mut builder = ProgramBuilder::new("demo", DEMO_BASE);
    let message = b"tick\n";
    builder.data("message", message);
    let counter = builder.data("counter", &[0; 8]);

    builder.function("main").line(1).enter();
    builder.line(2).mov(3, 3);
    builder.label("loop").line(3).call("tick");
    builder.line(4).add(3, -1);
    builder.line(5).jnz(3, "loop");
    builder.line(6).mov(0, 0).leave().ret();

    builder.function("tick").line(10).enter();
    builder
        .line(11)
        .mov(0, 1)
        .mov_address(1, "message")
        .mov(2, message.len() as u32)
        .syscall(SYS_WRITE);
    builder.line(12).store(3, counter as u32);
    builder.line(13).leave().ret();

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_symbols() {
        let program = demo_program().unwrap();
        assert_eq!(program.path(), "/sim/demo");
        assert!(program.symbol("main").is_some());
        assert!(program.symbol("tick").unwrap() > program.symbol("loop").unwrap());
    }
}
