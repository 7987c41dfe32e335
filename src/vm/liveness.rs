//! Backward liveness of arithmetic flags over a function's command list.
//!
//! Flags are considered live wherever control leaves the function (returns,
//! call-outs, branches to other code), so elision never changes what native code
//! can observe.

use crate::model::{Command, CommandKind, Flags, Operand, XrefKind, XrefTarget};

/// Flags a command is guaranteed to overwrite.
fn kills(command: &Command) -> Flags {
    match command.kind {
        CommandKind::Shl | CommandKind::Shr | CommandKind::Sar => match command.operands.get(1) {
            Some(Operand::Imm { value, .. }) if value & 0x3F != 0 => command.flags_written,
            _ => Flags::empty(),
        },
        _ => command.flags_written,
    }
}

fn leaves_function(commands: &[Command], index: usize) -> bool {
    let command = &commands[index];
    if matches!(
        command.kind,
        CommandKind::Ret | CommandKind::Return | CommandKind::Call
    ) {
        return true;
    }
    let external = command
        .xrefs
        .iter()
        .any(|x| x.kind == XrefKind::Branch && !matches!(x.target, XrefTarget::Command(_)));
    let runs_off = command.fallthrough
        && commands
            .get(index + 1)
            .map_or(true, |next| next.kind == CommandKind::Data);
    external || runs_off
}

fn successors(commands: &[Command], index: usize) -> impl Iterator<Item = usize> + '_ {
    let command = &commands[index];
    let next = (command.fallthrough && index + 1 < commands.len()).then_some(index + 1);
    command.local_targets().map(|id| id.index()).chain(next)
}

/// Flags live immediately after each command.
pub fn live_out(commands: &[Command]) -> Vec<Flags> {
    let exits: Vec<bool> = (0..commands.len()).map(|i| leaves_function(commands, i)).collect();
    let mut live_in = vec![Flags::empty(); commands.len()];
    let mut live_out = vec![Flags::empty(); commands.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for i in (0..commands.len()).rev() {
            let mut out = if exits[i] { Flags::ARITHMETIC } else { Flags::empty() };
            for s in successors(commands, i) {
                out |= live_in[s];
            }
            let command = &commands[i];
            let input = command.flags_read | (out - kills(command));
            if out != live_out[i] || input != live_in[i] {
                live_out[i] = out;
                live_in[i] = input;
                changed = true;
            }
        }
    }
    live_out
}
