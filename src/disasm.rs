//! Command-list builder.
//!
//! Decodes each function by following control flow from its entry: every branch
//! target and every fallthrough inside the function's bounds is queued, so the
//! result covers exactly the reachable instructions. Bytes inside a sized function
//! that were never reached become `Data` commands.

use std::collections::BTreeMap;

use crate::error::DecodeError;
use crate::isa::{self, DecodeContext, Decoded, InstructionSet};
use crate::model::{
    Architecture, Command, CommandId, CommandKind, ExtCommand, Fixup, FixupKind, FixupLocation, FixupTarget,
    FunctionId, XrefKind, XrefTarget,
};

/// Decoded body of one function.
#[derive(Debug, Clone)]
pub struct CommandList {
    pub commands: Vec<Command>,
    /// End of the claimed range.
    pub end: u64,
    /// Some branch or call target is computed at run time.
    pub unresolved: bool,
    /// The body has exception clauses.
    pub has_handlers: bool,
    pub max_stack: Option<u16>,
}

/// Decoding bounds of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    /// Nothing at or past this address belongs to the function.
    pub limit: u64,
    /// The function is known to span exactly up to `limit`.
    pub exact: bool,
}

/// Decodes the function whose entry is at `address`.
///
/// # Arguments
/// * `isa` - The instruction-set backend.
/// * `bytes` - File-backed bytes starting at `address`.
/// * `address` - Entry address.
/// * `bounds` - Decoding bounds; `None` lets decoding run to the end of `bytes`.
/// * `ctx` - Relocation facts for operand classification.
pub fn disassemble(
    isa: &dyn InstructionSet,
    bytes: &[u8],
    address: u64,
    bounds: Option<Bounds>,
    ctx: &DecodeContext<'_>,
) -> Result<CommandList, DecodeError> {
    let available_end = address + bytes.len() as u64;
    let body = isa.body(bytes, address)?;
    let start = body.code_start;
    let (end, exact) = match (body.code_end, bounds) {
        (Some(code_end), _) => (code_end, true),
        (None, Some(b)) => (b.limit.min(available_end), b.exact),
        (None, None) => (available_end, false),
    };
    if start >= end {
        return Err(DecodeError::Unmapped { address });
    }
    let window = &bytes[..(end - address) as usize];

    let mut decoded: BTreeMap<u64, Decoded> = BTreeMap::new();
    let mut queue = vec![start];
    while let Some(mut pc) = queue.pop() {
        loop {
            if pc < start || pc >= end || decoded.contains_key(&pc) {
                break;
            }
            if let Some((_, prev)) = decoded.range(..pc).next_back() {
                if prev.command.end() > pc {
                    return Err(DecodeError::Overlap { address: pc });
                }
            }
            let d = isa.decode(&window[(pc - address) as usize..], pc, ctx)?;
            let next = d.command.end();
            if let Some((&succ, _)) = decoded.range(pc + 1..).next() {
                if succ < next {
                    return Err(DecodeError::Overlap { address: succ });
                }
            }
            queue.extend(d.targets.iter().copied().filter(|t| (start..end).contains(t)));
            let fallthrough = d.command.fallthrough;
            decoded.insert(pc, d);
            if !fallthrough {
                break;
            }
            pc = next;
        }
    }

    let decoded_end = decoded.values().map(|d| d.command.end()).max().unwrap_or(start);
    let claimed_end = if exact { end } else { decoded_end };

    let mut commands = Vec::with_capacity(decoded.len());
    let mut cursor = start;
    for (pc, d) in decoded {
        if pc > cursor {
            commands.push(data_command(cursor, pc));
        }
        cursor = d.command.end();
        commands.push(d.command);
    }
    if claimed_end > cursor {
        commands.push(data_command(cursor, claimed_end));
    }

    for (i, command) in commands.iter_mut().enumerate() {
        command.id = CommandId::from_index(i);
    }
    let index: BTreeMap<u64, CommandId> = commands
        .iter()
        .filter(|c| c.kind != CommandKind::Data)
        .map(|c| (c.address, c.id))
        .collect();
    for command in &mut commands {
        for xref in &mut command.xrefs {
            if let (XrefKind::Branch, XrefTarget::Address(target)) = (xref.kind, xref.target) {
                if let Some(&id) = index.get(&target) {
                    xref.target = XrefTarget::Command(id);
                }
            }
        }
    }

    Ok(CommandList {
        unresolved: commands.iter().any(Command::has_unresolved),
        commands,
        end: claimed_end,
        has_handlers: body.has_handlers,
        max_stack: body.max_stack,
    })
}

fn data_command(from: u64, to: u64) -> Command {
    let mut command = Command::new(from, (to - from) as u32, CommandKind::Data);
    command.text = format!("db {} bytes", to - from);
    command.fallthrough = false;
    command
}

/// Computes decoding bounds for every function from symbol sizes, neighbouring
/// entries and segment ends.
pub fn function_bounds(arch: &Architecture) -> Vec<Option<Bounds>> {
    let mut starts: Vec<u64> = arch.functions.iter().map(|f| f.address).collect();
    starts.sort_unstable();
    starts.dedup();
    arch.functions
        .iter()
        .map(|f| {
            let segment = arch.segment(arch.segment_by_address(f.address)?)?;
            let segment_end = segment.address + segment.data.len() as u64;
            if let Some(size) = f.size {
                return Some(Bounds {
                    limit: (f.address + size).min(segment_end),
                    exact: true,
                });
            }
            let next = starts
                .get(starts.partition_point(|&s| s <= f.address))
                .copied()
                .unwrap_or(u64::MAX);
            Some(Bounds {
                limit: next.min(segment_end),
                exact: false,
            })
        })
        .collect()
}

/// Sorted relocation slot addresses, for [`DecodeContext`].
pub fn relocation_slots(arch: &Architecture) -> Vec<u64> {
    let mut slots: Vec<u64> = arch.relocations.iter().map(|r| r.address).collect();
    slots.sort_unstable();
    slots
}

/// Decodes one function of `arch`.
pub fn decode_function(
    arch: &Architecture,
    id: FunctionId,
    bounds: Option<Bounds>,
    relocations: &[u64],
) -> Result<CommandList, DecodeError> {
    let function = arch.function(id).ok_or(DecodeError::Unmapped { address: 0 })?;
    let bytes = arch
        .read_available(function.address, usize::MAX)
        .filter(|b| !b.is_empty())
        .ok_or(DecodeError::Unmapped {
            address: function.address,
        })?;
    let ctx = DecodeContext {
        relocations,
        image: arch.image_base..arch.end_address(),
    };
    disassemble(isa::backend(arch.isa, arch.address_size), bytes, function.address, bounds, &ctx)
}

/// Records, on each function, the commands of other functions that refer into it.
///
/// References to a function's entry are registered as fixups; references into the
/// middle of a body are kept as [`ExtCommand`]s and make the target ineligible for
/// virtualization. Returns the number of links.
pub fn link_external_references(arch: &mut Architecture) -> usize {
    let mut ranges: Vec<(u64, u64, FunctionId)> = arch
        .functions
        .iter()
        .filter(|f| f.is_decoded())
        .map(|f| (f.address, f.end, f.id))
        .collect();
    ranges.sort_unstable();
    let containing = |address: u64| {
        let i = ranges.partition_point(|&(start, _, _)| start <= address);
        let (start, end, id) = *ranges.get(i.checked_sub(1)?)?;
        (address >= start && address < end).then_some(id)
    };

    let mut links = Vec::new();
    for function in &arch.functions {
        for command in &function.commands {
            for xref in &command.xrefs {
                let (XrefKind::Branch | XrefKind::Call, XrefTarget::Address(target)) = (xref.kind, xref.target) else {
                    continue;
                };
                let Some(owner) = containing(target) else {
                    continue;
                };
                if owner == function.id {
                    continue;
                }
                let ext = ExtCommand {
                    address: command.address,
                    from: function.id,
                    command: command.id,
                    target,
                    use_call: xref.kind == XrefKind::Call,
                    fixup: None,
                };
                links.push((owner, ext, xref.field, command.size));
            }
        }
    }

    let count = links.len();
    for (owner, mut ext, field, command_size) in links {
        let entry = arch.functions[owner.index()].address;
        if let (true, Some(field)) = (ext.target == entry, field) {
            let tail = i64::from(command_size) - i64::from(field.offset);
            ext.fixup = Some(arch.fixups.register(Fixup::new(
                FixupLocation::Native(ext.address + u64::from(field.offset)),
                FixupTarget::Function(owner),
                FixupKind::Relative,
                field.size,
                -tail,
            )));
        }
        arch.functions[owner.index()].ext_commands.push(ext);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::x86::X86_64;
    use crate::model::tests::test_arch;
    use crate::model::Isa;

    fn ctx() -> DecodeContext<'static> {
        DecodeContext {
            relocations: &[],
            image: 0..u64::MAX,
        }
    }

    #[test]
    fn follows_both_branch_edges() {
        // cmp rdi, rsi; jge +3; mov rax, rsi; ret
        let code = [0x48, 0x39, 0xF7, 0x7D, 0x03, 0x48, 0x89, 0xF0, 0xC3];
        let list = disassemble(&X86_64, &code, 0x1000, None, &ctx()).expect("decodes");
        let kinds: Vec<_> = list.commands.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::Cmp,
                CommandKind::Jcc(crate::model::Cond::Ge),
                CommandKind::Mov,
                CommandKind::Ret
            ]
        );
        assert_eq!(list.end, 0x1009);
        assert_eq!(list.commands[1].xrefs[0].target, XrefTarget::Command(CommandId(3)));
        assert!(!list.unresolved);
    }

    #[test]
    fn unreached_bytes_in_sized_function_are_data() {
        // ret; int3 x3
        let code = [0xC3, 0xCC, 0xCC, 0xCC];
        let bounds = Bounds { limit: 0x1004, exact: true };
        let list = disassemble(&X86_64, &code, 0x1000, Some(bounds), &ctx()).expect("decodes");
        assert_eq!(list.commands.len(), 2);
        assert_eq!(list.commands[1].kind, CommandKind::Data);
        assert_eq!(list.commands[1].size, 3);
        assert_eq!(list.end, 0x1004);
    }

    #[test]
    fn overlapping_instructions_are_rejected() {
        // jmp +1 lands inside the 2-byte jmp itself: eb ff
        let code = [0xEB, 0xFF, 0xC0];
        assert_eq!(
            disassemble(&X86_64, &code, 0x1000, None, &ctx()).unwrap_err(),
            DecodeError::Overlap { address: 0x1001 }
        );
    }

    #[test]
    fn computed_jump_marks_unresolved() {
        // mov rax, rdi; jmp rax
        let code = [0x48, 0x89, 0xF8, 0xFF, 0xE0];
        let list = disassemble(&X86_64, &code, 0x1000, None, &ctx()).expect("decodes");
        assert!(list.unresolved);
    }

    #[test]
    fn calls_between_functions_become_fixups() {
        // f: call g; ret   g: ret
        let code = [0xE8, 0x01, 0x00, 0x00, 0x00, 0xC3, 0xC3];
        let mut arch = test_arch(Isa::X64, 0x400000, &code);
        let f = arch.add_function("f", 0x401000, None);
        let g = arch.add_function("g", 0x401006, None);
        let bounds = function_bounds(&arch);
        for id in [f, g] {
            let list = decode_function(&arch, id, bounds[id.index()], &[]).expect("decodes");
            let function = &mut arch.functions[id.index()];
            function.commands = list.commands;
            function.end = list.end;
        }
        assert_eq!(arch.functions[f.index()].end, 0x401006);
        assert_eq!(link_external_references(&mut arch), 1);

        let ext = arch.functions[g.index()].ext_commands[0];
        assert_eq!(ext.address, 0x401000);
        assert!(ext.use_call);
        let fixup = arch.fixups.get(ext.fixup.expect("registered")).expect("exists");
        assert_eq!(fixup.location, FixupLocation::Native(0x401001));
        assert_eq!(fixup.addend, -4);
        assert_eq!(fixup.target, FixupTarget::Function(g));
    }
}
