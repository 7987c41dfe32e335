//! Per-function virtualization: eligibility, lowering and trampoline emission.
//!
//! Nothing here mutates the architecture. [`virtualize`] returns everything the
//! caller needs to splice the result in, so functions can be processed in parallel
//! and merged by a single writer.

use std::collections::HashMap;

use super::liveness;
use super::lower::{self, ImageFacts};
use super::profile::VmProfile;
use super::VmProgram;
use crate::error::VirtualizeError;
use crate::isa::{self, Trampoline};
use crate::isa::x86::{REG_BP, REG_SP};
use crate::model::{
    Architecture, CommandKind, Function, Operand, OperandSize, ProgramId, RelocationEntry, XrefKind, XrefTarget,
};

/// A virtualized function ready to be merged.
#[derive(Debug, Clone)]
pub struct Virtualized {
    pub program: VmProgram,
    pub trampoline: Trampoline,
}

impl ImageFacts {
    pub fn new(arch: &Architecture) -> Self {
        let mut entries = HashMap::new();
        for f in &arch.functions {
            entries.entry(f.address).or_insert(f.id);
        }
        Self {
            word: arch.address_size.operand_size(),
            image: arch.image_base..arch.end_address(),
            entries,
        }
    }
}

fn writes_sp(operand: Option<&Operand>) -> bool {
    matches!(operand, Some(Operand::Reg { reg: REG_SP, .. }))
}

/// Upper bound of the stack a native function builds below its entry pointer.
pub fn frame_size(function: &Function, word: OperandSize) -> Result<u64, VirtualizeError> {
    let mut frame = 0u64;
    for command in &function.commands {
        let dst = command.operands.first();
        match command.kind {
            CommandKind::Push => frame += dst.and_then(Operand::size).unwrap_or(word).bytes(),
            CommandKind::Call => frame += word.bytes(),
            CommandKind::Sub if writes_sp(dst) => match command.operands.get(1) {
                Some(Operand::Imm { value, size }) => frame = frame.saturating_add(size.sign_extend(*value)),
                _ => return Err(VirtualizeError::DynamicStack { address: command.address }),
            },
            CommandKind::And if writes_sp(dst) => frame += 16,
            CommandKind::Add if writes_sp(dst) => {
                if !matches!(command.operands.get(1), Some(Operand::Imm { .. })) {
                    return Err(VirtualizeError::DynamicStack { address: command.address });
                }
            }
            // Restoring the pointer from the frame base.
            CommandKind::Mov if writes_sp(dst) => {
                if !matches!(command.operands.get(1), Some(Operand::Reg { reg: REG_BP, .. })) {
                    return Err(VirtualizeError::DynamicStack { address: command.address });
                }
            }
            CommandKind::Lea if writes_sp(dst) => {
                if !matches!(command.operands.get(1), Some(Operand::Mem(m)) if m.base == Some(REG_BP) && m.index.is_none())
                {
                    return Err(VirtualizeError::DynamicStack { address: command.address });
                }
            }
            CommandKind::Ret | CommandKind::Leave | CommandKind::Cmp | CommandKind::Test => {}
            CommandKind::Xchg if writes_sp(command.operands.get(1)) => {
                return Err(VirtualizeError::DynamicStack { address: command.address })
            }
            _ if writes_sp(dst) => return Err(VirtualizeError::DynamicStack { address: command.address }),
            _ => {}
        }
    }
    Ok(frame)
}

/// Decides whether `function` may be virtualized.
pub fn check_eligibility(arch: &Architecture, function: &Function, profile: &VmProfile) -> Result<(), VirtualizeError> {
    if let Some(reason) = &function.ineligible {
        return Err(VirtualizeError::PreviouslyRejected(reason.clone()));
    }
    if function.decode_failed || !function.is_decoded() {
        return Err(VirtualizeError::NotDecoded);
    }
    if let Some(command) = function.commands.iter().find(|c| c.has_unresolved()) {
        return Err(VirtualizeError::UnresolvedControlFlow {
            address: command.address,
        });
    }
    if let Some(command) = function.commands.iter().find(|c| c.kind == CommandKind::Excluded) {
        return Err(VirtualizeError::Excluded {
            address: command.address,
            text: command.text.clone(),
        });
    }

    let backend = isa::backend(arch.isa, arch.address_size);
    let code_start = function.commands.first().map_or(function.address, |c| c.address);
    let size = function.end.saturating_sub(code_start);
    let required = backend.trampoline_size(function);
    if size < required {
        return Err(VirtualizeError::TooSmall { size, required });
    }

    // A call-out returns through a re-entry stub that no unwind table describes, so an
    // exception raised by the callee could not unwind past it.
    if arch.has_unwind_info(function.address, function.end) {
        if let Some(call) = function.commands.iter().find(|c| c.kind == CommandKind::Call) {
            return Err(VirtualizeError::UnwindCallOut { address: call.address });
        }
    }

    if let Some(ext) = function.ext_commands.iter().find(|e| e.target != function.address) {
        return Err(VirtualizeError::ExternalEntry {
            site: ext.address,
            target: ext.target,
        });
    }

    if !function.isa.is_native() {
        let signature = function.signature.as_ref().ok_or(VirtualizeError::NoSignature)?;
        if profile.dispatch_token(signature).is_none() {
            return Err(VirtualizeError::NoDispatch {
                shape: signature.shape().to_string(),
            });
        }
        return Ok(());
    }

    // Every load-time rebase inside the body must be one the program reproduces:
    // a data reference whose field is the slot and whose value is the slot's target.
    for reloc in arch.relocations.iter().filter(|r| r.overlaps(function.address, function.end)) {
        let target = reloc.target.filter(|&t| arch.in_image(t));
        let reproduced = reloc.entry != RelocationEntry::MachORebase
            && target.is_some_and(|t| {
                function.commands.iter().any(|c| {
                    c.xrefs.iter().any(|x| {
                        x.kind == XrefKind::Data
                            && x.target == XrefTarget::Address(t)
                            && x.field.is_some_and(|f| c.address + u64::from(f.offset) == reloc.address)
                            && matches!(c.operands.get(x.operand), Some(Operand::Imm { .. }) | Some(Operand::Mem(_)))
                    })
                })
            });
        if !reproduced {
            return Err(VirtualizeError::Rebased {
                address: reloc.address,
            });
        }
    }

    let frame = frame_size(function, arch.address_size.operand_size())?;
    if frame > profile.max_frame {
        return Err(VirtualizeError::StackFrame {
            frame,
            limit: profile.max_frame,
        });
    }
    Ok(())
}

/// Lowers `function` into program `program` and builds its trampoline.
pub fn virtualize(
    arch: &Architecture,
    function: &Function,
    program: ProgramId,
    facts: &ImageFacts,
    profile: &VmProfile,
) -> Result<Virtualized, VirtualizeError> {
    check_eligibility(arch, function, profile)?;
    let managed = !function.isa.is_native();
    let lowered = if managed {
        let signature = function.signature.as_ref().ok_or(VirtualizeError::NoSignature)?;
        lower::lower_managed(function, signature, program)?
    } else {
        let live = profile.optimize_flags.then(|| liveness::live_out(&function.commands));
        lower::lower_native(function, program, facts, live.as_deref())?
    };
    let program = VmProgram::new(
        program,
        function.id,
        lowered.instructions,
        lowered.stubs,
        managed,
        &profile.opcodes,
    )?;
    let trampoline = isa::backend(arch.isa, arch.address_size).trampoline(function, program.id, profile)?;
    Ok(Virtualized { program, trampoline })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::{decode_function, relocation_slots, Bounds};
    use crate::model::tests::test_arch;
    use crate::model::{ExtCommand, FunctionId, Isa, Relocation};

    fn arch_with(code: &[u8]) -> Architecture {
        let mut arch = test_arch(Isa::X64, 0x400000, code);
        let id = arch.add_function("f", 0x401000, Some(code.len() as u64));
        let bounds = Bounds {
            limit: 0x401000 + code.len() as u64,
            exact: true,
        };
        let list = decode_function(&arch, id, Some(bounds), &[]).expect("decodes");
        let f = &mut arch.functions[id.index()];
        f.commands = list.commands;
        f.end = list.end;
        arch
    }

    // push rbp; mov rbp, rsp; sub rsp, 0x20; mov eax, edi; add eax, esi; leave; ret
    const FRAME: [u8; 16] = [
        0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, 0x89, 0xF8, 0x01, 0xF0, 0xC9, 0xC3, 0xCC, 0xCC,
    ];

    #[test]
    fn eligible_function_produces_program_and_trampoline() {
        let arch = arch_with(&FRAME);
        let profile = VmProfile::new(1);
        let facts = ImageFacts::new(&arch);
        let out = virtualize(&arch, &arch.functions[0], ProgramId(0), &facts, &profile).expect("virtualizes");
        assert_eq!(out.trampoline.address, 0x401000);
        assert_eq!(out.trampoline.bytes.len(), FRAME.len());
        assert!(out.program.stubs.is_empty());
        assert_eq!(frame_size(&arch.functions[0], OperandSize::Qword), Ok(0x28));
    }

    #[test]
    fn rejections_are_reported_in_order() {
        let mut arch = arch_with(&FRAME);
        let profile = VmProfile::new(1);
        arch.functions[0].ext_commands.push(ExtCommand {
            address: 0x402000,
            from: FunctionId(1),
            command: crate::model::CommandId(0),
            target: 0x401004,
            use_call: false,
            fixup: None,
        });
        assert_eq!(
            check_eligibility(&arch, &arch.functions[0], &profile),
            Err(VirtualizeError::ExternalEntry {
                site: 0x402000,
                target: 0x401004
            })
        );
        arch.functions[0].ineligible = Some("earlier".into());
        assert_eq!(
            check_eligibility(&arch, &arch.functions[0], &profile),
            Err(VirtualizeError::PreviouslyRejected("earlier".into()))
        );
    }

    #[test]
    fn small_bodies_and_big_frames_are_rejected() {
        // mov eax, 1; ret
        let arch = arch_with(&[0xB8, 1, 0, 0, 0, 0xC3]);
        assert_eq!(
            check_eligibility(&arch, &arch.functions[0], &VmProfile::new(0)),
            Err(VirtualizeError::TooSmall { size: 6, required: 13 })
        );

        // sub rsp, 0x2000; add rsp, 0x2000; ret; padding
        let mut code = vec![0x48, 0x81, 0xEC, 0, 0x20, 0, 0, 0x48, 0x81, 0xC4, 0, 0x20, 0, 0, 0xC3];
        code.resize(20, 0xCC);
        let arch = arch_with(&code);
        assert!(matches!(
            check_eligibility(&arch, &arch.functions[0], &VmProfile::new(0)),
            Err(VirtualizeError::StackFrame { frame: 0x2000, .. })
        ));
    }

    #[test]
    fn uncovered_relocation_is_rebased() {
        let mut arch = arch_with(&FRAME);
        arch.relocations.push(Relocation {
            address: 0x401008,
            size: OperandSize::Qword,
            target: None,
            entry: RelocationEntry::PeBlock { file_offset: 0 },
            deleted: false,
        });
        assert_eq!(relocation_slots(&arch), vec![0x401008]);
        assert_eq!(
            check_eligibility(&arch, &arch.functions[0], &VmProfile::new(0)),
            Err(VirtualizeError::Rebased { address: 0x401008 })
        );
    }

    #[test]
    fn unwound_function_with_a_call_is_rejected() {
        // push rbp; mov rbp, rsp; call 0x401100; pop rbp; ret; padding
        let mut code = vec![0x55, 0x48, 0x89, 0xE5, 0xE8, 0xF7, 0x00, 0x00, 0x00, 0x5D, 0xC3];
        code.resize(16, 0xCC);
        let mut arch = arch_with(&code);
        let profile = VmProfile::new(0);
        assert_eq!(check_eligibility(&arch, &arch.functions[0], &profile), Ok(()));

        arch.unwind_ranges.push((0x401000, 0x401010));
        let err = check_eligibility(&arch, &arch.functions[0], &profile).unwrap_err();
        assert_eq!(err, VirtualizeError::UnwindCallOut { address: 0x401004 });
        assert!(err.is_ineligible());

        // Unwind info alone does not block a leaf function.
        let mut leaf = arch_with(&FRAME);
        leaf.unwind_ranges.push((0x401000, 0x401010));
        assert_eq!(check_eligibility(&leaf, &leaf.functions[0], &profile), Ok(()));
    }
}
