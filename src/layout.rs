//! Layout management.
//!
//! Virtualized functions keep their trampolines in place; everything they need at
//! run time lives in one segment appended after the last existing one. This module
//! assigns that segment its address and file offset, packs the interpreter, the
//! program blocks and the watermark into it, and records where each landed.

use crate::error::{CompileError, WriteError};
use crate::format;
use crate::model::{Architecture, PhysicalSize, ProgramId, RuntimePlacement, Segment, SegmentFlags, SegmentId};
use crate::utils::{align_up, checked_align_up};
use crate::vm::profile::VmProfile;
use crate::vm::runtime;

const RUNTIME_ALIGN: u64 = 16;
const PROGRAM_ALIGN: u64 = 4;

/// Where layout placed everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPlan {
    pub segment: SegmentId,
    pub address: u64,
    pub offset: u64,
    pub size: u64,
    pub runtime: Option<RuntimePlacement>,
    pub programs: Vec<(ProgramId, u64)>,
    pub watermark: Option<u64>,
}

fn pad(data: &mut Vec<u8>, align: u64) {
    data.resize(align_up(data.len() as u64, align) as usize, 0);
}

/// Appends the VM segment to `arch`.
///
/// Returns `None` and leaves the image untouched when nothing was virtualized.
pub fn relayout(
    arch: &mut Architecture,
    section_name: &str,
    profile: &VmProfile,
    watermark: Option<&[u8]>,
) -> Result<Option<LayoutPlan>, CompileError> {
    if arch.vm_programs.is_empty() {
        return Ok(None);
    }
    if arch.vm_segment.is_some() {
        return Err(WriteError::Layout("VM segment is already laid out".into()).into());
    }

    let end = arch.end_address();
    let address = checked_align_up(end, arch.segment_alignment).ok_or(WriteError::AddressSpace {
        end: u128::from(end) + u128::from(arch.segment_alignment),
    })?;
    let offset = align_up(arch.size, arch.file_alignment);
    let native = arch.isa.is_native();

    let mut data = Vec::new();
    let mut placement = None;
    if native {
        let runtime = runtime::build(arch.address_size, &profile.opcodes)?;
        placement = Some(RuntimePlacement {
            address,
            entry_offset: runtime.entry_offset,
        });
        data.extend_from_slice(&runtime.bytes);
        pad(&mut data, RUNTIME_ALIGN);
    }

    let mut programs = Vec::with_capacity(arch.vm_programs.len());
    for program in &mut arch.vm_programs {
        pad(&mut data, PROGRAM_ALIGN);
        let at = address + data.len() as u64;
        program.address = Some(at);
        data.extend_from_slice(&program.bytes);
        programs.push((program.id, at));
    }

    let watermark = watermark.map(|blob| {
        pad(&mut data, 8);
        let at = address + data.len() as u64;
        data.extend_from_slice(blob);
        at
    });

    let reserve = format::tail_reserve(arch);
    if reserve > 0 {
        pad(&mut data, 8);
        data.resize(data.len() + reserve as usize, 0);
    }

    let size = data.len() as u64;
    let flags = if native {
        SegmentFlags::READ | SegmentFlags::EXECUTE
    } else {
        SegmentFlags::READ
    };
    let mut segment = Segment::new(section_name, address, size, offset, data, flags);
    segment.physical_size = PhysicalSize::Grow;
    let id = SegmentId::from_index(arch.segments.len());
    arch.segments.push(segment);
    arch.vm_segment = Some(id);
    arch.vm_runtime = placement;

    tracing::debug!(
        arch = %arch.name,
        address = format_args!("{address:#x}"),
        offset = format_args!("{offset:#x}"),
        size,
        programs = programs.len(),
        "VM segment laid out"
    );
    Ok(Some(LayoutPlan {
        segment: id,
        address,
        offset,
        size,
        runtime: placement,
        programs,
        watermark,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::test_arch;
    use crate::model::{FunctionId, Isa};
    use crate::vm::{VmInstruction, VmProgram};

    fn program(arch: &Architecture, profile: &VmProfile) -> VmProgram {
        VmProgram::new(
            ProgramId::from_index(arch.vm_programs.len()),
            FunctionId(0),
            vec![VmInstruction::PushImm32(1), VmInstruction::Ret],
            vec![],
            false,
            &profile.opcodes,
        )
        .expect("encodes")
    }

    #[test]
    fn nothing_virtualized_means_no_segment() {
        let mut arch = test_arch(Isa::X64, 0x400000, &[0xC3; 8]);
        let plan = relayout(&mut arch, ".uvm0", &VmProfile::new(0), None).expect("lays out");
        assert!(plan.is_none());
        assert_eq!(arch.segments.len(), 1);
    }

    #[test]
    fn segment_follows_the_last_one_aligned() {
        let mut arch = test_arch(Isa::X64, 0x400000, &[0xC3; 8]);
        let profile = VmProfile::new(3);
        let p = program(&arch, &profile);
        arch.vm_programs.push(p);
        let p = program(&arch, &profile);
        arch.vm_programs.push(p);

        let plan = relayout(&mut arch, ".uvm0", &profile, Some(b"mark"))
            .expect("lays out")
            .expect("has a segment");
        assert_eq!(plan.address, 0x402000);
        assert_eq!(plan.offset, align_up(arch.size, arch.file_alignment));
        let runtime = plan.runtime.expect("native images carry the runtime");
        assert_eq!(runtime.address, plan.address);

        let segment = &arch.segments[plan.segment.index()];
        assert_eq!(segment.name, ".uvm0");
        assert!(segment.flags.contains(SegmentFlags::EXECUTE));
        assert!(!segment.overlaps(&arch.segments[0]));
        for (id, at) in &plan.programs {
            let program = &arch.vm_programs[id.index()];
            assert_eq!(program.address, Some(*at));
            assert_eq!(at % PROGRAM_ALIGN, 0);
            assert_eq!(arch.read(*at, program.bytes.len()), Some(&program.bytes[..]));
        }
        let mark = plan.watermark.expect("placed");
        assert_eq!(arch.read(mark, 4), Some(&b"mark"[..]));
        assert!(relayout(&mut arch, ".uvm0", &profile, None).is_err());
    }
}
