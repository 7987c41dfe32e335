//! Fixup registration and resolution.
//!
//! Every address-carrying field the pipeline produces is registered here exactly
//! once. After layout has given every entity its final address, [`resolve_all`]
//! computes every value first and only then patches the segment buffers, so a
//! failing fixup leaves the image untouched.

use crate::error::ResolveError;
use crate::model::{Architecture, Fixup, FixupId, FixupKind, FixupLocation, FixupTarget, OperandSize};
use crate::utils::read_le;

/// Arena of fixups addressed by [`FixupId`].
#[derive(Debug, Clone, Default)]
pub struct FixupTable {
    fixups: Vec<Fixup>,
}

impl FixupTable {
    pub fn register(&mut self, fixup: Fixup) -> FixupId {
        let id = FixupId::from_index(self.fixups.len());
        self.fixups.push(fixup);
        id
    }

    /// Points an existing fixup at a new target. Returns `false` for unknown ids.
    pub fn relink(&mut self, id: FixupId, target: FixupTarget) -> bool {
        match self.fixups.get_mut(id.index()) {
            Some(fixup) => {
                fixup.target = target;
                true
            }
            None => false,
        }
    }

    /// Retires every live fixup whose native field lies inside `[start, end)`.
    pub fn retire_range(&mut self, start: u64, end: u64) -> usize {
        let mut count = 0;
        for fixup in &mut self.fixups {
            if let FixupLocation::Native(at) = fixup.location {
                if !fixup.deleted && at >= start && at < end {
                    fixup.deleted = true;
                    count += 1;
                }
            }
        }
        count
    }

    pub fn get(&self, id: FixupId) -> Option<&Fixup> {
        self.fixups.get(id.index())
    }

    /// Live fixups with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (FixupId, &Fixup)> {
        self.fixups
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.deleted)
            .map(|(i, f)| (FixupId::from_index(i), f))
    }

    /// Number of live fixups.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Final address of a fixup target, if it has one yet.
pub fn target_address(arch: &Architecture, target: FixupTarget) -> Option<u64> {
    match target {
        FixupTarget::Address(address) => Some(address),
        FixupTarget::Function(id) => arch.function(id).map(|f| f.address),
        FixupTarget::Program(id) => arch.program(id)?.header_address(),
        FixupTarget::Stub { program, index } => arch.program(program)?.stub_address(index),
        FixupTarget::Runtime => arch.vm_runtime.map(|r| r.address),
        FixupTarget::VmEntry => arch.vm_runtime.map(|r| r.address + r.entry_offset),
    }
}

/// Final address of the patched field.
pub fn location_address(arch: &Architecture, location: FixupLocation) -> Option<u64> {
    match location {
        FixupLocation::Native(address) => Some(address),
        FixupLocation::Program { program, offset } => arch.program(program)?.address.map(|a| a + u64::from(offset)),
    }
}

/// Value the field of `fixup` must hold, truncated to its size.
pub fn expected_value(arch: &Architecture, id: FixupId, fixup: &Fixup) -> Result<(u64, u64), ResolveError> {
    let target = target_address(arch, fixup.target).ok_or_else(|| ResolveError::Dangling {
        fixup: id,
        target: format!("{:?}", fixup.target),
    })?;
    let location = location_address(arch, fixup.location).ok_or_else(|| ResolveError::Location {
        fixup: id,
        location: format!("{:?}", fixup.location),
    })?;
    let s = i128::from(target) + i128::from(fixup.addend);
    let value = match fixup.kind {
        FixupKind::Absolute => s,
        FixupKind::Relative => s - i128::from(location),
        FixupKind::ImageRelative => s - i128::from(arch.image_base),
    };
    if !fits(value, fixup.kind, fixup.size) {
        return Err(ResolveError::Overflow {
            fixup: id,
            value,
            bytes: fixup.size.bytes(),
        });
    }
    Ok((location, value as u64 & fixup.size.mask()))
}

fn fits(value: i128, kind: FixupKind, size: OperandSize) -> bool {
    let bits = size.bits();
    match kind {
        FixupKind::Relative => {
            let half = 1i128 << (bits - 1);
            value >= -half && value < half
        }
        FixupKind::Absolute | FixupKind::ImageRelative => value >= 0 && value < (1i128 << bits),
    }
}

/// Patches every live fixup. Returns the number patched.
///
/// Values are computed for all fixups before any byte is written. Resolution is
/// idempotent: running it twice writes the same bytes.
pub fn resolve_all(arch: &mut Architecture) -> Result<usize, ResolveError> {
    let patches = arch
        .fixups
        .iter()
        .map(|(id, fixup)| {
            let (location, value) = expected_value(arch, id, fixup)?;
            Ok((id, location, fixup.size, value))
        })
        .collect::<Result<Vec<_>, ResolveError>>()?;

    let mut bytes = [0u8; 8];
    for (id, location, size, value) in &patches {
        let len = size.bytes() as usize;
        bytes[..len].copy_from_slice(&value.to_le_bytes()[..len]);
        if !arch.write(*location, &bytes[..len]) {
            return Err(ResolveError::Location {
                fixup: *id,
                location: format!("{location:#x}"),
            });
        }
    }
    tracing::debug!(count = patches.len(), "fixups resolved");
    Ok(patches.len())
}

/// Checks that every live field holds the value its target demands.
pub fn verify(arch: &Architecture) -> Result<(), ResolveError> {
    for (id, fixup) in arch.fixups.iter() {
        let (location, expected) = expected_value(arch, id, fixup)?;
        let len = fixup.size.bytes() as usize;
        let found = arch
            .read(location, len)
            .and_then(|b| read_le(b, 0, len))
            .ok_or_else(|| ResolveError::Location {
                fixup: id,
                location: format!("{location:#x}"),
            })?;
        if found != expected {
            return Err(ResolveError::Mismatch { fixup: id, found, expected });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::test_arch;
    use crate::model::{FunctionId, Isa, RuntimePlacement};

    #[test]
    fn relative_and_image_relative_values() {
        let mut arch = test_arch(Isa::X64, 0x400000, &[0u8; 32]);
        arch.vm_runtime = Some(RuntimePlacement {
            address: 0x402000,
            entry_offset: 0x400,
        });
        let call = arch.fixups.register(Fixup::new(
            FixupLocation::Native(0x401001),
            FixupTarget::VmEntry,
            FixupKind::Relative,
            OperandSize::Dword,
            -4,
        ));
        arch.fixups.register(Fixup::new(
            FixupLocation::Native(0x401010),
            FixupTarget::Runtime,
            FixupKind::ImageRelative,
            OperandSize::Dword,
            0,
        ));
        assert_eq!(resolve_all(&mut arch), Ok(2));
        assert_eq!(arch.read(0x401001, 4), Some(&0x13FBu32.to_le_bytes()[..]));
        assert_eq!(arch.read(0x401010, 4), Some(&0x2000u32.to_le_bytes()[..]));
        assert_eq!(verify(&arch), Ok(()));

        // Resolving again changes nothing.
        assert_eq!(resolve_all(&mut arch), Ok(2));
        assert_eq!(verify(&arch), Ok(()));

        assert!(arch.fixups.relink(call, FixupTarget::Address(0x401100)));
        assert!(matches!(verify(&arch), Err(ResolveError::Mismatch { .. })));
    }

    #[test]
    fn dangling_target_is_an_error_and_writes_nothing() {
        let mut arch = test_arch(Isa::X64, 0x400000, &[0xAA; 16]);
        arch.fixups.register(Fixup::new(
            FixupLocation::Native(0x401000),
            FixupTarget::Address(0x401008),
            FixupKind::Absolute,
            OperandSize::Qword,
            0,
        ));
        arch.fixups.register(Fixup::new(
            FixupLocation::Native(0x401008),
            FixupTarget::Function(FunctionId(7)),
            FixupKind::Relative,
            OperandSize::Dword,
            0,
        ));
        assert!(matches!(resolve_all(&mut arch), Err(ResolveError::Dangling { .. })));
        assert_eq!(arch.read(0x401000, 8), Some(&[0xAA; 8][..]));
    }

    #[test]
    fn overflow_and_retirement() {
        let mut arch = test_arch(Isa::X64, 0x400000, &[0u8; 16]);
        let id = arch.fixups.register(Fixup::new(
            FixupLocation::Native(0x401000),
            FixupTarget::Address(0x401200),
            FixupKind::Relative,
            OperandSize::Byte,
            0,
        ));
        assert!(matches!(
            resolve_all(&mut arch),
            Err(ResolveError::Overflow { bytes: 1, .. })
        ));
        assert_eq!(arch.fixups.retire_range(0x401000, 0x401001), 1);
        assert!(arch.fixups.get(id).is_some_and(|f| f.deleted));
        assert!(arch.fixups.is_empty());
        assert_eq!(resolve_all(&mut arch), Ok(0));
    }
}
