//! Per-run VM parameters.

use super::OpcodeMap;
use crate::model::{ManagedShape, ManagedSignature};

/// Bytes the native interpreter reserves below the emulated stack pointer before
/// it pushes its own state. The emulated frame must fit inside this gap.
pub const STACK_GAP: u64 = 0x2000;

/// Largest static stack frame a virtualized function may build.
pub const MAX_FRAME: u64 = STACK_GAP / 2;

/// A managed dispatch method: IL trampolines of methods with signature `shape`
/// call `token` with their arguments followed by the program address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedDispatch {
    pub shape: ManagedShape,
    pub token: u32,
}

#[derive(Debug, Clone)]
pub struct VmProfile {
    pub seed: u64,
    pub opcodes: OpcodeMap,
    /// Only materialize flags that a later command reads.
    pub optimize_flags: bool,
    pub max_frame: u64,
    pub managed_dispatch: Vec<ManagedDispatch>,
}

impl VmProfile {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            opcodes: OpcodeMap::new(seed),
            optimize_flags: false,
            max_frame: MAX_FRAME,
            managed_dispatch: Vec::new(),
        }
    }

    /// Token of the dispatch method declared with the same shape as `signature`.
    pub fn dispatch_token(&self, signature: &ManagedSignature) -> Option<u32> {
        let shape = signature.shape();
        self.managed_dispatch.iter().find(|d| d.shape == shape).map(|d| d.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StackType;

    #[test]
    fn dispatch_is_chosen_by_signature_shape() {
        let mut profile = VmProfile::new(0);
        profile.managed_dispatch = vec![
            ManagedDispatch { shape: "i4,i4->i4".parse().expect("shape"), token: 0x0600_0002 },
            ManagedDispatch { shape: "i8->void".parse().expect("shape"), token: 0x0600_0003 },
        ];
        let mut signature = ManagedSignature {
            args: vec![StackType::I4, StackType::I4],
            locals: vec![StackType::I8],
            ret: Some(StackType::I4),
        };
        assert_eq!(profile.dispatch_token(&signature), Some(0x0600_0002));
        signature.ret = None;
        assert_eq!(profile.dispatch_token(&signature), None);
        signature.args = vec![StackType::I8];
        assert_eq!(profile.dispatch_token(&signature), Some(0x0600_0003));
    }
}
