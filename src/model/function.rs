//! Functions and their command lists.

use std::fmt;
use std::str::FromStr;

use super::{Command, CommandId, FixupId, FunctionId, Isa, ProgramId};

/// How a function is emitted in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompilationType {
    /// Left exactly as it was.
    #[default]
    Unmodified,
    /// Rewritten inline. Nothing in this crate produces it yet.
    Mutation,
    /// Replaced by a trampoline into a VM program.
    Virtualization,
}

/// Evaluation-stack type of a managed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackType {
    I4,
    I8,
}

impl StackType {
    fn name(self) -> &'static str {
        match self {
            StackType::I4 => "i4",
            StackType::I8 => "i8",
        }
    }
}

/// Argument and local types of a managed method.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManagedSignature {
    pub args: Vec<StackType>,
    pub locals: Vec<StackType>,
    /// `None` for a void method.
    pub ret: Option<StackType>,
}

impl ManagedSignature {
    pub fn shape(&self) -> ManagedShape {
        ManagedShape {
            args: self.args.clone(),
            ret: self.ret,
        }
    }
}

/// Argument and return types a managed dispatch method is declared with, minus the
/// trailing `int32` program address. Written `i4,i8->i4`, `->void` and so on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ManagedShape {
    pub args: Vec<StackType>,
    pub ret: Option<StackType>,
}

impl FromStr for ManagedShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (args, ret) = s
            .split_once("->")
            .ok_or_else(|| format!("`{s}` has no `->`"))?;
        let ty = |t: &str| match t.trim() {
            "i4" => Ok(StackType::I4),
            "i8" => Ok(StackType::I8),
            other => Err(format!("unknown stack type `{other}`")),
        };
        let args = if args.trim().is_empty() {
            Vec::new()
        } else {
            args.split(',').map(ty).collect::<Result<_, _>>()?
        };
        let ret = match ret.trim() {
            "void" => None,
            t => Some(ty(t)?),
        };
        Ok(Self { args, ret })
    }
}

impl fmt::Display for ManagedShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(arg.name())?;
        }
        write!(f, "->{}", self.ret.map_or("void", StackType::name))
    }
}

/// A reference into one function from a command of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtCommand {
    /// Address of the referencing command.
    pub address: u64,
    pub from: FunctionId,
    pub command: CommandId,
    /// Address referenced.
    pub target: u64,
    /// Whether the reference is a call (as opposed to a jump).
    pub use_call: bool,
    /// The fixup registered for it, when it points at the entry.
    pub fixup: Option<FixupId>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    /// Demangled name, for diagnostics.
    pub display_name: String,
    /// Entry address.
    pub address: u64,
    /// Size recorded by the format, if any.
    pub size: Option<u64>,
    /// Upper bound used while decoding.
    pub limit: Option<u64>,
    /// End of the claimed range `[address, end)`; zero until decoded.
    pub end: u64,
    pub isa: Isa,
    pub compilation_type: CompilationType,
    /// Selected by a directive.
    pub need_compile: bool,
    pub commands: Vec<Command>,
    /// References from other functions into this one.
    pub ext_commands: Vec<ExtCommand>,
    /// At least one branch or call target is computed at run time.
    pub unresolved: bool,
    /// Decoding failed; the function is left untouched.
    pub decode_failed: bool,
    pub signature: Option<ManagedSignature>,
    /// Evaluation-stack depth declared by a managed body header.
    pub max_stack: Option<u16>,
    /// Once set, virtualization is never attempted again.
    pub ineligible: Option<String>,
    pub program: Option<ProgramId>,
}

impl Function {
    pub fn new(id: FunctionId, name: impl Into<String>, address: u64, isa: Isa) -> Self {
        let name = name.into();
        Self {
            id,
            display_name: crate::demangle::display_name(&name),
            name,
            address,
            size: None,
            limit: None,
            end: 0,
            isa,
            compilation_type: CompilationType::Unmodified,
            need_compile: false,
            commands: Vec::new(),
            ext_commands: Vec::new(),
            unresolved: false,
            decode_failed: false,
            signature: None,
            max_stack: None,
            ineligible: None,
            program: None,
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end
    }

    pub fn range_len(&self) -> u64 {
        self.end.saturating_sub(self.address)
    }

    pub fn is_decoded(&self) -> bool {
        !self.commands.is_empty()
    }

    pub fn command(&self, id: CommandId) -> Option<&Command> {
        self.commands.get(id.index())
    }

    pub fn command_at(&self, address: u64) -> Option<CommandId> {
        self.commands
            .binary_search_by_key(&address, |c| c.address)
            .ok()
            .map(CommandId::from_index)
    }
}
