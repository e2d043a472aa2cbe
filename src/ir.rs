use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::InstrumentError;

#[cfg(test)]
pub(crate) const ACC_PUBLIC: u16 = 0x0001;
pub(crate) const ACC_PRIVATE: u16 = 0x0002;
pub(crate) const ACC_STATIC: u16 = 0x0008;
pub(crate) const ACC_INTERFACE: u16 = 0x0200;
pub(crate) const ACC_SYNTHETIC: u16 = 0x1000;

/// Intermediate representation for a JVM class under instrumentation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Class {
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    #[serde(default)]
    pub(crate) interfaces: Vec<String>,
    #[serde(default)]
    pub(crate) access_flags: u16,
    #[serde(default)]
    pub(crate) annotations: Vec<Annotation>,
    #[serde(default)]
    pub(crate) methods: Vec<Method>,
}

impl Class {
    /// Class name without its package, e.g. `Worker` for `com/example/Worker`.
    pub(crate) fn simple_name(&self) -> &str {
        crate::descriptor::simple_class_name(&self.name)
    }

    pub(crate) fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub(crate) fn implements(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|name| name == interface)
    }

    pub(crate) fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods
            .iter()
            .position(|method| method.name == name && method.descriptor == descriptor)
    }
}

/// Intermediate representation for a method and its instruction stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    #[serde(default)]
    pub(crate) access_flags: u16,
    #[serde(default)]
    pub(crate) annotations: Vec<Annotation>,
    #[serde(default)]
    pub(crate) instructions: Vec<Instruction>,
    #[serde(default)]
    pub(crate) try_catch_blocks: Vec<TryCatchBlock>,
    #[serde(default)]
    pub(crate) next_label: u32,
    /// Set by every rewrite; the serializer recomputes frames for these methods only.
    #[serde(default)]
    pub(crate) modified: bool,
}

impl Method {
    pub(crate) fn new(name: &str, descriptor: &str, access_flags: u16) -> Self {
        Method {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access_flags,
            annotations: Vec::new(),
            instructions: Vec::new(),
            try_catch_blocks: Vec::new(),
            next_label: 0,
            modified: false,
        }
    }

    pub(crate) fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub(crate) fn name_with_descriptor(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }

    /// Allocate a label id that is not referenced anywhere in this method.
    pub(crate) fn fresh_label(&mut self) -> Label {
        let used = self
            .instructions
            .iter()
            .flat_map(Instruction::labels)
            .chain(self.try_catch_blocks.iter().flat_map(TryCatchBlock::labels))
            .map(|label| label.0 + 1)
            .max()
            .unwrap_or(0);
        let id = used.max(self.next_label);
        self.next_label = id + 1;
        Label(id)
    }

    /// Verify that every label is defined once and every reference hits a definition.
    pub(crate) fn check_labels(&self) -> Result<(), InstrumentError> {
        let mut defined = BTreeSet::new();
        for instruction in &self.instructions {
            if let Instruction::Label(label) = instruction {
                if !defined.insert(*label) {
                    return Err(InstrumentError::DuplicateLabel {
                        method: self.name_with_descriptor(),
                        label: label.0,
                    });
                }
            }
        }
        let referenced = self
            .instructions
            .iter()
            .filter(|instruction| !matches!(instruction, Instruction::Label(_)))
            .flat_map(Instruction::labels)
            .chain(self.try_catch_blocks.iter().flat_map(TryCatchBlock::labels));
        for label in referenced {
            if !defined.contains(&label) {
                return Err(InstrumentError::DanglingLabel {
                    method: self.name_with_descriptor(),
                    label: label.0,
                });
            }
        }
        Ok(())
    }
}

/// Visible annotation attached to a class or method.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Annotation {
    pub(crate) descriptor: String,
}

/// Exception handler range expressed with labels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TryCatchBlock {
    pub(crate) start: Label,
    pub(crate) end: Label,
    pub(crate) handler: Label,
    pub(crate) catch_type: Option<String>,
}

impl TryCatchBlock {
    fn labels(&self) -> [Label; 3] {
        [self.start, self.end, self.handler]
    }
}

/// Position anchor in an instruction stream, stable across inserts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct Label(pub(crate) u32);

/// Bytecode instruction in symbolic form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum Instruction {
    Label(Label),
    Load { kind: ValueKind, slot: u16 },
    Store { kind: ValueKind, slot: u16 },
    Increment { slot: u16, delta: i16 },
    Ret { slot: u16 },
    Constant(Constant),
    Invoke(MethodCall),
    InvokeDynamic(DynamicCallSite),
    Field { op: FieldOp, field: MemberRef },
    New(String),
    TypeCheck { op: TypeOp, class: String },
    NewPrimitiveArray(u8),
    MultiNewArray { class: String, dimensions: u8 },
    Jump { opcode: u8, target: Label },
    Switch { default: Label, cases: Vec<(i32, Label)> },
    Return(Option<ValueKind>),
    /// Any opcode without operands (stack, arithmetic, array access, monitors, athrow).
    Simple(u8),
}

impl Instruction {
    /// Labels defined or referenced by this instruction.
    pub(crate) fn labels(&self) -> Vec<Label> {
        match self {
            Instruction::Label(label) => vec![*label],
            Instruction::Jump { target, .. } => vec![*target],
            Instruction::Switch { default, cases } => std::iter::once(*default)
                .chain(cases.iter().map(|(_, label)| *label))
                .collect(),
            Instruction::Load { .. }
            | Instruction::Store { .. }
            | Instruction::Increment { .. }
            | Instruction::Ret { .. }
            | Instruction::Constant(_)
            | Instruction::Invoke(_)
            | Instruction::InvokeDynamic(_)
            | Instruction::Field { .. }
            | Instruction::New(_)
            | Instruction::TypeCheck { .. }
            | Instruction::NewPrimitiveArray(_)
            | Instruction::MultiNewArray { .. }
            | Instruction::Return(_)
            | Instruction::Simple(_) => Vec::new(),
        }
    }

    pub(crate) fn load_string(value: &str) -> Self {
        Instruction::Constant(Constant::String(value.to_string()))
    }
}

/// Operand type of a local variable or return instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

/// Constant pushed onto the operand stack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum Constant {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Class(String),
    MethodType(String),
    MethodHandle(MethodHandle),
}

/// Reference to a field or method by owner, name and descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct MemberRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl MemberRef {
    pub(crate) fn new(owner: &str, name: &str, descriptor: &str) -> Self {
        MemberRef {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

/// Method invocation site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MethodCall {
    pub(crate) kind: CallKind,
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    #[serde(default)]
    pub(crate) interface: bool,
}

impl MethodCall {
    pub(crate) fn new(kind: CallKind, member: &MemberRef) -> Self {
        MethodCall {
            kind,
            owner: member.owner.clone(),
            name: member.name.clone(),
            descriptor: member.descriptor.clone(),
            interface: kind == CallKind::Interface,
        }
    }
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

/// Field access opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) enum FieldOp {
    GetStatic,
    PutStatic,
    GetField,
    PutField,
}

/// Opcodes that take a single class operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) enum TypeOp {
    CheckCast,
    InstanceOf,
    NewArray,
}

/// Dynamically-bound call site (`invokedynamic`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct DynamicCallSite {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) bootstrap: MethodHandle,
    #[serde(default)]
    pub(crate) arguments: Vec<Constant>,
}

impl DynamicCallSite {
    /// Implementation method bound by a lambda metafactory call site.
    pub(crate) fn bound_target(&self) -> Option<&MethodHandle> {
        match self.arguments.get(1) {
            Some(Constant::MethodHandle(handle)) => Some(handle),
            _ => None,
        }
    }
}

/// Method handle constant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MethodHandle {
    pub(crate) kind: u8,
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    #[serde(default)]
    pub(crate) interface: bool,
}
