//! Stateless predicates deciding whether a class, method or instruction is a hook point.

use std::collections::BTreeSet;

use crate::config::{AccessKind, AccessPattern, CallbackShape};
use crate::ir::{CallKind, Class, DynamicCallSite, FieldOp, Instruction, Method};

pub(crate) fn matches_prefix(class_name: &str, prefixes: &[String]) -> bool {
    prefixes
        .iter()
        .any(|prefix| class_name.starts_with(prefix.as_str()))
}

/// First annotation on `method` that belongs to `markers`.
pub(crate) fn marker_annotation<'a>(method: &'a Method, markers: &BTreeSet<String>) -> Option<&'a str> {
    method
        .annotations
        .iter()
        .map(|annotation| annotation.descriptor.as_str())
        .find(|descriptor| markers.contains(*descriptor))
}

/// Callback shape `method` overrides, judged by the class's interfaces and the exact signature.
pub(crate) fn overridden_callback<'a>(
    class: &Class,
    method: &Method,
    shapes: &'a [CallbackShape],
) -> Option<&'a CallbackShape> {
    if class.interfaces.is_empty() {
        return None;
    }
    let signature = method.name_with_descriptor();
    shapes
        .iter()
        .find(|shape| class.implements(&shape.interface) && signature == shape.name_with_descriptor())
}

/// Whether a dynamic call site produces one of the callback interfaces.
pub(crate) fn is_callback_site(site: &DynamicCallSite, shapes: &[CallbackShape]) -> bool {
    shapes
        .iter()
        .any(|shape| site.name == shape.name && site.descriptor.ends_with(&shape.interface_suffix))
}

/// Dynamic call sites of `method` accepted by `filter`, with their instruction index.
pub(crate) fn dynamic_call_sites<'a>(
    method: &'a Method,
    filter: impl Fn(&DynamicCallSite) -> bool,
) -> Vec<(usize, &'a DynamicCallSite)> {
    method
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(index, instruction)| match instruction {
            Instruction::InvokeDynamic(site) if filter(site) => Some((index, site)),
            _ => None,
        })
        .collect()
}

/// Whether the instruction performs one of the configured sensitive accesses.
pub(crate) fn is_sensitive_access(instruction: &Instruction, patterns: &[AccessPattern]) -> bool {
    match instruction {
        Instruction::Invoke(call) => patterns.iter().any(|pattern| {
            pattern.kind == AccessKind::Method
                && pattern.owner == call.owner
                && pattern.name == call.name
                && pattern.descriptor == call.descriptor
        }),
        Instruction::Field { op, field } => {
            matches!(op, FieldOp::GetStatic | FieldOp::GetField)
                && patterns.iter().any(|pattern| {
                    pattern.kind == AccessKind::Field
                        && pattern.owner == field.owner
                        && pattern.name == field.name
                        && pattern.descriptor == field.descriptor
                })
        }
        Instruction::Label(_)
        | Instruction::Load { .. }
        | Instruction::Store { .. }
        | Instruction::Increment { .. }
        | Instruction::Ret { .. }
        | Instruction::Constant(_)
        | Instruction::InvokeDynamic(_)
        | Instruction::New(_)
        | Instruction::TypeCheck { .. }
        | Instruction::NewPrimitiveArray(_)
        | Instruction::MultiNewArray { .. }
        | Instruction::Jump { .. }
        | Instruction::Switch { .. }
        | Instruction::Return(_)
        | Instruction::Simple(_) => false,
    }
}

/// Whether the instruction is a static call `owner.name` with `name` in `names`.
pub(crate) fn is_static_call_into(instruction: &Instruction, owner: &str, names: &BTreeSet<String>) -> bool {
    matches!(
        instruction,
        Instruction::Invoke(call)
            if call.kind == CallKind::Static && call.owner == owner && names.contains(&call.name)
    )
}

pub(crate) fn is_construction_of(instruction: &Instruction, class_name: &str) -> bool {
    matches!(instruction, Instruction::New(name) if name == class_name)
}

pub(crate) fn is_initializer_of(instruction: &Instruction, class_name: &str) -> bool {
    matches!(
        instruction,
        Instruction::Invoke(call)
            if call.kind == CallKind::Special && call.owner == class_name && call.name == "<init>"
    )
}
