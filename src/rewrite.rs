//! Primitive edits on the IR. Every edit marks the touched method as modified.

use crate::descriptor::{append_parameter, string_type};
use crate::error::InstrumentError;
use crate::ir::{Class, Instruction, Method};

pub(crate) fn insert_before(method: &mut Method, index: usize, instructions: Vec<Instruction>) {
    method.instructions.splice(index..index, instructions);
    method.modified = true;
}

pub(crate) fn insert_at_start(method: &mut Method, instructions: Vec<Instruction>) {
    insert_before(method, 0, instructions);
}

/// Point the call at `index` to a new owner, keeping name and descriptor.
pub(crate) fn retarget_call(
    class_name: &str,
    method: &mut Method,
    index: usize,
    owner: &str,
) -> Result<(), InstrumentError> {
    match method.instructions.get_mut(index) {
        Some(Instruction::Invoke(call)) => {
            call.owner = owner.to_string();
            method.modified = true;
            Ok(())
        }
        _ => Err(illegal(class_name, method, "call retarget", index)),
    }
}

/// Change the type constructed by the `new` at `index`.
pub(crate) fn retarget_construction(
    class_name: &str,
    method: &mut Method,
    index: usize,
    class: &str,
) -> Result<(), InstrumentError> {
    match method.instructions.get_mut(index) {
        Some(Instruction::New(name)) => {
            *name = class.to_string();
            method.modified = true;
            Ok(())
        }
        _ => Err(illegal(class_name, method, "construction retarget", index)),
    }
}

/// Append a string parameter to the call at `index` and load `value` right before it.
///
/// The call moves one position forward; its new index is returned.
pub(crate) fn append_string_argument(
    class_name: &str,
    method: &mut Method,
    index: usize,
    value: &str,
) -> Result<usize, InstrumentError> {
    let Some(Instruction::Invoke(call)) = method.instructions.get_mut(index) else {
        return Err(illegal(class_name, method, "argument append", index));
    };
    call.descriptor = append_parameter(&call.descriptor, string_type())?;
    insert_before(method, index, vec![Instruction::load_string(value)]);
    Ok(index + 1)
}

/// Add `method` unless the class already declares the same name and descriptor.
pub(crate) fn add_method(class: &mut Class, mut method: Method) -> bool {
    if class.find_method(&method.name, &method.descriptor).is_some() {
        return false;
    }
    method.modified = true;
    class.methods.push(method);
    true
}

fn illegal(class_name: &str, method: &Method, matcher: &'static str, index: usize) -> InstrumentError {
    InstrumentError::IllegalInstruction {
        class: class_name.to_string(),
        method: method.name_with_descriptor(),
        matcher,
        index,
    }
}
