use std::str::FromStr;

use jdescriptor::{MethodDescriptor, TypeDescriptor};

use crate::error::InstrumentError;

pub(crate) const STRING_TYPE: &str = "java/lang/String";

pub(crate) fn parse_method(descriptor: &str) -> Result<MethodDescriptor, InstrumentError> {
    MethodDescriptor::from_str(descriptor).map_err(|err| InstrumentError::InvalidDescriptor {
        descriptor: descriptor.to_string(),
        reason: err.to_string(),
    })
}

/// Number of local variable slots a value of this type occupies.
pub(crate) fn type_width(descriptor: &TypeDescriptor) -> u16 {
    match descriptor {
        TypeDescriptor::Long | TypeDescriptor::Double => 2,
        _ => 1,
    }
}

pub(crate) fn parameter_widths(descriptor: &MethodDescriptor) -> Vec<u16> {
    descriptor.parameter_types().iter().map(type_width).collect()
}

/// Local slot of parameter `index`: `base` plus the widths of every preceding parameter.
pub(crate) fn slot_offset(widths: &[u16], index: usize, base: u16) -> Result<u16, InstrumentError> {
    if index >= widths.len() {
        return Err(InstrumentError::SlotOutOfRange {
            index,
            parameter_count: widths.len(),
        });
    }
    Ok(base + widths[..index].iter().sum::<u16>())
}

/// Index of the first parameter whose descriptor equals `type_descriptor`.
pub(crate) fn first_parameter_of_type(
    descriptor: &MethodDescriptor,
    type_descriptor: &str,
) -> Option<usize> {
    descriptor
        .parameter_types()
        .iter()
        .position(|parameter| parameter.to_string() == type_descriptor)
}

/// Return `descriptor` with `parameter` appended to its parameter list.
pub(crate) fn append_parameter(
    descriptor: &str,
    parameter: TypeDescriptor,
) -> Result<String, InstrumentError> {
    let parsed = parse_method(descriptor)?;
    let mut parameters = parsed.parameter_types().clone();
    parameters.push(parameter);
    Ok(MethodDescriptor::new(parameters, parsed.return_type().clone()).to_string())
}

pub(crate) fn string_type() -> TypeDescriptor {
    TypeDescriptor::Object(STRING_TYPE.to_string())
}

pub(crate) fn simple_class_name(internal_name: &str) -> &str {
    internal_name
        .rsplit('/')
        .next()
        .unwrap_or(internal_name)
}

/// Normalise a dotted or slashed class name to the internal form.
pub(crate) fn internal_name(name: &str) -> String {
    name.replace('.', "/")
}
