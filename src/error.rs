use thiserror::Error;

/// Fatal conditions that abort instrumentation of a unit.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum InstrumentError {
    #[error("parameter index {index} out of range for {parameter_count} parameters")]
    SlotOutOfRange { index: usize, parameter_count: usize },

    #[error("{class}.{method}: dynamic call site {site} binds {target}, which is not declared in the class")]
    MissingDynamicTarget {
        class: String,
        method: String,
        site: String,
        target: String,
    },

    #[error("{class}.{method}: illegal instruction for {matcher} matcher at index {index}")]
    IllegalInstruction {
        class: String,
        method: String,
        matcher: &'static str,
        index: usize,
    },

    #[error("{method}: label {label} is referenced but never placed")]
    DanglingLabel { method: String, label: u32 },

    #[error("{method}: label {label} is placed more than once")]
    DuplicateLabel { method: String, label: u32 },

    #[error("invalid descriptor {descriptor}: {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },
}

/// A valid class uses a construct the IR cannot express. Such units are passed through as is.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("constant pool index {index} is a dynamically-computed constant")]
pub(crate) struct DynamicConstant {
    pub(crate) index: u16,
}
