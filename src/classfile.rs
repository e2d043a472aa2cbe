use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use jclassfile::attributes::{Attribute, BootstrapMethodRecord, ExceptionRecord};
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;

use crate::error::DynamicConstant;
use crate::ir::{
    Annotation, CallKind, Class, Constant, DynamicCallSite, FieldOp, Instruction, Label,
    MemberRef, Method, MethodCall, MethodHandle, TryCatchBlock, TypeOp, ValueKind,
};
use crate::opcodes;

/// Decode class-file bytes into the symbolic IR.
///
/// Branch, switch and exception-table offsets become labels whose ids are the bytecode
/// offsets they mark, so every decoded method starts with `next_label` past its code length.
pub(crate) fn decode_class(bytes: &[u8]) -> Result<Class> {
    let file = class_file::parse(bytes).context("failed to parse class file")?;
    let pool = Pool(file.constant_pool());

    let name = pool.class_name(file.this_class())?.to_string();
    let super_name = match file.super_class() {
        0 => None,
        index => Some(pool.class_name(index)?.to_string()),
    };
    let interfaces = file
        .interfaces()
        .iter()
        .map(|index| pool.class_name(*index).map(str::to_string))
        .collect::<Result<Vec<_>>>()?;
    let bootstraps = file
        .attributes()
        .iter()
        .find_map(|attribute| match attribute {
            Attribute::BootstrapMethods { bootstrap_methods } => Some(bootstrap_methods.as_slice()),
            _ => None,
        })
        .unwrap_or(&[]);

    let mut methods = Vec::with_capacity(file.methods().len());
    for info in file.methods() {
        let method_name = pool.utf8(info.name_index())?;
        let descriptor = pool.utf8(info.descriptor_index())?;
        let mut method = Method::new(method_name, descriptor, info.access_flags().bits());
        method.annotations = pool.annotations(info.attributes())?;
        if let Some((code, exception_table)) = code_attribute(info.attributes()) {
            decode_code(&pool, bootstraps, code, exception_table, &mut method)
                .with_context(|| format!("failed to decode {name}.{method_name}{descriptor}"))?;
        }
        methods.push(method);
    }

    Ok(Class {
        annotations: pool.annotations(file.attributes())?,
        access_flags: file.access_flags().bits(),
        name,
        super_name,
        interfaces,
        methods,
    })
}

fn code_attribute(attributes: &[Attribute]) -> Option<(&[u8], &[ExceptionRecord])> {
    attributes.iter().find_map(|attribute| match attribute {
        Attribute::Code {
            code,
            exception_table,
            ..
        } => Some((code.as_slice(), exception_table.as_slice())),
        _ => None,
    })
}

/// Constant pool view with typed lookups.
struct Pool<'a>(&'a [ConstantPool]);

impl<'a> Pool<'a> {
    fn entry(&self, index: u16) -> Result<&'a ConstantPool> {
        self.0
            .get(index as usize)
            .with_context(|| format!("constant pool index {index} out of range"))
    }

    fn utf8(&self, index: u16) -> Result<&'a str> {
        match self.entry(index)? {
            ConstantPool::Utf8 { value } => Ok(value),
            other => bail!("constant pool index {index} is not a Utf8 entry: {other:?}"),
        }
    }

    fn class_name(&self, index: u16) -> Result<&'a str> {
        match self.entry(index)? {
            ConstantPool::Class { name_index } => self.utf8(*name_index),
            other => bail!("constant pool index {index} is not a Class entry: {other:?}"),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(&'a str, &'a str)> {
        match self.entry(index)? {
            ConstantPool::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            other => bail!("constant pool index {index} is not a NameAndType entry: {other:?}"),
        }
    }

    /// Field or method reference, and whether it names an interface method.
    fn member(&self, index: u16) -> Result<(MemberRef, bool)> {
        let (class_index, name_and_type_index, interface) = match self.entry(index)? {
            ConstantPool::Fieldref {
                class_index,
                name_and_type_index,
            }
            | ConstantPool::Methodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, false),
            ConstantPool::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, true),
            other => bail!("constant pool index {index} is not a member reference: {other:?}"),
        };
        let owner = self.class_name(class_index)?;
        let (name, descriptor) = self.name_and_type(name_and_type_index)?;
        Ok((MemberRef::new(owner, name, descriptor), interface))
    }

    fn method_handle(&self, index: u16) -> Result<MethodHandle> {
        match self.entry(index)? {
            ConstantPool::MethodHandle {
                reference_kind,
                reference_index,
            } => {
                let (member, interface) = self.member(*reference_index)?;
                Ok(MethodHandle {
                    kind: *reference_kind,
                    owner: member.owner,
                    name: member.name,
                    descriptor: member.descriptor,
                    interface,
                })
            }
            other => bail!("constant pool index {index} is not a MethodHandle entry: {other:?}"),
        }
    }

    /// Constant usable by `ldc` or as a bootstrap argument.
    fn loadable(&self, index: u16) -> Result<Constant> {
        let constant = match self.entry(index)? {
            ConstantPool::Integer { value } => Constant::Int(*value),
            ConstantPool::Float { value } => Constant::Float(*value),
            ConstantPool::Long { value } => Constant::Long(*value),
            ConstantPool::Double { value } => Constant::Double(*value),
            ConstantPool::String { string_index } => {
                Constant::String(self.utf8(*string_index)?.to_string())
            }
            ConstantPool::Class { name_index } => Constant::Class(self.utf8(*name_index)?.to_string()),
            ConstantPool::MethodType { descriptor_index } => {
                Constant::MethodType(self.utf8(*descriptor_index)?.to_string())
            }
            ConstantPool::MethodHandle { .. } => Constant::MethodHandle(self.method_handle(index)?),
            ConstantPool::Dynamic { .. } => return Err(DynamicConstant { index }.into()),
            other => bail!("constant pool index {index} is not a loadable constant: {other:?}"),
        };
        Ok(constant)
    }

    fn annotations(&self, attributes: &[Attribute]) -> Result<Vec<Annotation>> {
        let mut annotations = Vec::new();
        for attribute in attributes {
            if let Attribute::RuntimeVisibleAnnotations {
                annotations: visible,
                ..
            } = attribute
            {
                for annotation in visible {
                    annotations.push(Annotation {
                        descriptor: self.utf8(annotation.type_index())?.to_string(),
                    });
                }
            }
        }
        Ok(annotations)
    }
}

fn decode_code(
    pool: &Pool<'_>,
    bootstraps: &[BootstrapMethodRecord],
    code: &[u8],
    exception_table: &[ExceptionRecord],
    method: &mut Method,
) -> Result<()> {
    let mut decoded = Vec::new();
    let mut starts = BTreeSet::new();
    let mut targets = BTreeSet::new();
    let mut offset = 0;
    while offset < code.len() {
        let (instruction, length) = decode_instruction(pool, bootstraps, code, offset)
            .with_context(|| format!("invalid instruction at offset {offset}"))?;
        targets.extend(instruction.labels());
        starts.insert(offset as u32);
        decoded.push((offset, instruction));
        offset += length;
    }
    // Ranges may end at the code length.
    starts.insert(code.len() as u32);

    for record in exception_table {
        let catch_type = match record.catch_type() {
            0 => None,
            index => Some(pool.class_name(index)?.to_string()),
        };
        let block = TryCatchBlock {
            start: Label(u32::from(record.start_pc())),
            end: Label(u32::from(record.end_pc())),
            handler: Label(u32::from(record.handler_pc())),
            catch_type,
        };
        targets.extend([block.start, block.end, block.handler]);
        method.try_catch_blocks.push(block);
    }
    if let Some(stray) = targets.iter().find(|label| !starts.contains(&label.0)) {
        bail!("offset {} is not an instruction boundary", stray.0);
    }

    method.instructions.reserve(decoded.len() + targets.len());
    for (offset, instruction) in decoded {
        let label = Label(offset as u32);
        if targets.contains(&label) {
            method.instructions.push(Instruction::Label(label));
        }
        method.instructions.push(instruction);
    }
    let end = Label(code.len() as u32);
    if targets.contains(&end) {
        method.instructions.push(Instruction::Label(end));
    }
    method.next_label = code.len() as u32 + 1;
    Ok(())
}

/// Decode the instruction at `offset`, returning it with its encoded length.
fn decode_instruction(
    pool: &Pool<'_>,
    bootstraps: &[BootstrapMethodRecord],
    code: &[u8],
    offset: usize,
) -> Result<(Instruction, usize)> {
    let opcode = read_u8(code, offset)?;
    let decoded = match opcode {
        opcodes::ACONST_NULL => (Instruction::Constant(Constant::Null), 1),
        opcodes::ICONST_M1..=opcodes::ICONST_5 => (
            Instruction::Constant(Constant::Int(
                i32::from(opcode) - i32::from(opcodes::ICONST_0),
            )),
            1,
        ),
        opcodes::LCONST_0..=opcodes::LCONST_1 => (
            Instruction::Constant(Constant::Long(i64::from(opcode - opcodes::LCONST_0))),
            1,
        ),
        opcodes::FCONST_0..=opcodes::FCONST_2 => (
            Instruction::Constant(Constant::Float(f32::from(opcode - opcodes::FCONST_0))),
            1,
        ),
        opcodes::DCONST_0..=opcodes::DCONST_1 => (
            Instruction::Constant(Constant::Double(f64::from(opcode - opcodes::DCONST_0))),
            1,
        ),
        opcodes::BIPUSH => (
            Instruction::Constant(Constant::Int(i32::from(read_u8(code, offset + 1)? as i8))),
            2,
        ),
        opcodes::SIPUSH => (
            Instruction::Constant(Constant::Int(i32::from(read_i16(code, offset + 1)?))),
            3,
        ),
        opcodes::LDC => (
            Instruction::Constant(pool.loadable(u16::from(read_u8(code, offset + 1)?))?),
            2,
        ),
        opcodes::LDC_W | opcodes::LDC2_W => (
            Instruction::Constant(pool.loadable(read_u16(code, offset + 1)?)?),
            3,
        ),
        opcodes::ILOAD..=opcodes::ALOAD => (
            Instruction::Load {
                kind: value_kind(opcode - opcodes::ILOAD),
                slot: u16::from(read_u8(code, offset + 1)?),
            },
            2,
        ),
        opcodes::ILOAD_0..=opcodes::ALOAD_3 => {
            let index = opcode - opcodes::ILOAD_0;
            (
                Instruction::Load {
                    kind: value_kind(index / 4),
                    slot: u16::from(index % 4),
                },
                1,
            )
        }
        opcodes::ISTORE..=opcodes::ASTORE => (
            Instruction::Store {
                kind: value_kind(opcode - opcodes::ISTORE),
                slot: u16::from(read_u8(code, offset + 1)?),
            },
            2,
        ),
        opcodes::ISTORE_0..=opcodes::ASTORE_3 => {
            let index = opcode - opcodes::ISTORE_0;
            (
                Instruction::Store {
                    kind: value_kind(index / 4),
                    slot: u16::from(index % 4),
                },
                1,
            )
        }
        opcodes::IINC => (
            Instruction::Increment {
                slot: u16::from(read_u8(code, offset + 1)?),
                delta: i16::from(read_u8(code, offset + 2)? as i8),
            },
            3,
        ),
        opcodes::IFEQ..=opcodes::JSR | opcodes::IFNULL | opcodes::IFNONNULL => (
            Instruction::Jump {
                opcode,
                target: branch(code, offset, i32::from(read_i16(code, offset + 1)?))?,
            },
            3,
        ),
        opcodes::GOTO_W | opcodes::JSR_W => (
            Instruction::Jump {
                opcode,
                target: branch(code, offset, read_i32(code, offset + 1)?)?,
            },
            5,
        ),
        opcodes::RET => (
            Instruction::Ret {
                slot: u16::from(read_u8(code, offset + 1)?),
            },
            2,
        ),
        opcodes::TABLESWITCH => table_switch(code, offset)?,
        opcodes::LOOKUPSWITCH => lookup_switch(code, offset)?,
        opcodes::IRETURN..=opcodes::ARETURN => {
            (Instruction::Return(Some(value_kind(opcode - opcodes::IRETURN))), 1)
        }
        opcodes::RETURN => (Instruction::Return(None), 1),
        opcodes::GETSTATIC..=opcodes::PUTFIELD => {
            let (field, _) = pool.member(read_u16(code, offset + 1)?)?;
            (
                Instruction::Field {
                    op: field_op(opcode),
                    field,
                },
                3,
            )
        }
        opcodes::INVOKEVIRTUAL..=opcodes::INVOKEINTERFACE => {
            let (member, interface) = pool.member(read_u16(code, offset + 1)?)?;
            let kind = match opcode {
                opcodes::INVOKEVIRTUAL => CallKind::Virtual,
                opcodes::INVOKESPECIAL => CallKind::Special,
                opcodes::INVOKESTATIC => CallKind::Static,
                _ => CallKind::Interface,
            };
            let call = MethodCall {
                kind,
                owner: member.owner,
                name: member.name,
                descriptor: member.descriptor,
                interface,
            };
            let length = if kind == CallKind::Interface { 5 } else { 3 };
            (Instruction::Invoke(call), length)
        }
        opcodes::INVOKEDYNAMIC => (
            Instruction::InvokeDynamic(call_site(pool, bootstraps, read_u16(code, offset + 1)?)?),
            5,
        ),
        opcodes::NEW => (
            Instruction::New(pool.class_name(read_u16(code, offset + 1)?)?.to_string()),
            3,
        ),
        opcodes::NEWARRAY => (Instruction::NewPrimitiveArray(read_u8(code, offset + 1)?), 2),
        opcodes::ANEWARRAY | opcodes::CHECKCAST | opcodes::INSTANCEOF => {
            let op = match opcode {
                opcodes::ANEWARRAY => TypeOp::NewArray,
                opcodes::CHECKCAST => TypeOp::CheckCast,
                _ => TypeOp::InstanceOf,
            };
            let class = pool.class_name(read_u16(code, offset + 1)?)?.to_string();
            (Instruction::TypeCheck { op, class }, 3)
        }
        opcodes::WIDE => wide(code, offset)?,
        opcodes::MULTIANEWARRAY => (
            Instruction::MultiNewArray {
                class: pool.class_name(read_u16(code, offset + 1)?)?.to_string(),
                dimensions: read_u8(code, offset + 3)?,
            },
            4,
        ),
        0xca..=0xff => bail!("unsupported opcode 0x{opcode:02x}"),
        _ => (Instruction::Simple(opcode), 1),
    };
    Ok(decoded)
}

fn call_site(
    pool: &Pool<'_>,
    bootstraps: &[BootstrapMethodRecord],
    index: u16,
) -> Result<DynamicCallSite> {
    let (bootstrap_index, name_and_type_index) = match pool.entry(index)? {
        ConstantPool::InvokeDynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        } => (*bootstrap_method_attr_index, *name_and_type_index),
        other => bail!("constant pool index {index} is not an InvokeDynamic entry: {other:?}"),
    };
    let (name, descriptor) = pool.name_and_type(name_and_type_index)?;
    let record = bootstraps
        .get(bootstrap_index as usize)
        .with_context(|| format!("bootstrap method {bootstrap_index} not found"))?;
    let arguments = record
        .bootstrap_arguments()
        .iter()
        .map(|argument| pool.loadable(*argument))
        .collect::<Result<Vec<_>>>()?;
    Ok(DynamicCallSite {
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        bootstrap: pool.method_handle(record.bootstrap_method_ref())?,
        arguments,
    })
}

fn wide(code: &[u8], offset: usize) -> Result<(Instruction, usize)> {
    let opcode = read_u8(code, offset + 1)?;
    let slot = read_u16(code, offset + 2)?;
    let decoded = match opcode {
        opcodes::IINC => (
            Instruction::Increment {
                slot,
                delta: read_i16(code, offset + 4)?,
            },
            6,
        ),
        opcodes::ILOAD..=opcodes::ALOAD => (
            Instruction::Load {
                kind: value_kind(opcode - opcodes::ILOAD),
                slot,
            },
            4,
        ),
        opcodes::ISTORE..=opcodes::ASTORE => (
            Instruction::Store {
                kind: value_kind(opcode - opcodes::ISTORE),
                slot,
            },
            4,
        ),
        opcodes::RET => (Instruction::Ret { slot }, 4),
        _ => bail!("opcode 0x{opcode:02x} cannot be widened"),
    };
    Ok(decoded)
}

fn table_switch(code: &[u8], offset: usize) -> Result<(Instruction, usize)> {
    let base = offset + 1 + padding(offset);
    let default = branch(code, offset, read_i32(code, base)?)?;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    if high < low {
        bail!("invalid tableswitch range {low}..{high}");
    }
    let mut cases = Vec::new();
    let mut position = base + 12;
    for key in low..=high {
        cases.push((key, branch(code, offset, read_i32(code, position)?)?));
        position += 4;
    }
    Ok((Instruction::Switch { default, cases }, position - offset))
}

fn lookup_switch(code: &[u8], offset: usize) -> Result<(Instruction, usize)> {
    let base = offset + 1 + padding(offset);
    let default = branch(code, offset, read_i32(code, base)?)?;
    let pairs = read_i32(code, base + 4)?;
    if pairs < 0 {
        bail!("invalid lookupswitch pair count {pairs}");
    }
    let mut cases = Vec::new();
    let mut position = base + 8;
    for _ in 0..pairs {
        let key = read_i32(code, position)?;
        cases.push((key, branch(code, offset, read_i32(code, position + 4)?)?));
        position += 8;
    }
    Ok((Instruction::Switch { default, cases }, position - offset))
}

fn value_kind(index: u8) -> ValueKind {
    match index {
        0 => ValueKind::Int,
        1 => ValueKind::Long,
        2 => ValueKind::Float,
        3 => ValueKind::Double,
        _ => ValueKind::Reference,
    }
}

fn field_op(opcode: u8) -> FieldOp {
    match opcode {
        opcodes::GETSTATIC => FieldOp::GetStatic,
        opcodes::PUTSTATIC => FieldOp::PutStatic,
        opcodes::GETFIELD => FieldOp::GetField,
        _ => FieldOp::PutField,
    }
}

fn branch(code: &[u8], offset: usize, delta: i32) -> Result<Label> {
    let target = offset as i64 + i64::from(delta);
    if target < 0 || target >= code.len() as i64 {
        bail!("branch target {target} outside code of length {}", code.len());
    }
    Ok(Label(target as u32))
}

/// Switch operands start at the next four-byte boundary after the opcode.
fn padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

fn read_u8(code: &[u8], offset: usize) -> Result<u8> {
    code.get(offset)
        .copied()
        .with_context(|| format!("truncated code at offset {offset}"))
}

fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let bytes: [u8; 2] = code
        .get(offset..offset + 2)
        .and_then(|bytes| bytes.try_into().ok())
        .with_context(|| format!("truncated code at offset {offset}"))?;
    Ok(u16::from_be_bytes(bytes))
}

fn read_i16(code: &[u8], offset: usize) -> Result<i16> {
    Ok(read_u16(code, offset)? as i16)
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let bytes: [u8; 4] = code
        .get(offset..offset + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .with_context(|| format!("truncated code at offset {offset}"))?;
    Ok(i32::from_be_bytes(bytes))
}
