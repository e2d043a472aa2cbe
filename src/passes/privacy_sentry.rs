use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::audit::AuditSink;
use crate::config::PrivacySentryConfig;
use crate::engine::{HookPoint, HookReason, HookRecord, Pass};
use crate::error::InstrumentError;
use crate::ir::{
    CallKind, Class, Instruction, MemberRef, Method, MethodCall, ValueKind, ACC_PRIVATE,
    ACC_STATIC, ACC_SYNTHETIC,
};
use crate::matcher::is_sensitive_access;
use crate::opcodes;
use crate::rewrite::{add_method, insert_before};

pub(crate) const NAME: &str = "privacy_sentry";

const HELPER_DESCRIPTOR: &str = "(Ljava/lang/String;Ljava/lang/Throwable;)V";
const THROWABLE: &str = "java/lang/Throwable";
const OUTPUT_BUFFER: &str = "java/io/ByteArrayOutputStream";
const PRINT_STREAM: &str = "java/io/PrintStream";
const STRING_BUILDER: &str = "java/lang/StringBuilder";
const APPEND_DESCRIPTOR: &str = "(Ljava/lang/String;)Ljava/lang/StringBuilder;";
const TO_STRING_DESCRIPTOR: &str = "()Ljava/lang/String;";

/// Logs every sensitive API access at runtime and in a build-time audit report.
///
/// Each matched instruction is preceded by a call to a synthesized static helper that receives
/// the provenance line and a freshly captured `Throwable`. The helper renders the stack trace
/// and forwards `provenance + trace` to the configured record sink. Every class is visited;
/// there is no include list.
pub(crate) struct PrivacySentry {
    config: PrivacySentryConfig,
    sink: Arc<dyn AuditSink>,
}

impl PrivacySentry {
    pub(crate) fn new(config: PrivacySentryConfig, sink: Arc<dyn AuditSink>) -> Self {
        PrivacySentry { config, sink }
    }

    /// Runtime label is the provenance line on its own line, followed by the trace.
    fn capture(&self, class: &Class, provenance: &str) -> Vec<Instruction> {
        let mut helper = MethodCall::new(
            CallKind::Static,
            &MemberRef::new(&class.name, &self.config.helper_name, HELPER_DESCRIPTOR),
        );
        // Static methods of an interface are linked through an InterfaceMethodref.
        helper.interface = class.is_interface();
        vec![
            Instruction::load_string(&format!("{provenance}\n")),
            Instruction::New(THROWABLE.to_string()),
            Instruction::Simple(opcodes::DUP),
            special(THROWABLE, "<init>", "()V"),
            Instruction::Invoke(helper),
        ]
    }

    fn helper(&self) -> Method {
        let mut method = Method::new(
            &self.config.helper_name,
            HELPER_DESCRIPTOR,
            ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC,
        );
        method.instructions = vec![
            Instruction::New(OUTPUT_BUFFER.to_string()),
            Instruction::Simple(opcodes::DUP),
            special(OUTPUT_BUFFER, "<init>", "()V"),
            store(2),
            load(1),
            Instruction::New(PRINT_STREAM.to_string()),
            Instruction::Simple(opcodes::DUP),
            load(2),
            special(PRINT_STREAM, "<init>", "(Ljava/io/OutputStream;)V"),
            virtual_call(THROWABLE, "printStackTrace", "(Ljava/io/PrintStream;)V"),
            load(2),
            virtual_call(OUTPUT_BUFFER, "toString", TO_STRING_DESCRIPTOR),
            store(3),
            Instruction::New(STRING_BUILDER.to_string()),
            Instruction::Simple(opcodes::DUP),
            special(STRING_BUILDER, "<init>", "()V"),
            load(0),
            virtual_call(STRING_BUILDER, "append", APPEND_DESCRIPTOR),
            load(3),
            virtual_call(STRING_BUILDER, "append", APPEND_DESCRIPTOR),
            virtual_call(STRING_BUILDER, "toString", TO_STRING_DESCRIPTOR),
            store(4),
            load(4),
            Instruction::Invoke(MethodCall::new(CallKind::Static, &self.config.record_sink)),
            Instruction::Return(None),
        ];
        method
    }
}

impl Pass for PrivacySentry {
    fn name(&self) -> &'static str {
        NAME
    }

    fn apply(&self, class: &mut Class) -> Result<Vec<HookRecord>> {
        let mut hooks = Vec::new();
        for (method_index, method) in class.methods.iter().enumerate() {
            for (index, instruction) in method.instructions.iter().enumerate() {
                if is_sensitive_access(instruction, &self.config.sensitive) {
                    let line = provenance(class, method, index)?;
                    let hook = HookPoint::instruction(
                        method_index,
                        index,
                        HookReason::SensitiveAccess(accessed_member(&line)),
                    );
                    hooks.push((hook, line));
                }
            }
        }
        if hooks.is_empty() {
            return Ok(Vec::new());
        }

        // Later positions first so earlier indices stay valid.
        for (hook, line) in hooks.iter().rev() {
            let capture = self.capture(class, line);
            if let Some(index) = hook.instruction {
                insert_before(&mut class.methods[hook.method], index, capture);
            }
        }
        if !add_method(class, self.helper()) {
            debug!(class = %class.name, helper = %self.config.helper_name, "reusing existing helper");
        }

        let lines: Vec<String> = hooks.iter().map(|(_, line)| line.clone()).collect();
        self.sink
            .record(&class.name, &lines)
            .with_context(|| format!("failed to record privacy audit for {}", class.name))?;

        Ok(hooks
            .iter()
            .map(|(hook, _)| hook.record(NAME, class))
            .collect())
    }
}

/// `<class> -> <method> -> <descriptor> / <owner> -> <name> -> <descriptor>`
pub(crate) fn provenance(class: &Class, method: &Method, index: usize) -> Result<String, InstrumentError> {
    let (owner, name, descriptor) = match &method.instructions[index] {
        Instruction::Invoke(call) => (&call.owner, &call.name, &call.descriptor),
        Instruction::Field { field, .. } => (&field.owner, &field.name, &field.descriptor),
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
        | Instruction::Simple(_) => {
            return Err(InstrumentError::IllegalInstruction {
                class: class.name.clone(),
                method: method.name_with_descriptor(),
                matcher: NAME,
                index,
            });
        }
    };
    Ok(format!(
        "{} -> {} -> {} / {} -> {} -> {}",
        class.name, method.name, method.descriptor, owner, name, descriptor
    ))
}

fn accessed_member(line: &str) -> String {
    line.split(" / ").nth(1).unwrap_or(line).to_string()
}

fn load(slot: u16) -> Instruction {
    Instruction::Load {
        kind: ValueKind::Reference,
        slot,
    }
}

fn store(slot: u16) -> Instruction {
    Instruction::Store {
        kind: ValueKind::Reference,
        slot,
    }
}

fn special(owner: &str, name: &str, descriptor: &str) -> Instruction {
    Instruction::Invoke(MethodCall::new(
        CallKind::Special,
        &MemberRef::new(owner, name, descriptor),
    ))
}

fn virtual_call(owner: &str, name: &str, descriptor: &str) -> Instruction {
    Instruction::Invoke(MethodCall::new(
        CallKind::Virtual,
        &MemberRef::new(owner, name, descriptor),
    ))
}
