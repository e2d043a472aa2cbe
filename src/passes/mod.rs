use std::sync::Arc;

use crate::audit::AuditSink;
use crate::config::{Config, PassKind};
use crate::engine::{Pass, PassChain};

pub(crate) mod click_guard;
pub(crate) mod privacy_sentry;
pub(crate) mod thread_rename;

/// Build the chain of configured passes in their configured order.
pub(crate) fn build_chain(config: &Config, sink: Arc<dyn AuditSink>) -> PassChain {
    let mut passes: Vec<Box<dyn Pass>> = Vec::new();
    for kind in config.chain_order() {
        match kind {
            PassKind::ClickGuard => {
                if let Some(section) = &config.click_guard {
                    passes.push(Box::new(click_guard::ClickGuard::new(section.clone())));
                }
            }
            PassKind::PrivacySentry => {
                if let Some(section) = &config.privacy_sentry {
                    passes.push(Box::new(privacy_sentry::PrivacySentry::new(
                        section.clone(),
                        Arc::clone(&sink),
                    )));
                }
            }
            PassKind::ThreadRename => {
                if let Some(section) = &config.thread_rename {
                    passes.push(Box::new(thread_rename::ThreadRename::new(section.clone())));
                }
            }
        }
    }
    PassChain::new(passes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::engine::HookReason;
    use crate::ir::{
        CallKind, Class, FieldOp, Instruction, MemberRef, Method, MethodCall, ValueKind,
        ACC_PUBLIC,
    };
    use crate::opcodes;

    const ALL_PASSES: &str = r#"{
        "click_guard": {
            "include": ["com.example."],
            "guard": {"owner": "com/example/ClickMonitor", "name": "isEnabled", "descriptor": "(Landroid/view/View;)Z"}
        },
        "privacy_sentry": {
            "record_sink": {"owner": "com/example/Audit", "name": "record", "descriptor": "(Ljava/lang/String;)V"}
        },
        "thread_rename": {
            "thread_class": "com/example/NamedThread",
            "executors_class": "com/example/NamedExecutors"
        }
    }"#;

    fn screen() -> Class {
        let mut on_click = Method::new("onClick", "(Landroid/view/View;)V", ACC_PUBLIC);
        on_click.instructions = vec![
            Instruction::Field {
                op: FieldOp::GetStatic,
                field: MemberRef::new("android/os/Build", "BRAND", "Ljava/lang/String;"),
            },
            Instruction::Simple(opcodes::POP),
            Instruction::Invoke(MethodCall::new(
                CallKind::Static,
                &MemberRef::new(
                    "java/util/concurrent/Executors",
                    "newCachedThreadPool",
                    "()Ljava/util/concurrent/ExecutorService;",
                ),
            )),
            Instruction::Simple(opcodes::POP),
            Instruction::Return(None),
        ];
        Class {
            name: "com/example/Screen".to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: vec!["android/view/View$OnClickListener".to_string()],
            access_flags: ACC_PUBLIC,
            annotations: Vec::new(),
            methods: vec![on_click],
        }
    }

    #[test]
    fn chain_follows_configured_order() {
        let config = Config::parse(
            r#"{
                "order": ["thread_rename", "click_guard"],
                "click_guard": {
                    "guard": {"owner": "a/Guard", "name": "allow", "descriptor": "(Landroid/view/View;)Z"}
                },
                "thread_rename": {
                    "thread_class": "a/NamedThread",
                    "executors_class": "a/NamedExecutors"
                }
            }"#,
        )
        .expect("config");

        let chain = build_chain(&config, Arc::new(MemoryAuditSink::default()));

        assert_eq!(vec![thread_rename::NAME, click_guard::NAME], chain.pass_names());
    }

    #[test]
    fn empty_configuration_builds_empty_chain() {
        let chain = build_chain(&Config::default(), Arc::new(MemoryAuditSink::default()));

        assert!(chain.pass_names().is_empty());
    }

    #[test]
    fn each_pass_sees_the_output_of_the_previous_one() {
        let config = Config::parse(ALL_PASSES).expect("config");
        let sink = Arc::new(MemoryAuditSink::default());
        let chain = build_chain(&config, sink.clone());

        let result = chain.transform(screen()).expect("transform");

        assert_eq!(
            vec![click_guard::NAME, privacy_sentry::NAME, thread_rename::NAME],
            result.hooks.iter().map(|hook| hook.pass).collect::<Vec<_>>()
        );
        assert!(matches!(result.hooks[2].reason, HookReason::FactoryCall(_)));

        let class = &result.class;
        assert_eq!(2, class.methods.len());
        let instructions = &class.methods[0].instructions;
        assert_eq!(
            Instruction::Load {
                kind: ValueKind::Reference,
                slot: 1
            },
            instructions[0]
        );
        // Privacy capture lands after the guard prologue, right before the field read.
        assert!(matches!(&instructions[9], Instruction::Invoke(call) if call.name == "recordPrivacyAccess"));
        assert!(matches!(&instructions[10], Instruction::Field { .. }));
        assert_eq!(Instruction::load_string("Screen"), instructions[12]);
        assert_eq!(
            Instruction::Invoke(MethodCall::new(
                CallKind::Static,
                &MemberRef::new(
                    "com/example/NamedExecutors",
                    "newCachedThreadPool",
                    "(Ljava/lang/String;)Ljava/util/concurrent/ExecutorService;",
                ),
            )),
            instructions[13]
        );
        assert_eq!(16, instructions.len());
        assert!(class.methods[0].check_labels().is_ok());
        assert_eq!(1, sink.records().len());
    }
}
