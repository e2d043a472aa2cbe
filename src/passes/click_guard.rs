use std::collections::BTreeMap;

use anyhow::Result;
use jdescriptor::TypeDescriptor;
use tracing::debug;

use crate::config::ClickGuardConfig;
use crate::descriptor::{first_parameter_of_type, parameter_widths, parse_method, slot_offset};
use crate::engine::{HookPoint, HookReason, HookRecord, Pass};
use crate::error::InstrumentError;
use crate::ir::{CallKind, Class, Instruction, Label, MethodCall, ValueKind};
use crate::matcher::{
    dynamic_call_sites, is_callback_site, marker_annotation, matches_prefix, overridden_callback,
};
use crate::opcodes;
use crate::rewrite::insert_at_start;

pub(crate) const NAME: &str = "click_guard";

/// Debounces click handlers by running a guard predicate before the original body.
///
/// A guarded method gets the prologue
///
/// ```text
/// aload <widget slot>
/// invokestatic <guard>(<widget>)Z
/// ifne resume
/// return
/// resume:
/// <original body>
/// ```
///
/// Guarding is additive: running the pass over already guarded code inserts another prologue.
pub(crate) struct ClickGuard {
    config: ClickGuardConfig,
}

impl ClickGuard {
    pub(crate) fn new(config: ClickGuardConfig) -> Self {
        ClickGuard { config }
    }

    /// Methods to guard, each at most once, in declaration order.
    fn guarded_methods(&self, class: &Class) -> Result<Vec<HookPoint>, InstrumentError> {
        let mut selected = BTreeMap::new();
        for (index, method) in class.methods.iter().enumerate() {
            if marker_annotation(method, &self.config.force_exclude).is_some() {
                debug!(class = %class.name, method = %method.name, "excluded by annotation");
            } else if let Some(annotation) = marker_annotation(method, &self.config.force_include) {
                selected
                    .entry(index)
                    .or_insert_with(|| HookReason::ForceInclude(annotation.to_string()));
            } else if let Some(shape) =
                overridden_callback(class, method, &self.config.hook_points)
            {
                selected
                    .entry(index)
                    .or_insert_with(|| HookReason::CallbackOverride(shape.interface.clone()));
            }

            let sites = dynamic_call_sites(method, |site| {
                is_callback_site(site, &self.config.hook_points)
            });
            for (_, site) in sites {
                let Some(target) = site.bound_target() else {
                    continue;
                };
                let target_index = class
                    .find_method(&target.name, &target.descriptor)
                    .ok_or_else(|| InstrumentError::MissingDynamicTarget {
                        class: class.name.clone(),
                        method: method.name_with_descriptor(),
                        site: format!("{}{}", site.name, site.descriptor),
                        target: format!("{}.{}{}", target.owner, target.name, target.descriptor),
                    })?;
                selected.entry(target_index).or_insert_with(|| {
                    HookReason::LambdaTarget(format!("{}{}", site.name, site.descriptor))
                });
            }
        }
        Ok(selected
            .into_iter()
            .map(|(index, reason)| HookPoint::method(index, reason))
            .collect())
    }

    fn prologue(&self, slot: u16, resume: Label) -> Vec<Instruction> {
        vec![
            Instruction::Load {
                kind: ValueKind::Reference,
                slot,
            },
            Instruction::Invoke(MethodCall::new(CallKind::Static, &self.config.guard)),
            Instruction::Jump {
                opcode: opcodes::IFNE,
                target: resume,
            },
            Instruction::Return(None),
            Instruction::Label(resume),
        ]
    }

    /// Insert the prologue; `false` when the method has nothing to guard.
    fn guard(&self, class: &mut Class, hook: &HookPoint) -> Result<bool, InstrumentError> {
        let method = &mut class.methods[hook.method];
        if method.instructions.is_empty() {
            return Ok(false);
        }
        let descriptor = parse_method(&method.descriptor)?;
        if *descriptor.return_type() != TypeDescriptor::Void {
            debug!(method = %method.name, "guard skipped, method returns a value");
            return Ok(false);
        }
        let Some(parameter) = first_parameter_of_type(&descriptor, &self.config.widget_type) else {
            debug!(method = %method.name, "guard skipped, no widget parameter");
            return Ok(false);
        };
        let base = if method.is_static() { 0 } else { 1 };
        let slot = slot_offset(&parameter_widths(&descriptor), parameter, base)?;
        let resume = method.fresh_label();
        let prologue = self.prologue(slot, resume);
        insert_at_start(method, prologue);
        Ok(true)
    }
}

impl Pass for ClickGuard {
    fn name(&self) -> &'static str {
        NAME
    }

    fn accepts(&self, class: &Class) -> bool {
        matches_prefix(&class.name, &self.config.include)
    }

    fn apply(&self, class: &mut Class) -> Result<Vec<HookRecord>> {
        let mut records = Vec::new();
        for hook in self.guarded_methods(class)? {
            if self.guard(class, &hook)? {
                records.push(hook.record(NAME, class));
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::config::CallbackShape;
    use crate::engine::PassChain;
    use crate::ir::{
        Annotation, Constant, DynamicCallSite, MemberRef, Method, MethodHandle, ACC_PRIVATE,
        ACC_PUBLIC, ACC_STATIC, ACC_SYNTHETIC,
    };

    const VIEW: &str = "Landroid/view/View;";
    const LISTENER: &str = "android/view/View$OnClickListener";

    fn config() -> ClickGuardConfig {
        ClickGuardConfig {
            include: vec!["com/example/".to_string()],
            force_include: BTreeSet::from(["Lcom/example/CheckClick;".to_string()]),
            force_exclude: BTreeSet::from(["Lcom/example/UncheckClick;".to_string()]),
            widget_type: VIEW.to_string(),
            guard: MemberRef::new("com/example/ClickMonitor", "isEnabled", "(Landroid/view/View;)Z"),
            hook_points: vec![CallbackShape {
                interface: LISTENER.to_string(),
                name: "onClick".to_string(),
                descriptor: "(Landroid/view/View;)V".to_string(),
                interface_suffix: format!("L{LISTENER};"),
            }],
        }
    }

    fn body() -> Vec<Instruction> {
        vec![
            Instruction::Load {
                kind: ValueKind::Reference,
                slot: 0,
            },
            Instruction::Invoke(MethodCall::new(
                CallKind::Virtual,
                &MemberRef::new("com/example/Activity", "onClickView", "()V"),
            )),
            Instruction::Return(None),
        ]
    }

    fn method(name: &str, descriptor: &str, access: u16, annotations: &[&str]) -> Method {
        let mut method = Method::new(name, descriptor, access);
        method.annotations = annotations
            .iter()
            .map(|descriptor| Annotation {
                descriptor: descriptor.to_string(),
            })
            .collect();
        method.instructions = body();
        method
    }

    fn class(name: &str, interfaces: &[&str], methods: Vec<Method>) -> Class {
        Class {
            name: name.to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: interfaces.iter().map(|name| name.to_string()).collect(),
            access_flags: ACC_PUBLIC,
            annotations: Vec::new(),
            methods,
        }
    }

    fn lambda_site(target: &str, descriptor: &str) -> Instruction {
        let metafactory = MethodHandle {
            kind: 6,
            owner: "java/lang/invoke/LambdaMetafactory".to_string(),
            name: "metafactory".to_string(),
            descriptor: "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodHandle;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;".to_string(),
            interface: false,
        };
        Instruction::InvokeDynamic(DynamicCallSite {
            name: "onClick".to_string(),
            descriptor: format!("(Lcom/example/Activity;)L{LISTENER};"),
            bootstrap: metafactory,
            arguments: vec![
                Constant::MethodType("(Landroid/view/View;)V".to_string()),
                Constant::MethodHandle(MethodHandle {
                    kind: 6,
                    owner: "com/example/Activity".to_string(),
                    name: target.to_string(),
                    descriptor: descriptor.to_string(),
                    interface: false,
                }),
                Constant::MethodType("(Landroid/view/View;)V".to_string()),
            ],
        })
    }

    fn expected_prologue(slot: u16, resume: Label) -> Vec<Instruction> {
        ClickGuard::new(config()).prologue(slot, resume)
    }

    #[test]
    fn callback_override_loads_slot_one_and_returns_when_denied() {
        let original = method("onClick", "(Landroid/view/View;)V", ACC_PUBLIC, &[]);
        let mut unit = class("com/example/Listener", &[LISTENER], vec![original.clone()]);

        let records = ClickGuard::new(config()).apply(&mut unit).expect("apply");

        assert_eq!(1, records.len());
        assert_eq!(HookReason::CallbackOverride(LISTENER.to_string()), records[0].reason);
        let instructions = &unit.methods[0].instructions;
        assert_eq!(
            Instruction::Load {
                kind: ValueKind::Reference,
                slot: 1
            },
            instructions[0]
        );
        assert_eq!(
            Instruction::Invoke(MethodCall::new(CallKind::Static, &config().guard)),
            instructions[1]
        );
        let Instruction::Jump { opcode, target } = instructions[2] else {
            panic!("expected jump, found {:?}", instructions[2]);
        };
        assert_eq!(opcodes::IFNE, opcode);
        assert_eq!(Instruction::Return(None), instructions[3]);
        assert_eq!(Instruction::Label(target), instructions[4]);
        assert_eq!(original.instructions, instructions[5..].to_vec());
        assert!(unit.methods[0].modified);
    }

    #[test]
    fn widget_slot_accounts_for_wide_parameters_and_static_methods() {
        let mut unit = class(
            "com/example/Handlers",
            &[],
            vec![
                method("onPick", "(JLandroid/view/View;)V", ACC_PUBLIC, &["Lcom/example/CheckClick;"]),
                method(
                    "onStaticPick",
                    "(DILandroid/view/View;)V",
                    ACC_PUBLIC | ACC_STATIC,
                    &["Lcom/example/CheckClick;"],
                ),
            ],
        );

        ClickGuard::new(config()).apply(&mut unit).expect("apply");

        assert_eq!(
            Instruction::Load {
                kind: ValueKind::Reference,
                slot: 3
            },
            unit.methods[0].instructions[0]
        );
        assert_eq!(
            Instruction::Load {
                kind: ValueKind::Reference,
                slot: 3
            },
            unit.methods[1].instructions[0]
        );
    }

    #[test]
    fn exclusion_annotation_wins_over_inclusion() {
        let mut unit = class(
            "com/example/Listener",
            &[LISTENER],
            vec![method(
                "onClick",
                "(Landroid/view/View;)V",
                ACC_PUBLIC,
                &["Lcom/example/UncheckClick;", "Lcom/example/CheckClick;"],
            )],
        );
        let before = unit.clone();

        let records = ClickGuard::new(config()).apply(&mut unit).expect("apply");

        assert!(records.is_empty());
        assert_eq!(before, unit);
    }

    #[test]
    fn lambda_target_is_guarded_without_marker() {
        let mut on_create = method("onCreate", "(Landroid/os/Bundle;)V", ACC_PUBLIC, &[]);
        on_create.instructions.insert(
            1,
            lambda_site("lambda$onCreate$0", "(Lcom/example/Activity;Landroid/view/View;)V"),
        );
        let lambda = method(
            "lambda$onCreate$0",
            "(Lcom/example/Activity;Landroid/view/View;)V",
            ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC,
            &[],
        );
        let mut unit = class("com/example/Activity", &[], vec![on_create.clone(), lambda]);

        let records = ClickGuard::new(config()).apply(&mut unit).expect("apply");

        assert_eq!(1, records.len());
        assert_eq!("lambda$onCreate$0", records[0].method);
        assert!(matches!(records[0].reason, HookReason::LambdaTarget(_)));
        assert_eq!(on_create, unit.methods[0]);
        assert_eq!(
            Instruction::Load {
                kind: ValueKind::Reference,
                slot: 1
            },
            unit.methods[1].instructions[0]
        );
    }

    #[test]
    fn lambda_target_is_guarded_even_when_excluded() {
        let mut on_create = method("onCreate", "(Landroid/os/Bundle;)V", ACC_PUBLIC, &[]);
        on_create.instructions.insert(
            1,
            lambda_site("lambda$onCreate$0", "(Lcom/example/Activity;Landroid/view/View;)V"),
        );
        let lambda = method(
            "lambda$onCreate$0",
            "(Lcom/example/Activity;Landroid/view/View;)V",
            ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC,
            &["Lcom/example/UncheckClick;"],
        );
        let mut unit = class("com/example/Activity", &[], vec![on_create, lambda]);

        let records = ClickGuard::new(config()).apply(&mut unit).expect("apply");

        assert_eq!(1, records.len());
        assert!(matches!(records[0].reason, HookReason::LambdaTarget(_)));
        assert!(unit.methods[1].modified);
    }

    #[test]
    fn method_returning_a_value_is_skipped() {
        let mut on_long_click = method(
            "onLongClick",
            "(Landroid/view/View;)Z",
            ACC_PUBLIC,
            &["Lcom/example/CheckClick;"],
        );
        on_long_click.instructions = vec![
            Instruction::Constant(Constant::Int(1)),
            Instruction::Return(Some(ValueKind::Int)),
        ];
        let mut unit = class("com/example/Handlers", &[], vec![on_long_click]);
        let before = unit.clone();

        let records = ClickGuard::new(config()).apply(&mut unit).expect("apply");

        assert!(records.is_empty());
        assert_eq!(before, unit);
    }

    #[test]
    fn missing_lambda_target_is_fatal() {
        let mut on_create = method("onCreate", "(Landroid/os/Bundle;)V", ACC_PUBLIC, &[]);
        on_create
            .instructions
            .insert(0, lambda_site("lambda$gone$0", "(Landroid/view/View;)V"));
        let mut unit = class("com/example/Activity", &[], vec![on_create]);

        let error = ClickGuard::new(config()).apply(&mut unit).expect_err("fatal");

        assert!(matches!(
            error.downcast_ref::<InstrumentError>(),
            Some(InstrumentError::MissingDynamicTarget { .. })
        ));
    }

    #[test]
    fn method_without_widget_parameter_is_skipped() {
        let mut unit = class(
            "com/example/Handlers",
            &[],
            vec![method("onTick", "(I)V", ACC_PUBLIC, &["Lcom/example/CheckClick;"])],
        );
        let before = unit.clone();

        let records = ClickGuard::new(config()).apply(&mut unit).expect("apply");

        assert!(records.is_empty());
        assert_eq!(before, unit);
    }

    #[test]
    fn classes_outside_include_list_pass_through_chain_unchanged() {
        let unit = class(
            "org/other/Listener",
            &[LISTENER],
            vec![method("onClick", "(Landroid/view/View;)V", ACC_PUBLIC, &[])],
        );
        let chain = PassChain::new(vec![Box::new(ClickGuard::new(config()))]);

        let result = chain.transform(unit.clone()).expect("transform");

        assert!(!result.changed());
        assert_eq!(unit, result.class);
    }

    #[test]
    fn guarding_twice_stacks_a_second_prologue() {
        let original = method("onClick", "(Landroid/view/View;)V", ACC_PUBLIC, &[]);
        let mut unit = class("com/example/Listener", &[LISTENER], vec![original.clone()]);
        let pass = ClickGuard::new(config());

        pass.apply(&mut unit).expect("first apply");
        let once = unit.methods[0].instructions.clone();
        pass.apply(&mut unit).expect("second apply");

        let instructions = &unit.methods[0].instructions;
        assert_eq!(once.len() + 5, instructions.len());
        assert_eq!(expected_prologue(1, Label(1)), instructions[..5].to_vec());
        assert_eq!(once, instructions[5..].to_vec());
        assert!(unit.methods[0].check_labels().is_ok());
    }
}
