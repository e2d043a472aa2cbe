use std::fmt;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::ir::Class;

/// Why a method or instruction was selected for rewriting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HookReason {
    ForceInclude(String),
    CallbackOverride(String),
    LambdaTarget(String),
    SensitiveAccess(String),
    FactoryCall(String),
    WorkerConstruction(String),
}

impl fmt::Display for HookReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookReason::ForceInclude(annotation) => write!(f, "annotated with {annotation}"),
            HookReason::CallbackOverride(interface) => write!(f, "overrides {interface}"),
            HookReason::LambdaTarget(site) => write!(f, "bound by call site {site}"),
            HookReason::SensitiveAccess(access) => write!(f, "sensitive access {access}"),
            HookReason::FactoryCall(call) => write!(f, "pool factory call {call}"),
            HookReason::WorkerConstruction(class) => write!(f, "construction of {class}"),
        }
    }
}

/// Location selected by a matcher: a method, optionally one instruction in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HookPoint {
    pub(crate) method: usize,
    pub(crate) instruction: Option<usize>,
    pub(crate) reason: HookReason,
}

impl HookPoint {
    pub(crate) fn method(method: usize, reason: HookReason) -> Self {
        HookPoint {
            method,
            instruction: None,
            reason,
        }
    }

    pub(crate) fn instruction(method: usize, instruction: usize, reason: HookReason) -> Self {
        HookPoint {
            method,
            instruction: Some(instruction),
            reason,
        }
    }

    pub(crate) fn record(&self, pass: &'static str, class: &Class) -> HookRecord {
        let method = &class.methods[self.method];
        HookRecord {
            pass,
            class: class.name.clone(),
            method: method.name.clone(),
            descriptor: method.descriptor.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Rewrite applied by a pass, kept for logging and reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HookRecord {
    pub(crate) pass: &'static str,
    pub(crate) class: String,
    pub(crate) method: String,
    pub(crate) descriptor: String,
    pub(crate) reason: HookReason,
}

/// One instrumentation kind: match hook points in a class and rewrite them in place.
pub(crate) trait Pass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the class is considered at all. Rejected classes pass through untouched.
    fn accepts(&self, _class: &Class) -> bool {
        true
    }

    /// Rewrite the class, returning one record per applied hook point.
    fn apply(&self, class: &mut Class) -> Result<Vec<HookRecord>>;
}

/// Output of a chain run over one class.
#[derive(Debug)]
pub(crate) struct Transformed {
    pub(crate) class: Class,
    pub(crate) hooks: Vec<HookRecord>,
}

impl Transformed {
    pub(crate) fn changed(&self) -> bool {
        !self.hooks.is_empty()
    }
}

/// Ordered passes; each sees the output of the previous one.
pub(crate) struct PassChain {
    passes: Vec<Box<dyn Pass>>,
}

impl PassChain {
    pub(crate) fn new(passes: Vec<Box<dyn Pass>>) -> Self {
        PassChain { passes }
    }

    pub(crate) fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|pass| pass.name()).collect()
    }

    pub(crate) fn transform(&self, mut class: Class) -> Result<Transformed> {
        let mut hooks = Vec::new();
        for pass in &self.passes {
            if !pass.accepts(&class) {
                debug!(pass = pass.name(), class = %class.name, "class not accepted");
                continue;
            }
            let class_name = class.name.clone();
            let applied = pass
                .apply(&mut class)
                .with_context(|| format!("{} pass failed on {}", pass.name(), class_name))?;
            if applied.is_empty() {
                continue;
            }
            for method in class.methods.iter().filter(|method| method.modified) {
                method.check_labels().with_context(|| {
                    format!("{} pass left a malformed stream in {}", pass.name(), class_name)
                })?;
            }
            for hook in &applied {
                debug!(
                    pass = hook.pass,
                    class = %hook.class,
                    method = %format!("{}{}", hook.method, hook.descriptor),
                    reason = %hook.reason,
                    "hook applied"
                );
            }
            hooks.extend(applied);
        }
        if !hooks.is_empty() {
            info!(class = %class.name, hooks = hooks.len(), "class instrumented");
        }
        Ok(Transformed { class, hooks })
    }
}
