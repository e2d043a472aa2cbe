use anyhow::Result;
use tracing::debug;

use crate::config::ThreadRenameConfig;
use crate::engine::{HookPoint, HookReason, HookRecord, Pass};
use crate::ir::{Class, Instruction};
use crate::matcher::{is_construction_of, is_initializer_of, is_static_call_into};
use crate::rewrite::{append_string_argument, retarget_call, retarget_construction};

pub(crate) const NAME: &str = "thread_rename";

const EXECUTORS: &str = "java/util/concurrent/Executors";
const THREAD: &str = "java/lang/Thread";
const THREAD_FACTORY: &str = "java/util/concurrent/ThreadFactory";
const NEW_THREAD: &str = "newThread(Ljava/lang/Runnable;)Ljava/lang/Thread;";

/// Routes thread and pool creation through the configured replacement types.
///
/// Both rewrites pass the enclosing class's simple name as an extra trailing string argument,
/// which the replacement types use to name their threads.
pub(crate) struct ThreadRename {
    config: ThreadRenameConfig,
}

enum Rewrite {
    Factory { call: usize },
    Worker { construction: usize, initializer: usize },
}

impl Rewrite {
    /// Index where the name constant is inserted.
    fn insertion_point(&self) -> usize {
        match self {
            Rewrite::Factory { call } => *call,
            Rewrite::Worker { initializer, .. } => *initializer,
        }
    }
}

impl ThreadRename {
    pub(crate) fn new(config: ThreadRenameConfig) -> Self {
        ThreadRename { config }
    }

    fn rewrite(&self, class: &mut Class, method: usize, rewrite: &Rewrite) -> Result<()> {
        let label = class.simple_name().to_string();
        let class_name = class.name.clone();
        let method = &mut class.methods[method];
        match rewrite {
            Rewrite::Factory { call } => {
                retarget_call(&class_name, method, *call, &self.config.executors_class)?;
                append_string_argument(&class_name, method, *call, &label)?;
            }
            Rewrite::Worker {
                construction,
                initializer,
            } => {
                retarget_construction(&class_name, method, *construction, &self.config.thread_class)?;
                retarget_call(&class_name, method, *initializer, &self.config.thread_class)?;
                append_string_argument(&class_name, method, *initializer, &label)?;
            }
        }
        Ok(())
    }
}

/// Index of the `Thread.<init>` call that initializes the thread built at `construction`.
fn find_initializer(instructions: &[Instruction], construction: usize) -> Option<usize> {
    let mut nested = 0usize;
    for (index, instruction) in instructions.iter().enumerate().skip(construction + 1) {
        if is_construction_of(instruction, THREAD) {
            nested += 1;
        } else if is_initializer_of(instruction, THREAD) {
            if nested == 0 {
                return Some(index);
            }
            nested -= 1;
        }
    }
    None
}

impl Pass for ThreadRename {
    fn name(&self) -> &'static str {
        NAME
    }

    fn apply(&self, class: &mut Class) -> Result<Vec<HookRecord>> {
        let is_factory_class = class.implements(THREAD_FACTORY);
        let mut planned = Vec::new();
        for (method_index, method) in class.methods.iter().enumerate() {
            // A factory's own newThread builds the very thread it hands out.
            let is_factory_hook = is_factory_class && method.name_with_descriptor() == NEW_THREAD;
            for (index, instruction) in method.instructions.iter().enumerate() {
                if is_static_call_into(instruction, EXECUTORS, &self.config.factory_methods) {
                    let Instruction::Invoke(call) = instruction else {
                        continue;
                    };
                    let reason = HookReason::FactoryCall(format!("{}.{}", call.owner, call.name));
                    planned.push((
                        HookPoint::instruction(method_index, index, reason),
                        Rewrite::Factory { call: index },
                    ));
                } else if !is_factory_hook && is_construction_of(instruction, THREAD) {
                    match find_initializer(&method.instructions, index) {
                        Some(initializer) => planned.push((
                            HookPoint::instruction(
                                method_index,
                                index,
                                HookReason::WorkerConstruction(THREAD.to_string()),
                            ),
                            Rewrite::Worker {
                                construction: index,
                                initializer,
                            },
                        )),
                        None => debug!(
                            class = %class.name,
                            method = %method.name,
                            index,
                            "thread construction without initializer left as is"
                        ),
                    }
                }
            }
        }

        let records = planned
            .iter()
            .map(|(hook, _)| hook.record(NAME, class))
            .collect();

        // Insertions shift later indices, so apply them from the back of each method.
        planned.sort_by(|(a_hook, a), (b_hook, b)| {
            (b_hook.method, b.insertion_point()).cmp(&(a_hook.method, a.insertion_point()))
        });
        for (hook, rewrite) in &planned {
            self.rewrite(class, hook.method, rewrite)?;
        }
        Ok(records)
    }
}
