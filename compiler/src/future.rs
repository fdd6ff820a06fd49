// future.rs — Future resolution
//
// Places dispatch and resolve hooks for asynchronous buffers. The producer of
// a future dispatches it; the first consumer waits on it. A future nobody
// consumes is waited on right after its producer. Requires a linear schedule
// in which the first entry of a future's users list runs first.
//
// Failure modes: a future-typed buffer without a state buffer.
// Side effects: registers producers as users of the state buffer.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::block::{CodeFragment, ExecutionBlock};
use crate::context::NetworkContext;
use crate::diag::CompileError;
use crate::introspect::{Introspector, ReferenceQuery};
use crate::pass::{CodeTransformationPass, PassId, Verbosity};
use crate::template::{Binding, Bindings, Template};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FutureTemplates {
    pub dispatch: Template,
    pub resolve: Template,
}

impl Default for FutureTemplates {
    fn default() -> Self {
        Self {
            dispatch: Template::new("dlc_future_dispatch(&${state}, ${name});"),
            resolve: Template::new("dlc_future_wait(&${state});"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FutureResolution {
    templates: FutureTemplates,
}

impl FutureResolution {
    pub fn new(templates: FutureTemplates) -> Self {
        Self { templates }
    }

    fn fragment(template: &Template, future: &str, state: &str) -> CodeFragment {
        CodeFragment::new(
            template.clone(),
            Bindings::from([
                ("name".to_string(), Binding::Name(future.to_string())),
                ("state".to_string(), Binding::Name(state.to_string())),
            ]),
        )
    }
}

impl CodeTransformationPass for FutureResolution {
    fn id(&self) -> PassId {
        PassId::FutureResolution
    }

    fn apply(
        &self,
        ctx: &mut NetworkContext,
        intro: &mut Introspector,
        mut block: ExecutionBlock,
        operation: &str,
        _verbosity: Verbosity,
    ) -> Result<ExecutionBlock, CompileError> {
        let query = ReferenceQuery {
            unroll_structs: true,
            include_globals: true,
        };
        let references = intro.extract_dynamic_references(ctx, &block, query)?;

        let mut front = Vec::new();
        let mut back = Vec::new();
        for name in references {
            let buffer = ctx.lookup(&name)?;
            if !ctx.types.is_future(buffer.ty) {
                continue;
            }
            let state = buffer
                .state
                .clone()
                .ok_or_else(|| CompileError::MissingFutureState {
                    buffer: name.clone(),
                })?;
            let produced_here = !buffer.is_user(operation);
            let first_user = buffer.users.first().cloned();

            if produced_here {
                front.push(Self::fragment(&self.templates.dispatch, &name, &state));
                let state_buffer = ctx.lookup_mut(&state)?;
                if !state_buffer.is_user(operation) {
                    state_buffer.users.push(operation.to_string());
                }
                debug!("{}: dispatch {}", operation, name);
                if first_user.is_none() {
                    back.push(Self::fragment(&self.templates.resolve, &name, &state));
                    debug!("{}: resolve {} (no consumers)", operation, name);
                }
            } else if first_user.as_deref() == Some(operation) {
                front.push(Self::fragment(&self.templates.resolve, &name, &state));
                debug!("{}: resolve {}", operation, name);
            }
        }
        for fragment in front.into_iter().rev() {
            block.add_left(fragment);
        }
        for fragment in back {
            block.add_right(fragment);
        }
        Ok(block)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
