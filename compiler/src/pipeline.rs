// pipeline.rs — Pass composition and the per-operation driver
//
// A `CodeTransformation` is an ordered list of passes. `run_schedule` feeds
// each scheduled operation's block through it, in schedule order, threading a
// single context and introspection service, and collects the rendered code.
//
// Preconditions: operations are given in schedule order; buffer users lists
//                agree with that order.
// Postconditions: every operation's block has been transformed by every pass,
//                 or the first failure is returned.
// Failure modes: any pass error, wrapped with its operation and pass.
// Side effects: mutates the context; logs per-pass timing at debug level.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::block::ExecutionBlock;
use crate::buffer::{BufferKind, Scope};
use crate::context::{GlobalDefinition, NetworkContext};
use crate::diag::{CompileError, Diagnostic};
use crate::introspect::Introspector;
use crate::pass::{descriptor, ordering_violations, CodeTransformationPass, PassId, Verbosity};

// ── Error type ─────────────────────────────────────────────────────────────

/// A pass failed while lowering one operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{operation}: {pass}: {source}")]
pub struct PipelineError {
    pub operation: String,
    pub pass: &'static str,
    #[source]
    pub source: CompileError,
}

impl PipelineError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::from(&self.source).with_origin(self.operation.clone(), self.pass)
    }
}

// ── Composition ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CodeTransformation {
    passes: Vec<Box<dyn CodeTransformationPass>>,
}

impl CodeTransformation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pass(mut self, pass: impl CodeTransformationPass + 'static) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn push(&mut self, pass: Box<dyn CodeTransformationPass>) {
        self.passes.push(pass);
    }

    pub fn pass_ids(&self) -> Vec<PassId> {
        self.passes.iter().map(|p| p.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Run every pass over one operation's block, in declaration order.
    /// `on_pass_complete` receives each pass and its wall time.
    pub fn apply(
        &self,
        ctx: &mut NetworkContext,
        intro: &mut Introspector,
        mut block: ExecutionBlock,
        operation: &str,
        verbosity: Verbosity,
        on_pass_complete: &mut impl FnMut(PassId, Duration),
    ) -> Result<ExecutionBlock, PipelineError> {
        for pass in &self.passes {
            let t = Instant::now();
            block = pass
                .apply(ctx, intro, block, operation, verbosity)
                .map_err(|source| PipelineError {
                    operation: operation.to_string(),
                    pass: pass.name(),
                    source,
                })?;
            on_pass_complete(pass.id(), t.elapsed());
        }
        Ok(block)
    }
}

// ── Output ─────────────────────────────────────────────────────────────────

/// Rendered code of one scheduled operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationCode {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCode {
    /// Statically placed global storage (arenas), one declaration each.
    pub statics: Vec<String>,
    /// Hoisted tables, closure structs and functions, in hoisting order.
    pub definitions: Vec<GlobalDefinition>,
    pub operations: Vec<OperationCode>,
}

impl GeneratedCode {
    /// Globals first, then the operations in schedule order inside one
    /// entry function.
    pub fn render(&self, entry: &str) -> String {
        let mut out = String::new();
        for line in &self.statics {
            out.push_str(line);
            out.push('\n');
        }
        for def in &self.definitions {
            out.push_str(&def.code);
            out.push_str("\n\n");
        }
        out.push_str(&format!("void {}(void) {{\n", entry));
        for op in &self.operations {
            out.push_str(&format!("    /* {} */\n", op.name));
            for line in op.code.lines() {
                out.push_str("    ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Declarations for global buffers no allocation pass manages.
fn static_declarations(ctx: &NetworkContext) -> Result<Vec<String>, CompileError> {
    let mut out = Vec::new();
    for buffer in ctx.buffers(Scope::Global) {
        if buffer.deploy || !matches!(buffer.kind, BufferKind::Variable) {
            continue;
        }
        let elem = ctx.types.size_bytes(buffer.ty)?.max(1);
        out.push(format!(
            "static {} {}[{}];",
            ctx.types.type_name(buffer.ty)?,
            buffer.name,
            buffer.size.div_ceil(elem)
        ));
    }
    Ok(out)
}

// ── Driver ─────────────────────────────────────────────────────────────────

/// One scheduled operation and its untransformed code.
#[derive(Debug, Clone)]
pub struct ScheduledOperation {
    pub name: String,
    pub block: ExecutionBlock,
}

/// Lower a whole schedule. Stops at the first failing pass.
pub fn run_schedule(
    ctx: &mut NetworkContext,
    transformation: &CodeTransformation,
    operations: Vec<ScheduledOperation>,
    verbosity: Verbosity,
) -> Result<GeneratedCode, PipelineError> {
    for (pass, required) in ordering_violations(&transformation.pass_ids()) {
        warn!(
            "{} runs before {} but expects its output",
            descriptor(required).name,
            descriptor(pass).name
        );
    }

    let mut intro = Introspector::new();
    let mut generated = Vec::with_capacity(operations.len());
    for op in operations {
        let t = Instant::now();
        let block = transformation.apply(
            ctx,
            &mut intro,
            op.block,
            &op.name,
            verbosity,
            &mut |pass, elapsed| {
                debug!(
                    "{}: {} complete, {:.3}ms",
                    op.name,
                    descriptor(pass).name,
                    elapsed.as_secs_f64() * 1000.0
                )
            },
        )?;
        let code = intro.render_block(&block).map_err(|source| PipelineError {
            operation: op.name.clone(),
            pass: "render",
            source,
        })?;
        info!(
            "{}: lowered to {} fragments in {:.3}ms",
            op.name,
            block.len(),
            t.elapsed().as_secs_f64() * 1000.0
        );
        generated.push(OperationCode {
            name: op.name,
            code,
        });
    }

    let statics = static_declarations(ctx).map_err(|source| PipelineError {
        operation: String::new(),
        pass: "render",
        source,
    })?;
    debug!("{} parsed templates cached", intro.cached_templates());
    Ok(GeneratedCode {
        statics,
        definitions: ctx.definitions().to_vec(),
        operations: generated,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CodeFragment;
    use crate::buffer::Buffer;
    use crate::memory::MemoryManagement;
    use crate::template::Binding;

    fn op(name: &str, source: &str, bindings: &[(&str, &str)]) -> ScheduledOperation {
        ScheduledOperation {
            name: name.to_string(),
            block: ExecutionBlock::from_fragments([CodeFragment::from_source(
                source,
                bindings
                    .iter()
                    .map(|(k, v)| (k.to_string(), Binding::Name(v.to_string()))),
            )]),
        }
    }

    #[test]
    fn failing_pass_is_identified() {
        let mut ctx = NetworkContext::default();
        let f = ctx.types.float32();
        ctx.add(Buffer::variable("x", f, 4).with_users(["a"]), Scope::Local)
            .unwrap();
        let pipeline = CodeTransformation::new().with_pass(MemoryManagement::default());
        let err = run_schedule(
            &mut ctx,
            &pipeline,
            vec![op("a", "k(${i});", &[("i", "x")])],
            Verbosity::default(),
        )
        .unwrap_err();
        assert_eq!(err.operation, "a");
        assert_eq!(err.pass, "memory_management");
        let diag = err.to_diagnostic().to_string();
        assert!(diag.starts_with("error[E0402]: a (memory_management): "), "{}", diag);
    }

    #[test]
    fn render_wraps_operations_in_entry() {
        let code = GeneratedCode {
            statics: vec!["static uint8_t L1_arena[16];".into()],
            definitions: vec![GlobalDefinition {
                name: "t".into(),
                code: "static const int32_t t[1] = {1};".into(),
            }],
            operations: vec![OperationCode {
                name: "a".into(),
                code: "k();\nj();".into(),
            }],
        };
        assert_eq!(
            code.render("run"),
            "static uint8_t L1_arena[16];\nstatic const int32_t t[1] = {1};\n\nvoid run(void) {\n    /* a */\n    k();\n    j();\n}\n"
        );
    }

    #[test]
    fn pass_callbacks_follow_declaration_order() {
        let mut ctx = NetworkContext::default();
        let pipeline = CodeTransformation::new()
            .with_pass(MemoryManagement::passthrough())
            .with_pass(MemoryManagement::default());
        let mut seen = Vec::new();
        pipeline
            .apply(
                &mut ctx,
                &mut Introspector::new(),
                ExecutionBlock::new(),
                "op",
                Verbosity::default(),
                &mut |id, _| seen.push(id),
            )
            .unwrap();
        assert_eq!(seen, vec![PassId::MemoryPassthrough, PassId::MemoryManagement]);
    }
}
