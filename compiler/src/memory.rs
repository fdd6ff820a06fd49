// memory.rs — Memory allocation, passthrough accounting, struct initialization
//
// For one scheduled operation, classifies the buffers its block touches into
// buffers produced here (allocated before the kernel), buffers consumed for the
// last time here (freed after it), and transients. Allocation follows alias
// dependencies so a reference is declared after the buffer it views.
//
// Preconditions: buffer `users` lists reflect the schedule order.
// Postconditions: allocation code precedes every fragment reading the buffer;
//                 arena counters are updated together with liveness flags.
// Failure modes: double allocation, double free, alias cycles.
// Side effects: mutates liveness flags and arena counters in the context.

use std::collections::BTreeSet;

use log::debug;

use crate::block::{CodeFragment, ExecutionBlock};
use crate::buffer::{Buffer, BufferKind};
use crate::context::NetworkContext;
use crate::diag::CompileError;
use crate::introspect::{Introspector, ReferenceQuery};
use crate::pass::{CodeTransformationPass, PassId, Verbosity};
use crate::template::{Binding, Bindings, Template};

// ── Templates ───────────────────────────────────────────────────────────────

/// Target-specific code emitted for buffer lifetimes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MemoryTemplates {
    pub alloc: Template,
    pub dealloc: Template,
    /// Declaration of a reference (view) buffer.
    pub reference: Template,
    /// Live-bytes annotation, emitted when `Verbosity::annotate` is set.
    pub annotation: Template,
}

impl Default for MemoryTemplates {
    fn default() -> Self {
        Self {
            alloc: Template::new("${type}* ${name} = (${type}*)dlc_malloc_${level}(${size});"),
            dealloc: Template::new("dlc_free_${level}(${name});"),
            reference: Template::new(
                "${type}* ${name} = (${type}*)((char*)${reference} + ${offset});",
            ),
            annotation: Template::new("/* ${operation}: ${level} ${bytes} bytes live */"),
        }
    }
}

impl MemoryTemplates {
    /// Allocation code for `buffer`; a view declaration for references.
    pub fn alloc_fragment(
        &self,
        ctx: &NetworkContext,
        buffer: &Buffer,
    ) -> Result<CodeFragment, CompileError> {
        let template = if buffer.is_reference() {
            &self.reference
        } else {
            &self.alloc
        };
        Ok(CodeFragment::new(template.clone(), buffer_bindings(ctx, buffer)?))
    }

    pub fn dealloc_fragment(
        &self,
        ctx: &NetworkContext,
        buffer: &Buffer,
    ) -> Result<CodeFragment, CompileError> {
        Ok(CodeFragment::new(
            self.dealloc.clone(),
            buffer_bindings(ctx, buffer)?,
        ))
    }
}

/// Bindings describing a buffer to lifetime templates: `name`, `type`,
/// `size`, `level`, and for references `reference` and `offset`.
pub fn buffer_bindings(ctx: &NetworkContext, buffer: &Buffer) -> Result<Bindings, CompileError> {
    let mut b = Bindings::new();
    b.insert("name".into(), Binding::Name(buffer.name.clone()));
    b.insert("type".into(), Binding::Code(ctx.types.type_name(buffer.ty)?));
    b.insert("size".into(), Binding::Int(buffer.size as i64));
    b.insert("level".into(), Binding::Code(buffer.level_key().to_string()));
    if let BufferKind::Reference { target, offset } = &buffer.kind {
        b.insert("reference".into(), Binding::Name(target.clone()));
        b.insert("offset".into(), Binding::Int(*offset as i64));
    }
    Ok(b)
}

// ── Alias ordering ──────────────────────────────────────────────────────────

/// Order `names` so that every reference comes after the buffer it aliases
/// (when that buffer is also in `names`). Stable for independent buffers.
pub fn sort_by_alias_dependencies(
    ctx: &NetworkContext,
    names: &[String],
) -> Result<Vec<String>, CompileError> {
    let members: BTreeSet<&str> = names.iter().map(String::as_str).collect();
    let mut placed: BTreeSet<String> = BTreeSet::new();
    let mut out = Vec::with_capacity(names.len());
    let mut remaining: Vec<String> = names.to_vec();
    while !remaining.is_empty() {
        let before = out.len();
        let mut blocked = Vec::new();
        for name in remaining {
            let waiting = ctx
                .lookup(&name)?
                .target()
                .is_some_and(|t| members.contains(t) && !placed.contains(t));
            if waiting {
                blocked.push(name);
            } else {
                placed.insert(name.clone());
                out.push(name);
            }
        }
        if out.len() == before {
            return Err(CompileError::AliasCycle { buffers: blocked });
        }
        remaining = blocked;
    }
    Ok(out)
}

// ── Classification ──────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
struct Lifetimes {
    allocate: Vec<String>,
    free_inputs: Vec<String>,
    free_transients: Vec<String>,
}

fn classify(
    ctx: &NetworkContext,
    references: &[String],
    operation: &str,
) -> Result<Lifetimes, CompileError> {
    let mut lt = Lifetimes::default();
    for name in references {
        let buffer = ctx.lookup(name)?;
        if buffer.is_struct() {
            continue;
        }
        let consumed = buffer.is_user(operation);
        if buffer.is_transient() {
            if !consumed {
                lt.allocate.push(name.clone());
            }
            if buffer.users.is_empty() || buffer.is_last_user(operation) {
                lt.free_transients.push(name.clone());
            }
        } else if !consumed {
            lt.allocate.push(name.clone());
        } else if buffer.is_last_user(operation) {
            lt.free_inputs.push(name.clone());
        }
    }
    Ok(lt)
}

// ── Pass ────────────────────────────────────────────────────────────────────

/// Allocates produced buffers before and frees consumed buffers after an
/// operation's code.
#[derive(Debug, Clone)]
pub struct MemoryManagement {
    templates: MemoryTemplates,
    emit_code: bool,
}

impl Default for MemoryManagement {
    fn default() -> Self {
        Self::new(MemoryTemplates::default())
    }
}

impl MemoryManagement {
    pub fn new(templates: MemoryTemplates) -> Self {
        Self {
            templates,
            emit_code: true,
        }
    }

    /// Same bookkeeping, no emitted code (memory placed statically elsewhere).
    pub fn passthrough() -> Self {
        Self {
            templates: MemoryTemplates::default(),
            emit_code: false,
        }
    }
}

impl CodeTransformationPass for MemoryManagement {
    fn id(&self) -> PassId {
        if self.emit_code {
            PassId::MemoryManagement
        } else {
            PassId::MemoryPassthrough
        }
    }

    fn apply(
        &self,
        ctx: &mut NetworkContext,
        intro: &mut Introspector,
        mut block: ExecutionBlock,
        operation: &str,
        verbosity: Verbosity,
    ) -> Result<ExecutionBlock, CompileError> {
        let references = intro.extract_dynamic_references(ctx, &block, ReferenceQuery::unrolled())?;
        let lifetimes = classify(ctx, &references, operation)?;

        let ordered = sort_by_alias_dependencies(ctx, &lifetimes.allocate)?;
        let mut levels = BTreeSet::new();
        for name in ordered.iter().rev() {
            ctx.allocate(name, operation)?;
            let buffer = ctx.lookup(name)?;
            levels.insert(buffer.level_key().to_string());
            debug!(
                "{}: allocate {} ({} bytes, {})",
                operation,
                name,
                buffer.footprint(),
                buffer.level_key()
            );
            if self.emit_code {
                block.add_left(self.templates.alloc_fragment(ctx, buffer)?);
            }
        }

        let frees = lifetimes
            .free_inputs
            .iter()
            .chain(lifetimes.free_transients.iter());
        for name in frees {
            let released = ctx.deallocate(name, operation)?;
            if released.is_empty() {
                debug!("{}: {} dead, storage held by a live alias", operation, name);
            }
            for owner in released {
                let buffer = ctx.lookup(&owner)?;
                levels.insert(buffer.level_key().to_string());
                debug!("{}: free {} ({} bytes)", operation, owner, buffer.footprint());
                if self.emit_code {
                    block.add_right(self.templates.dealloc_fragment(ctx, buffer)?);
                }
            }
        }

        if verbosity.annotate && self.emit_code {
            for level in levels {
                let bindings = Bindings::from([
                    ("operation".to_string(), Binding::Code(operation.to_string())),
                    ("level".to_string(), Binding::Code(level.clone())),
                    ("bytes".to_string(), Binding::Int(ctx.dynamic_size(&level) as i64)),
                ]);
                block.add_right(CodeFragment::new(self.templates.annotation.clone(), bindings));
            }
        }
        Ok(block)
    }
}

// ── Struct initialization ───────────────────────────────────────────────────

/// Declares struct-kind buffers a block uses as initialised locals, ahead of
/// the code that reads them.
#[derive(Debug, Clone)]
pub struct StructInitialization {
    template: Template,
}

impl Default for StructInitialization {
    fn default() -> Self {
        Self::new(Template::new("${type} ${name} = ${value};"))
    }
}

impl StructInitialization {
    pub fn new(template: Template) -> Self {
        Self { template }
    }
}

impl CodeTransformationPass for StructInitialization {
    fn id(&self) -> PassId {
        PassId::StructInitialization
    }

    fn apply(
        &self,
        ctx: &mut NetworkContext,
        intro: &mut Introspector,
        mut block: ExecutionBlock,
        _operation: &str,
        _verbosity: Verbosity,
    ) -> Result<ExecutionBlock, CompileError> {
        let references = intro.extract_dynamic_references(ctx, &block, ReferenceQuery::unrolled())?;
        for name in references.iter().rev() {
            let buffer = ctx.lookup(name)?;
            let BufferKind::Struct { value } = &buffer.kind else {
                continue;
            };
            let bindings = Bindings::from([
                ("name".to_string(), Binding::Name(buffer.name.clone())),
                ("type".to_string(), Binding::Code(ctx.types.type_name(buffer.ty)?)),
                ("value".to_string(), Binding::Code(ctx.types.literal(value)?)),
            ]);
            block.add_left(CodeFragment::new(self.template.clone(), bindings));
        }
        Ok(block)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
