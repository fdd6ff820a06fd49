// closure.rs — Closure generation
//
// Packages an operation's code into a function taking a single argument
// struct, so it can be handed across a call boundary (forked task, DMA
// callback). The struct, its type and the function are hoisted as global
// definitions; the block is replaced by a call through the struct.
//
// Preconditions: every buffer the block touches is registered.
// Postconditions: one struct/function definition per closure name; repeated
//                 generation with an unchanged buffer set reuses them. In the
//                 memory-aware variant, buffers outside the level window are
//                 allocated and freed inside the closure body.
// Failure modes: a closure name requested with a different struct layout; a
//                buffer outside the window that is already live.
// Side effects: registers the args struct type and a local struct buffer;
//               updates arena counters for closure-local buffers.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::block::{CodeFragment, ExecutionBlock};
use crate::buffer::{Buffer, BufferKind, Scope};
use crate::context::NetworkContext;
use crate::diag::CompileError;
use crate::introspect::{Introspector, ReferenceQuery};
use crate::memory::{sort_by_alias_dependencies, MemoryTemplates};
use crate::pass::{CodeTransformationPass, PassId, Verbosity};
use crate::template::{Binding, Bindings, Template};
use crate::types::{TypeId, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClosureTemplates {
    pub structure: Template,
    pub function: Template,
    pub call: Template,
    pub write_back: Template,
}

impl Default for ClosureTemplates {
    fn default() -> Self {
        Self {
            structure: Template::new("typedef struct {\n${fields}\n} ${args_type};"),
            function: Template::new(
                "static void ${name}(void* closure_args) {\n    ${args_type}* args = (${args_type}*)closure_args;\n${body}\n}",
            ),
            call: Template::new("${name}(&${args});"),
            write_back: Template::new("${variable} = ${args}.${field};"),
        }
    }
}

/// Level window for the memory-aware variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegions {
    pub start: String,
    pub end: String,
}

impl MemoryRegions {
    fn admits(&self, level: Option<&str>) -> bool {
        match level {
            None => true,
            Some(l) => l == self.start || l != self.end,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClosureGeneration {
    templates: ClosureTemplates,
    write_back: bool,
    regions: Option<MemoryRegions>,
    /// Lifetime code for buffers kept inside the closure.
    memory: MemoryTemplates,
}

impl ClosureGeneration {
    pub fn new(templates: ClosureTemplates) -> Self {
        Self {
            templates,
            ..Self::default()
        }
    }

    /// Copy struct fields back into the original variables after the call.
    pub fn with_write_back(mut self, write_back: bool) -> Self {
        self.write_back = write_back;
        self
    }

    /// Only package buffers whose level lies inside `regions`; the rest
    /// live for one call of the closure.
    pub fn memory_aware(mut self, regions: MemoryRegions) -> Self {
        self.regions = Some(regions);
        self
    }

    pub fn with_memory_templates(mut self, memory: MemoryTemplates) -> Self {
        self.memory = memory;
        self
    }

    /// Allocation and free lines for buffers that stay inside the closure.
    fn closure_locals(
        &self,
        ctx: &mut NetworkContext,
        intro: &mut Introspector,
        names: &[String],
        operation: &str,
    ) -> Result<(Vec<String>, Vec<String>), CompileError> {
        let ordered = sort_by_alias_dependencies(ctx, names)?;
        let mut allocs = Vec::with_capacity(ordered.len());
        for name in &ordered {
            ctx.allocate(name, operation)?;
            let fragment = self.memory.alloc_fragment(ctx, ctx.lookup(name)?)?;
            allocs.push(intro.render(&fragment)?);
        }
        let mut frees = Vec::new();
        for name in ordered.iter().rev() {
            for owner in ctx.deallocate(name, operation)? {
                let fragment = self.memory.dealloc_fragment(ctx, ctx.lookup(&owner)?)?;
                frees.push(intro.render(&fragment)?);
            }
        }
        if !ordered.is_empty() {
            debug!("{}: {} buffers local to the closure", operation, ordered.len());
        }
        Ok((allocs, frees))
    }

    fn render(
        &self,
        intro: &mut Introspector,
        template: &Template,
        bindings: Bindings,
    ) -> Result<String, CompileError> {
        intro.render(&CodeFragment::new(template.clone(), bindings))
    }
}

struct Field {
    name: String,
    ty: TypeId,
    opaque: bool,
}

impl CodeTransformationPass for ClosureGeneration {
    fn id(&self) -> PassId {
        if self.regions.is_some() {
            PassId::MemoryAwareClosureGeneration
        } else {
            PassId::ClosureGeneration
        }
    }

    fn apply(
        &self,
        ctx: &mut NetworkContext,
        intro: &mut Introspector,
        block: ExecutionBlock,
        operation: &str,
        _verbosity: Verbosity,
    ) -> Result<ExecutionBlock, CompileError> {
        let call_text = intro.render_block(&block)?;
        let references = intro.extract_dynamic_references(ctx, &block, ReferenceQuery::unrolled())?;

        let void = ctx.types.void();
        let mut fields = Vec::new();
        let mut excluded = Vec::new();
        for name in references {
            let buffer = ctx.lookup(&name)?;
            if buffer.is_struct() {
                continue;
            }
            if let Some(regions) = &self.regions {
                if !regions.admits(buffer.level.as_deref()) {
                    excluded.push(name);
                    continue;
                }
            }
            let opaque = buffer.is_transient();
            let pointee = if opaque { void } else { buffer.ty };
            fields.push(Field {
                name,
                ty: ctx.types.pointer_to(pointee),
                opaque,
            });
        }

        let closure = ctx.mangle(&format!("{}_closure", operation));
        let args_type = format!("{}_args_t", closure);
        let args = format!("{}_args", closure);
        let struct_ty = ctx.types.struct_type(
            &args_type,
            fields.iter().map(|f| (f.name.clone(), f.ty)).collect(),
        )?;

        let value = ctx.types.make(
            struct_ty,
            Value::Struct(
                fields
                    .iter()
                    .map(|f| (f.name.clone(), Value::Pointer(Some(f.name.clone()))))
                    .collect::<BTreeMap<_, _>>(),
            ),
        )?;
        let size = ctx.types.size_bytes(struct_ty)?;
        let reuse = ctx
            .lookup(&args)
            .is_ok_and(|b| matches!(&b.kind, BufferKind::Struct { value: v } if *v == value));
        if !reuse {
            if ctx.is_buffer(&args) {
                ctx.remove(&args)?;
            }
            ctx.add(Buffer::structure(&args, value, size), Scope::Local)?;
        }

        let mut declarations = Vec::with_capacity(fields.len());
        let mut unpack = Vec::with_capacity(fields.len());
        for field in &fields {
            let ty = ctx.types.type_name(field.ty)?;
            declarations.push(format!("    {} {};", ty, field.name));
            unpack.push(format!("    {} {} = args->{};", ty, field.name, field.name));
        }
        let (allocs, frees) = self.closure_locals(ctx, intro, &excluded, operation)?;
        let body: Vec<String> = unpack
            .into_iter()
            .chain(
                allocs
                    .iter()
                    .map(String::as_str)
                    .chain(call_text.lines())
                    .chain(frees.iter().map(String::as_str))
                    .map(|l| format!("    {}", l)),
            )
            .collect();

        let structure = self.render(
            intro,
            &self.templates.structure,
            Bindings::from([
                ("fields".to_string(), Binding::Code(declarations.join("\n"))),
                ("args_type".to_string(), Binding::Code(args_type.clone())),
            ]),
        )?;
        let function = self.render(
            intro,
            &self.templates.function,
            Bindings::from([
                ("name".to_string(), Binding::Code(closure.clone())),
                ("args_type".to_string(), Binding::Code(args_type.clone())),
                ("body".to_string(), Binding::Code(body.join("\n"))),
            ]),
        )?;
        let fresh_struct = ctx.hoist_definition(&args_type, structure)?;
        let fresh_function = ctx.hoist_definition(&closure, function)?;
        if fresh_struct || fresh_function {
            debug!("{}: closure {} with {} fields", operation, closure, fields.len());
        }

        let mut wrapped = ExecutionBlock::wrap(block);
        wrapped.add_left(CodeFragment::new(
            self.templates.call.clone(),
            Bindings::from([
                ("name".to_string(), Binding::Code(closure)),
                ("args".to_string(), Binding::Name(args.clone())),
            ]),
        ));
        if self.write_back {
            for field in fields.iter().filter(|f| !f.opaque) {
                wrapped.add_right(CodeFragment::new(
                    self.templates.write_back.clone(),
                    Bindings::from([
                        ("variable".to_string(), Binding::Name(field.name.clone())),
                        ("args".to_string(), Binding::Name(args.clone())),
                        ("field".to_string(), Binding::Code(field.name.clone())),
                    ]),
                ));
            }
        }
        Ok(wrapped)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
