// introspect.rs — Static analysis over code fragments
//
// Discovers which bound identifiers of a fragment are buffer-backed before the
// code is rendered, so the memory, closure and future passes can agree on the
// set of buffers an operation touches. Parsed templates are cached by the
// SHA-256 of their source; cached entries are never mutated, rewrites live on
// the `Template` itself.
//
// Preconditions: bindings name buffers registered in the context.
// Postconditions: reference lists are de-duplicated and ordered by context
//                 insertion order, locals before globals. A tiled block also
//                 reports the untiled buffers behind its arena views.
// Failure modes: template syntax errors; unknown buffers while unrolling.
// Side effects: fills the parse cache.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::block::{CodeFragment, ExecutionBlock};
use crate::buffer::{BufferKind, Scope};
use crate::context::NetworkContext;
use crate::diag::CompileError;
use crate::template::{parse_template, ParsedTemplate, Template, TemplateError};

/// Which references `extract_dynamic_references` reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceQuery {
    /// Also report buffers pointed to by struct-valued references.
    pub unroll_structs: bool,
    /// Also report global variables.
    pub include_globals: bool,
}

impl ReferenceQuery {
    pub fn unrolled() -> Self {
        Self {
            unroll_structs: true,
            include_globals: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Introspector {
    cache: HashMap<[u8; 32], Arc<ParsedTemplate>>,
}

impl Introspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a template, reusing the cached form for identical source text.
    pub fn parse(&mut self, template: &Template) -> Result<Arc<ParsedTemplate>, TemplateError> {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(template.source().as_bytes()));
        if let Some(parsed) = self.cache.get(&key) {
            return Ok(Arc::clone(parsed));
        }
        let parsed = Arc::new(parse_template(template.source())?);
        self.cache.insert(key, Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Number of distinct template sources parsed so far.
    pub fn cached_templates(&self) -> usize {
        self.cache.len()
    }

    pub fn render(&mut self, fragment: &CodeFragment) -> Result<String, CompileError> {
        let parsed = self.parse(&fragment.template)?;
        Ok(parsed.render(fragment.template.rewrites(), &fragment.bindings)?)
    }

    /// Render every fragment of a block, one per line.
    pub fn render_block(&mut self, block: &ExecutionBlock) -> Result<String, CompileError> {
        let mut lines = Vec::with_capacity(block.len());
        for fragment in block.fragments() {
            lines.push(self.render(fragment)?);
        }
        Ok(lines.join("\n"))
    }

    /// Buffer names bound to identifiers the fragment's template uses.
    fn touched_buffers(
        &mut self,
        ctx: &NetworkContext,
        fragment: &CodeFragment,
        out: &mut BTreeSet<String>,
    ) -> Result<(), CompileError> {
        let parsed = self.parse(&fragment.template)?;
        for key in parsed.identifiers(&fragment.bindings) {
            let name = fragment.bindings.get(&key).and_then(|b| b.as_name());
            if let Some(name) = name.filter(|n| ctx.is_buffer(n)) {
                out.insert(name.to_string());
            }
        }
        Ok(())
    }

    /// Dynamic references of a single fragment.
    pub fn fragment_references(
        &mut self,
        ctx: &NetworkContext,
        fragment: &CodeFragment,
        query: ReferenceQuery,
    ) -> Result<Vec<String>, CompileError> {
        let mut touched = BTreeSet::new();
        self.touched_buffers(ctx, fragment, &mut touched)?;
        finish_references(ctx, touched, query)
    }

    /// Dynamic references of every fragment in a block, plus the untiled
    /// tensors recorded by tiling.
    pub fn extract_dynamic_references(
        &mut self,
        ctx: &NetworkContext,
        block: &ExecutionBlock,
        query: ReferenceQuery,
    ) -> Result<Vec<String>, CompileError> {
        let mut touched = BTreeSet::new();
        for fragment in block.fragments() {
            self.touched_buffers(ctx, fragment, &mut touched)?;
        }
        // Untiled tensors of a tiled block, which may not appear in its code.
        if let Some(record) = &block.tile_record {
            for tensor in &record.tiled {
                if ctx.is_buffer(&tensor.external) {
                    touched.insert(tensor.external.clone());
                }
            }
        }
        finish_references(ctx, touched, query)
    }

    pub fn index_vars<S: AsRef<str>>(&self, template: &mut Template, names: &[S], index: &str) {
        if names.is_empty() {
            return;
        }
        template.index_vars(names, index);
    }

    pub fn dereference_vars<S: AsRef<str>>(&self, template: &mut Template, names: &[S]) {
        if names.is_empty() {
            return;
        }
        template.dereference_vars(names);
    }
}

/// Buffers reachable through non-null pointers in the struct buffer `name`,
/// transitively.
pub fn unroll_struct_references(
    ctx: &NetworkContext,
    name: &str,
) -> Result<Vec<String>, CompileError> {
    let mut out = Vec::new();
    let mut stack = vec![name.to_string()];
    let mut seen = BTreeSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current.clone()) {
            continue;
        }
        if let BufferKind::Struct { value } = &ctx.lookup(&current)?.kind {
            for target in value.value().pointer_targets() {
                if ctx.is_buffer(target) {
                    out.push(target.to_string());
                    stack.push(target.to_string());
                }
            }
        }
    }
    Ok(out)
}

fn finish_references(
    ctx: &NetworkContext,
    mut touched: BTreeSet<String>,
    query: ReferenceQuery,
) -> Result<Vec<String>, CompileError> {
    if query.unroll_structs {
        let structs: Vec<String> = touched.iter().cloned().collect();
        for name in structs {
            touched.extend(unroll_struct_references(ctx, &name)?);
        }
    }
    let locals = ctx
        .buffers(Scope::Local)
        .filter(|b| b.deploy && touched.contains(&b.name));
    let globals = ctx.buffers(Scope::Global).filter(|b| {
        query.include_globals
            && b.deploy
            && b.is_variable()
            && !ctx.is_local(&b.name)
            && touched.contains(&b.name)
    });
    Ok(locals.chain(globals).map(|b| b.name.clone()).collect())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::buffer::Buffer;
    use crate::template::Binding;
    use crate::types::Value;

    fn name(n: &str) -> Binding {
        Binding::Name(n.into())
    }

    #[test]
    fn references_follow_context_order() {
        let mut ctx = NetworkContext::default();
        let f = ctx.types.float32();
        for n in ["a", "c", "b"] {
            ctx.add(Buffer::variable(n, f, 4), Scope::Local).unwrap();
        }
        let block = ExecutionBlock::from_fragments([CodeFragment::from_source(
            "k(${x}, ${y}, ${z});",
            [("x", name("b")), ("y", name("a")), ("z", name("c"))],
        )]);
        let mut intro = Introspector::new();
        let refs = intro
            .extract_dynamic_references(&ctx, &block, ReferenceQuery::default())
            .unwrap();
        assert_eq!(refs, vec!["a", "c", "b"]);
    }

    #[test]
    fn literals_and_static_buffers_are_skipped() {
        let mut ctx = NetworkContext::default();
        let f = ctx.types.float32();
        ctx.add(Buffer::variable("x", f, 4), Scope::Local).unwrap();
        ctx.add(Buffer::variable("w", f, 4).statically_placed(), Scope::Local)
            .unwrap();
        ctx.add(Buffer::variable("g", f, 4), Scope::Global).unwrap();
        let frag = CodeFragment::from_source(
            "k(${x}, ${w}, ${g}, ${n}, ${unused});",
            [
                ("x", name("x")),
                ("w", name("w")),
                ("g", name("g")),
                ("n", Binding::Int(3)),
                ("unused", name("not_a_buffer")),
            ],
        );
        let mut intro = Introspector::new();
        assert_eq!(
            intro
                .fragment_references(&ctx, &frag, ReferenceQuery::default())
                .unwrap(),
            vec!["x"]
        );
        let with_globals = ReferenceQuery {
            unroll_structs: false,
            include_globals: true,
        };
        assert_eq!(
            intro.fragment_references(&ctx, &frag, with_globals).unwrap(),
            vec!["x", "g"]
        );
    }

    #[test]
    fn struct_unrolling_skips_null_pointers() {
        let mut ctx = NetworkContext::default();
        let f = ctx.types.float32();
        let p = ctx.types.pointer_to(f);
        let st = ctx
            .types
            .struct_type("k_args_t", vec![("src".into(), p), ("dst".into(), p)])
            .unwrap();
        let value = ctx
            .types
            .make(
                st,
                Value::Struct(BTreeMap::from([
                    ("src".into(), Value::Pointer(Some("in".into()))),
                    ("dst".into(), Value::Pointer(None)),
                ])),
            )
            .unwrap();
        ctx.add(Buffer::variable("in", f, 16), Scope::Local).unwrap();
        ctx.add(Buffer::structure("k_args", value, 8), Scope::Local)
            .unwrap();

        let frag = CodeFragment::from_source("k(&${args});", [("args", name("k_args"))]);
        let mut intro = Introspector::new();
        assert_eq!(
            intro
                .fragment_references(&ctx, &frag, ReferenceQuery::default())
                .unwrap(),
            vec!["k_args"]
        );
        assert_eq!(
            intro
                .fragment_references(&ctx, &frag, ReferenceQuery::unrolled())
                .unwrap(),
            vec!["in", "k_args"]
        );
    }

    #[test]
    fn keyed_prefix_access_counts_as_reference() {
        let mut ctx = NetworkContext::default();
        let f = ctx.types.float32();
        ctx.add(Buffer::variable("t0", f, 4), Scope::Local).unwrap();
        ctx.add(Buffer::variable("t1", f, 4), Scope::Local).unwrap();
        let frag = CodeFragment::from_source(
            "${kwargs['in_' + str(i)]}",
            [("in_0", name("t0")), ("in_1", name("t1"))],
        );
        let mut intro = Introspector::new();
        assert_eq!(
            intro
                .fragment_references(&ctx, &frag, ReferenceQuery::default())
                .unwrap(),
            vec!["t0", "t1"]
        );
    }

    #[test]
    fn parse_cache_is_keyed_by_source() {
        let mut intro = Introspector::new();
        let mut a = Template::new("f(${x});");
        let b = Template::new("f(${x});");
        let first = intro.parse(&a).unwrap();
        intro.dereference_vars(&mut a, &["x"]);
        let second = intro.parse(&a).unwrap();
        let third = intro.parse(&b).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(intro.cached_templates(), 1);
    }

    #[test]
    fn render_block_joins_lines() {
        let block = ExecutionBlock::from_fragments([
            CodeFragment::from_source("a(${x});", [("x", Binding::Int(1))]),
            CodeFragment::from_source("b();", Vec::<(String, Binding)>::new()),
        ]);
        let mut intro = Introspector::new();
        assert_eq!(intro.render_block(&block).unwrap(), "a(1);\nb();");
    }
}
