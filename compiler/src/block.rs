// block.rs — Code fragments and execution blocks
//
// An execution block is the ordered list of code fragments implementing one
// scheduled operation. Passes only ever grow it at either end. Closure
// generation wraps a block into a new one that keeps the original as its base.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::template::{Binding, Bindings, Template};
use crate::tiling::{MemoryConstraint, TileConstraint, TileRecord};

/// Tiling metadata attached to the fragment that implements the kernel.
#[derive(Clone)]
pub struct TileAnnotation {
    pub constraint: MemoryConstraint,
    pub solver: Arc<dyn TileConstraint>,
}

impl fmt::Debug for TileAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileAnnotation")
            .field("constraint", &self.constraint)
            .finish_non_exhaustive()
    }
}

/// A template plus the bindings it is rendered with.
#[derive(Debug, Clone)]
pub struct CodeFragment {
    pub template: Template,
    pub bindings: Bindings,
    pub tiling: Option<TileAnnotation>,
}

impl CodeFragment {
    pub fn new(template: Template, bindings: Bindings) -> Self {
        Self {
            template,
            bindings,
            tiling: None,
        }
    }

    /// Fragment from template source and `(name, binding)` pairs.
    pub fn from_source<I, K>(source: &str, bindings: I) -> Self
    where
        I: IntoIterator<Item = (K, Binding)>,
        K: Into<String>,
    {
        Self::new(
            Template::new(source),
            bindings.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )
    }

    pub fn with_tiling(mut self, annotation: TileAnnotation) -> Self {
        self.tiling = Some(annotation);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionBlock {
    fragments: VecDeque<CodeFragment>,
    /// Block this one wraps (closure generation).
    base: Option<Box<ExecutionBlock>>,
    /// Tiling state shared between the tiling passes.
    pub tile_record: Option<TileRecord>,
}

impl ExecutionBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fragments(fragments: impl IntoIterator<Item = CodeFragment>) -> Self {
        Self {
            fragments: fragments.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Start an empty block wrapping `base`.
    pub fn wrap(base: ExecutionBlock) -> Self {
        Self {
            fragments: VecDeque::new(),
            tile_record: None,
            base: Some(Box::new(base)),
        }
    }

    pub fn add_left(&mut self, fragment: CodeFragment) {
        self.fragments.push_front(fragment);
    }

    pub fn add_right(&mut self, fragment: CodeFragment) {
        self.fragments.push_back(fragment);
    }

    pub fn fragments(&self) -> impl Iterator<Item = &CodeFragment> {
        self.fragments.iter()
    }

    pub fn fragments_mut(&mut self) -> impl Iterator<Item = &mut CodeFragment> {
        self.fragments.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Directly wrapped block, if any.
    pub fn base(&self) -> Option<&ExecutionBlock> {
        self.base.as_deref()
    }

    /// Innermost block, unwrapping nested closures.
    pub fn base_block(&self) -> &ExecutionBlock {
        let mut block = self;
        while let Some(inner) = block.base.as_deref() {
            block = inner;
        }
        block
    }
}
