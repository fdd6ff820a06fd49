// pass.rs — Pass trait and pass descriptors
//
// Every code transformation implements `CodeTransformationPass`: it receives
// the context, the shared introspection service and one operation's block, and
// returns the transformed block. Descriptors carry static metadata used by the
// pipeline for verbose output and ordering checks.

use std::collections::HashSet;

use crate::block::ExecutionBlock;
use crate::context::NetworkContext;
use crate::diag::CompileError;
use crate::introspect::Introspector;

/// Diagnostic detail requested from passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Verbosity {
    /// Emit comment fragments describing pass decisions.
    #[serde(default)]
    pub annotate: bool,
}

pub trait CodeTransformationPass {
    fn id(&self) -> PassId;

    fn apply(
        &self,
        ctx: &mut NetworkContext,
        intro: &mut Introspector,
        block: ExecutionBlock,
        operation: &str,
        verbosity: Verbosity,
    ) -> Result<ExecutionBlock, CompileError>;

    fn name(&self) -> &'static str {
        descriptor(self.id()).name
    }
}

// ── Pass identifiers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    TilingVariableReplacement,
    VariableReplacementUpdate,
    TileLoopGeneration,
    FutureResolution,
    ClosureGeneration,
    MemoryAwareClosureGeneration,
    StructInitialization,
    MemoryManagement,
    MemoryPassthrough,
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Passes that must run earlier when both appear in one pipeline.
    pub after: &'static [PassId],
    /// Context state the pass mutates.
    pub mutates: &'static str,
    /// Documentation only.
    pub invariants: &'static str,
}

pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::TilingVariableReplacement => PassDescriptor {
            name: "tiling_variable_replacement",
            after: &[],
            mutates: "arena, table and view buffers; hoisted tables",
            invariants: "at most one annotated fragment; consistent tile counts",
        },
        PassId::VariableReplacementUpdate => PassDescriptor {
            name: "variable_replacement_update",
            after: &[PassId::TilingVariableReplacement],
            mutates: "nothing",
            invariants: "per-tile updates precede the kernel",
        },
        PassId::TileLoopGeneration => PassDescriptor {
            name: "tile_loop_generation",
            after: &[
                PassId::TilingVariableReplacement,
                PassId::VariableReplacementUpdate,
            ],
            mutates: "nothing",
            invariants: "views declared before the loop",
        },
        PassId::FutureResolution => PassDescriptor {
            name: "future_resolution",
            after: &[],
            mutates: "state buffer users",
            invariants: "dispatch in producer, resolve in first consumer",
        },
        PassId::ClosureGeneration => PassDescriptor {
            name: "closure_generation",
            after: &[PassId::TileLoopGeneration, PassId::FutureResolution],
            mutates: "args struct buffer, struct types, hoisted definitions",
            invariants: "one definition per closure name",
        },
        PassId::MemoryAwareClosureGeneration => PassDescriptor {
            name: "memory_aware_closure_generation",
            after: &[PassId::TileLoopGeneration, PassId::FutureResolution],
            mutates: "args struct buffer, struct types, hoisted definitions",
            invariants: "one definition per closure name",
        },
        PassId::StructInitialization => PassDescriptor {
            name: "struct_initialization",
            after: &[
                PassId::ClosureGeneration,
                PassId::MemoryAwareClosureGeneration,
            ],
            mutates: "nothing",
            invariants: "struct buffers initialised before use",
        },
        PassId::MemoryManagement => PassDescriptor {
            name: "memory_management",
            after: &[PassId::TilingVariableReplacement, PassId::TileLoopGeneration],
            mutates: "liveness flags, arena counters",
            invariants: "no double allocation or free; views after targets",
        },
        PassId::MemoryPassthrough => PassDescriptor {
            name: "memory_passthrough",
            after: &[PassId::TilingVariableReplacement, PassId::TileLoopGeneration],
            mutates: "liveness flags, arena counters",
            invariants: "no double allocation or free",
        },
    }
}

/// All pass IDs in declaration order.
pub const ALL_PASSES: [PassId; 9] = [
    PassId::TilingVariableReplacement,
    PassId::VariableReplacementUpdate,
    PassId::TileLoopGeneration,
    PassId::FutureResolution,
    PassId::ClosureGeneration,
    PassId::MemoryAwareClosureGeneration,
    PassId::StructInitialization,
    PassId::MemoryManagement,
    PassId::MemoryPassthrough,
];

// ── Ordering checks ────────────────────────────────────────────────────────

/// Pairs `(pass, required)` where `required` appears after `pass` in
/// `order` although `pass` must run after it.
pub fn ordering_violations(order: &[PassId]) -> Vec<(PassId, PassId)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (i, &pass) in order.iter().enumerate() {
        for &required in descriptor(pass).after {
            if !seen.contains(&required) && order[i + 1..].contains(&required) {
                out.push((pass, required));
            }
        }
        seen.insert(pass);
    }
    out
}

// ── Tests ──────────────────────────────────────────────────────────────────
