// tiling.rs — Tiling, variable replacement, tile loops
//
// Splits one operation into tiles that fit a memory level. An external
// constraint solver decides the tile count, which scalar bindings vary per
// tile, and the per-tile base offsets of each tiled tensor; this module turns
// that decision into context buffers and code.
//
// Preconditions: at most one fragment of a block carries a tile annotation.
// Postconditions: tiled tensors and level transients are rebound to views of
//                 the level's arena; per-tile scalars read through hoisted
//                 tables; tile state is recorded on the block for the later
//                 tiling passes.
// Failure modes: ambiguous annotations, inconsistent tile counts, missing
//                level ranges, solver errors.
// Side effects: adds arena, table and reference buffers to the context and
//               hoists table definitions.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::block::{CodeFragment, ExecutionBlock};
use crate::buffer::{Buffer, Scope};
use crate::context::NetworkContext;
use crate::diag::CompileError;
use crate::introspect::Introspector;
use crate::memory::{buffer_bindings, MemoryTemplates};
use crate::pass::{CodeTransformationPass, PassId, Verbosity};
use crate::template::{Binding, Bindings, Template};
use crate::types::{TypeId, Value};

// ── Memory constraints ──────────────────────────────────────────────────────

/// Byte range inside a level's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub offset: u64,
    pub length: u64,
}

impl AddressRange {
    /// One past the last byte, `None` if the range wraps `u64`.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

/// Levels one tensor may occupy, with its placement in each.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorMemoryConstraint {
    pub levels: BTreeMap<String, AddressRange>,
}

/// Placement of every tensor an operation touches, keyed by buffer name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryConstraint {
    pub tensors: BTreeMap<String, TensorMemoryConstraint>,
}

impl MemoryConstraint {
    pub fn with_range(mut self, tensor: &str, level: &str, offset: u64, length: u64) -> Self {
        self.tensors
            .entry(tensor.to_string())
            .or_default()
            .levels
            .insert(level.to_string(), AddressRange { offset, length });
        self
    }

    pub fn range(&self, tensor: &str, level: &str) -> Option<AddressRange> {
        self.tensors.get(tensor)?.levels.get(level).copied()
    }

    /// Bytes the arena of `level` must provide. `None` when a range
    /// overflows.
    pub fn arena_extent(&self, level: &str) -> Option<u64> {
        self.tensors
            .values()
            .filter_map(|t| t.levels.get(level))
            .try_fold(0, |extent: u64, range| Some(extent.max(range.end()?)))
    }
}

// ── Solver output ───────────────────────────────────────────────────────────

/// Scalar bindings whose value changes from tile to tile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableReplacementScheme {
    /// Binding key → one value per tile.
    pub per_tile: BTreeMap<String, Vec<i64>>,
    /// Element type of each table; `int32_t` when absent.
    #[serde(default)]
    pub types: BTreeMap<String, TypeId>,
}

/// Per-tile base byte offsets into the untiled tensors, keyed by binding key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TilingSchedule {
    #[serde(default)]
    pub input_base_offsets: BTreeMap<String, Vec<u64>>,
    #[serde(default)]
    pub output_base_offsets: BTreeMap<String, Vec<u64>>,
}

impl TilingSchedule {
    /// Append `other`'s tiles after this schedule's tiles.
    pub fn concat(mut self, other: TilingSchedule) -> TilingSchedule {
        for (key, offsets) in other.input_base_offsets {
            self.input_base_offsets.entry(key).or_default().extend(offsets);
        }
        for (key, offsets) in other.output_base_offsets {
            self.output_base_offsets.entry(key).or_default().extend(offsets);
        }
        self
    }

    fn all_offsets(&self) -> impl Iterator<Item = (&String, &Vec<u64>, TransferDirection)> {
        self.input_base_offsets
            .iter()
            .map(|(k, v)| (k, v, TransferDirection::In))
            .chain(
                self.output_base_offsets
                    .iter()
                    .map(|(k, v)| (k, v, TransferDirection::Out)),
            )
    }

    /// Tile count, or `None` when the schedule tiles no tensor.
    pub fn num_tiles(&self) -> Option<usize> {
        self.all_offsets().map(|(_, v, _)| v.len()).max()
    }
}

/// Tiling-constraint oracle for one kernel.
pub trait TileConstraint {
    fn solve(
        &self,
        constraint: &MemoryConstraint,
        level: &str,
        ctx: &NetworkContext,
        bindings: &Bindings,
    ) -> Result<(VariableReplacementScheme, Vec<TilingSchedule>), CompileError>;
}

/// A solver whose answer was computed ahead of time (e.g. recorded in a
/// deployment plan).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecomputedTiling {
    #[serde(default)]
    pub scheme: VariableReplacementScheme,
    #[serde(default)]
    pub schedules: Vec<TilingSchedule>,
}

impl TileConstraint for PrecomputedTiling {
    fn solve(
        &self,
        _constraint: &MemoryConstraint,
        _level: &str,
        _ctx: &NetworkContext,
        _bindings: &Bindings,
    ) -> Result<(VariableReplacementScheme, Vec<TilingSchedule>), CompileError> {
        Ok((self.scheme.clone(), self.schedules.clone()))
    }
}

// ── Tile record ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Into the tile before the kernel runs.
    In,
    /// Out of the tile after the kernel runs.
    Out,
}

/// A tensor whose tile lives in a level arena. `external` stays live across
/// the loop even when no transfer names it in code.
#[derive(Debug, Clone, PartialEq)]
pub struct TiledTensor {
    pub direction: TransferDirection,
    /// Untiled buffer.
    pub external: String,
    /// Arena view holding the current tile.
    pub local: String,
    /// Hoisted table of per-tile base offsets into `external`.
    pub offsets: String,
    pub bytes: u64,
}

/// State left on a block by `TilingVariableReplacement`.
#[derive(Debug, Clone, Default)]
pub struct TileRecord {
    pub level: String,
    pub loop_var: String,
    pub num_tiles: usize,
    /// `(reference, table)` pairs updated once per tile.
    pub replacements: Vec<(String, String)>,
    pub tiled: Vec<TiledTensor>,
    /// Declarations of the views created for this block.
    pub declarations: Vec<CodeFragment>,
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Global backing buffer of `level`, grown to at least `extent` bytes.
fn ensure_arena(ctx: &mut NetworkContext, level: &str, extent: u64) -> Result<String, CompileError> {
    let name = ctx.mangle(&format!("{}_arena", level));
    if ctx.is_buffer(&name) {
        let arena = ctx.lookup_mut(&name)?;
        arena.size = arena.size.max(extent);
    } else {
        let byte = ctx.types.int(8, false);
        ctx.add(
            Buffer::variable(&name, byte, extent)
                .with_level(level)
                .statically_placed(),
            Scope::Global,
        )?;
        debug!("created arena {} ({} bytes)", name, extent);
    }
    Ok(name)
}

/// Register (or re-point) a view buffer that no allocation pass manages.
fn bind_view(
    ctx: &mut NetworkContext,
    name: &str,
    ty: TypeId,
    target: &str,
    offset: u64,
    level: &str,
) -> Result<(), CompileError> {
    if ctx.is_buffer(name) {
        ctx.remove(name)?;
    }
    ctx.add(
        Buffer::reference(name, ty, target, offset)
            .with_level(level)
            .statically_placed(),
        Scope::Local,
    )
}

/// Read-only per-tile table, registered as a global constant and hoisted.
fn hoist_table(
    ctx: &mut NetworkContext,
    name: &str,
    ty: TypeId,
    values: &[i64],
    level: &str,
) -> Result<(), CompileError> {
    let value = ctx
        .types
        .make(ty, Value::Array(values.iter().map(|&v| Value::Int(v)).collect()))?;
    let code = format!(
        "static const {} {}[{}] = {};",
        ctx.types.type_name(ty)?,
        name,
        values.len(),
        value.value()
    );
    if !ctx.is_buffer(name) {
        let size = ctx.types.size_bytes(ty)? * values.len() as u64;
        ctx.add(Buffer::constant(name, value, size).with_level(level), Scope::Global)?;
    }
    ctx.hoist_definition(name, code)?;
    Ok(())
}

fn declaration(ctx: &NetworkContext, name: &str) -> Result<CodeFragment, CompileError> {
    let buffer = ctx.lookup(name)?;
    Ok(CodeFragment::new(
        MemoryTemplates::default().reference,
        buffer_bindings(ctx, buffer)?,
    ))
}

// ── Variable replacement ────────────────────────────────────────────────────

/// Rebinds the annotated fragment of a block to tiles of `level`.
#[derive(Debug, Clone)]
pub struct TilingVariableReplacement {
    level: String,
}

impl TilingVariableReplacement {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
        }
    }
}

impl CodeTransformationPass for TilingVariableReplacement {
    fn id(&self) -> PassId {
        PassId::TilingVariableReplacement
    }

    fn apply(
        &self,
        ctx: &mut NetworkContext,
        _intro: &mut Introspector,
        mut block: ExecutionBlock,
        operation: &str,
        _verbosity: Verbosity,
    ) -> Result<ExecutionBlock, CompileError> {
        let annotated: Vec<usize> = block
            .fragments()
            .enumerate()
            .filter(|(_, f)| f.tiling.is_some())
            .map(|(i, _)| i)
            .collect();
        if annotated.len() > 1 {
            return Err(CompileError::AmbiguousTiling {
                operation: operation.to_string(),
                count: annotated.len(),
            });
        }
        let Some(&index) = annotated.first() else {
            return Ok(block);
        };
        let level = self.level.as_str();

        let Some(fragment) = block.fragments_mut().nth(index) else {
            return Ok(block);
        };
        let Some(annotation) = fragment.tiling.take() else {
            return Ok(block);
        };
        let (scheme, schedules) =
            annotation
                .solver
                .solve(&annotation.constraint, level, ctx, &fragment.bindings)?;
        let schedule = schedules
            .into_iter()
            .reduce(TilingSchedule::concat)
            .unwrap_or_default();

        let num_tiles = schedule
            .num_tiles()
            .or_else(|| scheme.per_tile.values().map(Vec::len).max())
            .unwrap_or(1);
        for (key, offsets, _) in schedule.all_offsets() {
            check_count(operation, key, num_tiles, offsets.len())?;
        }
        for (key, values) in &scheme.per_tile {
            check_count(operation, key, num_tiles, values.len())?;
        }

        let extent = annotation
            .constraint
            .arena_extent(level)
            .ok_or_else(|| CompileError::Solver {
                operation: operation.to_string(),
                message: format!("an address range in {} overflows", level),
            })?;
        let arena = ensure_arena(ctx, level, extent)?;
        // The whole extent is occupied while this operation runs.
        ctx.reserve(level, extent);
        ctx.release(level, extent);
        let mut record = TileRecord {
            level: level.to_string(),
            loop_var: ctx.mangle(&format!("{}_tile", operation)),
            num_tiles,
            ..TileRecord::default()
        };

        // Tiled tensors: the tile lives at a fixed arena range, the schedule
        // says where each tile comes from in the untiled buffer.
        for (key, offsets, direction) in schedule.all_offsets() {
            let bound = fragment
                .bindings
                .get(key)
                .and_then(Binding::as_name)
                .ok_or_else(|| CompileError::Solver {
                    operation: operation.to_string(),
                    message: format!("tiled binding '{}' does not name a buffer", key),
                })?
                .to_string();
            let root = ctx.resolve_root(&bound)?;
            let range = annotation.constraint.range(&root, level).ok_or_else(|| {
                CompileError::MissingLevelConstraint {
                    buffer: root.clone(),
                    level: level.to_string(),
                }
            })?;
            let ty = ctx.lookup(&root)?.ty;
            let view = ctx.mangle(&format!("{}.{}.{}", operation, key, level));
            bind_view(ctx, &view, ty, &arena, range.offset, level)?;
            let table = ctx.mangle(&format!("{}/{}/offsets", operation, key));
            let u32_ = ctx.types.int(32, false);
            let offsets: Vec<i64> = offsets.iter().map(|&o| o as i64).collect();
            hoist_table(ctx, &table, u32_, &offsets, level)?;

            debug!(
                "{}: tile {} of {} at {}+{} ({} bytes)",
                operation, view, root, arena, range.offset, range.length
            );
            fragment.bindings.insert(key.clone(), Binding::Name(view.clone()));
            record.declarations.push(declaration(ctx, &view)?);
            record.tiled.push(TiledTensor {
                direction,
                external: bound,
                local: view,
                offsets: table,
                bytes: range.length,
            });
        }

        // Transients placed at this level live in the arena for the whole
        // operation; their offset is fixed by the constraint.
        let transients: Vec<(String, String)> = fragment
            .bindings
            .iter()
            .filter_map(|(k, b)| Some((k.clone(), b.as_name()?.to_string())))
            .filter(|(_, n)| {
                ctx.lookup(n)
                    .is_ok_and(|b| b.is_transient() && b.level.as_deref() == Some(level))
            })
            .collect();
        for (key, name) in transients {
            let range = annotation.constraint.range(&name, level).ok_or_else(|| {
                CompileError::MissingLevelConstraint {
                    buffer: name.clone(),
                    level: level.to_string(),
                }
            })?;
            let ty = ctx.lookup(&name)?.ty;
            let view = ctx.mangle(&format!("{}:{}:{}", operation, name, level));
            bind_view(ctx, &view, ty, &arena, range.offset, level)?;
            debug!("{}: transient {} placed at {}+{}", operation, name, arena, range.offset);
            fragment.bindings.insert(key, Binding::Name(view.clone()));
            record.declarations.push(declaration(ctx, &view)?);
        }

        // Per-tile scalars read through a pointer into a hoisted table.
        let mut dereferenced = Vec::new();
        for (key, values) in &scheme.per_tile {
            let ty = match scheme.types.get(key) {
                Some(&ty) => ty,
                None => ctx.types.int(32, true),
            };
            let table = ctx.mangle(&format!("{}/{}/tiles", operation, key));
            hoist_table(ctx, &table, ty, values, level)?;
            let view = ctx.mangle(&format!("{}/{}/ref", operation, key));
            bind_view(ctx, &view, ty, &table, 0, level)?;
            debug!("{}: {} replaced per tile through {}", operation, key, view);
            fragment.bindings.insert(key.clone(), Binding::Name(view.clone()));
            record.declarations.push(declaration(ctx, &view)?);
            record.replacements.push((view, table));
            dereferenced.push(key.clone());
        }
        fragment.template.dereference_vars(&dereferenced);

        block.tile_record = Some(record);
        Ok(block)
    }
}

fn check_count(operation: &str, key: &str, expected: usize, found: usize) -> Result<(), CompileError> {
    if expected == found {
        return Ok(());
    }
    Err(CompileError::TileCountMismatch {
        operation: operation.to_string(),
        name: key.to_string(),
        expected,
        found,
    })
}

// ── Per-tile updates ────────────────────────────────────────────────────────

/// Points every per-tile scalar at the current tile's table entry.
#[derive(Debug, Clone)]
pub struct VariableReplacementUpdate {
    template: Template,
}

impl Default for VariableReplacementUpdate {
    fn default() -> Self {
        Self {
            template: Template::new("${reference} = &${table}[${index}];"),
        }
    }
}

impl CodeTransformationPass for VariableReplacementUpdate {
    fn id(&self) -> PassId {
        PassId::VariableReplacementUpdate
    }

    fn apply(
        &self,
        _ctx: &mut NetworkContext,
        _intro: &mut Introspector,
        mut block: ExecutionBlock,
        _operation: &str,
        _verbosity: Verbosity,
    ) -> Result<ExecutionBlock, CompileError> {
        let Some(record) = block.tile_record.clone() else {
            return Ok(block);
        };
        for (reference, table) in record.replacements.iter().rev() {
            let bindings = Bindings::from([
                ("reference".to_string(), Binding::Name(reference.clone())),
                ("table".to_string(), Binding::Name(table.clone())),
                ("index".to_string(), Binding::Code(record.loop_var.clone())),
            ]);
            block.add_left(CodeFragment::new(self.template.clone(), bindings));
        }
        Ok(block)
    }
}

// ── Tile loop ───────────────────────────────────────────────────────────────

/// A block move between an untiled buffer and its tile.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTransfer {
    pub direction: TransferDirection,
    pub external: String,
    pub local: String,
    /// Table of per-tile byte offsets into `external`.
    pub offsets: String,
    pub index: String,
    pub bytes: u64,
}

/// Emits data-movement code for one block transfer.
pub trait TransferEmitter {
    fn emit(&self, transfer: &BlockTransfer) -> CodeFragment;
}

/// Synchronous copies through `memcpy`.
#[derive(Debug, Clone, Default)]
pub struct MemcpyTransfer;

impl TransferEmitter for MemcpyTransfer {
    fn emit(&self, transfer: &BlockTransfer) -> CodeFragment {
        let source = match transfer.direction {
            TransferDirection::In => {
                "memcpy(${local}, (char*)${external} + ${offsets}[${index}], ${bytes});"
            }
            TransferDirection::Out => {
                "memcpy((char*)${external} + ${offsets}[${index}], ${local}, ${bytes});"
            }
        };
        CodeFragment::from_source(
            source,
            [
                ("local", Binding::Name(transfer.local.clone())),
                ("external", Binding::Name(transfer.external.clone())),
                ("offsets", Binding::Name(transfer.offsets.clone())),
                ("index", Binding::Code(transfer.index.clone())),
                ("bytes", Binding::Int(transfer.bytes as i64)),
            ],
        )
    }
}

const LOOP_INDENT: &str = "    ";

/// Wraps a tiled block in a loop over its tiles, with view declarations in
/// front and optional transfers around the kernel.
#[derive(Clone)]
pub struct TileLoopGeneration {
    open: Template,
    close: Template,
    transfers: Option<Arc<dyn TransferEmitter>>,
}

impl std::fmt::Debug for TileLoopGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileLoopGeneration")
            .field("open", &self.open)
            .field("transfers", &self.transfers.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for TileLoopGeneration {
    fn default() -> Self {
        Self {
            open: Template::new("for (int ${index} = 0; ${index} < ${count}; ${index}++) {"),
            close: Template::new("}"),
            transfers: None,
        }
    }
}

impl TileLoopGeneration {
    pub fn with_transfers(mut self, emitter: Arc<dyn TransferEmitter>) -> Self {
        self.transfers = Some(emitter);
        self
    }

    pub fn with_templates(mut self, open: Template, close: Template) -> Self {
        self.open = open;
        self.close = close;
        self
    }
}

impl CodeTransformationPass for TileLoopGeneration {
    fn id(&self) -> PassId {
        PassId::TileLoopGeneration
    }

    fn apply(
        &self,
        _ctx: &mut NetworkContext,
        _intro: &mut Introspector,
        mut block: ExecutionBlock,
        operation: &str,
        _verbosity: Verbosity,
    ) -> Result<ExecutionBlock, CompileError> {
        let Some(record) = block.tile_record.clone() else {
            return Ok(block);
        };
        if let Some(emitter) = &self.transfers {
            for tensor in &record.tiled {
                let transfer = BlockTransfer {
                    direction: tensor.direction,
                    external: tensor.external.clone(),
                    local: tensor.local.clone(),
                    offsets: tensor.offsets.clone(),
                    index: record.loop_var.clone(),
                    bytes: tensor.bytes,
                };
                match tensor.direction {
                    TransferDirection::In => block.add_left(emitter.emit(&transfer)),
                    TransferDirection::Out => block.add_right(emitter.emit(&transfer)),
                }
            }
        }
        for fragment in block.fragments_mut() {
            fragment.template.indent(LOOP_INDENT);
        }
        let bindings = Bindings::from([
            ("index".to_string(), Binding::Code(record.loop_var.clone())),
            ("count".to_string(), Binding::Int(record.num_tiles as i64)),
        ]);
        block.add_left(CodeFragment::new(self.open.clone(), bindings.clone()));
        block.add_right(CodeFragment::new(self.close.clone(), bindings));
        for declaration in record.declarations.iter().rev() {
            block.add_left(declaration.clone());
        }
        debug!("{}: {} tiles over {}", operation, record.num_tiles, record.level);
        Ok(block)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
