// context.rs — Compilation context: buffer store, scoping, mangling, arenas
//
// The context is the shared state threaded through every pass. It maps buffer
// names to records in two partitions (local and global), keeps per-level arena
// counters, owns the session's type registry, and collects hoisted global
// definitions (closure structs and functions).
//
// Preconditions: none.
// Postconditions: a name resolves to exactly one buffer within its scope;
//                 `max_dynamic_size(level)` never decreases.
// Failure modes: unknown or duplicate names, double allocation/free, alias
//                cycles produce `CompileError`.
// Side effects: none beyond the context itself.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, Scope};
use crate::diag::CompileError;
use crate::types::TypeRegistry;

// ── Buffer table ────────────────────────────────────────────────────────────

/// Insertion-ordered name → buffer map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BufferTable {
    entries: Vec<Buffer>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl BufferTable {
    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, b)| (b.name.clone(), i))
            .collect();
    }

    fn get(&self, name: &str) -> Option<&Buffer> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Buffer> {
        self.index.get(name).map(|&i| &mut self.entries[i])
    }

    fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn push(&mut self, buffer: Buffer) {
        self.index.insert(buffer.name.clone(), self.entries.len());
        self.entries.push(buffer);
    }

    fn remove(&mut self, name: &str) -> Option<Buffer> {
        let i = self.index.remove(name)?;
        let buffer = self.entries.remove(i);
        self.reindex();
        Some(buffer)
    }
}

/// Hoisted global code (closure argument structs and function bodies).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDefinition {
    pub name: String,
    pub code: String,
}

// ── Context ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkContext {
    pub types: TypeRegistry,
    globals: BufferTable,
    locals: BufferTable,
    dynamic_size: BTreeMap<String, u64>,
    max_dynamic_size: BTreeMap<String, u64>,
    /// Buffers freed while an alias was live; released with their last alias.
    pending_release: BTreeSet<String>,
    name_prefix: String,
    mangled: BTreeMap<String, String>,
    definitions: Vec<GlobalDefinition>,
}

impl Default for NetworkContext {
    fn default() -> Self {
        Self::new(TypeRegistry::default())
    }
}

impl NetworkContext {
    pub fn new(types: TypeRegistry) -> Self {
        Self {
            types,
            globals: BufferTable::default(),
            locals: BufferTable::default(),
            dynamic_size: BTreeMap::new(),
            max_dynamic_size: BTreeMap::new(),
            pending_release: BTreeSet::new(),
            name_prefix: String::new(),
            mangled: BTreeMap::new(),
            definitions: Vec::new(),
        }
    }

    /// Prefix prepended to every mangled identifier.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Locals shadow globals.
    pub fn lookup(&self, name: &str) -> Result<&Buffer, CompileError> {
        self.locals
            .get(name)
            .or_else(|| self.globals.get(name))
            .ok_or_else(|| CompileError::UnknownBuffer {
                name: name.to_string(),
            })
    }

    pub fn lookup_mut(&mut self, name: &str) -> Result<&mut Buffer, CompileError> {
        if self.locals.contains(name) {
            return self.locals.get_mut(name).ok_or_else(|| unknown(name));
        }
        self.globals.get_mut(name).ok_or_else(|| unknown(name))
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.locals.contains(name)
    }

    pub fn is_global(&self, name: &str) -> bool {
        self.globals.contains(name)
    }

    pub fn is_buffer(&self, name: &str) -> bool {
        self.is_local(name) || self.is_global(name)
    }

    pub fn scope_of(&self, name: &str) -> Option<Scope> {
        if self.is_local(name) {
            Some(Scope::Local)
        } else if self.is_global(name) {
            Some(Scope::Global)
        } else {
            None
        }
    }

    /// Buffers of one scope, in insertion order.
    pub fn buffers(&self, scope: Scope) -> impl Iterator<Item = &Buffer> {
        match scope {
            Scope::Local => self.locals.entries.iter(),
            Scope::Global => self.globals.entries.iter(),
        }
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Register a buffer. A reference is recorded as an alias of its target.
    pub fn add(&mut self, buffer: Buffer, scope: Scope) -> Result<(), CompileError> {
        check_identifier(&buffer.name)?;
        let table = match scope {
            Scope::Local => &self.locals,
            Scope::Global => &self.globals,
        };
        if table.contains(&buffer.name) {
            return Err(CompileError::DuplicateBuffer {
                name: buffer.name,
                scope: scope.to_string(),
            });
        }
        if let Some(target) = buffer.target() {
            let name = buffer.name.clone();
            let target = self.lookup_mut(target)?;
            if !target.aliases.contains(&name) {
                target.aliases.push(name);
            }
        }
        match scope {
            Scope::Local => self.locals.push(buffer),
            Scope::Global => self.globals.push(buffer),
        }
        Ok(())
    }

    /// Remove a buffer, detaching it from its target's alias list.
    pub fn remove(&mut self, name: &str) -> Result<Buffer, CompileError> {
        let buffer = self
            .locals
            .remove(name)
            .or_else(|| self.globals.remove(name))
            .ok_or_else(|| unknown(name))?;
        if let Some(target) = buffer.target() {
            if let Ok(target) = self.lookup_mut(target) {
                target.aliases.retain(|a| a != name);
            }
        }
        Ok(buffer)
    }

    /// Follow a reference chain down to the buffer that owns the storage.
    pub fn resolve_root(&self, name: &str) -> Result<String, CompileError> {
        let mut seen = Vec::new();
        let mut current = name.to_string();
        loop {
            if seen.contains(&current) {
                return Err(CompileError::AliasCycle { buffers: seen });
            }
            let buffer = self.lookup(&current)?;
            match buffer.target() {
                Some(target) => {
                    seen.push(current);
                    current = target.to_string();
                }
                None => return Ok(current),
            }
        }
    }

    /// Whether any reference aliasing `name` (directly or through other
    /// references) is live.
    pub fn has_live_aliases(&self, name: &str) -> Result<bool, CompileError> {
        let mut stack = self.lookup(name)?.aliases.clone();
        let mut seen = BTreeSet::new();
        while let Some(alias) = stack.pop() {
            if !seen.insert(alias.clone()) {
                continue;
            }
            let Ok(buffer) = self.lookup(&alias) else {
                continue;
            };
            if buffer.live {
                return Ok(true);
            }
            stack.extend(buffer.aliases.iter().cloned());
        }
        Ok(false)
    }

    // ── Liveness and arena accounting ───────────────────────────────────────

    /// Mark a buffer live and charge its footprint to its level.
    pub fn allocate(&mut self, name: &str, operation: &str) -> Result<(), CompileError> {
        if self.lookup(name)?.live {
            return Err(CompileError::DoubleAllocation {
                buffer: name.to_string(),
                operation: operation.to_string(),
            });
        }
        // A release still deferred behind a live alias belongs to the old
        // storage; settle it now so the last alias does not free the new one.
        if self.pending_release.remove(name) {
            self.release_buffer(name)?;
        }
        let buffer = self.lookup_mut(name)?;
        buffer.live = true;
        let (level, bytes) = (buffer.level_key().to_string(), buffer.footprint());
        self.reserve(&level, bytes);
        Ok(())
    }

    /// Mark a buffer dead. Returns the buffers whose storage was returned to
    /// their arena by this call (and therefore need deallocation code). A
    /// buffer with a live alias is deferred until its last alias dies.
    pub fn deallocate(&mut self, name: &str, operation: &str) -> Result<Vec<String>, CompileError> {
        let buffer = self.lookup_mut(name)?;
        if !buffer.live {
            return Err(CompileError::DoubleFree {
                buffer: name.to_string(),
                operation: operation.to_string(),
            });
        }
        buffer.live = false;
        let target = buffer.target().map(str::to_string);

        let mut released = Vec::new();
        match target {
            None => {
                if self.has_live_aliases(name)? {
                    self.pending_release.insert(name.to_string());
                } else {
                    self.release_buffer(name)?;
                    released.push(name.to_string());
                }
            }
            Some(target) => {
                let mut current = target;
                while self.pending_release.contains(&current) && !self.has_live_aliases(&current)? {
                    self.pending_release.remove(&current);
                    self.release_buffer(&current)?;
                    released.push(current.clone());
                    match self.lookup(&current)?.target() {
                        Some(next) => current = next.to_string(),
                        None => break,
                    }
                }
            }
        }
        Ok(released)
    }

    fn release_buffer(&mut self, name: &str) -> Result<(), CompileError> {
        let buffer = self.lookup(name)?;
        let (level, bytes) = (buffer.level_key().to_string(), buffer.footprint());
        self.release(&level, bytes);
        Ok(())
    }

    pub fn reserve(&mut self, level: &str, bytes: u64) {
        let current = self.dynamic_size.entry(level.to_string()).or_insert(0);
        *current += bytes;
        let peak = self.max_dynamic_size.entry(level.to_string()).or_insert(0);
        *peak = (*peak).max(*current);
    }

    pub fn release(&mut self, level: &str, bytes: u64) {
        let current = self.dynamic_size.entry(level.to_string()).or_insert(0);
        *current = current.saturating_sub(bytes);
    }

    /// Outstanding allocated bytes in `level`.
    pub fn dynamic_size(&self, level: &str) -> u64 {
        self.dynamic_size.get(level).copied().unwrap_or(0)
    }

    /// High-water mark of `dynamic_size(level)`.
    pub fn max_dynamic_size(&self, level: &str) -> u64 {
        self.max_dynamic_size.get(level).copied().unwrap_or(0)
    }

    /// Levels that have seen any allocation, with (current, peak) bytes.
    pub fn arena_usage(&self) -> Vec<(String, u64, u64)> {
        self.max_dynamic_size
            .iter()
            .map(|(level, &peak)| (level.clone(), self.dynamic_size(level), peak))
            .collect()
    }

    // ── Naming ──────────────────────────────────────────────────────────────

    /// Map a logical name to a collision-free C identifier. Idempotent.
    pub fn mangle(&mut self, name: &str) -> String {
        if let Some(existing) = self.mangled.get(name) {
            return existing.clone();
        }
        let sanitized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let base = format!("{}{}", self.name_prefix, sanitized);
        let taken: BTreeSet<&String> = self.mangled.values().collect();
        let mut candidate = base.clone();
        let mut n = 0;
        while taken.contains(&candidate) || (self.is_buffer(&candidate) && candidate != name) {
            n += 1;
            candidate = format!("{}_{}", base, n);
        }
        self.mangled.insert(name.to_string(), candidate.clone());
        candidate
    }

    // ── Global definitions ──────────────────────────────────────────────────

    /// Register hoisted global code. Returns `false` when an identical
    /// definition already exists.
    pub fn hoist_definition(&mut self, name: &str, code: String) -> Result<bool, CompileError> {
        if let Some(existing) = self.definitions.iter().find(|d| d.name == name) {
            if existing.code == code {
                return Ok(false);
            }
            return Err(CompileError::DefinitionConflict {
                name: name.to_string(),
            });
        }
        self.definitions.push(GlobalDefinition {
            name: name.to_string(),
            code,
        });
        Ok(true)
    }

    pub fn definitions(&self) -> &[GlobalDefinition] {
        &self.definitions
    }

    // ── Serialization ───────────────────────────────────────────────────────

    pub fn to_json(&self) -> Result<String, CompileError> {
        serde_json::to_string_pretty(self).map_err(|e| CompileError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CompileError> {
        let mut ctx: NetworkContext =
            serde_json::from_str(json).map_err(|e| CompileError::Serialization(e.to_string()))?;
        ctx.validate()?;
        ctx.reindex();
        Ok(ctx)
    }

    /// Checks a deserialized context: type descriptors and buffer names.
    pub fn validate(&self) -> Result<(), CompileError> {
        self.types.validate()?;
        self.globals
            .entries
            .iter()
            .chain(self.locals.entries.iter())
            .try_for_each(|b| check_identifier(&b.name))
    }

    /// Rebuild name indices and alias lists after deserialization.
    pub fn reindex(&mut self) {
        self.types.reindex();
        self.globals.reindex();
        self.locals.reindex();
        let links: Vec<(String, String)> = self
            .globals
            .entries
            .iter()
            .chain(self.locals.entries.iter())
            .filter_map(|b| Some((b.name.clone(), b.target()?.to_string())))
            .collect();
        for (alias, target) in links {
            if let Ok(target) = self.lookup_mut(&target) {
                if !target.aliases.contains(&alias) {
                    target.aliases.push(alias);
                }
            }
        }
    }
}

/// Buffer names are emitted verbatim, so they must already be C identifiers.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(name: &str) -> Result<(), CompileError> {
    if is_identifier(name) {
        return Ok(());
    }
    Err(CompileError::InvalidIdentifier {
        name: name.to_string(),
    })
}

fn unknown(name: &str) -> CompileError {
    CompileError::UnknownBuffer {
        name: name.to_string(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
