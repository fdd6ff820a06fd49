// buffer.rs — Buffer records stored in the compilation context
//
// A buffer is a named, symbolically addressed storage cell. Its kind decides
// how the memory passes treat it: variables and transients are allocated and
// freed, constants are hoisted once, structs are initialised on the stack, and
// references are views into another buffer with no footprint of their own.

use serde::{Deserialize, Serialize};

use crate::types::{TypeId, TypedValue};

/// Name-partition a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Local,
    Global,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Local => write!(f, "local"),
            Scope::Global => write!(f, "global"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BufferKind {
    /// General tensor storage.
    Variable,
    /// Compile-time initialised, read-only.
    Constant { value: TypedValue },
    /// Scratch storage reclaimed right after its consuming operation.
    Transient,
    /// Holds a struct-typed value; never allocated or freed.
    Struct { value: TypedValue },
    /// Alias into `target` at a byte offset.
    Reference { target: String, offset: u64 },
}

impl BufferKind {
    pub fn label(&self) -> &'static str {
        match self {
            BufferKind::Variable => "variable",
            BufferKind::Constant { .. } => "constant",
            BufferKind::Transient => "transient",
            BufferKind::Struct { .. } => "struct",
            BufferKind::Reference { .. } => "reference",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buffer {
    pub name: String,
    /// Element type for tensors, the value type for constants and structs.
    pub ty: TypeId,
    /// Byte size.
    #[serde(default)]
    pub size: u64,
    /// Memory level tag (e.g. `L1`); untagged buffers count against `DEFAULT_LEVEL`.
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub live: bool,
    /// Dynamically placed buffer, subject to allocation passes.
    #[serde(default = "deployed")]
    pub deploy: bool,
    /// Consuming operations in schedule order.
    #[serde(default)]
    pub users: Vec<String>,
    /// Reference buffers aliasing this buffer.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// State buffer tracking a future's transfer.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default = "variable_kind")]
    pub kind: BufferKind,
}

fn deployed() -> bool {
    true
}

fn variable_kind() -> BufferKind {
    BufferKind::Variable
}

/// Arena key for buffers without a level tag.
pub const DEFAULT_LEVEL: &str = "default";

impl Buffer {
    fn with_kind(name: impl Into<String>, ty: TypeId, size: u64, kind: BufferKind) -> Self {
        Self {
            name: name.into(),
            ty,
            size,
            level: None,
            live: false,
            deploy: true,
            users: Vec::new(),
            aliases: Vec::new(),
            state: None,
            kind,
        }
    }

    pub fn variable(name: impl Into<String>, ty: TypeId, size: u64) -> Self {
        Self::with_kind(name, ty, size, BufferKind::Variable)
    }

    pub fn transient(name: impl Into<String>, ty: TypeId, size: u64) -> Self {
        Self::with_kind(name, ty, size, BufferKind::Transient)
    }

    /// Constants are statically placed; their `ty` is the element type.
    pub fn constant(name: impl Into<String>, value: TypedValue, size: u64) -> Self {
        let mut buf = Self::with_kind(name, value.ty(), size, BufferKind::Constant { value });
        buf.deploy = false;
        buf
    }

    pub fn structure(name: impl Into<String>, value: TypedValue, size: u64) -> Self {
        Self::with_kind(name, value.ty(), size, BufferKind::Struct { value })
    }

    pub fn reference(
        name: impl Into<String>,
        ty: TypeId,
        target: impl Into<String>,
        offset: u64,
    ) -> Self {
        Self::with_kind(
            name,
            ty,
            0,
            BufferKind::Reference {
                target: target.into(),
                offset,
            },
        )
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    pub fn with_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.users = users.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn statically_placed(mut self) -> Self {
        self.deploy = false;
        self
    }

    pub fn level_key(&self) -> &str {
        self.level.as_deref().unwrap_or(DEFAULT_LEVEL)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, BufferKind::Transient)
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.kind, BufferKind::Struct { .. })
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, BufferKind::Reference { .. })
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.kind, BufferKind::Variable)
    }

    /// Aliased buffer name for references.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            BufferKind::Reference { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Bytes this buffer occupies in its arena. References are views.
    pub fn footprint(&self) -> u64 {
        match self.kind {
            BufferKind::Reference { .. } | BufferKind::Struct { .. } => 0,
            _ => self.size,
        }
    }

    pub fn is_last_user(&self, operation: &str) -> bool {
        self.users.last().is_some_and(|u| u == operation)
    }

    pub fn is_user(&self, operation: &str) -> bool {
        self.users.iter().any(|u| u == operation)
    }
}
