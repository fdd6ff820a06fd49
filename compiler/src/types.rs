// types.rs — Type descriptors, interning registry, and validated values
//
// Types are plain descriptors interned in a `TypeRegistry` owned by the
// compilation session. Interning is structural: requesting the same pointer,
// integer, or struct layout twice yields the same `TypeId`. Numeric bounds are
// pure functions of the stored width/signedness/mantissa/exponent fields.
//
// Preconditions: none.
// Postconditions: every `TypedValue` handed out has passed validation.
// Failure modes: out-of-range values, struct field-set mismatches, and
//                conflicting struct layouts produce `CompileError`.
// Side effects: none (the registry is an explicit value).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::diag::CompileError;

// ── Type identity ───────────────────────────────────────────────────────────

/// Handle to an interned type descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Structural description of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    Void,
    Int { width: u32, signed: bool },
    Float { width: u32, mantissa: u32, exponent: u32 },
    Pointer { pointee: TypeId },
    /// Handle to the result of an in-flight asynchronous operation.
    Future { pointee: TypeId },
    Struct { name: String, fields: Vec<(String, TypeId)> },
}

/// Widths for which integer bounds are defined (values are carried as `i64`).
pub const INT_WIDTHS: std::ops::RangeInclusive<u32> = 1..=64;
/// Exponent field widths representable by an `f64` bound computation.
pub const FLOAT_EXPONENTS: std::ops::RangeInclusive<u32> = 1..=11;
pub const MAX_MANTISSA: u32 = 52;

impl TypeKind {
    /// Reject numeric descriptors whose bounds are undefined.
    pub fn validate(&self) -> Result<(), CompileError> {
        let reason = match *self {
            TypeKind::Int { width, .. } if !INT_WIDTHS.contains(&width) => {
                format!("integer width {} outside {:?}", width, INT_WIDTHS)
            }
            TypeKind::Float { width: 0, .. } => "float width 0".to_string(),
            TypeKind::Float { exponent, .. } if !FLOAT_EXPONENTS.contains(&exponent) => {
                format!("exponent width {} outside {:?}", exponent, FLOAT_EXPONENTS)
            }
            TypeKind::Float { mantissa, .. } if mantissa > MAX_MANTISSA => {
                format!("mantissa width {} exceeds {}", mantissa, MAX_MANTISSA)
            }
            _ => return Ok(()),
        };
        Err(CompileError::InvalidType {
            ty: format!("{:?}", self),
            reason,
        })
    }

    /// Inclusive `(min, max)` of an integer kind. `None` for malformed widths.
    pub fn int_bounds(&self) -> Option<(i128, i128)> {
        match *self {
            TypeKind::Int { width, signed } if INT_WIDTHS.contains(&width) => {
                if signed {
                    let half = 1i128 << (width - 1);
                    Some((-half, half - 1))
                } else {
                    Some((0, (1i128 << width) - 1))
                }
            }
            _ => None,
        }
    }

    /// Largest finite magnitude of a floating kind. `None` for malformed
    /// exponent or mantissa widths.
    pub fn float_max(&self) -> Option<f64> {
        match *self {
            TypeKind::Float {
                mantissa, exponent, ..
            } if FLOAT_EXPONENTS.contains(&exponent) && mantissa <= MAX_MANTISSA => {
                let max_exp = (1i32 << (exponent - 1)) - 1;
                let frac = 2.0 - 2f64.powi(-(mantissa as i32));
                Some(frac * 2f64.powi(max_exp))
            }
            _ => None,
        }
    }
}

// ── Values ──────────────────────────────────────────────────────────────────

/// A compile-time value, prior to or after validation against a type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Array(Vec<Value>),
    /// Symbolic reference to a buffer by name; `None` is the null pointer.
    Pointer(Option<String>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    /// Names of all non-null pointers reachable from this value.
    pub fn pointer_targets(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_pointers(&mut out);
        out
    }

    fn collect_pointers<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Value::Pointer(Some(name)) => out.push(name),
            Value::Array(items) => items.iter().for_each(|v| v.collect_pointers(out)),
            Value::Struct(fields) => fields.values().for_each(|v| v.collect_pointers(out)),
            _ => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Array(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "}}")
            }
            Value::Pointer(Some(name)) => write!(f, "{}", name),
            Value::Pointer(None) => write!(f, "NULL"),
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (name, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " .{} = {}", name, v)?;
                }
                write!(f, " }}")
            }
        }
    }
}

/// A value that has been validated against its type. Immutable once built;
/// construct through `TypeRegistry::make`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    ty: TypeId,
    value: Value,
}

impl TypedValue {
    pub fn ty(&self) -> TypeId {
        self.ty
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Session-owned store of interned type descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeRegistry {
    descs: Vec<TypeKind>,
    /// Pointer width in bits.
    pointer_width: u32,
    #[serde(skip)]
    interned: HashMap<TypeKind, TypeId>,
    #[serde(skip)]
    structs: HashMap<String, TypeId>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new(32)
    }
}

impl TypeRegistry {
    pub fn new(pointer_width: u32) -> Self {
        Self {
            descs: Vec::new(),
            pointer_width,
            interned: HashMap::new(),
            structs: HashMap::new(),
        }
    }

    /// Check every interned descriptor. Deserialized registries are not
    /// validated by construction.
    pub fn validate(&self) -> Result<(), CompileError> {
        self.descs.iter().try_for_each(TypeKind::validate)
    }

    /// Rebuild the lookup indices (needed after deserialization).
    pub fn reindex(&mut self) {
        self.interned.clear();
        self.structs.clear();
        for (i, kind) in self.descs.iter().enumerate() {
            let id = TypeId(i as u32);
            self.interned.insert(kind.clone(), id);
            if let TypeKind::Struct { name, .. } = kind {
                self.structs.insert(name.clone(), id);
            }
        }
    }

    fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(&id) = self.interned.get(&kind) {
            return id;
        }
        let id = TypeId(self.descs.len() as u32);
        self.descs.push(kind.clone());
        self.interned.insert(kind, id);
        id
    }

    pub fn void(&mut self) -> TypeId {
        self.intern(TypeKind::Void)
    }

    pub fn int(&mut self, width: u32, signed: bool) -> TypeId {
        self.intern(TypeKind::Int { width, signed })
    }

    pub fn float(&mut self, width: u32, mantissa: u32, exponent: u32) -> TypeId {
        self.intern(TypeKind::Float {
            width,
            mantissa,
            exponent,
        })
    }

    pub fn float32(&mut self) -> TypeId {
        self.float(32, 23, 8)
    }

    pub fn pointer_to(&mut self, pointee: TypeId) -> TypeId {
        self.intern(TypeKind::Pointer { pointee })
    }

    pub fn future_of(&mut self, pointee: TypeId) -> TypeId {
        self.intern(TypeKind::Future { pointee })
    }

    /// Intern a named struct. Re-declaring a name with the same layout returns
    /// the existing id; a different layout is a conflict.
    pub fn struct_type(
        &mut self,
        name: &str,
        fields: Vec<(String, TypeId)>,
    ) -> Result<TypeId, CompileError> {
        let kind = TypeKind::Struct {
            name: name.to_string(),
            fields,
        };
        if let Some(&existing) = self.structs.get(name) {
            if self.descs[existing.0 as usize] == kind {
                return Ok(existing);
            }
            return Err(CompileError::StructLayoutConflict {
                name: name.to_string(),
            });
        }
        let id = self.intern(kind);
        self.structs.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn kind(&self, id: TypeId) -> Result<&TypeKind, CompileError> {
        self.descs
            .get(id.0 as usize)
            .ok_or(CompileError::UnknownType(id.0))
    }

    pub fn is_future(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Ok(TypeKind::Future { .. }))
    }

    /// Width in bits. Struct width is the sum of its field widths.
    pub fn width(&self, id: TypeId) -> Result<u32, CompileError> {
        Ok(match self.kind(id)? {
            TypeKind::Void => 0,
            TypeKind::Int { width, .. } | TypeKind::Float { width, .. } => *width,
            TypeKind::Pointer { .. } | TypeKind::Future { .. } => self.pointer_width,
            TypeKind::Struct { name, fields } => {
                let mut total: u32 = 0;
                for (_, field) in fields {
                    total = total.checked_add(self.width(*field)?).ok_or_else(|| {
                        CompileError::InvalidType {
                            ty: name.clone(),
                            reason: "struct width overflows".to_string(),
                        }
                    })?;
                }
                total
            }
        })
    }

    pub fn size_bytes(&self, id: TypeId) -> Result<u64, CompileError> {
        Ok(u64::from(self.width(id)?).div_ceil(8))
    }

    /// C spelling of the type.
    pub fn type_name(&self, id: TypeId) -> Result<String, CompileError> {
        Ok(match self.kind(id)? {
            TypeKind::Void => "void".to_string(),
            TypeKind::Int {
                width,
                signed: true,
            } => format!("int{}_t", width),
            TypeKind::Int {
                width,
                signed: false,
            } => format!("uint{}_t", width),
            TypeKind::Float { width: 32, .. } => "float".to_string(),
            TypeKind::Float { width: 64, .. } => "double".to_string(),
            TypeKind::Float { width, .. } => format!("float{}_t", width),
            TypeKind::Pointer { pointee } | TypeKind::Future { pointee } => {
                format!("{}*", self.type_name(*pointee)?)
            }
            TypeKind::Struct { name, .. } => name.clone(),
        })
    }

    /// Strict check: the value's shape matches the type exactly and every
    /// scalar is in range.
    pub fn check_value(&self, id: TypeId, value: &Value) -> Result<bool, CompileError> {
        self.check(id, value, false)
    }

    /// Lenient check: integral values may be promoted to floating kinds and
    /// integral-valued floats to integer kinds.
    pub fn check_promotion(&self, id: TypeId, value: &Value) -> Result<bool, CompileError> {
        self.check(id, value, true)
    }

    fn check(&self, id: TypeId, value: &Value, promote: bool) -> Result<bool, CompileError> {
        if let Value::Array(items) = value {
            for item in items {
                if !self.check(id, item, promote)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        let kind = self.kind(id)?;
        kind.validate()?;
        Ok(match (kind, value) {
            (TypeKind::Int { .. }, Value::Int(i)) => in_int_bounds(kind, i128::from(*i)),
            (TypeKind::Int { .. }, Value::Float(x)) if promote => {
                x.fract() == 0.0 && x.is_finite() && in_int_bounds(kind, *x as i128)
            }
            (TypeKind::Float { .. }, Value::Float(x)) => in_float_bounds(kind, *x),
            (TypeKind::Float { .. }, Value::Int(i)) if promote => in_float_bounds(kind, *i as f64),
            (TypeKind::Pointer { .. } | TypeKind::Future { .. }, Value::Pointer(_)) => true,
            (TypeKind::Struct { fields, .. }, Value::Struct(values)) => {
                if fields.len() != values.len() {
                    return Ok(false);
                }
                for (name, field_ty) in fields {
                    match values.get(name) {
                        Some(v) if self.check(*field_ty, v, promote)? => {}
                        _ => return Ok(false),
                    }
                }
                true
            }
            _ => false,
        })
    }

    /// Validate `value` against `id` and wrap it.
    pub fn make(&self, id: TypeId, value: Value) -> Result<TypedValue, CompileError> {
        if let (TypeKind::Struct { name, fields }, Value::Struct(values)) = (self.kind(id)?, &value) {
            let mut expected: Vec<String> = fields.iter().map(|(n, _)| n.clone()).collect();
            expected.sort();
            let found: Vec<String> = values.keys().cloned().collect();
            if expected != found {
                return Err(CompileError::StructFieldMismatch {
                    ty: name.clone(),
                    expected,
                    found,
                });
            }
        }
        if !self.check_promotion(id, &value)? {
            return Err(CompileError::TypeValidation {
                ty: self.type_name(id)?,
                value: value.to_string(),
            });
        }
        Ok(TypedValue { ty: id, value })
    }

    /// True when every value representable by `b` is representable by `a`.
    pub fn can_represent(&self, a: TypeId, b: TypeId) -> Result<bool, CompileError> {
        let (ka, kb) = (self.kind(a)?, self.kind(b)?);
        ka.validate()?;
        kb.validate()?;
        Ok(match (ka, kb) {
            (TypeKind::Int { .. }, TypeKind::Int { .. }) => {
                let (amin, amax) = ka.int_bounds().unwrap_or_default();
                let (bmin, bmax) = kb.int_bounds().unwrap_or_default();
                amax >= bmax && amin <= bmin
            }
            (
                TypeKind::Float {
                    mantissa: am,
                    exponent: ae,
                    ..
                },
                TypeKind::Float {
                    mantissa: bm,
                    exponent: be,
                    ..
                },
            ) => am >= bm && ae >= be,
            (TypeKind::Float { mantissa, .. }, TypeKind::Int { width, signed }) => {
                let magnitude_bits = if *signed { width - 1 } else { *width };
                mantissa + 1 >= magnitude_bits
            }
            _ => a == b,
        })
    }

    /// Render a validated value as a C initializer, struct fields in schema order.
    pub fn literal(&self, value: &TypedValue) -> Result<String, CompileError> {
        self.literal_of(value.ty, &value.value)
    }

    fn literal_of(&self, id: TypeId, value: &Value) -> Result<String, CompileError> {
        match (self.kind(id)?, value) {
            (TypeKind::Struct { fields, .. }, Value::Struct(values)) => {
                let mut parts = Vec::with_capacity(fields.len());
                for (name, field_ty) in fields {
                    let v = values.get(name).ok_or_else(|| CompileError::TypeValidation {
                        ty: self.type_name(id).unwrap_or_default(),
                        value: value.to_string(),
                    })?;
                    parts.push(format!(".{} = {}", name, self.literal_of(*field_ty, v)?));
                }
                Ok(format!("{{ {} }}", parts.join(", ")))
            }
            _ => Ok(value.to_string()),
        }
    }
}

fn in_int_bounds(kind: &TypeKind, v: i128) -> bool {
    kind.int_bounds()
        .is_some_and(|(min, max)| v >= min && v <= max)
}

fn in_float_bounds(kind: &TypeKind, v: f64) -> bool {
    kind.float_max()
        .is_some_and(|max| v.is_finite() && v.abs() <= max)
}

// ── Tests ───────────────────────────────────────────────────────────────────
