use std::any::{type_name, Any, TypeId};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::error::RunError;

/// Runtime descriptor of a stored type: stable identity plus a printable
/// name for diagnostics. Destruction and copying ride on `Drop`/`Clone` of
/// the boxed value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMeta {
    id: TypeId,
    name: &'static str,
}

impl TypeMeta {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A typed cell owning zero or one value.
///
/// Either empty or holding exactly one value of one type; `reset` releases
/// the value before another type may be stored.
#[derive(Default)]
pub struct Blob {
    value: Option<Box<dyn Any + Send>>,
    meta: Option<TypeMeta>,
}

impl Blob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    pub fn meta(&self) -> Option<TypeMeta> {
        self.meta
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.meta.map(|m| m.id() == TypeId::of::<T>()).unwrap_or(false)
    }

    /// Store `value`, dropping any previous contents.
    pub fn set<T: Send + 'static>(&mut self, value: T) -> &mut T {
        self.value = Some(Box::new(value));
        self.meta = Some(TypeMeta::of::<T>());
        self.value
            .as_mut()
            .and_then(|v| v.downcast_mut::<T>())
            .expect("freshly stored value downcasts")
    }

    /// Checked read access; a type mismatch is a recoverable error.
    pub fn get<T: 'static>(&self) -> Result<&T> {
        let stored = match (&self.value, self.meta) {
            (Some(value), Some(meta)) => {
                if let Some(typed) = value.downcast_ref::<T>() {
                    return Ok(typed);
                }
                meta.name()
            }
            _ => "<empty>",
        };
        Err(RunError::TypeMismatch {
            stored,
            requested: type_name::<T>(),
        }
        .into())
    }

    /// Mutable access, replacing the contents with `T::default()` when the
    /// blob is empty or holds a different type.
    pub fn get_mut<T: Default + Send + 'static>(&mut self) -> &mut T {
        if !self.is::<T>() {
            self.set(T::default());
        }
        self.value
            .as_mut()
            .and_then(|v| v.downcast_mut::<T>())
            .expect("blob holds T after set")
    }

    /// Drop the contents, returning the blob to the empty state.
    pub fn reset(&mut self) {
        self.value = None;
        self.meta = None;
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.meta {
            Some(meta) => write!(f, "Blob<{}>", meta.name()),
            None => write!(f, "Blob<empty>"),
        }
    }
}

/// Shared handle to a blob; operators hold these instead of pointing back
/// into the workspace.
pub type SharedBlob = Arc<Mutex<Blob>>;

pub fn new_shared_blob() -> SharedBlob {
    Arc::new(Mutex::new(Blob::new()))
}
