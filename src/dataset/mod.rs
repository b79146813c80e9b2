//! Hierarchical ragged-dataset traversal: the tree cursor and its operator
//! kernels.

pub mod ops;
mod tree;

pub use ops::SharedMutex;
pub use tree::{
    new_cursor_handle, CursorHandle, FieldDesc, TLength, TOffset, TreeCursor, TreeIterator,
    FIELD_SEPARATOR, LENGTH_FIELD,
};
