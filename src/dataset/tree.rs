//! Hierarchical length-field schema over flat ragged arrays.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::error::RunError;

pub const FIELD_SEPARATOR: char = ':';
pub const LENGTH_FIELD: &str = "lengths";

/// Offsets and lengths use i64; stored length tensors hold i32 entries.
pub type TLength = i32;
pub type TOffset = i64;

#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub id: usize,
    /// Index into the iterator's length-field list; `None` means the root
    /// domain.
    pub length_field_id: Option<usize>,
    pub name: String,
}

/// Iterates across a list of tensors where some represent lengths in a
/// hierarchical structure. A field named `{prefix}:lengths` defines the
/// domain `{prefix}`; every other field binds to the length-field with the
/// longest strictly-matching prefix, or to the root domain.
#[derive(Debug, Clone)]
pub struct TreeIterator {
    fields: Vec<FieldDesc>,
    length_field_ids: Vec<usize>,
}

impl TreeIterator {
    pub fn new(field_names: &[String]) -> Result<Self> {
        let name_parts: Vec<Vec<&str>> = field_names
            .iter()
            .map(|name| name.split(FIELD_SEPARATOR).collect())
            .collect();

        let mut length_field_ids = Vec::new();
        for (id, parts) in name_parts.iter().enumerate() {
            if parts.last() == Some(&LENGTH_FIELD) {
                length_field_ids.push(id);
            }
        }

        let mut fields = Vec::with_capacity(field_names.len());
        for (id, name) in field_names.iter().enumerate() {
            let mut max_match_level = 1;
            let mut best = None;
            for (j, &length_id) in length_field_ids.iter().enumerate() {
                if length_id == id {
                    continue;
                }
                let prefix = &name_parts[length_id];
                let prefix_len = prefix.len() - 1;
                if name_parts[id].len() < prefix_len
                    || name_parts[id][..prefix_len] != prefix[..prefix_len]
                {
                    continue;
                }
                if prefix.len() > max_match_level {
                    max_match_level = prefix.len();
                    best = Some(j);
                }
            }
            fields.push(FieldDesc {
                id,
                length_field_id: best,
                name: name.clone(),
            });
        }

        // A length field must be declared before any field in its domain.
        for field in &fields {
            if let Some(j) = field.length_field_id {
                let length_id = length_field_ids[j];
                if length_id >= field.id {
                    return Err(anyhow!(
                        "field {} ({}) depends on a length field defined afterwards: {} ({})",
                        field.id,
                        field.name,
                        length_id,
                        field_names[length_id]
                    ));
                }
            }
        }

        Ok(Self {
            fields,
            length_field_ids,
        })
    }

    pub fn num_length_fields(&self) -> usize {
        self.length_field_ids.len()
    }

    /// Length fields plus one for the root domain.
    pub fn num_offset_fields(&self) -> usize {
        self.num_length_fields() + 1
    }

    pub fn length_field(&self, length_field_id: usize) -> &FieldDesc {
        &self.fields[self.length_field_ids[length_field_id]]
    }

    /// Index into the offsets vector for the domain a field belongs to.
    pub fn offset_field_id_for(&self, field: &FieldDesc) -> usize {
        field.length_field_id.map(|j| j + 1).unwrap_or(0)
    }

    pub fn fields(&self) -> &[FieldDesc] {
        &self.fields
    }

    /// Advance the cursor by `num` top-level entries, computing the per-
    /// domain slice sizes on the way down.
    pub fn advance(
        &self,
        lengths: &[&[TLength]],
        offsets: &mut Vec<TOffset>,
        sizes: &mut Vec<TOffset>,
        limits: &[TOffset],
        num: TOffset,
    ) -> Result<()> {
        if lengths.len() != self.num_length_fields() || offsets.len() != self.num_offset_fields() {
            return Err(anyhow!(
                "cursor state does not match schema: {} lengths, {} offsets",
                lengths.len(),
                offsets.len()
            ));
        }
        sizes.resize(offsets.len(), 0);
        let mut new_offsets = vec![0; offsets.len()];

        let limit = limits[0];
        let offset = offsets[0];
        if limit < offset {
            return Err(RunError::ShapeMismatch(
                "tried to advance past end of cursor".into(),
            )
            .into());
        }
        let total = (limit - offset).min(num);
        sizes[0] = total;
        new_offsets[0] = offset + total;

        for j in 1..self.num_offset_fields() {
            let parent_offset_id = self.offset_field_id_for(self.length_field(j - 1));
            let start = offsets[parent_offset_id] as usize;
            let count = sizes[parent_offset_id] as usize;
            let slice = lengths[j - 1].get(start..start + count).ok_or_else(|| {
                RunError::ShapeMismatch(format!(
                    "length field {} too short for [{}, {})",
                    j - 1,
                    start,
                    start + count
                ))
            })?;
            let total: TOffset = slice.iter().map(|&len| len as TOffset).sum();
            let offset = offsets[j];
            if offset + total > limits[j] {
                return Err(RunError::ShapeMismatch(format!(
                    "inconsistent field length: tried to advance past the end of field {}",
                    j
                ))
                .into());
            }
            sizes[j] = total;
            new_offsets[j] = offset + total;
        }
        *offsets = new_offsets;
        Ok(())
    }
}

/// Thread-safe position within a hierarchical ragged dataset. The mutex
/// guards the offsets; data tensors are supplied per call.
#[derive(Debug)]
pub struct TreeCursor {
    pub offsets: Vec<TOffset>,
    pub it: TreeIterator,
}

impl TreeCursor {
    pub fn new(it: TreeIterator) -> Self {
        Self {
            offsets: Vec::new(),
            it,
        }
    }
}

/// The blob payload: cursor behind its own mutex, shareable across readers.
pub type CursorHandle = Arc<Mutex<TreeCursor>>;

pub fn new_cursor_handle(it: TreeIterator) -> CursorHandle {
    Arc::new(Mutex::new(TreeCursor::new(it)))
}
