//! Blob serialization surface: a per-type serializer registry and the
//! chunked little-endian tensor record format streamed through the
//! key-value boundary.

use std::any::TypeId;
use std::sync::{Arc, Once};

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;

use crate::blob::Blob;
use crate::error::RunError;
use crate::registry::Registry;
use crate::tensor::{DType, Tensor};
use crate::types::{DeviceKind, DeviceOption};

/// Separates the blob name from the chunk ordinal in record keys.
pub const CHUNK_ID_SEPARATOR: &str = "#%";

/// Tensors beyond this many elements are split into row-aligned chunks.
pub const DEFAULT_CHUNK_ELEMS: usize = 1 << 20;

const TENSOR_TAG: &str = "tensor";

/// Streams a blob's payload as one or more `(key, bytes)` records.
pub trait BlobSerializer: Send + Sync {
    fn serialize(
        &self,
        blob: &Blob,
        name: &str,
        acceptor: &mut dyn FnMut(String, Vec<u8>),
    ) -> Result<()>;
}

/// What a single deserialized record contributed, so the loader can verify
/// that chunks sum to the declared total.
pub struct DeserializeInfo {
    pub is_tensor: bool,
    pub total_elems: usize,
    pub chunk_elems: usize,
}

pub trait BlobDeserializer: Send + Sync {
    fn deserialize(
        &self,
        payload: &[u8],
        blob: &mut Blob,
        device_override: Option<DeviceOption>,
    ) -> Result<DeserializeInfo>;
}

static SERIALIZERS: Lazy<Registry<TypeId, Arc<dyn BlobSerializer>>> =
    Lazy::new(|| Registry::new("blob serializer"));
static DESERIALIZERS: Lazy<Registry<String, Arc<dyn BlobDeserializer>>> =
    Lazy::new(|| Registry::new("blob deserializer"));
static BUILTIN_SERIALIZERS: Once = Once::new();

pub fn register_serializer(type_id: TypeId, serializer: Arc<dyn BlobSerializer>) {
    SERIALIZERS.register(type_id, serializer);
}

pub fn register_deserializer(tag: impl Into<String>, deserializer: Arc<dyn BlobDeserializer>) {
    DESERIALIZERS.register(tag.into(), deserializer);
}

fn ensure_builtin_serializers() {
    BUILTIN_SERIALIZERS.call_once(|| {
        register_serializer(TypeId::of::<Tensor>(), Arc::new(TensorSerializer));
        register_deserializer(TENSOR_TAG, Arc::new(TensorDeserializer));
    });
}

/// Serialize a blob through its registered serializer.
pub fn serialize_blob(
    blob: &Blob,
    name: &str,
    acceptor: &mut dyn FnMut(String, Vec<u8>),
) -> Result<()> {
    ensure_builtin_serializers();
    let meta = blob
        .meta()
        .ok_or_else(|| anyhow!(RunError::NotFound(format!("blob {} is empty", name))))?;
    let serializer = SERIALIZERS.get(&meta.id()).ok_or_else(|| {
        anyhow!(RunError::NotFound(format!(
            "no serializer for type {}",
            meta.name()
        )))
    })?;
    serializer.serialize(blob, name, acceptor)
}

/// Deserialize one record into `blob`, dispatching on the record's tag.
pub fn deserialize_blob(
    record: &[u8],
    blob: &mut Blob,
    device_override: Option<DeviceOption>,
) -> Result<DeserializeInfo> {
    ensure_builtin_serializers();
    let mut cursor = 0usize;
    let tag_len = read_u32(record, &mut cursor)? as usize;
    let tag_bytes = read_bytes(record, &mut cursor, tag_len)?;
    let tag = std::str::from_utf8(tag_bytes)
        .map_err(|_| anyhow!("record tag is not valid utf-8"))?;
    let deserializer = DESERIALIZERS.get(&tag.to_string()).ok_or_else(|| {
        anyhow!(RunError::NotFound(format!("no deserializer for tag {}", tag)))
    })?;
    deserializer.deserialize(&record[cursor..], blob, device_override)
}

/// Strip the chunk suffix from a record key.
pub fn base_key(db_key: &str) -> &str {
    match db_key.find(CHUNK_ID_SEPARATOR) {
        Some(pos) => &db_key[..pos],
        None => db_key,
    }
}

struct TensorSerializer;

impl BlobSerializer for TensorSerializer {
    fn serialize(
        &self,
        blob: &Blob,
        name: &str,
        acceptor: &mut dyn FnMut(String, Vec<u8>),
    ) -> Result<()> {
        let tensor = blob.get::<Tensor>()?;
        let total = tensor.len();
        if tensor.ndim() == 0 || total <= DEFAULT_CHUNK_ELEMS {
            acceptor(name.to_string(), encode_tensor(tensor, None)?);
            return Ok(());
        }
        let row_elems = tensor.size_from_dim(1).max(1);
        let rows_per_chunk = (DEFAULT_CHUNK_ELEMS / row_elems).max(1);
        let mut chunk_id = 0usize;
        let mut row = 0usize;
        while row < tensor.dim(0) {
            let rows = rows_per_chunk.min(tensor.dim(0) - row);
            let begin = row * row_elems;
            let end = begin + rows * row_elems;
            let key = format!("{}{}{}", name, CHUNK_ID_SEPARATOR, chunk_id);
            acceptor(key, encode_tensor(tensor, Some((begin, end)))?);
            row += rows;
            chunk_id += 1;
        }
        Ok(())
    }
}

struct TensorDeserializer;

impl BlobDeserializer for TensorDeserializer {
    fn deserialize(
        &self,
        payload: &[u8],
        blob: &mut Blob,
        device_override: Option<DeviceOption>,
    ) -> Result<DeserializeInfo> {
        let record = decode_tensor(payload)?;
        let device = device_override.unwrap_or(record.device);
        let total: usize = record.dims.iter().product();
        match record.segment {
            None => {
                let mut tensor = Tensor::new(record.dtype, record.dims.clone(), device);
                if tensor.nbytes() != record.bytes.len() {
                    return Err(RunError::DataSizeMismatch(format!(
                        "tensor record holds {} bytes for shape {:?}",
                        record.bytes.len(),
                        record.dims
                    ))
                    .into());
                }
                tensor.raw_bytes_mut().copy_from_slice(&record.bytes);
                blob.set(tensor);
                Ok(DeserializeInfo {
                    is_tensor: true,
                    total_elems: total,
                    chunk_elems: total,
                })
            }
            Some((begin, end)) => {
                // Chunked record: make sure the full-size tensor exists,
                // then splice the element range in.
                let needs_alloc = blob
                    .get::<Tensor>()
                    .map(|t| t.shape() != record.dims.as_slice() || t.dtype() != record.dtype)
                    .unwrap_or(true);
                if needs_alloc {
                    blob.set(Tensor::new(record.dtype, record.dims.clone(), device));
                }
                let itemsize = record.dtype.itemsize();
                let expected = (end - begin) * itemsize;
                if record.bytes.len() != expected || end > total {
                    return Err(RunError::DataSizeMismatch(format!(
                        "tensor chunk [{}, {}) holds {} bytes, expected {}",
                        begin,
                        end,
                        record.bytes.len(),
                        expected
                    ))
                    .into());
                }
                // Clones share storage, so this lands in the stored tensor.
                let mut tensor = blob.get::<Tensor>()?.clone();
                tensor.raw_bytes_mut()[begin * itemsize..end * itemsize]
                    .copy_from_slice(&record.bytes);
                Ok(DeserializeInfo {
                    is_tensor: true,
                    total_elems: total,
                    chunk_elems: end - begin,
                })
            }
        }
    }
}

struct TensorRecord {
    dtype: DType,
    dims: Vec<usize>,
    device: DeviceOption,
    segment: Option<(usize, usize)>,
    bytes: Vec<u8>,
}

fn encode_tensor(tensor: &Tensor, segment: Option<(usize, usize)>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_u32(&mut out, TENSOR_TAG.len() as u32);
    out.extend_from_slice(TENSOR_TAG.as_bytes());

    write_u32(&mut out, tensor.dtype().code());
    write_u32(&mut out, tensor.ndim() as u32);
    write_u32(&mut out, segment.is_some() as u32);
    let device = tensor.device();
    write_u32(&mut out, matches!(device.kind, DeviceKind::Gpu) as u32);
    write_u32(&mut out, device.index as u32);
    for &dim in tensor.shape() {
        write_u64(&mut out, dim as u64);
    }
    let bytes = match segment {
        None => tensor.raw_bytes(),
        Some((begin, end)) => {
            write_u64(&mut out, begin as u64);
            write_u64(&mut out, end as u64);
            let itemsize = tensor.itemsize();
            &tensor.raw_bytes()[begin * itemsize..end * itemsize]
        }
    };
    write_u64(&mut out, bytes.len() as u64);
    out.extend_from_slice(bytes);
    Ok(out)
}

fn decode_tensor(payload: &[u8]) -> Result<TensorRecord> {
    let mut cursor = 0usize;
    let dtype = DType::from_code(read_u32(payload, &mut cursor)?)?;
    let ndim = read_u32(payload, &mut cursor)? as usize;
    let has_segment = read_u32(payload, &mut cursor)? != 0;
    let kind = if read_u32(payload, &mut cursor)? != 0 {
        DeviceKind::Gpu
    } else {
        DeviceKind::Cpu
    };
    let index = read_u32(payload, &mut cursor)? as i32;
    let mut dims = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        dims.push(read_u64(payload, &mut cursor)? as usize);
    }
    let segment = if has_segment {
        let begin = read_u64(payload, &mut cursor)? as usize;
        let end = read_u64(payload, &mut cursor)? as usize;
        Some((begin, end))
    } else {
        None
    };
    let nbytes = read_u64(payload, &mut cursor)? as usize;
    let bytes = read_bytes(payload, &mut cursor, nbytes)?.to_vec();
    Ok(TensorRecord {
        dtype,
        dims,
        device: DeviceOption {
            kind,
            index,
            random_seed: None,
            stream_id: None,
        },
        segment,
        bytes,
    })
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32> {
    let bytes = read_bytes(data, cursor, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
}

fn read_u64(data: &[u8], cursor: &mut usize) -> Result<u64> {
    let bytes = read_bytes(data, cursor, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
}

fn read_bytes<'a>(data: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| anyhow!("record truncated at byte {}", cursor))?;
    let slice = &data[*cursor..end];
    *cursor = end;
    Ok(slice)
}
