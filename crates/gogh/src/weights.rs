use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use gogh_core::backend::Backend;
use gogh_core::tensor::Tensor;
use gogh_core::{DType, Shape};

use crate::error::{Error, Result};

// Weights — safetensors checkpoints
//
// Pretrained VGG-19 weights arrive as a safetensors file (the torchvision
// checkpoint converted once, offline). The format is a single flat file:
//
//   ┌──────────────┬──────────────────────┬───────────────────────┐
//   │ 8 bytes      │ N bytes              │ raw data bytes        │
//   │ header size  │ JSON header (UTF-8)  │ (contiguous, LE)      │
//   │ (u64 LE)     │                      │                       │
//   └──────────────┴──────────────────────┴───────────────────────┘
//
// with header entries like
//   "features.0.weight": {"dtype":"F32","shape":[64,3,3,3],
//                         "data_offsets":[0, 6912]}
//
// The format is simple enough that the writer is a string builder; the
// header parse goes through serde_json. F16/BF16 payloads (common for
// redistributed checkpoints) are widened to F32 tensors on load.

fn weights_err(msg: impl Into<String>) -> Error {
    Error::Weights(msg.into())
}

// DType ↔ safetensors dtype string

fn dtype_to_st(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "F32",
        DType::F64 => "F64",
    }
}

fn st_elem_size(s: &str) -> Result<usize> {
    match s {
        "F16" | "BF16" => Ok(2),
        "F32" => Ok(4),
        "F64" => Ok(8),
        other => Err(weights_err(format!("unsupported dtype: {other}"))),
    }
}

// Raw bytes ↔ tensors

fn tensor_to_bytes<B: Backend>(tensor: &Tensor<B>) -> Result<Vec<u8>> {
    let t = tensor.contiguous()?;
    let data = t.to_f64_vec()?;
    Ok(match t.dtype() {
        DType::F32 => data
            .iter()
            .flat_map(|&v| (v as f32).to_le_bytes())
            .collect(),
        DType::F64 => data.iter().flat_map(|&v| v.to_le_bytes()).collect(),
    })
}

fn tensor_from_bytes<B: Backend>(
    raw: &[u8],
    dims: Vec<usize>,
    dtype_str: &str,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let elem_size = st_elem_size(dtype_str)?;
    let num_elems: usize = dims.iter().product();
    if raw.len() != num_elems * elem_size {
        return Err(weights_err(format!(
            "expected {} bytes for {num_elems} elements of {dtype_str}, got {}",
            num_elems * elem_size,
            raw.len()
        )));
    }

    let (data, dtype): (Vec<f64>, DType) = match dtype_str {
        "F16" => (
            raw.chunks_exact(2)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f64())
                .collect(),
            DType::F32,
        ),
        "BF16" => (
            raw.chunks_exact(2)
                .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f64())
                .collect(),
            DType::F32,
        ),
        "F32" => (
            raw.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            DType::F32,
        ),
        "F64" => (
            raw.chunks_exact(8)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                })
                .collect(),
            DType::F64,
        ),
        other => return Err(weights_err(format!("unsupported dtype: {other}"))),
    };

    Ok(Tensor::from_f64_slice(
        &data,
        Shape::new(dims),
        dtype,
        device,
    )?)
}

// JSON header

/// Escape a string for a JSON header key.
fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

struct TensorMeta {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

fn build_header_json(metas: &[TensorMeta]) -> String {
    let mut json = String::from("{");
    for (i, meta) in metas.iter().enumerate() {
        if i > 0 {
            json.push(',');
        }
        json.push_str(&json_escape(&meta.name));
        json.push_str(":{\"dtype\":\"");
        json.push_str(dtype_to_st(meta.dtype));
        json.push_str("\",\"shape\":[");
        for (j, &d) in meta.shape.iter().enumerate() {
            if j > 0 {
                json.push(',');
            }
            json.push_str(&d.to_string());
        }
        json.push_str("],\"data_offsets\":[");
        json.push_str(&meta.start.to_string());
        json.push(',');
        json.push_str(&meta.end.to_string());
        json.push_str("]}");
    }
    json.push('}');
    json
}

struct ParsedEntry {
    name: String,
    dtype_str: String,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

fn parse_header(json_str: &str) -> Result<Vec<ParsedEntry>> {
    let value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| weights_err(format!("invalid JSON header: {e}")))?;

    let obj = value
        .as_object()
        .ok_or_else(|| weights_err("header is not a JSON object"))?;

    let mut entries = Vec::new();
    for (key, val) in obj {
        if key == "__metadata__" {
            continue;
        }

        let tensor_obj = val
            .as_object()
            .ok_or_else(|| weights_err(format!("entry '{key}' is not an object")))?;

        let dtype_str = tensor_obj
            .get("dtype")
            .and_then(|v| v.as_str())
            .ok_or_else(|| weights_err(format!("'{key}' missing dtype")))?
            .to_string();

        let shape: Vec<usize> = tensor_obj
            .get("shape")
            .and_then(|v| v.as_array())
            .ok_or_else(|| weights_err(format!("'{key}' missing shape")))?
            .iter()
            .map(|v| v.as_u64().unwrap_or(0) as usize)
            .collect();

        let offsets = tensor_obj
            .get("data_offsets")
            .and_then(|v| v.as_array())
            .ok_or_else(|| weights_err(format!("'{key}' missing data_offsets")))?;
        if offsets.len() != 2 {
            return Err(weights_err(format!(
                "'{key}' data_offsets must have exactly 2 elements"
            )));
        }

        entries.push(ParsedEntry {
            name: key.clone(),
            dtype_str,
            shape,
            start: offsets[0].as_u64().unwrap_or(0) as usize,
            end: offsets[1].as_u64().unwrap_or(0) as usize,
        });
    }
    Ok(entries)
}

// Read / write

/// Write named tensors in safetensors format.
pub fn write_safetensors<B: Backend>(
    writer: &mut impl Write,
    tensors: &[(String, Tensor<B>)],
) -> Result<()> {
    let mut all_data: Vec<u8> = Vec::new();
    let mut metas: Vec<TensorMeta> = Vec::with_capacity(tensors.len());

    for (name, tensor) in tensors {
        let bytes = tensor_to_bytes(tensor)?;
        let start = all_data.len();
        let end = start + bytes.len();
        all_data.extend_from_slice(&bytes);
        metas.push(TensorMeta {
            name: name.clone(),
            dtype: tensor.dtype(),
            shape: tensor.dims().to_vec(),
            start,
            end,
        });
    }

    let header = build_header_json(&metas);
    writer.write_all(&(header.len() as u64).to_le_bytes())?;
    writer.write_all(header.as_bytes())?;
    writer.write_all(&all_data)?;
    Ok(())
}

/// Read named tensors from safetensors format.
pub fn read_safetensors<B: Backend>(
    reader: &mut impl Read,
    device: &B::Device,
) -> Result<Vec<(String, Tensor<B>)>> {
    let mut size_buf = [0u8; 8];
    reader.read_exact(&mut size_buf)?;
    let header_size = u64::from_le_bytes(size_buf) as usize;
    if header_size > 100_000_000 {
        return Err(weights_err(format!(
            "header size {header_size} bytes is unreasonably large"
        )));
    }

    let mut header_bytes = vec![0u8; header_size];
    reader.read_exact(&mut header_bytes)?;
    let header_str = std::str::from_utf8(&header_bytes)
        .map_err(|e| weights_err(format!("invalid UTF-8 header: {e}")))?;

    let entries = parse_header(header_str)?;

    let max_offset = entries.iter().map(|e| e.end).max().unwrap_or(0);
    let mut all_data = vec![0u8; max_offset];
    if max_offset > 0 {
        reader.read_exact(&mut all_data)?;
    }

    let mut tensors = Vec::with_capacity(entries.len());
    for entry in &entries {
        if entry.start > entry.end || entry.end > all_data.len() {
            return Err(weights_err(format!(
                "'{}' has out-of-range data_offsets [{}, {}]",
                entry.name, entry.start, entry.end
            )));
        }
        let raw = &all_data[entry.start..entry.end];
        let tensor = tensor_from_bytes::<B>(raw, entry.shape.clone(), &entry.dtype_str, device)?;
        tensors.push((entry.name.clone(), tensor));
    }
    Ok(tensors)
}

/// Save named tensors to a `.safetensors` file.
pub fn save<B: Backend>(path: impl AsRef<Path>, tensors: &[(String, Tensor<B>)]) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_safetensors(&mut writer, tensors)?;
    writer.flush()?;
    Ok(())
}

/// Load named tensors from a `.safetensors` file.
pub fn load<B: Backend>(
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<Vec<(String, Tensor<B>)>> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    read_safetensors(&mut reader, device)
}

/// Load a `.safetensors` file as a name → tensor map — the state-dict
/// form [`gogh_nn::FeatureExtractor::vgg19`] consumes.
pub fn load_state_dict<B: Backend>(
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<HashMap<String, Tensor<B>>> {
    Ok(load(path, device)?.into_iter().collect())
}

/// Serialize named tensors to bytes (in-memory, for tests).
pub fn to_bytes<B: Backend>(tensors: &[(String, Tensor<B>)]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_safetensors(&mut buf, tensors)?;
    Ok(buf)
}

/// Deserialize named tensors from bytes (in-memory, for tests).
pub fn from_bytes<B: Backend>(
    data: &[u8],
    device: &B::Device,
) -> Result<Vec<(String, Tensor<B>)>> {
    let mut cursor = std::io::Cursor::new(data);
    read_safetensors(&mut cursor, device)
}
