//! Container framing shared by the loader and the quantizer.
//!
//! A container is an 8-byte preamble (magic, version), the hyperparameter
//! record, and then tensor records until end of file:
//!
//! ```text
//! magic: u32 | version: u32
//! n_vocab n_ctx n_layer n_head n_embd: i32 | alibi_bias_max clip_qkv: f32 | ftype: i32
//! repeated: n_dims: i32 | name_len: i32 | type: i32 | dims[n_dims]: u32 | name | payload
//! ```
//!
//! All scalars are little-endian. `dims[0]` is the innermost (row) length.

use super::HyperParams;
use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Container magic ("ggmd").
pub const MAGIC: u32 = 0x6767_6d64;

/// The only supported container version (no embedded vocabulary).
pub const FORMAT_VERSION: u32 = 0;

/// Upper bound on tensor name length accepted from a file.
const MAX_NAME_LEN: usize = 4096;

/// Maximum dimensionality of a tensor record.
const MAX_DIMS: usize = 4;

/// Per-tensor element encoding.
///
/// Quantized encodings pack `block_size()` elements into `type_size()` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum ElementType {
    /// 32-bit float.
    F32,
    /// 16-bit float.
    F16,
    /// 4-bit, one f16 scale per 32 elements.
    Q4_0,
    /// 4-bit, f16 scale and minimum per 32 elements.
    Q4_1,
    /// 5-bit, one f16 scale per 32 elements.
    Q5_0,
    /// 5-bit, f16 scale and minimum per 32 elements.
    Q5_1,
    /// 8-bit, one f16 scale per 32 elements.
    Q8_0,
    /// 8-bit with block sums (activation encoding).
    Q8_1,
    /// 2-bit k-quant.
    Q2K,
    /// 3-bit k-quant.
    Q3K,
    /// 4-bit k-quant.
    Q4K,
    /// 5-bit k-quant.
    Q5K,
    /// 6-bit k-quant.
    Q6K,
    /// 8-bit k-quant (activation encoding).
    Q8K,
}

impl ElementType {
    /// Resolve an on-disk type id.
    pub fn from_id(id: i32) -> Result<Self> {
        let ty = match id {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            10 => Self::Q2K,
            11 => Self::Q3K,
            12 => Self::Q4K,
            13 => Self::Q5K,
            14 => Self::Q6K,
            15 => Self::Q8K,
            other => {
                return Err(RuntimeError::InvalidFormat(format!(
                    "unknown element type id {other}"
                )))
            }
        };
        Ok(ty)
    }

    /// On-disk type id.
    pub fn id(&self) -> i32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q5_0 => 6,
            Self::Q5_1 => 7,
            Self::Q8_0 => 8,
            Self::Q8_1 => 9,
            Self::Q2K => 10,
            Self::Q3K => 11,
            Self::Q4K => 12,
            Self::Q5K => 13,
            Self::Q6K => 14,
            Self::Q8K => 15,
        }
    }

    /// Number of elements packed into one block.
    pub fn block_size(&self) -> usize {
        match self {
            Self::F32 | Self::F16 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 | Self::Q8_1 => 32,
            Self::Q2K | Self::Q3K | Self::Q4K | Self::Q5K | Self::Q6K | Self::Q8K => 256,
        }
    }

    /// Bytes occupied by one block.
    pub fn type_size(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q4_0 => 18,
            Self::Q4_1 => 20,
            Self::Q5_0 => 22,
            Self::Q5_1 => 24,
            Self::Q8_0 => 34,
            Self::Q8_1 => 36,
            Self::Q2K => 84,
            Self::Q3K => 110,
            Self::Q4K => 144,
            Self::Q5K => 176,
            Self::Q6K => 210,
            Self::Q8K => 292,
        }
    }

    /// Whether elements are stored block-quantized.
    pub fn is_quantized(&self) -> bool {
        !matches!(self, Self::F32 | Self::F16)
    }

    /// Short lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Q4_0 => "q4_0",
            Self::Q4_1 => "q4_1",
            Self::Q5_0 => "q5_0",
            Self::Q5_1 => "q5_1",
            Self::Q8_0 => "q8_0",
            Self::Q8_1 => "q8_1",
            Self::Q2K => "q2_k",
            Self::Q3K => "q3_k",
            Self::Q4K => "q4_k",
            Self::Q5K => "q5_k",
            Self::Q6K => "q6_k",
            Self::Q8K => "q8_k",
        }
    }

    /// Bytes needed for `elements` values, if `elements` fills whole blocks
    /// and the byte count fits in `usize`.
    pub fn bytes_for(&self, elements: usize) -> Option<usize> {
        let block = self.block_size();
        if elements % block != 0 {
            return None;
        }
        (elements / block).checked_mul(self.type_size())
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Whole-model storage encoding recorded in the header (`ftype`).
///
/// Decides the element encoding of the large projection matrices; norms and
/// the embedding table are always `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(non_camel_case_types)]
pub enum FileType {
    /// Everything in f32.
    AllF32,
    /// Projections in f16.
    MostlyF16,
    /// Projections in q4_0.
    MostlyQ4_0,
    /// Projections in q4_1.
    MostlyQ4_1,
    /// Projections in q4_1, some f16.
    MostlyQ4_1SomeF16,
    /// Projections in q8_0.
    MostlyQ8_0,
    /// Projections in q5_0.
    MostlyQ5_0,
    /// Projections in q5_1.
    MostlyQ5_1,
    /// Projections in q2_k.
    MostlyQ2K,
    /// Projections in q3_k.
    MostlyQ3K,
    /// Projections in q4_k.
    MostlyQ4K,
    /// Projections in q5_k.
    MostlyQ5K,
    /// Projections in q6_k.
    MostlyQ6K,
}

/// Encodings the quantizer CLI accepts by name.
const NAMED_TARGETS: [(&str, FileType); 5] = [
    ("q4_0", FileType::MostlyQ4_0),
    ("q4_1", FileType::MostlyQ4_1),
    ("q5_0", FileType::MostlyQ5_0),
    ("q5_1", FileType::MostlyQ5_1),
    ("q8_0", FileType::MostlyQ8_0),
];

impl FileType {
    /// Resolve the header `ftype` field.
    pub fn from_id(id: i32) -> Result<Self> {
        let ftype = match id {
            0 => Self::AllF32,
            1 => Self::MostlyF16,
            2 => Self::MostlyQ4_0,
            3 => Self::MostlyQ4_1,
            4 => Self::MostlyQ4_1SomeF16,
            7 => Self::MostlyQ8_0,
            8 => Self::MostlyQ5_0,
            9 => Self::MostlyQ5_1,
            10 => Self::MostlyQ2K,
            11 => Self::MostlyQ3K,
            12 => Self::MostlyQ4K,
            13 => Self::MostlyQ5K,
            14 => Self::MostlyQ6K,
            other => {
                return Err(RuntimeError::InvalidFormat(format!(
                    "bad ftype value {other}"
                )))
            }
        };
        Ok(ftype)
    }

    /// Header id.
    pub fn id(&self) -> i32 {
        match self {
            Self::AllF32 => 0,
            Self::MostlyF16 => 1,
            Self::MostlyQ4_0 => 2,
            Self::MostlyQ4_1 => 3,
            Self::MostlyQ4_1SomeF16 => 4,
            Self::MostlyQ8_0 => 7,
            Self::MostlyQ5_0 => 8,
            Self::MostlyQ5_1 => 9,
            Self::MostlyQ2K => 10,
            Self::MostlyQ3K => 11,
            Self::MostlyQ4K => 12,
            Self::MostlyQ5K => 13,
            Self::MostlyQ6K => 14,
        }
    }

    /// Encoding of the large weight matrices.
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::AllF32 => ElementType::F32,
            Self::MostlyF16 => ElementType::F16,
            Self::MostlyQ4_0 => ElementType::Q4_0,
            Self::MostlyQ4_1 | Self::MostlyQ4_1SomeF16 => ElementType::Q4_1,
            Self::MostlyQ8_0 => ElementType::Q8_0,
            Self::MostlyQ5_0 => ElementType::Q5_0,
            Self::MostlyQ5_1 => ElementType::Q5_1,
            Self::MostlyQ2K => ElementType::Q2K,
            Self::MostlyQ3K => ElementType::Q3K,
            Self::MostlyQ4K => ElementType::Q4K,
            Self::MostlyQ5K => ElementType::Q5K,
            Self::MostlyQ6K => ElementType::Q6K,
        }
    }

    /// Parse a quantizer target given as a name (`q4_0`) or a numeric id.
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with('q') {
            return NAMED_TARGETS
                .iter()
                .find(|(name, _)| *name == s)
                .map(|(_, ftype)| *ftype)
                .ok_or_else(|| RuntimeError::UnsupportedEncoding(format!("unknown ftype '{s}'")));
        }
        let id: i32 = s
            .parse()
            .map_err(|_| RuntimeError::UnsupportedEncoding(format!("unknown ftype '{s}'")))?;
        Self::from_id(id).map_err(|_| RuntimeError::UnsupportedEncoding(format!("unknown ftype '{s}'")))
    }

    /// Targets accepted by name, with their ids, for usage messages.
    pub fn named_targets() -> impl Iterator<Item = (&'static str, FileType)> {
        NAMED_TARGETS.iter().copied()
    }
}

/// Container preamble plus hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Hyperparameters as stored in the file.
    pub hparams: HyperParams,
}

impl Header {
    /// Read and validate the preamble and hyperparameter record.
    ///
    /// Fails with `InvalidFormat` on a bad magic, an unsupported version, an
    /// unknown `ftype`, or non-positive dimensions.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = read_u32(reader).map_err(|e| RuntimeError::from_read(e, "magic"))?;
        if magic != MAGIC {
            return Err(RuntimeError::InvalidFormat(format!(
                "bad magic {magic:#010x}, expected {MAGIC:#010x}"
            )));
        }
        let version = read_u32(reader).map_err(|e| RuntimeError::from_read(e, "version"))?;
        if version != FORMAT_VERSION {
            return Err(RuntimeError::InvalidFormat(format!(
                "unsupported format version {version}, expected {FORMAT_VERSION}"
            )));
        }

        let mut fields = [0i32; 5];
        for field in fields.iter_mut() {
            *field = read_i32(reader).map_err(|e| RuntimeError::from_read(e, "hyperparameters"))?;
        }
        let alibi_bias_max =
            read_f32(reader).map_err(|e| RuntimeError::from_read(e, "hyperparameters"))?;
        let clip_qkv = read_f32(reader).map_err(|e| RuntimeError::from_read(e, "hyperparameters"))?;
        let ftype = read_i32(reader).map_err(|e| RuntimeError::from_read(e, "hyperparameters"))?;

        let [n_vocab, n_ctx, n_layer, n_head, n_embd] = fields;
        let positive = |value: i32, name: &str| -> Result<usize> {
            usize::try_from(value)
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| RuntimeError::InvalidFormat(format!("{name} must be positive, got {value}")))
        };

        let hparams = HyperParams {
            n_vocab: positive(n_vocab, "n_vocab")?,
            n_ctx: positive(n_ctx, "n_ctx")?,
            n_layer: positive(n_layer, "n_layer")?,
            n_head: positive(n_head, "n_head")?,
            n_embd: positive(n_embd, "n_embd")?,
            alibi_bias_max,
            clip_qkv,
            ftype: FileType::from_id(ftype)?,
            ..HyperParams::default()
        };
        Ok(Self { hparams })
    }

    /// Write the preamble and hyperparameter record.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let hp = &self.hparams;
        writer.write_all(&MAGIC.to_le_bytes())?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        for value in [hp.n_vocab, hp.n_ctx, hp.n_layer, hp.n_head, hp.n_embd] {
            writer.write_all(&to_i32(value, "hyperparameter")?.to_le_bytes())?;
        }
        writer.write_all(&hp.alibi_bias_max.to_le_bytes())?;
        writer.write_all(&hp.clip_qkv.to_le_bytes())?;
        writer.write_all(&hp.ftype.id().to_le_bytes())?;
        Ok(())
    }
}

/// Metadata preceding one tensor payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Tensor name.
    pub name: String,
    /// Dimensions, innermost first.
    pub dims: Vec<usize>,
    /// Encoding of the payload.
    pub element_type: ElementType,
}

impl RecordHeader {
    /// Read the next record header.
    ///
    /// Returns `Ok(None)` at a clean end of file; a file that ends inside a
    /// record is `InvalidFormat`.
    pub fn read<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut first = [0u8; 4];
        if !read_exact_or_eof(reader, &mut first)? {
            return Ok(None);
        }
        let n_dims = i32::from_le_bytes(first);
        let name_len = read_i32(reader).map_err(|e| RuntimeError::from_read(e, "record header"))?;
        let type_id = read_i32(reader).map_err(|e| RuntimeError::from_read(e, "record header"))?;

        let n_dims = usize::try_from(n_dims)
            .ok()
            .filter(|n| (1..=MAX_DIMS).contains(n))
            .ok_or_else(|| RuntimeError::InvalidFormat(format!("bad tensor rank {n_dims}")))?;
        let name_len = usize::try_from(name_len)
            .ok()
            .filter(|n| (1..=MAX_NAME_LEN).contains(n))
            .ok_or_else(|| RuntimeError::InvalidFormat(format!("bad tensor name length {name_len}")))?;
        let element_type = ElementType::from_id(type_id)?;

        let mut dims = Vec::with_capacity(n_dims);
        for _ in 0..n_dims {
            let dim = read_u32(reader).map_err(|e| RuntimeError::from_read(e, "tensor dims"))?;
            if dim == 0 {
                return Err(RuntimeError::InvalidFormat("tensor has a zero dimension".into()));
            }
            dims.push(dim as usize);
        }

        let mut name = vec![0u8; name_len];
        reader
            .read_exact(&mut name)
            .map_err(|e| RuntimeError::from_read(e, "tensor name"))?;
        let name = String::from_utf8(name)
            .map_err(|_| RuntimeError::InvalidFormat("tensor name is not valid utf-8".into()))?;

        Ok(Some(Self {
            name,
            dims,
            element_type,
        }))
    }

    /// Write this record header (the payload follows separately).
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&to_i32(self.dims.len(), "rank")?.to_le_bytes())?;
        writer.write_all(&to_i32(self.name.len(), "name length")?.to_le_bytes())?;
        writer.write_all(&self.element_type.id().to_le_bytes())?;
        for &dim in &self.dims {
            let dim = u32::try_from(dim)
                .map_err(|_| RuntimeError::InvalidFormat(format!("dimension {dim} overflows u32")))?;
            writer.write_all(&dim.to_le_bytes())?;
        }
        writer.write_all(self.name.as_bytes())?;
        Ok(())
    }

    /// Number of dimensions.
    pub fn n_dims(&self) -> usize {
        self.dims.len()
    }

    /// Total element count; `ShapeMismatch` if the dims overflow `usize`.
    pub fn elements(&self) -> Result<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| {
                RuntimeError::ShapeMismatch(format!(
                    "tensor '{}' dims {:?} overflow the element count",
                    self.name, self.dims
                ))
            })
    }

    /// Payload size in bytes implied by the declared encoding.
    pub fn payload_len(&self) -> Result<usize> {
        let elements = self.elements()?;
        self.element_type.bytes_for(elements).ok_or_else(|| {
            RuntimeError::SizeMismatch(format!(
                "tensor '{}' has {} elements, not a whole number of {} blocks of {}",
                self.name,
                elements,
                self.element_type,
                self.element_type.block_size()
            ))
        })
    }
}

/// Sequential container writer.
///
/// Used by the quantizer and by tooling that produces model files.
pub struct ContainerWriter<W: Write> {
    writer: W,
    records: usize,
}

impl<W: Write> ContainerWriter<W> {
    /// Write the header and return a writer positioned at the first record.
    pub fn new(mut writer: W, hparams: &HyperParams) -> Result<Self> {
        Header {
            hparams: hparams.clone(),
        }
        .write(&mut writer)?;
        Ok(Self { writer, records: 0 })
    }

    /// Append a record with an already encoded payload.
    pub fn write_record(&mut self, header: &RecordHeader, payload: &[u8]) -> Result<()> {
        let expected = header.payload_len()?;
        if payload.len() != expected {
            return Err(RuntimeError::SizeMismatch(format!(
                "tensor '{}': payload is {} bytes, expected {}",
                header.name,
                payload.len(),
                expected
            )));
        }
        header.write(&mut self.writer)?;
        self.writer.write_all(payload)?;
        self.records += 1;
        Ok(())
    }

    /// Append an `f32` record.
    pub fn write_f32(&mut self, name: &str, dims: &[usize], data: &[f32]) -> Result<()> {
        let header = RecordHeader {
            name: name.to_string(),
            dims: dims.to_vec(),
            element_type: ElementType::F32,
        };
        self.write_record(&header, bytemuck::cast_slice(data))
    }

    /// Append an `f16` record.
    pub fn write_f16(&mut self, name: &str, dims: &[usize], data: &[f32]) -> Result<()> {
        let header = RecordHeader {
            name: name.to_string(),
            dims: dims.to_vec(),
            element_type: ElementType::F16,
        };
        let halves: Vec<u8> = data
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect();
        self.write_record(&header, &halves)
    }

    /// Number of records written so far.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Flush and return the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| RuntimeError::InvalidFormat(format!("{what} {value} overflows i32")))
}

fn read_u32<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(reader: &mut R) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> std::io::Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

/// Fill `buf` completely, or report a clean EOF if nothing was read.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(RuntimeError::InvalidFormat(
                    "truncated file while reading record header".into(),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
