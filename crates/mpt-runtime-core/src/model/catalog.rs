//! Weight catalog: the explicit tensor schema and its backing arena.
//!
//! The schema lists every tensor the forward pass needs, with the exact
//! geometry derived from the hyperparameters. The loader resolves names
//! against it once; afterwards tensors are addressed by [`TensorId`].
//!
//! Storage for all tensors is a single contiguous arena, sized analytically
//! before any payload byte is read.

use super::{ElementType, HyperParams};
use crate::error::{Result, RuntimeError};
use std::collections::HashMap;

/// Bytes reserved per catalog object on top of its payload.
pub const OBJECT_OVERHEAD: usize = 256;

/// Alignment of each tensor inside the arena.
const SLOT_ALIGN: usize = 32;

/// Tensors stored once per model (embedding table, final norm).
const GLOBAL_TENSORS: usize = 2;

/// Tensors stored per decoder block.
const TENSORS_PER_LAYER: usize = 6;

/// Resolved index of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

/// Required geometry and encoding of one tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    /// Name as it appears in the container.
    pub name: String,
    /// Dimensions, innermost first; `ne[1] == 1` for vectors.
    pub ne: [usize; 2],
    /// 1 or 2.
    pub n_dims: usize,
    /// Storage encoding.
    pub element_type: ElementType,
}

impl TensorSpec {
    fn vector(name: String, len: usize) -> Self {
        Self {
            name,
            ne: [len, 1],
            n_dims: 1,
            element_type: ElementType::F32,
        }
    }

    fn matrix(name: String, row_len: usize, rows: usize, element_type: ElementType) -> Self {
        Self {
            name,
            ne: [row_len, rows],
            n_dims: 2,
            element_type,
        }
    }

    /// Total element count; `InvalidFormat` if it overflows `usize`.
    pub fn elements(&self) -> Result<usize> {
        self.ne[0].checked_mul(self.ne[1]).ok_or_else(|| {
            RuntimeError::InvalidFormat(format!(
                "tensor '{}' of {} x {} elements is too large",
                self.name, self.ne[0], self.ne[1]
            ))
        })
    }

    /// Payload size in bytes.
    pub fn nbytes(&self) -> Result<usize> {
        self.element_type.bytes_for(self.elements()?).ok_or_else(|| {
            RuntimeError::InvalidFormat(format!(
                "tensor '{}' with row length {} cannot be stored as {}",
                self.name, self.ne[0], self.element_type
            ))
        })
    }

    /// Shape in backend order (outermost first).
    pub fn shape(&self) -> Vec<usize> {
        if self.n_dims == 1 {
            vec![self.ne[0]]
        } else {
            vec![self.ne[1], self.ne[0]]
        }
    }
}

/// Ids of one decoder block's tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerIds {
    /// Pre-attention norm weight.
    pub norm_1: TensorId,
    /// Pre-feed-forward norm weight.
    pub norm_2: TensorId,
    /// Fused query/key/value projection.
    pub attn_qkv: TensorId,
    /// Attention output projection.
    pub attn_out: TensorId,
    /// Feed-forward expansion.
    pub ffn_up: TensorId,
    /// Feed-forward contraction.
    pub ffn_down: TensorId,
}

/// Explicit list of required tensors for a set of hyperparameters.
#[derive(Debug, Clone)]
pub struct TensorSchema {
    specs: Vec<TensorSpec>,
    n_layer: usize,
}

impl TensorSchema {
    /// Token embedding table (also the output projection).
    pub const WTE: TensorId = TensorId(0);
    /// Final norm weight.
    pub const NORM_F: TensorId = TensorId(1);

    /// Derive the schema from hyperparameters.
    pub fn for_hparams(hparams: &HyperParams) -> Self {
        let n_embd = hparams.n_embd;
        let wtype = hparams.ftype.element_type();

        let mut specs = Vec::with_capacity(GLOBAL_TENSORS + TENSORS_PER_LAYER * hparams.n_layer);
        specs.push(TensorSpec::matrix(
            "transformer.wte.weight".into(),
            n_embd,
            hparams.n_vocab,
            ElementType::F32,
        ));
        specs.push(TensorSpec::vector("transformer.norm_f.weight".into(), n_embd));

        for i in 0..hparams.n_layer {
            let prefix = format!("transformer.blocks.{i}");
            specs.push(TensorSpec::vector(format!("{prefix}.norm_1.weight"), n_embd));
            specs.push(TensorSpec::vector(format!("{prefix}.norm_2.weight"), n_embd));
            specs.push(TensorSpec::matrix(
                format!("{prefix}.attn.Wqkv.weight"),
                n_embd,
                3 * n_embd,
                wtype,
            ));
            specs.push(TensorSpec::matrix(
                format!("{prefix}.attn.out_proj.weight"),
                n_embd,
                n_embd,
                wtype,
            ));
            specs.push(TensorSpec::matrix(
                format!("{prefix}.ffn.up_proj.weight"),
                n_embd,
                hparams.ffn_dim(),
                wtype,
            ));
            specs.push(TensorSpec::matrix(
                format!("{prefix}.ffn.down_proj.weight"),
                hparams.ffn_dim(),
                n_embd,
                wtype,
            ));
        }

        Self {
            specs,
            n_layer: hparams.n_layer,
        }
    }

    /// Ids of block `layer`.
    pub fn layer(&self, layer: usize) -> LayerIds {
        debug_assert!(layer < self.n_layer);
        let base = GLOBAL_TENSORS + layer * TENSORS_PER_LAYER;
        LayerIds {
            norm_1: TensorId(base),
            norm_2: TensorId(base + 1),
            attn_qkv: TensorId(base + 2),
            attn_out: TensorId(base + 3),
            ffn_up: TensorId(base + 4),
            ffn_down: TensorId(base + 5),
        }
    }

    /// All specs, indexed by [`TensorId`].
    pub fn specs(&self) -> &[TensorSpec] {
        &self.specs
    }

    /// Spec of one entry.
    pub fn spec(&self, id: TensorId) -> &TensorSpec {
        &self.specs[id.0]
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the schema is empty.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Number of decoder blocks.
    pub fn n_layer(&self) -> usize {
        self.n_layer
    }
}

/// Arena size: every payload plus a fixed per-object margin.
pub fn estimate_arena_size(schema: &TensorSchema) -> Result<usize> {
    let overflow = || RuntimeError::AllocationFailure("weight arena size overflows".into());
    let mut total = 0usize;
    for spec in schema.specs() {
        total = total.checked_add(spec.nbytes()?).ok_or_else(overflow)?;
    }
    // global objects + per-layer objects, as a flat margin
    let margin = schema
        .n_layer()
        .checked_mul(10)
        .and_then(|n| n.checked_add(5))
        .and_then(|n| n.checked_mul(OBJECT_OVERHEAD))
        .ok_or_else(overflow)?;
    total.checked_add(margin).ok_or_else(overflow)
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: usize,
    len: usize,
}

/// Single contiguous storage buffer for all weights.
#[derive(Debug)]
pub struct WeightArena {
    data: Vec<u8>,
}

impl WeightArena {
    /// Allocate a zeroed arena of `size` bytes.
    pub fn allocate(size: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|e| {
            RuntimeError::AllocationFailure(format!("weight arena of {size} bytes: {e}"))
        })?;
        data.resize(size, 0);
        Ok(Self { data })
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Name registry over the arena, populated once at load time.
#[derive(Debug)]
pub struct WeightCatalog {
    schema: TensorSchema,
    by_name: HashMap<String, TensorId>,
    slots: Vec<Slot>,
    written: Vec<bool>,
    arena: WeightArena,
}

impl WeightCatalog {
    /// Build the schema, allocate the arena and carve out every tensor.
    pub fn new(hparams: &HyperParams) -> Result<Self> {
        let schema = TensorSchema::for_hparams(hparams);
        let arena = WeightArena::allocate(estimate_arena_size(&schema)?)?;

        let mut slots = Vec::with_capacity(schema.len());
        let mut by_name = HashMap::with_capacity(schema.len());
        let mut offset = 0usize;
        for (index, spec) in schema.specs().iter().enumerate() {
            let len = spec.nbytes()?;
            if offset.checked_add(len).map_or(true, |end| end > arena.size()) {
                return Err(RuntimeError::AllocationFailure(format!(
                    "weight arena exhausted at tensor '{}'",
                    spec.name
                )));
            }
            slots.push(Slot { offset, len });
            by_name.insert(spec.name.clone(), TensorId(index));
            offset = (offset + len).next_multiple_of(SLOT_ALIGN);
        }

        let written = vec![false; schema.len()];
        Ok(Self {
            schema,
            by_name,
            slots,
            written,
            arena,
        })
    }

    /// Resolve a tensor name.
    pub fn lookup(&self, name: &str) -> Option<TensorId> {
        self.by_name.get(name).copied()
    }

    /// The schema backing this catalog.
    pub fn schema(&self) -> &TensorSchema {
        &self.schema
    }

    /// Spec of one entry.
    pub fn spec(&self, id: TensorId) -> &TensorSpec {
        self.schema.spec(id)
    }

    /// Payload bytes of one entry.
    pub fn bytes(&self, id: TensorId) -> &[u8] {
        let slot = self.slots[id.0];
        &self.arena.data[slot.offset..slot.offset + slot.len]
    }

    /// Mutable payload region of one entry; marks it written.
    pub fn slot_mut(&mut self, id: TensorId) -> &mut [u8] {
        let slot = self.slots[id.0];
        self.written[id.0] = true;
        &mut self.arena.data[slot.offset..slot.offset + slot.len]
    }

    /// Whether a record has filled this entry.
    pub fn is_written(&self, id: TensorId) -> bool {
        self.written[id.0]
    }

    /// Entries no record has filled.
    pub fn unwritten(&self) -> impl Iterator<Item = &TensorSpec> + '_ {
        self.schema
            .specs()
            .iter()
            .zip(&self.written)
            .filter(|(_, written)| !**written)
            .map(|(spec, _)| spec)
    }

    /// Arena capacity in bytes.
    pub fn arena_size(&self) -> usize {
        self.arena.size()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.schema.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.schema.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileType;

    fn hparams(ftype: FileType) -> HyperParams {
        HyperParams {
            n_vocab: 4,
            n_ctx: 8,
            n_embd: 64,
            n_head: 2,
            n_layer: 2,
            alibi_bias_max: 8.0,
            clip_qkv: 0.0,
            ftype,
            expand: 4,
        }
    }

    #[test]
    fn schema_lists_every_tensor() {
        let schema = TensorSchema::for_hparams(&hparams(FileType::AllF32));
        assert_eq!(schema.len(), 2 + 6 * 2);
        assert_eq!(schema.spec(TensorSchema::WTE).name, "transformer.wte.weight");
        assert_eq!(schema.spec(TensorSchema::WTE).ne, [64, 4]);
        assert_eq!(schema.spec(TensorSchema::WTE).shape(), vec![4, 64]);

        let ids = schema.layer(1);
        assert_eq!(
            schema.spec(ids.attn_qkv).name,
            "transformer.blocks.1.attn.Wqkv.weight"
        );
        assert_eq!(schema.spec(ids.attn_qkv).ne, [64, 192]);
        assert_eq!(schema.spec(ids.ffn_up).ne, [64, 256]);
        assert_eq!(schema.spec(ids.ffn_down).ne, [256, 64]);
        assert_eq!(schema.spec(ids.norm_2).n_dims, 1);
    }

    #[test]
    fn projections_follow_ftype() {
        let schema = TensorSchema::for_hparams(&hparams(FileType::MostlyQ4_0));
        let ids = schema.layer(0);
        assert_eq!(schema.spec(ids.attn_out).element_type, ElementType::Q4_0);
        assert_eq!(schema.spec(ids.norm_1).element_type, ElementType::F32);
        assert_eq!(
            schema.spec(TensorSchema::WTE).element_type,
            ElementType::F32
        );
        assert_eq!(schema.spec(ids.attn_out).nbytes().unwrap(), 64 * 64 / 32 * 18);
    }

    #[test]
    fn arena_estimate_includes_margin() {
        let schema = TensorSchema::for_hparams(&hparams(FileType::AllF32));
        let payload: usize = schema.specs().iter().map(|s| s.nbytes().unwrap()).sum();
        let estimate = estimate_arena_size(&schema).unwrap();
        assert_eq!(estimate, payload + (5 + 10 * 2) * OBJECT_OVERHEAD);
    }

    #[test]
    fn catalog_carves_disjoint_slots() {
        let mut catalog = WeightCatalog::new(&hparams(FileType::AllF32)).unwrap();
        let wte = catalog.lookup("transformer.wte.weight").unwrap();
        let norm = catalog.lookup("transformer.norm_f.weight").unwrap();
        assert!(catalog.lookup("transformer.wpe.weight").is_none());

        catalog.slot_mut(wte).fill(0xAB);
        assert!(catalog.bytes(norm).iter().all(|b| *b == 0));
        assert_eq!(catalog.bytes(wte).len(), 64 * 4 * 4);
        assert!(catalog.is_written(wte));
        assert!(!catalog.is_written(norm));
        assert_eq!(catalog.unwritten().count(), catalog.len() - 1);
    }

    #[test]
    fn oversized_tensors_are_rejected() {
        let spec = TensorSpec::matrix("w".into(), usize::MAX / 2, 4, ElementType::F32);
        assert!(matches!(spec.elements(), Err(RuntimeError::InvalidFormat(_))));

        // element count fits, byte count does not
        let spec = TensorSpec::matrix("w".into(), usize::MAX / 8, 4, ElementType::F32);
        assert!(spec.elements().is_ok());
        assert!(matches!(spec.nbytes(), Err(RuntimeError::InvalidFormat(_))));
    }

    #[test]
    fn arena_size_overflow_is_allocation_failure() {
        // the embedding alone takes all but 256 bytes of the address space
        let hp = HyperParams {
            n_vocab: usize::MAX / 256,
            ..hparams(FileType::AllF32)
        };
        let schema = TensorSchema::for_hparams(&hp);
        assert!(matches!(
            estimate_arena_size(&schema),
            Err(RuntimeError::AllocationFailure(_))
        ));
        assert!(matches!(
            WeightCatalog::new(&hp),
            Err(RuntimeError::AllocationFailure(_))
        ));
    }

    #[test]
    fn quantized_width_must_fill_blocks() {
        let hp = HyperParams {
            n_embd: 2,
            n_head: 1,
            ..hparams(FileType::MostlyQ8_0)
        };
        assert!(matches!(
            WeightCatalog::new(&hp),
            Err(RuntimeError::InvalidFormat(_))
        ));
    }
}
