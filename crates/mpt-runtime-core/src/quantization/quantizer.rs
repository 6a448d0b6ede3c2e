//! Offline container re-encoding.

use super::blocks::{dequantize_row, is_supported_target, quantize_row, HISTOGRAM_BUCKETS};
use super::patterns::{any_match, NamePattern};
use crate::error::{Result, RuntimeError};
use crate::model::{ContainerWriter, ElementType, FileType, Header, RecordHeader};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::Path;
use tracing::{debug, info};

/// Tensors of an MPT container that are quantized.
pub const MPT_INCLUDE: &str = ".*blocks.*weight";

const MB: f64 = 1024.0 * 1024.0;

/// Outcome of a quantization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizeReport {
    /// Records processed.
    pub tensors: usize,
    /// Records re-encoded.
    pub quantized: usize,
    /// Size of all tensors at f32, in bytes.
    pub size_original: usize,
    /// Size of all written payloads, in bytes.
    pub size_quantized: usize,
    /// Counts of quantized codes per bucket.
    pub histogram: [i64; HISTOGRAM_BUCKETS],
}

impl QuantizeReport {
    /// Histogram normalized to fractions of all codes.
    pub fn histogram_fractions(&self) -> [f32; HISTOGRAM_BUCKETS] {
        let total: i64 = self.histogram.iter().sum();
        let mut fractions = [0.0f32; HISTOGRAM_BUCKETS];
        if total > 0 {
            for (f, &count) in fractions.iter_mut().zip(&self.histogram) {
                *f = count as f32 / total as f32;
            }
        }
        fractions
    }
}

/// Streams a container, re-encoding selected tensors.
#[derive(Debug, Clone)]
pub struct Quantizer {
    target: FileType,
    include: Vec<NamePattern>,
    exclude: Vec<NamePattern>,
}

impl Quantizer {
    /// Quantizer with no include patterns (copies everything).
    pub fn new(target: FileType) -> Self {
        Self {
            target,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Quantizer selecting the block weight matrices of an MPT model.
    pub fn for_mpt(target: FileType) -> Self {
        Self::new(target).include(MPT_INCLUDE)
    }

    /// Add an include pattern.
    pub fn include(mut self, pattern: &str) -> Self {
        self.include.push(NamePattern::new(pattern));
        self
    }

    /// Add an exclude pattern; excludes win over includes.
    pub fn exclude(mut self, pattern: &str) -> Self {
        self.exclude.push(NamePattern::new(pattern));
        self
    }

    /// Target file type.
    pub fn target(&self) -> FileType {
        self.target
    }

    /// Whether a record would be re-encoded.
    pub fn selects(&self, record: &RecordHeader) -> bool {
        record.n_dims() == 2
            && any_match(&self.include, &record.name)
            && !any_match(&self.exclude, &record.name)
    }

    /// Re-encode `input` into `output`.
    ///
    /// The output header carries the target `ftype`. Only one tensor is held
    /// in memory at a time.
    pub fn run(&self, input: &Path, output: &Path) -> Result<QuantizeReport> {
        let qtype = self.target.element_type();
        if !is_supported_target(qtype) {
            return Err(RuntimeError::UnsupportedEncoding(format!(
                "invalid quantization type {} ({qtype})",
                self.target.id()
            )));
        }

        let mut reader = BufReader::new(File::open(input)?);
        let mut hparams = Header::read(&mut reader)?.hparams;
        info!(
            n_vocab = hparams.n_vocab,
            n_ctx = hparams.n_ctx,
            n_embd = hparams.n_embd,
            n_head = hparams.n_head,
            n_layer = hparams.n_layer,
            ftype = hparams.ftype.id(),
            "read input header"
        );
        hparams.ftype = self.target;

        let file = File::create(output)?;
        let mut writer = ContainerWriter::new(BufWriter::new(file), &hparams)?;
        let report = self.stream(&mut reader, &mut writer, qtype)?;
        writer.finish()?;

        info!("model size  = {:8.2} MB", report.size_original as f64 / MB);
        info!(
            "quant size  = {:8.2} MB | ftype = {} ({qtype})",
            report.size_quantized as f64 / MB,
            self.target.id()
        );
        info!("hist: {}", format_fractions(&report.histogram_fractions()));
        Ok(report)
    }

    fn stream<R: Read, W: std::io::Write>(
        &self,
        reader: &mut R,
        writer: &mut ContainerWriter<W>,
        qtype: ElementType,
    ) -> Result<QuantizeReport> {
        let mut report = QuantizeReport {
            tensors: 0,
            quantized: 0,
            size_original: 0,
            size_quantized: 0,
            histogram: [0; HISTOGRAM_BUCKETS],
        };
        let mut payload = Vec::new();
        let mut encoded = Vec::new();

        while let Some(record) = RecordHeader::read(reader)? {
            payload.resize(record.payload_len()?, 0);
            reader
                .read_exact(&mut payload)
                .map_err(|e| RuntimeError::from_read(e, "tensor payload"))?;
            report.tensors += 1;
            report.size_original = report
                .size_original
                .saturating_add(record.elements()?.saturating_mul(std::mem::size_of::<f32>()));

            if !self.selects(&record) {
                writer.write_record(&record, &payload)?;
                report.size_quantized += payload.len();
                debug!(name = %record.name, dims = ?record.dims, ty = %record.element_type, bytes = payload.len(), "copied");
                continue;
            }

            if !matches!(record.element_type, ElementType::F32 | ElementType::F16) {
                return Err(RuntimeError::UnsupportedEncoding(format!(
                    "tensor '{}' is {}, only f32 and f16 can be quantized",
                    record.name, record.element_type
                )));
            }

            let values = dequantize_row(record.element_type, &payload)?;
            let mut hist = [0i64; HISTOGRAM_BUCKETS];
            encoded.clear();
            for row in values.chunks(record.dims[0]) {
                quantize_row(qtype, row, &mut encoded, &mut hist)?;
            }

            let out = RecordHeader {
                element_type: qtype,
                ..record
            };
            writer.write_record(&out, &encoded)?;

            for (total, count) in report.histogram.iter_mut().zip(hist) {
                *total += count;
            }
            report.quantized += 1;
            report.size_quantized += encoded.len();

            let fractions = hist.map(|c| c as f32 / values.len() as f32);
            debug!(
                name = %out.name,
                dims = ?out.dims,
                "size = {:8.2} MB -> {:8.2} MB | hist: {}",
                payload.len() as f64 / MB,
                encoded.len() as f64 / MB,
                format_fractions(&fractions)
            );
        }
        Ok(report)
    }
}

fn format_fractions(fractions: &[f32]) -> String {
    fractions
        .iter()
        .map(|f| format!("{f:5.3}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quantize an MPT container with the default tensor selection.
pub fn quantize(input: &Path, output: &Path, target: FileType) -> Result<QuantizeReport> {
    Quantizer::for_mpt(target).run(input, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{self, TensorSchema, WeightCatalog};
    use crate::testing::{container_bytes, small_hparams, write_model, Fill};
    use std::io::Cursor;

    fn read_back(path: &Path) -> (model::HyperParams, WeightCatalog) {
        let bytes = std::fs::read(path).unwrap();
        let config = model::RuntimeConfig::default();
        crate::model::read_container(&mut Cursor::new(bytes), &config).unwrap()
    }

    #[test]
    fn quantizes_block_weights_only() {
        let dir = tempfile::tempdir().unwrap();
        let hp = small_hparams();
        let input = write_model(dir.path(), "f32.bin", &hp, Fill::Pattern);
        let output = dir.path().join("q8.bin");

        let report = quantize(&input, &output, FileType::MostlyQ8_0).unwrap();
        let schema = TensorSchema::for_hparams(&hp);
        assert_eq!(report.tensors, schema.len());
        // four projections per block
        assert_eq!(report.quantized, 4 * hp.n_layer);
        assert!(report.size_quantized < report.size_original);
        let codes: i64 = report.histogram.iter().sum();
        let projection_elements: usize = (0..hp.n_layer)
            .flat_map(|i| {
                let ids = schema.layer(i);
                [ids.attn_qkv, ids.attn_out, ids.ffn_up, ids.ffn_down]
            })
            .map(|id| schema.spec(id).elements().unwrap())
            .sum();
        assert_eq!(codes as usize, projection_elements);

        let (out_hp, catalog) = read_back(&output);
        assert_eq!(out_hp.ftype, FileType::MostlyQ8_0);
        let ids = catalog.schema().layer(1);
        let spec = catalog.spec(ids.ffn_up);
        assert_eq!(spec.element_type, ElementType::Q8_0);
        assert_eq!(catalog.bytes(ids.ffn_up).len(), spec.elements().unwrap() / 32 * 34);
    }

    #[test]
    fn untouched_tensors_are_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let hp = small_hparams();
        let input = write_model(dir.path(), "f32.bin", &hp, Fill::Pattern);
        let output = dir.path().join("q4.bin");
        quantize(&input, &output, FileType::MostlyQ4_0).unwrap();

        let (_, original) = read_back(&input);
        let (_, quantized) = read_back(&output);
        for id in [TensorSchema::WTE, TensorSchema::NORM_F, original.schema().layer(0).norm_2] {
            assert_eq!(original.bytes(id), quantized.bytes(id), "{}", original.spec(id).name);
        }
    }

    #[test]
    fn quantized_model_still_evaluates() {
        let dir = tempfile::tempdir().unwrap();
        let hp = small_hparams();
        let input = write_model(dir.path(), "f32.bin", &hp, Fill::Pattern);
        let output = dir.path().join("q5.bin");
        quantize(&input, &output, FileType::MostlyQ5_1).unwrap();

        let mut dense = crate::session::Session::load(&input, 0).unwrap();
        let mut quant = crate::session::Session::load(&output, 0).unwrap();
        let (mut a, mut b) = (Vec::new(), Vec::new());
        dense.eval(&[1, 2, 3], &mut a).unwrap();
        quant.eval(&[1, 2, 3], &mut b).unwrap();
        assert_eq!(b.len(), hp.n_vocab);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 0.5, "{x} vs {y}");
        }
    }

    #[test]
    fn exclude_overrides_include() {
        let dir = tempfile::tempdir().unwrap();
        let hp = small_hparams();
        let input = write_model(dir.path(), "f32.bin", &hp, Fill::Pattern);
        let output = dir.path().join("partial.bin");

        let report = Quantizer::for_mpt(FileType::MostlyQ4_1)
            .exclude("*ffn*")
            .run(&input, &output)
            .unwrap();
        assert_eq!(report.quantized, 2 * hp.n_layer);
    }

    #[test]
    fn rejects_non_quantized_and_k_quant_targets() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_model(dir.path(), "f32.bin", &small_hparams(), Fill::Zeros);
        let output = dir.path().join("out.bin");
        for target in [FileType::MostlyF16, FileType::AllF32, FileType::MostlyQ4K] {
            assert!(matches!(
                quantize(&input, &output, target),
                Err(RuntimeError::UnsupportedEncoding(_))
            ));
        }
    }

    #[test]
    fn rejects_already_quantized_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_model(dir.path(), "f32.bin", &small_hparams(), Fill::Pattern);
        let q4 = dir.path().join("q4.bin");
        quantize(&input, &q4, FileType::MostlyQ4_0).unwrap();

        let err = quantize(&q4, &dir.path().join("q8.bin"), FileType::MostlyQ8_0).unwrap_err();
        assert!(matches!(err, RuntimeError::UnsupportedEncoding(_)));
    }

    #[test]
    fn bad_input_header_is_invalid_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = container_bytes(&small_hparams(), Fill::Zeros);
        bytes[4] = 7;
        let input = dir.path().join("v7.bin");
        std::fs::write(&input, bytes).unwrap();

        let err = quantize(&input, &dir.path().join("out.bin"), FileType::MostlyQ4_0).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidFormat(_)));
    }

    #[test]
    fn empty_rows_are_invalid_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = model::ContainerWriter::new(Vec::new(), &small_hparams()).unwrap();
        writer
            .write_f32("transformer.blocks.0.attn.Wqkv.weight", &[0, 4], &[])
            .unwrap();
        let input = dir.path().join("empty.bin");
        std::fs::write(&input, writer.finish().unwrap()).unwrap();

        let err = quantize(&input, &dir.path().join("out.bin"), FileType::MostlyQ4_0).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidFormat(_)));
    }

    #[test]
    fn histogram_fractions_sum_to_one() {
        let report = QuantizeReport {
            tensors: 1,
            quantized: 1,
            size_original: 128,
            size_quantized: 18,
            histogram: [2; HISTOGRAM_BUCKETS],
        };
        let sum: f32 = report.histogram_fractions().iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }
}
