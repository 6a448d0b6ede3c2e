//! Block codecs for the 32-element quantized encodings.
//!
//! Layouts (all scalars little-endian, `d`/`m` are f16):
//!
//! | Encoding | Bytes | Layout |
//! |----------|-------|--------|
//! | Q4_0 | 18 | `d, qs[16]` |
//! | Q4_1 | 20 | `d, m, qs[16]` |
//! | Q5_0 | 22 | `d, qh[4], qs[16]` |
//! | Q5_1 | 24 | `d, m, qh[4], qs[16]` |
//! | Q8_0 | 34 | `d, qs[32]` (i8) |
//!
//! In the 4/5-bit layouts byte `j` of `qs` holds element `j` in its low
//! nibble and element `j + 16` in its high nibble; bit `j` of `qh` is the
//! fifth bit of element `j`.
//!
//! Every encoder also counts its codes into a 16-bucket histogram. 5-bit
//! codes are halved and 8-bit codes are folded as `q / 16 + 8`.

use crate::error::{Result, RuntimeError};
use crate::model::ElementType;
use half::f16;

/// Elements per block.
pub const BLOCK_SIZE: usize = 32;

/// Buckets of the code histogram.
pub const HISTOGRAM_BUCKETS: usize = 16;

const HALF: usize = BLOCK_SIZE / 2;

/// Encodings the quantizer can produce.
pub fn is_supported_target(encoding: ElementType) -> bool {
    matches!(
        encoding,
        ElementType::Q4_0 | ElementType::Q4_1 | ElementType::Q5_0 | ElementType::Q5_1 | ElementType::Q8_0
    )
}

/// Encode `src` into `dst` (appending) and count codes into `hist`.
///
/// Returns the number of bytes appended.
pub fn quantize_row(
    target: ElementType,
    src: &[f32],
    dst: &mut Vec<u8>,
    hist: &mut [i64; HISTOGRAM_BUCKETS],
) -> Result<usize> {
    if !is_supported_target(target) {
        return Err(RuntimeError::UnsupportedEncoding(format!(
            "cannot quantize to {target}"
        )));
    }
    if src.len() % BLOCK_SIZE != 0 {
        return Err(RuntimeError::SizeMismatch(format!(
            "row of {} elements is not a multiple of {BLOCK_SIZE}",
            src.len()
        )));
    }

    let start = dst.len();
    dst.reserve(src.len() / BLOCK_SIZE * target.type_size());
    for block in src.chunks_exact(BLOCK_SIZE) {
        match target {
            ElementType::Q4_0 => encode_q4_0(block, dst, hist),
            ElementType::Q4_1 => encode_q4_1(block, dst, hist),
            ElementType::Q5_0 => encode_q5_0(block, dst, hist),
            ElementType::Q5_1 => encode_q5_1(block, dst, hist),
            _ => encode_q8_0(block, dst, hist),
        }
    }
    Ok(dst.len() - start)
}

/// Decode a payload of `encoding` back to f32.
///
/// Accepts the dense encodings too, so callers can upconvert any input.
pub fn dequantize_row(encoding: ElementType, data: &[u8]) -> Result<Vec<f32>> {
    let type_size = encoding.type_size();
    if data.len() % type_size != 0 {
        return Err(RuntimeError::SizeMismatch(format!(
            "{encoding} data length {} is not a multiple of block size {type_size}",
            data.len()
        )));
    }

    let mut out = Vec::with_capacity(data.len() / type_size * encoding.block_size());
    match encoding {
        ElementType::F32 => out.extend(
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        ),
        ElementType::F16 => out.extend(data.chunks_exact(2).map(|c| read_f16(c, 0))),
        ElementType::Q4_0 => data.chunks_exact(type_size).for_each(|b| decode_q4_0(b, &mut out)),
        ElementType::Q4_1 => data.chunks_exact(type_size).for_each(|b| decode_q4_1(b, &mut out)),
        ElementType::Q5_0 => data.chunks_exact(type_size).for_each(|b| decode_q5_0(b, &mut out)),
        ElementType::Q5_1 => data.chunks_exact(type_size).for_each(|b| decode_q5_1(b, &mut out)),
        ElementType::Q8_0 => data.chunks_exact(type_size).for_each(|b| decode_q8_0(b, &mut out)),
        other => {
            return Err(RuntimeError::UnsupportedEncoding(format!(
                "cannot decode {other}"
            )))
        }
    }
    Ok(out)
}

fn read_f16(bytes: &[u8], at: usize) -> f32 {
    f16::from_le_bytes([bytes[at], bytes[at + 1]]).to_f32()
}

fn push_f16(dst: &mut Vec<u8>, value: f32) {
    dst.extend_from_slice(&f16::from_f32(value).to_le_bytes());
}

/// Value with the largest magnitude, sign kept.
fn signed_absmax(block: &[f32]) -> f32 {
    block
        .iter()
        .copied()
        .fold(0.0f32, |max, v| if v.abs() > max.abs() { v } else { max })
}

fn min_max(block: &[f32]) -> (f32, f32) {
    block
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

fn inverse(d: f32) -> f32 {
    if d != 0.0 {
        1.0 / d
    } else {
        0.0
    }
}

fn encode_q4_0(block: &[f32], dst: &mut Vec<u8>, hist: &mut [i64; HISTOGRAM_BUCKETS]) {
    let max = signed_absmax(block);
    let d = max / -8.0;
    let id = inverse(d);
    push_f16(dst, d);

    for j in 0..HALF {
        let lo = ((block[j] * id + 8.5) as i32).clamp(0, 15) as u8;
        let hi = ((block[j + HALF] * id + 8.5) as i32).clamp(0, 15) as u8;
        dst.push(lo | (hi << 4));
        hist[lo as usize] += 1;
        hist[hi as usize] += 1;
    }
}

fn encode_q4_1(block: &[f32], dst: &mut Vec<u8>, hist: &mut [i64; HISTOGRAM_BUCKETS]) {
    let (min, max) = min_max(block);
    let d = (max - min) / 15.0;
    let id = inverse(d);
    push_f16(dst, d);
    push_f16(dst, min);

    for j in 0..HALF {
        let lo = (((block[j] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
        let hi = (((block[j + HALF] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
        dst.push(lo | (hi << 4));
        hist[lo as usize] += 1;
        hist[hi as usize] += 1;
    }
}

/// Pack 32 five-bit codes as `qh[4], qs[16]`.
fn pack_5bit(codes: &[u8; BLOCK_SIZE], dst: &mut Vec<u8>, hist: &mut [i64; HISTOGRAM_BUCKETS]) {
    let mut qh = 0u32;
    for (j, &code) in codes.iter().enumerate() {
        qh |= u32::from((code & 0x10) >> 4) << j;
        hist[(code >> 1) as usize] += 1;
    }
    dst.extend_from_slice(&qh.to_le_bytes());
    for j in 0..HALF {
        dst.push((codes[j] & 0x0f) | ((codes[j + HALF] & 0x0f) << 4));
    }
}

fn encode_q5_0(block: &[f32], dst: &mut Vec<u8>, hist: &mut [i64; HISTOGRAM_BUCKETS]) {
    let max = signed_absmax(block);
    let d = max / -16.0;
    let id = inverse(d);
    push_f16(dst, d);

    let mut codes = [0u8; BLOCK_SIZE];
    for (code, &v) in codes.iter_mut().zip(block) {
        *code = ((v * id + 16.5) as i32).clamp(0, 31) as u8;
    }
    pack_5bit(&codes, dst, hist);
}

fn encode_q5_1(block: &[f32], dst: &mut Vec<u8>, hist: &mut [i64; HISTOGRAM_BUCKETS]) {
    let (min, max) = min_max(block);
    let d = (max - min) / 31.0;
    let id = inverse(d);
    push_f16(dst, d);
    push_f16(dst, min);

    let mut codes = [0u8; BLOCK_SIZE];
    for (code, &v) in codes.iter_mut().zip(block) {
        *code = (((v - min) * id + 0.5) as i32).clamp(0, 31) as u8;
    }
    pack_5bit(&codes, dst, hist);
}

fn encode_q8_0(block: &[f32], dst: &mut Vec<u8>, hist: &mut [i64; HISTOGRAM_BUCKETS]) {
    let amax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    let d = amax / 127.0;
    let id = inverse(d);
    push_f16(dst, d);

    for &v in block {
        let q = (v * id).round().clamp(-128.0, 127.0) as i8;
        dst.push(q as u8);
        hist[(i32::from(q) / 16 + 8) as usize] += 1;
    }
}

fn decode_q4_0(block: &[u8], out: &mut Vec<f32>) {
    let d = read_f16(block, 0);
    let qs = &block[2..2 + HALF];
    let base = out.len();
    out.resize(base + BLOCK_SIZE, 0.0);
    for (j, &byte) in qs.iter().enumerate() {
        out[base + j] = (i32::from(byte & 0x0f) - 8) as f32 * d;
        out[base + j + HALF] = (i32::from(byte >> 4) - 8) as f32 * d;
    }
}

fn decode_q4_1(block: &[u8], out: &mut Vec<f32>) {
    let d = read_f16(block, 0);
    let m = read_f16(block, 2);
    let qs = &block[4..4 + HALF];
    let base = out.len();
    out.resize(base + BLOCK_SIZE, 0.0);
    for (j, &byte) in qs.iter().enumerate() {
        out[base + j] = f32::from(byte & 0x0f) * d + m;
        out[base + j + HALF] = f32::from(byte >> 4) * d + m;
    }
}

/// Unpack `qh[4], qs[16]` into 32 five-bit codes.
fn unpack_5bit(packed: &[u8]) -> [u8; BLOCK_SIZE] {
    let qh = u32::from_le_bytes([packed[0], packed[1], packed[2], packed[3]]);
    let qs = &packed[4..4 + HALF];
    let mut codes = [0u8; BLOCK_SIZE];
    for (j, &byte) in qs.iter().enumerate() {
        let hi_lo = ((qh >> j) & 1) as u8;
        let hi_hi = ((qh >> (j + HALF)) & 1) as u8;
        codes[j] = (byte & 0x0f) | (hi_lo << 4);
        codes[j + HALF] = (byte >> 4) | (hi_hi << 4);
    }
    codes
}

fn decode_q5_0(block: &[u8], out: &mut Vec<f32>) {
    let d = read_f16(block, 0);
    let codes = unpack_5bit(&block[2..]);
    out.extend(codes.iter().map(|&q| (i32::from(q) - 16) as f32 * d));
}

fn decode_q5_1(block: &[u8], out: &mut Vec<f32>) {
    let d = read_f16(block, 0);
    let m = read_f16(block, 2);
    let codes = unpack_5bit(&block[4..]);
    out.extend(codes.iter().map(|&q| f32::from(q) * d + m));
}

fn decode_q8_0(block: &[u8], out: &mut Vec<f32>) {
    let d = read_f16(block, 0);
    out.extend(block[2..2 + BLOCK_SIZE].iter().map(|&q| f32::from(q as i8) * d));
}
