//! Codebook ("IQ") and ternary ("TQ") formats, plus the non-linear 4-bit
//! pair IQ4_NL / IQ4_XS.
//!
//! The IQ1/IQ2/IQ3 families quantize small groups of elements jointly
//! against a fixed codebook of magnitude vectors, with signs and sub-block
//! scales stored separately. The codebooks are purpose-built lattices,
//! constructed once at first use: the IQ2/IQ3 grids are product codes
//! whose index bits select a per-element magnitude level (so the
//! nearest-entry search degrades to independent per-element rounding and
//! the reconstruction error is that of the scalar level set), and the IQ1
//! ternary grid holds the 256 most frequent sign patterns of a fixed
//! Gaussian calibration draw. Scale gains place the levels at the optimum
//! for zero-mean data. Block geometry matches the trait table exactly.
//! Encoding these families is importance-weighted: the caller supplies one
//! weight per input column (see `quant::quantize_chunk`).

use crate::types::{QK, QK_K};
use bytemuck::{Pod, Zeroable};
use half::f16;
use std::sync::OnceLock;

pub const KVALUES_IQ4NL: [i8; 16] = [
    -127, -104, -83, -65, -49, -35, -22, -10, 1, 13, 25, 38, 53, 69, 89, 113,
];

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockIQ4_NL {
    pub d: f16,
    pub qs: [u8; QK / 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockIQ4_XS {
    pub d: f16,
    pub scales_h: u16,
    pub scales_l: [u8; 4],
    pub qs: [u8; QK_K / 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockIQ2_XXS {
    pub d: f16,
    /// Per 8-element group: grid index in the low byte, sign bits in the
    /// high byte.
    pub qs: [u16; QK_K / 8],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockIQ2_XS {
    pub d: f16,
    pub qs: [u16; QK_K / 8],
    /// One 4-bit scale level per 32-element sub-block.
    pub scales: [u8; QK_K / 32],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockIQ2_S {
    pub d: f16,
    /// First half: grid index per group; second half: sign bits per group.
    pub qs: [u8; QK_K / 4],
    /// Ninth index bit per group (512-entry grid).
    pub qh: [u8; QK_K / 32],
    pub scales: [u8; QK_K / 32],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockIQ3_XXS {
    pub d: f16,
    /// 64 index bytes for the 4-element groups, then 32 bytes of packed
    /// sign nibbles.
    pub qs: [u8; 3 * QK_K / 8],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockIQ3_S {
    pub d: f16,
    pub qs: [u8; QK_K / 4],
    pub qh: [u8; QK_K / 32],
    pub signs: [u8; QK_K / 8],
    pub scales: [u8; QK_K / 64],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockIQ1_S {
    pub d: f16,
    /// Ternary grid index per 8-element group.
    pub qs: [u8; QK_K / 8],
    /// 4-bit scale level per group.
    pub qh: [u8; QK_K / 16],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockIQ1_M {
    pub qs: [u8; QK_K / 8],
    pub qh: [u8; QK_K / 16],
    /// `[0..2]`: super-block scale as f16 bytes; `[2..6]`: one nibble per
    /// 32-element sub-block; `[6..8]`: reserved zero.
    pub scales: [u8; 8],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockTQ1_0 {
    /// Five trits per byte, base-3 packed.
    pub qs: [u8; 48],
    /// Four trits per byte for the last 16 elements.
    pub qh: [u8; 4],
    pub d: f16,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockTQ2_0 {
    /// Four 2-bit trits per byte.
    pub qs: [u8; QK_K / 4],
    pub d: f16,
}

/// Reconstruction gain of a 3-level quantizer for zero-mean unit-variance
/// data (the Lloyd-Max optimum); the decision threshold is half of it.
const TERNARY_GAIN: f32 = 1.224;

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn gaussian_pair(state: &mut u64) -> (f32, f32) {
    let u1 = ((splitmix64(state) >> 40) as f32 + 0.5) / (1u32 << 24) as f32;
    let u2 = ((splitmix64(state) >> 40) as f32) / (1u32 << 24) as f32;
    let r = (-2.0 * u1.ln()).sqrt();
    let th = 2.0 * std::f32::consts::PI * u2;
    (r * th.cos(), r * th.sin())
}

/// 8-element product grid: bit `j` of the entry index picks the magnitude
/// of element `j` from a two-level palette. With a second palette the
/// ninth index bit selects it, doubling the entry count.
fn build_product_grid8(palettes: &[[i8; 2]]) -> Vec<[i8; 8]> {
    let mut grid = Vec::with_capacity(256 * palettes.len());
    for palette in palettes {
        for k in 0..256usize {
            let mut e = [0i8; 8];
            for (j, v) in e.iter_mut().enumerate() {
                *v = palette[(k >> j) & 1];
            }
            grid.push(e);
        }
    }
    grid
}

/// 4-element product grid: two index bits per element select one of four
/// magnitude levels, so every level combination is representable.
fn build_product_grid4(levels: &[[i8; 4]]) -> Vec<[i8; 4]> {
    let mut grid = Vec::with_capacity(256 * levels.len());
    for level in levels {
        for k in 0..256usize {
            let mut e = [0i8; 4];
            for (j, v) in e.iter_mut().enumerate() {
                *v = level[(k >> (2 * j)) & 3];
            }
            grid.push(e);
        }
    }
    grid
}

/// Ternary grid searched against representative data: draw a fixed
/// Gaussian calibration set, quantize each 8-vector to its ternary sign
/// pattern at the 3-level threshold, and keep the 256 most frequent
/// patterns (ties broken by pattern index).
fn build_ternary_grid8() -> Vec<[i8; 8]> {
    const PATTERNS: usize = 6561; // 3^8
    let threshold = TERNARY_GAIN / 2.0;
    let mut counts = vec![0u32; PATTERNS];
    let mut state = 0x0123_4567_89AB_CDEFu64;
    for _ in 0..1 << 15 {
        let mut idx = 0usize;
        let mut pow = 1usize;
        for _ in 0..4 {
            let (a, b) = gaussian_pair(&mut state);
            for v in [a, b] {
                let trit = if v > threshold {
                    2
                } else if v < -threshold {
                    0
                } else {
                    1
                };
                idx += trit * pow;
                pow *= 3;
            }
        }
        counts[idx] += 1;
    }
    let mut order: Vec<usize> = (0..PATTERNS).collect();
    order.sort_by(|&a, &b| counts[b].cmp(&counts[a]).then(a.cmp(&b)));
    order
        .into_iter()
        .take(256)
        .map(|mut idx| {
            let mut e = [0i8; 8];
            for v in e.iter_mut() {
                *v = (idx % 3) as i8 - 1;
                idx /= 3;
            }
            e
        })
        .collect()
}

fn grid8_256() -> &'static [[i8; 8]] {
    static G: OnceLock<Vec<[i8; 8]>> = OnceLock::new();
    G.get_or_init(|| build_product_grid8(&[[1, 3]]))
}

fn grid8_512() -> &'static [[i8; 8]] {
    static G: OnceLock<Vec<[i8; 8]>> = OnceLock::new();
    // the second palette catches heavy-tailed groups
    G.get_or_init(|| build_product_grid8(&[[1, 3], [1, 5]]))
}

fn grid4_256() -> &'static [[i8; 4]] {
    static G: OnceLock<Vec<[i8; 4]>> = OnceLock::new();
    G.get_or_init(|| build_product_grid4(&[[1, 3, 5, 7]]))
}

fn grid4_512() -> &'static [[i8; 4]] {
    static G: OnceLock<Vec<[i8; 4]>> = OnceLock::new();
    G.get_or_init(|| build_product_grid4(&[[1, 3, 5, 7], [2, 4, 6, 8]]))
}

fn tgrid8_256() -> &'static [[i8; 8]] {
    static G: OnceLock<Vec<[i8; 8]>> = OnceLock::new();
    G.get_or_init(build_ternary_grid8)
}

/// Weighted nearest-codebook-entry search over magnitude targets.
fn best_entry<const G: usize>(grid: &[[i8; G]], target: &[f32; G], w: &[f32; G]) -> usize {
    let mut best = 0;
    let mut best_err = f32::INFINITY;
    for (k, e) in grid.iter().enumerate() {
        let mut err = 0.0f32;
        for j in 0..G {
            let diff = target[j] - e[j] as f32;
            err += w[j] * diff * diff;
        }
        if err < best_err {
            best_err = err;
            best = k;
        }
    }
    best
}

fn group_weights<const G: usize>(imatrix: Option<&[f32]>, base: usize) -> [f32; G] {
    let mut w = [1.0f32; G];
    if let Some(im) = imatrix {
        for j in 0..G {
            w[j] = im[(base + j) % im.len()].max(1e-8);
        }
    }
    w
}

fn amax(xs: &[f32]) -> f32 {
    let mut m = 0.0f32;
    for &v in xs {
        m = m.max(v.abs());
    }
    m
}

fn rms(xs: &[f32]) -> f32 {
    let mut ss = 0.0f32;
    for &v in xs {
        ss += v * v;
    }
    (ss / xs.len() as f32).sqrt()
}

/// Ternary quantization of `x` at gain `c`.
fn trit_at(x: f32, c: f32) -> i32 {
    if c <= 0.0 {
        return 0;
    }
    ((x / c).round() as i32).clamp(-1, 1)
}

/// Pick the reconstruction gain for a ternary block: the block maximum is
/// exact on already-ternary data, the Lloyd gain wins on dense data.
fn best_ternary_scale(xs: &[f32]) -> f32 {
    let a = amax(xs);
    if a == 0.0 {
        return 0.0;
    }
    let candidates = [a, TERNARY_GAIN * rms(xs)];
    let mut best = a;
    let mut best_err = f32::INFINITY;
    for &c in &candidates {
        // evaluate with the f16-rounded gain the decoder will see
        let cq = f16::from_f32(c).to_f32();
        let mut err = 0.0f32;
        for &v in xs {
            let q = trit_at(v, cq);
            let diff = v - cq * q as f32;
            err += diff * diff;
        }
        if err < best_err {
            best_err = err;
            best = c;
        }
    }
    best
}

// ---- IQ4_NL / IQ4_XS -------------------------------------------------------

fn best_iq4_index(v: f32) -> u8 {
    let mut best = 0u8;
    let mut best_err = f32::INFINITY;
    for (k, &kv) in KVALUES_IQ4NL.iter().enumerate() {
        let err = (v - kv as f32).abs();
        if err < best_err {
            best_err = err;
            best = k as u8;
        }
    }
    best
}

pub fn quantize_row_iq4_nl(x: &[f32], out: &mut [BlockIQ4_NL], _imatrix: Option<&[f32]>) {
    debug_assert_eq!(x.len(), out.len() * QK);
    for (b, xs) in out.iter_mut().zip(x.chunks_exact(QK)) {
        let mut maxpos = 0.0f32;
        let mut maxneg = 0.0f32;
        for &v in xs {
            maxpos = maxpos.max(v);
            maxneg = maxneg.max(-v);
        }
        let d = (maxpos / 113.0).max(maxneg / 127.0);
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        b.d = f16::from_f32(d);
        for j in 0..QK / 2 {
            let i0 = best_iq4_index(xs[j] * id);
            let i1 = best_iq4_index(xs[j + QK / 2] * id);
            b.qs[j] = i0 | (i1 << 4);
        }
    }
}

pub fn dequantize_row_iq4_nl(blocks: &[BlockIQ4_NL], y: &mut [f32]) {
    debug_assert_eq!(y.len(), blocks.len() * QK);
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK)) {
        let d = b.d.to_f32();
        for j in 0..QK / 2 {
            ys[j] = d * KVALUES_IQ4NL[(b.qs[j] & 0x0F) as usize] as f32;
            ys[j + QK / 2] = d * KVALUES_IQ4NL[(b.qs[j] >> 4) as usize] as f32;
        }
    }
}

pub fn quantize_row_iq4_xs(x: &[f32], out: &mut [u8], _imatrix: Option<&[f32]>) {
    let blocks: &mut [BlockIQ4_XS] = bytemuck::cast_slice_mut(out);
    debug_assert_eq!(x.len(), blocks.len() * QK_K);
    for (b, xs) in blocks.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut s = [0.0f32; 8];
        for (i, sub) in xs.chunks_exact(32).enumerate() {
            s[i] = amax(sub) / 113.0;
        }
        let max_s = s.iter().cloned().fold(0.0f32, f32::max);
        let d = max_s / 31.0;
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        b.d = f16::from_f32(d);
        b.scales_h = 0;
        b.scales_l = [0; 4];
        b.qs = [0; QK_K / 2];
        for i in 0..8 {
            // stored biased by 32, range [0, 63]
            let ls = (((s[i] * id).round() as i32) + 32).clamp(0, 63) as u8;
            b.scales_l[i / 2] |= (ls & 0x0F) << (4 * (i % 2));
            b.scales_h |= (((ls >> 4) & 3) as u16) << (2 * i);
            let dl = d * (ls as f32 - 32.0);
            let idl = if dl != 0.0 { 1.0 / dl } else { 0.0 };
            for j in 0..32 {
                let l = i * 32 + j;
                let q = best_iq4_index(xs[l] * idl);
                b.qs[l / 2] |= q << (4 * (l % 2));
            }
        }
    }
}

pub fn dequantize_row_iq4_xs(src: &[u8], y: &mut [f32]) {
    let blocks: &[BlockIQ4_XS] = bytemuck::cast_slice(src);
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        for i in 0..8 {
            let low = (b.scales_l[i / 2] >> (4 * (i % 2))) & 0x0F;
            let high = ((b.scales_h >> (2 * i)) & 3) as u8;
            let ls = low | (high << 4);
            let dl = d * (ls as f32 - 32.0);
            for j in 0..32 {
                let l = i * 32 + j;
                let q = (b.qs[l / 2] >> (4 * (l % 2))) & 0x0F;
                ys[l] = dl * KVALUES_IQ4NL[q as usize] as f32;
            }
        }
    }
}

// ---- IQ2 family ------------------------------------------------------------

fn encode_group8(
    grid: &[[i8; 8]],
    xs: &[f32],
    dl: f32,
    w: &[f32; 8],
) -> (usize, u8) {
    let inv = if dl > 0.0 { 4.0 / dl } else { 0.0 };
    let mut target = [0.0f32; 8];
    let mut signs = 0u8;
    for j in 0..8 {
        if xs[j] < 0.0 {
            signs |= 1 << j;
        }
        target[j] = xs[j].abs() * inv;
    }
    (best_entry(grid, &target, w), signs)
}

fn decode_group8(grid: &[[i8; 8]], idx: usize, signs: u8, dl: f32, ys: &mut [f32]) {
    for j in 0..8 {
        let sign = if signs & (1 << j) != 0 { -1.0 } else { 1.0 };
        ys[j] = 0.25 * dl * grid[idx][j] as f32 * sign;
    }
}

pub fn quantize_row_iq2_xxs(x: &[f32], out: &mut [u8], imatrix: Option<&[f32]>) {
    let blocks: &mut [BlockIQ2_XXS] = bytemuck::cast_slice_mut(out);
    debug_assert_eq!(x.len(), blocks.len() * QK_K);
    let grid = grid8_256();
    for (bi, (b, xs)) in blocks.iter_mut().zip(x.chunks_exact(QK_K)).enumerate() {
        let d = 4.0 * amax(xs) / 7.0;
        b.d = f16::from_f32(d);
        for g in 0..QK_K / 8 {
            let base = bi * QK_K + g * 8;
            let w = group_weights::<8>(imatrix, base);
            let (idx, signs) = encode_group8(grid, &xs[g * 8..g * 8 + 8], d, &w);
            b.qs[g] = idx as u16 | ((signs as u16) << 8);
        }
    }
}

pub fn dequantize_row_iq2_xxs(src: &[u8], y: &mut [f32]) {
    let blocks: &[BlockIQ2_XXS] = bytemuck::cast_slice(src);
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    let grid = grid8_256();
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        for g in 0..QK_K / 8 {
            let idx = (b.qs[g] & 0xFF) as usize;
            let signs = (b.qs[g] >> 8) as u8;
            decode_group8(grid, idx, signs, d, &mut ys[g * 8..g * 8 + 8]);
        }
    }
}

pub fn quantize_row_iq2_xs(x: &[f32], out: &mut [u8], imatrix: Option<&[f32]>) {
    let blocks: &mut [BlockIQ2_XS] = bytemuck::cast_slice_mut(out);
    debug_assert_eq!(x.len(), blocks.len() * QK_K);
    let grid = grid8_256();
    for (bi, (b, xs)) in blocks.iter_mut().zip(x.chunks_exact(QK_K)).enumerate() {
        let mut s = [0.0f32; 8];
        for (i, sub) in xs.chunks_exact(32).enumerate() {
            // places the {1,3} levels at the two-level optimum for the
            // sub-block
            s[i] = amax(sub);
        }
        let d = s.iter().cloned().fold(0.0f32, f32::max) / 16.0;
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        b.d = f16::from_f32(d);
        for i in 0..8 {
            let ls = (((s[i] * id).round() as i32) - 1).clamp(0, 15) as u8;
            b.scales[i] = ls;
            let dl = d * (ls + 1) as f32;
            for k in 0..4 {
                let g = i * 4 + k;
                let base = bi * QK_K + g * 8;
                let w = group_weights::<8>(imatrix, base);
                let (idx, signs) = encode_group8(grid, &xs[g * 8..g * 8 + 8], dl, &w);
                b.qs[g] = idx as u16 | ((signs as u16) << 8);
            }
        }
    }
}

pub fn dequantize_row_iq2_xs(src: &[u8], y: &mut [f32]) {
    let blocks: &[BlockIQ2_XS] = bytemuck::cast_slice(src);
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    let grid = grid8_256();
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        for i in 0..8 {
            let dl = d * (b.scales[i] + 1) as f32;
            for k in 0..4 {
                let g = i * 4 + k;
                let idx = (b.qs[g] & 0xFF) as usize;
                let signs = (b.qs[g] >> 8) as u8;
                decode_group8(grid, idx, signs, dl, &mut ys[g * 8..g * 8 + 8]);
            }
        }
    }
}

pub fn quantize_row_iq2_s(x: &[f32], out: &mut [u8], imatrix: Option<&[f32]>) {
    let blocks: &mut [BlockIQ2_S] = bytemuck::cast_slice_mut(out);
    debug_assert_eq!(x.len(), blocks.len() * QK_K);
    let grid = grid8_512();
    for (bi, (b, xs)) in blocks.iter_mut().zip(x.chunks_exact(QK_K)).enumerate() {
        let mut s = [0.0f32; 8];
        for (i, sub) in xs.chunks_exact(32).enumerate() {
            s[i] = amax(sub);
        }
        let d = s.iter().cloned().fold(0.0f32, f32::max) / 16.0;
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        b.d = f16::from_f32(d);
        b.qh = [0; QK_K / 32];
        for i in 0..8 {
            let ls = (((s[i] * id).round() as i32) - 1).clamp(0, 15) as u8;
            b.scales[i] = ls;
            let dl = d * (ls + 1) as f32;
            for k in 0..4 {
                let g = i * 4 + k;
                let base = bi * QK_K + g * 8;
                let w = group_weights::<8>(imatrix, base);
                let (idx, signs) = encode_group8(grid, &xs[g * 8..g * 8 + 8], dl, &w);
                b.qs[g] = (idx & 0xFF) as u8;
                b.qs[QK_K / 8 + g] = signs;
                if idx >= 256 {
                    b.qh[g / 8] |= 1 << (g % 8);
                }
            }
        }
    }
}

pub fn dequantize_row_iq2_s(src: &[u8], y: &mut [f32]) {
    let blocks: &[BlockIQ2_S] = bytemuck::cast_slice(src);
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    let grid = grid8_512();
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        for i in 0..8 {
            let dl = d * (b.scales[i] + 1) as f32;
            for k in 0..4 {
                let g = i * 4 + k;
                let mut idx = b.qs[g] as usize;
                if (b.qh[g / 8] >> (g % 8)) & 1 != 0 {
                    idx += 256;
                }
                let signs = b.qs[QK_K / 8 + g];
                decode_group8(grid, idx, signs, dl, &mut ys[g * 8..g * 8 + 8]);
            }
        }
    }
}

// ---- IQ3 family ------------------------------------------------------------

fn encode_group4(grid: &[[i8; 4]], xs: &[f32], dl: f32, w: &[f32; 4]) -> (usize, u8) {
    let inv = if dl > 0.0 { 4.0 / dl } else { 0.0 };
    let mut target = [0.0f32; 4];
    let mut signs = 0u8;
    for j in 0..4 {
        if xs[j] < 0.0 {
            signs |= 1 << j;
        }
        target[j] = xs[j].abs() * inv;
    }
    (best_entry(grid, &target, w), signs)
}

fn decode_group4(grid: &[[i8; 4]], idx: usize, signs: u8, dl: f32, ys: &mut [f32]) {
    for j in 0..4 {
        let sign = if signs & (1 << j) != 0 { -1.0 } else { 1.0 };
        ys[j] = 0.25 * dl * grid[idx][j] as f32 * sign;
    }
}

pub fn quantize_row_iq3_xxs(x: &[f32], out: &mut [u8], imatrix: Option<&[f32]>) {
    let blocks: &mut [BlockIQ3_XXS] = bytemuck::cast_slice_mut(out);
    debug_assert_eq!(x.len(), blocks.len() * QK_K);
    let grid = grid4_256();
    for (bi, (b, xs)) in blocks.iter_mut().zip(x.chunks_exact(QK_K)).enumerate() {
        let d = 4.0 * amax(xs) / 7.0;
        b.d = f16::from_f32(d);
        b.qs = [0; 3 * QK_K / 8];
        for g in 0..QK_K / 4 {
            let base = bi * QK_K + g * 4;
            let w = group_weights::<4>(imatrix, base);
            let (idx, signs) = encode_group4(grid, &xs[g * 4..g * 4 + 4], d, &w);
            b.qs[g] = idx as u8;
            b.qs[QK_K / 4 + g / 2] |= signs << (4 * (g % 2));
        }
    }
}

pub fn dequantize_row_iq3_xxs(src: &[u8], y: &mut [f32]) {
    let blocks: &[BlockIQ3_XXS] = bytemuck::cast_slice(src);
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    let grid = grid4_256();
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        for g in 0..QK_K / 4 {
            let idx = b.qs[g] as usize;
            let signs = (b.qs[QK_K / 4 + g / 2] >> (4 * (g % 2))) & 0x0F;
            decode_group4(grid, idx, signs, d, &mut ys[g * 4..g * 4 + 4]);
        }
    }
}

pub fn quantize_row_iq3_s(x: &[f32], out: &mut [u8], imatrix: Option<&[f32]>) {
    let blocks: &mut [BlockIQ3_S] = bytemuck::cast_slice_mut(out);
    debug_assert_eq!(x.len(), blocks.len() * QK_K);
    let grid = grid4_512();
    for (bi, (b, xs)) in blocks.iter_mut().zip(x.chunks_exact(QK_K)).enumerate() {
        let mut s = [0.0f32; 8];
        for (i, sub) in xs.chunks_exact(32).enumerate() {
            // compresses the four-level span toward the sub-block bulk
            s[i] = 0.6 * amax(sub);
        }
        let d = s.iter().cloned().fold(0.0f32, f32::max) / 16.0;
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        b.d = f16::from_f32(d);
        b.qh = [0; QK_K / 32];
        b.signs = [0; QK_K / 8];
        b.scales = [0; QK_K / 64];
        for i in 0..8 {
            let ls = (((s[i] * id).round() as i32) - 1).clamp(0, 15) as u8;
            b.scales[i / 2] |= ls << (4 * (i % 2));
            let dl = d * (ls + 1) as f32;
            for k in 0..8 {
                let g = i * 8 + k;
                let base = bi * QK_K + g * 4;
                let w = group_weights::<4>(imatrix, base);
                let (idx, signs) = encode_group4(grid, &xs[g * 4..g * 4 + 4], dl, &w);
                b.qs[g] = (idx & 0xFF) as u8;
                if idx >= 256 {
                    b.qh[g / 8] |= 1 << (g % 8);
                }
                b.signs[g / 2] |= signs << (4 * (g % 2));
            }
        }
    }
}

pub fn dequantize_row_iq3_s(src: &[u8], y: &mut [f32]) {
    let blocks: &[BlockIQ3_S] = bytemuck::cast_slice(src);
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    let grid = grid4_512();
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        for i in 0..8 {
            let ls = (b.scales[i / 2] >> (4 * (i % 2))) & 0x0F;
            let dl = d * (ls + 1) as f32;
            for k in 0..8 {
                let g = i * 8 + k;
                let mut idx = b.qs[g] as usize;
                if (b.qh[g / 8] >> (g % 8)) & 1 != 0 {
                    idx += 256;
                }
                let signs = (b.signs[g / 2] >> (4 * (g % 2))) & 0x0F;
                decode_group4(grid, idx, signs, dl, &mut ys[g * 4..g * 4 + 4]);
            }
        }
    }
}

// ---- IQ1 family (ternary codebook) ----------------------------------------

fn encode_ternary_group(
    grid: &[[i8; 8]],
    xs: &[f32],
    dl: f32,
    w: &[f32; 8],
) -> usize {
    let inv = if dl > 0.0 { 1.0 / dl } else { 0.0 };
    let mut target = [0.0f32; 8];
    for j in 0..8 {
        target[j] = (xs[j] * inv).clamp(-1.0, 1.0);
    }
    best_entry(grid, &target, w)
}

pub fn quantize_row_iq1_s(x: &[f32], out: &mut [u8], imatrix: Option<&[f32]>) {
    let blocks: &mut [BlockIQ1_S] = bytemuck::cast_slice_mut(out);
    debug_assert_eq!(x.len(), blocks.len() * QK_K);
    let grid = tgrid8_256();
    for (bi, (b, xs)) in blocks.iter_mut().zip(x.chunks_exact(QK_K)).enumerate() {
        let mut s = [0.0f32; QK_K / 8];
        for (g, group) in xs.chunks_exact(8).enumerate() {
            s[g] = TERNARY_GAIN * rms(group);
        }
        let d = s.iter().cloned().fold(0.0f32, f32::max);
        b.d = f16::from_f32(d);
        b.qh = [0; QK_K / 16];
        for g in 0..QK_K / 8 {
            let ls = if d > 0.0 {
                (((16.0 * s[g] / d).round() as i32) - 1).clamp(0, 15) as u8
            } else {
                0
            };
            b.qh[g / 2] |= ls << (4 * (g % 2));
            let dl = d * (ls + 1) as f32 / 16.0;
            let base = bi * QK_K + g * 8;
            let w = group_weights::<8>(imatrix, base);
            b.qs[g] = encode_ternary_group(grid, &xs[g * 8..g * 8 + 8], dl, &w) as u8;
        }
    }
}

pub fn dequantize_row_iq1_s(src: &[u8], y: &mut [f32]) {
    let blocks: &[BlockIQ1_S] = bytemuck::cast_slice(src);
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    let grid = tgrid8_256();
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        for g in 0..QK_K / 8 {
            let ls = (b.qh[g / 2] >> (4 * (g % 2))) & 0x0F;
            let dl = d * (ls + 1) as f32 / 16.0;
            let e = &grid[b.qs[g] as usize];
            for j in 0..8 {
                ys[g * 8 + j] = dl * e[j] as f32;
            }
        }
    }
}

pub fn quantize_row_iq1_m(x: &[f32], out: &mut [u8], imatrix: Option<&[f32]>) {
    let blocks: &mut [BlockIQ1_M] = bytemuck::cast_slice_mut(out);
    debug_assert_eq!(x.len(), blocks.len() * QK_K);
    let grid = tgrid8_256();
    for (bi, (b, xs)) in blocks.iter_mut().zip(x.chunks_exact(QK_K)).enumerate() {
        let mut sub = [0.0f32; 8];
        for (i, chunk) in xs.chunks_exact(32).enumerate() {
            sub[i] = TERNARY_GAIN * rms(chunk);
        }
        let d = sub.iter().cloned().fold(0.0f32, f32::max);
        b.scales = [0; 8];
        b.scales[0..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());
        b.qh = [0; QK_K / 16];
        for i in 0..8 {
            let ms = if d > 0.0 {
                (((16.0 * sub[i] / d).round() as i32) - 1).clamp(0, 15) as u8
            } else {
                0
            };
            b.scales[2 + i / 2] |= ms << (4 * (i % 2));
            let ds = d * (ms + 1) as f32 / 16.0;
            for k in 0..4 {
                let g = i * 4 + k;
                let group = &xs[g * 8..g * 8 + 8];
                let ls = if ds > 0.0 {
                    let target = TERNARY_GAIN * rms(group);
                    (((16.0 * target / ds).round() as i32) - 1).clamp(0, 15) as u8
                } else {
                    0
                };
                b.qh[g / 2] |= ls << (4 * (g % 2));
                let dl = ds * (ls + 1) as f32 / 16.0;
                let base = bi * QK_K + g * 8;
                let w = group_weights::<8>(imatrix, base);
                b.qs[g] = encode_ternary_group(grid, group, dl, &w) as u8;
            }
        }
    }
}

pub fn dequantize_row_iq1_m(src: &[u8], y: &mut [f32]) {
    let blocks: &[BlockIQ1_M] = bytemuck::cast_slice(src);
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    let grid = tgrid8_256();
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = f16::from_le_bytes([b.scales[0], b.scales[1]]).to_f32();
        for i in 0..8 {
            let ms = (b.scales[2 + i / 2] >> (4 * (i % 2))) & 0x0F;
            let ds = d * (ms + 1) as f32 / 16.0;
            for k in 0..4 {
                let g = i * 4 + k;
                let ls = (b.qh[g / 2] >> (4 * (g % 2))) & 0x0F;
                let dl = ds * (ls + 1) as f32 / 16.0;
                let e = &grid[b.qs[g] as usize];
                for j in 0..8 {
                    ys[g * 8 + j] = dl * e[j] as f32;
                }
            }
        }
    }
}

// ---- Ternary TQ formats ----------------------------------------------------

pub fn quantize_row_tq1_0(x: &[f32], out: &mut [u8]) {
    let blocks: &mut [BlockTQ1_0] = bytemuck::cast_slice_mut(out);
    debug_assert_eq!(x.len(), blocks.len() * QK_K);
    for (b, xs) in blocks.iter_mut().zip(x.chunks_exact(QK_K)) {
        b.d = f16::from_f32(best_ternary_scale(xs));
        let d = b.d.to_f32();
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        let trit = |v: f32| ((v * id).round() as i32).clamp(-1, 1) + 1;
        for (i, q) in b.qs.iter_mut().enumerate() {
            let mut acc = 0u32;
            let mut pow = 1u32;
            for j in 0..5 {
                acc += trit(xs[i * 5 + j]) as u32 * pow;
                pow *= 3;
            }
            *q = acc as u8;
        }
        for (i, q) in b.qh.iter_mut().enumerate() {
            let mut acc = 0u32;
            let mut pow = 1u32;
            for j in 0..4 {
                acc += trit(xs[240 + i * 4 + j]) as u32 * pow;
                pow *= 3;
            }
            *q = acc as u8;
        }
    }
}

pub fn dequantize_row_tq1_0(src: &[u8], y: &mut [f32]) {
    let blocks: &[BlockTQ1_0] = bytemuck::cast_slice(src);
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        for (i, &q) in b.qs.iter().enumerate() {
            let mut v = q as u32;
            for j in 0..5 {
                ys[i * 5 + j] = d * ((v % 3) as i32 - 1) as f32;
                v /= 3;
            }
        }
        for (i, &q) in b.qh.iter().enumerate() {
            let mut v = q as u32;
            for j in 0..4 {
                ys[240 + i * 4 + j] = d * ((v % 3) as i32 - 1) as f32;
                v /= 3;
            }
        }
    }
}

pub fn quantize_row_tq2_0(x: &[f32], out: &mut [u8]) {
    let blocks: &mut [BlockTQ2_0] = bytemuck::cast_slice_mut(out);
    debug_assert_eq!(x.len(), blocks.len() * QK_K);
    for (b, xs) in blocks.iter_mut().zip(x.chunks_exact(QK_K)) {
        b.d = f16::from_f32(best_ternary_scale(xs));
        let d = b.d.to_f32();
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        b.qs = [0; QK_K / 4];
        for (l, &v) in xs.iter().enumerate() {
            let q = (((v * id).round() as i32).clamp(-1, 1) + 1) as u8;
            b.qs[l / 4] |= q << (2 * (l % 4));
        }
    }
}

pub fn dequantize_row_tq2_0(src: &[u8], y: &mut [f32]) {
    let blocks: &[BlockTQ2_0] = bytemuck::cast_slice(src);
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        for (l, yv) in ys.iter_mut().enumerate() {
            let q = (b.qs[l / 4] >> (2 * (l % 4))) & 3;
            *yv = d * (q as i32 - 1) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    fn wave(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.31).sin() * 1.5).collect()
    }

    /// `‖x − x̂‖₂ / ‖x‖₂`
    fn rel_err(x: &[f32], y: &[f32]) -> f32 {
        let num: f32 = x.iter().zip(y).map(|(a, b)| (a - b) * (a - b)).sum();
        let den: f32 = x.iter().map(|a| a * a).sum();
        (num / den).sqrt()
    }

    #[test]
    fn iq4_nl_round_trip() {
        let x = wave(QK);
        let mut b = [BlockIQ4_NL::zeroed()];
        quantize_row_iq4_nl(&x, &mut b, None);
        let mut y = vec![0.0; QK];
        dequantize_row_iq4_nl(&b, &mut y);
        assert!(rel_err(&x, &y) < 0.12);
    }

    #[test]
    fn ternary_round_trips_are_self_consistent() {
        let x: Vec<f32> = (0..QK_K).map(|i| [(0.9), (-0.8), 0.0][i % 3]).collect();
        let mut out = vec![0u8; DType::TQ1_0.row_size(QK_K)];
        quantize_row_tq1_0(&x, &mut out);
        let mut y = vec![0.0; QK_K];
        dequantize_row_tq1_0(&out, &mut y);
        // ternary reproduces the sign pattern exactly
        for (a, b) in x.iter().zip(&y) {
            assert_eq!(a.signum() * (a.abs() > 0.0) as i32 as f32, b.signum() * (b.abs() > 0.0) as i32 as f32);
        }

        let mut out2 = vec![0u8; DType::TQ2_0.row_size(QK_K)];
        quantize_row_tq2_0(&x, &mut out2);
        let mut y2 = vec![0.0; QK_K];
        dequantize_row_tq2_0(&out2, &mut y2);
        assert_eq!(y, y2);
    }

    #[test]
    fn iq2_xxs_round_trip_bounded() {
        let x = wave(QK_K);
        let im = vec![1.0f32; QK_K];
        let mut out = vec![0u8; DType::IQ2_XXS.row_size(QK_K)];
        quantize_row_iq2_xxs(&x, &mut out, Some(&im));
        let mut y = vec![0.0; QK_K];
        dequantize_row_iq2_xxs(&out, &mut y);
        assert!(rel_err(&x, &y) < 0.6, "error {}", rel_err(&x, &y));
    }

    #[test]
    fn iq3_s_beats_iq2_xxs() {
        let x = wave(QK_K);
        let im = vec![1.0f32; QK_K];
        let mut o2 = vec![0u8; DType::IQ2_XXS.row_size(QK_K)];
        let mut o3 = vec![0u8; DType::IQ3_S.row_size(QK_K)];
        quantize_row_iq2_xxs(&x, &mut o2, Some(&im));
        quantize_row_iq3_s(&x, &mut o3, Some(&im));
        let mut y2 = vec![0.0; QK_K];
        let mut y3 = vec![0.0; QK_K];
        dequantize_row_iq2_xxs(&o2, &mut y2);
        dequantize_row_iq3_s(&o3, &mut y3);
        assert!(rel_err(&x, &y3) <= rel_err(&x, &y2));
    }
}
