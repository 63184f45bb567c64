//! The 256-element super-block family: Q2_K .. Q8_K.
//!
//! Every format carries per-sub-block scales quantized against one or two
//! half-precision super-block scales. Q8_K is the dot-product partner type:
//! full-precision scale, int8 values, per-16 partial sums.

use crate::types::QK_K;
use bytemuck::{Pod, Zeroable};
use half::f16;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockQ2_K {
    /// Per-16 sub-block: scale in the low nibble, minimum in the high one.
    pub scales: [u8; QK_K / 16],
    pub qs: [u8; QK_K / 4],
    pub d: f16,
    pub dmin: f16,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockQ3_K {
    pub hmask: [u8; QK_K / 8],
    pub qs: [u8; QK_K / 4],
    /// 16 six-bit signed sub-block scales, bit-packed.
    pub scales: [u8; 12],
    pub d: f16,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockQ4_K {
    pub d: f16,
    pub dmin: f16,
    /// 8 six-bit scales and 8 six-bit minimums, packed.
    pub scales: [u8; 12],
    pub qs: [u8; QK_K / 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockQ5_K {
    pub d: f16,
    pub dmin: f16,
    pub scales: [u8; 12],
    pub qh: [u8; QK_K / 8],
    pub qs: [u8; QK_K / 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockQ6_K {
    pub ql: [u8; QK_K / 2],
    pub qh: [u8; QK_K / 4],
    pub scales: [i8; QK_K / 16],
    pub d: f16,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BlockQ8_K {
    pub d: f32,
    pub qs: [i8; QK_K],
    /// Partial sums over each 16-element group, used by integer dot paths.
    pub bsums: [i16; QK_K / 16],
}

/// Pack the 6-bit scale/min pairs of Q4_K/Q5_K. Inverse of
/// [`get_scale_min_k4`].
fn set_scale_min_k4(scales: &mut [u8; 12], ls: &[u8; 8], lm: &[u8; 8]) {
    for j in 0..4 {
        scales[j] = (ls[j] & 63) | ((ls[j + 4] & 0x30) << 2);
        scales[j + 4] = (lm[j] & 63) | ((lm[j + 4] & 0x30) << 2);
        scales[j + 8] = (ls[j + 4] & 0x0F) | ((lm[j + 4] & 0x0F) << 4);
    }
}

fn get_scale_min_k4(j: usize, q: &[u8; 12]) -> (u8, u8) {
    if j < 4 {
        (q[j] & 63, q[j + 4] & 63)
    } else {
        (
            (q[j + 4] & 0x0F) | ((q[j - 4] >> 6) << 4),
            (q[j + 4] >> 4) | ((q[j] >> 6) << 4),
        )
    }
}

fn write_bits(out: &mut [u8], idx: usize, width: usize, val: u32) {
    let mut bit = idx * width;
    for k in 0..width {
        if (val >> k) & 1 != 0 {
            out[bit / 8] |= 1 << (bit % 8);
        }
        bit += 1;
    }
}

fn read_bits(inp: &[u8], idx: usize, width: usize) -> u32 {
    let mut val = 0u32;
    let mut bit = idx * width;
    for k in 0..width {
        val |= (((inp[bit / 8] >> (bit % 8)) & 1) as u32) << k;
        bit += 1;
    }
    val
}

fn sub_min_max(xs: &[f32]) -> (f32, f32) {
    let mut mn = f32::INFINITY;
    let mut mx = f32::NEG_INFINITY;
    for &v in xs {
        mn = mn.min(v);
        mx = mx.max(v);
    }
    (mn, mx)
}

fn sub_amax(xs: &[f32]) -> f32 {
    let mut amax = 0.0f32;
    for &v in xs {
        amax = amax.max(v.abs());
    }
    amax
}

pub fn quantize_row_q2_k(x: &[f32], out: &mut [BlockQ2_K]) {
    debug_assert_eq!(x.len(), out.len() * QK_K);
    for (b, xs) in out.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut s = [0.0f32; 16];
        let mut m = [0.0f32; 16];
        for (i, sub) in xs.chunks_exact(16).enumerate() {
            let (mn, mx) = sub_min_max(sub);
            m[i] = (-mn).max(0.0);
            s[i] = ((mx + m[i]) / 3.0).max(0.0);
        }
        let max_s = s.iter().cloned().fold(0.0f32, f32::max);
        let max_m = m.iter().cloned().fold(0.0f32, f32::max);
        let d = max_s / 15.0;
        let dmin = max_m / 15.0;
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        let im = if dmin > 0.0 { 1.0 / dmin } else { 0.0 };
        b.d = f16::from_f32(d);
        b.dmin = f16::from_f32(dmin);
        b.qs = [0; QK_K / 4];
        for i in 0..16 {
            let ls = ((s[i] * id).round() as u8).min(15);
            let lm = ((m[i] * im).round() as u8).min(15);
            b.scales[i] = ls | (lm << 4);
            let dl = d * ls as f32;
            let ml = dmin * lm as f32;
            let idl = if dl > 0.0 { 1.0 / dl } else { 0.0 };
            for j in 0..16 {
                let l = i * 16 + j;
                let q = (((xs[l] + ml) * idl).round() as i32).clamp(0, 3) as u8;
                b.qs[l / 4] |= q << (2 * (l % 4));
            }
        }
    }
}

pub fn dequantize_row_q2_k(blocks: &[BlockQ2_K], y: &mut [f32]) {
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        let dmin = b.dmin.to_f32();
        for i in 0..16 {
            let dl = d * (b.scales[i] & 0x0F) as f32;
            let ml = dmin * (b.scales[i] >> 4) as f32;
            for j in 0..16 {
                let l = i * 16 + j;
                let q = (b.qs[l / 4] >> (2 * (l % 4))) & 3;
                ys[l] = dl * q as f32 - ml;
            }
        }
    }
}

pub fn quantize_row_q3_k(x: &[f32], out: &mut [BlockQ3_K]) {
    debug_assert_eq!(x.len(), out.len() * QK_K);
    for (b, xs) in out.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut s = [0.0f32; 16];
        for (i, sub) in xs.chunks_exact(16).enumerate() {
            s[i] = sub_amax(sub) / 4.0;
        }
        let max_s = s.iter().cloned().fold(0.0f32, f32::max);
        let d = max_s / 31.0;
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        b.d = f16::from_f32(d);
        b.scales = [0; 12];
        b.qs = [0; QK_K / 4];
        b.hmask = [0; QK_K / 8];
        for i in 0..16 {
            let sc = ((s[i] * id).round() as i32).clamp(-31, 31);
            write_bits(&mut b.scales, i, 6, (sc + 32) as u32);
            let dl = d * sc as f32;
            let idl = if dl != 0.0 { 1.0 / dl } else { 0.0 };
            for j in 0..16 {
                let l = i * 16 + j;
                let q = ((xs[l] * idl).round() as i32).clamp(-4, 3);
                let u = (q + 4) as u8;
                b.qs[l / 4] |= (u & 3) << (2 * (l % 4));
                if u & 4 != 0 {
                    b.hmask[l / 8] |= 1 << (l % 8);
                }
            }
        }
    }
}

pub fn dequantize_row_q3_k(blocks: &[BlockQ3_K], y: &mut [f32]) {
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        for i in 0..16 {
            let sc = read_bits(&b.scales, i, 6) as i32 - 32;
            let dl = d * sc as f32;
            for j in 0..16 {
                let l = i * 16 + j;
                let low = (b.qs[l / 4] >> (2 * (l % 4))) & 3;
                let high = (b.hmask[l / 8] >> (l % 8)) & 1;
                let u = low | (high << 2);
                ys[l] = dl * (u as i32 - 4) as f32;
            }
        }
    }
}

pub fn quantize_row_q4_k(x: &[f32], out: &mut [BlockQ4_K]) {
    debug_assert_eq!(x.len(), out.len() * QK_K);
    for (b, xs) in out.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut s = [0.0f32; 8];
        let mut m = [0.0f32; 8];
        for (i, sub) in xs.chunks_exact(32).enumerate() {
            let (mn, mx) = sub_min_max(sub);
            m[i] = (-mn).max(0.0);
            s[i] = ((mx + m[i]) / 15.0).max(0.0);
        }
        let d = s.iter().cloned().fold(0.0f32, f32::max) / 63.0;
        let dmin = m.iter().cloned().fold(0.0f32, f32::max) / 63.0;
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        let im = if dmin > 0.0 { 1.0 / dmin } else { 0.0 };
        b.d = f16::from_f32(d);
        b.dmin = f16::from_f32(dmin);
        let mut ls = [0u8; 8];
        let mut lm = [0u8; 8];
        for i in 0..8 {
            ls[i] = ((s[i] * id).round() as u8).min(63);
            lm[i] = ((m[i] * im).round() as u8).min(63);
        }
        set_scale_min_k4(&mut b.scales, &ls, &lm);
        b.qs = [0; QK_K / 2];
        for i in 0..8 {
            let dl = d * ls[i] as f32;
            let ml = dmin * lm[i] as f32;
            let idl = if dl > 0.0 { 1.0 / dl } else { 0.0 };
            for j in 0..32 {
                let l = i * 32 + j;
                let q = (((xs[l] + ml) * idl).round() as i32).clamp(0, 15) as u8;
                b.qs[l / 2] |= q << (4 * (l % 2));
            }
        }
    }
}

pub fn dequantize_row_q4_k(blocks: &[BlockQ4_K], y: &mut [f32]) {
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        let dmin = b.dmin.to_f32();
        for i in 0..8 {
            let (sc, mn) = get_scale_min_k4(i, &b.scales);
            let dl = d * sc as f32;
            let ml = dmin * mn as f32;
            for j in 0..32 {
                let l = i * 32 + j;
                let q = (b.qs[l / 2] >> (4 * (l % 2))) & 0x0F;
                ys[l] = dl * q as f32 - ml;
            }
        }
    }
}

pub fn quantize_row_q5_k(x: &[f32], out: &mut [BlockQ5_K]) {
    debug_assert_eq!(x.len(), out.len() * QK_K);
    for (b, xs) in out.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut s = [0.0f32; 8];
        let mut m = [0.0f32; 8];
        for (i, sub) in xs.chunks_exact(32).enumerate() {
            let (mn, mx) = sub_min_max(sub);
            m[i] = (-mn).max(0.0);
            s[i] = ((mx + m[i]) / 31.0).max(0.0);
        }
        let d = s.iter().cloned().fold(0.0f32, f32::max) / 63.0;
        let dmin = m.iter().cloned().fold(0.0f32, f32::max) / 63.0;
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        let im = if dmin > 0.0 { 1.0 / dmin } else { 0.0 };
        b.d = f16::from_f32(d);
        b.dmin = f16::from_f32(dmin);
        let mut ls = [0u8; 8];
        let mut lm = [0u8; 8];
        for i in 0..8 {
            ls[i] = ((s[i] * id).round() as u8).min(63);
            lm[i] = ((m[i] * im).round() as u8).min(63);
        }
        set_scale_min_k4(&mut b.scales, &ls, &lm);
        b.qs = [0; QK_K / 2];
        b.qh = [0; QK_K / 8];
        for i in 0..8 {
            let dl = d * ls[i] as f32;
            let ml = dmin * lm[i] as f32;
            let idl = if dl > 0.0 { 1.0 / dl } else { 0.0 };
            for j in 0..32 {
                let l = i * 32 + j;
                let q = (((xs[l] + ml) * idl).round() as i32).clamp(0, 31) as u8;
                b.qs[l / 2] |= (q & 0x0F) << (4 * (l % 2));
                if q & 0x10 != 0 {
                    b.qh[l / 8] |= 1 << (l % 8);
                }
            }
        }
    }
}

pub fn dequantize_row_q5_k(blocks: &[BlockQ5_K], y: &mut [f32]) {
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        let dmin = b.dmin.to_f32();
        for i in 0..8 {
            let (sc, mn) = get_scale_min_k4(i, &b.scales);
            let dl = d * sc as f32;
            let ml = dmin * mn as f32;
            for j in 0..32 {
                let l = i * 32 + j;
                let low = (b.qs[l / 2] >> (4 * (l % 2))) & 0x0F;
                let high = ((b.qh[l / 8] >> (l % 8)) & 1) << 4;
                ys[l] = dl * (low | high) as f32 - ml;
            }
        }
    }
}

pub fn quantize_row_q6_k(x: &[f32], out: &mut [BlockQ6_K]) {
    debug_assert_eq!(x.len(), out.len() * QK_K);
    for (b, xs) in out.iter_mut().zip(x.chunks_exact(QK_K)) {
        let mut s = [0.0f32; 16];
        for (i, sub) in xs.chunks_exact(16).enumerate() {
            s[i] = sub_amax(sub) / 32.0;
        }
        let max_s = s.iter().cloned().fold(0.0f32, f32::max);
        let d = max_s / 127.0;
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        b.d = f16::from_f32(d);
        b.ql = [0; QK_K / 2];
        b.qh = [0; QK_K / 4];
        for i in 0..16 {
            let sc = ((s[i] * id).round() as i32).clamp(-127, 127) as i8;
            b.scales[i] = sc;
            let dl = d * sc as f32;
            let idl = if dl != 0.0 { 1.0 / dl } else { 0.0 };
            for j in 0..16 {
                let l = i * 16 + j;
                let q = ((xs[l] * idl).round() as i32).clamp(-32, 31);
                let u = (q + 32) as u8;
                b.ql[l / 2] |= (u & 0x0F) << (4 * (l % 2));
                b.qh[l / 4] |= (u >> 4) << (2 * (l % 4));
            }
        }
    }
}

pub fn dequantize_row_q6_k(blocks: &[BlockQ6_K], y: &mut [f32]) {
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        let d = b.d.to_f32();
        for i in 0..16 {
            let dl = d * b.scales[i] as f32;
            for j in 0..16 {
                let l = i * 16 + j;
                let low = (b.ql[l / 2] >> (4 * (l % 2))) & 0x0F;
                let high = (b.qh[l / 4] >> (2 * (l % 4))) & 3;
                let u = low | (high << 4);
                ys[l] = dl * (u as i32 - 32) as f32;
            }
        }
    }
}

pub fn quantize_row_q8_k(x: &[f32], out: &mut [BlockQ8_K]) {
    debug_assert_eq!(x.len(), out.len() * QK_K);
    for (b, xs) in out.iter_mut().zip(x.chunks_exact(QK_K)) {
        let amax = sub_amax(xs);
        let d = amax / 127.0;
        let id = if d > 0.0 { 1.0 / d } else { 0.0 };
        b.d = d;
        for (q, &v) in b.qs.iter_mut().zip(xs) {
            *q = (v * id).round() as i8;
        }
        for i in 0..QK_K / 16 {
            let mut sum = 0i32;
            for j in 0..16 {
                sum += b.qs[i * 16 + j] as i32;
            }
            b.bsums[i] = sum as i16;
        }
    }
}

pub fn dequantize_row_q8_k(blocks: &[BlockQ8_K], y: &mut [f32]) {
    debug_assert_eq!(y.len(), blocks.len() * QK_K);
    for (b, ys) in blocks.iter().zip(y.chunks_exact_mut(QK_K)) {
        for (yv, &q) in ys.iter_mut().zip(b.qs.iter()) {
            *yv = q as f32 * b.d;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wave(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.17).sin() * 2.5).collect()
    }

    fn rel_err(x: &[f32], y: &[f32]) -> f32 {
        let num: f32 = x.iter().zip(y).map(|(a, b)| (a - b) * (a - b)).sum();
        let den: f32 = x.iter().map(|a| a * a).sum();
        num / den
    }

    #[test]
    fn scale_min_packing_round_trips() {
        let mut scales = [0u8; 12];
        let ls = [0, 7, 13, 21, 34, 45, 55, 63];
        let lm = [63, 1, 0, 17, 29, 38, 50, 62];
        set_scale_min_k4(&mut scales, &ls, &lm);
        for j in 0..8 {
            let (s, m) = get_scale_min_k4(j, &scales);
            assert_eq!((s, m), (ls[j], lm[j]), "sub-block {}", j);
        }
    }

    #[test]
    fn k_quant_round_trip_errors() {
        let x = wave(QK_K);
        let cases: [(fn(&[f32]) -> Vec<f32>, f32); 5] = [
            (|x| rt_q2(x), 0.10),
            (|x| rt_q3(x), 0.05),
            (|x| rt_q4(x), 0.01),
            (|x| rt_q5(x), 0.005),
            (|x| rt_q6(x), 0.002),
        ];
        for (rt, bound) in cases {
            let y = rt(&x);
            let e = rel_err(&x, &y);
            assert!(e < bound, "error {} above bound {}", e, bound);
        }
    }

    fn rt_q2(x: &[f32]) -> Vec<f32> {
        let mut b = [BlockQ2_K::zeroed()];
        quantize_row_q2_k(x, &mut b);
        let mut y = vec![0.0; QK_K];
        dequantize_row_q2_k(&b, &mut y);
        y
    }
    fn rt_q3(x: &[f32]) -> Vec<f32> {
        let mut b = [BlockQ3_K::zeroed()];
        quantize_row_q3_k(x, &mut b);
        let mut y = vec![0.0; QK_K];
        dequantize_row_q3_k(&b, &mut y);
        y
    }
    fn rt_q4(x: &[f32]) -> Vec<f32> {
        let mut b = [BlockQ4_K::zeroed()];
        quantize_row_q4_k(x, &mut b);
        let mut y = vec![0.0; QK_K];
        dequantize_row_q4_k(&b, &mut y);
        y
    }
    fn rt_q5(x: &[f32]) -> Vec<f32> {
        let mut b = [BlockQ5_K::zeroed()];
        quantize_row_q5_k(x, &mut b);
        let mut y = vec![0.0; QK_K];
        dequantize_row_q5_k(&b, &mut y);
        y
    }
    fn rt_q6(x: &[f32]) -> Vec<f32> {
        let mut b = [BlockQ6_K::zeroed()];
        quantize_row_q6_k(x, &mut b);
        let mut y = vec![0.0; QK_K];
        dequantize_row_q6_k(&b, &mut y);
        y
    }

    #[test]
    fn q8_k_bsums() {
        let x = wave(QK_K);
        let mut b = [BlockQ8_K::zeroed()];
        quantize_row_q8_k(&x, &mut b);
        for i in 0..16 {
            let s: i32 = (0..16).map(|j| b[0].qs[i * 16 + j] as i32).sum();
            assert_eq!(s as i16, b[0].bsums[i]);
        }
    }
}
