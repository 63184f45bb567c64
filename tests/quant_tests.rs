use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use slipstream::quant;
use slipstream::DType;

fn gaussian(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let dist = Normal::new(0.0f32, 1.0).unwrap();
    (0..n).map(|_| dist.sample(&mut rng)).collect()
}

/// Relative reconstruction error `‖x − x̂‖₂ / ‖x‖₂`. A degenerate encoder
/// that reconstructs all zeros scores exactly 1.0, so every bound below
/// 1.0 rejects it.
fn round_trip_rel_err(t: DType, x: &[f32], imatrix: Option<&[f32]>) -> f32 {
    let ncols = x.len();
    let mut packed = vec![0u8; t.row_size(ncols)];
    let written = quant::quantize_chunk(t, x, &mut packed, 0, 1, ncols, imatrix).unwrap();
    assert_eq!(written, t.row_size(ncols));
    let mut y = vec![0.0f32; ncols];
    quant::dequantize_row(t, &packed, &mut y);
    let num: f32 = x.iter().zip(&y).map(|(a, b)| (a - b) * (a - b)).sum();
    let den: f32 = x.iter().map(|a| a * a).sum();
    (num / den).sqrt()
}

#[test]
fn q4_0_error_on_seeded_gaussian() {
    // ‖x − x̂‖² / ‖x‖² < 0.01, i.e. 0.1 on the norm ratio
    let x = gaussian(256, 42);
    let err = round_trip_rel_err(DType::Q4_0, &x, None);
    assert!(err < 0.1, "relative error {}", err);
}

#[test]
fn dense_conversions_are_tight() {
    let x = gaussian(256, 7);
    // f32 is exact
    assert_eq!(round_trip_rel_err(DType::F32, &x, None), 0.0);
    // f16 and bf16 are rounding-only
    assert!(round_trip_rel_err(DType::F16, &x, None) < 1e-3);
    assert!(round_trip_rel_err(DType::BF16, &x, None) < 1e-2);
}

/// Per-type accuracy ceilings on one seeded Gaussian calibration set.
/// The bounds sit a safety margin above what the codecs achieve on this
/// data, far enough below 1.0 that any broken encoder or decoder trips
/// them.
#[test]
fn error_bounds_per_type() {
    let x = gaussian(1024, 1234);
    let im = vec![1.0f32; 1024];
    let cases: &[(DType, f32)] = &[
        (DType::Q4_0, 0.10),
        (DType::Q4_1, 0.10),
        (DType::Q5_0, 0.06),
        (DType::Q5_1, 0.06),
        (DType::Q8_0, 0.008),
        (DType::Q2_K, 0.45),
        (DType::Q3_K, 0.22),
        (DType::Q4_K, 0.12),
        (DType::Q5_K, 0.06),
        (DType::Q6_K, 0.03),
        (DType::Q8_K, 0.012),
        (DType::IQ4_NL, 0.12),
        (DType::IQ4_XS, 0.13),
        (DType::TQ1_0, 0.55),
        (DType::TQ2_0, 0.55),
        (DType::IQ1_S, 0.75),
        (DType::IQ1_M, 0.75),
        (DType::IQ2_XXS, 0.45),
        (DType::IQ2_XS, 0.45),
        (DType::IQ2_S, 0.45),
        (DType::IQ3_XXS, 0.38),
        (DType::IQ3_S, 0.30),
    ];
    for &(t, bound) in cases {
        let err = round_trip_rel_err(t, &x, Some(&im));
        assert!(err < bound, "{}: relative error {} above {}", t.name(), err, bound);
    }
}

/// The ternary formats exist for ternary-trained weights; on in-domain
/// data the block maximum is the exact gain and only the f16 rounding of
/// the scale survives.
#[test]
fn ternary_formats_are_tight_on_ternary_data() {
    let x: Vec<f32> = (0..1024).map(|i| [0.8f32, -0.8, 0.0, 0.8][i % 4]).collect();
    for &t in &[DType::TQ1_0, DType::TQ2_0] {
        let err = round_trip_rel_err(t, &x, None);
        assert!(err < 0.02, "{}: relative error {}", t.name(), err);
    }
}

#[test]
fn quality_orders_within_families() {
    let x = gaussian(1024, 99);
    let im = vec![1.0f32; 1024];
    let q2 = round_trip_rel_err(DType::Q2_K, &x, None);
    let q4 = round_trip_rel_err(DType::Q4_K, &x, None);
    let q6 = round_trip_rel_err(DType::Q6_K, &x, None);
    assert!(q6 < q4 && q4 < q2, "{} < {} < {} expected", q6, q4, q2);

    let iq2 = round_trip_rel_err(DType::IQ2_XXS, &x, Some(&im));
    let iq3 = round_trip_rel_err(DType::IQ3_S, &x, Some(&im));
    assert!(iq3 <= iq2, "iq3_s {} should not exceed iq2_xxs {}", iq3, iq2);
}

#[test]
fn quantize_chunk_respects_rows() {
    let x = gaussian(4 * 256, 5);
    let mut packed = vec![0u8; DType::Q6_K.row_size(256) * 4];
    let written = quant::quantize_chunk(DType::Q6_K, &x, &mut packed, 0, 4, 256, None).unwrap();
    assert_eq!(written, packed.len());

    // encoding each row separately gives the same bytes
    for (r, row) in x.chunks_exact(256).enumerate() {
        let mut one = vec![0u8; DType::Q6_K.row_size(256)];
        quant::quantize_row(DType::Q6_K, row, &mut one);
        let offs = r * one.len();
        assert_eq!(&packed[offs..offs + one.len()], &one[..]);
    }
}

#[test]
fn interleaved_types_reject_direct_quantization() {
    let x = gaussian(64, 3);
    let mut packed = vec![0u8; DType::Q4_0_4_4.row_size(64)];
    let res = quant::quantize_chunk(DType::Q4_0_4_4, &x, &mut packed, 0, 1, 64, None);
    assert!(res.is_err());
}

#[test]
fn vec_dot_agrees_with_dequantized_dot() {
    let a = gaussian(512, 11);
    let b = gaussian(512, 12);
    for &t in &[DType::Q4_0, DType::Q5_0, DType::Q8_0, DType::Q4_K, DType::Q6_K] {
        let vdt = t.vec_dot_type();
        let mut pa = vec![0u8; t.row_size(512)];
        let mut pb = vec![0u8; vdt.row_size(512)];
        quant::quantize_row(t, &a, &mut pa);
        quant::quantize_row(vdt, &b, &mut pb);

        let fast = quant::vec_dot(t, 512, &pa, vdt, &pb);
        let mut da = vec![0.0f32; 512];
        quant::dequantize_row(t, &pa, &mut da);
        let approx: f32 = da.iter().zip(&b).map(|(x, y)| x * y).sum();
        // both sides quantize b the same way, so agreement is loose only in
        // b's quantization error
        assert!(
            (fast - approx).abs() < 0.05 * approx.abs().max(10.0),
            "{}: {} vs {}",
            t.name(),
            fast,
            approx
        );
    }
}
