use slipstream::{compute_with_ctx, Context, DType, Graph, Status};

#[test]
fn dense_matmul_literal() {
    // A = [[1,2,3],[4,5,6]] (rows of length 3), B = [1,0,1]
    let mut ctx = Context::with_size(1 << 20).unwrap();
    let a = ctx.from_slice_f32(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = ctx.from_slice_f32(&[3, 1], &[1.0, 0.0, 1.0]);
    let d = ctx.mul_mat(a, b);

    let mut g = Graph::new(8);
    g.build_forward_expand(&ctx, d).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);
    assert_eq!(ctx.f32s(d), &[4.0, 10.0]);
}

#[test]
fn softmax_rows_with_mask() {
    let mut ctx = Context::with_size(1 << 20).unwrap();
    let x = ctx.from_slice_f32(&[4, 2], &[0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0]);
    let mask = ctx.from_slice_f32(&[4, 2], &[0.0; 8]);
    let y = ctx.soft_max_ext(x, Some(mask), 1.0, 0.0);

    let mut g = Graph::new(8);
    g.build_forward_expand(&ctx, y).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);

    let out = ctx.f32s(y);
    for v in &out[0..4] {
        assert!((v - 0.25).abs() < 1e-6);
    }
    let expect = [0.0321, 0.0871, 0.2369, 0.6439];
    for (v, e) in out[4..8].iter().zip(&expect) {
        assert!((v - e).abs() < 1e-3, "{} vs {}", v, e);
    }
}

#[test]
fn softmax_rows_sum_to_one() {
    let mut ctx = Context::with_size(1 << 22).unwrap();
    let vals: Vec<f32> = (0..32 * 16).map(|i| ((i * 37 % 101) as f32 - 50.0) * 0.3).collect();
    let x = ctx.from_slice_f32(&[32, 16], &vals);
    let y = ctx.soft_max(x);
    let mut g = Graph::new(8);
    g.build_forward_expand(&ctx, y).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &g, 2), Status::Success);
    for row in ctx.f32s(y).chunks_exact(32) {
        let s: f32 = row.iter().sum();
        assert!((s - 1.0).abs() < 1e-6, "row sums to {}", s);
    }
}

#[test]
fn broadcast_add_semantics() {
    let mut ctx = Context::with_size(1 << 20).unwrap();
    let a = ctx.from_slice_f32(&[4, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    let b = ctx.from_slice_f32(&[4, 1], &[10.0, 20.0, 30.0, 40.0]);
    let c = ctx.from_slice_f32(&[1, 1], &[100.0]);
    let ab = ctx.add(a, b);
    let ac = ctx.add(a, c);

    let mut g = Graph::new(8);
    g.build_forward_expand(&ctx, ab).unwrap();
    g.build_forward_expand(&ctx, ac).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);

    // b's single row repeats over a's second row
    assert_eq!(
        ctx.f32s(ab),
        &[10.0, 21.0, 32.0, 43.0, 14.0, 25.0, 36.0, 47.0]
    );
    // c broadcasts along the row as well
    assert_eq!(
        ctx.f32s(ac),
        &[100.0, 101.0, 102.0, 103.0, 104.0, 105.0, 106.0, 107.0]
    );
}

#[test]
fn batched_matmul_matches_slices() {
    let mut ctx = Context::with_size(1 << 22).unwrap();
    let (k, m, n, batch) = (8i64, 3i64, 4i64, 2i64);
    let av: Vec<f32> = (0..k * m * batch).map(|i| ((i * 13 % 17) as f32 - 8.0) * 0.25).collect();
    let bv: Vec<f32> = (0..k * n * batch).map(|i| ((i * 11 % 23) as f32 - 11.0) * 0.125).collect();
    let a = ctx.from_slice_f32(&[k, m, batch], &av);
    let b = ctx.from_slice_f32(&[k, n, batch], &bv);
    let full = ctx.mul_mat(a, b);

    let (anb, bnb) = (ctx.tensor(a).nb, ctx.tensor(b).nb);
    let mut slices = Vec::new();
    for i in 0..batch {
        let ai = ctx.view_2d(a, k, m, anb[1], i as usize * anb[2]);
        let bi = ctx.view_2d(b, k, n, bnb[1], i as usize * bnb[2]);
        slices.push(ctx.mul_mat(ai, bi));
    }

    let mut g = Graph::new(32);
    g.build_forward_expand(&ctx, full).unwrap();
    for &s in &slices {
        g.build_forward_expand(&ctx, s).unwrap();
    }
    assert_eq!(compute_with_ctx(&ctx, &g, 2), Status::Success);

    let full_out = ctx.f32s(full).to_vec();
    for (i, &s) in slices.iter().enumerate() {
        let part = ctx.f32s(s);
        let offset = (i as i64 * m * n) as usize;
        assert_eq!(&full_out[offset..offset + (m * n) as usize], part);
    }
}

#[test]
fn quantized_matmul_stays_close() {
    let mut ctx = Context::with_size(1 << 22).unwrap();
    let (k, m) = (64usize, 4usize);
    let w: Vec<f32> = (0..k * m).map(|i| ((i * 7 % 29) as f32 - 14.0) * 0.1).collect();
    let x: Vec<f32> = (0..k).map(|i| ((i * 3 % 13) as f32 - 6.0) * 0.2).collect();

    let wf = ctx.from_slice_f32(&[k as i64, m as i64], &w);
    let xv = ctx.from_slice_f32(&[k as i64, 1], &x);
    let dense = ctx.mul_mat(wf, xv);

    let wq = ctx.new_tensor_2d(DType::Q4_0, k as i64, m as i64);
    let mut packed = vec![0u8; DType::Q4_0.row_size(k) * m];
    slipstream::quant::quantize_chunk(DType::Q4_0, &w, &mut packed, 0, m, k, None).unwrap();
    ctx.bytes_mut(wq).copy_from_slice(&packed);
    let quantized = ctx.mul_mat(wq, xv);

    let mut g = Graph::new(16);
    g.build_forward_expand(&ctx, dense).unwrap();
    g.build_forward_expand(&ctx, quantized).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &g, 2), Status::Success);

    let scale: f32 = x.iter().map(|v| v.abs()).sum::<f32>();
    for (d, q) in ctx.f32s(dense).iter().zip(ctx.f32s(quantized)) {
        assert!((d - q).abs() < 0.05 * scale.max(1.0), "{} vs {}", d, q);
    }
}

#[test]
fn get_rows_decodes_quantized_source() {
    let mut ctx = Context::with_size(1 << 22).unwrap();
    let ncols = 32usize;
    let vals: Vec<f32> = (0..ncols * 4).map(|i| (i as f32 * 0.21).sin()).collect();
    let table = ctx.new_tensor_2d(DType::Q8_0, ncols as i64, 4);
    let mut packed = vec![0u8; DType::Q8_0.row_size(ncols) * 4];
    slipstream::quant::quantize_chunk(DType::Q8_0, &vals, &mut packed, 0, 4, ncols, None).unwrap();
    ctx.bytes_mut(table).copy_from_slice(&packed);

    let idx = ctx.from_slice_i32(&[2], &[3, 1]);
    let rows = ctx.get_rows(table, idx);
    let mut g = Graph::new(8);
    g.build_forward_expand(&ctx, rows).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);

    let out = ctx.f32s(rows);
    for (j, &v) in out[..ncols].iter().enumerate() {
        assert!((v - vals[3 * ncols + j]).abs() < 0.02);
    }
    for (j, &v) in out[ncols..].iter().enumerate() {
        assert!((v - vals[ncols + j]).abs() < 0.02);
    }
}

#[test]
fn concat_and_views() {
    let mut ctx = Context::with_size(1 << 20).unwrap();
    let a = ctx.from_slice_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let b = ctx.from_slice_f32(&[2, 2], &[5.0, 6.0, 7.0, 8.0]);
    let cat = ctx.concat(a, b, 1);
    let mut g = Graph::new(8);
    g.build_forward_expand(&ctx, cat).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);
    assert_eq!(ctx.f32s(cat), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
}

#[test]
fn transpose_contiguous_round_trip() {
    let mut ctx = Context::with_size(1 << 20).unwrap();
    let a = ctx.from_slice_f32(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let t = ctx.transpose(a);
    let c = ctx.cont(t);
    let mut g = Graph::new(8);
    g.build_forward_expand(&ctx, c).unwrap();
    assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);
    assert_eq!(ctx.f32s(c), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
}
