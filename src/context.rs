//! The arena context: one caller-owned memory pool from which all tensors,
//! payloads and graphs are bump-allocated. Nothing is freed until the
//! context is reset or dropped.

use crate::errors::{SlipError, SlipResult};
use crate::tensor::{DataRef, Op, OpParams, Tensor, TensorFlags, TensorId, MAX_DIMS, MAX_NAME, MAX_SRC};
use crate::types::DType;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use tracing::debug;

const ARENA_ALIGN: usize = 64;
const OBJ_PAD: usize = 16;

pub(crate) struct Arena {
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
}

// The arena hands out raw offsets; during compute, worker threads write
// disjoint regions through `ptr()`. The partitioning contract lives in the
// kernels.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn new(capacity: usize) -> SlipResult<Arena> {
        let capacity = pad(capacity.max(OBJ_PAD), OBJ_PAD);
        let layout = Layout::from_size_align(capacity, ARENA_ALIGN)
            .map_err(|e| SlipError::Unsupported(format!("bad arena layout: {e}")))?;
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(SlipError::ArenaExhausted {
            requested: capacity,
            available: 0,
        })?;
        Ok(Arena {
            base,
            capacity,
            used: 0,
        })
    }

    fn alloc(&mut self, size: usize) -> SlipResult<usize> {
        let size = pad(size, OBJ_PAD);
        if self.used + size > self.capacity {
            return Err(SlipError::ArenaExhausted {
                requested: size,
                available: self.capacity - self.used,
            });
        }
        let offs = self.used;
        self.used += size;
        Ok(offs)
    }

    #[inline]
    pub(crate) unsafe fn ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.capacity);
        self.base.as_ptr().add(offset)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, ARENA_ALIGN).unwrap();
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

#[inline]
fn pad(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// A bounded sub-region of the arena for transient tensor payloads. While a
/// scratch region is installed, payload bytes come from it instead of the
/// arena tail; descriptors always stay in the object table.
#[derive(Debug, Clone, Copy)]
pub struct Scratch {
    pub offset: usize,
    pub size: usize,
    pub used: usize,
}

#[derive(Debug, Clone)]
pub struct ContextParams {
    pub mem_size: usize,
    /// Allocate descriptors only; payloads stay unset. Used when tensor
    /// data is bound from a container file.
    pub no_alloc: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        ContextParams {
            mem_size: 16 << 20,
            no_alloc: false,
        }
    }
}

pub struct Context {
    arena: Arena,
    objs: Vec<Tensor>,
    scratch: Option<Scratch>,
    no_alloc: bool,
    used_max: usize,
}

// Tensors are only appended outside compute; kernels read descriptors and
// write payload bytes of disjoint destination rows.
unsafe impl Sync for Context {}

impl Context {
    pub fn new(params: ContextParams) -> SlipResult<Context> {
        debug!(mem_size = params.mem_size, no_alloc = params.no_alloc, "context init");
        Ok(Context {
            arena: Arena::new(params.mem_size)?,
            objs: Vec::new(),
            scratch: None,
            no_alloc: params.no_alloc,
            used_max: 0,
        })
    }

    pub fn with_size(mem_size: usize) -> SlipResult<Context> {
        Context::new(ContextParams {
            mem_size,
            ..Default::default()
        })
    }

    /// Wipe the object table and the bump offset; the backing buffer is
    /// kept.
    pub fn reset(&mut self) {
        self.used_max = self.used_max.max(self.arena.used);
        self.objs.clear();
        self.scratch = None;
        self.arena.used = 0;
    }

    pub fn used_mem(&self) -> usize {
        self.arena.used
    }

    /// High-water mark across resets.
    pub fn used_mem_max(&self) -> usize {
        self.used_max.max(self.arena.used)
    }

    pub fn n_tensors(&self) -> usize {
        self.objs.len()
    }

    /// Install (or clear) a scratch region; returns the previous one.
    pub fn set_scratch(&mut self, scratch: Option<Scratch>) -> Option<Scratch> {
        std::mem::replace(&mut self.scratch, scratch)
    }

    /// Carve a region out of the arena to use as scratch space.
    pub fn reserve_scratch(&mut self, size: usize) -> SlipResult<Scratch> {
        let offset = self.arena.alloc(size)?;
        Ok(Scratch {
            offset,
            size,
            used: 0,
        })
    }

    #[inline]
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.objs[id.0 as usize]
    }

    #[inline]
    pub(crate) fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.objs[id.0 as usize]
    }

    /// Iterate tensors in creation order.
    pub fn tensors(&self) -> impl Iterator<Item = TensorId> + '_ {
        (0..self.objs.len() as u32).map(TensorId)
    }

    pub fn first_tensor(&self) -> Option<TensorId> {
        if self.objs.is_empty() {
            None
        } else {
            Some(TensorId(0))
        }
    }

    pub fn next_tensor(&self, id: TensorId) -> Option<TensorId> {
        let next = id.0 + 1;
        if (next as usize) < self.objs.len() {
            Some(TensorId(next))
        } else {
            None
        }
    }

    pub fn find(&self, name: &str) -> Option<TensorId> {
        self.objs
            .iter()
            .position(|t| t.name == name)
            .map(|i| TensorId(i as u32))
    }

    pub fn set_name(&mut self, id: TensorId, name: &str) {
        let mut s = String::with_capacity(name.len().min(MAX_NAME));
        for c in name.chars().take(MAX_NAME) {
            if c.is_ascii() {
                s.push(c);
            }
        }
        self.tensor_mut(id).name = s;
    }

    pub fn set_flag(&mut self, id: TensorId, flag: TensorFlags) {
        self.tensor_mut(id).flags |= flag;
    }

    /// Mark a tensor as a trainable parameter; the backward builder will
    /// attach a gradient to it.
    pub fn set_param(&mut self, id: TensorId) {
        self.set_flag(id, TensorFlags::PARAM);
    }

    pub fn set_input(&mut self, id: TensorId) {
        self.set_flag(id, TensorFlags::INPUT);
    }

    pub fn set_output(&mut self, id: TensorId) {
        self.set_flag(id, TensorFlags::OUTPUT);
    }

    pub fn set_loss(&mut self, id: TensorId) {
        self.set_flag(id, TensorFlags::LOSS);
    }

    // ---- construction ------------------------------------------------------

    pub(crate) fn push(&mut self, t: Tensor) -> TensorId {
        assert!(self.objs.len() < u32::MAX as usize);
        let id = TensorId(self.objs.len() as u32);
        self.objs.push(t);
        id
    }

    pub fn new_tensor(&mut self, dtype: DType, ne: &[i64]) -> TensorId {
        match self.try_new_tensor(dtype, ne) {
            Ok(id) => id,
            Err(e) => panic!("tensor allocation failed: {e}"),
        }
    }

    pub fn try_new_tensor(&mut self, dtype: DType, ne: &[i64]) -> SlipResult<TensorId> {
        assert!(!ne.is_empty() && ne.len() <= MAX_DIMS, "1..=4 dimensions");
        assert!(
            ne[0] as usize % dtype.block_size() == 0,
            "row length {} not a multiple of the {} block size",
            ne[0],
            dtype.name()
        );
        let mut ne4 = [1i64; MAX_DIMS];
        ne4[..ne.len()].copy_from_slice(ne);

        let ts = dtype.type_size();
        let bs = dtype.block_size();
        let mut nb = [0usize; MAX_DIMS];
        nb[0] = ts;
        nb[1] = nb[0] * ne4[0] as usize / bs;
        for i in 2..MAX_DIMS {
            nb[i] = nb[i - 1] * ne4[i - 1] as usize;
        }

        let nbytes = dtype.row_size(ne4[0] as usize)
            * (ne4[1] * ne4[2] * ne4[3]) as usize;
        let data = self.alloc_payload(nbytes)?;

        Ok(self.push(Tensor {
            dtype,
            ne: ne4,
            nb,
            op: Op::None,
            params: OpParams::None,
            src: [None; MAX_SRC],
            view_src: None,
            view_offs: 0,
            grad: None,
            flags: TensorFlags::empty(),
            name: String::new(),
            data,
        }))
    }

    fn alloc_payload(&mut self, nbytes: usize) -> SlipResult<DataRef> {
        if self.no_alloc {
            return Ok(DataRef::Unset);
        }
        if let Some(s) = &mut self.scratch {
            let need = pad(nbytes, OBJ_PAD);
            if s.used + need > s.size {
                return Err(SlipError::ArenaExhausted {
                    requested: need,
                    available: s.size - s.used,
                });
            }
            let offs = s.offset + s.used;
            s.used += need;
            return Ok(DataRef::Arena(offs));
        }
        self.arena.alloc(nbytes).map(DataRef::Arena)
    }

    pub fn new_tensor_1d(&mut self, dtype: DType, ne0: i64) -> TensorId {
        self.new_tensor(dtype, &[ne0])
    }

    pub fn new_tensor_2d(&mut self, dtype: DType, ne0: i64, ne1: i64) -> TensorId {
        self.new_tensor(dtype, &[ne0, ne1])
    }

    pub fn new_tensor_3d(&mut self, dtype: DType, ne0: i64, ne1: i64, ne2: i64) -> TensorId {
        self.new_tensor(dtype, &[ne0, ne1, ne2])
    }

    pub fn new_tensor_4d(
        &mut self,
        dtype: DType,
        ne0: i64,
        ne1: i64,
        ne2: i64,
        ne3: i64,
    ) -> TensorId {
        self.new_tensor(dtype, &[ne0, ne1, ne2, ne3])
    }

    /// 1-element F32 tensor holding `value`.
    pub fn new_f32(&mut self, value: f32) -> TensorId {
        let t = self.new_tensor_1d(DType::F32, 1);
        self.f32s_mut(t)[0] = value;
        t
    }

    pub fn from_slice_f32(&mut self, ne: &[i64], values: &[f32]) -> TensorId {
        let t = self.new_tensor(DType::F32, ne);
        assert_eq!(values.len() as i64, self.tensor(t).nelements());
        self.f32s_mut(t).copy_from_slice(values);
        t
    }

    pub fn from_slice_i32(&mut self, ne: &[i64], values: &[i32]) -> TensorId {
        let t = self.new_tensor(DType::I32, ne);
        assert_eq!(values.len() as i64, self.tensor(t).nelements());
        self.i32s_mut(t).copy_from_slice(values);
        t
    }

    // ---- views -------------------------------------------------------------

    fn view_impl(&mut self, src: TensorId, ne: &[i64], offset: usize) -> TensorId {
        let base = self.tensor(src);
        let root = base.view_src.unwrap_or(src);
        let root_offs = base.view_offs + offset;
        let data = match self.tensor(root).data {
            DataRef::Unset => DataRef::Unset,
            DataRef::Arena(o) => DataRef::Arena(o + root_offs),
        };
        let dtype = base.dtype;

        let mut ne4 = [1i64; MAX_DIMS];
        ne4[..ne.len()].copy_from_slice(ne);
        let ts = dtype.type_size();
        let bs = dtype.block_size();
        let mut nb = [0usize; MAX_DIMS];
        nb[0] = ts;
        nb[1] = nb[0] * ne4[0] as usize / bs;
        for i in 2..MAX_DIMS {
            nb[i] = nb[i - 1] * ne4[i - 1] as usize;
        }

        self.push(Tensor {
            dtype,
            ne: ne4,
            nb,
            op: Op::View,
            params: OpParams::None,
            src: with_src(&[src]),
            view_src: Some(root),
            view_offs: root_offs,
            grad: None,
            flags: TensorFlags::empty(),
            name: String::new(),
            data,
        })
    }

    pub fn view_1d(&mut self, src: TensorId, ne0: i64, offset: usize) -> TensorId {
        self.view_impl(src, &[ne0], offset)
    }

    pub fn view_2d(
        &mut self,
        src: TensorId,
        ne0: i64,
        ne1: i64,
        nb1: usize,
        offset: usize,
    ) -> TensorId {
        let v = self.view_impl(src, &[ne0, ne1], offset);
        let t = self.tensor_mut(v);
        t.nb[1] = nb1;
        t.nb[2] = t.nb[1] * ne1 as usize;
        t.nb[3] = t.nb[2];
        v
    }

    pub fn view_3d(
        &mut self,
        src: TensorId,
        ne0: i64,
        ne1: i64,
        ne2: i64,
        nb1: usize,
        nb2: usize,
        offset: usize,
    ) -> TensorId {
        let v = self.view_impl(src, &[ne0, ne1, ne2], offset);
        let t = self.tensor_mut(v);
        t.nb[1] = nb1;
        t.nb[2] = nb2;
        t.nb[3] = t.nb[2] * ne2 as usize;
        v
    }

    #[allow(clippy::too_many_arguments)]
    pub fn view_4d(
        &mut self,
        src: TensorId,
        ne0: i64,
        ne1: i64,
        ne2: i64,
        ne3: i64,
        nb1: usize,
        nb2: usize,
        nb3: usize,
        offset: usize,
    ) -> TensorId {
        let v = self.view_impl(src, &[ne0, ne1, ne2, ne3], offset);
        let t = self.tensor_mut(v);
        t.nb[1] = nb1;
        t.nb[2] = nb2;
        t.nb[3] = nb3;
        v
    }

    pub fn reshape(&mut self, src: TensorId, ne: &[i64]) -> TensorId {
        let t = self.tensor(src);
        assert!(t.is_contiguous(), "reshape requires a contiguous base");
        let nelem: i64 = ne.iter().product();
        assert_eq!(t.nelements(), nelem, "reshape must preserve element count");
        let v = self.view_impl(src, ne, 0);
        self.tensor_mut(v).op = Op::Reshape;
        v
    }

    pub fn reshape_1d(&mut self, src: TensorId, ne0: i64) -> TensorId {
        self.reshape(src, &[ne0])
    }

    pub fn reshape_2d(&mut self, src: TensorId, ne0: i64, ne1: i64) -> TensorId {
        self.reshape(src, &[ne0, ne1])
    }

    pub fn reshape_3d(&mut self, src: TensorId, ne0: i64, ne1: i64, ne2: i64) -> TensorId {
        self.reshape(src, &[ne0, ne1, ne2])
    }

    pub fn reshape_4d(&mut self, src: TensorId, ne0: i64, ne1: i64, ne2: i64, ne3: i64) -> TensorId {
        self.reshape(src, &[ne0, ne1, ne2, ne3])
    }

    pub fn permute(&mut self, src: TensorId, axes: [usize; MAX_DIMS]) -> TensorId {
        {
            let mut seen = [false; MAX_DIMS];
            for &a in &axes {
                assert!(a < MAX_DIMS && !seen[a], "invalid permutation {:?}", axes);
                seen[a] = true;
            }
        }
        let base = self.tensor(src).clone();
        let v = self.view_impl(src, &[base.ne[0], base.ne[1], base.ne[2], base.ne[3]], 0);
        let t = self.tensor_mut(v);
        for i in 0..MAX_DIMS {
            t.ne[axes[i]] = base.ne[i];
            t.nb[axes[i]] = base.nb[i];
        }
        t.op = Op::Permute;
        t.params = OpParams::Permute { axes };
        v
    }

    /// Swap the two fastest axes.
    pub fn transpose(&mut self, src: TensorId) -> TensorId {
        let v = self.permute(src, [1, 0, 2, 3]);
        self.tensor_mut(v).op = Op::Transpose;
        v
    }

    // ---- payload access ----------------------------------------------------

    /// Raw payload pointer. Panics for `no_alloc` descriptors that were
    /// never bound.
    #[inline]
    pub(crate) fn data_ptr(&self, id: TensorId) -> *mut u8 {
        let t = self.tensor(id);
        match t.data {
            DataRef::Arena(offs) => unsafe { self.arena.ptr(offs) },
            DataRef::Unset => panic!("tensor '{}' has no payload (no_alloc)", t.name),
        }
    }

    pub fn has_data(&self, id: TensorId) -> bool {
        self.tensor(id).data != DataRef::Unset
    }

    pub fn bytes(&self, id: TensorId) -> &[u8] {
        let t = self.tensor(id);
        assert!(t.is_contiguous());
        unsafe { std::slice::from_raw_parts(self.data_ptr(id), t.nbytes()) }
    }

    pub fn bytes_mut(&mut self, id: TensorId) -> &mut [u8] {
        let t = self.tensor(id);
        assert!(t.is_contiguous());
        let n = t.nbytes();
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(id), n) }
    }

    pub fn f32s(&self, id: TensorId) -> &[f32] {
        let t = self.tensor(id);
        assert_eq!(t.dtype, DType::F32);
        assert!(t.is_contiguous());
        unsafe { std::slice::from_raw_parts(self.data_ptr(id) as *const f32, t.nelements() as usize) }
    }

    pub fn f32s_mut(&mut self, id: TensorId) -> &mut [f32] {
        let t = self.tensor(id);
        assert_eq!(t.dtype, DType::F32);
        assert!(t.is_contiguous());
        let n = t.nelements() as usize;
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(id) as *mut f32, n) }
    }

    pub fn i32s(&self, id: TensorId) -> &[i32] {
        let t = self.tensor(id);
        assert_eq!(t.dtype, DType::I32);
        assert!(t.is_contiguous());
        unsafe { std::slice::from_raw_parts(self.data_ptr(id) as *const i32, t.nelements() as usize) }
    }

    pub fn i32s_mut(&mut self, id: TensorId) -> &mut [i32] {
        let t = self.tensor(id);
        assert_eq!(t.dtype, DType::I32);
        assert!(t.is_contiguous());
        let n = t.nelements() as usize;
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(id) as *mut i32, n) }
    }

    /// Fill a contiguous F32 tensor with one value.
    pub fn fill_f32(&mut self, id: TensorId, value: f32) {
        self.f32s_mut(id).fill(value);
    }

    pub fn zero(&mut self, id: TensorId) {
        self.bytes_mut(id).fill(0);
    }
}

pub(crate) fn with_src(srcs: &[TensorId]) -> [Option<TensorId>; MAX_SRC] {
    let mut out = [None; MAX_SRC];
    for (i, &s) in srcs.iter().enumerate() {
        out[i] = Some(s);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_invariants() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let t = ctx.new_tensor_3d(DType::F32, 8, 3, 2);
        let t = ctx.tensor(t);
        assert_eq!(t.nb, [4, 32, 96, 192]);
        assert_eq!(t.nbytes(), 192);

        let q = ctx.new_tensor_2d(DType::Q4_0, 64, 5);
        let q = ctx.tensor(q);
        assert_eq!(q.nb[0], 18);
        assert_eq!(q.nb[1], 36);
    }

    #[test]
    fn views_share_payload() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let base = ctx.from_slice_f32(&[4, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let row1 = ctx.view_1d(base, 4, 16);
        assert_eq!(ctx.f32s(row1), &[4.0, 5.0, 6.0, 7.0]);

        let tr = ctx.transpose(base);
        let t = ctx.tensor(tr);
        assert_eq!(t.ne[0], 2);
        assert_eq!(t.ne[1], 4);
        assert!(t.is_transposed());
    }

    #[test]
    fn reset_keeps_buffer() {
        let mut ctx = Context::with_size(1 << 16).unwrap();
        ctx.new_tensor_1d(DType::F32, 128);
        assert!(ctx.used_mem() > 0);
        ctx.reset();
        assert_eq!(ctx.used_mem(), 0);
        assert_eq!(ctx.n_tensors(), 0);
    }

    #[test]
    fn lookup_by_name() {
        let mut ctx = Context::with_size(1 << 16).unwrap();
        let t = ctx.new_tensor_1d(DType::F32, 4);
        ctx.set_name(t, "weights.0");
        assert_eq!(ctx.find("weights.0"), Some(t));
        assert_eq!(ctx.find("missing"), None);
    }
}
