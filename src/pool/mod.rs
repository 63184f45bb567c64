//! Fork-join thread pool: persistent OS workers, graph kickoff through a
//! sequence counter, a two-counter spin barrier between nodes, chunk
//! stealing for matmul and cooperative cancellation.
//!
//! The calling thread always takes the role of worker 0.

use crate::context::Context;
use crate::errors::SlipResult;
use crate::graph::planner::{AbortCallback, Plan};
use crate::graph::Graph;
use crate::kernels::{self, ComputeParams};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Wrapper that keeps each hot atomic on its own cache line.
#[repr(align(64))]
pub(crate) struct Aligned<T>(pub T);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    AllocFailed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPriority {
    #[default]
    Normal,
    Medium,
    High,
    Realtime,
}

#[derive(Clone)]
pub struct ThreadPoolParams {
    pub n_threads: usize,
    /// Busy-poll iterations before a worker sleeps on the condvar.
    pub poll: u32,
    pub priority: SchedPriority,
    /// One entry per logical CPU; workers are placed on the set bits.
    pub cpumask: Option<Vec<bool>>,
    /// Pin each worker to one CPU of the mask instead of sharing it.
    pub strict_cpu: bool,
}

impl Default for ThreadPoolParams {
    fn default() -> Self {
        ThreadPoolParams {
            n_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            poll: 50_000,
            priority: SchedPriority::Normal,
            cpumask: None,
            strict_cpu: false,
        }
    }
}

impl ThreadPoolParams {
    pub fn with_threads(n_threads: usize) -> Self {
        ThreadPoolParams {
            n_threads,
            ..Default::default()
        }
    }
}

const ST_SUCCESS: u8 = 0;
const ST_ALLOC_FAILED: u8 = 1;
#[allow(dead_code)]
const ST_FAILED: u8 = 2;
const ST_ABORTED: u8 = 3;

#[derive(Clone, Copy)]
pub(crate) struct Job {
    ctx: *const Context,
    graph: *const Graph,
    n_tasks: *const usize,
    n_nodes: usize,
    work: *mut u8,
    work_size: usize,
}

// The job only lives while `compute` blocks on the final barrier; workers
// never dereference it after that.
unsafe impl Send for Job {}

pub(crate) struct Shared {
    pub graph_seq: Aligned<AtomicU32>,
    barrier_enter: Aligned<AtomicU32>,
    barrier_pass: Aligned<AtomicU32>,
    /// Next unclaimed matmul chunk; fetch-add gives stealing.
    pub current_chunk: Aligned<AtomicUsize>,
    pub n_threads_cur: AtomicUsize,
    pub abort: AtomicBool,
    stop: AtomicBool,
    pause: AtomicBool,
    status: AtomicU8,
    job: Mutex<Option<Job>>,
    cv: Condvar,
    poll: u32,
}

impl Shared {
    fn new(poll: u32) -> Shared {
        Shared {
            graph_seq: Aligned(AtomicU32::new(0)),
            barrier_enter: Aligned(AtomicU32::new(0)),
            barrier_pass: Aligned(AtomicU32::new(0)),
            current_chunk: Aligned(AtomicUsize::new(0)),
            n_threads_cur: AtomicUsize::new(1),
            abort: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            status: AtomicU8::new(ST_SUCCESS),
            job: Mutex::new(None),
            cv: Condvar::new(),
            poll,
        }
    }

    /// Two-counter reusable barrier: the last thread to arrive resets the
    /// entry counter and bumps the pass generation; everyone else spins on
    /// the generation change. The SeqCst pass update publishes all writes
    /// made before the barrier to every worker.
    pub fn barrier(&self) {
        let n = self.n_threads_cur.load(Ordering::SeqCst) as u32;
        if n <= 1 {
            return;
        }
        let pass_before = self.barrier_pass.0.load(Ordering::SeqCst);
        let arrived = self.barrier_enter.0.fetch_add(1, Ordering::SeqCst) + 1;
        if arrived == n {
            self.barrier_enter.0.store(0, Ordering::SeqCst);
            self.barrier_pass.0.fetch_add(1, Ordering::SeqCst);
        } else {
            let mut spins = 0u32;
            while self.barrier_pass.0.load(Ordering::SeqCst) == pass_before {
                spins = spins.wrapping_add(1);
                if spins % (1 << 14) == 0 {
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn set_status(&self, st: u8) {
        self.status.store(st, Ordering::SeqCst);
    }

    /// Busy-poll then sleep until the graph sequence moves past
    /// `last_seq`. Returns the new sequence and the job, or `None` on
    /// stop.
    fn wait_for_work(&self, last_seq: u32) -> Option<(u32, Option<Job>)> {
        for _ in 0..self.poll {
            if self.stop.load(Ordering::Acquire) {
                return None;
            }
            if self.graph_seq.0.load(Ordering::SeqCst) != last_seq
                && !self.pause.load(Ordering::Acquire)
            {
                break;
            }
            std::hint::spin_loop();
        }
        let mut guard = self.job.lock().unwrap();
        loop {
            if self.stop.load(Ordering::Acquire) {
                return None;
            }
            let seq = self.graph_seq.0.load(Ordering::SeqCst);
            if seq != last_seq && !self.pause.load(Ordering::Acquire) {
                return Some((seq, *guard));
            }
            guard = self.cv.wait(guard).unwrap();
        }
    }
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(params: ThreadPoolParams) -> SlipResult<ThreadPool> {
        let n_threads = params.n_threads.max(1);
        let shared = Arc::new(Shared::new(params.poll));
        let mut workers = Vec::with_capacity(n_threads - 1);
        for ith in 1..n_threads {
            let shared = Arc::clone(&shared);
            let params = params.clone();
            let handle = std::thread::Builder::new()
                .name(format!("slipstream-worker-{ith}"))
                .spawn(move || worker_main(shared, params, ith))?;
            workers.push(handle);
        }
        debug!(n_threads, "thread pool up");
        Ok(ThreadPool { shared, workers })
    }

    pub fn n_threads(&self) -> usize {
        self.workers.len() + 1
    }

    pub fn pause(&self) {
        self.shared.pause.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.pause.store(false, Ordering::Release);
        self.shared.cv.notify_all();
    }

    /// Evaluate `graph` in topological order. Blocks until every node ran
    /// (or the abort callback fired). One graph executes at a time per
    /// pool, which the exclusive borrow encodes.
    pub fn compute(&mut self, ctx: &Context, graph: &Graph, plan: &mut Plan) -> Status {
        if plan.n_tasks.len() != graph.nodes.len() {
            warn!(
                plan_nodes = plan.n_tasks.len(),
                graph_nodes = graph.nodes.len(),
                "plan does not match graph"
            );
            return Status::Failed;
        }
        let work_words = (plan.work_size + 7) / 8;
        if plan.work.len() < work_words {
            if plan.work.try_reserve(work_words - plan.work.len()).is_err() {
                return Status::AllocFailed;
            }
            plan.work.resize(work_words, 0);
        }

        let n_threads = plan.n_threads.min(self.n_threads()).max(1);
        let job = Job {
            ctx,
            graph,
            n_tasks: plan.n_tasks.as_ptr(),
            n_nodes: graph.nodes.len(),
            work: plan.work.as_mut_ptr() as *mut u8,
            work_size: plan.work.len() * 8,
        };

        {
            let mut guard = self.shared.job.lock().unwrap();
            *guard = Some(job);
            self.shared.abort.store(false, Ordering::SeqCst);
            self.shared.set_status(ST_SUCCESS);
            self.shared.n_threads_cur.store(n_threads, Ordering::SeqCst);
            self.shared
                .current_chunk
                .0
                .store(n_threads, Ordering::SeqCst);
            self.shared.pause.store(false, Ordering::SeqCst);
            // kickoff: the sequence bump is what workers watch for
            self.shared.graph_seq.0.fetch_add(1, Ordering::SeqCst);
            self.shared.cv.notify_all();
        }

        unsafe { run_graph(&self.shared, &job, 0, plan.abort.as_ref()) };

        *self.shared.job.lock().unwrap() = None;
        match self.shared.status.load(Ordering::SeqCst) {
            ST_SUCCESS => Status::Success,
            ST_ALLOC_FAILED => Status::AllocFailed,
            ST_ABORTED => Status::Aborted,
            _ => Status::Failed,
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn worker_main(shared: Arc<Shared>, params: ThreadPoolParams, ith: usize) {
    apply_priority(params.priority);
    if let Some(mask) = &params.cpumask {
        apply_affinity(mask, ith, params.strict_cpu);
    }
    let mut last_seq = 0u32;
    loop {
        let Some((seq, job)) = shared.wait_for_work(last_seq) else {
            return;
        };
        last_seq = seq;
        let Some(job) = job else {
            continue;
        };
        if ith < shared.n_threads_cur.load(Ordering::SeqCst) {
            unsafe { run_graph(&shared, &job, ith, None) };
        }
    }
}

/// Per-thread graph walk. A barrier separates every pair of nodes; thread 0
/// polls the abort callback after each node, and an abort observed at the
/// top of the loop makes every thread leave together.
unsafe fn run_graph(shared: &Shared, job: &Job, ith: usize, abort_cb: Option<&AbortCallback>) {
    let ctx = &*job.ctx;
    let graph = &*job.graph;
    let nth_total = shared.n_threads_cur.load(Ordering::SeqCst);
    let n_tasks_all = std::slice::from_raw_parts(job.n_tasks, job.n_nodes);

    for i in 0..job.n_nodes {
        if shared.abort.load(Ordering::SeqCst) {
            break;
        }
        let node = graph.nodes[i];
        let n_tasks = n_tasks_all[i].min(nth_total);
        if ith < n_tasks {
            let params = ComputeParams {
                ith,
                nth: n_tasks,
                work: job.work,
                work_size: job.work_size,
                shared,
            };
            kernels::compute_forward(&params, ctx, node);
        }
        if ith == 0 {
            if let Some(cb) = abort_cb {
                if cb() {
                    shared.abort.store(true, Ordering::SeqCst);
                    shared.set_status(ST_ABORTED);
                }
            }
        }
        shared.barrier();
    }
}

fn apply_priority(prio: SchedPriority) {
    use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
    let value: u8 = match prio {
        SchedPriority::Normal => return,
        SchedPriority::Medium => 40,
        SchedPriority::High => 60,
        SchedPriority::Realtime => 99,
    };
    match ThreadPriorityValue::try_from(value) {
        Ok(v) => {
            if set_current_thread_priority(ThreadPriority::Crossplatform(v)).is_err() {
                warn!("failed to raise thread priority (best effort)");
            }
        }
        Err(_) => warn!("invalid thread priority value {value}"),
    }
}

#[cfg(target_os = "linux")]
fn apply_affinity(mask: &[bool], ith: usize, strict: bool) {
    let cpus: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter_map(|(i, &on)| on.then_some(i))
        .collect();
    if cpus.is_empty() {
        return;
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        if strict {
            libc::CPU_SET(cpus[ith % cpus.len()], &mut set);
        } else {
            for &c in &cpus {
                libc::CPU_SET(c, &mut set);
            }
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!("sched_setaffinity failed (best effort)");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_affinity(_mask: &[bool], _ith: usize, _strict: bool) {}

/// One-shot evaluation: plan for `n_threads`, spin up a pool, run, tear
/// down.
pub fn compute_with_ctx(ctx: &Context, graph: &Graph, n_threads: usize) -> Status {
    let mut plan = crate::graph::planner::plan(ctx, graph, n_threads);
    match ThreadPool::new(ThreadPoolParams::with_threads(n_threads)) {
        Ok(mut pool) => pool.compute(ctx, graph, &mut plan),
        Err(_) => Status::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_runs_simple_graph() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let a = ctx.from_slice_f32(&[4], &[1.0, 2.0, 3.0, 4.0]);
        let b = ctx.from_slice_f32(&[4], &[10.0, 20.0, 30.0, 40.0]);
        let c = ctx.add(a, b);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, c).unwrap();
        let st = compute_with_ctx(&ctx, &g, 2);
        assert_eq!(st, Status::Success);
        assert_eq!(ctx.f32s(c), &[11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn abort_between_nodes() {
        let mut ctx = Context::with_size(1 << 20).unwrap();
        let a = ctx.from_slice_f32(&[4], &[1.0, -2.0, 3.0, -4.0]);
        let b = ctx.relu(a);
        let c = ctx.neg(b);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, c).unwrap();

        let mut plan = crate::graph::planner::plan(&ctx, &g, 1);
        plan.set_abort_callback(Arc::new(|| true));
        let mut pool = ThreadPool::new(ThreadPoolParams::with_threads(1)).unwrap();
        let st = pool.compute(&ctx, &g, &mut plan);
        assert_eq!(st, Status::Aborted);
        // first node completed before the callback fired
        assert_eq!(ctx.f32s(b), &[1.0, 0.0, 3.0, 0.0]);
    }

    #[test]
    fn same_result_across_thread_counts() {
        let mut ctx = Context::with_size(1 << 22).unwrap();
        let vals: Vec<f32> = (0..64 * 8).map(|i| (i as f32 * 0.1).sin()).collect();
        let a = ctx.from_slice_f32(&[64, 8], &vals);
        let sm = ctx.soft_max(a);
        let mut g = Graph::new(8);
        g.build_forward_expand(&ctx, sm).unwrap();
        assert_eq!(compute_with_ctx(&ctx, &g, 1), Status::Success);
        let one: Vec<f32> = ctx.f32s(sm).to_vec();
        assert_eq!(compute_with_ctx(&ctx, &g, 4), Status::Success);
        let four: Vec<f32> = ctx.f32s(sm).to_vec();
        for (x, y) in one.iter().zip(&four) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn atomics_stay_cache_aligned() {
        assert_eq!(std::mem::align_of::<Aligned<AtomicU32>>(), 64);
    }
}
