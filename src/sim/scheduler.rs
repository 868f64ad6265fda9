//! Task Scheduler
//!
//! Each tick the enabled systems build a task graph rooted at a single begin
//! handle. Three task shapes exist:
//!
//! - **main thread**: runs once on the driving thread with `&mut Frame`.
//! - **array**: a known element count split into at most one slice per
//!   worker, run on the pool against `&Frame`.
//! - **threaded**: workers claim fixed-size chunks from an atomic cursor
//!   until the element count is exhausted.
//!
//! Parallel bodies only read the frame. Each returns a value per slice or
//! chunk, and an `apply` step folds those into the frame on the driving
//! thread in index order, so the result never depends on worker timing.
//!
//! Tasks execute in handle order. A task whose dependency failed is skipped,
//! except a [`settle`](TaskContext::settle) barrier, which only waits.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{error, warn};

use crate::sim::frame::{Frame, Tick};

/// Handle to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskHandle(usize);

/// Task shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Graph root.
    Begin,
    /// Single main-thread body.
    MainThread,
    /// Sliced over a known count.
    Array,
    /// Chunks claimed from a shared cursor.
    Threaded,
    /// Waits on several tasks.
    Join,
    /// Orders after a task whatever its outcome.
    Settle,
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Body returned `Ok`.
    Completed,
    /// Body returned an error.
    Failed,
    /// A dependency did not complete.
    Skipped,
}

type TaskBody<'a> = Box<dyn FnOnce(&mut Frame, &ThreadPool) -> anyhow::Result<()> + 'a>;

struct Task<'a> {
    name: String,
    kind: TaskKind,
    deps: Vec<usize>,
    body: Option<TaskBody<'a>>,
}

impl Task<'_> {
    fn blocked(&self, outcomes: &[TaskOutcome]) -> bool {
        if self.kind == TaskKind::Settle {
            return false;
        }
        self.deps
            .iter()
            .any(|&d| outcomes.get(d).copied() != Some(TaskOutcome::Completed))
    }
}

/// Per-tick task graph under construction.
#[derive(Default)]
pub struct TaskContext<'a> {
    tasks: Vec<Task<'a>>,
}

impl<'a> TaskContext<'a> {
    /// Empty graph.
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Number of tasks so far.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if nothing was scheduled.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.tasks.truncate(len);
    }

    fn push(&mut self, name: String, kind: TaskKind, deps: Vec<usize>, body: Option<TaskBody<'a>>) -> TaskHandle {
        self.tasks.push(Task { name, kind, deps, body });
        TaskHandle(self.tasks.len() - 1)
    }

    /// Graph root.
    pub fn begin(&mut self) -> TaskHandle {
        self.push("begin".into(), TaskKind::Begin, Vec::new(), None)
    }

    /// Wait on several handles.
    pub fn join(&mut self, name: impl Into<String>, after: &[TaskHandle]) -> TaskHandle {
        let deps = after.iter().map(|h| h.0).collect();
        self.push(name.into(), TaskKind::Join, deps, None)
    }

    /// Barrier after `after` that completes even when `after` failed or was
    /// skipped. Tasks chained on it keep their order without inheriting the
    /// failure.
    pub fn settle(&mut self, name: impl Into<String>, after: TaskHandle) -> TaskHandle {
        self.push(name.into(), TaskKind::Settle, vec![after.0], None)
    }

    /// Run `body` on the driving thread.
    pub fn add_main_thread<F>(&mut self, name: impl Into<String>, after: TaskHandle, body: F) -> TaskHandle
    where
        F: FnOnce(&mut Frame) -> anyhow::Result<()> + 'a,
    {
        self.push(
            name.into(),
            TaskKind::MainThread,
            vec![after.0],
            Some(Box::new(move |frame, _pool| body(frame))),
        )
    }

    /// Split `0..count` into at most one slice per worker, run `body` on each
    /// slice in parallel, then `apply` the per-slice results in slice order.
    pub fn add_array<T, B, A>(
        &mut self,
        name: impl Into<String>,
        after: TaskHandle,
        count: usize,
        body: B,
        apply: A,
    ) -> TaskHandle
    where
        T: Send,
        B: Fn(&Frame, Range<usize>) -> anyhow::Result<T> + Send + Sync + 'a,
        A: FnOnce(&mut Frame, Vec<T>) -> anyhow::Result<()> + 'a,
    {
        let run = move |frame: &mut Frame, pool: &ThreadPool| {
            let slices = slice_ranges(count, pool.current_num_threads());
            let shared: &Frame = frame;
            let results: anyhow::Result<Vec<T>> =
                pool.install(|| slices.into_par_iter().map(|range| body(shared, range)).collect());
            apply(frame, results?)
        };
        self.push(name.into(), TaskKind::Array, vec![after.0], Some(Box::new(run)))
    }

    /// Let workers claim `chunk`-sized ranges of `0..count(frame)` from a
    /// shared cursor, then `apply` the per-chunk results in index order.
    pub fn add_threaded<T, C, B, A>(
        &mut self,
        name: impl Into<String>,
        after: TaskHandle,
        chunk: usize,
        count: C,
        body: B,
        apply: A,
    ) -> TaskHandle
    where
        T: Send,
        C: FnOnce(&Frame) -> usize + 'a,
        B: Fn(&Frame, Range<usize>) -> anyhow::Result<T> + Send + Sync + 'a,
        A: FnOnce(&mut Frame, Vec<T>) -> anyhow::Result<()> + 'a,
    {
        let run = move |frame: &mut Frame, pool: &ThreadPool| {
            let total = count(frame);
            let chunk = chunk.max(1);
            let workers = pool.current_num_threads().max(1);
            let cursor = AtomicUsize::new(0);
            let shared: &Frame = frame;

            let per_worker: Vec<anyhow::Result<Vec<(usize, T)>>> = pool.install(|| {
                (0..workers)
                    .into_par_iter()
                    .map(|_| {
                        let mut claimed = Vec::new();
                        loop {
                            let start = cursor.fetch_add(chunk, Ordering::Relaxed);
                            if start >= total {
                                break;
                            }
                            let end = (start + chunk).min(total);
                            claimed.push((start, body(shared, start..end)?));
                        }
                        Ok(claimed)
                    })
                    .collect()
            });

            let mut chunks = Vec::new();
            for claimed in per_worker {
                chunks.extend(claimed?);
            }
            chunks.sort_unstable_by_key(|(start, _)| *start);
            apply(frame, chunks.into_iter().map(|(_, value)| value).collect())
        };
        self.push(name.into(), TaskKind::Threaded, vec![after.0], Some(Box::new(run)))
    }

    /// Run every task in handle order. Returns the number that failed.
    pub fn execute(self, frame: &mut Frame, pool: &ThreadPool, profiler: &Profiler) -> usize {
        let mut outcomes: Vec<TaskOutcome> = Vec::with_capacity(self.tasks.len());
        let mut failed = 0;

        for task in self.tasks {
            let blocked = task.blocked(&outcomes);

            let started = Instant::now();
            let outcome = if blocked {
                warn!(task = %task.name, "Skipping task: dependency did not complete");
                TaskOutcome::Skipped
            } else {
                match task.body {
                    None => TaskOutcome::Completed,
                    Some(body) => match body(frame, pool) {
                        Ok(()) => TaskOutcome::Completed,
                        Err(e) => {
                            error!(task = %task.name, tick = frame.number(), "Task failed: {:#}", e);
                            failed += 1;
                            TaskOutcome::Failed
                        }
                    },
                }
            };

            if task.kind != TaskKind::Begin {
                profiler.record(TaskSample {
                    name: task.name,
                    kind: task.kind,
                    duration: started.elapsed(),
                    outcome,
                });
            }
            outcomes.push(outcome);
        }
        failed
    }
}

/// Split `0..count` into at most `slices` contiguous, near-equal ranges.
pub fn slice_ranges(count: usize, slices: usize) -> Vec<Range<usize>> {
    if count == 0 {
        return Vec::new();
    }
    let slices = slices.clamp(1, count);
    let base = count / slices;
    let extra = count % slices;
    let mut start = 0;
    (0..slices)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

// =============================================================================
// PROFILER
// =============================================================================

/// Timing of one task.
#[derive(Debug, Clone)]
pub struct TaskSample {
    /// Task name.
    pub name: String,
    /// Task shape.
    pub kind: TaskKind,
    /// Wall time.
    pub duration: Duration,
    /// Result.
    pub outcome: TaskOutcome,
}

/// Task timings of the last simulated tick.
#[derive(Debug, Default)]
pub struct Profiler {
    inner: Mutex<ProfilerState>,
}

#[derive(Debug, Default)]
struct ProfilerState {
    tick: Tick,
    samples: Vec<TaskSample>,
}

impl Profiler {
    /// Start a new tick, dropping the previous samples.
    pub fn begin_tick(&self, tick: Tick) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.tick = tick;
        state.samples.clear();
    }

    /// Record a sample.
    pub fn record(&self, sample: TaskSample) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .samples
            .push(sample);
    }

    /// Tick and samples of the last tick.
    pub fn last_tick(&self) -> (Tick, Vec<TaskSample>) {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        (state.tick, state.samples.clone())
    }

    /// Total task time of the last tick.
    pub fn total(&self) -> Duration {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .samples
            .iter()
            .map(|s| s.duration)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::context::tests::test_context;
    use crate::sim::entity::{Component, ComponentId};
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Counter(u32);

    impl Component for Counter {
        const ID: ComponentId = 9;
        const SIZE: usize = 4;
        fn encode(&self, out: &mut [u8]) {
            out.copy_from_slice(&self.0.to_le_bytes());
        }
        fn decode(bytes: &[u8]) -> Self {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(bytes);
            Counter(u32::from_le_bytes(raw))
        }
    }

    #[test]
    fn test_slice_ranges() {
        assert!(slice_ranges(0, 4).is_empty());
        assert_eq!(slice_ranges(3, 8), vec![0..1, 1..2, 2..3]);
        assert_eq!(slice_ranges(10, 3), vec![0..4, 4..7, 7..10]);
    }

    #[test]
    fn test_main_thread_order_and_skip() {
        let context = test_context();
        let mut frame = context.create_frame().unwrap();
        let order = std::cell::RefCell::new(Vec::new());

        let mut tasks = TaskContext::new();
        let begin = tasks.begin();
        let a = tasks.add_main_thread("a", begin, |_| {
            order.borrow_mut().push("a");
            Ok(())
        });
        let b = tasks.add_main_thread("b", a, |_| anyhow::bail!("boom"));
        let c = tasks.add_main_thread("c", b, |_| {
            order.borrow_mut().push("c");
            Ok(())
        });
        tasks.add_main_thread("d", a, |_| {
            order.borrow_mut().push("d");
            Ok(())
        });
        tasks.join("end", &[a, c]);

        let failed = tasks.execute(&mut frame, context.pool(), context.profiler());
        assert_eq!(failed, 1);
        assert_eq!(*order.borrow(), vec!["a", "d"]);

        let (_, samples) = context.profiler().last_tick();
        let outcomes: Vec<_> = samples.iter().map(|s| (s.name.as_str(), s.outcome)).collect();
        assert_eq!(
            outcomes,
            vec![
                ("a", TaskOutcome::Completed),
                ("b", TaskOutcome::Failed),
                ("c", TaskOutcome::Skipped),
                ("d", TaskOutcome::Completed),
                ("end", TaskOutcome::Skipped),
            ]
        );
    }

    #[test]
    fn test_settle_orders_without_skipping() {
        let context = test_context();
        let mut frame = context.create_frame().unwrap();
        let order = std::cell::RefCell::new(Vec::new());

        let mut tasks = TaskContext::new();
        let begin = tasks.begin();
        let a = tasks.add_main_thread("a", begin, |_| anyhow::bail!("boom"));
        let after_a = tasks.settle("a done", a);
        tasks.add_main_thread("b", after_a, |_| {
            order.borrow_mut().push("b");
            Ok(())
        });

        assert_eq!(tasks.execute(&mut frame, context.pool(), context.profiler()), 1);
        assert_eq!(*order.borrow(), vec!["b"]);
        let (_, samples) = context.profiler().last_tick();
        assert_eq!(samples[1].kind, TaskKind::Settle);
        assert_eq!(samples[1].outcome, TaskOutcome::Completed);
    }

    #[test]
    fn test_array_and_threaded_apply_in_order() {
        let context = test_context();
        let mut frame = context.create_frame().unwrap();
        let mut entities = Vec::new();
        for i in 0..37 {
            let e = frame.create().unwrap();
            frame.add(e, Counter(i)).unwrap();
            entities.push(e);
        }
        let entities_ref = &entities;

        let mut tasks = TaskContext::new();
        let begin = tasks.begin();
        let array = tasks.add_array(
            "double",
            begin,
            entities.len(),
            |frame, range| {
                range
                    .map(|i| Ok(frame.get::<Counter>(entities_ref[i])?.0 * 2))
                    .collect::<anyhow::Result<Vec<u32>>>()
            },
            |frame, slices| {
                for (i, value) in slices.into_iter().flatten().enumerate() {
                    frame.set(entities_ref[i], &Counter(value))?;
                }
                Ok(())
            },
        );
        tasks.add_threaded(
            "increment",
            array,
            5,
            |frame| frame.entities().count() as usize,
            |frame, range| {
                range
                    .map(|i| Ok(frame.get::<Counter>(entities_ref[i])?.0 + 1))
                    .collect::<anyhow::Result<Vec<u32>>>()
            },
            |frame, chunks| {
                for (i, value) in chunks.into_iter().flatten().enumerate() {
                    frame.set(entities_ref[i], &Counter(value))?;
                }
                Ok(())
            },
        );

        assert_eq!(tasks.execute(&mut frame, context.pool(), context.profiler()), 0);
        for (i, e) in entities.iter().enumerate() {
            assert_eq!(frame.get::<Counter>(*e).unwrap(), Counter(i as u32 * 2 + 1));
        }
    }

    proptest! {
        #[test]
        fn prop_slices_cover_range(count in 0usize..500, slices in 1usize..16) {
            let ranges = slice_ranges(count, slices);
            prop_assert!(ranges.len() <= slices);
            let mut next = 0;
            for range in &ranges {
                prop_assert_eq!(range.start, next);
                prop_assert!(!range.is_empty());
                next = range.end;
            }
            prop_assert_eq!(next, count);
        }
    }
}
