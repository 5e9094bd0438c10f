//! Single-threaded task dispatcher
//!
//! Every mutation of session state happens on one dedicated thread. Other
//! threads never touch that state directly: they append a task through a
//! [`Scheduler`] handle or raise one of the three [`Signal`] flags, and the
//! dispatcher loop picks the work up on its next sweep.
//!
//! Tasks submitted from one thread run in submission order. Tasks from
//! different threads interleave, but each runs to completion before the next
//! one starts.

use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::constants::DISPATCHER_TICK;
use crate::worker::{StopFlag, Worker};

/// Work-pending flags swept by the dispatcher loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Scheduled tasks are waiting
    Schedule,
    /// One frame of microphone audio is ready to encode
    InputReady,
    /// The playback queue holds frames to decode
    OutputReady,
}

impl Signal {
    /// Sweep order of the loop
    pub const ALL: [Signal; 3] = [Signal::Schedule, Signal::InputReady, Signal::OutputReady];

    fn index(self) -> usize {
        match self {
            Signal::Schedule => 0,
            Signal::InputReady => 1,
            Signal::OutputReady => 2,
        }
    }
}

/// Handlers for the audio signals, implemented by the dispatcher's context
pub trait SignalHandler: Send + 'static {
    fn on_input_ready(&mut self);
    fn on_output_ready(&mut self);
}

/// Tag used by the abort de-duplication rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    General,
    AbortSpeaking,
}

type TaskFn<C> = Box<dyn FnOnce(&mut C) + Send>;

struct PendingTask<C> {
    kind: TaskKind,
    run: TaskFn<C>,
}

struct Shared<C> {
    tasks: Mutex<Vec<PendingTask<C>>>,
    flags: [AtomicBool; 3],
}

/// Cloneable, thread-safe handle for submitting work to the dispatcher
pub struct Scheduler<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: 'static> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(Vec::new()),
                flags: [AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)],
            }),
        }
    }

    /// Append a task and raise the schedule signal
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.push(TaskKind::General, Box::new(task));
    }

    /// Append an abort-speaking task unless one is already pending
    ///
    /// Returns `false` when the task was collapsed into the pending one.
    pub fn schedule_abort<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        {
            let mut tasks = self.shared.tasks.lock();
            if tasks.iter().any(|t| t.kind == TaskKind::AbortSpeaking) {
                tracing::debug!("Abort already pending, dropping duplicate");
                return false;
            }
            tasks.push(PendingTask {
                kind: TaskKind::AbortSpeaking,
                run: Box::new(task),
            });
        }
        self.raise(Signal::Schedule);
        true
    }

    fn push(&self, kind: TaskKind, run: TaskFn<C>) {
        self.shared.tasks.lock().push(PendingTask { kind, run });
        self.raise(Signal::Schedule);
    }

    /// Raise a signal flag; safe from any thread
    pub fn raise(&self, signal: Signal) {
        self.shared.flags[signal.index()].store(true, Ordering::Release);
    }

    /// Number of tasks waiting for the next sweep
    pub fn pending(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    fn take_raised(&self, signal: Signal) -> bool {
        self.shared.flags[signal.index()].swap(false, Ordering::AcqRel)
    }

    fn drain(&self) -> Vec<PendingTask<C>> {
        std::mem::take(&mut *self.shared.tasks.lock())
    }
}

/// The dispatcher thread and the context it owns
pub struct Dispatcher<C> {
    scheduler: Scheduler<C>,
    worker: Option<Worker<C>>,
}

impl<C: SignalHandler> Dispatcher<C> {
    /// Move `context` onto a new dispatcher thread fed by `scheduler`
    pub fn spawn(scheduler: Scheduler<C>, context: C) -> std::io::Result<Self> {
        Self::spawn_with_tick(scheduler, context, DISPATCHER_TICK)
    }

    pub fn spawn_with_tick(
        scheduler: Scheduler<C>,
        context: C,
        tick: Duration,
    ) -> std::io::Result<Self> {
        let loop_scheduler = scheduler.clone();
        let worker = Worker::spawn("dispatcher", move |stop| {
            run_loop(loop_scheduler, context, stop, tick)
        })?;

        Ok(Self {
            scheduler,
            worker: Some(worker),
        })
    }

    pub fn scheduler(&self) -> Scheduler<C> {
        self.scheduler.clone()
    }

    /// Stop the loop and hand back the context if the thread exits in time
    pub fn shutdown(mut self, timeout: Duration) -> Option<C> {
        self.worker.take().and_then(|worker| worker.stop(timeout))
    }
}

fn run_loop<C: SignalHandler>(
    scheduler: Scheduler<C>,
    mut context: C,
    stop: StopFlag,
    tick: Duration,
) -> C {
    tracing::info!("Dispatcher loop started");

    while !stop.is_stopped() {
        for signal in Signal::ALL {
            if !scheduler.take_raised(signal) {
                continue;
            }
            match signal {
                Signal::Schedule => run_tasks(&scheduler, &mut context),
                Signal::InputReady => {
                    guarded("input handler", || context.on_input_ready());
                }
                Signal::OutputReady => {
                    guarded("output handler", || context.on_output_ready());
                }
            }
        }
        thread::sleep(tick);
    }

    tracing::info!("Dispatcher loop stopped");
    context
}

fn run_tasks<C>(scheduler: &Scheduler<C>, context: &mut C)
where
    C: 'static,
{
    for task in scheduler.drain() {
        let run = task.run;
        guarded("scheduled task", || run(context));
    }
}

fn guarded<F: FnOnce()>(what: &str, f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!("Dispatcher {} panicked: {}", what, panic_message(&payload));
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[derive(Default)]
    struct Recorder {
        executed: Vec<(usize, usize, Option<String>)>,
        aborts: usize,
        inputs: usize,
        outputs: usize,
    }

    impl SignalHandler for Recorder {
        fn on_input_ready(&mut self) {
            self.inputs += 1;
        }

        fn on_output_ready(&mut self) {
            self.outputs += 1;
            if self.outputs == 1 {
                panic!("first output batch fails");
            }
        }
    }

    fn flush(scheduler: &Scheduler<Recorder>) {
        let (tx, rx) = bounded(1);
        scheduler.schedule(move |_| {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_tasks_run_once_in_per_thread_order() {
        let scheduler = Scheduler::new();
        let dispatcher = Dispatcher::spawn(scheduler.clone(), Recorder::default()).unwrap();

        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let scheduler = scheduler.clone();
                thread::spawn(move || {
                    for seq in 0..250 {
                        scheduler.schedule(move |r: &mut Recorder| {
                            let name = thread::current().name().map(str::to_string);
                            r.executed.push((producer, seq, name));
                        });
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        flush(&scheduler);

        let recorder = dispatcher.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(recorder.executed.len(), 1000);
        for producer in 0..4 {
            let seqs: Vec<usize> = recorder
                .executed
                .iter()
                .filter(|(p, _, _)| *p == producer)
                .map(|(_, s, _)| *s)
                .collect();
            assert_eq!(seqs, (0..250).collect::<Vec<_>>());
        }
        assert!(recorder
            .executed
            .iter()
            .all(|(_, _, name)| name.as_deref() == Some("dispatcher")));
    }

    #[test]
    fn test_duplicate_aborts_collapse() {
        let scheduler: Scheduler<Recorder> = Scheduler::new();
        assert!(scheduler.schedule_abort(|r| r.aborts += 1));
        for _ in 0..5 {
            assert!(!scheduler.schedule_abort(|r| r.aborts += 1));
        }
        scheduler.schedule(|r| r.executed.push((0, 0, None)));
        assert_eq!(scheduler.pending(), 2);

        let dispatcher = Dispatcher::spawn(scheduler.clone(), Recorder::default()).unwrap();
        flush(&scheduler);

        // Once drained, a new abort is accepted again
        assert!(scheduler.schedule_abort(|r| r.aborts += 1));
        flush(&scheduler);

        let recorder = dispatcher.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(recorder.aborts, 2);
        assert_eq!(recorder.executed.len(), 1);
    }

    #[test]
    fn test_panicking_task_does_not_stop_loop() {
        let scheduler = Scheduler::new();
        let dispatcher = Dispatcher::spawn(scheduler.clone(), Recorder::default()).unwrap();

        scheduler.schedule(|_: &mut Recorder| panic!("task failure"));
        scheduler.schedule(|r: &mut Recorder| r.executed.push((1, 1, None)));
        flush(&scheduler);

        let recorder = dispatcher.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(recorder.executed.len(), 1);
    }

    #[test]
    fn test_signals_invoke_handlers() {
        let scheduler = Scheduler::new();
        let dispatcher = Dispatcher::spawn(scheduler.clone(), Recorder::default()).unwrap();

        scheduler.raise(Signal::InputReady);
        scheduler.raise(Signal::OutputReady);
        thread::sleep(Duration::from_millis(50));
        scheduler.raise(Signal::OutputReady);
        thread::sleep(Duration::from_millis(50));
        flush(&scheduler);

        let recorder = dispatcher.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(recorder.inputs, 1);
        // The first output handler panicked, the loop kept going
        assert_eq!(recorder.outputs, 2);
    }
}
