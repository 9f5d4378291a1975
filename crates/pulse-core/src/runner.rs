//! Per-tick cooperative runner with in-place tail compaction.
//!
//! A [`Runner`] owns the resumable operations registered for one scheduling
//! phase. Once per frame the host loop calls [`Runner::tick`], which advances
//! every live operation exactly once, compacts finished slots in place, and
//! then splices in registrations that arrived while the tick was running.
//! One failing operation never aborts the tick or its siblings: faults are
//! routed to a process-wide sink and the offending slot is dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::queue::RingQueue;
use crate::source::Fault;

/// Outcome of advancing a resumable operation by one step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The operation has more work; advance it again next tick.
    Running,
    /// The operation is done; its slot can be reclaimed.
    Finished,
}

/// A unit of resumable work driven once per tick.
///
/// Implementations hold their own suspended state explicitly (a counter, a
/// stage enum, a completion source being watched) and make one prompt,
/// non-blocking step per [`advance`](Self::advance) call. Any wait is
/// expressed as `Ok(Advance::Running)`, never as a blocking wait.
pub trait Resumable: Send {
    /// Make one step. An `Err` is treated as the operation finishing and is
    /// reported to the unhandled-fault sink.
    fn advance(&mut self) -> Result<Advance, Fault>;
}

type Slot = Option<Box<dyn Resumable>>;

/// Configuration for a [`Runner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Initial slot-array capacity; grows by doubling beyond this.
    pub initial_slots: usize,
    /// Initial staging-queue capacity for mid-tick registrations.
    pub staging_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            initial_slots: 16,
            staging_capacity: 4,
        }
    }
}

struct Slots {
    items: Vec<Slot>,
    /// One past the last occupied slot. Slots `0..tail` are occupied
    /// between ticks.
    tail: usize,
}

impl Slots {
    fn push(&mut self, op: Box<dyn Resumable>) {
        if self.tail == self.items.len() {
            let new_len = if self.items.is_empty() {
                4
            } else {
                match self.items.len().checked_mul(2) {
                    Some(doubled) => doubled,
                    None => panic!("runner slot array overflow"),
                }
            };
            self.items.resize_with(new_len, || None);
        }
        self.items[self.tail] = Some(op);
        self.tail += 1;
    }
}

struct Staging {
    ticking: bool,
    queue: RingQueue<Box<dyn Resumable>>,
}

type FaultHandler = dyn Fn(&'static str, &Fault) + Send + Sync;

static FAULT_SINK: Lazy<RwLock<Box<FaultHandler>>> =
    Lazy::new(|| RwLock::new(Box::new(default_fault_sink)));

fn default_fault_sink(phase: &'static str, fault: &Fault) {
    eprintln!("pulse: unhandled fault in phase {phase}: {fault}");
}

/// Install the process-wide unhandled-fault sink.
///
/// The sink receives the phase tag of the reporting runner and the fault of
/// any operation whose `advance` failed with nobody left to observe it. The
/// default writes to stderr.
pub fn set_fault_sink(sink: impl Fn(&'static str, &Fault) + Send + Sync + 'static) {
    *FAULT_SINK.write() = Box::new(sink);
}

fn report_fault(local: Option<&Arc<FaultHandler>>, phase: &'static str, fault: &Fault) {
    match local {
        Some(handler) => (**handler)(phase, fault),
        None => {
            let sink = FAULT_SINK.read();
            (**sink)(phase, fault);
        }
    }
}

/// Cooperative runner for one scheduling phase.
///
/// `tick` is only ever invoked by the owning host-loop thread, once per
/// phase per frame. `register` is safe from any thread at any time,
/// including from inside another operation's `advance` on the ticking
/// thread: registrations arriving during a tick are diverted to a staging
/// queue rather than mutating the slot array mid-scan.
pub struct Runner {
    phase: &'static str,
    slots: Mutex<Slots>,
    staging: Mutex<Staging>,
    fault_handler: RwLock<Option<Arc<FaultHandler>>>,
}

impl Runner {
    /// Create a runner for the given phase tag with default capacities.
    pub fn new(phase: &'static str) -> Self {
        Self::with_config(phase, RunnerConfig::default())
    }

    /// Create a runner with explicit capacities.
    pub fn with_config(phase: &'static str, config: RunnerConfig) -> Self {
        Self {
            phase,
            slots: Mutex::new(Slots {
                items: {
                    let mut items = Vec::new();
                    items.resize_with(config.initial_slots, || None);
                    items
                },
                tail: 0,
            }),
            staging: Mutex::new(Staging {
                ticking: false,
                queue: RingQueue::new(config.staging_capacity),
            }),
            fault_handler: RwLock::new(None),
        }
    }

    /// Phase tag this runner is associated with. Opaque to the core; the
    /// host loop uses it to decide when to tick.
    pub fn phase(&self) -> &'static str {
        self.phase
    }

    /// Route this runner's faults to `handler` instead of the process-wide
    /// sink. Lets tests and embedded hosts observe faults in isolation.
    pub fn set_fault_handler(
        &self,
        handler: impl Fn(&'static str, &Fault) + Send + Sync + 'static,
    ) {
        *self.fault_handler.write() = Some(Arc::new(handler));
    }

    /// Register an operation to be advanced once per tick until finished.
    ///
    /// If a tick is in progress the operation lands in the staging queue and
    /// is first advanced on the next tick; otherwise it is appended to the
    /// slot array directly.
    pub fn register(&self, op: Box<dyn Resumable>) {
        let mut staging = self.staging.lock();
        if staging.ticking {
            staging.queue.enqueue(op);
        } else {
            self.slots.lock().push(op);
        }
    }

    /// Advance every live operation exactly once and compact finished slots.
    ///
    /// Never panics on operation failure and never blocks on registrations;
    /// must not be re-entered for the same runner.
    pub fn tick(&self) {
        {
            let mut staging = self.staging.lock();
            assert!(
                !staging.ticking,
                "tick re-entered for phase {}",
                self.phase
            );
            staging.ticking = true;
        }

        let local = self.fault_handler.read().clone();
        {
            let mut slots = self.slots.lock();
            self.run_pass(&mut slots, local.as_ref());
        }

        // Settle: stop diverting registrations, then splice staged ones in
        // arrival order. Lock order (staging then slots) matches register.
        let mut staging = self.staging.lock();
        staging.ticking = false;
        let mut slots = self.slots.lock();
        while let Ok(op) = staging.queue.dequeue() {
            slots.push(op);
        }
    }

    /// Forget every registered operation (slots and staged) without running
    /// or canceling them. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut staging = self.staging.lock();
        let mut slots = self.slots.lock();
        let tail = slots.tail;
        let mut discarded = 0;
        for slot in &mut slots.items[..tail] {
            if slot.take().is_some() {
                discarded += 1;
            }
        }
        slots.tail = 0;
        while staging.queue.dequeue().is_ok() {
            discarded += 1;
        }
        discarded
    }

    /// Number of live slots. Between ticks every slot below the tail is
    /// occupied, so this is exact.
    pub fn len(&self) -> usize {
        self.slots.lock().tail
    }

    /// Whether no operations are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One compacting pass: scan forward, clear finished slots, and backfill
    /// each cleared slot from the tail end so the live region stays dense.
    /// A tail candidate is advanced once before being moved (and discarded
    /// instead if that advance finishes it), which keeps every live
    /// operation at exactly one `advance` per pass no matter how many
    /// removals happen mid-scan.
    fn run_pass(&self, slots: &mut Slots, local: Option<&Arc<FaultHandler>>) {
        let items = &mut slots.items;
        let mut end = slots.tail;
        let mut i = 0;
        while i < end {
            let keep = match items[i].as_mut() {
                Some(op) => self.advance_guarded(op, local),
                None => false,
            };
            if !keep {
                items[i] = None;
                let mut filled = false;
                while end > i + 1 {
                    end -= 1;
                    if let Some(mut op) = items[end].take() {
                        if self.advance_guarded(&mut op, local) {
                            items[i] = Some(op);
                            filled = true;
                            break;
                        }
                    }
                }
                if !filled {
                    // Forward and backward scans met; everything behind the
                    // cursor is gone.
                    end = i;
                    break;
                }
            }
            i += 1;
        }
        slots.tail = end;
    }

    /// Advance one operation, containing faults. Returns whether the
    /// operation is still running.
    fn advance_guarded(
        &self,
        op: &mut Box<dyn Resumable>,
        local: Option<&Arc<FaultHandler>>,
    ) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| op.advance())) {
            Ok(Ok(Advance::Running)) => true,
            Ok(Ok(Advance::Finished)) => false,
            Ok(Err(fault)) => {
                report_fault(local, self.phase, &fault);
                false
            }
            Err(payload) => {
                let fault = Fault::msg(panic_message(&payload));
                report_fault(local, self.phase, &fault);
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "operation panicked".to_string()
    }
}
