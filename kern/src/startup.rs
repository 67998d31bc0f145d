//! Kernel startup and the kernel object root.
//!
//! Boot is an explicit state machine: each phase constructs one arena, in
//! dependency order, and records its completion. Nothing consults the
//! kernel before it reports `Ready`, and a phase can never run twice.
//! All global state lives in the [`Kernel`] value produced here and is
//! passed explicitly to everything that needs it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use abi::{ErrorCode, FaultInfo, TaskId};

use crate::interrupt::ExcTable;
use crate::ipc::{BoxId, BoxTable, CallSlab};
use crate::mm::FrameTable;
use crate::sync::{IrqSpinlock, LockRank, Spinlock};
use crate::task::{self, Task};

/// Sizing knobs consumed once at boot.
#[derive(Copy, Clone, Debug)]
pub struct KernelConfig {
    pub max_tasks: usize,
    /// Call records in the slab.
    pub call_slots: usize,
    /// Answerbox slots: one per task plus headroom for the private boxes
    /// backing synchronous calls.
    pub box_slots: usize,
    /// Physical frames available to the anonymous backend.
    pub frames: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_tasks: 32,
            call_slots: 256,
            box_slots: 96,
            frames: 1024,
        }
    }
}

/// Boot progression. Strictly monotonic.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum BootPhase {
    Cold = 0,
    Frames,
    Slabs,
    Boxes,
    Tasks,
    Exceptions,
    Ready,
}

/// A fault a task took, queued for whatever monitor drains these.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FaultEvent {
    pub task: TaskId,
    pub fault: FaultInfo,
}

pub(crate) struct TaskList {
    pub free: Vec<usize>,
}

pub struct Kernel {
    tasks: Box<[Task]>,
    pub(crate) task_list: IrqSpinlock<TaskList>,
    pub(crate) calls: CallSlab,
    pub(crate) boxes: BoxTable,
    pub frames: FrameTable,
    pub exc: ExcTable,
    events: Spinlock<Vec<FaultEvent>>,
    ns_box: Spinlock<Option<BoxId>>,
    phase: AtomicU8,
}

impl Kernel {
    /// Runs the boot sequence and returns the kernel root.
    pub fn boot(cfg: KernelConfig) -> Arc<Kernel> {
        let phase = AtomicU8::new(BootPhase::Cold as u8);

        advance(&phase, BootPhase::Frames);
        let frames = FrameTable::new(cfg.frames);

        advance(&phase, BootPhase::Slabs);
        let calls = CallSlab::new(cfg.call_slots);

        advance(&phase, BootPhase::Boxes);
        let boxes = BoxTable::new(cfg.box_slots);

        advance(&phase, BootPhase::Tasks);
        let mut tasks = Vec::with_capacity(cfg.max_tasks);
        for _ in 0..cfg.max_tasks {
            tasks.push(Task::empty());
        }
        let task_list = IrqSpinlock::new(
            "task_list",
            LockRank::TaskList,
            TaskList {
                free: (0..cfg.max_tasks).rev().collect(),
            },
        );

        advance(&phase, BootPhase::Exceptions);
        let exc = ExcTable::new();

        let k = Kernel {
            tasks: tasks.into_boxed_slice(),
            task_list,
            calls,
            boxes,
            frames,
            exc,
            events: Spinlock::new("fault_events", LockRank::Console, Vec::new()),
            ns_box: Spinlock::new("ns_box", LockRank::Console, None),
            phase,
        };
        crate::interrupt::register_builtin(&k.exc);

        advance(&k.phase, BootPhase::Ready);
        log::info!("kernel ready: {:?}", cfg);
        Arc::new(k)
    }

    pub fn phase(&self) -> BootPhase {
        match self.phase.load(Ordering::Acquire) {
            0 => BootPhase::Cold,
            1 => BootPhase::Frames,
            2 => BootPhase::Slabs,
            3 => BootPhase::Boxes,
            4 => BootPhase::Tasks,
            5 => BootPhase::Exceptions,
            _ => BootPhase::Ready,
        }
    }

    pub(crate) fn task(&self, idx: usize) -> &Task {
        &self.tasks[idx]
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// State of one phone slot. Diagnostic.
    pub fn phone_state(&self, task: usize, phone: usize) -> crate::ipc::PhoneState {
        self.tasks[task].phone_state(phone)
    }

    /// The answerbox currently backing task `task`. Diagnostic.
    pub fn task_box(&self, task: usize) -> Option<BoxId> {
        self.tasks[task].inner.lock().answerbox
    }

    /// Registers `task` as the naming service; phone 0 of every task
    /// created afterwards connects to its answerbox.
    pub fn set_naming_service(&self, id: TaskId) -> Result<(), ErrorCode> {
        let idx = task::check_index(self, id)?;
        let b = task::answerbox_of(self, idx)?;
        *self.ns_box.lock() = Some(b);
        Ok(())
    }

    pub(crate) fn naming_service(&self) -> Option<BoxId> {
        *self.ns_box.lock()
    }

    pub(crate) fn push_fault_event(&self, task: TaskId, fault: FaultInfo) {
        self.events.lock().push(FaultEvent { task, fault });
    }

    /// Drains the queued fault events, oldest first.
    pub fn drain_fault_events(&self) -> Vec<FaultEvent> {
        core::mem::take(&mut *self.events.lock())
    }

    /// Counts live call records and their list memberships across every
    /// answerbox. On a quiescent system every live call is on exactly one
    /// list; a call counted twice is a bug regardless of quiescence.
    pub fn audit_calls(&self) -> CallAudit {
        let mut listed = 0usize;
        let mut seen: Vec<abi::CallId> = Vec::new();
        let mut double_listed = 0usize;
        for idx in 0..self.boxes.capacity() {
            let abox = self.boxes.slot_by_index(idx);
            let b = abox.inner.lock();
            if !b.active {
                continue;
            }
            for &c in b
                .incoming
                .iter()
                .chain(b.dispatched.iter())
                .chain(b.answers.iter())
            {
                listed += 1;
                if seen.contains(&c) {
                    double_listed += 1;
                } else {
                    seen.push(c);
                }
            }
        }
        CallAudit {
            live: self.calls.live(),
            listed,
            double_listed,
        }
    }

    /// Panics unless the call partition is clean and fully accounted for.
    /// Only meaningful when no IPC is in flight.
    pub fn assert_quiescent(&self) {
        let audit = self.audit_calls();
        assert_eq!(audit.double_listed, 0, "a call is on two lists");
        assert_eq!(
            audit.live, audit.listed,
            "live call records not on any list"
        );
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CallAudit {
    /// Live records in the slab.
    pub live: usize,
    /// List memberships found across all boxes.
    pub listed: usize,
    /// Calls found on more than one list. Always a bug.
    pub double_listed: usize,
}

fn advance(phase: &AtomicU8, next: BootPhase) {
    let prev = phase.swap(next as u8, Ordering::AcqRel);
    assert_eq!(
        prev + 1,
        next as u8,
        "boot phase ran out of order: {} -> {:?}",
        prev,
        next,
    );
    log::info!("boot: {:?}", next);
}
