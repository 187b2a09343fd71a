// Four-bucket cooperative scheduler
// Every live sandbox sits in exactly one bucket: dormant, ready, waiting
// or suspended. One tick dispatches each unit that was ready when the
// tick began, once, for up to one timeslice. Nothing is preempted; a
// unit keeps the core until its fiber hands it back.
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, error, info};

use crate::sandbox::{Sandbox, State, TaskCtx, TaskId, WaitReason};
use crate::vm::{Step, Vm};

pub struct Scheduler<F> {
    // boxed so a unit's address is stable for stat dumps
    tasks: BTreeMap<TaskId, Box<Sandbox<F>>>,
    buckets: [VecDeque<TaskId>; 4],
    tick: u64,
    next_id: u32,
    tick_ms: u32,
    timeslice: u16,
}

impl<F> Scheduler<F> {
    /// `tick_ms` is the wall time one tick stands for; sleeps are
    /// rounded up to whole ticks.
    pub fn new(tick_ms: u32, timeslice: u16) -> Self {
        Self {
            tasks: BTreeMap::new(),
            buckets: Default::default(),
            tick: 0,
            next_id: 1,
            tick_ms: tick_ms.max(1),
            timeslice: timeslice.max(1),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    // earliest tick at which a sleeper must be looked at again
    pub fn wakeup_tick(&self) -> Option<u64> {
        self.buckets[State::Waiting.index()]
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|t| t.wakeup_tick)
            .min()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn count(&self, state: State) -> usize {
        self.buckets[state.index()].len()
    }

    // anything left that a tick could advance
    pub fn is_idle(&self) -> bool {
        self.buckets[State::Ready.index()].is_empty() && self.buckets[State::Waiting.index()].is_empty()
    }

    pub fn spawn(&mut self, name: Option<&str>, heap_size: usize, priority: u8) -> TaskId {
        let id = self.fresh_id();
        self.tasks
            .insert(id, Box::new(Sandbox::new(id, name, heap_size, priority)));
        self.buckets[State::Dormant.index()].push_back(id);
        info!("task {} created ({} byte heap)", id, heap_size);
        id
    }

    // next id not held by a live unit; 0 is never handed out
    fn fresh_id(&mut self) -> TaskId {
        loop {
            let id = TaskId::new(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.tasks.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&Sandbox<F>> {
        self.tasks.get(&id).map(|t| &**t)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Sandbox<F>> {
        self.tasks.get_mut(&id).map(|t| &mut **t)
    }

    // caller checks the unit is dormant; dropping it frees its arena
    pub(crate) fn remove(&mut self, id: TaskId) -> Option<Box<Sandbox<F>>> {
        let task = self.tasks.remove(&id)?;
        self.unlink(id, task.state());
        info!("task {} destroyed", id);
        Some(task)
    }

    /// Starts the unit's current image. Dormant -> ready.
    pub fn launch<V: Vm<Fiber = F>>(&mut self, vm: &V, id: TaskId) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        if !task.launch(vm) {
            return false;
        }
        info!("task {} launched", id);
        self.move_to(id, State::Ready);
        true
    }

    /// Suspended -> ready. Anything else is left alone.
    pub fn resume(&mut self, id: TaskId) -> bool {
        match self.tasks.get(&id) {
            Some(t) if t.state() == State::Suspended => {
                self.move_to(id, State::Ready);
                true
            }
            _ => false,
        }
    }

    // one scheduler turn; returns how many units held the core
    pub fn run_tick<V: Vm<Fiber = F>>(&mut self, vm: &V, out: &mut dyn fmt::Write) -> usize {
        self.tick += 1;
        let now = self.tick;

        // interrupts are honoured at the unit's next check point; for a
        // parked unit that is the start of the tick
        let doomed: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.state() != State::Dormant && t.interrupt_pending())
            .map(|t| t.id())
            .collect();
        for id in doomed {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.take_interrupt();
                task.finish(None);
            }
            info!("task {} interrupted", id);
            self.move_to(id, State::Dormant);
        }

        let due: Vec<TaskId> = self.buckets[State::Waiting.index()]
            .iter()
            .copied()
            .filter(|id| self.tasks.get(id).is_some_and(|t| t.wakeup_tick <= now))
            .collect();
        for id in due {
            let mut next = State::Ready;
            if let Some(task) = self.tasks.get_mut(&id) {
                task.wait_reason = WaitReason::None;
                if task.take_suspend() {
                    next = State::Suspended;
                }
            }
            self.move_to(id, next);
        }

        let round: Vec<TaskId> = self.buckets[State::Ready.index()].iter().copied().collect();
        let mut dispatched = 0;
        for id in round {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if task.state() != State::Ready {
                continue;
            }
            task.timeslice = self.timeslice;
            let step = task.step(vm, TaskCtx { id, tick: now }, out);
            dispatched += 1;
            self.settle(id, step);
        }

        debug!(
            "tick {}: {} dispatched, {} ready, {} waiting",
            now,
            dispatched,
            self.count(State::Ready),
            self.count(State::Waiting)
        );
        dispatched
    }

    // where a unit goes after it handed the core back
    fn settle(&mut self, id: TaskId, step: Step) {
        let now = self.tick;
        let tick_ms = self.tick_ms;
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };

        let next = match step {
            Step::Yield => {
                if task.take_suspend() {
                    State::Suspended
                } else {
                    State::Ready
                }
            }
            Step::Sleep(ms) => {
                let ticks = u64::from(ms.div_ceil(tick_ms)).max(1);
                task.wakeup_tick = now + ticks;
                task.wait_reason = WaitReason::Sleep;
                State::Waiting
            }
            Step::Suspend => {
                task.take_suspend();
                State::Suspended
            }
            Step::Done => {
                task.finish(None);
                info!("task {} finished", id);
                State::Dormant
            }
            Step::Fault(e) => {
                error!("task {} died: {}", id, e);
                task.finish(Some(e));
                State::Dormant
            }
        };
        self.move_to(id, next);
    }

    // relink into `state`'s bucket; ready is kept in priority order,
    // FIFO among equals, so a re-queued unit goes behind its peers
    fn move_to(&mut self, id: TaskId, state: State) {
        let Some(from) = self.tasks.get(&id).map(|t| t.state()) else {
            return;
        };
        self.unlink(id, from);

        if state == State::Ready {
            let prio = self.tasks.get(&id).map_or(u8::MAX, |t| t.priority);
            let ready = &self.buckets[State::Ready.index()];
            let at = ready
                .iter()
                .position(|o| self.tasks.get(o).is_some_and(|t| t.priority > prio))
                .unwrap_or(ready.len());
            self.buckets[State::Ready.index()].insert(at, id);
        } else {
            self.buckets[state.index()].push_back(id);
        }

        if let Some(task) = self.tasks.get_mut(&id) {
            task.set_state(state);
        }
    }

    fn unlink(&mut self, id: TaskId, state: State) {
        let bucket = &mut self.buckets[state.index()];
        if let Some(at) = bucket.iter().position(|&o| o == id) {
            bucket.remove(at);
        }
    }

    pub fn stat(&self) -> Stat {
        let mut buckets: [Vec<TaskStat>; 4] = Default::default();
        for state in State::ALL {
            buckets[state.index()] = self.buckets[state.index()]
                .iter()
                .filter_map(|id| self.tasks.get(id))
                .map(|t| TaskStat {
                    id: t.id().raw(),
                    tcb: &**t as *const Sandbox<F> as usize,
                    status: t.state().code(),
                    heap: t.arena().base_addr(),
                    name: t.name().map(String::from),
                    priority: t.priority,
                    state: t.state(),
                    wait: t.wait_reason,
                    timeslice: t.timeslice,
                    wakeup_tick: t.wakeup_tick,
                })
                .collect();
        }
        Stat {
            tick: self.tick,
            wakeup_tick: self.wakeup_tick(),
            buckets,
        }
    }
}

// ── Stat snapshot ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStat {
    pub id: u32,
    /// address of the control block
    pub tcb: usize,
    /// low-level status code, see [`State::code`]
    pub status: u8,
    /// address of the private heap
    pub heap: usize,
    pub name: Option<String>,
    pub priority: u8,
    pub state: State,
    pub wait: WaitReason,
    pub timeslice: u16,
    pub wakeup_tick: u64,
}

/// Point-in-time view of the scheduler. The text form is for people, not
/// for parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub tick: u64,
    pub wakeup_tick: Option<u64>,
    pub buckets: [Vec<TaskStat>; 4],
}

impl Stat {
    pub fn bucket(&self, state: State) -> &[TaskStat] {
        &self.buckets[state.index()]
    }

    pub fn total(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick {} wakeup_tick ", self.tick)?;
        match self.wakeup_tick {
            Some(t) => writeln!(f, "{}", t)?,
            None => writeln!(f, "-")?,
        }
        for state in State::ALL {
            let bucket = self.bucket(state);
            writeln!(f, "{} ({})", state, bucket.len())?;
            for t in bucket {
                writeln!(
                    f,
                    "  #{:<3} tcb={:#010x} st={:#04x} heap={:#010x} {:<12} pri={:<3} {} wait={} ts={} wakeup={}",
                    t.id,
                    t.tcb,
                    t.status,
                    t.heap,
                    t.name.as_deref().unwrap_or("-"),
                    t.priority,
                    t.state,
                    t.wait.name(),
                    t.timeslice,
                    t.wakeup_tick,
                )?;
            }
        }
        Ok(())
    }
}
