// Cooperative execution engine
// Single core, no preemption. The Kernel owns the VM, the scheduler (and
// through it every sandbox) and the name registry; callers hold it and
// pass it down explicitly. There is no ambient global task table.
//
// wait: blocks a supervising caller until a unit is dormant, ticking the
// scheduler between polls of the control stream.

pub mod registry;
pub mod scheduler;
pub mod wait;

pub use registry::{RegistryError, TaskRegistry};
pub use scheduler::{Scheduler, Stat, TaskStat};
pub use wait::{CTRL_C, EVENTS_PER_QUANTUM, WaitOptions, WaitOutcome, wait};

use core::fmt;

use log::info;

use crate::config::KernelConfig;
use crate::sandbox::{Sandbox, State, TaskCtx, TaskId};
use crate::vm::{ExecError, Vm};

pub struct Kernel<V: Vm> {
    vm: V,
    config: KernelConfig,
    sched: Scheduler<V::Fiber>,
    registry: TaskRegistry,
}

impl<V: Vm> Kernel<V> {
    pub fn new(vm: V, config: KernelConfig) -> Self {
        let sched = Scheduler::new(config.quantum_ms, config.timeslice);
        Self {
            vm,
            config,
            sched,
            registry: TaskRegistry::new(),
        }
    }

    pub fn vm(&self) -> &V {
        &self.vm
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler<V::Fiber> {
        &self.sched
    }

    /// New empty dormant unit, registered under `name` if one is given.
    /// A taken name fails before anything is allocated.
    pub fn create(&mut self, name: Option<&str>) -> Result<TaskId, RegistryError> {
        if let Some(held) = name.and_then(|n| self.registry.lookup(n)) {
            return Err(RegistryError::Duplicate(held));
        }
        let id = self
            .sched
            .spawn(name, self.config.heap_size, self.config.priority);
        if let Some(name) = name {
            self.registry.register(name, id)?;
        }
        Ok(id)
    }

    pub fn register(&mut self, name: &str, id: TaskId) -> Result<(), RegistryError> {
        if self.sched.get(id).is_none() {
            return Err(RegistryError::NotFound);
        }
        self.registry.register(name, id)
    }

    pub fn lookup(&self, name: &str) -> Option<TaskId> {
        self.registry.lookup(name)
    }

    /// Drops the unit registered under `name`, releasing its private heap,
    /// together with every other name bound to it. The unit must be
    /// dormant.
    pub fn remove(&mut self, name: &str) -> Result<(), RegistryError> {
        let id = self.registry.lookup(name).ok_or(RegistryError::NotFound)?;
        self.destroy(id)?;
        info!("task {} ({}) removed", id, name);
        Ok(())
    }

    // same for units that may never have been named
    pub fn destroy(&mut self, id: TaskId) -> Result<(), RegistryError> {
        self.ensure_dormant(id)?;
        self.registry.unbind(id);
        self.sched.remove(id);
        Ok(())
    }

    fn ensure_dormant(&self, id: TaskId) -> Result<(), RegistryError> {
        match self.sched.get(id).map(Sandbox::state) {
            None => Err(RegistryError::NotFound),
            Some(State::Dormant) => Ok(()),
            Some(_) => Err(RegistryError::Busy(id)),
        }
    }

    /// The unit the given execution context belongs to.
    pub fn current(&self, cx: &TaskCtx) -> Option<&Sandbox<V::Fiber>> {
        self.sched.get(cx.id)
    }

    pub fn sandbox(&self, id: TaskId) -> Option<&Sandbox<V::Fiber>> {
        self.sched.get(id)
    }

    pub fn sandbox_mut(&mut self, id: TaskId) -> Option<&mut Sandbox<V::Fiber>> {
        self.sched.get_mut(id)
    }

    pub fn compile(&mut self, id: TaskId, source: &str) -> bool {
        let Some(task) = self.sched.get_mut(id) else {
            return false;
        };
        task.compile(&self.vm, source)
    }

    /// Starts the current image. False if there is none, the unit is not
    /// dormant, or the image is rejected (captured as the unit's error).
    pub fn execute(&mut self, id: TaskId) -> bool {
        self.sched.launch(&self.vm, id)
    }

    pub fn interrupt(&self, id: TaskId) -> bool {
        self.sched.get(id).is_some_and(Sandbox::request_interrupt)
    }

    pub fn suspend(&self, id: TaskId) -> bool {
        self.sched.get(id).is_some_and(Sandbox::request_suspend)
    }

    pub fn resume(&mut self, id: TaskId) -> bool {
        self.sched.resume(id)
    }

    pub fn state(&self, id: TaskId) -> Option<State> {
        self.sched.get(id).map(Sandbox::state)
    }

    pub fn error(&self, id: TaskId) -> Option<&ExecError> {
        self.sched.get(id).and_then(Sandbox::error)
    }

    /// One scheduler turn; program output goes to `out`.
    pub fn tick(&mut self, out: &mut dyn fmt::Write) -> usize {
        self.sched.run_tick(&self.vm, out)
    }

    pub fn is_idle(&self) -> bool {
        self.sched.is_idle()
    }

    pub fn stat(&self) -> Stat {
        self.sched.stat()
    }
}
