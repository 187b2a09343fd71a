//! Execution unit ("sandbox"): an isolated compile+run context.
//!
//! A sandbox owns its private [`Arena`], the current bytecode image and the
//! interpreter fiber of the current launch. Lifecycle state is changed only
//! by the scheduler; requests that come from outside (interrupt, suspend)
//! are recorded here and honoured at the unit's next check point.

pub mod arena;

use alloc::string::String;
use core::cell::Cell;
use core::fmt;

use log::{info, warn};

use crate::vm::{CompileError, ExecCtx, ExecError, Step, Vm};
use arena::{Arena, ArenaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u32);

impl TaskId {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of the code currently holding the core, handed to the VM on
/// every dispatch. Lookups of "the current task" go through this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskCtx {
    pub id: TaskId,
    pub tick: u64,
}

/// Scheduler bucket. Every live sandbox sits in exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Dormant,
    /// runnable or running; the two are not told apart
    Ready,
    /// timed sleep, entered only by the scheduler
    Waiting,
    Suspended,
}

impl State {
    pub const ALL: [State; 4] = [State::Dormant, State::Ready, State::Waiting, State::Suspended];

    pub const fn index(self) -> usize {
        match self {
            State::Dormant => 0,
            State::Ready => 1,
            State::Waiting => 2,
            State::Suspended => 3,
        }
    }

    // low-level status code shown in stat dumps
    pub const fn code(self) -> u8 {
        match self {
            State::Dormant => 0x00,
            State::Ready => 0x02,
            State::Waiting => 0x04,
            State::Suspended => 0x08,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            State::Dormant => "DORMANT",
            State::Ready => "READY",
            State::Waiting => "WAITING",
            State::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    None,
    Sleep,
}

impl WaitReason {
    pub const fn name(self) -> &'static str {
        match self {
            WaitReason::None => "-",
            WaitReason::Sleep => "sleep",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Image {
    None,
    // pinned at the base of the arena
    Heap,
    // contiguous bytes the storage layer exposes directly (flash, XIP)
    Mapped(&'static [u8]),
}

pub struct Sandbox<F> {
    id: TaskId,
    name: Option<String>,
    arena: Arena,
    image: Image,
    fiber: Option<F>,
    state: State,
    error: Option<ExecError>,
    compile_error: Option<CompileError>,
    started: bool,
    interrupt: Cell<bool>,
    interrupts: Cell<u32>,
    suspend: Cell<bool>,
    pub(crate) priority: u8,
    pub(crate) timeslice: u16,
    pub(crate) wakeup_tick: u64,
    pub(crate) wait_reason: WaitReason,
}

impl<F> Sandbox<F> {
    pub(crate) fn new(id: TaskId, name: Option<&str>, heap_size: usize, priority: u8) -> Self {
        Self {
            id,
            name: name.map(String::from),
            arena: Arena::new(heap_size),
            image: Image::None,
            fiber: None,
            state: State::Dormant,
            error: None,
            compile_error: None,
            started: false,
            interrupt: Cell::new(false),
            interrupts: Cell::new(0),
            suspend: Cell::new(false),
            priority,
            timeslice: 0,
            wakeup_tick: 0,
            wait_reason: WaitReason::None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Last uncaught failure; cleared by the next successful launch.
    pub fn error(&self) -> Option<&ExecError> {
        self.error.as_ref()
    }

    /// Why the last compile failed, if it did.
    pub fn compile_error(&self) -> Option<&CompileError> {
        self.compile_error.as_ref()
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn has_image(&self) -> bool {
        !matches!(self.image, Image::None)
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.image, Image::Mapped(_))
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt.get()
    }

    // how many interrupt requests were recorded over the unit's life
    pub fn interrupt_requests(&self) -> u32 {
        self.interrupts.get()
    }

    /// Compiles `source` into this sandbox's private image. Does not start
    /// execution. A failed compile drops the previous image so a following
    /// launch cannot run stale code.
    pub fn compile<V: Vm<Fiber = F>>(&mut self, vm: &V, source: &str) -> bool {
        if self.state != State::Dormant {
            warn!("task {}: compile refused while {}", self.id, self.state);
            return false;
        }
        self.drop_image();

        let image = match vm.compile(source) {
            Ok(image) => image,
            Err(e) => {
                warn!("task {}: compile failed: {}", self.id, e);
                self.compile_error = Some(e);
                return false;
            }
        };

        if let Err(e) = self.load_image(&image) {
            warn!("task {}: compiled image does not fit: {}", self.id, e);
            self.compile_error = Some(CompileError {
                line: 0,
                message: alloc::format!("{}", e),
            });
            return false;
        }
        true
    }

    /// Records an interrupt request; the unit unwinds at its next check
    /// point. Returns false if there is nothing running to interrupt.
    pub fn request_interrupt(&self) -> bool {
        if self.state == State::Dormant {
            return false;
        }
        self.interrupt.set(true);
        self.interrupts.set(self.interrupts.get().saturating_add(1));
        info!("task {}: interrupt requested", self.id);
        true
    }

    /// Asks the unit to park at its next yield point.
    pub fn request_suspend(&self) -> bool {
        if self.state == State::Dormant {
            return false;
        }
        self.suspend.set(true);
        true
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    pub(crate) fn load_image(&mut self, bytes: &[u8]) -> Result<(), ArenaError> {
        self.drop_image();
        self.arena.store_image(bytes)?;
        self.image = Image::Heap;
        Ok(())
    }

    pub(crate) fn map_image(&mut self, bytes: &'static [u8]) {
        self.drop_image();
        self.image = Image::Mapped(bytes);
    }

    fn drop_image(&mut self) {
        self.arena.clear();
        self.image = Image::None;
        self.compile_error = None;
        self.started = false;
    }

    // dormant -> ready; the caller moves the bucket
    pub(crate) fn launch<V: Vm<Fiber = F>>(&mut self, vm: &V) -> bool {
        if self.state != State::Dormant {
            return false;
        }
        let image = match self.image {
            Image::None => return false,
            Image::Heap => self.arena.image(),
            Image::Mapped(bytes) => bytes,
        };

        match vm.boot(image) {
            Ok(fiber) => {
                self.fiber = Some(fiber);
                self.error = None;
                self.started = true;
                self.interrupt.set(false);
                self.suspend.set(false);
                self.wait_reason = WaitReason::None;
                true
            }
            Err(e) => {
                warn!("task {}: image rejected: {}", self.id, e);
                self.error = Some(e);
                false
            }
        }
    }

    pub(crate) fn take_interrupt(&mut self) -> bool {
        self.interrupt.replace(false)
    }

    pub(crate) fn take_suspend(&mut self) -> bool {
        self.suspend.replace(false)
    }

    pub(crate) fn set_state(&mut self, state: State) {
        self.state = state;
    }

    // one dispatch: run the fiber until it hands the core back
    pub(crate) fn step<V: Vm<Fiber = F>>(
        &mut self,
        vm: &V,
        task: TaskCtx,
        out: &mut dyn fmt::Write,
    ) -> Step {
        let Some(fiber) = self.fiber.as_mut() else {
            return Step::Done;
        };
        let (pinned, heap) = self.arena.split();
        let image = match self.image {
            Image::None => return Step::Done,
            Image::Heap => pinned,
            Image::Mapped(bytes) => bytes,
        };

        let mut cx = ExecCtx {
            task,
            heap,
            out,
            budget: self.timeslice as u32,
        };
        let step = vm.step(fiber, image, &mut cx);
        self.timeslice = cx.budget.min(u16::MAX as u32) as u16;
        step
    }

    // back to dormant: drop the fiber and every runtime object
    pub(crate) fn finish(&mut self, error: Option<ExecError>) {
        self.fiber = None;
        self.arena.release_runtime();
        self.interrupt.set(false);
        self.suspend.set(false);
        self.wait_reason = WaitReason::None;
        self.timeslice = 0;
        if error.is_some() {
            self.error = error;
        }
    }
}
