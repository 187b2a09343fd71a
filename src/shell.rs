// Surface the REPL/shell layer calls into
//
// Owns the kernel and the volume; the console, delay and watchdog are
// lent per call through a Host. compile_and_run reuses one REPL unit so
// each line does not cost a fresh arena. Errors from a unit are printed
// on the console and returned, never raised past here.
//
// Units made by run() that were not left dormant (interrupted, timed
// out) go on an orphan list; poll() destroys them once they are.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use embedded_hal::delay::DelayNs;
use log::info;

use crate::config::KernelConfig;
use crate::drivers::{Console, Host, Volume};
use crate::kernel::{EVENTS_PER_QUANTUM, Kernel, RegistryError, WaitOptions, WaitOutcome, wait};
use crate::loader::{self, LoadError, LoadOptions, RunOutcome};
use crate::sandbox::{State, TaskId};
use crate::vm::{CompileError, ErrorClass, ExecError, Vm};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellError {
    NoSuchTask(String),
    Registry(RegistryError),
    Compile(CompileError),
    Load(LoadError),
    /// image rejected at launch
    Exec(ExecError),
    /// request made no sense in the unit's current state
    WrongState(State),
}

impl fmt::Display for ShellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellError::NoSuchTask(name) => write!(f, "no task named {}", name),
            ShellError::Registry(e) => write!(f, "{}", e),
            ShellError::Compile(e) => write!(f, "{}", e),
            ShellError::Load(e) => write!(f, "{}", e),
            ShellError::Exec(e) => write!(f, "{}", e),
            ShellError::WrongState(s) => write!(f, "task is {}", s),
        }
    }
}

impl From<RegistryError> for ShellError {
    fn from(e: RegistryError) -> Self {
        ShellError::Registry(e)
    }
}

impl From<LoadError> for ShellError {
    fn from(e: LoadError) -> Self {
        ShellError::Load(e)
    }
}

pub struct Shell<V: Vm, FS: Volume> {
    kernel: Kernel<V>,
    volume: FS,
    repl: Option<TaskId>,
    orphans: Vec<TaskId>,
}

impl<V: Vm, FS: Volume> Shell<V, FS> {
    pub fn new(vm: V, config: KernelConfig, volume: FS) -> Self {
        Self {
            kernel: Kernel::new(vm, config),
            volume,
            repl: None,
            orphans: Vec::new(),
        }
    }

    pub fn kernel(&self) -> &Kernel<V> {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel<V> {
        &mut self.kernel
    }

    pub fn volume(&self) -> &FS {
        &self.volume
    }

    pub fn volume_mut(&mut self) -> &mut FS {
        &mut self.volume
    }

    /// `Task(name)`
    pub fn task(&self, name: &str) -> Option<TaskId> {
        self.kernel.lookup(name)
    }

    fn named(&self, name: &str) -> Result<TaskId, ShellError> {
        self.task(name)
            .ok_or_else(|| ShellError::NoSuchTask(String::from(name)))
    }

    /// Starts `source` as a new background task called `name`.
    pub fn spawn(&mut self, name: &str, source: &str) -> Result<TaskId, ShellError> {
        let id = self.kernel.create(Some(name))?;
        if !self.kernel.compile(id, source) {
            let err = self.compile_error(id);
            self.kernel.remove(name)?;
            return Err(ShellError::Compile(err));
        }
        if !self.kernel.execute(id) {
            return Err(ShellError::Exec(self.failure(id)));
        }
        info!("spawned {} as task {}", name, id);
        Ok(id)
    }

    fn compile_error(&self, id: TaskId) -> CompileError {
        self.kernel
            .sandbox(id)
            .and_then(|u| u.compile_error())
            .cloned()
            .unwrap_or(CompileError {
                line: 0,
                message: String::from("compile failed"),
            })
    }

    /// Compiles one REPL entry into the shared REPL unit and runs it to
    /// the end, Ctrl-C aborting.
    pub fn compile_and_run<C: Console, D: DelayNs>(
        &mut self,
        host: &mut Host<'_, C, D>,
        source: &str,
    ) -> Result<RunOutcome, ShellError> {
        let id = match self.repl.filter(|&id| self.kernel.sandbox(id).is_some()) {
            Some(id) => id,
            None => {
                let id = self.kernel.create(None)?;
                self.repl = Some(id);
                id
            }
        };
        if let Some(state) = self.kernel.state(id).filter(|&s| s != State::Dormant) {
            return Err(ShellError::WrongState(state));
        }

        if !self.kernel.compile(id, source) {
            let err = self.compile_error(id);
            let _ = writeln!(host.console, "{}", err);
            return Err(ShellError::Compile(err));
        }
        if !self.kernel.execute(id) {
            return Ok(self.report(host, RunOutcome::Failed(id, self.failure(id))));
        }

        let outcome = match wait(&mut self.kernel, id, WaitOptions::signal(), host) {
            WaitOutcome::Completed => match self.kernel.error(id) {
                Some(e) => RunOutcome::Failed(id, e.clone()),
                None => RunOutcome::Completed(id),
            },
            WaitOutcome::Interrupted => RunOutcome::Interrupted(id),
            WaitOutcome::TimedOut => RunOutcome::TimedOut(id),
        };
        Ok(self.report(host, outcome))
    }

    fn failure(&self, id: TaskId) -> ExecError {
        self.kernel
            .error(id)
            .cloned()
            .unwrap_or_else(|| ExecError::new(ErrorClass::ImageError, "nothing to run"))
    }

    fn report<C: Console, D>(&self, host: &mut Host<'_, C, D>, outcome: RunOutcome) -> RunOutcome {
        if let RunOutcome::Failed(_, e) = &outcome {
            let _ = writeln!(host.console, "{}", e);
        }
        outcome
    }

    /// Runs a file through the load pipeline and waits for it. The unit
    /// made for it is dropped again once it is dormant; after Ctrl-C that
    /// is one tick later.
    pub fn run<C: Console, D: DelayNs>(
        &mut self,
        host: &mut Host<'_, C, D>,
        path: &str,
    ) -> Result<RunOutcome, ShellError> {
        let opts = LoadOptions::join(WaitOptions::signal());
        let outcome = match loader::run(&mut self.kernel, &mut self.volume, host, path, &opts) {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = writeln!(host.console, "{}", e);
                return Err(e.into());
            }
        };
        let outcome = self.report(host, outcome);
        match &outcome {
            RunOutcome::Completed(id) | RunOutcome::Failed(id, _) => {
                let _ = self.kernel.destroy(*id);
            }
            RunOutcome::Interrupted(id) => {
                // the unwind happens at the start of the next tick
                self.kernel.tick(&mut *host.console);
                self.orphan(*id);
            }
            RunOutcome::TimedOut(id) | RunOutcome::Launched(id) => self.orphan(*id),
        }
        Ok(outcome)
    }

    fn orphan(&mut self, id: TaskId) {
        self.orphans.push(id);
        self.reap();
    }

    // destroys dormant orphans; a name given to one since means it was
    // adopted and is left alone
    fn reap(&mut self) {
        let kernel = &mut self.kernel;
        self.orphans.retain(|&id| {
            if kernel.registry().iter().any(|(_, held)| held == id) {
                return false;
            }
            match kernel.state(id) {
                None => false,
                Some(State::Dormant) => {
                    let _ = kernel.destroy(id);
                    info!("task {} reaped", id);
                    false
                }
                Some(_) => true,
            }
        });
    }

    /// Units from aborted runs still waiting to be reaped.
    pub fn orphans(&self) -> &[TaskId] {
        &self.orphans
    }

    /// Loads a file into a new named background task.
    pub fn start(&mut self, name: &str, path: &str) -> Result<TaskId, ShellError> {
        let id = self.kernel.create(Some(name))?;
        if let Err(e) = loader::load(&mut self.kernel, &mut self.volume, id, path) {
            self.kernel.remove(name)?;
            return Err(e.into());
        }
        if !self.kernel.execute(id) {
            return Err(ShellError::Exec(self.failure(id)));
        }
        info!("started {} from {} as task {}", name, path, id);
        Ok(id)
    }

    pub fn suspend(&mut self, name: &str) -> Result<(), ShellError> {
        let id = self.named(name)?;
        if self.kernel.suspend(id) {
            Ok(())
        } else {
            Err(ShellError::WrongState(State::Dormant))
        }
    }

    pub fn resume(&mut self, name: &str) -> Result<(), ShellError> {
        let id = self.named(name)?;
        if self.kernel.resume(id) {
            return Ok(());
        }
        let state = self.kernel.state(id).unwrap_or(State::Dormant);
        Err(ShellError::WrongState(state))
    }

    /// Asks the task to stop; it unwinds on the next tick.
    pub fn kill(&mut self, name: &str) -> Result<(), ShellError> {
        let id = self.named(name)?;
        if self.kernel.interrupt(id) {
            Ok(())
        } else {
            Err(ShellError::WrongState(State::Dormant))
        }
    }

    pub fn remove(&mut self, name: &str) -> Result<(), ShellError> {
        self.kernel.remove(name).map_err(|e| match e {
            RegistryError::NotFound => ShellError::NoSuchTask(String::from(name)),
            other => ShellError::Registry(other),
        })
    }

    /// Text form of the scheduler snapshot.
    pub fn stat(&self) -> String {
        self.kernel.stat().to_string()
    }

    /// One background turn while the shell is idle at its prompt: feed
    /// the watchdog, drain interrupt events, tick, reap.
    pub fn poll<C: Console, D>(&mut self, host: &mut Host<'_, C, D>) -> usize {
        host.feed_watchdog();
        host.pump_events(EVENTS_PER_QUANTUM);
        if self.kernel.is_idle() {
            return 0;
        }
        let ran = self.kernel.tick(&mut *host.console);
        self.reap();
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemVolume;
    use crate::testing::{CountingDelay, FakeWatchdog, ScriptedConsole};
    use crate::vm::ScriptVm;

    fn shell() -> Shell<ScriptVm, MemVolume> {
        Shell::new(ScriptVm, KernelConfig::defaults(), MemVolume::new())
    }

    #[test]
    fn repl_lines_share_one_unit() {
        let mut sh = shell();
        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        let a = sh.compile_and_run(&mut host, "puts \"one\"").unwrap();
        let b = sh.compile_and_run(&mut host, "puts \"two\"").unwrap();
        assert_eq!(a, RunOutcome::Completed(a.task()));
        assert_eq!(a.task(), b.task());
        drop(host);
        assert_eq!(con.output(), "one\ntwo\n");
        assert_eq!(sh.kernel().stat().total(), 1);
    }

    #[test]
    fn repl_reports_errors_on_the_console() {
        let mut sh = shell();
        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        let err = sh.compile_and_run(&mut host, "puts 'open").unwrap_err();
        assert!(matches!(err, ShellError::Compile(ref e) if e.line == 1));
        let outcome = sh.compile_and_run(&mut host, "raise \"bad\"").unwrap();
        assert!(matches!(outcome, RunOutcome::Failed(_, ref e) if e.message == "bad"));
        // still usable afterwards
        let ok = sh.compile_and_run(&mut host, "puts 1").unwrap();
        assert!(matches!(ok, RunOutcome::Completed(_)));
        drop(host);

        let text = con.output();
        assert!(text.starts_with("line 1: syntax error"));
        assert!(text.contains("RuntimeError: bad\n"));
        assert!(text.ends_with("1\n"));
    }

    #[test]
    fn ctrl_c_stops_a_runaway_repl_line() {
        let mut sh = shell();
        let mut con = ScriptedConsole::new();
        con.deliver_after(3, crate::kernel::CTRL_C);
        let mut delay = CountingDelay::default();
        let mut wdt = FakeWatchdog::default();
        let mut host = Host::new(&mut con, &mut delay).with_watchdog(&mut wdt);

        let outcome = sh.compile_and_run(&mut host, "loop do\nend").unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted(outcome.task()));
        // unwinds on the next turn, then the REPL unit is usable again
        sh.poll(&mut host);
        assert!(matches!(
            sh.compile_and_run(&mut host, "puts 2").unwrap(),
            RunOutcome::Completed(_)
        ));
    }

    #[test]
    fn background_tasks_by_name() {
        let mut sh = shell();
        let id = sh.spawn("ticker", "loop do\nsleep_ms 5\nend").unwrap();
        assert_eq!(sh.task("ticker"), Some(id));
        assert_eq!(
            sh.spawn("ticker", "puts 1"),
            Err(ShellError::Registry(RegistryError::Duplicate(id)))
        );
        assert!(matches!(sh.spawn("broken", "end"), Err(ShellError::Compile(_))));
        assert_eq!(sh.task("broken"), None);

        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut wdt = FakeWatchdog::default();
        let mut host = Host::new(&mut con, &mut delay).with_watchdog(&mut wdt);

        sh.suspend("ticker").unwrap();
        sh.poll(&mut host);
        sh.poll(&mut host);
        assert_eq!(sh.kernel().state(id), Some(State::Suspended));
        assert!(sh.stat().contains("SUSPENDED (1)"));
        assert_eq!(sh.remove("ticker"), Err(ShellError::Registry(RegistryError::Busy(id))));

        sh.resume("ticker").unwrap();
        assert_eq!(
            sh.resume("ticker"),
            Err(ShellError::WrongState(State::Ready))
        );
        sh.kill("ticker").unwrap();
        sh.poll(&mut host);
        assert_eq!(sh.kernel().state(id), Some(State::Dormant));
        assert_eq!(sh.kill("ticker"), Err(ShellError::WrongState(State::Dormant)));
        sh.remove("ticker").unwrap();
        assert_eq!(sh.remove("ticker"), Err(ShellError::NoSuchTask(String::from("ticker"))));
        assert_eq!(sh.suspend("ghost"), Err(ShellError::NoSuchTask(String::from("ghost"))));
        drop(host);
        assert!(wdt.feeds() >= 3);
    }

    #[test]
    fn run_reaps_its_unit_and_start_keeps_its_own() {
        let mut sh = shell();
        sh.volume_mut().add_file("/bin/hello.rb", b"puts \"hello\"\n");
        sh.volume_mut().add_file("/lib/bg.rb", b"loop do\npass\nend\n");
        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        let outcome = sh.run(&mut host, "hello.rb").unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(sh.kernel().stat().total(), 0);

        assert!(matches!(sh.run(&mut host, "missing.rb"), Err(ShellError::Load(LoadError::NotFound(_)))));

        let bg = sh.start("bg", "bg.rb").unwrap();
        assert_eq!(sh.kernel().state(bg), Some(State::Ready));
        assert!(matches!(sh.start("bg2", "missing.rb"), Err(ShellError::Load(_))));
        assert_eq!(sh.task("bg2"), None);
        drop(host);
        assert!(con.output().starts_with("hello\n"));
        assert!(con.output().contains("missing.rb: not found"));
    }

    #[test]
    fn interrupted_runs_do_not_keep_their_arenas() {
        let mut sh = shell();
        sh.volume_mut().add_file("/lib/spin.rb", b"loop do\npass\nend\n");
        let mut con = ScriptedConsole::new();
        for nth in [2, 4, 6] {
            con.deliver_after(nth, crate::kernel::CTRL_C);
        }
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        for _ in 0..3 {
            let outcome = sh.run(&mut host, "spin.rb").unwrap();
            assert_eq!(outcome, RunOutcome::Interrupted(outcome.task()));
            assert!(sh.kernel().sandbox(outcome.task()).is_none());
            sh.poll(&mut host);
        }
        assert_eq!(sh.kernel().stat().total(), 0);
        assert!(sh.orphans().is_empty());
    }

    #[test]
    fn orphans_are_reaped_once_dormant_unless_adopted() {
        let mut sh = shell();
        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        let spin = sh.kernel_mut().create(None).unwrap();
        sh.kernel_mut().compile(spin, "loop do\npass\nend\n");
        sh.kernel_mut().execute(spin);
        let kept = sh.kernel_mut().create(None).unwrap();
        sh.kernel_mut().compile(kept, "loop do\npass\nend\n");
        sh.kernel_mut().execute(kept);

        sh.orphan(spin);
        sh.orphan(kept);
        assert_eq!(sh.orphans(), &[spin, kept]);
        sh.kernel_mut().register("kept", kept).unwrap();

        sh.poll(&mut host);
        assert_eq!(sh.orphans(), &[spin]);
        sh.kernel().interrupt(spin);
        sh.poll(&mut host);
        assert!(sh.orphans().is_empty());
        assert!(sh.kernel().sandbox(spin).is_none());
        assert_eq!(sh.task("kept"), Some(kept));
    }
}
