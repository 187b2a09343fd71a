// Compile/load pipeline
//
// name -> resolved path -> open -> one of four routes:
//   mapped + magic     run the image in place (no copy, no read)
//   mapped, no magic   compile straight from the mapped text
//   buffered + magic   copy the image into the unit's arena
//   buffered, no magic compile the buffered text
// A resource over max_load is never taken for an image: it is read in
// chunks and compiled as source.
// The file handle is closed on every exit path by the OpenFile guard.
// run() then launches and, if asked, joins through the wait controller.
// A unit's uncaught error comes back as RunOutcome::Failed, never as Err.

use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use embedded_hal::delay::DelayNs;
use log::{info, warn};

use crate::config::KernelConfig;
use crate::drivers::{Console, Host, StorageError, Volume};
use crate::kernel::{Kernel, RegistryError, WaitOptions, WaitOutcome, wait};
use crate::sandbox::arena::ArenaError;
use crate::sandbox::{State, TaskId};
use crate::vm::{CompileError, ErrorClass, ExecError, Vm, is_image};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Not found under any search path
    NotFound(String),
    Storage(StorageError),
    Compile(CompileError),
    HeapExhausted(ArenaError),
    Busy(TaskId),
    NoSuchTask(TaskId),
    Registry(RegistryError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::NotFound(name) => write!(f, "{}: not found", name),
            LoadError::Storage(e) => write!(f, "storage: {}", e),
            LoadError::Compile(e) => write!(f, "compile error: {}", e),
            LoadError::HeapExhausted(e) => write!(f, "{}", e),
            LoadError::Busy(id) => write!(f, "task {} is running", id),
            LoadError::NoSuchTask(id) => write!(f, "no task {}", id),
            LoadError::Registry(e) => write!(f, "{}", e),
        }
    }
}

impl From<StorageError> for LoadError {
    fn from(e: StorageError) -> Self {
        LoadError::Storage(e)
    }
}

impl From<RegistryError> for LoadError {
    fn from(e: RegistryError) -> Self {
        LoadError::Registry(e)
    }
}

/// Which way a resource got into its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    MappedImage,
    MappedSource,
    BufferedImage,
    BufferedSource,
}

impl Route {
    pub const fn is_fast(self) -> bool {
        matches!(self, Route::MappedImage | Route::MappedSource)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// load into this dormant unit instead of a fresh unnamed one
    pub task: Option<TaskId>,
    /// block until the unit is dormant again
    pub join: bool,
    pub wait: WaitOptions,
}

impl LoadOptions {
    pub const fn join(wait: WaitOptions) -> Self {
        Self {
            task: None,
            join: true,
            wait,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// started, not joined
    Launched(TaskId),
    Completed(TaskId),
    /// ended with an uncaught error, or the image was rejected at launch
    Failed(TaskId, ExecError),
    Interrupted(TaskId),
    TimedOut(TaskId),
}

impl RunOutcome {
    pub fn task(&self) -> TaskId {
        match self {
            RunOutcome::Launched(id)
            | RunOutcome::Completed(id)
            | RunOutcome::Failed(id, _)
            | RunOutcome::Interrupted(id)
            | RunOutcome::TimedOut(id) => *id,
        }
    }
}

// closes the handle however the load ends
struct OpenFile<'v, FS: Volume> {
    vol: &'v mut FS,
    handle: FS::Handle,
}

impl<FS: Volume> Drop for OpenFile<'_, FS> {
    fn drop(&mut self) {
        self.vol.close(self.handle);
    }
}

/// Opens `name`: absolute paths as given, anything else against each
/// search directory in order, then as given.
fn open<'v, FS: Volume>(
    vol: &'v mut FS,
    config: &KernelConfig,
    name: &str,
) -> Result<(OpenFile<'v, FS>, String), LoadError> {
    let mut candidates = vec![];
    if !name.starts_with('/') {
        for dir in &config.load_path {
            candidates.push(format!("{}/{}", dir, name));
        }
    }
    candidates.push(String::from(name));

    for path in candidates {
        match vol.open(&path) {
            Ok(handle) => return Ok((OpenFile { vol, handle }, path)),
            Err(StorageError::NotFound) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(LoadError::NotFound(String::from(name)))
}

/// Puts the resource `name` into unit `id` as a runnable image. The unit
/// must be dormant. Does not launch it.
pub fn load<V: Vm, FS: Volume>(
    kernel: &mut Kernel<V>,
    vol: &mut FS,
    id: TaskId,
    name: &str,
) -> Result<Route, LoadError> {
    match kernel.state(id) {
        None => return Err(LoadError::NoSuchTask(id)),
        Some(State::Dormant) => {}
        Some(_) => return Err(LoadError::Busy(id)),
    }

    let (mut file, path) = open(vol, kernel.config(), name)?;

    if let Some(bytes) = file.vol.physical_address(file.handle) {
        if is_image(bytes) {
            info!("load {}: image mapped at {:p}", path, bytes.as_ptr());
            let unit = kernel.sandbox_mut(id).ok_or(LoadError::NoSuchTask(id))?;
            unit.map_image(bytes);
            return Ok(Route::MappedImage);
        }
        info!("load {}: compiling mapped source", path);
        compile(kernel, id, bytes)?;
        return Ok(Route::MappedSource);
    }

    let size = file.vol.size(file.handle)?;
    let limit = kernel.config().max_load;
    if size > limit {
        info!("load {}: {} bytes over {}, compiling as source", path, size, limit);
        let text = read_chunked(&mut file, size)?;
        drop(file);
        compile(kernel, id, &text)?;
        return Ok(Route::BufferedSource);
    }

    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.vol.read(file.handle, filled, &mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    drop(file);

    if is_image(&buf) {
        info!("load {}: image read ({} bytes)", path, buf.len());
        let unit = kernel.sandbox_mut(id).ok_or(LoadError::NoSuchTask(id))?;
        unit.load_image(&buf).map_err(LoadError::HeapExhausted)?;
        return Ok(Route::BufferedImage);
    }
    info!("load {}: compiling {} bytes of source", path, buf.len());
    compile(kernel, id, &buf)?;
    Ok(Route::BufferedSource)
}

const READ_CHUNK: usize = 512;

// source text bigger than one load buffer, pulled in a chunk at a time
fn read_chunked<FS: Volume>(file: &mut OpenFile<'_, FS>, size: usize) -> Result<Vec<u8>, LoadError> {
    let mut text = Vec::with_capacity(size);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = file.vol.read(file.handle, text.len(), &mut chunk)?;
        if n == 0 {
            return Ok(text);
        }
        text.extend_from_slice(&chunk[..n]);
    }
}

fn compile<V: Vm>(kernel: &mut Kernel<V>, id: TaskId, text: &[u8]) -> Result<(), LoadError> {
    let Ok(source) = core::str::from_utf8(text) else {
        return Err(LoadError::Compile(CompileError {
            line: 0,
            message: String::from("source is not valid UTF-8"),
        }));
    };
    if kernel.compile(id, source) {
        return Ok(());
    }
    let err = kernel
        .sandbox(id)
        .and_then(|u| u.compile_error())
        .cloned()
        .unwrap_or(CompileError {
            line: 0,
            message: String::from("compile failed"),
        });
    Err(LoadError::Compile(err))
}

/// Loads `name`, launches it, and joins if `opts.join` is set.
///
/// A fresh unit made for this call is destroyed again if loading fails.
pub fn run<V, FS, C, D>(
    kernel: &mut Kernel<V>,
    vol: &mut FS,
    host: &mut Host<'_, C, D>,
    name: &str,
    opts: &LoadOptions,
) -> Result<RunOutcome, LoadError>
where
    V: Vm,
    FS: Volume,
    C: Console,
    D: DelayNs,
{
    let (id, fresh) = match opts.task {
        Some(id) => (id, false),
        None => (kernel.create(None)?, true),
    };

    if let Err(e) = load(kernel, vol, id, name) {
        warn!("run {}: {}", name, e);
        if fresh {
            let _ = kernel.destroy(id);
        }
        return Err(e);
    }

    if !kernel.execute(id) {
        let err = kernel
            .error(id)
            .cloned()
            .unwrap_or_else(|| ExecError::new(ErrorClass::ImageError, "nothing to run"));
        return Ok(RunOutcome::Failed(id, err));
    }
    if !opts.join {
        return Ok(RunOutcome::Launched(id));
    }

    Ok(match wait(kernel, id, opts.wait, host) {
        WaitOutcome::Completed => match kernel.error(id) {
            Some(e) => RunOutcome::Failed(id, e.clone()),
            None => RunOutcome::Completed(id),
        },
        WaitOutcome::Interrupted => RunOutcome::Interrupted(id),
        WaitOutcome::TimedOut => RunOutcome::TimedOut(id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemVolume;
    use crate::testing::{CountingDelay, ScriptedConsole};
    use crate::vm::ScriptVm;
    use crate::vm::image;

    // body: PUTS "demo", STOP
    static DEMO: &[u8] = b"RITE0300\x00\x00\x00\x08\x01\x00\x04demo\x00";

    fn setup() -> (Kernel<ScriptVm>, MemVolume) {
        let mut vol = MemVolume::new();
        vol.add_mapped("/bin/demo", DEMO);
        (Kernel::new(ScriptVm, KernelConfig::defaults()), vol)
    }

    fn join() -> LoadOptions {
        LoadOptions::join(WaitOptions::signal())
    }

    #[test]
    fn demo_image_takes_the_mapped_path() {
        let (mut k, mut vol) = setup();
        let id = k.create(Some("demo")).unwrap();
        assert_eq!(load(&mut k, &mut vol, id, "/bin/demo"), Ok(Route::MappedImage));
        assert_eq!(vol.bytes_read(), 0);
        assert_eq!(vol.open_handles(), 0);
        let unit = k.sandbox(id).unwrap();
        assert!(unit.is_mapped());
        assert_eq!(unit.arena().used(), 0);

        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);
        let opts = LoadOptions {
            task: Some(id),
            ..join()
        };
        let outcome = run(&mut k, &mut vol, &mut host, "/bin/demo", &opts).unwrap();
        assert_eq!(outcome, RunOutcome::Completed(id));
        assert_eq!(con.output(), "demo\n");
        assert_eq!(k.state(id), Some(State::Dormant));
        assert_eq!(vol.bytes_read(), 0);
    }

    #[test]
    fn app_rb_compiles_and_runs() {
        let (mut k, mut vol) = setup();
        vol.add_file("app.rb", b"puts \"hi\"\n");
        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        let outcome = run(&mut k, &mut vol, &mut host, "app.rb", &join()).unwrap();
        let RunOutcome::Completed(id) = outcome else {
            panic!("unexpected {:?}", outcome);
        };
        assert_eq!(con.output(), "hi\n");
        assert_eq!(k.state(id), Some(State::Dormant));
        assert!(k.error(id).is_none());
        assert_eq!(vol.open_handles(), 0);
    }

    #[test]
    fn search_path_order_and_absolute_override() {
        let (mut k, mut vol) = setup();
        vol.add_file("/lib/x.rb", b"puts \"lib\"\n");
        vol.add_file("/bin/x.rb", b"puts \"bin\"\n");
        vol.add_file("x.rb", b"puts \"cwd\"\n");
        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        run(&mut k, &mut vol, &mut host, "x.rb", &join()).unwrap();
        run(&mut k, &mut vol, &mut host, "/bin/x.rb", &join()).unwrap();
        drop(host);
        assert_eq!(con.output(), "lib\nbin\n");

        assert_eq!(
            run(&mut k, &mut vol, &mut Host::new(&mut con, &mut delay), "nope.rb", &join()),
            Err(LoadError::NotFound(String::from("nope.rb")))
        );
    }

    #[test]
    fn buffered_image_is_copied_into_the_arena() {
        let (mut k, mut vol) = setup();
        let img = ScriptVm.compile("puts \"copied\"\n").unwrap();
        vol.add_file("/lib/c.mrb", &img);
        let id = k.create(None).unwrap();
        assert_eq!(load(&mut k, &mut vol, id, "c.mrb"), Ok(Route::BufferedImage));
        assert_eq!(vol.bytes_read(), img.len());
        assert_eq!(k.sandbox(id).unwrap().arena().image(), &img[..]);
        assert!(!Route::BufferedImage.is_fast());
    }

    #[test]
    fn mapped_source_is_compiled_in_place() {
        static SRC: &[u8] = b"puts \"flash\"\n";
        let (mut k, mut vol) = setup();
        vol.add_mapped("/bin/f.rb", SRC);
        let id = k.create(None).unwrap();
        assert_eq!(load(&mut k, &mut vol, id, "f.rb"), Ok(Route::MappedSource));
        assert_eq!(vol.bytes_read(), 0);
        assert!(image::is_image(k.sandbox(id).unwrap().arena().image()));
    }

    #[test]
    fn compile_failure_reports_and_closes_the_file() {
        let (mut k, mut vol) = setup();
        vol.add_file("bad.rb", b"puts \"ok\"\nputs 'oops\n");
        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        let before = k.stat().total();
        let err = run(&mut k, &mut vol, &mut host, "bad.rb", &join()).unwrap_err();
        let LoadError::Compile(e) = err else {
            panic!("unexpected {:?}", err);
        };
        assert_eq!(e.line, 2);
        assert_eq!(vol.open_handles(), 0);
        // the throwaway unit is gone again
        assert_eq!(k.stat().total(), before);
    }

    #[test]
    fn uncaught_error_is_surfaced_not_raised() {
        let (mut k, mut vol) = setup();
        vol.add_file("boom.rb", b"puts \"pre\"\nraise \"boom\"\n");
        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        let outcome = run(&mut k, &mut vol, &mut host, "boom.rb", &join()).unwrap();
        let RunOutcome::Failed(id, e) = outcome else {
            panic!("unexpected {:?}", outcome);
        };
        assert_eq!(e.class, ErrorClass::RuntimeError);
        assert_eq!(e.message, "boom");
        assert_eq!(k.state(id), Some(State::Dormant));
    }

    #[test]
    fn oversized_resource_is_compiled_as_source() {
        let (mut k, mut vol) = setup();
        let mut big = Vec::from(&b"puts \"big\"\n"[..]);
        big.resize(k.config().max_load + 1000, b'#');
        big.push(b'\n');
        vol.add_file("big.rb", &big);
        let id = k.create(None).unwrap();
        assert_eq!(load(&mut k, &mut vol, id, "big.rb"), Ok(Route::BufferedSource));
        assert_eq!(vol.open_handles(), 0);
        assert_eq!(vol.bytes_read(), big.len());

        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);
        let opts = LoadOptions {
            task: Some(id),
            ..join()
        };
        assert_eq!(run(&mut k, &mut vol, &mut host, "big.rb", &opts), Ok(RunOutcome::Completed(id)));
        drop(host);
        assert_eq!(con.output(), "big\n");
    }

    #[test]
    fn oversized_resource_is_not_taken_for_an_image() {
        let (mut k, mut vol) = setup();
        let mut big = Vec::from(&image::IMAGE_MAGIC[..]);
        big.push(b'\n');
        big.resize(k.config().max_load + 1, b'#');
        vol.add_file("huge.mrb", &big);
        let id = k.create(None).unwrap();
        let err = load(&mut k, &mut vol, id, "huge.mrb").unwrap_err();
        assert!(matches!(err, LoadError::Compile(ref e) if e.line == 1));
        assert_eq!(vol.open_handles(), 0);
        assert!(!k.sandbox(id).unwrap().is_mapped());
    }

    #[test]
    fn running_unit_cannot_be_reloaded() {
        let (mut k, mut vol) = setup();
        vol.add_file("spin.rb", b"loop do\npass\nend\n");
        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        let outcome = run(&mut k, &mut vol, &mut host, "spin.rb", &LoadOptions::default()).unwrap();
        let id = outcome.task();
        assert_eq!(outcome, RunOutcome::Launched(id));
        assert_eq!(load(&mut k, &mut vol, id, "spin.rb"), Err(LoadError::Busy(id)));
        assert_eq!(
            load(&mut k, &mut vol, TaskId::new(404), "spin.rb"),
            Err(LoadError::NoSuchTask(TaskId::new(404)))
        );
    }

    #[test]
    fn join_with_timeout_leaves_the_unit_running() {
        let (mut k, mut vol) = setup();
        vol.add_file("spin.rb", b"loop do\npass\nend\n");
        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        let opts = LoadOptions::join(WaitOptions::timeout(30));
        let outcome = run(&mut k, &mut vol, &mut host, "spin.rb", &opts).unwrap();
        assert_eq!(outcome, RunOutcome::TimedOut(outcome.task()));
        assert_eq!(k.state(outcome.task()), Some(State::Ready));
    }

    #[test]
    fn corrupt_image_fails_at_launch() {
        static TRUNCATED: &[u8] = b"RITE0300\x00\x00\x01\x00\x01";
        let (mut k, mut vol) = setup();
        vol.add_mapped("/bin/broken", TRUNCATED);
        let mut con = ScriptedConsole::new();
        let mut delay = CountingDelay::default();
        let mut host = Host::new(&mut con, &mut delay);

        let outcome = run(&mut k, &mut vol, &mut host, "broken", &join()).unwrap();
        let RunOutcome::Failed(id, e) = outcome else {
            panic!("unexpected {:?}", outcome);
        };
        assert_eq!(e.class, ErrorClass::ImageError);
        assert_eq!(k.state(id), Some(State::Dormant));
    }
}
