// Compiler/interpreter seam.
//
// The engine treats the VM as a black box: compile(text) -> image, and a
// fiber that is stepped cooperatively over that image by the scheduler.
// A step runs until the instruction budget is spent or the program asks
// to sleep, suspend, finish, or fails; it never blocks.

pub mod image;
pub mod script;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::sandbox::TaskCtx;
use crate::sandbox::arena::Heap;

pub use image::{IMAGE_MAGIC, is_image};
pub use script::ScriptVm;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Classification of an uncaught failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RuntimeError,
    NoMemoryError,
    ImageError,
}

impl ErrorClass {
    pub const fn name(self) -> &'static str {
        match self {
            ErrorClass::RuntimeError => "RuntimeError",
            ErrorClass::NoMemoryError => "NoMemoryError",
            ErrorClass::ImageError => "ImageError",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An uncaught failure captured on a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecError {
    pub class: ErrorClass,
    pub message: String,
}

impl ExecError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// What a fiber asked for when it handed control back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// budget spent or explicit pass; still runnable
    Yield,
    /// timed wait, milliseconds
    Sleep(u32),
    /// park until resumed
    Suspend,
    Done,
    Fault(ExecError),
}

/// Everything a fiber may touch while it holds the core.
pub struct ExecCtx<'a> {
    pub task: TaskCtx,
    pub heap: Heap<'a>,
    pub out: &'a mut dyn fmt::Write,
    /// remaining instructions for this dispatch
    pub budget: u32,
}

pub trait Vm {
    /// Per-launch interpreter state.
    type Fiber;

    fn compile(&self, source: &str) -> Result<Vec<u8>, CompileError>;

    fn boot(&self, image: &[u8]) -> Result<Self::Fiber, ExecError>;

    fn step(&self, fiber: &mut Self::Fiber, image: &[u8], cx: &mut ExecCtx<'_>) -> Step;
}
