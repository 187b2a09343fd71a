// Fixed-capacity private heap owned by one sandbox.
//
// Layout: [ image bytes | runtime objects (bump) | free ]
// Images loaded through the slow path are pinned at the base; runtime
// objects are bump-allocated above them and rewound by mark.
// Mapped images (fast path) never touch the arena.

use alloc::boxed::Box;
use alloc::vec;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    Exhausted { requested: usize, free: usize },
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::Exhausted { requested, free } => {
                write!(f, "heap exhausted ({} bytes requested, {} free)", requested, free)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

pub struct Arena {
    buf: Box<[u8]>,
    image_len: usize,
    top: usize,
    peak: usize,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            image_len: 0,
            top: 0,
            peak: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn used(&self) -> usize {
        self.top
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    // address of the heap region, shown in stat dumps
    pub fn base_addr(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    // Replaces whatever the arena held with a copy of `bytes`.
    pub fn store_image(&mut self, bytes: &[u8]) -> Result<(), ArenaError> {
        if bytes.len() > self.buf.len() {
            return Err(ArenaError::Exhausted {
                requested: bytes.len(),
                free: self.buf.len(),
            });
        }
        self.buf[..bytes.len()].copy_from_slice(bytes);
        self.image_len = bytes.len();
        self.top = bytes.len();
        self.peak = self.peak.max(self.top);
        Ok(())
    }

    pub fn image(&self) -> &[u8] {
        &self.buf[..self.image_len]
    }

    // pinned image plus a bump heap over the rest
    pub fn split(&mut self) -> (&[u8], Heap<'_>) {
        let base = self.image_len;
        let (image, region) = self.buf.split_at_mut(base);
        (
            image,
            Heap {
                region,
                base,
                top: &mut self.top,
                peak: &mut self.peak,
            },
        )
    }

    // drop runtime objects, keep the pinned image
    pub fn release_runtime(&mut self) {
        self.top = self.image_len;
    }

    // drop everything, image included
    pub fn clear(&mut self) {
        self.image_len = 0;
        self.top = 0;
    }
}

/// Runtime half of an [`Arena`], lent to the interpreter for one dispatch.
pub struct Heap<'a> {
    region: &'a mut [u8],
    base: usize,
    top: &'a mut usize,
    peak: &'a mut usize,
}

impl Heap<'_> {
    pub fn free(&self) -> usize {
        self.region.len() - (*self.top - self.base)
    }

    pub fn alloc(&mut self, len: usize) -> Result<&mut [u8], ArenaError> {
        let free = self.free();
        if len > free {
            return Err(ArenaError::Exhausted {
                requested: len,
                free,
            });
        }
        let start = *self.top - self.base;
        *self.top += len;
        *self.peak = (*self.peak).max(*self.top);
        Ok(&mut self.region[start..start + len])
    }

    pub fn mark(&self) -> Mark {
        Mark(*self.top)
    }

    pub fn rewind(&mut self, mark: Mark) {
        *self.top = mark.0.clamp(self.base, *self.top);
    }
}
