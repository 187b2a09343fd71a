// Kernel tunables with a text-based key=value format (KERNEL.TXT).
// Unknown keys are ignored; values are clamped after parsing.

use alloc::string::String;
use alloc::vec::Vec;

pub const CONFIG_FILE: &str = "KERNEL.TXT";

// search directories beyond this are ignored
pub const MAX_LOAD_PATHS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    pub quantum_ms: u32,        // wait poll quantum
    pub timeslice: u16,         // interpreter instructions per dispatch
    pub heap_size: usize,       // per-sandbox arena, bytes
    pub max_load: usize,        // largest resource read into a buffer
    pub priority: u8,           // default task priority; 0 runs first
    pub load_path: Vec<String>, // relative names are tried against these, in order
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

impl KernelConfig {
    pub fn defaults() -> Self {
        Self {
            quantum_ms: 5,
            timeslice: 32,
            heap_size: 16 * 1024,
            max_load: 8 * 1024,
            priority: 128,
            load_path: alloc::vec![String::from("/lib"), String::from("/bin")],
        }
    }

    pub fn parse(text: &[u8]) -> Self {
        let mut cfg = Self::defaults();
        for line in text.split(|&b| b == b'\n') {
            let line = trim(line);
            if line.is_empty() || line[0] == b'#' {
                continue;
            }
            let Some(eq) = line.iter().position(|&b| b == b'=') else {
                continue;
            };
            cfg.apply(trim(&line[..eq]), trim(&line[eq + 1..]));
        }
        cfg.sanitize();
        cfg
    }

    fn apply(&mut self, key: &[u8], val: &[u8]) {
        match key {
            b"quantum_ms" => {
                if let Some(v) = parse_u32(val) {
                    self.quantum_ms = v;
                }
            }
            b"timeslice" => {
                if let Some(v) = parse_u32(val) {
                    self.timeslice = v.min(u16::MAX as u32) as u16;
                }
            }
            b"heap_size" => {
                if let Some(v) = parse_u32(val) {
                    self.heap_size = v as usize;
                }
            }
            b"max_load" => {
                if let Some(v) = parse_u32(val) {
                    self.max_load = v as usize;
                }
            }
            b"priority" => {
                if let Some(v) = parse_u32(val) {
                    self.priority = v.min(u8::MAX as u32) as u8;
                }
            }
            b"load_path" => {
                self.load_path = val
                    .split(|&b| b == b':')
                    .map(trim)
                    .filter(|p| !p.is_empty())
                    .take(MAX_LOAD_PATHS)
                    .filter_map(|p| core::str::from_utf8(p).ok())
                    .map(|p| String::from(p.trim_end_matches('/')))
                    .collect();
            }
            _ => {}
        }
    }

    fn sanitize(&mut self) {
        self.quantum_ms = self.quantum_ms.clamp(1, 100);
        self.timeslice = self.timeslice.clamp(1, 1024);
        self.heap_size = self.heap_size.clamp(1024, 256 * 1024);
        self.max_load = self.max_load.min(self.heap_size);
    }
}

fn trim(s: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = s.len();
    while start < end && matches!(s[start], b' ' | b'\t' | b'\r') {
        start += 1;
    }
    while end > start && matches!(s[end - 1], b' ' | b'\t' | b'\r') {
        end -= 1;
    }
    &s[start..end]
}

fn parse_u32(s: &[u8]) -> Option<u32> {
    if s.is_empty() {
        return None;
    }
    let mut val: u32 = 0;
    for &b in s {
        if !b.is_ascii_digit() {
            return None;
        }
        val = val.checked_mul(10)?.checked_add((b - b'0') as u32)?;
    }
    Some(val)
}
