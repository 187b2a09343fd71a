// Line-oriented reference language and its interpreter.
//
// One statement per line, `#` starts a comment line:
//   puts "text" | puts 'text' | puts 42
//   raise "message"
//   sleep <secs> | sleep_ms <ms>
//   pass | Task.pass          yield the rest of the timeslice
//   suspend | Task.suspend    park until resumed
//   loop do ... end
// Arguments may be wrapped in parentheses.
//
// Body opcodes (operands big-endian):
//   0x00 STOP
//   0x01 PUTS    len:u16 bytes
//   0x02 SLEEP   ms:u32
//   0x03 PASS
//   0x04 SUSPEND
//   0x05 JMP     target:u32
//   0x06 RAISE   len:u16 bytes

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt::Write as _;

use super::image;
use super::{CompileError, ErrorClass, ExecCtx, ExecError, Step, Vm};

const OP_STOP: u8 = 0x00;
const OP_PUTS: u8 = 0x01;
const OP_SLEEP: u8 = 0x02;
const OP_PASS: u8 = 0x03;
const OP_SUSPEND: u8 = 0x04;
const OP_JMP: u8 = 0x05;
const OP_RAISE: u8 = 0x06;

#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptVm;

#[derive(Debug)]
pub struct Fiber {
    pc: usize,
}

impl Vm for ScriptVm {
    type Fiber = Fiber;

    fn compile(&self, source: &str) -> Result<Vec<u8>, CompileError> {
        let mut body = Vec::new();
        // (jump target, opening line)
        let mut loops: Vec<(usize, u32)> = Vec::new();
        let mut last_line = 0u32;

        for (idx, raw) in source.lines().enumerate() {
            let line = (idx + 1) as u32;
            last_line = line;
            let stmt = raw.trim();
            if stmt.is_empty() || stmt.starts_with('#') {
                continue;
            }

            let (word, arg) = split_word(stmt);
            let arg = unparen(arg);
            match word {
                "puts" => {
                    let text = if arg.is_empty() {
                        String::new()
                    } else {
                        literal(arg, line)?
                    };
                    emit_str(&mut body, OP_PUTS, &text, line)?;
                }
                "raise" => {
                    let text = if arg.is_empty() {
                        String::from("unhandled exception")
                    } else {
                        literal(arg, line)?
                    };
                    emit_str(&mut body, OP_RAISE, &text, line)?;
                }
                "sleep" => {
                    let secs = number(arg, line)?;
                    body.push(OP_SLEEP);
                    body.extend_from_slice(&secs.saturating_mul(1000).to_be_bytes());
                }
                "sleep_ms" => {
                    let ms = number(arg, line)?;
                    body.push(OP_SLEEP);
                    body.extend_from_slice(&ms.to_be_bytes());
                }
                "pass" | "Task.pass" => {
                    no_args(arg, line)?;
                    body.push(OP_PASS);
                }
                "suspend" | "Task.suspend" => {
                    no_args(arg, line)?;
                    body.push(OP_SUSPEND);
                }
                "loop" => {
                    if arg != "do" {
                        return Err(syntax(line, "expecting 'do' after 'loop'"));
                    }
                    loops.push((body.len(), line));
                }
                "end" => {
                    no_args(arg, line)?;
                    let Some((target, _)) = loops.pop() else {
                        return Err(syntax(line, "unexpected 'end'"));
                    };
                    body.push(OP_JMP);
                    body.extend_from_slice(&(target as u32).to_be_bytes());
                }
                other => {
                    return Err(syntax(line, &format!("unexpected '{}'", other)));
                }
            }
        }

        if let Some(&(_, opened)) = loops.last() {
            return Err(CompileError {
                line: last_line.max(opened),
                message: format!(
                    "syntax error, unexpected end-of-input, expecting 'end' (loop opened on line {})",
                    opened
                ),
            });
        }

        body.push(OP_STOP);
        Ok(image::build(&body))
    }

    fn boot(&self, image: &[u8]) -> Result<Fiber, ExecError> {
        image::body(image)?;
        Ok(Fiber { pc: 0 })
    }

    fn step(&self, fiber: &mut Fiber, image: &[u8], cx: &mut ExecCtx<'_>) -> Step {
        let body = match image::body(image) {
            Ok(body) => body,
            Err(e) => return Step::Fault(e),
        };

        while cx.budget > 0 {
            cx.budget -= 1;
            let at = fiber.pc;
            let Some(&op) = body.get(at) else {
                return Step::Done;
            };

            match op {
                OP_STOP => return Step::Done,
                OP_PUTS => {
                    let Some(text) = operand_str(body, at + 1) else {
                        return bad_operand(at);
                    };
                    fiber.pc = at + 3 + text.len();
                    // the string object lives on the sandbox heap while printed
                    let mark = cx.heap.mark();
                    match cx.heap.alloc(text.len() + 1) {
                        Ok(obj) => {
                            obj[..text.len()].copy_from_slice(text);
                            obj[text.len()] = b'\n';
                            let s = core::str::from_utf8(obj).unwrap_or("?\n");
                            let _ = cx.out.write_str(s);
                        }
                        Err(e) => {
                            return Step::Fault(ExecError::new(
                                ErrorClass::NoMemoryError,
                                e.to_string(),
                            ));
                        }
                    }
                    cx.heap.rewind(mark);
                }
                OP_SLEEP => {
                    let Some(ms) = operand_u32(body, at + 1) else {
                        return bad_operand(at);
                    };
                    fiber.pc = at + 5;
                    return Step::Sleep(ms);
                }
                OP_PASS => {
                    fiber.pc = at + 1;
                    return Step::Yield;
                }
                OP_SUSPEND => {
                    fiber.pc = at + 1;
                    return Step::Suspend;
                }
                OP_JMP => {
                    let Some(target) = operand_u32(body, at + 1) else {
                        return bad_operand(at);
                    };
                    fiber.pc = target as usize;
                }
                OP_RAISE => {
                    let Some(text) = operand_str(body, at + 1) else {
                        return bad_operand(at);
                    };
                    let msg = String::from_utf8_lossy(text).into_owned();
                    return Step::Fault(ExecError::new(ErrorClass::RuntimeError, msg));
                }
                other => {
                    return Step::Fault(ExecError::new(
                        ErrorClass::ImageError,
                        format!("unknown opcode 0x{:02x} at {}", other, at),
                    ));
                }
            }
        }

        Step::Yield
    }
}

// ── Compiler helpers ────────────────────────────────────────────────────

fn syntax(line: u32, detail: &str) -> CompileError {
    CompileError {
        line,
        message: format!("syntax error, {}", detail),
    }
}

fn split_word(stmt: &str) -> (&str, &str) {
    let end = stmt
        .find(|c: char| c.is_whitespace() || c == '(')
        .unwrap_or(stmt.len());
    (&stmt[..end], stmt[end..].trim())
}

fn unparen(arg: &str) -> &str {
    match arg.strip_prefix('(').and_then(|a| a.strip_suffix(')')) {
        Some(inner) => inner.trim(),
        None => arg,
    }
}

fn no_args(arg: &str, line: u32) -> Result<(), CompileError> {
    if arg.is_empty() {
        Ok(())
    } else {
        Err(syntax(line, &format!("unexpected '{}'", arg)))
    }
}

fn number(arg: &str, line: u32) -> Result<u32, CompileError> {
    arg.parse::<u32>()
        .map_err(|_| syntax(line, &format!("expecting integer, got '{}'", arg)))
}

// string or integer literal; nothing may follow it but a comment
fn literal(arg: &str, line: u32) -> Result<String, CompileError> {
    let mut chars = arg.char_indices();
    let quote = match chars.next() {
        Some((_, q @ ('"' | '\''))) => q,
        _ => return number(arg, line).map(|n| n.to_string()),
    };

    let mut out = String::new();
    let mut escaped = false;
    for (i, c) in chars {
        if escaped {
            match (quote, c) {
                ('"', 'n') => out.push('\n'),
                ('"', 't') => out.push('\t'),
                ('"', '0') => out.push('\0'),
                // single quotes only unescape \' and \\
                ('\'', c) if c != '\'' && c != '\\' => {
                    out.push('\\');
                    out.push(c);
                }
                (_, c) => out.push(c),
            }
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            let rest = arg[i + 1..].trim();
            if rest.is_empty() || rest.starts_with('#') {
                return Ok(out);
            }
            return Err(syntax(line, &format!("unexpected '{}'", rest)));
        } else {
            out.push(c);
        }
    }
    Err(syntax(line, "unterminated string meets end of line"))
}

fn emit_str(body: &mut Vec<u8>, op: u8, text: &str, line: u32) -> Result<(), CompileError> {
    let Ok(len) = u16::try_from(text.len()) else {
        return Err(syntax(line, "string literal too long"));
    };
    body.push(op);
    body.extend_from_slice(&len.to_be_bytes());
    body.extend_from_slice(text.as_bytes());
    Ok(())
}

// ── Decoder helpers ─────────────────────────────────────────────────────

fn operand_u32(body: &[u8], at: usize) -> Option<u32> {
    let b = body.get(at..at.checked_add(4)?)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn operand_str(body: &[u8], at: usize) -> Option<&[u8]> {
    let start = at.checked_add(2)?;
    let b = body.get(at..start)?;
    let len = u16::from_be_bytes([b[0], b[1]]) as usize;
    body.get(start..start.checked_add(len)?)
}

fn bad_operand(at: usize) -> Step {
    Step::Fault(ExecError::new(
        ErrorClass::ImageError,
        format!("truncated operand at {}", at),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::arena::Arena;
    use crate::sandbox::{TaskCtx, TaskId};

    fn run(vm: &ScriptVm, image: &[u8], arena: &mut Arena, out: &mut String, budget: u32) -> Step {
        let mut fiber = vm.boot(image).unwrap();
        let (_, heap) = arena.split();
        let mut cx = ExecCtx {
            task: TaskCtx {
                id: TaskId::new(1),
                tick: 0,
            },
            heap,
            out,
            budget,
        };
        vm.step(&mut fiber, image, &mut cx)
    }

    #[test]
    fn puts_compiles_to_a_magic_prefixed_image_and_prints() {
        let vm = ScriptVm;
        let img = vm.compile("puts \"hi\"\n").unwrap();
        assert!(image::is_image(&img));

        let mut heap = Arena::new(64);
        let mut out = String::new();
        assert_eq!(run(&vm, &img, &mut heap, &mut out, 32), Step::Done);
        assert_eq!(out, "hi\n");
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn literals_and_comments() {
        let vm = ScriptVm;
        let src = "# greeting\nputs(\"a\\tb # not a comment\")\nputs 'it\\'s' # trailing\nputs 42\nputs\n";
        let img = vm.compile(src).unwrap();
        let mut heap = Arena::new(128);
        let mut out = String::new();
        assert_eq!(run(&vm, &img, &mut heap, &mut out, 32), Step::Done);
        assert_eq!(out, "a\tb # not a comment\nit's\n42\n\n");
    }

    #[test]
    fn syntax_errors_carry_the_line() {
        let vm = ScriptVm;
        let err = vm.compile("puts \"ok\"\nputs \"unterminated\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.starts_with("syntax error"));

        assert_eq!(vm.compile("end\n").unwrap_err().line, 1);
        assert_eq!(vm.compile("frobnicate 3\n").unwrap_err().line, 1);
        assert_eq!(vm.compile("sleep soon\n").unwrap_err().line, 1);
        assert_eq!(vm.compile("puts \"a\" \"b\"\n").unwrap_err().line, 1);

        let err = vm.compile("loop do\n  pass\n").unwrap_err();
        assert!(err.message.contains("end-of-input"));
    }

    #[test]
    fn endless_loop_yields_when_budget_runs_out() {
        let vm = ScriptVm;
        let img = vm.compile("loop do\nend\n").unwrap();
        let mut heap = Arena::new(64);
        let mut out = String::new();
        assert_eq!(run(&vm, &img, &mut heap, &mut out, 16), Step::Yield);
    }

    #[test]
    fn control_statements_hand_back_the_core() {
        let vm = ScriptVm;
        let img = vm.compile("sleep 2\nsleep_ms 15\nTask.pass\nsuspend\n").unwrap();
        let mut fiber = vm.boot(&img).unwrap();
        let mut arena = Arena::new(64);
        let mut out = String::new();
        let mut cx = ExecCtx {
            task: TaskCtx {
                id: TaskId::new(7),
                tick: 0,
            },
            heap: arena.split().1,
            out: &mut out,
            budget: 100,
        };
        assert_eq!(vm.step(&mut fiber, &img, &mut cx), Step::Sleep(2000));
        assert_eq!(vm.step(&mut fiber, &img, &mut cx), Step::Sleep(15));
        assert_eq!(vm.step(&mut fiber, &img, &mut cx), Step::Yield);
        assert_eq!(vm.step(&mut fiber, &img, &mut cx), Step::Suspend);
        assert_eq!(vm.step(&mut fiber, &img, &mut cx), Step::Done);
    }

    #[test]
    fn raise_and_heap_exhaustion_fault() {
        let vm = ScriptVm;
        let img = vm.compile("raise \"boom\"\n").unwrap();
        let mut heap = Arena::new(64);
        let mut out = String::new();
        let Step::Fault(err) = run(&vm, &img, &mut heap, &mut out, 8) else {
            panic!("expected fault");
        };
        assert_eq!(err.class, ErrorClass::RuntimeError);
        assert_eq!(err.message, "boom");

        let img = vm.compile("puts \"0123456789abcdef\"\n").unwrap();
        let mut tiny = Arena::new(8);
        let Step::Fault(err) = run(&vm, &img, &mut tiny, &mut out, 8) else {
            panic!("expected fault");
        };
        assert_eq!(err.class, ErrorClass::NoMemoryError);
    }

    #[test]
    fn boot_rejects_foreign_bytes() {
        assert!(ScriptVm.boot(b"puts 1").is_err());
        assert!(ScriptVm.boot(b"RITE0300\xff\xff\xff\xff\x01").is_err());
    }

    #[test]
    fn operands_near_the_address_limit_decode_as_missing() {
        let body = [0x01, 0x00, 0x02, b'o', b'k'];
        assert_eq!(operand_str(&body, 1), Some(&b"ok"[..]));
        assert_eq!(operand_str(&body, usize::MAX - 1), None);
        assert_eq!(operand_str(&body, usize::MAX), None);
        assert_eq!(operand_u32(&body, usize::MAX - 2), None);
    }
}
