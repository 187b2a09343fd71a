// rite-kernel firmware entry point and main loop (ESP32-C3)
//
// Boot sequence: logger -> heap -> watchdog -> UART console -> boot
// button irq -> flash volume -> kernel -> run /bin/hello -> prompt
// Main loop: read console byte -> feed watchdog, drain irq events, one
// scheduler turn -> sleep one quantum -> repeat. A blocking run does the
// same per quantum inside the wait controller.
//
// A full line at the prompt is either a built-in (stat, run, start,
// suspend, resume, kill, rm) or a script line for the REPL unit.
// Ctrl-C while a line runs interrupts it; GPIO9 (BOOT) raises an irq
// event handled on the cooperative side.

#![no_std]
#![no_main]

use core::cell::RefCell;
use core::fmt::Write as _;

use critical_section::Mutex;
use embedded_hal::delay::DelayNs;
use esp_backtrace as _;
use esp_hal::clock::CpuClock;
use esp_hal::delay::Delay;
use esp_hal::gpio::{Event, Input, InputConfig, Io, Pull};
use esp_hal::time::Duration;
use esp_hal::timer::timg::{MwdtStage, TimerGroup, Wdt};
use esp_hal::uart::{self, Uart};
use log::{info, warn};

use rite_kernel::config::{CONFIG_FILE, KernelConfig};
use rite_kernel::drivers::{Console, Host, MemVolume, Volume, Watchdog, WatchdogError};
use rite_kernel::irq::{Backend, EventKind, EventMask, GpioIrq, IrqHub, IrqLine, IrqOptions, Source};
use rite_kernel::kernel::CTRL_C;
use rite_kernel::loader::RunOutcome;
use rite_kernel::shell::Shell;
use rite_kernel::vm::ScriptVm;

extern crate alloc;

esp_bootloader_esp_idf::esp_app_desc!();

const BOOT_BUTTON_PIN: u8 = 9;
const LINE_CAP: usize = 128;
const WDT_TIMEOUT_SECS: u64 = 5;

// body: PUTS "hello from flash", STOP
static HELLO_IMG: &[u8] = b"RITE0300\x00\x00\x00\x14\x01\x00\x10hello from flash\x00";

static BLINK_RB: &[u8] = b"# heartbeat\nloop do\n  puts \"tick\"\n  sleep 10\nend\n";

static KERNEL_TXT: &[u8] = b"# kernel tunables\nquantum_ms=5\ntimeslice=64\nheap_size=16384\n";

static GPIO_LINE: IrqLine = IrqLine::new();

static BUTTON: Mutex<RefCell<Option<Input<'static>>>> = Mutex::new(RefCell::new(None));

#[esp_hal::handler(priority = esp_hal::interrupt::Priority::Priority1)]
fn gpio_handler() {
    let fired = critical_section::with(|cs| {
        let mut button = BUTTON.borrow_ref_mut(cs);
        let Some(button) = button.as_mut() else {
            return false;
        };
        let fired = button.is_interrupt_set();
        button.clear_interrupt();
        fired
    });
    if fired {
        GPIO_LINE.raise(BOOT_BUTTON_PIN, EventKind::FallingEdge);
    }
}

struct UartConsole {
    uart: Uart<'static, esp_hal::Blocking>,
}

impl core::fmt::Write for UartConsole {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.uart.write_str(s)
    }
}

impl Console for UartConsole {
    type Error = uart::RxError;

    fn read_byte(&mut self) -> nb::Result<u8, uart::RxError> {
        if !self.uart.read_ready() {
            return Err(nb::Error::WouldBlock);
        }
        let mut b = [0u8; 1];
        match self.uart.read(&mut b) {
            Ok(1) => Ok(b[0]),
            Ok(_) => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(e)),
        }
    }
}

struct Timg1Watchdog {
    wdt: Wdt<esp_hal::peripherals::TIMG1<'static>>,
    enabled: bool,
}

impl Watchdog for Timg1Watchdog {
    fn feed(&mut self) {
        if self.enabled {
            self.wdt.feed();
        }
    }

    fn disable(&mut self) -> Result<(), WatchdogError> {
        self.wdt.disable();
        self.enabled = false;
        Ok(())
    }
}

#[esp_hal::main]
fn main() -> ! {
    esp_println::logger::init_logger_from_env();
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);
    esp_alloc::heap_allocator!(size: 160 * 1024);

    info!("booting...");

    let timg1 = TimerGroup::new(peripherals.TIMG1);
    let mut wdt = timg1.wdt;
    wdt.set_timeout(MwdtStage::Stage0, Duration::from_secs(WDT_TIMEOUT_SECS));
    wdt.enable();
    let mut watchdog = Timg1Watchdog { wdt, enabled: true };
    info!("watchdog armed ({}s).", WDT_TIMEOUT_SECS);

    let uart = Uart::new(peripherals.UART0, uart::Config::default())
        .unwrap()
        .with_rx(peripherals.GPIO20)
        .with_tx(peripherals.GPIO21);
    let mut console = UartConsole { uart };
    let mut delay = Delay::new();

    let mut io = Io::new(peripherals.IO_MUX);
    io.set_interrupt_handler(gpio_handler);
    let mut button = Input::new(peripherals.GPIO9, InputConfig::default().with_pull(Pull::Up));
    critical_section::with(|cs| {
        button.listen(Event::FallingEdge);
        BUTTON.borrow_ref_mut(cs).replace(button);
    });

    let mut irq: IrqHub<'static, u32> = IrqHub::new();
    irq.attach(Backend::Gpio(GpioIrq::new(&GPIO_LINE)));
    let button_irq = irq
        .register(
            Source::gpio(BOOT_BUTTON_PIN),
            EventMask::FALLING,
            IrqOptions::capture(0),
            |ev, presses| {
                *presses += 1;
                info!("{} pressed ({} so far)", ev.source, presses);
                Ok(())
            },
        )
        .unwrap();
    info!("irq ready ({}).", button_irq);

    let mut vol = MemVolume::new();
    vol.add_mapped("/bin/hello", HELLO_IMG);
    vol.add_mapped("/lib/blink.rb", BLINK_RB);
    vol.add_mapped("/KERNEL.TXT", KERNEL_TXT);
    let kcfg = load_config(&mut vol);
    let quantum = kcfg.quantum_ms;

    let mut shell = Shell::new(ScriptVm, kcfg, vol);
    info!("kernel ready.");

    {
        let mut host = Host::new(&mut console, &mut delay)
            .with_watchdog(&mut watchdog)
            .with_events(&mut irq);
        match shell.run(&mut host, "/bin/hello") {
            Ok(RunOutcome::Completed(_)) => {}
            other => warn!("boot image: {:?}", other),
        }
        if let Err(e) = shell.start("blink", "blink.rb") {
            warn!("blink: {}", e);
        }
        let _ = host.console.write_str("> ");
    }

    let mut line: line_buf::Line<LINE_CAP> = line_buf::Line::new();

    loop {
        let mut host = Host::new(&mut console, &mut delay)
            .with_watchdog(&mut watchdog)
            .with_events(&mut irq);

        match host.console.read_byte() {
            Ok(b'\r' | b'\n') => {
                let _ = host.console.write_str("\r\n");
                if let Some(text) = line.take() {
                    dispatch(&mut shell, &mut host, &text);
                }
                let _ = host.console.write_str("> ");
            }
            Ok(CTRL_C) => {
                line.clear();
                let _ = host.console.write_str("^C\r\n> ");
            }
            Ok(b) => {
                if line.push(b) {
                    let _ = host.console.write_char(b as char);
                }
            }
            Err(_) => {}
        }

        shell.poll(&mut host);
        host.delay.delay_ms(quantum);
    }
}

fn load_config(vol: &mut MemVolume) -> KernelConfig {
    let path = alloc::format!("/{}", CONFIG_FILE);
    let Ok(file) = vol.open(&path) else {
        info!("no {}, using defaults", CONFIG_FILE);
        return KernelConfig::defaults();
    };
    let cfg = match vol.physical_address(file) {
        Some(text) => KernelConfig::parse(text),
        None => KernelConfig::defaults(),
    };
    vol.close(file);
    info!(
        "{}: quantum {}ms, timeslice {}, heap {}",
        CONFIG_FILE, cfg.quantum_ms, cfg.timeslice, cfg.heap_size
    );
    cfg
}

fn dispatch<C: Console, D: DelayNs>(
    shell: &mut Shell<ScriptVm, MemVolume>,
    host: &mut Host<'_, C, D>,
    text: &str,
) {
    let (cmd, arg) = match text.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (text, ""),
    };
    let res = match cmd {
        "stat" => {
            let _ = host.console.write_str(&shell.stat());
            Ok(())
        }
        "run" => shell.run(host, arg).map(|_| ()),
        "start" => match arg.split_once(' ') {
            Some((name, path)) => shell.start(name, path.trim()).map(|_| ()),
            None => shell.start(arg, arg).map(|_| ()),
        },
        "suspend" => shell.suspend(arg),
        "resume" => shell.resume(arg),
        "kill" => shell.kill(arg),
        "rm" => shell.remove(arg),
        _ => shell.compile_and_run(host, text).map(|_| ()),
    };
    if let Err(e) = res {
        let _ = writeln!(host.console, "{}", e);
    }
}

mod line_buf {
    use alloc::string::String;

    // input line with a hard cap; bytes past it are dropped
    pub struct Line<const N: usize> {
        buf: [u8; N],
        len: usize,
    }

    impl<const N: usize> Line<N> {
        pub const fn new() -> Self {
            Self { buf: [0; N], len: 0 }
        }

        pub fn push(&mut self, b: u8) -> bool {
            if self.len >= N || !(b == b'\t' || (0x20..0x7f).contains(&b)) {
                return false;
            }
            self.buf[self.len] = b;
            self.len += 1;
            true
        }

        pub fn clear(&mut self) {
            self.len = 0;
        }

        pub fn take(&mut self) -> Option<String> {
            let text = core::str::from_utf8(&self.buf[..self.len]).ok()?.trim();
            let out = (!text.is_empty()).then(|| String::from(text));
            self.len = 0;
            out
        }
    }
}
