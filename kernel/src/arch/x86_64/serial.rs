// =============================================================================
// xv64 — Serial Console (COM1)
// =============================================================================
//
// The 16550 UART at I/O port 0x3F8, used as the `klog` sink on hardware.
//
// The port sits behind a `spin::Mutex` rather than the kernel spinlock: it
// is used before the CPU table exists and from the panic path.
//
// Register map (offsets from the base port):
//   +0  data (divisor low while DLAB=1)
//   +1  interrupt enable (divisor high while DLAB=1)
//   +2  FIFO control
//   +3  line control
//   +4  modem control
//   +5  line status
// =============================================================================

use core::fmt::{self, Write};

use ::x86_64::instructions::port::Port;
use spin::Mutex;

const COM1_BASE: u16 = 0x3F8;

/// Transmit holding register empty.
const LSR_TX_EMPTY: u8 = 1 << 5;

static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_BASE));

struct SerialPort {
    base: u16,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self { base }
    }

    fn port(&self, offset: u16) -> Port<u8> {
        Port::new(self.base + offset)
    }

    fn write_reg(&self, offset: u16, value: u8) {
        // SAFETY: the UART owns these eight ports.
        unsafe { self.port(offset).write(value) }
    }

    fn read_reg(&self, offset: u16) -> u8 {
        // SAFETY: as above.
        unsafe { self.port(offset).read() }
    }

    /// 115200 baud, 8N1, FIFOs on.
    fn init(&self) {
        self.write_reg(1, 0x00);
        self.write_reg(3, 0x80);
        self.write_reg(0, 0x01);
        self.write_reg(1, 0x00);
        self.write_reg(3, 0x03);
        self.write_reg(2, 0xC7);
        self.write_reg(4, 0x0B);
    }

    fn write_byte(&self, byte: u8) {
        while self.read_reg(5) & LSR_TX_EMPTY == 0 {
            core::hint::spin_loop();
        }
        self.write_reg(0, byte);
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

fn console(level: Option<klog::Level>, args: fmt::Arguments) {
    let mut serial = SERIAL.lock();
    let _ = match level {
        Some(level) => writeln!(serial, "{}[{}]\x1b[0m {}", level.color(), level.as_str(), args),
        None => serial.write_fmt(args),
    };
}

/// Brings up COM1 and routes `klog` output to it.
pub fn install_console() {
    SERIAL.lock().init();
    klog::init(console);
}
