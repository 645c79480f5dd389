use spin::Mutex;
use uart_16550::SerialPort;

/// Serial port used as the log sink. Stays `None` until [`init`] is called,
/// so builds without a serial device (hosted tests included) log nothing.
pub static SERIAL1: Mutex<Option<SerialPort>> = Mutex::new(None);

/// Initialize the serial log sink on the given I/O port base.
///
/// # Safety
/// The caller must ensure `base` is the port base of a real 16550-compatible
/// UART and that nothing else drives it.
pub unsafe fn init(base: u16) {
    let mut serial_port = unsafe { SerialPort::new(base) };
    serial_port.init();
    SERIAL1.lock().replace(serial_port);
}

/// Global print! macro that writes to the serial interface, if initialized.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {{
        let mut lock = $crate::serial::SERIAL1.lock();
        if let Some(port) = lock.as_mut() {
            let _ = ::core::fmt::Write::write_fmt(port, format_args!($($arg)*));
        }
    }};
}

/// Global println! macro that writes to the serial interface, if initialized.
#[macro_export]
macro_rules! serial_println {
    () => {
        $crate::serial_print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*));
    };
}
