// Copyright 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Emulates a 16550A UART with a 16 byte receive FIFO.
//!
//! The guest drives the registers through port I/O on the vCPU thread while console input is
//! pushed into the receive FIFO by the `vmm_serial_in` thread. Both go through the same
//! `Mutex`, so the register state is never observed half updated.
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use vm_superio::Trigger;
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::terminal::Terminal;

use crate::devices::bus::BusDevice;
use crate::devices::legacy::EventFdTrigger;
use crate::logger::{IncMetric, METRICS, debug, error, info, warn};
use crate::utils::ShutdownSignal;

/// First port of the COM1 register block.
pub const SERIAL_PORT_BASE: u64 = 0x3f8;
/// Number of ports of the register block.
pub const SERIAL_PORT_SIZE: u64 = 0x8;
/// Legacy interrupt line of COM1.
pub const SERIAL_IRQ: u32 = 4;
/// Capacity of the receive FIFO.
pub const FIFO_SIZE: usize = 16;

const DATA_OFFSET: u8 = 0;
const IER_OFFSET: u8 = 1;
const IIR_OFFSET: u8 = 2;
const FCR_OFFSET: u8 = 2;
const LCR_OFFSET: u8 = 3;
const MCR_OFFSET: u8 = 4;
const LSR_OFFSET: u8 = 5;
const MSR_OFFSET: u8 = 6;
const SCR_OFFSET: u8 = 7;
const DLAB_LOW_OFFSET: u8 = 0;
const DLAB_HIGH_OFFSET: u8 = 1;

/// Received Data Available interrupt enable.
pub const IER_RDA_BIT: u8 = 0b0000_0001;
/// Transmitter Holding Register Empty interrupt enable.
pub const IER_THR_BIT: u8 = 0b0000_0010;
const IER_MASK: u8 = 0b0000_1111;

const IIR_NONE_BIT: u8 = 0b0000_0001;
const IIR_THR_BIT: u8 = 0b0000_0010;
const IIR_RDA_BIT: u8 = 0b0000_0100;
// Reported on every IIR read: the FIFOs are always on.
const IIR_FIFO_BITS: u8 = 0b1100_0000;

const FCR_CLEAR_RX_BIT: u8 = 0b0000_0010;

const LCR_DLAB_BIT: u8 = 0b1000_0000;

const MCR_DTR_BIT: u8 = 0b0000_0001;
const MCR_RTS_BIT: u8 = 0b0000_0010;
const MCR_OUT1_OUT2_BITS: u8 = 0b0000_1100;
const MCR_OUT2_BIT: u8 = 0b0000_1000;
const MCR_LOOP_BIT: u8 = 0b0001_0000;
const MCR_MASK: u8 = 0b0001_1111;

const LSR_DR_BIT: u8 = 0b0000_0001;
const LSR_OE_BIT: u8 = 0b0000_0010;
const LSR_THRE_BIT: u8 = 0b0010_0000;
const LSR_TEMT_BIT: u8 = 0b0100_0000;

const MSR_CTS_BIT: u8 = 0b0001_0000;
const MSR_DSR_BIT: u8 = 0b0010_0000;
const MSR_DCD_BIT: u8 = 0b1000_0000;

const DEFAULT_INTERRUPT_IDENTIFICATION: u8 = IIR_NONE_BIT;
const DEFAULT_LINE_CONTROL: u8 = 0b0000_0011;
const DEFAULT_MODEM_CONTROL: u8 = MCR_OUT2_BIT;
const DEFAULT_LINE_STATUS: u8 = LSR_THRE_BIT | LSR_TEMT_BIT;
const DEFAULT_MODEM_STATUS: u8 = MSR_DCD_BIT | MSR_DSR_BIT | MSR_CTS_BIT;
// 9600 bps with the 1.8432 MHz reference clock.
const DEFAULT_BAUD_DIVISOR: u16 = 12;

const INPUT_TOKEN: u64 = 0;
const STOP_TOKEN: u64 = 1;

/// Errors of the serial console.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum SerialError {
    /// Cannot create the interrupt eventfd: {0}
    EventFd(io::Error),
    /// Cannot watch the console input: {0}
    Epoll(io::Error),
    /// Failed to wait for console input: {0}
    Wait(io::Error),
    /// Cannot spawn the console input thread: {0}
    Spawn(io::Error),
    /// Cannot change the terminal mode: {0}
    Terminal(vmm_sys_util::errno::Error),
}

/// Destination of the bytes transmitted by the guest.
#[derive(Debug)]
pub enum SerialOut {
    /// Discards everything.
    Sink(io::Sink),
    /// Writes to the VMM standard output.
    Stdout(io::Stdout),
}

impl Write for SerialOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Sink(sink) => sink.write(buf),
            Self::Stdout(stdout) => stdout.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Sink(sink) => sink.flush(),
            Self::Stdout(stdout) => stdout.flush(),
        }
    }
}

/// 16550A register file.
#[derive(Debug)]
pub struct Serial<T, W> {
    baud_divisor: u16,
    interrupt_enable: u8,
    interrupt_identification: u8,
    line_control: u8,
    line_status: u8,
    modem_control: u8,
    modem_status: u8,
    scratch: u8,
    // Latched when the transmitter empties, cleared by an IIR read.
    thr_empty_pending: bool,
    in_buffer: VecDeque<u8>,
    interrupt_evt: T,
    out: W,
}

/// The UART wired into the VMM.
pub type SerialDevice = Serial<EventFdTrigger, SerialOut>;

impl<T: Trigger<E = io::Error>, W: Write> Serial<T, W> {
    /// Creates a UART in its reset state.
    pub fn new(interrupt_evt: T, out: W) -> Self {
        Serial {
            baud_divisor: DEFAULT_BAUD_DIVISOR,
            interrupt_enable: 0,
            interrupt_identification: DEFAULT_INTERRUPT_IDENTIFICATION,
            line_control: DEFAULT_LINE_CONTROL,
            line_status: DEFAULT_LINE_STATUS,
            modem_control: DEFAULT_MODEM_CONTROL,
            modem_status: DEFAULT_MODEM_STATUS,
            scratch: 0,
            thr_empty_pending: false,
            in_buffer: VecDeque::with_capacity(FIFO_SIZE),
            interrupt_evt,
            out,
        }
    }

    /// The interrupt trigger.
    pub fn interrupt_evt(&self) -> &T {
        &self.interrupt_evt
    }

    /// Free slots in the receive FIFO.
    pub fn fifo_capacity(&self) -> usize {
        FIFO_SIZE - self.in_buffer.len()
    }

    /// Pushes console input into the receive FIFO.
    ///
    /// Bytes that don't fit are dropped and flagged with an overrun. Input is ignored in
    /// loopback mode, where the receiver is wired to the transmitter. Returns the number of
    /// bytes queued.
    pub fn enqueue_raw_bytes(&mut self, data: &[u8]) -> usize {
        if self.is_in_loop_mode() {
            debug!("serial: dropping {} input bytes in loopback mode", data.len());
            return 0;
        }
        let queued = data.iter().filter(|byte| self.push_rx(**byte)).count();
        self.update_interrupt();
        queued
    }

    /// Reads the register at `offset`.
    pub fn read(&mut self, offset: u8) -> u8 {
        match offset {
            DLAB_LOW_OFFSET if self.is_dlab_set() => self.baud_divisor.to_le_bytes()[0],
            DLAB_HIGH_OFFSET if self.is_dlab_set() => self.baud_divisor.to_le_bytes()[1],
            DATA_OFFSET => {
                let byte = match self.in_buffer.pop_front() {
                    Some(byte) => {
                        METRICS.uart.read_count.inc();
                        byte
                    }
                    None => 0,
                };
                if self.in_buffer.is_empty() {
                    self.line_status &= !LSR_DR_BIT;
                }
                self.update_interrupt();
                byte
            }
            IER_OFFSET => self.interrupt_enable,
            IIR_OFFSET => {
                let iir = self.interrupt_identification | IIR_FIFO_BITS;
                // Reading the IIR acknowledges a transmitter empty interrupt.
                self.thr_empty_pending = false;
                self.interrupt_identification = DEFAULT_INTERRUPT_IDENTIFICATION;
                iir
            }
            LCR_OFFSET => self.line_control,
            MCR_OFFSET => self.modem_control,
            LSR_OFFSET => {
                let lsr = self.line_status;
                // Error bits are cleared by reading them.
                self.line_status &= !LSR_OE_BIT;
                lsr
            }
            MSR_OFFSET => {
                if self.is_in_loop_mode() {
                    // The modem outputs are looped back onto the modem inputs.
                    let mcr = self.modem_control;
                    ((mcr & MCR_OUT1_OUT2_BITS) << 4)
                        | ((mcr & MCR_RTS_BIT) << 3)
                        | ((mcr & MCR_DTR_BIT) << 5)
                } else {
                    self.modem_status
                }
            }
            SCR_OFFSET => self.scratch,
            _ => 0,
        }
    }

    /// Writes `value` to the register at `offset`.
    pub fn write(&mut self, offset: u8, value: u8) {
        match offset {
            DLAB_LOW_OFFSET if self.is_dlab_set() => {
                self.baud_divisor = (self.baud_divisor & 0xff00) | u16::from(value);
            }
            DLAB_HIGH_OFFSET if self.is_dlab_set() => {
                self.baud_divisor = (self.baud_divisor & 0x00ff) | (u16::from(value) << 8);
            }
            DATA_OFFSET => {
                if self.is_in_loop_mode() {
                    self.push_rx(value);
                } else {
                    self.transmit(value);
                }
                // The byte leaves the holding register immediately.
                self.thr_empty_pending = true;
                self.update_interrupt();
            }
            IER_OFFSET => {
                let changed = (self.interrupt_enable ^ value) & IER_MASK;
                self.interrupt_enable = value & IER_MASK;
                if changed != 0 {
                    self.update_interrupt();
                }
            }
            FCR_OFFSET => {
                if value & FCR_CLEAR_RX_BIT != 0 {
                    self.in_buffer.clear();
                    self.line_status &= !LSR_DR_BIT;
                    self.update_interrupt();
                }
            }
            LCR_OFFSET => self.line_control = value,
            MCR_OFFSET => self.modem_control = value & MCR_MASK,
            SCR_OFFSET => self.scratch = value,
            // LSR and MSR are read-only.
            _ => {}
        }
    }

    fn is_dlab_set(&self) -> bool {
        self.line_control & LCR_DLAB_BIT != 0
    }

    fn is_in_loop_mode(&self) -> bool {
        self.modem_control & MCR_LOOP_BIT != 0
    }

    fn push_rx(&mut self, byte: u8) -> bool {
        if self.in_buffer.len() >= FIFO_SIZE {
            warn!("serial: receive FIFO overrun, dropping byte {byte:#04x}");
            METRICS.uart.rx_overrun_count.inc();
            self.line_status |= LSR_OE_BIT;
            return false;
        }
        self.in_buffer.push_back(byte);
        self.line_status |= LSR_DR_BIT;
        true
    }

    fn transmit(&mut self, byte: u8) {
        match self.out.write_all(&[byte]).and_then(|()| self.out.flush()) {
            Ok(()) => METRICS.uart.write_count.inc(),
            Err(err) => {
                error!("serial: failed to emit output: {}", err);
                METRICS.uart.error_count.inc();
            }
        }
    }

    // Received data takes priority over an empty transmitter.
    fn update_interrupt(&mut self) {
        let iir = if self.interrupt_enable & IER_RDA_BIT != 0
            && self.line_status & LSR_DR_BIT != 0
        {
            IIR_RDA_BIT
        } else if self.interrupt_enable & IER_THR_BIT != 0 && self.thr_empty_pending {
            IIR_THR_BIT
        } else {
            IIR_NONE_BIT
        };
        self.interrupt_identification = iir;

        if iir != IIR_NONE_BIT {
            if let Err(err) = self.interrupt_evt.trigger() {
                error!("serial: failed to raise the interrupt: {}", err);
                METRICS.uart.error_count.inc();
            }
        }
    }
}

impl<T, W> BusDevice for Serial<T, W>
where
    T: Trigger<E = io::Error> + Send,
    W: Write + Send,
{
    fn read(&mut self, _base: u64, offset: u64, data: &mut [u8]) {
        if let (Ok(offset), [byte]) = (u8::try_from(offset), &mut *data) {
            *byte = Serial::read(self, offset);
        } else {
            METRICS.uart.missed_read_count.inc();
        }
    }

    fn write(&mut self, _base: u64, offset: u64, data: &[u8]) {
        if let (Ok(offset), [byte]) = (u8::try_from(offset), data) {
            Serial::write(self, offset, *byte);
        } else {
            METRICS.uart.missed_write_count.inc();
        }
    }
}

/// Puts the terminal behind stdin in raw, non-echoing mode.
///
/// Returns whether stdin is a terminal, in which case the mode was changed.
pub fn set_stdin_raw_mode() -> Result<bool, SerialError> {
    let stdin = io::stdin();
    // SAFETY: isatty has no invariants that need to be upheld. If the fd is invalid it returns 0
    // and sets errno to EBADF.
    if unsafe { libc::isatty(stdin.as_raw_fd()) } != 1 {
        return Ok(false);
    }
    stdin.lock().set_raw_mode().map_err(SerialError::Terminal)?;
    Ok(true)
}

/// Puts the terminal behind stdin back in canonical mode.
pub fn restore_stdin_canon_mode() {
    if let Err(err) = io::stdin().lock().set_canon_mode() {
        warn!("Cannot set canonical mode for the terminal: {:?}", err);
    }
}

/// Checks whether the given file descriptor is a FIFO pipe.
fn is_fifo(fd: RawFd) -> bool {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();

    // SAFETY: No unsafety can be introduced by passing in an invalid file descriptor to fstat,
    // it will return -1 and set errno to EBADF. The pointer passed to fstat is valid for writing
    // a libc::stat structure.
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } < 0 {
        return false;
    }

    // SAFETY: We can safely assume the libc::stat structure to be initialized, as libc::fstat
    // returning 0 guarantees that the memory is now initialized with the requested file metadata.
    let stat = unsafe { stat.assume_init() };

    (stat.st_mode & libc::S_IFMT) == libc::S_IFIFO
}

/// Spawns the `vmm_serial_in` thread feeding `input` into `serial` until `shutdown` fires or
/// the input is closed.
///
/// Returns `None` when the input can't be polled, e.g. stdin redirected from a regular file or
/// `/dev/null`: the console is then output only.
pub fn start_input_thread<T, W, I>(
    serial: Arc<Mutex<Serial<T, W>>>,
    input: I,
    shutdown: ShutdownSignal,
) -> Result<Option<JoinHandle<()>>, SerialError>
where
    T: Trigger<E = io::Error> + Send + 'static,
    W: Write + Send + 'static,
    I: Read + AsRawFd + Send + 'static,
{
    let input_fd = input.as_raw_fd();
    // SAFETY: isatty has no invariants that need to be upheld. If input_fd is an invalid
    // argument, it will return 0 and set errno to EBADF.
    if unsafe { libc::isatty(input_fd) } != 1 && !is_fifo(input_fd) {
        warn!("serial: input fd {input_fd} is neither a terminal nor a pipe, ignoring it");
        return Ok(None);
    }

    let epoll = Epoll::new().map_err(SerialError::Epoll)?;
    epoll
        .ctl(
            ControlOperation::Add,
            input_fd,
            EpollEvent::new(EventSet::IN, INPUT_TOKEN),
        )
        .map_err(SerialError::Epoll)?;
    epoll
        .ctl(
            ControlOperation::Add,
            shutdown.as_raw_fd(),
            EpollEvent::new(EventSet::IN, STOP_TOKEN),
        )
        .map_err(SerialError::Epoll)?;

    thread::Builder::new()
        .name("vmm_serial_in".to_string())
        .spawn(move || {
            if let Err(err) = pump_input(&epoll, &serial, input) {
                error!("serial: input thread stopped: {}", err);
                METRICS.uart.error_count.inc();
            }
        })
        .map(Some)
        .map_err(SerialError::Spawn)
}

fn pump_input<T, W, I>(
    epoll: &Epoll,
    serial: &Mutex<Serial<T, W>>,
    mut input: I,
) -> Result<(), SerialError>
where
    T: Trigger<E = io::Error>,
    W: Write,
    I: Read,
{
    let mut events = vec![EpollEvent::default(); 2];
    let mut buf = [0u8; FIFO_SIZE];
    loop {
        let count = match epoll.wait(-1, &mut events) {
            Ok(count) => count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(SerialError::Wait(err)),
        };

        for event in &events[..count] {
            if event.data() == STOP_TOKEN {
                info!("serial: input thread shutting down");
                return Ok(());
            }
            // IN, HANG_UP and ERROR are all handled by reading the input.
            match input.read(&mut buf) {
                Ok(0) => {
                    warn!("Detached the serial input due to peer close.");
                    return Ok(());
                }
                Ok(len) => {
                    serial
                        .lock()
                        .expect("Poisoned lock")
                        .enqueue_raw_bytes(&buf[..len]);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    warn!("Detached the serial input due to error: {}", err);
                    METRICS.uart.error_count.inc();
                    return Ok(());
                }
            }
        }
    }
}
