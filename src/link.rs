//! Link adapter trait and an in-memory loopback implementation.
//!
//! The engine never touches hardware directly: it drives a [`LinkIo`]
//! implementation supplied by the application.  On real targets this wraps
//! the serial peripheral's registers (byte-ready/write-ready status bits,
//! data register, write-interrupt enable).  [`LoopbackLink`] is a software
//! implementation over two FIFOs, used by the crate's tests and useful for
//! exercising higher layers without hardware.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use heapless::Deque;

/// Capacity of each loopback FIFO in bytes.
pub const LOOPBACK_FIFO_DEPTH: usize = 512;

/// Trait for the serial link the engine drives.
///
/// All methods are non-blocking.  The readiness methods are polled by the
/// engine's drain loops: `byte_ready` gates each receive step, and
/// `write_ready` gates each transmit step, one wire byte per step.
///
/// `enable_write_notify`/`disable_write_notify` control whether the link
/// raises its readiness signal (interrupt) when it can accept a byte.  The
/// engine enables notifications whenever a packet is queued and disables
/// them once the TX queue drains, so an idle link raises no interrupts.
///
/// The critical-section hooks are no-ops by default.  Implement them
/// (interrupt disable/enable on a single-core target, a mutex elsewhere)
/// when producer calls can interleave with an interrupt-context
/// [`crate::engine::Engine::process_link`]; the engine brackets every
/// producer operation and every drain with them, symmetrically.
pub trait LinkIo {
    /// Whether a received byte is waiting to be read
    fn byte_ready(&mut self) -> bool;

    /// Read one received byte.  Only called after `byte_ready` returns true.
    fn read_byte(&mut self) -> u8;

    /// Whether the link can accept a byte for transmission
    fn write_ready(&mut self) -> bool;

    /// Write one byte to the link.  Only called after `write_ready` returns
    /// true.
    fn write_byte(&mut self, byte: u8);

    /// Start raising readiness signals when the link can accept a byte
    fn enable_write_notify(&mut self);

    /// Stop raising write-readiness signals
    fn disable_write_notify(&mut self);

    /// Enter a critical section
    fn enter_critical(&mut self) {}

    /// Exit a critical section
    fn exit_critical(&mut self) {}
}

/// In-memory link with explicit FIFOs for both directions.
///
/// Bytes written by the engine land in the outgoing FIFO and can be
/// inspected or drained with [`Self::pop_outgoing`].  Bytes pushed with
/// [`Self::push_incoming`] become readable by the engine.  Write readiness
/// is simply "outgoing FIFO not full".
pub struct LoopbackLink {
    incoming: Deque<u8, LOOPBACK_FIFO_DEPTH>,
    outgoing: Deque<u8, LOOPBACK_FIFO_DEPTH>,
    write_notify: bool,
}

impl LoopbackLink {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            incoming: Deque::new(),
            outgoing: Deque::new(),
            write_notify: false,
        }
    }

    /// Queue bytes for the engine to receive.  Returns the number of bytes
    /// accepted (the FIFO may fill).
    pub fn push_incoming(&mut self, data: &[u8]) -> usize {
        let mut accepted = 0;
        for &byte in data {
            if self.incoming.push_back(byte).is_err() {
                break;
            }
            accepted += 1;
        }
        accepted
    }

    /// Take the next byte the engine transmitted, oldest first.
    pub fn pop_outgoing(&mut self) -> Option<u8> {
        self.outgoing.pop_front()
    }

    /// Number of transmitted bytes waiting in the outgoing FIFO.
    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Whether write-readiness notifications are currently enabled.
    pub fn write_notify_enabled(&self) -> bool {
        self.write_notify
    }
}

impl LinkIo for LoopbackLink {
    fn byte_ready(&mut self) -> bool {
        !self.incoming.is_empty()
    }

    fn read_byte(&mut self) -> u8 {
        self.incoming.pop_front().unwrap_or(0)
    }

    fn write_ready(&mut self) -> bool {
        !self.outgoing.is_full()
    }

    fn write_byte(&mut self, byte: u8) {
        // Full FIFO drops the byte; write_ready() gates this in practice.
        let _ = self.outgoing.push_back(byte);
    }

    fn enable_write_notify(&mut self) {
        self.write_notify = true;
    }

    fn disable_write_notify(&mut self) {
        self.write_notify = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_passes_bytes_through() {
        let mut link = LoopbackLink::new();
        assert_eq!(link.push_incoming(&[1, 2, 3]), 3);
        assert!(link.byte_ready());
        assert_eq!(link.read_byte(), 1);
        assert_eq!(link.read_byte(), 2);
        assert_eq!(link.read_byte(), 3);
        assert!(!link.byte_ready());

        link.write_byte(0xAA);
        link.write_byte(0xBB);
        assert_eq!(link.outgoing_len(), 2);
        assert_eq!(link.pop_outgoing(), Some(0xAA));
        assert_eq!(link.pop_outgoing(), Some(0xBB));
        assert_eq!(link.pop_outgoing(), None);
    }

    #[test]
    fn write_notify_toggles() {
        let mut link = LoopbackLink::new();
        assert!(!link.write_notify_enabled());
        link.enable_write_notify();
        assert!(link.write_notify_enabled());
        link.disable_write_notify();
        assert!(!link.write_notify_enabled());
    }
}
