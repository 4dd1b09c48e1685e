//! Transmit state machine: drains the TX queue onto the link.
//!
//! Driven by write-readiness.  Each step emits at most one wire byte, so a
//! frame straddles as many readiness signals as the link requires; the
//! escape latch carries a half-emitted escaped byte across the boundary.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::engine::Engine;
use crate::link::LinkIo;
use crate::packet::{is_marker, PacketFlags, PacketRef, END, ESCAPE, START};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxState {
    /// No frame in progress; pop the queue head on the next ready slot
    Idle,
    /// START written; flags byte next
    Flags,
    /// Flags written; app slot index next (app-owned frames only)
    Index,
    /// Low size byte next
    SizeLow,
    /// High size byte next
    SizeHigh,
    /// Payload bytes next
    Data,
    /// END marker next
    End,
}

pub(crate) struct TxMachine {
    pub(crate) state: TxState,
    pub(crate) active: Option<PacketRef>,
    /// Payload position within the active packet
    pub(crate) pos: u16,
    /// ESCAPE emitted, literal byte still owed
    pub(crate) escaped: bool,
}

impl TxMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: TxState::Idle,
            active: None,
            pos: 0,
            escaped: false,
        }
    }
}

impl<L: LinkIo> Engine<L> {
    /// Drain the TX queue until it empties or the link reports not-ready.
    /// Disables write-readiness notifications once there is nothing left to
    /// send.
    pub(crate) fn run_tx(&mut self) {
        loop {
            if self.tx.state == TxState::Idle && self.tx_queue.is_empty() {
                self.link.disable_write_notify();
                return;
            }
            if !self.link.write_ready() {
                return;
            }
            self.tx_step();
        }
    }

    /// Emit one wire byte of the current frame.
    fn tx_step(&mut self) {
        match self.tx.state {
            TxState::Idle => {
                let Some(next) = self.tx_queue.pop_front() else {
                    return;
                };
                self.tx.active = Some(next);
                self.tx.pos = 0;
                self.tx.escaped = false;
                self.link.write_byte(START);
                self.tx.state = TxState::Flags;
            }
            TxState::Flags => {
                let flags = self.active_flags();
                // Only the usage bits and the ownership bit travel; READY,
                // DONE and FOR_RX are local processing state.
                let wire = flags & (PacketFlags::USAGE | PacketFlags::APP_OWNED);
                if self.put_escaped(wire.bits()) {
                    self.tx.state = if wire.contains(PacketFlags::APP_OWNED) {
                        TxState::Index
                    } else {
                        TxState::SizeLow
                    };
                }
            }
            TxState::Index => {
                // The slot index goes out raw, never escaped.
                if let Some(PacketRef::App(index)) = self.tx.active {
                    self.link.write_byte(index);
                }
                self.tx.state = TxState::SizeLow;
            }
            TxState::SizeLow => {
                let len = self.active_len();
                if self.put_escaped(len as u8) {
                    self.tx.state = TxState::SizeHigh;
                }
            }
            TxState::SizeHigh => {
                let len = self.active_len();
                if self.put_escaped((len >> 8) as u8) {
                    self.tx.state = if len == 0 { TxState::End } else { TxState::Data };
                }
            }
            TxState::Data => {
                let byte = self.active_byte(self.tx.pos);
                if self.put_escaped(byte) {
                    self.tx.pos += 1;
                    if self.tx.pos == self.active_len() {
                        self.tx.state = TxState::End;
                    }
                }
            }
            TxState::End => {
                self.link.write_byte(END);
                self.finish_tx();
            }
        }
    }

    /// Write one logical byte, stuffing marker-valued bytes.  Returns true
    /// once the logical byte is fully on the wire; false after emitting the
    /// ESCAPE, with the literal owed to the next ready slot.
    fn put_escaped(&mut self, byte: u8) -> bool {
        if is_marker(byte) && !self.tx.escaped {
            self.link.write_byte(ESCAPE);
            self.tx.escaped = true;
            false
        } else {
            self.link.write_byte(byte);
            self.tx.escaped = false;
            true
        }
    }

    fn active_flags(&self) -> PacketFlags {
        match self.tx.active {
            Some(PacketRef::Driver(index)) => self.driver.packet(index).flags(),
            Some(PacketRef::App(index)) => self.app.slot(index).flags(),
            None => PacketFlags::empty(),
        }
    }

    fn active_len(&self) -> u16 {
        match self.tx.active {
            Some(PacketRef::Driver(index)) => self.driver.packet(index).len,
            Some(PacketRef::App(index)) => self.app.slot(index).len,
            None => 0,
        }
    }

    fn active_byte(&self, pos: u16) -> u8 {
        match self.tx.active {
            Some(PacketRef::Driver(index)) => self.driver.packet(index).data[pos as usize],
            Some(PacketRef::App(index)) => self
                .app
                .slot(index)
                .buf
                .as_deref()
                .map_or(0, |buf| buf[pos as usize]),
            None => 0,
        }
    }

    /// Frame complete: stamp DONE, return driver packets to the pool, and
    /// clear the active pointer.
    fn finish_tx(&mut self) {
        match self.tx.active.take() {
            Some(PacketRef::Driver(index)) => {
                let packet = self.driver.packet_mut(index);
                packet.flags.remove(PacketFlags::READY);
                packet.flags.insert(PacketFlags::DONE);
                debug!("tx: driver packet {index} sent ({} bytes)", packet.len);
                self.driver.release(index);
            }
            Some(PacketRef::App(index)) => {
                let slot = self.app.slot_mut(index);
                slot.flags.remove(PacketFlags::READY);
                slot.flags.insert(PacketFlags::DONE);
                debug!("tx: app packet {index} sent ({} bytes)", slot.len);
            }
            None => {}
        }
        self.tx.pos = 0;
        self.tx.escaped = false;
        self.tx.state = TxState::Idle;
    }
}
