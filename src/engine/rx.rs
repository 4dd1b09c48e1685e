//! Receive state machine: deserializes link bytes into packets.
//!
//! Driven by byte-readiness, one incoming byte per step.  At most one
//! packet is being received at any time: a driver-owned packet allocated
//! when the frame's flags arrive, or an app slot selected by the frame's
//! index byte.
//!
//! Escaping is recognized in the payload phase only.  The FLAGS, INDEX and
//! SIZE fields are taken raw, so a raw START byte can never legitimately
//! appear mid-frame: seeing one means the previous frame was cut short, and
//! the receiver abandons it and parses the new frame from its FLAGS byte.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::engine::Engine;
use crate::link::LinkIo;
use crate::packet::{PacketFlags, PacketRef, END, ESCAPE, START};
use crate::DRIVER_PACKET_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RxState {
    /// Discarding bytes until a START marker
    AwaitStart,
    /// Frame's FLAGS byte next
    AwaitFlags,
    /// App slot index next (app-owned frames only)
    AwaitIndex,
    /// Low size byte next
    AwaitSize1,
    /// High size byte next
    AwaitSize2,
    /// Payload byte next; ESCAPE recognized here
    AwaitDataEsc,
    /// Literal payload byte next (preceding byte was ESCAPE)
    AwaitData,
    /// END marker next
    AwaitEnd,
}

pub(crate) struct RxMachine {
    pub(crate) state: RxState,
    pub(crate) active: Option<PacketRef>,
    /// Usage bits captured from the frame's FLAGS byte
    pub(crate) usage: PacketFlags,
    /// Declared payload size
    pub(crate) size: u16,
    /// Payload position within the active packet
    pub(crate) pos: u16,
}

impl RxMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: RxState::AwaitStart,
            active: None,
            usage: PacketFlags::empty(),
            size: 0,
            pos: 0,
        }
    }

    /// Whether the receiver is between frames.
    pub(crate) fn is_idle(&self) -> bool {
        self.state == RxState::AwaitStart && self.active.is_none()
    }
}

impl<L: LinkIo> Engine<L> {
    /// Drain the link's receive side until no bytes remain buffered.
    pub(crate) fn run_rx(&mut self) {
        while self.link.byte_ready() {
            let byte = self.link.read_byte();
            self.rx_step(byte);
        }
    }

    /// Consume one incoming byte.
    fn rx_step(&mut self, byte: u8) {
        // A raw START anywhere outside the post-ESCAPE literal slot begins
        // a new frame.  The current frame, if any, is abandoned and its
        // driver allocation returned to the pool.
        if byte == START && self.rx.state != RxState::AwaitData {
            if self.rx.state != RxState::AwaitStart {
                trace!("rx: frame restarted by START in {:?}", self.rx.state);
                self.abandon_rx();
            }
            self.rx.state = RxState::AwaitFlags;
            return;
        }

        match self.rx.state {
            RxState::AwaitStart => {
                // Discard until a START is seen (handled above).
            }
            RxState::AwaitFlags => {
                let raw = PacketFlags::from_bits_truncate(byte);
                self.rx.usage = raw.usage();
                if raw.contains(PacketFlags::APP_OWNED) {
                    self.rx.state = RxState::AwaitIndex;
                } else {
                    match self.driver.allocate_rx(self.rx.usage) {
                        Some(index) => {
                            self.rx.active = Some(PacketRef::Driver(index));
                            self.rx.state = RxState::AwaitSize1;
                        }
                        None => {
                            trace!("rx: driver pool exhausted, frame dropped");
                            self.rx.state = RxState::AwaitStart;
                        }
                    }
                }
            }
            RxState::AwaitIndex => {
                if self.app_slot_receivable(byte) {
                    let usage = self.rx.usage;
                    let slot = self.app.slot_mut(byte);
                    slot.flags = usage
                        | PacketFlags::APP_OWNED
                        | PacketFlags::FOR_RX
                        | PacketFlags::READY;
                    slot.len = 0;
                    self.rx.active = Some(PacketRef::App(byte));
                    self.rx.state = RxState::AwaitSize1;
                } else {
                    trace!("rx: app slot {byte} not receivable, frame dropped");
                    self.rx.state = RxState::AwaitStart;
                }
            }
            RxState::AwaitSize1 => {
                self.rx.size = byte as u16;
                self.rx.state = RxState::AwaitSize2;
            }
            RxState::AwaitSize2 => {
                self.rx.size |= (byte as u16) << 8;
                if self.rx.size > self.rx_capacity() {
                    trace!("rx: declared size {} too large, frame dropped", self.rx.size);
                    self.abandon_rx();
                } else if self.rx.size == 0 {
                    self.rx.state = RxState::AwaitEnd;
                } else {
                    self.rx.pos = 0;
                    self.rx.state = RxState::AwaitDataEsc;
                }
            }
            RxState::AwaitDataEsc => {
                if byte == ESCAPE {
                    self.rx.state = RxState::AwaitData;
                } else {
                    self.rx_store(byte);
                }
            }
            RxState::AwaitData => {
                // Whatever follows an ESCAPE is taken literally.
                self.rx_store(byte);
            }
            RxState::AwaitEnd => {
                if byte == END {
                    self.finish_rx();
                } else {
                    trace!("rx: expected END, got {byte:#04x}, frame dropped");
                    self.abandon_rx();
                }
            }
        }
    }

    /// A frame may only select a slot the caller primed for receive: the
    /// receive role flagged, a buffer installed, and no completed transfer
    /// still waiting to be read out.  Anything else is rejected, which also
    /// covers slots queued or active on the transmit side (READY without
    /// FOR_RX) and slots never handed a buffer at all.
    fn app_slot_receivable(&self, index: u8) -> bool {
        if !self.app.contains(index) {
            return false;
        }
        let slot = self.app.slot(index);
        slot.flags()
            .contains(PacketFlags::READY | PacketFlags::FOR_RX)
            && !slot.flags().contains(PacketFlags::DONE)
            && slot.buf.is_some()
    }

    /// Store one payload byte into the active packet and advance.
    fn rx_store(&mut self, byte: u8) {
        let pos = self.rx.pos as usize;
        match self.rx.active {
            Some(PacketRef::Driver(index)) => {
                let packet = self.driver.packet_mut(index);
                packet.data[pos] = byte;
                packet.len += 1;
            }
            Some(PacketRef::App(index)) => {
                let slot = self.app.slot_mut(index);
                if let Some(buf) = slot.buf.as_deref_mut() {
                    buf[pos] = byte;
                }
                slot.len += 1;
            }
            None => {}
        }
        self.rx.pos += 1;
        self.rx.state = if self.rx.pos == self.rx.size {
            RxState::AwaitEnd
        } else {
            RxState::AwaitDataEsc
        };
    }

    fn rx_capacity(&self) -> u16 {
        match self.rx.active {
            Some(PacketRef::Driver(_)) => DRIVER_PACKET_CAPACITY as u16,
            Some(PacketRef::App(index)) => self.app.slot(index).capacity,
            None => 0,
        }
    }

    /// Frame complete: stamp DONE; driver packets move to the RX queue,
    /// app slots are left DONE for the caller to poll.
    fn finish_rx(&mut self) {
        match self.rx.active.take() {
            Some(PacketRef::Driver(index)) => {
                let packet = self.driver.packet_mut(index);
                packet.flags.remove(PacketFlags::READY);
                packet.flags.insert(PacketFlags::DONE);
                debug!("rx: driver packet {index} received ({} bytes)", packet.len);
                // Cannot fail: at most one entry per driver packet.
                let _ = self.rx_queue.push_back(index);
            }
            Some(PacketRef::App(index)) => {
                let slot = self.app.slot_mut(index);
                slot.flags.remove(PacketFlags::READY);
                slot.flags.insert(PacketFlags::DONE);
                debug!("rx: app packet {index} received ({} bytes)", slot.len);
            }
            None => {}
        }
        self.rx.size = 0;
        self.rx.pos = 0;
        self.rx.state = RxState::AwaitStart;
    }

    /// Abort the frame in progress: free a half-filled driver allocation,
    /// restore a half-selected app slot to its prepared state, and return
    /// to AwaitStart.
    fn abandon_rx(&mut self) {
        match self.rx.active.take() {
            Some(PacketRef::Driver(index)) => {
                self.driver.release(index);
            }
            Some(PacketRef::App(index)) => {
                let slot = self.app.slot_mut(index);
                slot.flags =
                    PacketFlags::APP_OWNED | PacketFlags::FOR_RX | PacketFlags::READY;
                slot.len = 0;
            }
            None => {}
        }
        self.rx.size = 0;
        self.rx.pos = 0;
        self.rx.state = RxState::AwaitStart;
    }
}
