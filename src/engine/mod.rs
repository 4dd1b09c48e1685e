//! The BDPP engine: pools, queues, TX builder, and the public API.
//!
//! One [`Engine`] owns everything: the link, both packet pools, the TX and
//! RX queues, the builder state, and both wire state machines.  All
//! mutation happens through `&mut self`, and every producer operation and
//! the [`Engine::process_link`] drain bracket themselves with the link's
//! critical-section hooks, so the same engine can be driven from an
//! interrupt handler and from ordinary code.
//!
//! The transmit and receive state machines live in their own impl blocks
//! in the `tx` and `rx` submodules.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub(crate) mod rx;
pub(crate) mod tx;

use heapless::Deque;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::link::LinkIo;
use crate::packet::{PacketFlags, PacketRef};
use crate::pool::{AppPool, DriverPool};
use crate::{DRIVER_PACKET_CAPACITY, DRIVER_POOL_SIZE, TX_QUEUE_DEPTH};
use crate::{Error, Result};

use self::rx::RxMachine;
use self::tx::TxMachine;

/// Bidirectional packet protocol engine.
///
/// Create with [`Engine::new`], gate with [`Engine::enable`], then drive
/// [`Engine::process_link`] from the link's readiness interrupt.
///
/// Example over the in-memory loopback link:
///
/// ```rust
/// use bdpp::engine::Engine;
/// use bdpp::link::LoopbackLink;
///
/// let mut engine = Engine::new(LoopbackLink::new(), true);
/// engine.enable().unwrap();
/// engine.write_classified_bytes(b"hello").unwrap();
/// engine.flush().unwrap();
/// engine.process_link();
/// // The framed message is now in the loopback's outgoing FIFO.
/// assert!(engine.link_mut().outgoing_len() > 0);
/// ```
pub struct Engine<L: LinkIo> {
    pub(crate) link: L,
    allowed: bool,
    enabled: bool,
    pub(crate) driver: DriverPool,
    pub(crate) app: AppPool,
    pub(crate) tx_queue: Deque<PacketRef, TX_QUEUE_DEPTH>,
    pub(crate) rx_queue: Deque<u8, DRIVER_POOL_SIZE>,
    /// Driver packet currently being filled by the builder
    build: Option<u8>,
    /// Flags for the next build packet the builder allocates
    build_flags: PacketFlags,
    /// Whether a logical message is open (spans auto-flushed packets)
    message_open: bool,
    pub(crate) tx: TxMachine,
    pub(crate) rx: RxMachine,
}

impl<L: LinkIo> Engine<L> {
    /// Create a new engine over the given link.
    ///
    /// `allowed` is the capability gate: whether the host protocol permits
    /// BDPP at all.  A disallowed engine refuses [`Engine::enable`] and
    /// never touches the link.
    pub fn new(link: L, allowed: bool) -> Self {
        Self {
            link,
            allowed,
            enabled: false,
            driver: DriverPool::new(),
            app: AppPool::new(),
            tx_queue: Deque::new(),
            rx_queue: Deque::new(),
            build: None,
            build_flags: PacketFlags::empty(),
            message_open: false,
            tx: TxMachine::new(),
            rx: RxMachine::new(),
        }
    }

    /// Whether the capability gate permits this engine.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Whether the engine is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable the engine: reset both state machines and start handling the
    /// link.  Fails with [`Error::NotAllowed`] if the capability gate is
    /// closed.  Enabling an already-enabled engine is a no-op.
    pub fn enable(&mut self) -> Result<()> {
        if !self.allowed {
            return Err(Error::NotAllowed);
        }
        if self.enabled {
            return Ok(());
        }
        self.tx = TxMachine::new();
        self.rx = RxMachine::new();
        self.enabled = true;
        debug!("bdpp enabled");
        Ok(())
    }

    /// Disable the engine, draining outstanding transmit work first, as far
    /// as the link allows without blocking.  Callers wanting a guaranteed
    /// clean quiesce should poll [`Engine::is_busy`] and re-invoke
    /// [`Engine::process_link`] until it clears before disabling.
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.link.enter_critical();
        self.flush_build(true);
        self.run_rx();
        self.run_tx();
        self.link.disable_write_notify();
        self.enabled = false;
        self.link.exit_critical();
        debug!("bdpp disabled (busy: {})", self.is_busy());
    }

    /// Whether any transfer is outstanding: a build packet in progress, a
    /// queued or in-flight TX packet, or a partially received frame.
    pub fn is_busy(&self) -> bool {
        self.build.is_some()
            || !self.tx_queue.is_empty()
            || self.tx.active.is_some()
            || !self.rx.is_idle()
    }

    /// The single drain entry point, invoked on any link readiness signal.
    ///
    /// Runs one full RX pass (until no bytes remain buffered) then one full
    /// TX pass (until the queue empties or the link reports not-ready).
    /// No-op while the engine is disabled.
    ///
    /// Note the wire asymmetry this engine preserves: the transmitter
    /// escapes the FLAGS and SIZE bytes, but the receiver never unescapes
    /// them (only payload bytes).  Frames whose flags or size bytes equal a
    /// marker value do not survive the link; keep flags and sizes below the
    /// marker range (`0x8C`).
    pub fn process_link(&mut self) {
        if !self.enabled {
            return;
        }
        self.link.enter_critical();
        self.run_rx();
        self.run_tx();
        self.link.exit_critical();
    }

    /// Mutable access to the link adapter.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Number of driver packets on the free list.
    pub fn driver_free_count(&self) -> usize {
        self.driver.free_count()
    }
}

// TX builder
impl<L: LinkIo> Engine<L> {
    /// Begin a driver-owned message with explicit usage flags.  Any build
    /// packet in progress is flushed (marked LAST) first.  The given usage
    /// bits, tagged FIRST, apply to the packet the next written byte
    /// allocates.
    pub fn start_driver_packet(&mut self, flags: PacketFlags) -> Result<()> {
        self.gate()?;
        self.with_critical(|engine| {
            engine.flush_build(true);
            engine.build_flags = flags.usage() | PacketFlags::FIRST;
            engine.message_open = true;
        });
        Ok(())
    }

    /// Append one byte to the current driver-owned build packet, allocating
    /// one if none is active.  A packet filled to capacity is auto-flushed
    /// and the message continues in the next packet (FIRST cleared).
    ///
    /// When the driver pool is exhausted this retries until a packet frees
    /// up, releasing the critical section between attempts so the drain can
    /// run.  Never call builder methods from inside the drain context.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.gate()?;
        self.with_critical(|engine| engine.append_byte(byte));
        Ok(())
    }

    /// Append a run of bytes to the current driver-owned build packet.  See
    /// [`Engine::write_byte`].
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.gate()?;
        self.with_critical(|engine| {
            for &byte in data {
                engine.append_byte(byte);
            }
        });
        Ok(())
    }

    /// Append one byte, inferring the message's usage from its first byte
    /// when no message is open: printable ASCII means PRINT usage, anything
    /// else COMMAND, both tagged FIRST.
    pub fn write_classified_byte(&mut self, byte: u8) -> Result<()> {
        self.gate()?;
        self.with_critical(|engine| {
            engine.classify_if_new(byte);
            engine.append_byte(byte);
        });
        Ok(())
    }

    /// Append a run of bytes, classifying the message from the first byte
    /// when no message is open.  See [`Engine::write_classified_byte`].
    pub fn write_classified_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.gate()?;
        self.with_critical(|engine| {
            for &byte in data {
                engine.classify_if_new(byte);
                engine.append_byte(byte);
            }
        });
        Ok(())
    }

    /// End the current message: mark the build packet LAST and READY,
    /// enqueue it, and ask the link for write-readiness notifications.
    /// No-op when nothing has been written since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        self.gate()?;
        self.with_critical(|engine| engine.flush_build(true));
        Ok(())
    }

    fn classify_if_new(&mut self, byte: u8) {
        if self.build.is_none() && !self.message_open {
            self.build_flags = PacketFlags::classify(byte);
        }
    }

    fn append_byte(&mut self, byte: u8) {
        let index = match self.build {
            Some(index) => index,
            None => {
                let index = loop {
                    if let Some(index) = self.driver.allocate_tx(self.build_flags) {
                        break index;
                    }
                    // Packets only return to the free list from inside the
                    // critical section, so drop it between attempts or the
                    // drain can never run and the wait never ends.
                    self.link.exit_critical();
                    core::hint::spin_loop();
                    self.link.enter_critical();
                };
                self.build = Some(index);
                self.message_open = true;
                index
            }
        };

        let packet = self.driver.packet_mut(index);
        packet.data[packet.len as usize] = byte;
        packet.len += 1;

        if packet.len as usize == DRIVER_PACKET_CAPACITY {
            let filled = packet.flags;
            let next = if filled.contains(PacketFlags::LAST) {
                PacketFlags::empty()
            } else {
                filled.usage() & !PacketFlags::FIRST
            };
            self.flush_build(false);
            self.build_flags = next;
            if filled.contains(PacketFlags::LAST) {
                self.message_open = false;
            }
        }
    }

    fn flush_build(&mut self, mark_last: bool) {
        let Some(index) = self.build.take() else {
            if mark_last {
                self.message_open = false;
                self.build_flags = PacketFlags::empty();
            }
            return;
        };

        let packet = self.driver.packet_mut(index);
        if mark_last {
            packet.flags.insert(PacketFlags::LAST);
        }
        packet.flags.insert(PacketFlags::READY);
        trace!(
            "tx: enqueue driver packet {index} ({} bytes, flags {:#04x})",
            packet.len,
            packet.flags.bits()
        );

        // Cannot fail: the queue is sized for every packet and slot at once.
        let _ = self.tx_queue.push_back(PacketRef::Driver(index));
        self.link.enable_write_notify();

        if mark_last {
            self.message_open = false;
            self.build_flags = PacketFlags::empty();
        }
    }
}

// App-owned packets
impl<L: LinkIo> Engine<L> {
    /// Queue an app-owned packet for transmission, bypassing the builder.
    ///
    /// The caller's buffer is held by the slot until
    /// [`Engine::release_app_packet`] hands it back.  Fails if the slot is
    /// the current active TX or RX packet ([`Error::Busy`]), has an
    /// unreleased transfer ([`Error::Pending`]), or `size` exceeds the
    /// buffer or the 16-bit wire size ([`Error::PayloadTooLarge`]).
    pub fn queue_app_packet(
        &mut self,
        index: u8,
        flags: PacketFlags,
        buf: &'static mut [u8],
        size: usize,
    ) -> Result<()> {
        self.gate()?;
        self.check_app_index(index)?;
        if size > buf.len() || size > u16::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }
        self.with_critical(|engine| {
            engine.check_slot_idle(index)?;
            engine.app.acquire_for_tx(index, flags, buf, size as u16);
            // Cannot fail: each slot is queued at most once.
            let _ = engine.tx_queue.push_back(PacketRef::App(index));
            engine.link.enable_write_notify();
            trace!("tx: enqueue app packet {index} ({size} bytes)");
            Ok(())
        })
    }

    /// Whether the app slot's transmit has completed.
    pub fn is_app_tx_done(&self, index: u8) -> bool {
        self.app.contains(index) && {
            let flags = self.app.slot(index).flags();
            flags.contains(PacketFlags::DONE) && !flags.contains(PacketFlags::FOR_RX)
        }
    }

    /// Prime an app slot to receive a frame addressed to its index.  The
    /// buffer's length is the slot's capacity; an incoming frame declaring
    /// a larger size is discarded.  Same failure modes as
    /// [`Engine::queue_app_packet`].
    pub fn prepare_app_rx_packet(&mut self, index: u8, buf: &'static mut [u8]) -> Result<()> {
        self.gate()?;
        self.check_app_index(index)?;
        if buf.len() > u16::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }
        self.with_critical(|engine| {
            engine.check_slot_idle(index)?;
            let capacity = buf.len() as u16;
            engine.app.prepare_for_rx(index, buf, capacity);
            trace!("rx: app slot {index} prepared ({capacity} bytes)");
            Ok(())
        })
    }

    /// Whether the app slot's receive has completed.
    pub fn is_app_rx_done(&self, index: u8) -> bool {
        self.app.contains(index) && {
            let flags = self.app.slot(index).flags();
            flags.contains(PacketFlags::DONE) && flags.contains(PacketFlags::FOR_RX)
        }
    }

    /// Flags of a completed app receive (usage bits from the frame, plus
    /// the slot's process bits).
    pub fn app_rx_flags(&self, index: u8) -> Result<PacketFlags> {
        self.check_app_index(index)?;
        Ok(self.app.slot(index).flags())
    }

    /// Received payload length of a completed app receive.
    pub fn app_rx_size(&self, index: u8) -> Result<usize> {
        self.check_app_index(index)?;
        Ok(self.app.slot(index).len())
    }

    /// Reset an app slot to idle and take the caller's buffer back.  Fails
    /// while the slot is the current active TX or RX packet.
    pub fn release_app_packet(&mut self, index: u8) -> Result<&'static mut [u8]> {
        self.check_app_index(index)?;
        self.with_critical(|engine| {
            if engine.slot_is_active(index) {
                return Err(Error::Busy);
            }
            engine.app.take_buffer(index).ok_or(Error::NoData)
        })
    }

    fn check_app_index(&self, index: u8) -> Result<()> {
        if self.app.contains(index) {
            Ok(())
        } else {
            Err(Error::InvalidIndex)
        }
    }

    fn slot_is_active(&self, index: u8) -> bool {
        self.tx.active == Some(PacketRef::App(index))
            || self.rx.active == Some(PacketRef::App(index))
    }

    fn check_slot_idle(&self, index: u8) -> Result<()> {
        if self.slot_is_active(index) {
            return Err(Error::Busy);
        }
        let flags = self.app.slot(index).flags();
        if flags.intersects(PacketFlags::READY | PacketFlags::DONE) {
            return Err(Error::Pending);
        }
        Ok(())
    }
}

// Driver-owned RX consumption
impl<L: LinkIo> Engine<L> {
    /// Whether a completed driver-owned received packet is waiting.
    pub fn rx_available(&self) -> bool {
        !self.rx_queue.is_empty()
    }

    /// Take the oldest completed driver-owned received packet: copy its
    /// payload into `buf` and return its usage flags and length.  The
    /// packet goes back to the free list in the same call; there is no
    /// separate release step to forget.
    ///
    /// Fails with [`Error::NoData`] when the RX queue is empty and
    /// [`Error::PayloadTooLarge`] (leaving the packet queued) when `buf`
    /// is too small for the payload.
    pub fn consume_rx_packet(&mut self, buf: &mut [u8]) -> Result<(PacketFlags, usize)> {
        self.with_critical(|engine| {
            let &index = engine.rx_queue.front().ok_or(Error::NoData)?;
            let packet = engine.driver.packet(index);
            let len = packet.len();
            if len > buf.len() {
                return Err(Error::PayloadTooLarge);
            }
            let flags = packet.flags().usage();
            buf[..len].copy_from_slice(packet.payload());
            let _ = engine.rx_queue.pop_front();
            engine.driver.release(index);
            Ok((flags, len))
        })
    }
}

// Internal helpers
impl<L: LinkIo> Engine<L> {
    fn gate(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(Error::Disabled)
        }
    }

    fn with_critical<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.link.enter_critical();
        let result = f(self);
        self.link.exit_critical();
        result
    }
}
