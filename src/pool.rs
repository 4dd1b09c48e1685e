//! Packet pools: the driver-owned arena and the app-owned slot table.
//!
//! Driver packets live in a fixed arena and are handed out by index from a
//! free list (pop the head to allocate, push the tail to release).  App
//! slots are addressed positionally and never listed; each references a
//! caller-supplied buffer for the duration of a transfer.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use heapless::Deque;

use crate::packet::PacketFlags;
use crate::{APP_POOL_SIZE, DRIVER_PACKET_CAPACITY, DRIVER_POOL_SIZE};

/// One driver-owned packet: engine-owned inline storage, fixed capacity.
#[derive(Debug, Clone, Copy)]
pub struct DriverPacket {
    pub(crate) flags: PacketFlags,
    pub(crate) len: u16,
    pub(crate) data: [u8; DRIVER_PACKET_CAPACITY],
}

impl DriverPacket {
    const EMPTY: DriverPacket = DriverPacket {
        flags: PacketFlags::empty(),
        len: 0,
        data: [0; DRIVER_PACKET_CAPACITY],
    };

    /// Current flags.
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Actual payload length.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the packet holds no payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The filled portion of the payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Driver-owned packet pool: arena plus free-index list.
pub struct DriverPool {
    packets: [DriverPacket; DRIVER_POOL_SIZE],
    free: Deque<u8, DRIVER_POOL_SIZE>,
}

impl DriverPool {
    pub fn new() -> Self {
        let mut free = Deque::new();
        for index in 0..DRIVER_POOL_SIZE as u8 {
            // Cannot fail: the deque is sized to the pool.
            let _ = free.push_back(index);
        }
        Self {
            packets: [DriverPacket::EMPTY; DRIVER_POOL_SIZE],
            free,
        }
    }

    /// Allocate a packet for transmission.  Pops the free list head and
    /// resets it with the given flags and zero length.  Returns `None` when
    /// the free list is empty.
    pub fn allocate_tx(&mut self, flags: PacketFlags) -> Option<u8> {
        let index = self.free.pop_front()?;
        let packet = &mut self.packets[index as usize];
        packet.flags = flags;
        packet.len = 0;
        Some(index)
    }

    /// Allocate a packet for an incoming frame.  The usage bits come from
    /// the frame's FLAGS byte; the packet is stamped `FOR_RX | READY`.
    pub fn allocate_rx(&mut self, usage: PacketFlags) -> Option<u8> {
        let index = self.free.pop_front()?;
        let packet = &mut self.packets[index as usize];
        packet.flags = usage.usage() | PacketFlags::FOR_RX | PacketFlags::READY;
        packet.len = 0;
        Some(index)
    }

    /// Return a packet to the free list tail.
    pub fn release(&mut self, index: u8) {
        let packet = &mut self.packets[index as usize];
        packet.flags = PacketFlags::empty();
        packet.len = 0;
        // Cannot fail: a packet is never on the free list twice.
        let _ = self.free.push_back(index);
    }

    /// Number of unallocated packets.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn packet(&self, index: u8) -> &DriverPacket {
        &self.packets[index as usize]
    }

    pub(crate) fn packet_mut(&mut self, index: u8) -> &mut DriverPacket {
        &mut self.packets[index as usize]
    }
}

impl Default for DriverPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One app-owned packet slot.  The slot header belongs to the engine; the
/// payload buffer belongs to the caller and is only held here between
/// queue/prepare and release.
pub struct AppSlot {
    pub(crate) flags: PacketFlags,
    pub(crate) len: u16,
    pub(crate) capacity: u16,
    pub(crate) buf: Option<&'static mut [u8]>,
}

impl AppSlot {
    fn new() -> Self {
        Self {
            flags: PacketFlags::empty(),
            len: 0,
            capacity: 0,
            buf: None,
        }
    }

    /// Current flags.
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Actual payload length.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the slot holds no payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// App-owned slot table, addressed by index.
pub struct AppPool {
    slots: [AppSlot; APP_POOL_SIZE],
}

impl AppPool {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| AppSlot::new()),
        }
    }

    /// Stamp a slot for transmission: usage flags plus `APP_OWNED | READY`,
    /// capacity and length both set to the caller's size, buffer installed.
    /// Active-packet exclusivity is the engine's check, not the pool's.
    pub(crate) fn acquire_for_tx(
        &mut self,
        index: u8,
        flags: PacketFlags,
        buf: &'static mut [u8],
        size: u16,
    ) {
        let slot = &mut self.slots[index as usize];
        slot.flags = flags.usage() | PacketFlags::APP_OWNED | PacketFlags::READY;
        slot.capacity = size;
        slot.len = size;
        slot.buf = Some(buf);
    }

    /// Stamp a slot to receive: `APP_OWNED | FOR_RX | READY`, capacity from
    /// the buffer, zero length, buffer installed.
    pub(crate) fn prepare_for_rx(&mut self, index: u8, buf: &'static mut [u8], capacity: u16) {
        let slot = &mut self.slots[index as usize];
        slot.flags = PacketFlags::APP_OWNED | PacketFlags::FOR_RX | PacketFlags::READY;
        slot.capacity = capacity;
        slot.len = 0;
        slot.buf = Some(buf);
    }

    /// Reset a slot to idle and hand the buffer back, if one is installed.
    pub(crate) fn take_buffer(&mut self, index: u8) -> Option<&'static mut [u8]> {
        let slot = &mut self.slots[index as usize];
        // Slot state is only reset once a buffer is actually handed back;
        // a failed release must leave the slot as it was.
        let buf = slot.buf.take()?;
        slot.flags = PacketFlags::empty();
        slot.len = 0;
        slot.capacity = 0;
        Some(buf)
    }

    pub(crate) fn slot(&self, index: u8) -> &AppSlot {
        &self.slots[index as usize]
    }

    pub(crate) fn slot_mut(&mut self, index: u8) -> &mut AppSlot {
        &mut self.slots[index as usize]
    }

    /// Whether an index addresses a real slot.
    pub fn contains(&self, index: u8) -> bool {
        (index as usize) < APP_POOL_SIZE
    }
}

impl Default for AppPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_exhausts_then_fails() {
        let mut pool = DriverPool::new();
        for _ in 0..DRIVER_POOL_SIZE {
            assert!(pool.allocate_tx(PacketFlags::FIRST).is_some());
        }
        assert_eq!(pool.free_count(), 0);
        assert!(pool.allocate_tx(PacketFlags::FIRST).is_none());
    }

    #[test]
    fn release_restores_free_count() {
        let mut pool = DriverPool::new();
        let a = pool.allocate_tx(PacketFlags::COMMAND).unwrap();
        let b = pool.allocate_rx(PacketFlags::RESPONSE).unwrap();
        assert_eq!(pool.free_count(), DRIVER_POOL_SIZE - 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_count(), DRIVER_POOL_SIZE);
    }

    #[test]
    fn allocate_resets_packet() {
        let mut pool = DriverPool::new();
        let index = pool.allocate_tx(PacketFlags::COMMAND).unwrap();
        pool.packet_mut(index).len = 5;
        pool.release(index);

        let index = pool.allocate_tx(PacketFlags::FIRST).unwrap();
        let packet = pool.packet(index);
        assert_eq!(packet.len(), 0);
        assert_eq!(packet.flags(), PacketFlags::FIRST);
    }

    #[test]
    fn allocate_rx_stamps_role_flags() {
        let mut pool = DriverPool::new();
        let index = pool
            .allocate_rx(PacketFlags::COMMAND | PacketFlags::READY)
            .unwrap();
        let flags = pool.packet(index).flags();
        assert!(flags.contains(PacketFlags::FOR_RX));
        assert!(flags.contains(PacketFlags::READY));
        // Process bits of the input must not leak through the usage mask.
        assert!(!flags.contains(PacketFlags::DONE));
        assert_eq!(flags.usage(), PacketFlags::COMMAND);
    }

    #[test]
    fn free_list_is_fifo() {
        let mut pool = DriverPool::new();
        let first = pool.allocate_tx(PacketFlags::empty()).unwrap();
        pool.release(first);
        // All other packets are still free, so the released one comes back
        // last.
        for _ in 0..DRIVER_POOL_SIZE - 1 {
            assert_ne!(pool.allocate_tx(PacketFlags::empty()), Some(first));
        }
        assert_eq!(pool.allocate_tx(PacketFlags::empty()), Some(first));
    }

    #[test]
    fn app_slot_round_trips_buffer() {
        let mut pool = AppPool::new();
        let buf: &'static mut [u8] = std::boxed::Box::leak(std::boxed::Box::new([0u8; 16]));
        pool.prepare_for_rx(3, buf, 16);
        let slot = pool.slot(3);
        assert!(slot.flags().contains(PacketFlags::APP_OWNED));
        assert!(slot.flags().contains(PacketFlags::FOR_RX));
        assert_eq!(slot.capacity, 16);

        let buf = pool.take_buffer(3).unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(pool.slot(3).flags(), PacketFlags::empty());
    }

    #[test]
    fn take_buffer_failure_preserves_slot() {
        let mut pool = AppPool::new();
        // A slot with header state but no buffer: failing to take the
        // buffer must not touch the header.
        let slot = pool.slot_mut(1);
        slot.flags = PacketFlags::APP_OWNED | PacketFlags::DONE;
        slot.len = 7;

        assert!(pool.take_buffer(1).is_none());
        let slot = pool.slot(1);
        assert_eq!(slot.flags(), PacketFlags::APP_OWNED | PacketFlags::DONE);
        assert_eq!(slot.len(), 7);
    }
}
