//! Wire markers and packet flags.
//!
//! A packet's flags byte carries its usage in bits 0-3 (what kind of data
//! it holds, and whether it is the first/last packet of a logical message)
//! and its processing state in bits 4-7.  The whole byte travels on the
//! wire as the FLAGS field of a frame.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use bitflags::bitflags;

/// Start-of-frame marker.
pub const START: u8 = 0x8C;

/// Escape marker.  On transmit, a size or payload byte equal to any marker
/// is preceded by this byte; the receiver's payload phase takes the byte
/// after an ESCAPE literally.
pub const ESCAPE: u8 = 0x9D;

/// End-of-frame marker.
pub const END: u8 = 0xAE;

/// Whether a byte collides with one of the reserved markers and so must be
/// escaped on the wire.
pub const fn is_marker(byte: u8) -> bool {
    byte == START || byte == ESCAPE || byte == END
}

bitflags! {
    /// Packet flags byte.
    ///
    /// Usage bits 0-3: with neither `COMMAND` nor `RESPONSE` set the packet
    /// carries printable output (PRINT usage).  `FIRST`/`LAST` delimit a
    /// logical message spanning several packets; neither set means a middle
    /// packet.
    ///
    /// Process bits 4-7: `READY` marks a packet queued or filling for
    /// transfer, `DONE` a completed transfer.  The two are mutually
    /// exclusive except at the instant of transition.  `FOR_RX` flips per
    /// transaction to indicate the packet's current role; `APP_OWNED` is
    /// fixed for a slot's lifetime.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const COMMAND = 0x01;
        const RESPONSE = 0x02;
        const FIRST = 0x04;
        const LAST = 0x08;
        const READY = 0x10;
        const DONE = 0x20;
        const FOR_RX = 0x40;
        const APP_OWNED = 0x80;

        /// Mask of the usage bits.
        const USAGE = 0x0F;
    }
}

impl PacketFlags {
    /// The usage bits alone.
    pub fn usage(self) -> PacketFlags {
        self & PacketFlags::USAGE
    }

    /// PRINT usage: neither COMMAND nor RESPONSE set.
    pub fn is_print(self) -> bool {
        !self.intersects(PacketFlags::COMMAND | PacketFlags::RESPONSE)
    }

    /// Classify the first byte of a logical message: the printable ASCII
    /// range maps to PRINT usage, everything else to COMMAND.  Either way
    /// the packet is tagged FIRST.
    pub fn classify(byte: u8) -> PacketFlags {
        if (0x20..=0x7E).contains(&byte) {
            PacketFlags::FIRST
        } else {
            PacketFlags::COMMAND | PacketFlags::FIRST
        }
    }
}

/// Identity of a packet for queue membership and active-pointer checks:
/// either a driver pool index or an app slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketRef {
    Driver(u8),
    App(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_distinct() {
        assert!(is_marker(START));
        assert!(is_marker(ESCAPE));
        assert!(is_marker(END));
        assert!(!is_marker(0x00));
        assert!(!is_marker(0x8B));
    }

    #[test]
    fn classify_printable_is_print() {
        let flags = PacketFlags::classify(b'A');
        assert!(flags.is_print());
        assert!(flags.contains(PacketFlags::FIRST));
    }

    #[test]
    fn classify_control_is_command() {
        for byte in [0x00u8, 0x1F, 0x7F, 0xFF] {
            let flags = PacketFlags::classify(byte);
            assert!(flags.contains(PacketFlags::COMMAND));
            assert!(flags.contains(PacketFlags::FIRST));
        }
    }

    #[test]
    fn usage_masks_process_bits() {
        let flags = PacketFlags::COMMAND
            | PacketFlags::LAST
            | PacketFlags::READY
            | PacketFlags::APP_OWNED;
        assert_eq!(flags.usage(), PacketFlags::COMMAND | PacketFlags::LAST);
    }
}
