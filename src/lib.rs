//! Bidirectional Packet Protocol (BDPP) engine for serial links between a
//! host CPU and a co-processor.
//!
//! The higher layers of a co-processor firmware (graphics commands, audio,
//! buffered scripting) need structured, framed messages rather than a raw
//! byte stream.  This crate provides that framing layer: packet pools, a
//! transmit builder and queue, and the byte-exact transmit/receive state
//! machines that move whole packets across the wire with byte-stuffing.
//!
//! `no_std`.  No allocator required.
//!
//! ## Architecture
//!
//! Two classes of packet storage exist side by side:
//! - **Driver-owned packets**: small fixed-capacity packets backed by
//!   engine-owned storage, drawn from a pool with a free list.  The TX
//!   builder fills these a byte at a time; the receiver allocates one per
//!   incoming frame.
//! - **App-owned packets**: a fixed number of slots, addressed by index,
//!   each referencing a caller-supplied buffer.  The caller hands the
//!   buffer to the engine for the duration of a transfer and takes it back
//!   with [`engine::Engine::release_app_packet`].
//!
//! Data flows producer → TX builder (optional) → TX queue → TX state
//! machine → link → wire → RX state machine → RX queue (driver-owned) or
//! slot done-flag (app-owned) → consumer.
//!
//! The whole engine is single-threaded: [`engine::Engine::process_link`] is
//! the one entry point, invoked whenever the link signals readiness
//! (typically from its interrupt handler).  It drains the receiver until no
//! bytes remain, then drains the transmitter until the queue empties or the
//! link reports not-ready.
//!
//! ## Wire format
//!
//! One frame on the wire:
//!
//! ```text
//! START | FLAGS* | [INDEX, app-owned only] | SIZE_LO* | SIZE_HI* | DATA*... | END
//! ```
//!
//! Fields marked `*` are byte-stuffed on transmit: any byte equal to one of
//! the reserved markers (START `0x8C`, ESCAPE `0x9D`, END `0xAE`) is
//! preceded by ESCAPE.  The receiver unescapes payload bytes only; see
//! [`engine::Engine::process_link`] for the asymmetry.
//!
//! ## Modules
//!
//! - [`engine`] - The protocol engine: pools, queues, builder, both state
//!   machines, and the public API
//! - [`link`] - The [`link::LinkIo`] adapter trait the engine drives, plus
//!   an in-memory loopback implementation
//! - [`packet`] - Marker constants and packet flags
//! - [`pool`] - Driver and app packet pools
//!
//! ## Getting started
//!
//! Implement [`link::LinkIo`] over your serial transport, then:
//!
//! 1. Create an [`engine::Engine`] with the link and the capability flag
//! 2. Call [`engine::Engine::enable`] once the host protocol permits BDPP
//! 3. Invoke [`engine::Engine::process_link`] from the link's interrupt
//!    handler on any readiness signal
//! 4. Send with the builder ([`engine::Engine::write_classified_bytes`] /
//!    [`engine::Engine::flush`]) or with app-owned packets
//!    ([`engine::Engine::queue_app_packet`])
//! 5. Receive with [`engine::Engine::consume_rx_packet`] (driver-owned) or
//!    by polling [`engine::Engine::is_app_rx_done`] (app-owned)
//!
//! Producer calls and `process_link` touch the same pools and queues; on a
//! target where `process_link` runs at interrupt level, implement the
//! [`link::LinkIo`] critical-section hooks (or wrap the engine in a mutex)
//! so that producer calls cannot interleave with a drain.
//!
//! There is no checksum, acknowledgement, or retransmission at this layer.
//! Reliability above "does the frame parse" belongs to the caller.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![no_std]

#[cfg(test)]
extern crate std;

pub mod engine;
pub mod link;
pub mod packet;
pub mod pool;

/// Number of packets in the driver-owned pool.
pub const DRIVER_POOL_SIZE: usize = 8;

/// Payload capacity of each driver-owned packet, in bytes.
pub const DRIVER_PACKET_CAPACITY: usize = 32;

/// Number of app-owned packet slots.
pub const APP_POOL_SIZE: usize = 8;

/// Depth of the TX queue.  Every driver packet and every app slot can be
/// queued at once, so the queue never overflows.
pub const TX_QUEUE_DEPTH: usize = DRIVER_POOL_SIZE + APP_POOL_SIZE;

/// BDPP errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The engine is not permitted on this host (capability gate)
    NotAllowed,
    /// The engine is not enabled
    Disabled,
    /// App slot index out of range
    InvalidIndex,
    /// The slot is the current active TX or RX packet
    Busy,
    /// The slot already has a transfer pending
    Pending,
    /// Payload larger than the supplied buffer
    PayloadTooLarge,
    /// No data or buffer available for the operation
    NoData,
}

/// Type to represent the result of a BDPP operation
pub type Result<T> = core::result::Result<T, Error>;
