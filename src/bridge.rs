//! Per-tick orchestration gluing the CAN driver, the two frame queues,
//! and the UDP transport together.

use core::net::SocketAddr;

use heapless::Vec;

use crate::codec::{self, DatagramEncoder, DecodeError, MIN_MTU};
use crate::frame::Frame;
use crate::queue::FrameQueue;

/// Access to the physical CAN controller.
///
/// `try_transmit` offers one frame for transmission and reports whether
/// the controller accepted it; a declined frame stays at the head of
/// its queue and is offered again on the next tick, so retry policy
/// lives entirely in the driver. `poll_receive` pulls whatever frames
/// are pending off the controller and enqueues them itself via
/// [`FrameQueue::enqueue`], returning how many it had to drop because
/// the queue was full.
pub trait CanDriver {
    fn try_transmit(&mut self, frame: &Frame) -> bool;
    fn poll_receive<const N: usize>(&mut self, queue: &mut FrameQueue<N>) -> u32;
}

/// Hands encoded datagrams to the network stack, fire and forget: no
/// delivery confirmation ever comes back. Returning `false` means the
/// stack could not take the datagram right now (out of buffers, link
/// down); the bridge keeps the datagram staged and offers the same
/// bytes again on the next tick.
pub trait Transport {
    fn send(&mut self, datagram: &[u8], remote: SocketAddr) -> bool;
}

/// Settings handed to [`Bridge::new`] once at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BridgeConfig {
    /// Port the platform glue binds the local UDP socket to.
    pub local_port: u16,
    /// Peer all outbound datagrams are addressed to.
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    pub remote: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    #[error("An MTU of {0} bytes cannot hold a full frame record (minimum {MIN_MTU})")]
    MtuTooSmall(usize),
}

/// Running counters exposed to the embedding application. Everything
/// that can go wrong in the bridge is recoverable and shows up here
/// rather than stopping the tick; the counters wrap silently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BridgeStats {
    /// Datagrams handed to [`Bridge::handle_datagram`], valid or not.
    pub datagrams_received: u32,
    /// Datagrams accepted by the transport.
    pub datagrams_sent: u32,
    /// Frames decoded off the network and queued for bus transmission.
    pub frames_decoded: u32,
    /// Frames drained from the bus side into outbound datagrams.
    pub frames_encoded: u32,
    /// Frames accepted by the CAN controller.
    pub frames_transmitted: u32,
    /// Bus frames the driver dropped because the outbound queue was full.
    pub bus_rx_dropped: u32,
    /// Datagrams rejected outright: too short, empty batch, or a record
    /// declaring an impossible length.
    pub malformed_datagrams: u32,
    /// Datagrams carrying an unknown protocol version.
    pub version_mismatches: u32,
    /// Datagrams carrying an op code other than data.
    pub unsupported_op_codes: u32,
    /// Datagrams that ended in the middle of a record.
    pub truncated_datagrams: u32,
    /// Datagrams cut short because the bus-bound queue filled up.
    pub queue_overruns: u32,
    /// Flush attempts deferred because the transport was not ready.
    pub send_deferrals: u32,
}

fn bump(counter: &mut u32) {
    *counter = counter.wrapping_add(1);
}

/// The bridge core: two bounded frame queues, the datagram codec, and
/// the fixed three-step tick that moves frames between bus and network.
///
/// `N` is the slot count of each queue (holding up to `N - 1` frames),
/// `MTU` the largest datagram the transport will carry. All storage is
/// owned inline; the bridge never allocates, never blocks, and keeps
/// ticking through any decode or queue error.
pub struct Bridge<C, T, const N: usize, const MTU: usize> {
    driver: Option<C>,
    transport: T,
    config: BridgeConfig,
    /// Bus to network direction.
    to_network: FrameQueue<N>,
    /// Network to bus direction.
    to_bus: FrameQueue<N>,
    encoder: DatagramEncoder,
    /// Encoded datagram awaiting a transport that will take it.
    staged: Vec<u8, MTU>,
    stats: BridgeStats,
}

impl<C, T, const N: usize, const MTU: usize> Bridge<C, T, N, MTU>
where
    C: CanDriver,
    T: Transport,
{
    /// Builds a bridge around a driver and a transport. Pass `None` for
    /// `driver` on a node that only terminates the network side; the
    /// bus steps then do nothing and decoded frames stay queued.
    pub fn new(driver: Option<C>, transport: T, config: BridgeConfig) -> Result<Self, ConfigError> {
        if MTU < MIN_MTU {
            return Err(ConfigError::MtuTooSmall(MTU));
        }

        Ok(Self {
            driver,
            transport,
            config,
            to_network: FrameQueue::new(),
            to_bus: FrameQueue::new(),
            encoder: DatagramEncoder::new(),
            staged: Vec::new(),
            stats: BridgeStats::default(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn driver(&self) -> Option<&C> {
        self.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> Option<&mut C> {
        self.driver.as_mut()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Frames waiting for the CAN controller to accept them.
    pub fn bus_backlog(&self) -> usize {
        self.to_bus.len()
    }

    /// Frames waiting to be flushed into outbound datagrams.
    pub fn network_backlog(&self) -> usize {
        self.to_network.len()
    }

    /// One cooperative scheduling step: offer a frame to the bus, poll
    /// the bus for new frames, then flush the network side. Runs to
    /// completion without blocking; call it forever from the main loop.
    pub fn tick(&mut self) {
        self.transmit_bus_frame();
        self.poll_bus_frames();
        self.flush_datagrams();
    }

    /// Entry point for the transport receive path: decodes one datagram
    /// into the bus-bound queue. Must be called from the same execution
    /// context as [`tick`](Self::tick) (or with the tick excluded, e.g.
    /// interrupts masked); the queues rely on that exclusivity instead
    /// of locks.
    ///
    /// Every failure is recoverable and lands in [`BridgeStats`];
    /// frames decoded before a mid-datagram failure are kept. `payload`
    /// is only borrowed for the duration of the call, so the caller can
    /// release the transport's receive buffer as soon as it returns,
    /// whatever the outcome.
    pub fn handle_datagram(&mut self, payload: &[u8]) {
        bump(&mut self.stats.datagrams_received);

        match codec::decode_datagram(payload, &mut self.to_bus) {
            Ok(count) => {
                self.stats.frames_decoded = self.stats.frames_decoded.wrapping_add(u32::from(count));
            }
            Err(error) => self.record_decode_error(error),
        }
    }

    fn record_decode_error(&mut self, error: DecodeError) {
        match error {
            DecodeError::Malformed => bump(&mut self.stats.malformed_datagrams),
            DecodeError::VersionMismatch(_) => bump(&mut self.stats.version_mismatches),
            DecodeError::UnsupportedOpCode(_) => bump(&mut self.stats.unsupported_op_codes),
            DecodeError::Truncated(decoded) => {
                bump(&mut self.stats.truncated_datagrams);
                self.stats.frames_decoded =
                    self.stats.frames_decoded.wrapping_add(u32::from(decoded));
            }
            DecodeError::QueueFull(decoded) => {
                bump(&mut self.stats.queue_overruns);
                self.stats.frames_decoded =
                    self.stats.frames_decoded.wrapping_add(u32::from(decoded));
            }
        }
    }

    /// Offers the head of the bus-bound queue to the controller and
    /// dequeues it only once the controller has accepted it.
    fn transmit_bus_frame(&mut self) {
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        let Some(frame) = self.to_bus.peek() else {
            return;
        };

        if driver.try_transmit(frame) {
            self.to_bus.dequeue();
            bump(&mut self.stats.frames_transmitted);
        }
    }

    fn poll_bus_frames(&mut self) {
        let Some(driver) = self.driver.as_mut() else {
            return;
        };

        let dropped = driver.poll_receive(&mut self.to_network);
        self.stats.bus_rx_dropped = self.stats.bus_rx_dropped.wrapping_add(dropped);
    }

    /// Drains the network-bound queue into as many datagrams as it
    /// takes, handing each to the transport. A declined send leaves the
    /// datagram staged for the next tick instead of re-encoding, so no
    /// frame is lost between the queue and the wire.
    fn flush_datagrams(&mut self) {
        loop {
            if self.staged.is_empty() {
                let consumed = self.encoder.encode(&mut self.to_network, &mut self.staged);
                if consumed == 0 {
                    return;
                }
                self.stats.frames_encoded =
                    self.stats.frames_encoded.wrapping_add(consumed as u32);
            }

            if self.transport.send(&self.staged, self.config.remote) {
                self.staged.clear();
                bump(&mut self.stats.datagrams_sent);
            } else {
                bump(&mut self.stats.send_deferrals);
                return;
            }
        }
    }
}
