//! Packet router
//!
//! Dispatches parsed packets to the per-session write endpoints by
//! stream kind: audio source packets, FEC repair packets, and control
//! packets each have their own route. Packets matching no route are
//! dropped and counted.

use tracing::debug;

use super::{PacketHandle, PacketWriter, FLAG_AUDIO, FLAG_CONTROL, FLAG_REPAIR};

/// Stream kind a route accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Audio packets (plain RTP or FEC source).
    Source,
    /// FEC repair packets.
    Repair,
    /// RTCP control packets.
    Control,
}

impl Route {
    fn matches(self, packet: &PacketHandle) -> bool {
        match self {
            Route::Source => packet.has_flags(FLAG_AUDIO),
            Route::Repair => packet.has_flags(FLAG_REPAIR),
            Route::Control => packet.has_flags(FLAG_CONTROL),
        }
    }
}

/// Routes packets to registered writers by stream kind.
pub struct Router {
    routes: Vec<(Route, Box<dyn PacketWriter + Send>)>,
    n_unrouted: u64,
}

impl Router {
    /// New router with no routes.
    pub fn new() -> Self {
        Router {
            routes: Vec::new(),
            n_unrouted: 0,
        }
    }

    /// Register a writer for a stream kind.
    pub fn add_route(&mut self, route: Route, writer: Box<dyn PacketWriter + Send>) {
        self.routes.push((route, writer));
    }

    /// Packets that matched no route.
    pub fn unrouted(&self) -> u64 {
        self.n_unrouted
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketWriter for Router {
    fn write(&mut self, packet: PacketHandle) {
        for (route, writer) in &mut self.routes {
            if route.matches(&packet) {
                writer.write(packet);
                return;
            }
        }
        self.n_unrouted += 1;
        debug!("router: no route for packet: flags={:#x}", packet.flags());
    }
}
