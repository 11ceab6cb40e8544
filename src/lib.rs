//! audiobridge
//!
//! Real-time network audio transport, receiver side: streams of
//! uncompressed PCM arrive as RTP over unreliable UDP and come out as
//! a continuous sample stream, with packet loss repaired by forward
//! error correction, reordering and jitter absorbed by a sorted queue,
//! and sender/receiver clock drift tracked by a resampling control
//! loop holding a target latency.
//!
//! The caller owns the I/O: datagrams are pushed in through
//! [`session::SessionGroup`] write endpoints from a network thread,
//! and an output device pulls frames through [`session::Receiver`].
//! Reads never fail and never block on the network; missing audio
//! comes out as flagged silence.

pub mod address;
pub mod audio;
pub mod config;
pub mod error;
pub mod fec;
pub mod packet;
pub mod rtcp;
pub mod rtp;
pub mod session;
pub mod units;

pub use address::{EndpointUri, Interface, Protocol};
pub use config::{ClockSource, ReceiverConfig};
pub use error::{Error, Result};
pub use session::{OutputSink, Receiver, SessionGroup};
