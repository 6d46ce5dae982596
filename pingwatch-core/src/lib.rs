#![forbid(unsafe_code)]

//! Latency tracking towards a dynamically discovered game server and its
//! first-hop gateway.
//!
//! The [`detect`] chain answers "which server am I talking to", the
//! [`sample`] strategies measure round-trip time, and a [`tracker::Tracker`]
//! ties one of each together on a timer behind a bounded sliding window.

pub mod config;
pub mod detect;
pub mod error;
pub mod factory;
pub mod host;
pub mod publish;
pub mod sample;
pub mod subscribers;
pub mod tracker;
pub mod window;

pub use config::{PacketPair, PortRange, TrackerConfig};
pub use detect::{is_unset, AddressDetector, UNSET_ADDRESS};
pub use error::{DetectError, Error, Result, SampleError};
pub use factory::{build_gateway_tracker, build_tracker, TrackerKind};
pub use host::{HostOptions, PingHost};
pub use publish::{forward_to, BroadcastPublisher, SnapshotPublisher, UdpJsonPublisher};
pub use sample::{Rtt, RttSampler};
pub use subscribers::{Subscribers, SubscriptionId};
pub use tracker::{SampleOutcome, Tracker, TrackerSnapshot, TrackerState};
pub use window::SlidingWindow;
