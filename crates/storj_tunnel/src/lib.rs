//! The tunnel subsystem (§4.7, §4.8): lets a NAT-bound node reach the overlay through
//! a publicly reachable peer when direct contact fails. A tunneling-capable node runs
//! [`bucket::TunnelerBucket`], [`handlers::FindTunnelHandler`]/[`handlers::OpenTunnelHandler`],
//! and [`announce::run_announce_loop`]; a NAT-bound node runs [`client::TunnelClient`]
//! at join time to fall back onto one.

pub mod announce;
pub mod bucket;
pub mod client;
pub mod handlers;
pub mod pubsub;
pub mod slots;

pub use bucket::{BucketSubscriber, TunnelerAnnouncement, TunnelerBucket};
pub use client::{TunnelClient, TunnelError, TunnelOutcome};
pub use handlers::{FindTunnelHandler, OpenTunnelHandler};
pub use pubsub::{PubSub, PubSubError, TopicHandler};
pub use slots::RelaySlots;
