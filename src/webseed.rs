//! BEP-19: web seeding over HTTP
//!
//! A web seed is an HTTP server holding the torrent's files. It is driven
//! through the same [`PeerConnection`](crate::peer::PeerConnection) as any
//! BitTorrent peer: [`WebPeerConnection`] turns the core's block requests
//! into `Range` requests and the responses back into blocks.
//!
//! What the torrent knows about each seed outlives its connections and
//! lives in [`WebSeedList`]: cooldowns after `503`, redirect targets,
//! pieces the server turned out not to have, and the partial block a
//! dropped connection left behind.
//!
//! [BEP-19]: http://bittorrent.org/beps/bep_0019.html

mod connection;
mod error;
mod registry;
mod request;

pub use connection::{connect_web_seed, run_web_seed, WebPeerConnection};
pub use error::WebSeedError;
pub use registry::{RestartState, WebSeedEntry, WebSeedList};
pub use request::{build_range_request, escape_path, escaped_file_path, file_url, parse_seed_url};
