//! driftnet - a crawler for the BitTorrent Mainline DHT.
//!
//! A pool of identity-forging indexing nodes solicits FIND_NODE/GET_PEERS
//! traffic, harvests announced infohashes, and fetches the torrent metadata
//! (BEP-9) directly from announcing peers. Completed results are emitted on a
//! single deduplicated output stream.
//!
//! The entry point is [`Manager`]: construct one from a [`Config`], then pull
//! [`IndexingResult`]s from [`Manager::recv`] until you call
//! [`Manager::terminate`].

pub mod bencode;
pub mod config;
pub mod dedup;
pub mod krpc;
pub mod leech;
pub mod manager;
pub mod metainfo;
pub mod node;
pub mod output;
pub mod policy;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use krpc::{InfoHash, NodeId};
pub use leech::IndexingResult;
pub use manager::Manager;
pub use metainfo::FileEntry;
pub use policy::IpFamily;
