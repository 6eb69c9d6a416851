//! Core crate for the carechain permissioned medical-record node.
//!
//! A node keeps an encrypted local chain of record events (`storage`),
//! pools pending submissions (`mempool`) and floods them to peers
//! (`gossip`), produces blocks on a round-robin slot schedule
//! (`consensus`, `node`), and accepts or reorganizes around blocks from
//! the network (`ledger`, `sync`). Epochs close with a Merkle summary
//! (`epoch`) and individual records are certified by the `finalizer`.
//!
//! Applications bootstrap through [`config::NodeConfig`], run a node via
//! [`node::Node`] and [`node::NodeHandle`], and expose the HTTP surface
//! with [`api::serve`]. External verifiers (record schema, wallets,
//! tokens, audit) are injected through the traits in `interfaces`.

pub mod api;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod epoch;
pub mod errors;
pub mod finalizer;
pub mod genesis;
pub mod gossip;
pub mod interfaces;
pub mod ledger;
pub mod mempool;
pub mod network;
pub mod node;
pub mod storage;
pub mod sync;
pub mod types;
