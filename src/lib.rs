/* \page GatewayOverview Gateway Overview
Control plane for a self-hosted WireGuard gateway.

- Server configuration and key management (`config.rs`, `keys.rs`).
- Persisted peers and port forwards (`store.rs`).
- Address allocation inside the VPN subnet (`allocator.rs`).
- Device provisioning (`link.rs`) and packet-filter rules (`nat.rs`).
- Peer roster reconciliation (`wg.rs`).
- Peer and port-forward operations (`peer_registry.rs`), client configs (`client_config.rs`).
- Boot sequence and startup restore (`runtime.rs`).
*/
pub mod allocator;
pub mod client_config;
pub mod config;
pub mod error;
pub mod keys;
pub mod link;
pub mod nat;
pub mod peer_registry;
pub mod runtime;
pub mod store;
pub mod wg;

pub use error::{Error, Result};
