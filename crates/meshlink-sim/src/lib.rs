//! Simulation tools for meshlink swarms and invitations
//!
//! Runs many peers in one process over a shared in-memory signal context and
//! transport, using the same swarm, presence and invitation code as
//! production.
//!
//! ## Architecture
//!
//! - `simulation::Simulation` - N peers on one topic, topology statistics
//! - `pairing::run_pairing` - one host and one guest walking an invitation

pub mod pairing;
pub mod simulation;

pub use pairing::{run_pairing, PairConfig, PairOutcome};
pub use simulation::{SimConfig, SimStats, SimTopology, Simulation, TopologyStats};

// Re-export meshlink types for convenience
pub use meshlink::{InvitationConfig, PresenceConfig, SwarmConfig};
