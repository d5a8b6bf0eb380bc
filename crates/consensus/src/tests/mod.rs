//! Multi-node gossip tests over in-memory transports
