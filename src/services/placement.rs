//! Fragment placement policies.
//!
//! A policy maps each fragment index of a single write onto one server from
//! the current fleet snapshot. Policies hold no state across calls.

use crate::models::server::Server;
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no servers available")]
    NoServersAvailable,
}

/// Chooses a server for every fragment index of one write.
pub trait PlacementPolicy: Send + Sync {
    /// Returns exactly `fragment_count` servers; entry `i` owns fragment `i`.
    fn place(&self, servers: &[Server], fragment_count: usize)
    -> Result<Vec<Server>, PlacementError>;
}

/// Least-used-space round robin.
///
/// Servers are sorted ascending by `used_space` (stable, so ties keep their
/// directory order) and fragment `i` goes to `sorted[i % len]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastUsedPlacement;

impl PlacementPolicy for LeastUsedPlacement {
    fn place(
        &self,
        servers: &[Server],
        fragment_count: usize,
    ) -> Result<Vec<Server>, PlacementError> {
        if servers.is_empty() {
            return Err(PlacementError::NoServersAvailable);
        }

        let mut sorted = servers.to_vec();
        sorted.sort_by_key(|s| s.used_space);

        Ok((0..fragment_count)
            .map(|i| sorted[i % sorted.len()].clone())
            .collect())
    }
}

/// Uniformly random assignment. Kept as a swappable alternative; not the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPlacement;

impl PlacementPolicy for RandomPlacement {
    fn place(
        &self,
        servers: &[Server],
        fragment_count: usize,
    ) -> Result<Vec<Server>, PlacementError> {
        if servers.is_empty() {
            return Err(PlacementError::NoServersAvailable);
        }

        let mut rng = rand::thread_rng();
        Ok((0..fragment_count)
            .map(|_| servers[rng.gen_range(0..servers.len())].clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn server(addr: &str, used_space: i64) -> Server {
        Server::new(Uuid::new_v4(), addr, used_space)
    }

    fn addrs(placed: &[Server]) -> Vec<&str> {
        placed.iter().map(|s| s.addr.as_str()).collect()
    }

    #[test]
    fn least_used_wraps_around_sorted_fleet() {
        let fleet = vec![server("a", 10), server("b", 0), server("c", 5)];
        let placed = LeastUsedPlacement.place(&fleet, 4).unwrap();
        assert_eq!(addrs(&placed), vec!["b", "c", "a", "b"]);
    }

    #[test]
    fn least_used_ties_keep_input_order() {
        let fleet = vec![server("x", 7), server("y", 7), server("z", 1)];
        let placed = LeastUsedPlacement.place(&fleet, 3).unwrap();
        assert_eq!(addrs(&placed), vec!["z", "x", "y"]);
    }

    #[test]
    fn fewer_fragments_than_servers() {
        let fleet = vec![server("a", 3), server("b", 2), server("c", 1)];
        let placed = LeastUsedPlacement.place(&fleet, 1).unwrap();
        assert_eq!(addrs(&placed), vec!["c"]);
    }

    #[test]
    fn empty_fleet_is_rejected() {
        assert_eq!(
            LeastUsedPlacement.place(&[], 4),
            Err(PlacementError::NoServersAvailable)
        );
        assert_eq!(
            RandomPlacement.place(&[], 4),
            Err(PlacementError::NoServersAvailable)
        );
    }

    #[test]
    fn random_places_only_known_servers() {
        let fleet = vec![server("a", 0), server("b", 0)];
        let placed = RandomPlacement.place(&fleet, 16).unwrap();
        assert_eq!(placed.len(), 16);
        assert!(placed.iter().all(|s| fleet.contains(s)));
    }
}
