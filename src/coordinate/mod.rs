//! Vivaldi network coordinates (spec §3.2): a lightweight synthetic
//! coordinate system nodes maintain so that round-trip latency between any
//! two nodes can be estimated without probing them directly.
//!
//! The teacher has no network-coordinate module; this follows the crate's
//! established idiom for a small, self-contained numeric algorithm (plain
//! struct + pure update function + inline unit tests), the way
//! `gossip::swim`'s suspicion-timeout math is structured.

use serde::{Deserialize, Serialize};

const DIMENSIONS: usize = 8;
/// Bounds how far a single RTT sample can move a coordinate, preventing one
/// wildly inaccurate sample from destabilizing the whole estimate.
const MAX_CHANGE: f64 = 1.5;
/// Vivaldi's damping constants controlling how quickly local error and
/// position adapt to new samples (Dabek et al., "Vivaldi: A Decentralized
/// Network Coordinate System").
const CE: f64 = 0.25;
const CC: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub vec: Vec<f64>,
    pub error: f64,
    /// Height term accounts for the "last mile" access-link latency that a
    /// pure Euclidean model underestimates.
    pub height: f64,
}

impl Coordinate {
    pub fn origin() -> Self {
        Self {
            vec: vec![0.0; DIMENSIONS],
            error: 1.5,
            height: 1e-6,
        }
    }

    fn distance(&self, other: &Coordinate) -> f64 {
        let euclidean: f64 = self
            .vec
            .iter()
            .zip(other.vec.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt();
        euclidean + self.height + other.height
    }

    /// Estimate round-trip time to `other` in seconds.
    pub fn estimated_rtt(&self, other: &Coordinate) -> f64 {
        self.distance(other)
    }

    /// Update this coordinate given a fresh RTT sample to `other`
    /// (seconds). Returns the updated coordinate; callers hold the
    /// authoritative copy and replace it with the result.
    pub fn apply_sample(&self, other: &Coordinate, observed_rtt_secs: f64) -> Coordinate {
        let observed_rtt_secs = observed_rtt_secs.max(0.0);
        let estimated = self.distance(other);
        let error_sample = (estimated - observed_rtt_secs).abs() / observed_rtt_secs.max(1e-9);
        let total_error = self.error + other.error;
        let weight = if total_error > 0.0 {
            self.error / total_error
        } else {
            0.5
        };

        let new_error = (error_sample * CE * weight + self.error * (1.0 - CE * weight)).clamp(0.0, 2.0);

        let delta = CC * weight;
        let direction = unit_vector(&self.vec, &other.vec);
        let force = (observed_rtt_secs - estimated).clamp(-MAX_CHANGE, MAX_CHANGE);

        let new_vec: Vec<f64> = self
            .vec
            .iter()
            .zip(direction.iter())
            .map(|(p, d)| p + d * force * delta)
            .collect();

        let new_height = (self.height + (self.height + other.height) * force * delta * 0.25).max(1e-6);

        Coordinate {
            vec: new_vec,
            error: new_error,
            height: new_height,
        }
    }
}

/// Direction from `b` toward `a`, falling back to a fixed unit vector when
/// the two points coincide so the update never divides by zero.
fn unit_vector(a: &[f64], b: &[f64]) -> Vec<f64> {
    let diff: Vec<f64> = a.iter().zip(b.iter()).map(|(x, y)| x - y).collect();
    let magnitude = diff.iter().map(|d| d.powi(2)).sum::<f64>().sqrt();
    if magnitude < 1e-9 {
        let mut fallback = vec![0.0; diff.len()];
        if !fallback.is_empty() {
            fallback[0] = 1.0;
        }
        fallback
    } else {
        diff.into_iter().map(|d| d / magnitude).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_origin_coordinates_converge_toward_observed_rtt() {
        let mut a = Coordinate::origin();
        let b = Coordinate::origin();
        for _ in 0..200 {
            a = a.apply_sample(&b, 0.05);
        }
        assert!((a.estimated_rtt(&b) - 0.05).abs() < 0.02);
    }

    #[test]
    fn error_shrinks_as_samples_agree() {
        let mut a = Coordinate::origin();
        let b = Coordinate::origin();
        let initial_error = a.error;
        for _ in 0..50 {
            a = a.apply_sample(&b, 0.05);
        }
        assert!(a.error < initial_error);
    }

    #[test]
    fn distance_is_symmetric() {
        let mut a = Coordinate::origin();
        let mut b = Coordinate::origin();
        a = a.apply_sample(&Coordinate::origin(), 0.08);
        b = b.apply_sample(&Coordinate::origin(), 0.02);
        assert!((a.distance(&b) - b.distance(&a)).abs() < 1e-9);
    }
}
