//! Hypervolume indicator and per-member contribution.
//!
//! Objective values are oriented so larger is better (minimised
//! objectives are negated), then:
//!
//! - 1 objective: best distance past the reference
//! - 2 objectives: sort-and-sweep over dominated area
//! - 3 objectives: slab sweep, one 2D area per z-level
//! - 4+ objectives: Monte Carlo inside the bounding box

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{Candidate, ParetoOptimizer};

/// Reference point keyed by objective name. Missing values count as 0.
pub type ReferencePoint = BTreeMap<String, f64>;

fn area_2d(points: &mut [[f64; 2]], reference: [f64; 2]) -> f64 {
    points.sort_by(|a, b| b[0].total_cmp(&a[0]));
    let mut area = 0.0;
    let mut prev_y = reference[1];
    for p in points.iter() {
        if p[1] > prev_y {
            area += (p[0] - reference[0]) * (p[1] - prev_y);
            prev_y = p[1];
        }
    }
    area
}

fn volume_3d(points: &mut [[f64; 3]], reference: [f64; 3]) -> f64 {
    points.sort_by(|a, b| b[2].total_cmp(&a[2]));
    let mut volume = 0.0;
    let mut slab: Vec<[f64; 2]> = Vec::with_capacity(points.len());
    for i in 0..points.len() {
        slab.push([points[i][0], points[i][1]]);
        let next_z = points.get(i + 1).map_or(reference[2], |p| p[2]);
        let depth = points[i][2] - next_z;
        if depth > 0.0 {
            volume += area_2d(&mut slab.clone(), [reference[0], reference[1]]) * depth;
        }
    }
    volume
}

fn monte_carlo(points: &[Vec<f64>], reference: &[f64], samples: usize, rng: &mut StdRng) -> f64 {
    let dims = reference.len();
    let upper: Vec<f64> = (0..dims)
        .map(|d| points.iter().map(|p| p[d]).fold(f64::NEG_INFINITY, f64::max))
        .collect();

    let box_volume: f64 = (0..dims).map(|d| upper[d] - reference[d]).product();
    if box_volume <= 0.0 || samples == 0 {
        return 0.0;
    }

    let mut dominated = 0usize;
    let mut sample = vec![0.0; dims];
    for _ in 0..samples {
        for d in 0..dims {
            sample[d] = rng.gen_range(reference[d]..=upper[d]);
        }
        if points
            .iter()
            .any(|p| p.iter().zip(&sample).all(|(pv, sv)| pv >= sv))
        {
            dominated += 1;
        }
    }
    box_volume * dominated as f64 / samples as f64
}

impl ParetoOptimizer {
    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Oriented points that strictly improve on the reference in every
    /// objective. Anything else dominates no volume.
    fn oriented_points(&self, front: &[Candidate], reference: &ReferencePoint) -> (Vec<Vec<f64>>, Vec<f64>) {
        let reference: Vec<f64> = self
            .objectives
            .iter()
            .map(|o| o.oriented(reference.get(&o.name).copied().unwrap_or(0.0)))
            .collect();

        let points = front
            .iter()
            .map(|c| {
                self.objectives
                    .iter()
                    .map(|o| o.oriented(c.value(&o.name)))
                    .collect::<Vec<f64>>()
            })
            .filter(|p| p.iter().zip(&reference).all(|(v, r)| v > r))
            .collect();

        (points, reference)
    }

    /// Volume of objective space dominated by `front` and bounded by `reference`.
    pub fn hypervolume(&self, front: &[Candidate], reference: &ReferencePoint) -> f64 {
        let (points, r) = self.oriented_points(front, reference);
        if points.is_empty() {
            return 0.0;
        }

        match r.len() {
            0 => 0.0,
            1 => points
                .iter()
                .map(|p| p[0] - r[0])
                .fold(0.0, f64::max),
            2 => {
                let mut pts: Vec<[f64; 2]> = points.iter().map(|p| [p[0], p[1]]).collect();
                area_2d(&mut pts, [r[0], r[1]])
            }
            3 => {
                let mut pts: Vec<[f64; 3]> = points.iter().map(|p| [p[0], p[1], p[2]]).collect();
                volume_3d(&mut pts, [r[0], r[1], r[2]])
            }
            dims => {
                debug!(
                    dims,
                    samples = self.config.monte_carlo_samples,
                    "Estimating hypervolume by sampling"
                );
                monte_carlo(&points, &r, self.config.monte_carlo_samples, &mut self.rng())
            }
        }
    }

    /// Hypervolume lost when `solution_id` leaves the front. 0 if absent.
    pub fn contribution(&self, solution_id: &str, front: &[Candidate], reference: &ReferencePoint) -> f64 {
        if !front.iter().any(|c| c.id == solution_id) {
            return 0.0;
        }
        let without: Vec<Candidate> = front
            .iter()
            .filter(|c| c.id != solution_id)
            .cloned()
            .collect();
        self.hypervolume(front, reference) - self.hypervolume(&without, reference)
    }

    /// Front member whose removal costs the least hypervolume.
    pub fn most_replaceable(&self, front: &[Candidate], reference: &ReferencePoint) -> Option<String> {
        front
            .iter()
            .map(|c| (c, self.contribution(&c.id, front, reference)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(c, _)| c.id.clone())
    }
}
