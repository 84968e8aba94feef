use comms::msg::{Distribution, Region};
use rand::Rng;
use rand_distr::{Distribution as _, Normal};

use crate::error::{Result, ServerErr};

/// Highest supported spherical-harmonics degree.
pub const MAX_SH_DEGREE: i64 = 3;

/// The model store: every unit's parameters plus the per-unit
/// optimizer bookkeeping, structure-of-arrays.
///
/// Invariant: all vectors hold exactly `len()` entries whenever a
/// reader can observe the store. Structural mutation re-establishes
/// that atomically because the store is only reachable through one
/// `RwLock` and every mutation runs start-to-finish under the write
/// guard.
#[derive(Debug, Default)]
pub struct GaussianStore {
    positions: Vec<[f32; 3]>,
    log_scales: Vec<[f32; 3]>,
    rotations: Vec<[f32; 4]>,
    opacities: Vec<f32>,
    colors: Vec<[f32; 3]>,

    // optimizer accumulators, keyed 1:1 with units
    grad_accum: Vec<f32>,
    denom: Vec<u32>,
    max_radii: Vec<f32>,

    initialized: bool,
}

impl GaussianStore {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn positions(&self) -> &[[f32; 3]] {
        &self.positions
    }

    pub fn log_scales(&self) -> &[[f32; 3]] {
        &self.log_scales
    }

    pub fn rotations(&self) -> &[[f32; 4]] {
        &self.rotations
    }

    pub fn opacities(&self) -> &[f32] {
        &self.opacities
    }

    pub fn colors(&self) -> &[[f32; 3]] {
        &self.colors
    }

    /// Lengths of every auxiliary buffer, used to assert the 1:1
    /// invariant from tests.
    pub fn aux_lens(&self) -> [usize; 3] {
        [self.grad_accum.len(), self.denom.len(), self.max_radii.len()]
    }

    /// Bootstraps the store from a dataset seed cloud, replacing any
    /// previous content.
    pub fn create_from_seed(&mut self, points: &[[f32; 3]], colors: &[[f32; 3]]) {
        debug_assert_eq!(points.len(), colors.len());

        self.positions = points.to_vec();
        self.colors = colors.to_vec();
        self.log_scales = vec![[-4.6; 3]; points.len()];
        self.rotations = vec![[1.0, 0.0, 0.0, 0.0]; points.len()];
        self.opacities = vec![0.1f32.ln() - (1.0f32 - 0.1).ln(); points.len()];
        self.rebuild_accumulators();
        self.initialized = true;
    }

    /// Replaces the store contents wholesale (model load).
    pub fn replace(&mut self, other: GaussianStore) {
        *self = other;
    }

    /// Builds a store directly from unit arrays, with fresh
    /// accumulators. Used by snapshot loading.
    pub fn from_parts(
        positions: Vec<[f32; 3]>,
        log_scales: Vec<[f32; 3]>,
        rotations: Vec<[f32; 4]>,
        opacities: Vec<f32>,
        colors: Vec<[f32; 3]>,
    ) -> Result<Self> {
        let n = positions.len();
        if [log_scales.len(), rotations.len(), opacities.len(), colors.len()] != [n; 4] {
            return Err(ServerErr::Snapshot {
                detail: "unit arrays disagree on length".to_string(),
            });
        }

        let mut store = Self {
            positions,
            log_scales,
            rotations,
            opacities,
            colors,
            initialized: n > 0,
            ..Self::default()
        };
        store.rebuild_accumulators();
        Ok(store)
    }

    /// Resets every optimizer accumulator to zero at the current unit
    /// count. Stale accumulator entries indexed against a different
    /// unit ordering are a correctness bug, so every structural
    /// mutation and optimizer rebuild ends here.
    pub fn rebuild_accumulators(&mut self) {
        let n = self.len();
        self.grad_accum.clear();
        self.grad_accum.resize(n, 0.0);
        self.denom.clear();
        self.denom.resize(n, 0);
        self.max_radii.clear();
        self.max_radii.resize(n, 0.0);
    }

    /// Records one gradient observation for a unit.
    pub fn accumulate(&mut self, index: usize, grad_norm: f32, radius: f32) {
        self.grad_accum[index] += grad_norm;
        self.denom[index] += 1;
        if radius > self.max_radii[index] {
            self.max_radii[index] = radius;
        }
    }

    /// Nudges a unit position; the synthetic optimizer's "update".
    pub fn nudge_position(&mut self, index: usize, delta: [f32; 3]) {
        let p = &mut self.positions[index];
        p[0] += delta[0];
        p[1] += delta[1];
        p[2] += delta[2];
    }

    /// Adds `count` units placed inside `frame` per `distribution`.
    ///
    /// The whole operation is one mutation: unit arrays grow and every
    /// accumulator is rebuilt before the write guard is released.
    ///
    /// # Returns
    /// The number of units added, or `MissingModel` when no model
    /// exists yet.
    pub fn add_points<R: Rng>(
        &mut self,
        count: usize,
        distribution: Distribution,
        frame: Region,
        rng: &mut R,
    ) -> Result<usize> {
        if !self.initialized {
            return Err(ServerErr::MissingModel);
        }
        validate_region(&frame)?;

        let center = [
            (frame.min[0] + frame.max[0]) / 2.0,
            (frame.min[1] + frame.max[1]) / 2.0,
            (frame.min[2] + frame.max[2]) / 2.0,
        ];

        for _ in 0..count {
            let mut p = [0.0f32; 3];
            for axis in 0..3 {
                p[axis] = match distribution {
                    Distribution::Uniform => {
                        let (lo, hi) = (frame.min[axis], frame.max[axis]);
                        if lo < hi {
                            rng.random_range(lo..hi)
                        } else {
                            lo
                        }
                    }
                    Distribution::Normal => {
                        let std_dev = ((frame.max[axis] - frame.min[axis]).abs() / 4.0).max(1e-6);
                        // SAFETY: std_dev is clamped positive and finite.
                        let normal = Normal::new(center[axis], std_dev).unwrap();
                        normal.sample(rng)
                    }
                };
            }

            self.positions.push(p);
            self.log_scales.push([-4.6; 3]);
            self.rotations.push([1.0, 0.0, 0.0, 0.0]);
            self.opacities.push(0.0);
            self.colors.push([0.5; 3]);
        }

        self.rebuild_accumulators();
        Ok(count)
    }

    /// Removes every unit matching the region predicate (inside the
    /// box, or outside when `invert` is set), pruning the matching
    /// accumulator entries in the same pass.
    ///
    /// # Returns
    /// The number of units removed; zero matches is a successful no-op.
    pub fn remove_points(&mut self, region: Region, invert: bool) -> Result<usize> {
        if !self.initialized {
            return Err(ServerErr::MissingModel);
        }
        validate_region(&region)?;

        let before = self.len();
        let mut write = 0;
        for read in 0..before {
            let inside = Self::contains(&region, &self.positions[read]);
            let remove = inside != invert;
            if remove {
                continue;
            }

            if write != read {
                self.positions[write] = self.positions[read];
                self.log_scales[write] = self.log_scales[read];
                self.rotations[write] = self.rotations[read];
                self.opacities[write] = self.opacities[read];
                self.colors[write] = self.colors[read];
                self.grad_accum[write] = self.grad_accum[read];
                self.denom[write] = self.denom[read];
                self.max_radii[write] = self.max_radii[read];
            }
            write += 1;
        }

        self.positions.truncate(write);
        self.log_scales.truncate(write);
        self.rotations.truncate(write);
        self.opacities.truncate(write);
        self.colors.truncate(write);
        self.grad_accum.truncate(write);
        self.denom.truncate(write);
        self.max_radii.truncate(write);

        Ok(before - write)
    }

    fn contains(region: &Region, p: &[f32; 3]) -> bool {
        (0..3).all(|axis| p[axis] >= region.min[axis] && p[axis] <= region.max[axis])
    }
}

/// Rejects regions the placement and predicate math cannot handle.
/// JSON numbers beyond f32 range arrive as infinities, so this has to
/// hold on wire-reachable input, not just local callers.
fn validate_region(region: &Region) -> Result<()> {
    let finite = region
        .min
        .iter()
        .chain(&region.max)
        .all(|bound| bound.is_finite());
    let ordered = (0..3).all(|axis| region.min[axis] <= region.max[axis]);

    if finite && ordered {
        Ok(())
    } else {
        Err(ServerErr::InvalidRegion)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn seeded_store(n: usize) -> GaussianStore {
        let points: Vec<[f32; 3]> = (0..n).map(|i| [i as f32, 0.0, 0.0]).collect();
        let colors = vec![[0.5; 3]; n];
        let mut store = GaussianStore::default();
        store.create_from_seed(&points, &colors);
        store
    }

    #[test]
    fn edit_before_init_is_an_error() {
        let mut store = GaussianStore::default();
        let region = Region {
            min: [-1.0; 3],
            max: [1.0; 3],
        };

        let mut rng = StdRng::seed_from_u64(7);
        assert!(matches!(
            store.add_points(10, Distribution::Uniform, region, &mut rng),
            Err(ServerErr::MissingModel)
        ));
        assert!(matches!(
            store.remove_points(region, false),
            Err(ServerErr::MissingModel)
        ));
    }

    #[test]
    fn add_points_keeps_accumulators_dense() {
        let mut store = seeded_store(8);
        let mut rng = StdRng::seed_from_u64(7);
        let frame = Region {
            min: [-1.0; 3],
            max: [1.0; 3],
        };

        let added = store
            .add_points(5, Distribution::Uniform, frame, &mut rng)
            .unwrap();
        assert_eq!(added, 5);
        assert_eq!(store.len(), 13);
        assert_eq!(store.aux_lens(), [13; 3]);
    }

    #[test]
    fn normal_distribution_placement_stays_finite() {
        let mut store = seeded_store(1);
        let mut rng = StdRng::seed_from_u64(3);
        let frame = Region {
            min: [0.0; 3],
            max: [0.0; 3],
        };

        store
            .add_points(16, Distribution::Normal, frame, &mut rng)
            .unwrap();
        assert!(store.positions().iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn remove_points_prunes_matching_accumulators() {
        let mut store = seeded_store(10);
        for i in 0..10 {
            store.accumulate(i, i as f32, 0.0);
        }

        // units at x in [0, 4] match
        let region = Region {
            min: [-0.5, -1.0, -1.0],
            max: [4.5, 1.0, 1.0],
        };
        let removed = store.remove_points(region, false).unwrap();

        assert_eq!(removed, 5);
        assert_eq!(store.len(), 5);
        assert_eq!(store.aux_lens(), [5; 3]);
        // survivors keep their own accumulator entries
        assert_eq!(store.grad_accum, vec![5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn inverted_predicate_keeps_the_inside() {
        let mut store = seeded_store(10);
        let region = Region {
            min: [-0.5, -1.0, -1.0],
            max: [4.5, 1.0, 1.0],
        };

        let removed = store.remove_points(region, true).unwrap();
        assert_eq!(removed, 5);
        assert!(store.positions().iter().all(|p| p[0] <= 4.5));
    }

    #[test]
    fn overflowing_wire_bounds_are_rejected_not_fatal() {
        // JSON -1e39 does not fit an f32 and deserializes to -inf
        let region: Region =
            serde_json::from_str(r#"{"min": [-1e39, 0.0, 0.0], "max": [1.0, 1.0, 1.0]}"#).unwrap();
        assert!(region.min[0].is_infinite());

        let mut store = seeded_store(4);
        let mut rng = StdRng::seed_from_u64(7);
        assert!(matches!(
            store.add_points(3, Distribution::Uniform, region, &mut rng),
            Err(ServerErr::InvalidRegion)
        ));
        assert!(matches!(
            store.remove_points(region, false),
            Err(ServerErr::InvalidRegion)
        ));
        // nothing was applied
        assert_eq!(store.len(), 4);
        assert_eq!(store.aux_lens(), [4; 3]);
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let mut store = seeded_store(4);
        let region = Region {
            min: [1.0; 3],
            max: [-1.0; 3],
        };

        let mut rng = StdRng::seed_from_u64(7);
        assert!(matches!(
            store.add_points(3, Distribution::Normal, region, &mut rng),
            Err(ServerErr::InvalidRegion)
        ));
        assert!(matches!(
            store.remove_points(region, true),
            Err(ServerErr::InvalidRegion)
        ));
    }

    #[test]
    fn empty_match_is_a_successful_noop() {
        let mut store = seeded_store(4);
        let region = Region {
            min: [100.0; 3],
            max: [200.0; 3],
        };

        let removed = store.remove_points(region, false).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.len(), 4);
        assert_eq!(store.aux_lens(), [4; 3]);
    }
}
