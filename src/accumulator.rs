//! Reduction of trajectories to sufficient statistics.

use std::collections::BTreeMap;
use std::ops::Range;

use faer::{Col, Mat};
use itertools::izip;
use ndarray::{s, Array1, Array3, Array4, ArrayD, ArrayView3};
use rayon::prelude::*;

use crate::error::{FitError, Result};
use crate::math::{col_dot, quad_form};
use crate::nonlinear::{scale_atoms, NonlinearTerm, TermId};
use crate::topology::{Topology, TypeIndex};

/// Per atom type sums over all frames, atoms of the type and coordinates.
#[derive(Debug, Clone)]
pub struct SufficientStats {
    /// `sum D'D`, one `P x P` matrix per type.
    pub d2: Vec<Mat<f64>>,
    /// `sum D'r` where `r` is the residual force at `theta0`.
    pub df: Vec<Col<f64>>,
    /// `sum r'r`.
    pub f2: Vec<f64>,
    /// Number of frames.
    pub frames: usize,
}

impl SufficientStats {
    pub fn new(types: usize, params: usize) -> Self {
        Self {
            d2: (0..types).map(|_| Mat::zeros(params, params)).collect(),
            df: (0..types).map(|_| Col::zeros(params)).collect(),
            f2: vec![0f64; types],
            frames: 0,
        }
    }

    pub fn num_types(&self) -> usize {
        self.f2.len()
    }

    pub fn num_params(&self) -> usize {
        self.d2.first().map(|m| m.nrows()).unwrap_or(0)
    }

    pub(crate) fn merge(&mut self, other: &SufficientStats) {
        assert!(self.num_types() == other.num_types());
        for (d2, df, f2, other_d2, other_df, other_f2) in izip!(
            &mut self.d2,
            &mut self.df,
            &mut self.f2,
            &other.d2,
            &other.df,
            &other.f2
        ) {
            *d2 += other_d2;
            *df += other_df;
            *f2 += other_f2;
        }
        self.frames += other.frames;
    }

    /// Move the reference point by `shift`, i.e. the residuals become
    /// `r - D shift`.
    pub(crate) fn shift(&mut self, shift: &Col<f64>) {
        for t in 0..self.num_types() {
            self.f2[t] += quad_form(&self.d2[t], shift) - 2f64 * col_dot(&self.df[t], shift);
            self.df[t] -= &self.d2[t] * shift;
        }
    }

    /// `sum_t D2_t` restricted to the parameter range `range`.
    pub(crate) fn d2_block_total(&self, range: Range<usize>) -> Mat<f64> {
        let n = range.len();
        let mut total = Mat::<f64>::zeros(n, n);
        for d2 in &self.d2 {
            total += d2.submatrix(range.start, range.start, n, n);
        }
        total
    }
}

/// Raw data of one chunk, kept when nonlinear terms need to be re-fitted.
#[derive(Debug, Clone)]
pub(crate) struct CachedChunk {
    /// Non-dimensional forces.
    pub(crate) forces: Array3<f64>,
    /// Non-dimensional linear design, `frames x atoms x 3 x P`.
    pub(crate) design: Array4<f64>,
}

/// Fixed size ranges covering `0..len` plus one trailing partial range.
pub(crate) fn chunk_ranges(len: usize, chunk: usize) -> impl Iterator<Item = Range<usize>> {
    assert!(chunk > 0);
    (0..len.div_ceil(chunk)).map(move |i| (i * chunk)..((i + 1) * chunk).min(len))
}

/// Contract the parameter axis of a design block, giving forces.
pub(crate) fn contract(design: &Array4<f64>, theta: &Col<f64>) -> Result<Array3<f64>> {
    let (frames, atoms, dims, params) = design.dim();
    assert!(params == theta.nrows());
    let theta = Array1::from_iter(theta.iter().copied());
    let flat = design.to_shape((frames * atoms * dims, params))?;
    Ok(flat.dot(&theta).into_shape_with_order((frames, atoms, dims))?)
}

struct ChunkOutput {
    stats: SufficientStats,
    seeds: Vec<ArrayD<f64>>,
    cache: Option<CachedChunk>,
}

/// Collects sufficient statistics and, if nonlinear terms are registered,
/// the raw data needed to re-evaluate them.
#[derive(Debug)]
pub struct Accumulator {
    types: TypeIndex,
    /// Per atom `dt / sqrt(m kT)`.
    force_scale: Vec<f64>,
    /// Per atom `-dt sqrt(kT / m)`, turns energy derivatives into forces.
    design_scale: Vec<f64>,
    chunk_size: usize,
    params: usize,
    stats: SufficientStats,
    cache: Vec<CachedChunk>,
    nonlinear: BTreeMap<String, NonlinearTerm>,
}

impl Accumulator {
    pub fn new(types: TypeIndex, masses: &[f64], params: usize, dt: f64, kt: f64, chunk_size: usize) -> Self {
        assert!(masses.len() == types.num_atoms());
        let force_scale = masses.iter().map(|m| dt / (m * kt).sqrt()).collect();
        let design_scale = masses.iter().map(|m| -dt * (kt / m).sqrt()).collect();
        let stats = SufficientStats::new(types.num_types(), params);
        Self {
            types,
            force_scale,
            design_scale,
            chunk_size,
            params,
            stats,
            cache: Vec::new(),
            nonlinear: BTreeMap::new(),
        }
    }

    pub fn stats(&self) -> &SufficientStats {
        &self.stats
    }

    pub fn types(&self) -> &TypeIndex {
        &self.types
    }

    pub fn frames(&self) -> usize {
        self.stats.frames
    }

    pub(crate) fn force_scale(&self) -> &[f64] {
        &self.force_scale
    }

    pub fn nonlinear(&self) -> &BTreeMap<String, NonlinearTerm> {
        &self.nonlinear
    }

    pub(crate) fn nonlinear_mut(&mut self) -> &mut BTreeMap<String, NonlinearTerm> {
        &mut self.nonlinear
    }

    pub fn has_nonlinear(&self) -> bool {
        !self.nonlinear.is_empty()
    }

    pub(crate) fn add_nonlinear(&mut self, name: &str, term: NonlinearTerm) -> Result<()> {
        if self.stats.frames > 0 {
            return Err(FitError::State(
                "nonlinear terms must be added before any data".into(),
            ));
        }
        match TermId::parse(name) {
            TermId::Linear => Err(FitError::NameCollision(name.to_string())),
            TermId::Nonlinear(name) => {
                if self.nonlinear.contains_key(&name) {
                    return Err(FitError::NameCollision(name));
                }
                self.nonlinear.insert(name, term);
                Ok(())
            }
        }
    }

    /// Add frames to the statistics. `forces` are in trajectory units.
    pub(crate) fn append<T: Topology>(
        &mut self,
        topology: &T,
        positions: ArrayView3<'_, f64>,
        forces: ArrayView3<'_, f64>,
        theta0: &Col<f64>,
    ) -> Result<()> {
        if positions.shape() != forces.shape() {
            return Err(FitError::ShapeMismatch(format!(
                "positions have shape {:?} but forces have shape {:?}",
                positions.shape(),
                forces.shape()
            )));
        }
        let (frames, atoms, dims) = positions.dim();
        if dims != 3 {
            return Err(FitError::ShapeMismatch(format!(
                "last dimension must hold x, y, z, got {dims}"
            )));
        }
        if atoms != self.types.num_atoms() {
            return Err(FitError::ShapeMismatch(format!(
                "trajectory has {atoms} atoms but the topology has {}",
                self.types.num_atoms()
            )));
        }

        let mut scaled = forces.to_owned();
        scale_atoms(&mut scaled, &self.force_scale);

        let ranges: Vec<Range<usize>> = chunk_ranges(frames, self.chunk_size).collect();
        let outputs = ranges
            .par_iter()
            .map(|range| {
                self.process_chunk(
                    topology,
                    positions.slice(s![range.clone(), .., ..]),
                    scaled.slice(s![range.clone(), .., ..]),
                    theta0,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        // Folded in chunk order so the sums do not depend on scheduling.
        for output in outputs {
            self.stats.merge(&output.stats);
            for (term, seed) in self.nonlinear.values_mut().zip(output.seeds) {
                term.seeds.push(seed);
            }
            if let Some(cache) = output.cache {
                self.cache.push(cache);
            }
        }
        Ok(())
    }

    fn process_chunk<T: Topology>(
        &self,
        topology: &T,
        positions: ArrayView3<'_, f64>,
        forces: ArrayView3<'_, f64>,
        theta0: &Col<f64>,
    ) -> Result<ChunkOutput> {
        let (frames, atoms, _) = positions.dim();
        let params = self.params;

        let mut predicted = Array3::zeros((frames, atoms, 3));
        let mut seeds = Vec::with_capacity(self.nonlinear.len());
        for (name, term) in &self.nonlinear {
            let (seed, mut force) = term.seed_block(name, positions)?;
            scale_atoms(&mut force, &self.force_scale);
            predicted += &force;
            seeds.push(seed);
        }

        let Some(mut design) = topology.design(positions, 1).gradient else {
            return Err(FitError::Topology(
                "design did not return a position derivative".into(),
            ));
        };
        if design.shape() != &[frames, atoms, 3, params][..] {
            return Err(FitError::ShapeMismatch(format!(
                "design derivative has shape {:?}, expected {:?}",
                design.shape(),
                [frames, atoms, 3, params]
            )));
        }
        scale_atoms(&mut design, &self.design_scale);

        if theta0.iter().any(|&x| x != 0f64) {
            predicted += &contract(&design, theta0)?;
        }
        let residual = &forces - &predicted;

        let mut stats = SufficientStats::new(self.types.num_types(), params);
        self.accumulate(&mut stats, &design, &residual, true);
        stats.frames = frames;

        let cache = self.has_nonlinear().then(|| CachedChunk {
            forces: forces.to_owned(),
            design,
        });

        Ok(ChunkOutput {
            stats,
            seeds,
            cache,
        })
    }

    /// Add one chunk's contribution to `D2` (optionally), `DF` and `F2`.
    fn accumulate(
        &self,
        stats: &mut SufficientStats,
        design: &Array4<f64>,
        residual: &Array3<f64>,
        with_d2: bool,
    ) {
        let (frames, _, _, params) = design.dim();
        let rows = frames * 3;
        let mut f2_atoms = vec![0f64; self.types.num_atoms()];
        for (atom, ty) in self.types.iter() {
            let m = Mat::from_fn(rows, params, |row, k| design[[row / 3, atom, row % 3, k]]);
            let r = Col::from_fn(rows, |row| residual[[row / 3, atom, row % 3]]);
            if with_d2 {
                stats.d2[ty] += m.transpose() * &m;
            }
            stats.df[ty] += m.transpose() * &r;
            f2_atoms[atom] = col_dot(&r, &r);
        }
        for (total, part) in stats.f2.iter_mut().zip(self.types.reduce(&f2_atoms)) {
            *total += part;
        }
    }

    /// Re-evaluate `DF` and `F2` from the cached chunks, needed whenever
    /// `theta0` or a nonlinear coefficient changes.
    pub(crate) fn recompute_residuals(&mut self, theta0: &Col<f64>) -> Result<()> {
        if !self.has_nonlinear() {
            return Ok(());
        }
        let parts = (0..self.cache.len())
            .into_par_iter()
            .map(|chunk| {
                let residual = self.residual(chunk, theta0, None)?;
                let mut stats = SufficientStats::new(self.types.num_types(), self.params);
                self.accumulate(&mut stats, &self.cache[chunk].design, &residual, false);
                Ok(stats)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut total = SufficientStats::new(self.types.num_types(), self.params);
        for part in &parts {
            total.merge(part);
        }
        self.stats.df = total.df;
        self.stats.f2 = total.f2;
        Ok(())
    }

    /// Observed minus predicted force for a cached chunk, leaving out the
    /// nonlinear term `skip` if given.
    fn residual(&self, chunk: usize, theta: &Col<f64>, skip: Option<&str>) -> Result<Array3<f64>> {
        let cached = &self.cache[chunk];
        let mut predicted = contract(&cached.design, theta)?;
        for (name, term) in &self.nonlinear {
            if Some(name.as_str()) == skip {
                continue;
            }
            predicted += &term.scaled_force(&term.coefficients, chunk, &self.force_scale);
        }
        Ok(&cached.forces - &predicted)
    }

    /// Prediction of everything but term `name`, minus the observed
    /// forces, for every cached chunk.
    pub(crate) fn term_offsets(&self, name: &str, theta: &Col<f64>) -> Result<Vec<Array3<f64>>> {
        (0..self.cache.len())
            .map(|chunk| self.residual(chunk, theta, Some(name)).map(|r| -r))
            .collect()
    }

    /// Shift the reference point from `old` to `new`.
    pub(crate) fn recenter(&mut self, old: &Col<f64>, new: &Col<f64>) -> Result<()> {
        if self.has_nonlinear() {
            return self.recompute_residuals(new);
        }
        let shift = Col::from_fn(new.nrows(), |i| new[i] - old[i]);
        self.stats.shift(&shift);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn ranges_cover_everything_once() {
        let ranges: Vec<_> = chunk_ranges(250, 100).collect();
        assert_eq!(ranges, vec![0..100, 100..200, 200..250]);
        let ranges: Vec<_> = chunk_ranges(200, 100).collect();
        assert_eq!(ranges, vec![0..100, 100..200]);
        assert_eq!(chunk_ranges(0, 100).count(), 0);
    }

    proptest! {
        #[test]
        fn ranges_partition(len in 0usize..1000, chunk in 1usize..200) {
            let ranges: Vec<_> = chunk_ranges(len, chunk).collect();
            prop_assert_eq!(ranges.iter().map(|r| r.len()).sum::<usize>(), len);
            prop_assert!(ranges.iter().rev().skip(1).all(|r| r.len() == chunk));
        }
    }

    #[test]
    fn contract_matches_loops() {
        let design = Array4::from_shape_fn((2, 3, 3, 4), |(s, a, c, k)| {
            (s + 2 * a + 3 * c) as f64 - k as f64 * 0.5
        });
        let theta = Col::from_fn(4, |k| 1f64 + k as f64);
        let out = contract(&design, &theta).unwrap();
        for s in 0..2 {
            for a in 0..3 {
                for c in 0..3 {
                    let expected: f64 = (0..4).map(|k| design[[s, a, c, k]] * theta[k]).sum();
                    assert_abs_diff_eq!(out[[s, a, c]], expected, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn shift_matches_direct_residual() {
        // One type, explicit residual r and design D; shifting by d must
        // give the statistics of r - D d.
        let d = Mat::from_fn(5, 2, |i, j| (i as f64 - 2.) * (j as f64 + 1.) + 0.1 * j as f64);
        let r = Col::from_fn(5, |i| (i as f64).sin());
        let shift = Col::from_fn(2, |i| 0.3 - 0.7 * i as f64);

        let mut stats = SufficientStats::new(1, 2);
        stats.d2[0] = d.transpose() * &d;
        stats.df[0] = d.transpose() * &r;
        stats.f2[0] = col_dot(&r, &r);
        stats.shift(&shift);

        let d_shift = &d * &shift;
        let moved = &r - &d_shift;
        let df = d.transpose() * &moved;
        assert_abs_diff_eq!(stats.f2[0], col_dot(&moved, &moved), epsilon = 1e-12);
        assert_abs_diff_eq!(stats.df[0][0], df[0], epsilon = 1e-12);
        assert_abs_diff_eq!(stats.df[0][1], df[1], epsilon = 1e-12);
    }
}
