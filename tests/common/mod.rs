#![allow(dead_code)]

use std::fs;
use std::path::Path;

use anyhow::Context;
use faer::Mat;
use forcesolve::{Design, NonlinearForce, PriorBlock, Structure, Topology};
use ndarray::{s, Array2, Array3, Array4, ArrayD, ArrayView3, Ix2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

/// Independent harmonic springs along the first `axes` coordinate axes,
/// `E_k = sum_a x_ak² / 2`.
pub struct Springs {
    pub axes: usize,
    pub bounds: Vec<usize>,
    pub priors: Vec<PriorBlock>,
    pub ranks: Vec<usize>,
    pub equality: Option<Mat<f64>>,
    pub inequality: Option<Mat<f64>>,
}

impl Springs {
    pub fn new(axes: usize) -> Self {
        Self {
            axes,
            bounds: vec![0, axes],
            priors: Vec::new(),
            ranks: Vec::new(),
            equality: None,
            inequality: None,
        }
    }

    pub fn with_prior(mut self) -> Self {
        self.priors = vec![PriorBlock {
            term: 0,
            precision: Mat::identity(self.axes, self.axes),
        }];
        self.ranks = vec![self.axes];
        self
    }
}

impl Topology for Springs {
    fn num_params(&self) -> usize {
        self.axes
    }

    fn term_bounds(&self) -> &[usize] {
        &self.bounds
    }

    fn term_names(&self) -> Vec<String> {
        vec!["spring".to_string()]
    }

    fn design(&self, positions: ArrayView3<'_, f64>, order: usize) -> Design {
        let (frames, atoms, _) = positions.dim();
        let energy = Array2::from_shape_fn((frames, self.axes), |(f, k)| {
            positions
                .slice(s![f, .., k])
                .iter()
                .map(|x| 0.5 * x * x)
                .sum()
        });
        let gradient = (order >= 1).then(|| {
            Array4::from_shape_fn((frames, atoms, 3, self.axes), |(f, a, c, k)| {
                if c == k {
                    positions[[f, a, c]]
                } else {
                    0f64
                }
            })
        });
        Design { energy, gradient }
    }

    fn priors(&self) -> &[PriorBlock] {
        &self.priors
    }

    fn prior_ranks(&self) -> &[usize] {
        &self.ranks
    }

    fn equality_constraints(&self) -> Option<Mat<f64>> {
        self.equality.clone()
    }

    fn inequality_constraints(&self) -> Option<Mat<f64>> {
        self.inequality.clone()
    }

    fn write_coefficients(&self, dir: &Path, coefficients: &[f64]) -> anyhow::Result<()> {
        let text: String = coefficients.iter().map(|c| format!("{c:e}\n")).collect();
        fs::write(dir.join("springs.dat"), text).context("Failed to write springs.dat")
    }
}

pub struct Atoms {
    pub labels: Vec<String>,
    pub masses: Vec<f64>,
}

impl Atoms {
    pub fn new(labels: &[&str], masses: &[f64]) -> Self {
        assert_eq!(labels.len(), masses.len());
        Self {
            labels: labels.iter().map(|l| l.to_string()).collect(),
            masses: masses.to_vec(),
        }
    }

    pub fn uniform(n: usize) -> Self {
        Self {
            labels: vec!["A".to_string(); n],
            masses: vec![1f64; n],
        }
    }
}

impl Structure for Atoms {
    fn num_atoms(&self) -> usize {
        self.labels.len()
    }

    fn type_label(&self, atom: usize) -> &str {
        &self.labels[atom]
    }

    fn mass(&self, atom: usize) -> f64 {
        self.masses[atom]
    }
}

/// Random positions with forces `force(axis, x)` acting on every
/// coordinate, plus Gaussian noise.
pub fn trajectory<F>(frames: usize, atoms: usize, noise: f64, seed: u64, force: F) -> (Array3<f64>, Array3<f64>)
where
    F: Fn(usize, f64) -> f64,
{
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let positions = Array3::from_shape_fn((frames, atoms, 3), |_| rng.sample::<f64, _>(StandardNormal));
    let forces = Array3::from_shape_fn((frames, atoms, 3), |(f, a, c)| {
        force(c, positions[[f, a, c]]) + noise * rng.sample::<f64, _>(StandardNormal)
    });
    (positions, forces)
}

/// Spring forces `-k_c x_c`, zero along axes without a constant.
pub fn springs(k: &[f64]) -> impl Fn(usize, f64) -> f64 + '_ {
    move |axis, x| -k.get(axis).copied().unwrap_or(0f64) * x
}

/// Saturating force `-c0 tanh(c1 x)` along a single axis.
pub struct TanhAxis {
    pub axis: usize,
}

impl NonlinearForce for TanhAxis {
    fn seed(&self, positions: ArrayView3<'_, f64>) -> ArrayD<f64> {
        positions.slice(s![.., .., self.axis]).to_owned().into_dyn()
    }

    fn force(&self, coefficients: &[f64], seed: &ArrayD<f64>) -> Array3<f64> {
        let x = seed.view().into_dimensionality::<Ix2>().expect("2d seed");
        let (frames, atoms) = x.dim();
        Array3::from_shape_fn((frames, atoms, 3), |(f, a, c)| {
            if c == self.axis {
                -coefficients[0] * (coefficients[1] * x[[f, a]]).tanh()
            } else {
                0f64
            }
        })
    }

    fn jacobian(&self, coefficients: &[f64], seed: &ArrayD<f64>) -> Array4<f64> {
        let x = seed.view().into_dimensionality::<Ix2>().expect("2d seed");
        let (frames, atoms) = x.dim();
        Array4::from_shape_fn((frames, atoms, 3, 2), |(f, a, c, k)| {
            if c != self.axis {
                return 0f64;
            }
            let t = (coefficients[1] * x[[f, a]]).tanh();
            match k {
                0 => -t,
                _ => -coefficients[0] * x[[f, a]] * (1f64 - t * t),
            }
        })
    }
}
