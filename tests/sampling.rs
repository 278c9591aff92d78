mod common;

use std::fs;

use approx::assert_abs_diff_eq;
use common::{springs, trajectory, Atoms, Springs};
use faer::{Col, Mat};
use forcesolve::{Diagnostic, FitSettings, ForceMatch, Phase, SampleSettings, SolveStrategy};
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const TRUTH: [f64; 3] = [1.5, 0.5, 2.0];

fn fitted(topology: Springs, settings: FitSettings, noise: f64) -> ForceMatch<Springs> {
    let atoms = Atoms::new(&["A", "B", "A"], &[1.0, 4.0, 1.0]);
    let (x, f) = trajectory(200, 3, noise, 61, springs(&TRUTH));
    let mut fit =
        ForceMatch::new(topology, &atoms, settings, SolveStrategy::NullSpaceProjection).unwrap();
    fit.append(x.view(), f.view()).unwrap();
    fit.maximize().unwrap();
    fit
}

#[test]
fn posterior_sampling() {
    let mut fit = fitted(Springs::new(3).with_prior(), FitSettings::default(), 0.1);
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("alpha.dat");
    let settings = SampleSettings {
        draws: 40,
        burn_in: 5,
        thin: 2,
        alpha_trace: Some(trace.clone()),
        ..SampleSettings::default()
    };
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let report = fit.sample(&settings, &mut rng).unwrap();
    assert_eq!(report.draws, 40);
    assert_eq!(report.rejected, 0);
    assert_eq!(fit.phase(), Phase::Converged);

    let text = fs::read_to_string(&trace).unwrap();
    let rows: Vec<&str> = text.lines().collect();
    assert_eq!(rows.len(), 80);
    assert!(rows.iter().all(|row| row.trim().parse::<f64>().unwrap() > 0.0));

    let summary = fit.posterior().unwrap();
    assert_eq!(summary.draws, 40);
    // Heavy atoms see smaller non-dimensional noise.
    assert_abs_diff_eq!(summary.variance[0], 0.01, epsilon = 0.002);
    assert_abs_diff_eq!(summary.variance[1], 0.0025, epsilon = 0.0007);
    for t in 0..2 {
        assert!(summary.sd_inverse_z[t] > 0.0);
        assert_abs_diff_eq!(fit.z()[t], 1.0 / summary.variance[t], epsilon = 1e-9 * fit.z()[t]);
    }

    let params = fit.fitted_parameters();
    for (p, truth) in params.iter().zip(TRUTH) {
        assert_abs_diff_eq!(*p, truth, epsilon = 0.05);
    }
}

#[test]
fn draws_match_conditional_covariance() {
    let fit = fitted(Springs::new(3), FitSettings::default(), 0.1);
    let stats = fit.theta_stats().unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let n = 5000;
    let draws: Vec<Col<f64>> = (0..n).map(|_| fit.draw_theta(&mut rng).unwrap()).collect();
    let mean: Vec<f64> = (0..3)
        .map(|i| draws.iter().map(|d| d[i]).sum::<f64>() / n as f64)
        .collect();
    let cov = Mat::from_fn(3, 3, |i, j| {
        draws
            .iter()
            .map(|d| (d[i] - mean[i]) * (d[j] - mean[j]))
            .sum::<f64>()
            / n as f64
    });
    for i in 0..3 {
        let expected = stats.covariance[(i, i)];
        assert_abs_diff_eq!(cov[(i, i)], expected, epsilon = 0.1 * expected);
        let sd = expected.sqrt();
        assert_abs_diff_eq!(mean[i], stats.mean[i], epsilon = 0.1 * sd);
    }
}

#[test]
fn infeasible_draws_keep_the_previous_state() {
    let mut topology = Springs::new(3);
    // The data clearly prefer a positive first constant.
    topology.inequality = Some(Mat::from_fn(1, 3, |_, j| if j == 0 { -1.0 } else { 0.0 }));
    let mut fit = fitted(topology, FitSettings::default(), 0.1);
    let settings = SampleSettings {
        draws: 3,
        burn_in: 1,
        thin: 2,
        max_redraws: 5,
        alpha_trace: None,
    };
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let report = fit.sample(&settings, &mut rng).unwrap();
    assert_eq!(report.rejected, 8);
    // One draw plus five redraws of the noise.
    assert!(matches!(
        report.diagnostics.last(),
        Some(Diagnostic::SamplingRejection { tries: 6, .. })
    ));
}

#[test]
fn zero_redraws_still_draw_once() {
    let mut topology = Springs::new(3);
    topology.inequality = Some(Mat::from_fn(1, 3, |_, j| if j == 0 { -1.0 } else { 0.0 }));
    let mut fit = fitted(topology, FitSettings::default(), 0.1);
    let settings = SampleSettings {
        draws: 2,
        burn_in: 0,
        thin: 1,
        max_redraws: 0,
        alpha_trace: None,
    };
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let report = fit.sample(&settings, &mut rng).unwrap();
    assert_eq!(report.rejected, 2);
    assert!(report
        .diagnostics
        .iter()
        .all(|d| matches!(d, Diagnostic::SamplingRejection { tries: 1, .. })));
}

#[test]
fn sampling_needs_data() {
    let atoms = Atoms::uniform(2);
    let mut fit = ForceMatch::new(
        Springs::new(3),
        &atoms,
        FitSettings::default(),
        SolveStrategy::NullSpaceProjection,
    )
    .unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    assert!(fit.sample(&SampleSettings::default(), &mut rng).is_err());
    assert_eq!(fit.phase(), Phase::Empty);
}

#[test]
fn reports_are_written() {
    let settings = FitSettings {
        kt: 2.0,
        ..FitSettings::default()
    };
    let fit = fitted(Springs::new(3).with_prior(), settings, 0.0);
    let dir = tempfile::tempdir().unwrap();
    fit.write_out(dir.path()).unwrap();

    let coefficients: Vec<f64> = fs::read_to_string(dir.path().join("springs.dat"))
        .unwrap()
        .lines()
        .map(|l| l.parse().unwrap())
        .collect();
    assert_eq!(coefficients.len(), 3);
    for (c, truth) in coefficients.iter().zip(TRUTH) {
        assert_abs_diff_eq!(*c, truth, epsilon = 1e-6);
    }

    let v = fs::read_to_string(dir.path().join("v.out")).unwrap();
    let lines: Vec<&str> = v.lines().collect();
    assert_eq!(lines[0], "#type\tv\t<v>\tsigma_v\tresid2");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("A\t"));
    assert!(lines[2].starts_with("B\t"));

    let df = fs::read_to_string(dir.path().join("df.out")).unwrap();
    let lines: Vec<&str> = df.lines().collect();
    assert_eq!(lines[0], "#type\t<stdev>");
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("spring "));
}
