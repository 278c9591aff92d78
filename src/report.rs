//! Text reports of a fit.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::estimator::ForceMatch;
use crate::topology::Topology;

/// One line of `v.out`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeVariance {
    pub label: String,
    /// Estimated noise variance `1/z`.
    pub v: f64,
    /// Sample mean of `1/z`.
    pub mean_v: f64,
    pub sd_v: f64,
    /// Mean squared residual force.
    pub resid2: f64,
}

fn write_variances<W: Write>(out: &mut W, rows: &[TypeVariance]) -> std::io::Result<()> {
    writeln!(out, "#type\tv\t<v>\tsigma_v\tresid2")?;
    for row in rows {
        writeln!(
            out,
            "{}\t{:e}\t{:e}\t{:e}\t{:e}",
            row.label, row.v, row.mean_v, row.sd_v, row.resid2
        )?;
    }
    Ok(())
}

fn write_uncertainties<W: Write>(out: &mut W, rows: &[(String, f64)]) -> std::io::Result<()> {
    writeln!(out, "#type\t<stdev>")?;
    for (name, stdev) in rows {
        writeln!(out, "{name:<16} {stdev:e}")?;
    }
    Ok(())
}

fn write_file<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let file =
        File::create(path).with_context(|| format!("Failed to create report file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    write(&mut writer).with_context(|| format!("Failed to write report: {:?}", path))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush report: {:?}", path))?;
    Ok(())
}

impl<T: Topology> ForceMatch<T> {
    /// Per type noise summary. Uses the posterior averages if sampling ran.
    pub fn type_variances(&self) -> Vec<TypeVariance> {
        let resid2 = self.noise_posterior().residual_variance(self.settings.e0);
        self.types()
            .labels()
            .iter()
            .enumerate()
            .map(|(t, label)| {
                let v = 1f64 / self.z[t];
                match &self.posterior {
                    Some(post) => TypeVariance {
                        label: label.clone(),
                        v,
                        mean_v: post.mean_inverse_z[t],
                        sd_v: post.sd_inverse_z[t],
                        resid2: post.resid2[t],
                    },
                    None => TypeVariance {
                        label: label.clone(),
                        v,
                        mean_v: v,
                        sd_v: 0f64,
                        resid2: resid2[t],
                    },
                }
            })
            .collect()
    }

    /// Standard deviation of the predicted force for every prior term.
    pub fn term_uncertainties(&self) -> Vec<(String, f64)> {
        let names = self.topology.term_names();
        self.topology
            .priors()
            .iter()
            .zip(&self.df2)
            .map(|(prior, df2)| (names[prior.term].clone(), df2.max(0f64).sqrt()))
            .collect()
    }

    /// Write the fitted coefficients (in units of the force field), `v.out`
    /// and `df.out` into `dir`.
    pub fn write_out(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {:?}", dir))?;

        let kt = self.settings.kt;
        let coefficients: Vec<f64> = self.fitted_parameters().iter().map(|c| c * kt).collect();
        self.topology
            .write_coefficients(dir, &coefficients)
            .context("Failed to write force field coefficients")?;

        let variances = self.type_variances();
        write_file(&dir.join("v.out"), |out| write_variances(out, &variances))?;
        let uncertainties = self.term_uncertainties();
        write_file(&dir.join("df.out"), |out| {
            write_uncertainties(out, &uncertainties)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn variance_table() {
        let rows = vec![TypeVariance {
            label: "CA".into(),
            v: 0.5,
            mean_v: 0.25,
            sd_v: 0.125,
            resid2: 2.,
        }];
        let mut out = Vec::new();
        write_variances(&mut out, &rows).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "#type\tv\t<v>\tsigma_v\tresid2\nCA\t5e-1\t2.5e-1\t1.25e-1\t2e0\n"
        );
    }

    #[test]
    fn uncertainty_table() {
        let mut out = Vec::new();
        write_uncertainties(&mut out, &[("pair".into(), 0.01)]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["#type\t<stdev>", "pair             1e-2"]);
    }
}
