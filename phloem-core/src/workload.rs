//! Random processes driving inter-arrival gaps, payload values and injected
//! service times.
//!
//! A process is described by a textual tag such as `exp:100` or
//! `gev:30.8:8.2:0.08`. Values are in microseconds when the process feeds the
//! scheduler. The Facebook workload presets from the ETC study are available
//! as `fb_key`, `fb_ia` and `fb_val`.

use anyhow::{bail, Context};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution as _, Gamma as GammaDist, Normal};

use crate::{Error, Result};

fn rng_from_seed(seed: Option<u64>) -> SmallRng {
    match seed {
        Some(s) => SmallRng::seed_from_u64(s),
        None => SmallRng::from_os_rng(),
    }
}

/// A sampled random process.
///
/// Inverse-CDF variants own their uniform source; `rand_distr` supplies the
/// direct samplers for log-normal and gamma.
#[derive(Debug, Clone)]
pub enum RandomProcess {
    Fixed {
        value: f64,
    },
    Exponential {
        lambda: f64,
        rng: SmallRng,
    },
    GeneralizedPareto {
        loc: f64,
        scale: f64,
        shape: f64,
        rng: SmallRng,
    },
    Gev {
        loc: f64,
        scale: f64,
        shape: f64,
        rng: SmallRng,
    },
    Bimodal {
        low: f64,
        up: f64,
        prob: f64,
        rng: SmallRng,
    },
    LogNormal {
        normal: Normal<f64>,
        rng: SmallRng,
    },
    Gamma {
        gamma: GammaDist<f64>,
        rng: SmallRng,
    },
}

impl RandomProcess {
    pub fn fixed(value: f64) -> anyhow::Result<Self> {
        if value < 0.0 {
            bail!("fixed value must be non-negative, got {}", value);
        }
        Ok(RandomProcess::Fixed { value })
    }

    /// Exponential process with the given average (not rate).
    pub fn exponential(avg: f64, seed: Option<u64>) -> anyhow::Result<Self> {
        if avg <= 0.0 {
            bail!("exponential average must be positive, got {}", avg);
        }
        Ok(RandomProcess::Exponential { lambda: 1.0 / avg, rng: rng_from_seed(seed) })
    }

    pub fn generalized_pareto(
        loc: f64,
        scale: f64,
        shape: f64,
        seed: Option<u64>,
    ) -> anyhow::Result<Self> {
        if scale <= 0.0 {
            bail!("pareto scale must be positive, got {}", scale);
        }
        if shape == 0.0 || shape >= 1.0 {
            bail!("pareto shape must be in (0, 1) or negative, got {}", shape);
        }
        Ok(RandomProcess::GeneralizedPareto { loc, scale, shape, rng: rng_from_seed(seed) })
    }

    pub fn gev(loc: f64, scale: f64, shape: f64, seed: Option<u64>) -> anyhow::Result<Self> {
        if scale <= 0.0 {
            bail!("gev scale must be positive, got {}", scale);
        }
        if shape == 0.0 {
            bail!("gev shape must be non-zero");
        }
        Ok(RandomProcess::Gev { loc, scale, shape, rng: rng_from_seed(seed) })
    }

    pub fn bimodal(low: f64, up: f64, prob: f64, seed: Option<u64>) -> anyhow::Result<Self> {
        if !(0.0..=1.0).contains(&prob) {
            bail!("bimodal probability must be in [0, 1], got {}", prob);
        }
        if low > up {
            bail!("bimodal low mode {} exceeds up mode {}", low, up);
        }
        Ok(RandomProcess::Bimodal { low, up, prob, rng: rng_from_seed(seed) })
    }

    pub fn log_normal(mu: f64, sigma: f64, seed: Option<u64>) -> anyhow::Result<Self> {
        let normal = Normal::new(mu, sigma)
            .map_err(|e| anyhow::anyhow!("invalid log-normal parameters: {}", e))?;
        Ok(RandomProcess::LogNormal { normal, rng: rng_from_seed(seed) })
    }

    pub fn gamma(shape: f64, scale: f64, seed: Option<u64>) -> anyhow::Result<Self> {
        let gamma = GammaDist::new(shape, scale)
            .map_err(|e| anyhow::anyhow!("invalid gamma parameters: {}", e))?;
        Ok(RandomProcess::Gamma { gamma, rng: rng_from_seed(seed) })
    }

    /// Parse a textual process descriptor, e.g. `exp:100` or
    /// `bimodal:10:1000:0.9`. The `fb_key`/`fb_ia`/`fb_val` presets expand to
    /// their published parameterizations.
    pub fn parse(descriptor: &str, seed: Option<u64>) -> anyhow::Result<Self> {
        match descriptor {
            "fb_key" => return Self::parse("gev:30.7984:8.20449:0.078688", seed),
            "fb_ia" => return Self::parse("gpar:0:16.0292:0.154971", seed),
            "fb_val" => return Self::parse("gpar:15.0:214.476:0.348238", seed),
            _ => {}
        }

        let mut parts = descriptor.split(':');
        let kind = parts.next().unwrap_or("");
        let params: Vec<f64> = parts
            .map(|p| {
                p.parse::<f64>()
                    .with_context(|| format!("bad parameter '{}' in '{}'", p, descriptor))
            })
            .collect::<anyhow::Result<_>>()?;

        let expect = |n: usize| -> anyhow::Result<()> {
            if params.len() != n {
                bail!("'{}' expects {} parameters, got {}", kind, n, params.len());
            }
            Ok(())
        };

        match kind {
            "fixed" => {
                expect(1)?;
                Self::fixed(params[0])
            }
            "exp" => {
                expect(1)?;
                Self::exponential(params[0], seed)
            }
            "pareto" | "gpar" => {
                expect(3)?;
                Self::generalized_pareto(params[0], params[1], params[2], seed)
            }
            "gev" => {
                expect(3)?;
                Self::gev(params[0], params[1], params[2], seed)
            }
            "bimodal" => {
                expect(3)?;
                Self::bimodal(params[0], params[1], params[2], seed)
            }
            "lognorm" => {
                expect(2)?;
                Self::log_normal(params[0], params[1], seed)
            }
            "gamma" => {
                expect(2)?;
                Self::gamma(params[0], params[1], seed)
            }
            other => bail!("unknown random process '{}'", other),
        }
    }

    /// Draw the next value.
    pub fn sample(&mut self) -> f64 {
        match self {
            RandomProcess::Fixed { value } => *value,
            RandomProcess::Exponential { lambda, rng } => {
                let y = uniform_open(rng);
                -y.ln() / *lambda
            }
            RandomProcess::GeneralizedPareto { loc, scale, shape, rng } => {
                let y = uniform_open(rng);
                *loc + *scale * ((1.0 - y).powf(-*shape) - 1.0) / *shape
            }
            RandomProcess::Gev { loc, scale, shape, rng } => {
                let y = uniform_open(rng);
                *loc + *scale * ((-y.ln()).powf(-*shape) - 1.0) / *shape
            }
            RandomProcess::Bimodal { low, up, prob, rng } => {
                let y = uniform_open(rng);
                if y <= *prob {
                    *low
                } else {
                    *up
                }
            }
            RandomProcess::LogNormal { normal, rng } => normal.sample(rng).exp(),
            RandomProcess::Gamma { gamma, rng } => gamma.sample(rng),
        }
    }

    /// Re-target the process at a new average, used when the offered load
    /// changes. Only the variants with a closed-form mean adjustment support
    /// this; the rest reject the call.
    pub fn set_avg(&mut self, avg: f64) -> Result<()> {
        if avg <= 0.0 {
            return Err(Error::Config(format!("average must be positive, got {}", avg)));
        }
        match self {
            RandomProcess::Fixed { value } => {
                *value = avg;
                Ok(())
            }
            RandomProcess::Exponential { lambda, .. } => {
                *lambda = 1.0 / avg;
                Ok(())
            }
            RandomProcess::GeneralizedPareto { loc, scale, shape, .. } => {
                // mean = loc + scale / (1 - shape), solved for scale
                if avg <= *loc {
                    return Err(Error::Config(format!(
                        "average {} must exceed pareto location {}",
                        avg, loc
                    )));
                }
                *scale = (avg - *loc) * (1.0 - *shape);
                Ok(())
            }
            other => Err(Error::Config(format!(
                "random process '{}' cannot be re-targeted at an average",
                other.name()
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RandomProcess::Fixed { .. } => "fixed",
            RandomProcess::Exponential { .. } => "exp",
            RandomProcess::GeneralizedPareto { .. } => "gpar",
            RandomProcess::Gev { .. } => "gev",
            RandomProcess::Bimodal { .. } => "bimodal",
            RandomProcess::LogNormal { .. } => "lognorm",
            RandomProcess::Gamma { .. } => "gamma",
        }
    }
}

/// Uniform draw on the open interval (0, 1). The inverse CDFs take logs of
/// both `y` and `1 - y`, so the endpoints are excluded.
fn uniform_open(rng: &mut SmallRng) -> f64 {
    loop {
        let y = rng.random::<f64>();
        if y > 0.0 && y < 1.0 {
            return y;
        }
    }
}
