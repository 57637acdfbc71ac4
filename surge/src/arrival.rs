//! Inter-arrival time generation for open-loop load.
//!
//! Arrivals of a Poisson process with rate λ are separated by exponentially
//! distributed gaps with mean `1/λ`. The uniform shape draws gaps on
//! `[0, 2/λ)` instead: same mean, different variance, so two runs at the same
//! offered rate can be compared on variance alone.
//!
//! The process is re-parameterized in place at interval boundaries. The
//! underlying generator is never reseeded, so a seeded run reproduces the
//! exact same gap sequence across every interval of the plan.
use std::time::Duration;

use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Exp, Uniform};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ArrivalError {
    #[error("arrival rate must be a finite, non-negative number, got {0}")]
    InvalidRate(f64),
}

/// Shape of the inter-arrival distribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shape {
    Exponential,
    Uniform,
}

#[derive(Debug, Clone)]
enum Sampler {
    /// Rate of zero: no arrivals until the next re-parameterization.
    Idle,
    Exponential(Exp<f64>),
    Uniform(Uniform<f64>),
}

impl Sampler {
    fn new(shape: Shape, rate: f64) -> Result<Self, ArrivalError> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(ArrivalError::InvalidRate(rate));
        }
        if rate == 0.0 {
            return Ok(Sampler::Idle);
        }
        match shape {
            Shape::Exponential => Exp::new(rate)
                .map(Sampler::Exponential)
                .map_err(|_| ArrivalError::InvalidRate(rate)),
            Shape::Uniform => {
                let upper = 2.0 / rate;
                // `Uniform::new` panics on an empty or non-finite range
                if !upper.is_finite() {
                    return Err(ArrivalError::InvalidRate(rate));
                }
                Ok(Sampler::Uniform(Uniform::new(0.0, upper)))
            }
        }
    }
}

/// Stateful inter-arrival generator.
///
/// Owned and driven by the dispatcher alone; it is not shared.
#[derive(Debug, Clone)]
pub struct ArrivalProcess {
    shape: Shape,
    rate: f64,
    sampler: Sampler,
    rng: StdRng,
}

impl ArrivalProcess {
    /// Creates a process with the given shape and initial rate (arrivals per
    /// second). `seed = None` draws the generator seed from OS entropy.
    pub fn new(shape: Shape, rate: f64, seed: Option<u64>) -> Result<Self, ArrivalError> {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            shape,
            rate,
            sampler: Sampler::new(shape, rate)?,
            rng,
        })
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Switches to a new rate, keeping the generator state.
    pub fn reparameterize(&mut self, rate: f64) -> Result<(), ArrivalError> {
        self.sampler = Sampler::new(self.shape, rate)?;
        self.rate = rate;
        Ok(())
    }

    /// Draws the next gap in seconds, or `None` when the rate is zero.
    pub fn draw(&mut self) -> Option<f64> {
        match &self.sampler {
            Sampler::Idle => None,
            Sampler::Exponential(exp) => Some(exp.sample(&mut self.rng)),
            Sampler::Uniform(uniform) => Some(uniform.sample(&mut self.rng)),
        }
    }

    /// Like [`draw`](Self::draw), as a [`Duration`]. Gaps too large to
    /// represent are treated as "never".
    pub fn draw_duration(&mut self) -> Option<Duration> {
        self.draw()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}
