use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use miya_types::ModelSpec;

/// Label used in error text for the platform's own default model.
pub const DEFAULT_MODEL_LABEL: &str = "default-model";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub candidate: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackSuccess {
    /// `None` when the platform default model answered.
    pub model: Option<ModelSpec>,
    pub attempts: usize,
    pub failures: Vec<AttemptFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackError {
    pub failures: Vec<AttemptFailure>,
    pub budget: Duration,
    pub budget_elapsed: bool,
}

impl FallbackError {
    pub fn attempts(&self) -> usize {
        self.failures.len()
    }
}

impl fmt::Display for FallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "All fallback models failed.")?;
        for (idx, failure) in self.failures.iter().enumerate() {
            let sep = if idx == 0 { " " } else { " | " };
            write!(f, "{sep}{}: {}", failure.candidate, failure.reason)?;
        }
        if self.budget_elapsed {
            write!(
                f,
                " (fallback budget of {}ms elapsed)",
                self.budget.as_millis()
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for FallbackError {}

/// Walks a model chain until one prompt is accepted, all within one overall
/// time budget.
#[derive(Debug, Clone, Copy)]
pub struct FallbackExecutor {
    budget: Duration,
}

impl FallbackExecutor {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Runs `attempt` once per candidate. An empty chain means a single
    /// attempt with no model override. Malformed references count as a
    /// failed attempt without calling `attempt`. An attempt that times out
    /// has spent the shared budget, so a hung model ends the walk instead of
    /// failing over to later candidates.
    pub async fn run<F, Fut>(
        &self,
        candidates: &[String],
        mut attempt: F,
    ) -> Result<FallbackSuccess, FallbackError>
    where
        F: FnMut(Option<ModelSpec>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let started = Instant::now();
        let chain: Vec<Option<&str>> = if candidates.is_empty() {
            vec![None]
        } else {
            candidates.iter().map(|c| Some(c.as_str())).collect()
        };
        let mut failures = Vec::new();
        let mut budget_elapsed = false;

        for candidate in chain {
            let elapsed = started.elapsed();
            if elapsed >= self.budget {
                budget_elapsed = true;
                break;
            }
            let label = candidate.unwrap_or(DEFAULT_MODEL_LABEL).to_string();
            let model = match candidate {
                None => None,
                Some(reference) => match ModelSpec::parse(reference) {
                    Some(model) => Some(model),
                    None => {
                        tracing::debug!(candidate = %label, "skipping malformed fallback model");
                        failures.push(AttemptFailure {
                            candidate: label,
                            reason: "Invalid fallback model format".to_string(),
                        });
                        continue;
                    }
                },
            };

            let remaining = self.budget - elapsed;
            match tokio::time::timeout(remaining, attempt(model.clone())).await {
                Ok(Ok(())) => {
                    return Ok(FallbackSuccess {
                        model,
                        attempts: failures.len() + 1,
                        failures,
                    });
                }
                Ok(Err(err)) => {
                    tracing::debug!(candidate = %label, error = %format!("{err:#}"), "fallback attempt failed");
                    failures.push(AttemptFailure {
                        candidate: label,
                        reason: format!("{err:#}"),
                    });
                }
                Err(_) => {
                    tracing::debug!(candidate = %label, "fallback attempt timed out");
                    failures.push(AttemptFailure {
                        candidate: label,
                        reason: format!("timed out after {}ms", remaining.as_millis()),
                    });
                    budget_elapsed = true;
                    break;
                }
            }
        }

        Err(FallbackError {
            failures,
            budget: self.budget,
            budget_elapsed,
        })
    }
}
