use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// Stable identifier of a job across all runs
pub type JobId = u32;

/// One concrete assignment of all parameters of a job, ordered by parameter name
pub type ParameterSet = BTreeMap<String, ParameterValue>;

/// Upper bound for a single job grid, anything above is almost certainly a typo in a range
pub const MAX_GRID_SIZE: usize = 1_000_000;

#[derive(Error, Debug)]
pub enum CatalogueError {
    #[error("Failed to read catalogue {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Catalogue is not a valid document: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Job id {0} is defined more than once")]
    DuplicateId(JobId),
    #[error("Job {0} has an empty label")]
    EmptyLabel(JobId),
    #[error("Job {job} parameter '{name}' is invalid: {reason}")]
    InvalidParameter {
        job: JobId,
        name: String,
        reason: String,
    },
    #[error("Job {job} expands to {size} parameter sets, above the grid size limit")]
    GridTooLarge { job: JobId, size: usize },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RangeSpec {
    pub start: f64,
    /// inclusive upper bound
    pub stop: f64,
    pub step: f64,
}

/// Values a single parameter takes, exactly one of the fields must be set
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ParameterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ParameterValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ParameterValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<RangeSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobDefinition {
    pub id: JobId,
    pub label: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct CatalogueDocument {
    jobs: Vec<JobDefinition>,
}

/// A single indicator backtest with its fully expanded parameter grid
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub label: String,
    pub parameter_grid: Vec<ParameterSet>,
}

impl Job {
    pub fn new(id: JobId, label: impl Into<String>, parameter_grid: Vec<ParameterSet>) -> Self {
        Self {
            id,
            label: label.into(),
            parameter_grid,
        }
    }
}

impl RangeSpec {
    fn expand(&self, job: JobId, name: &str) -> Result<Vec<ParameterValue>, CatalogueError> {
        let invalid = |reason: &str| CatalogueError::InvalidParameter {
            job,
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if !(self.start.is_finite() && self.stop.is_finite() && self.step.is_finite()) {
            return Err(invalid("range bounds must be finite"));
        }
        if self.step <= 0.0 {
            return Err(invalid("range step must be positive"));
        }
        if self.start > self.stop {
            return Err(invalid("range start is above stop"));
        }

        // tolerate float noise on the inclusive upper bound, huge spans saturate into the limit check
        let span = ((self.stop - self.start) / self.step + 1e-9).floor();
        let steps = (span as usize).saturating_add(1);
        if steps > MAX_GRID_SIZE {
            return Err(CatalogueError::GridTooLarge { job, size: steps });
        }

        let integral = [self.start, self.step].iter().all(|value| value.fract() == 0.0);

        Ok((0..steps)
            .map(|index| self.start + self.step * index as f64)
            .map(|value| {
                if integral {
                    ParameterValue::Int(value as i64)
                } else {
                    ParameterValue::Float(value)
                }
            })
            .collect())
    }
}

impl ParameterSpec {
    /// all values of this parameter in declaration order
    pub fn expand(&self, job: JobId, name: &str) -> Result<Vec<ParameterValue>, CatalogueError> {
        let invalid = |reason: &str| CatalogueError::InvalidParameter {
            job,
            name: name.to_string(),
            reason: reason.to_string(),
        };

        match (&self.values, &self.value, &self.range) {
            (Some(values), None, None) => {
                if values.is_empty() {
                    Err(invalid("values must not be empty"))
                } else {
                    Ok(values.clone())
                }
            }
            (None, Some(value), None) => Ok(vec![value.clone()]),
            (None, None, Some(range)) => range.expand(job, name),
            (None, None, None) => Err(invalid("one of values, value or range is required")),
            _ => Err(invalid("only one of values, value or range may be set")),
        }
    }
}

impl JobDefinition {
    /// validate the definition and expand its parameter grid
    pub fn build(self) -> Result<Job, CatalogueError> {
        if self.label.trim().is_empty() {
            return Err(CatalogueError::EmptyLabel(self.id));
        }

        let axes = self
            .parameters
            .iter()
            .map(|(name, spec)| {
                spec.expand(self.id, name)
                    .map(|values| (name.clone(), values))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let size = axes
            .iter()
            .try_fold(1usize, |acc, (_, values)| acc.checked_mul(values.len()))
            .unwrap_or(usize::MAX);
        if size > MAX_GRID_SIZE {
            return Err(CatalogueError::GridTooLarge { job: self.id, size });
        }

        let parameter_grid = if axes.is_empty() {
            // a job without parameters is evaluated exactly once
            vec![ParameterSet::new()]
        } else {
            let names = axes.iter().map(|(name, _)| name.clone()).collect_vec();

            axes.into_iter()
                .map(|(_, values)| values)
                .multi_cartesian_product()
                .map(|combination| names.iter().cloned().zip(combination).collect())
                .collect_vec()
        };

        debug!(job = self.id, combos = parameter_grid.len(), "Expanded parameter grid");

        Ok(Job {
            id: self.id,
            label: self.label,
            parameter_grid,
        })
    }
}

/// The fixed set of jobs, keyed and ordered by id
#[derive(Clone, Debug, Default)]
pub struct Catalogue {
    jobs: BTreeMap<JobId, Job>,
}

impl Catalogue {
    pub fn load(path: &Path) -> Result<Self, CatalogueError> {
        let content = fs::read_to_string(path).map_err(|source| CatalogueError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalogue = Self::from_yaml(&content)?;

        info!(path = ?path, jobs = catalogue.len(), "Loaded job catalogue");

        Ok(catalogue)
    }

    /// parse a catalogue document, JSON is accepted as well since it is valid YAML
    pub fn from_yaml(content: &str) -> Result<Self, CatalogueError> {
        let document: CatalogueDocument = serde_yaml::from_str(content)?;

        Self::from_definitions(document.jobs)
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = JobDefinition>,
    ) -> Result<Self, CatalogueError> {
        definitions
            .into_iter()
            .map(JobDefinition::build)
            .collect::<Result<Vec<_>, _>>()
            .and_then(Self::from_jobs)
    }

    pub fn from_jobs(jobs: impl IntoIterator<Item = Job>) -> Result<Self, CatalogueError> {
        let mut map = BTreeMap::new();

        for job in jobs {
            if map.contains_key(&job.id) {
                return Err(CatalogueError::DuplicateId(job.id));
            }

            map.insert(job.id, job);
        }

        Ok(Self { jobs: map })
    }

    pub fn ids(&self) -> BTreeSet<JobId> {
        self.jobs.keys().copied().collect()
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }
}
