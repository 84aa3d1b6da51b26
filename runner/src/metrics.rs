use serde::{Deserialize, Serialize};
use std::fmt;

/// Performance tuple of a single backtest evaluation
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Metrics {
    #[serde(rename = "return")]
    pub total_return: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub trade_count: u64,
    pub profit_factor: f64,
    pub sharpe_ratio: f64,
}

/// Output of the opaque evaluator for one parameter set
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Evaluation {
    #[serde(flatten)]
    pub metrics: Metrics,
    /// number of trade signals produced, defaults to the trade count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<u64>,
    /// signals produced by the evaluator's fallback generation, if it has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_signals: Option<u64>,
}

impl Evaluation {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            metrics,
            signals: None,
            fallback_signals: None,
        }
    }

    pub fn signal_count(&self) -> u64 {
        self.signals.unwrap_or(self.metrics.trade_count)
    }
}

/// Metric used to decide which parameter set of a job is the best one
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RankingKey {
    #[default]
    Sharpe,
    Return,
    ProfitFactor,
    WinRate,
    /// smallest drawdown magnitude wins
    Drawdown,
}

impl RankingKey {
    /// score where higher is always better, NaN ranks below everything
    pub fn score(&self, metrics: &Metrics) -> f64 {
        let score = match self {
            Self::Sharpe => metrics.sharpe_ratio,
            Self::Return => metrics.total_return,
            Self::ProfitFactor => metrics.profit_factor,
            Self::WinRate => metrics.win_rate,
            Self::Drawdown => -metrics.max_drawdown.abs(),
        };

        if score.is_nan() {
            f64::NEG_INFINITY
        } else {
            score
        }
    }

    /// strictly better, ties keep the incumbent so the best result never flip-flops
    pub fn is_better(&self, candidate: &Metrics, incumbent: &Metrics) -> bool {
        self.score(candidate) > self.score(incumbent)
    }
}

impl fmt::Display for RankingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sharpe => "sharpe",
            Self::Return => "return",
            Self::ProfitFactor => "profit_factor",
            Self::WinRate => "win_rate",
            Self::Drawdown => "drawdown",
        };

        f.write_str(name)
    }
}

/// Best evaluation of a job so far, together with the parameter set that produced it
#[derive(Clone, Debug, PartialEq)]
pub struct BestResult<P> {
    pub evaluation: Evaluation,
    pub parameters: P,
    pub combo_index: usize,
}

/// Tracks the best evaluation of a job, only ever improving on the ranking key
#[derive(Clone, Debug)]
pub struct BestTracker<P> {
    key: RankingKey,
    best: Option<BestResult<P>>,
}

impl<P> BestTracker<P> {
    pub fn new(key: RankingKey) -> Self {
        Self { key, best: None }
    }

    /// offer a new evaluation, returns true if it replaced the current best
    pub fn offer(&mut self, evaluation: Evaluation, parameters: P, combo_index: usize) -> bool {
        let improves = match &self.best {
            Some(best) => self.key.is_better(&evaluation.metrics, &best.evaluation.metrics),
            None => true,
        };

        if improves {
            self.best = Some(BestResult {
                evaluation,
                parameters,
                combo_index,
            });
        }

        improves
    }

    pub fn best(&self) -> Option<&BestResult<P>> {
        self.best.as_ref()
    }

    pub fn best_metrics(&self) -> Option<&Metrics> {
        self.best.as_ref().map(|best| &best.evaluation.metrics)
    }

    pub fn into_best(self) -> Option<BestResult<P>> {
        self.best
    }
}
