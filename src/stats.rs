use serde::{Deserialize, Serialize};

/// Aggregate of one timing series (seconds).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct TimeAggregate {
    pub minimum: f64,
    pub maximum: f64,
    pub mean: f64,
    pub sum: f64,
}

impl TimeAggregate {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let sum: f64 = samples.iter().sum();
        let minimum = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let maximum = samples.iter().cloned().fold(0.0, f64::max);
        Self {
            minimum,
            maximum,
            mean: sum / samples.len() as f64,
            sum,
        }
    }
}

/// CPU and real time aggregates for one phase category.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct PhaseTimes {
    pub cpu: TimeAggregate,
    pub real: TimeAggregate,
}

/// The timing report embedded in the finished artifact: execution tasks,
/// parsing tasks, and the combined totals.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct AnalysisTimes {
    pub execution: PhaseTimes,
    pub parsing: PhaseTimes,
    pub total: PhaseTimes,
}

/// One task's measured times for a single phase.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseSample {
    pub cpu_secs: f64,
    pub real_secs: f64,
}

/// Aggregate per-task benchmarks into the analysis timing report.
///
/// Failed and canceled tasks contribute no samples, so an errored run
/// underestimates the true totals (the finished artifact notes the status
/// alongside these numbers).
pub fn aggregate_times(exec: &[PhaseSample], parsing: &[PhaseSample]) -> AnalysisTimes {
    let exec_cpu: Vec<f64> = exec.iter().map(|s| s.cpu_secs).collect();
    let exec_real: Vec<f64> = exec.iter().map(|s| s.real_secs).collect();
    let parsing_cpu: Vec<f64> = parsing.iter().map(|s| s.cpu_secs).collect();
    let parsing_real: Vec<f64> = parsing.iter().map(|s| s.real_secs).collect();

    let total_count = (exec.len() + parsing.len()).max(1) as f64;
    let total_cpu_sum: f64 = exec_cpu.iter().sum::<f64>() + parsing_cpu.iter().sum::<f64>();
    let total_real_sum: f64 = exec_real.iter().sum::<f64>() + parsing_real.iter().sum::<f64>();

    AnalysisTimes {
        execution: PhaseTimes {
            cpu: TimeAggregate::from_samples(&exec_cpu),
            real: TimeAggregate::from_samples(&exec_real),
        },
        parsing: PhaseTimes {
            cpu: TimeAggregate::from_samples(&parsing_cpu),
            real: TimeAggregate::from_samples(&parsing_real),
        },
        total: PhaseTimes {
            cpu: TimeAggregate {
                minimum: 0.0,
                maximum: 0.0,
                mean: total_cpu_sum / total_count,
                sum: total_cpu_sum,
            },
            real: TimeAggregate {
                minimum: 0.0,
                maximum: 0.0,
                mean: total_real_sum / total_count,
                sum: total_real_sum,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_empty_series_is_zero() {
        let agg = TimeAggregate::from_samples(&[]);
        assert_eq!(agg, TimeAggregate::default());
    }

    #[test]
    fn aggregate_computes_min_max_mean_sum() {
        let agg = TimeAggregate::from_samples(&[2.0, 6.0, 4.0]);
        assert_eq!(agg.minimum, 2.0);
        assert_eq!(agg.maximum, 6.0);
        assert_eq!(agg.mean, 4.0);
        assert_eq!(agg.sum, 12.0);
    }

    #[test]
    fn totals_combine_both_phases() {
        let exec = [PhaseSample {
            cpu_secs: 10.0,
            real_secs: 20.0,
        }];
        let parsing = [PhaseSample {
            cpu_secs: 2.0,
            real_secs: 4.0,
        }];
        let times = aggregate_times(&exec, &parsing);
        assert_eq!(times.total.cpu.sum, 12.0);
        assert_eq!(times.total.real.sum, 24.0);
        assert_eq!(times.total.cpu.mean, 6.0);
        assert_eq!(times.execution.real.maximum, 20.0);
    }
}
