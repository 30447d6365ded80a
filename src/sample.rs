//! Sample and run data model
//!
//! A [`Sample`] is one telemetry observation; a [`Run`] is the immutable,
//! time-ordered sequence of samples recorded under one scenario. Fitting and
//! simulation read runs through [`RunSignals`], which applies the per-field
//! fill policy once so every consumer sees the same cleaned series.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ambient/temperature fallback when a run has no usable reading (°C).
pub const DEFAULT_TEMPERATURE_C: f64 = 40.0;

/// One telemetry observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Time offset from run start (s).
    pub t_s: f64,
    /// Interval since the previous sample (s).
    pub dt_s: f64,
    /// State of charge (percent, 0-100).
    pub soc_pct: Option<f64>,
    /// Battery voltage (mV).
    pub voltage_mv: Option<f64>,
    /// Case/battery temperature (°C).
    pub temperature_c: Option<f64>,
    /// Processor temperature (°C).
    pub temperature_cpu_c: Option<f64>,
    /// Independently measured total power (mW), ground truth.
    pub power_total_mw: Option<f64>,
    /// CPU power proxy (mW).
    pub power_cpu_mw: Option<f64>,
    /// Screen power proxy (mW).
    pub power_screen_mw: Option<f64>,
    /// GPS flag.
    pub is_gps_on: Option<bool>,
    /// Cellular radio flag.
    pub cellular_on: Option<bool>,
}

/// Optional subsystems whose OFF state is calibrated from paired runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Gps,
    Cellular,
}

impl Subsystem {
    pub const ALL: [Subsystem; 2] = [Subsystem::Gps, Subsystem::Cellular];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Gps => "gps",
            Subsystem::Cellular => "cellular",
        }
    }

    /// Whether the subsystem is ON in a sample, with the field default applied
    /// (GPS defaults off, cellular defaults on).
    pub fn is_on(&self, sample: &Sample) -> bool {
        match self {
            Subsystem::Gps => sample.is_gps_on.unwrap_or(false),
            Subsystem::Cellular => sample.cellular_on.unwrap_or(true),
        }
    }
}

/// An immutable, time-ordered run.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    name: String,
    scenario: String,
    samples: Vec<Sample>,
}

impl Run {
    /// Build a run, sorting samples by `t_s` (stable for ties).
    pub fn new(name: impl Into<String>, scenario: impl Into<String>, mut samples: Vec<Sample>) -> Self {
        samples.sort_by(|a, b| a.t_s.total_cmp(&b.t_s));
        Self {
            name: name.into(),
            scenario: scenario.into(),
            samples,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total of positive finite intervals (s).
    pub fn duration_s(&self) -> f64 {
        self.samples
            .iter()
            .map(|s| s.dt_s)
            .filter(|dt| dt.is_finite() && *dt > 0.0)
            .sum()
    }

    /// Copy of this run keeping only samples that satisfy `keep`.
    pub fn filtered(&self, keep: impl Fn(&Sample) -> bool) -> Run {
        Run {
            name: self.name.clone(),
            scenario: self.scenario.clone(),
            samples: self.samples.iter().filter(|s| keep(s)).cloned().collect(),
        }
    }
}

/// Scenario family: the label up to the first `-` (`S4-1` -> `S4`).
pub fn scenario_family(scenario: &str) -> &str {
    scenario.split('-').next().unwrap_or(scenario)
}

/// A set of runs keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    runs: Vec<Run>,
}

impl Dataset {
    /// Build from runs; runs are ordered by name.
    pub fn new(mut runs: Vec<Run>) -> Self {
        runs.sort_by(|a, b| a.name.cmp(&b.name));
        Self { runs }
    }

    /// Group loose samples by `(run_name, scenario)`. The first scenario seen
    /// for a run name wins.
    pub fn from_rows(rows: impl IntoIterator<Item = (String, String, Sample)>) -> Self {
        let mut grouped: BTreeMap<String, (String, Vec<Sample>)> = BTreeMap::new();
        for (run_name, scenario, sample) in rows {
            grouped
                .entry(run_name)
                .or_insert_with(|| (scenario, Vec::new()))
                .1
                .push(sample);
        }
        Self::new(
            grouped
                .into_iter()
                .map(|(name, (scenario, samples))| Run::new(name, scenario, samples))
                .collect(),
        )
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.runs.iter().map(Run::len).sum()
    }

    pub fn get(&self, name: &str) -> Option<&Run> {
        self.runs.iter().find(|r| r.name == name)
    }

    /// Distinct scenario labels, sorted.
    pub fn scenarios(&self) -> Vec<String> {
        let mut out: Vec<String> = self.runs.iter().map(|r| r.scenario.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Runs matching a predicate, as a new dataset.
    pub fn select(&self, keep: impl Fn(&Run) -> bool) -> Dataset {
        Dataset {
            runs: self.runs.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    /// Evaluation view: samples with measured power only, dropping runs with
    /// fewer than `min_samples` of them.
    pub fn for_evaluation(&self, min_samples: usize) -> Dataset {
        Dataset {
            runs: self
                .runs
                .iter()
                .map(|r| r.filtered(|s| s.power_total_mw.map_or(false, f64::is_finite)))
                .filter(|r| r.len() >= min_samples.max(1))
                .collect(),
        }
    }
}

/// Forward-fill then back-fill a series of optional values.
pub fn fill_forward_back(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out: Vec<Option<f64>> = Vec::with_capacity(values.len());
    let mut last = None;
    for v in values {
        let v = v.filter(|x| x.is_finite());
        if v.is_some() {
            last = v;
        }
        out.push(last);
    }
    let first_valid = out.iter().flatten().next().copied();
    for v in out.iter_mut() {
        if v.is_some() {
            break;
        }
        *v = first_valid;
    }
    out
}

/// Median of the finite values, if any.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        Some(0.5 * (v[mid - 1] + v[mid]))
    } else {
        Some(v[mid])
    }
}

/// Cleaned per-sample series of one run, with fills applied.
#[derive(Debug, Clone)]
pub struct RunSignals {
    pub t_s: Vec<f64>,
    /// Raw intervals; non-finite or non-positive values mark no-op steps.
    pub dt_s: Vec<f64>,
    /// Processor temperature; `None` when the run never reports it.
    pub temp_cpu_c: Option<Vec<f64>>,
    /// Case/battery temperature; `None` when the run never reports it.
    pub temp_batt_c: Option<Vec<f64>>,
    /// Heat proxy: max(0, CPU power) in W.
    pub heat_w: Vec<f64>,
    pub power_cpu_mw: Vec<f64>,
    pub power_screen_mw: Vec<f64>,
    /// Voltage (V), held at the last valid reading, else nominal.
    pub voltage_v: Vec<f64>,
    pub gps_on: Vec<bool>,
    pub cellular_on: Vec<bool>,
    /// Measured total power, unfilled.
    pub power_total_mw: Vec<Option<f64>>,
    /// Measured SOC fraction, unfilled.
    pub soc_meas: Vec<Option<f64>>,
}

impl RunSignals {
    /// Prepare the series of a run. `nominal_voltage_v` is used when no valid
    /// voltage is ever reported.
    pub fn from_run(run: &Run, nominal_voltage_v: f64) -> Self {
        let samples = run.samples();

        let temp_cpu_c = filled_or_none(samples.iter().map(|s| s.temperature_cpu_c));
        let temp_batt_c = filled_or_none(samples.iter().map(|s| s.temperature_c));

        let power_cpu_mw: Vec<f64> = samples
            .iter()
            .map(|s| s.power_cpu_mw.filter(|x| x.is_finite()).unwrap_or(0.0))
            .collect();
        let power_screen_mw = samples
            .iter()
            .map(|s| s.power_screen_mw.filter(|x| x.is_finite()).unwrap_or(0.0))
            .collect();
        let heat_w = power_cpu_mw.iter().map(|p| p.max(0.0) / 1000.0).collect();

        // Hold the last valid voltage; leading gaps take the first valid one.
        let volts: Vec<Option<f64>> = samples
            .iter()
            .map(|s| s.voltage_mv.map(|mv| mv / 1000.0).filter(|v| v.is_finite() && *v > 0.0))
            .collect();
        let voltage_v = fill_forward_back(&volts)
            .into_iter()
            .map(|v| v.unwrap_or(nominal_voltage_v))
            .collect();

        Self {
            t_s: samples.iter().map(|s| s.t_s).collect(),
            dt_s: samples.iter().map(|s| s.dt_s).collect(),
            temp_cpu_c,
            temp_batt_c,
            heat_w,
            power_cpu_mw,
            power_screen_mw,
            voltage_v,
            gps_on: samples.iter().map(|s| Subsystem::Gps.is_on(s)).collect(),
            cellular_on: samples.iter().map(|s| Subsystem::Cellular.is_on(s)).collect(),
            power_total_mw: samples
                .iter()
                .map(|s| s.power_total_mw.filter(|x| x.is_finite()))
                .collect(),
            soc_meas: samples
                .iter()
                .map(|s| s.soc_pct.filter(|x| x.is_finite()).map(|p| p / 100.0))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.dt_s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dt_s.is_empty()
    }

    /// Whether step `i -> i+1` advances time.
    pub fn step_valid(&self, i: usize) -> bool {
        let dt = self.dt_s[i];
        dt.is_finite() && dt > 0.0
    }

    /// Initial SOC fraction: first valid reading.
    pub fn initial_soc(&self) -> Option<f64> {
        self.soc_meas.iter().flatten().next().copied()
    }

    /// Whether a subsystem is ON at sample `i`.
    pub fn subsystem_on(&self, subsystem: Subsystem, i: usize) -> bool {
        match subsystem {
            Subsystem::Gps => self.gps_on[i],
            Subsystem::Cellular => self.cellular_on[i],
        }
    }
}

/// Forward/back-fill, then fill remaining gaps with the run median. `None`
/// when no value is valid.
fn filled_or_none(values: impl Iterator<Item = Option<f64>>) -> Option<Vec<f64>> {
    let raw: Vec<Option<f64>> = values.collect();
    let filled = fill_forward_back(&raw);
    let valid: Vec<f64> = filled.iter().flatten().copied().collect();
    let med = median(&valid)?;
    Some(filled.into_iter().map(|v| v.unwrap_or(med)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t: f64) -> Sample {
        Sample {
            t_s: t,
            dt_s: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_run_sorts_by_time() {
        let run = Run::new("r", "S1", vec![sample(3.0), sample(1.0), sample(2.0)]);
        let ts: Vec<f64> = run.samples().iter().map(|s| s.t_s).collect();
        assert_eq!(ts, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_scenario_family() {
        assert_eq!(scenario_family("S4-1"), "S4");
        assert_eq!(scenario_family("S1-HS-2"), "S1");
        assert_eq!(scenario_family("S2"), "S2");
    }

    #[test]
    fn test_fill_forward_back() {
        let filled = fill_forward_back(&[None, Some(2.0), None, Some(f64::NAN), Some(5.0), None]);
        assert_eq!(
            filled,
            vec![Some(2.0), Some(2.0), Some(2.0), Some(2.0), Some(5.0), Some(5.0)]
        );
        assert_eq!(fill_forward_back(&[None, None]), vec![None, None]);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[f64::NAN]), None);
    }

    #[test]
    fn test_subsystem_defaults() {
        let s = Sample::default();
        assert!(!Subsystem::Gps.is_on(&s));
        assert!(Subsystem::Cellular.is_on(&s));
    }

    #[test]
    fn test_signals_fill_policy() {
        let mut samples: Vec<Sample> = (0..4).map(|i| sample(i as f64)).collect();
        samples[1].voltage_mv = Some(4000.0);
        samples[2].temperature_cpu_c = Some(35.0);
        samples[0].power_cpu_mw = Some(-50.0);
        samples[3].power_cpu_mw = Some(1500.0);
        let run = Run::new("r", "S1", samples);

        let sig = RunSignals::from_run(&run, 3.85);
        assert_eq!(sig.voltage_v, vec![4.0, 4.0, 4.0, 4.0]);
        assert_eq!(sig.temp_cpu_c, Some(vec![35.0; 4]));
        assert!(sig.temp_batt_c.is_none());
        assert_eq!(sig.heat_w, vec![0.0, 0.0, 0.0, 1.5]);
        assert_eq!(sig.power_cpu_mw[0], -50.0);
    }

    #[test]
    fn test_signals_nominal_voltage() {
        let run = Run::new("r", "S1", vec![sample(0.0), sample(1.0)]);
        let sig = RunSignals::from_run(&run, 3.85);
        assert_eq!(sig.voltage_v, vec![3.85, 3.85]);
        assert_eq!(sig.initial_soc(), None);
    }

    #[test]
    fn test_dataset_grouping_and_eval_filter() {
        let mut rows = Vec::new();
        for i in 0..5 {
            let mut s = sample(i as f64);
            s.power_total_mw = if i == 0 { None } else { Some(1000.0) };
            rows.push(("b".to_string(), "S2".to_string(), s.clone()));
            rows.push(("a".to_string(), "S1".to_string(), s));
        }
        let ds = Dataset::from_rows(rows);
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.runs()[0].name(), "a");
        assert_eq!(ds.scenarios(), vec!["S1".to_string(), "S2".to_string()]);

        let eval = ds.for_evaluation(4);
        assert_eq!(eval.sample_count(), 8);
        assert!(ds.for_evaluation(5).is_empty());
    }
}
