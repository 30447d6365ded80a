//! Fitted parameter artifacts
//!
//! Parameters are stored as flat `name -> f64` records so that every fold
//! and model variant can be diffed and tabulated the same way. JSON floats
//! round-trip exactly, so replaying a loaded artifact reproduces the
//! simulated trajectories bit-for-bit.

use crate::config::ModelConfig;
use crate::error::{MpowerError, Result};
use crate::power::{PowerFit, PowerModelParams};
use crate::thermal::{OneStateParams, ThermalParams, TwoStateParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Flat numeric record.
pub type ParamRecord = BTreeMap<String, f64>;

/// Conversion to and from a flat record.
pub trait FlatParams: Sized {
    fn to_record(&self) -> ParamRecord;
    fn from_record(record: &ParamRecord) -> Result<Self>;
}

fn get(record: &ParamRecord, key: &str) -> Result<f64> {
    record
        .get(key)
        .copied()
        .ok_or_else(|| MpowerError::ArtifactKey(key.to_string()))
}

fn record<const N: usize>(entries: [(&str, f64); N]) -> ParamRecord {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

impl FlatParams for PowerModelParams {
    fn to_record(&self) -> ParamRecord {
        record([
            ("p_base_mW", self.p_base_mw),
            ("k_screen", self.k_screen),
            ("k_cpu", self.k_cpu),
            ("k_leak_mW", self.k_leak_mw),
            ("leak_gamma_per_C", self.leak_gamma_per_c),
            ("leak_tref_C", self.leak_tref_c),
            ("k_gps_off_mW", self.k_gps_off_mw),
            ("k_cellular_off_mW", self.k_cellular_off_mw),
            ("c_eff_mAh", self.c_eff_mah),
        ])
    }

    fn from_record(r: &ParamRecord) -> Result<Self> {
        Ok(Self {
            p_base_mw: get(r, "p_base_mW")?,
            k_screen: get(r, "k_screen")?,
            k_cpu: get(r, "k_cpu")?,
            k_leak_mw: get(r, "k_leak_mW")?,
            leak_gamma_per_c: get(r, "leak_gamma_per_C")?,
            leak_tref_c: get(r, "leak_tref_C")?,
            k_gps_off_mw: get(r, "k_gps_off_mW")?,
            k_cellular_off_mw: get(r, "k_cellular_off_mW")?,
            c_eff_mah: get(r, "c_eff_mAh")?,
        })
    }
}

impl FlatParams for ThermalParams {
    fn to_record(&self) -> ParamRecord {
        match self {
            ThermalParams::OneState(p) => record([
                ("thermal_states", 1.0),
                ("t_amb_C", p.t_amb_c),
                ("a_per_s", p.a_per_s),
                ("b_C_per_J", p.b_c_per_j),
            ]),
            ThermalParams::TwoState(p) => record([
                ("thermal_states", 2.0),
                ("t_amb_C", p.t_amb_c),
                ("a_cpu_per_s", p.a_cpu_per_s),
                ("b_cpu_C_per_J", p.b_cpu_c_per_j),
                ("a_batt_per_s", p.a_batt_per_s),
                ("b_couple_per_s", p.b_couple_per_s),
            ]),
        }
    }

    fn from_record(r: &ParamRecord) -> Result<Self> {
        let states = get(r, "thermal_states")?;
        if states == 1.0 {
            Ok(ThermalParams::OneState(OneStateParams {
                a_per_s: get(r, "a_per_s")?,
                b_c_per_j: get(r, "b_C_per_J")?,
                t_amb_c: get(r, "t_amb_C")?,
            }))
        } else if states == 2.0 {
            Ok(ThermalParams::TwoState(TwoStateParams {
                a_cpu_per_s: get(r, "a_cpu_per_s")?,
                b_cpu_c_per_j: get(r, "b_cpu_C_per_J")?,
                a_batt_per_s: get(r, "a_batt_per_s")?,
                b_couple_per_s: get(r, "b_couple_per_s")?,
                t_amb_c: get(r, "t_amb_C")?,
            }))
        } else {
            Err(MpowerError::ArtifactKey(format!("thermal_states={}", states)))
        }
    }
}

/// Everything needed to replay a fit: the global power model and the
/// per-run thermal parameters it was fit with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub thermal_model: String,
    pub leak_temp_mix: f64,
    pub power: ParamRecord,
    #[serde(default)]
    pub thermal: BTreeMap<String, ParamRecord>,
}

impl ModelArtifact {
    pub fn from_fit(fit: &PowerFit, config: &ModelConfig) -> Self {
        Self {
            thermal_model: config.thermal.model.as_str().to_string(),
            leak_temp_mix: config.thermal.leak_temp_mix,
            power: fit.params().to_record(),
            thermal: fit
                .runs
                .iter()
                .map(|r| (r.name.clone(), r.thermal_params().to_record()))
                .collect(),
        }
    }

    pub fn power_params(&self) -> Result<PowerModelParams> {
        PowerModelParams::from_record(&self.power)
    }

    /// Stored thermal parameters of a run, if it was part of the fit.
    pub fn thermal_params(&self, run_name: &str) -> Result<Option<ThermalParams>> {
        self.thermal
            .get(run_name)
            .map(ThermalParams::from_record)
            .transpose()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json + "\n")?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> PowerModelParams {
        PowerModelParams {
            p_base_mw: 812.345678901234,
            k_screen: 1.0 / 3.0,
            k_cpu: 0.7071067811865476,
            k_leak_mw: 12.5,
            leak_gamma_per_c: std::f64::consts::LN_2 / 10.0,
            leak_tref_c: 38.2,
            k_gps_off_mw: -61.0,
            k_cellular_off_mw: 0.0,
            c_eff_mah: 4410.0,
        }
    }

    #[test]
    fn test_power_record_keys() {
        let r = params().to_record();
        assert_eq!(r.len(), 9);
        assert_eq!(r["k_gps_off_mW"], -61.0);
        assert_eq!(PowerModelParams::from_record(&r).unwrap(), params());
    }

    #[test]
    fn test_missing_key() {
        let mut r = params().to_record();
        r.remove("k_cpu");
        match PowerModelParams::from_record(&r) {
            Err(MpowerError::ArtifactKey(k)) => assert_eq!(k, "k_cpu"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_thermal_record_variants() {
        let two = ThermalParams::TwoState(TwoStateParams {
            a_cpu_per_s: -0.01,
            b_cpu_c_per_j: 0.3,
            a_batt_per_s: -0.0004,
            b_couple_per_s: 0.002,
            t_amb_c: 29.5,
        });
        let r = two.to_record();
        assert_eq!(r["thermal_states"], 2.0);
        assert_eq!(ThermalParams::from_record(&r).unwrap(), two);

        let mut bad = r.clone();
        bad.insert("thermal_states".into(), 3.0);
        assert!(ThermalParams::from_record(&bad).is_err());
    }

    #[test]
    fn test_artifact_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        let mut thermal = BTreeMap::new();
        thermal.insert(
            "run_a".to_string(),
            ThermalParams::OneState(OneStateParams {
                a_per_s: -1.0 / 1234.5,
                b_c_per_j: 0.0123,
                t_amb_c: 31.0,
            })
            .to_record(),
        );
        let artifact = ModelArtifact {
            thermal_model: "1state".into(),
            leak_temp_mix: 0.7,
            power: params().to_record(),
            thermal,
        };
        artifact.save(&path).unwrap();
        let loaded = ModelArtifact::load(&path).unwrap();
        assert_eq!(loaded, artifact);
        assert_eq!(loaded.power_params().unwrap(), params());
        assert!(loaded.thermal_params("run_a").unwrap().is_some());
        assert!(loaded.thermal_params("other").unwrap().is_none());
    }
}
