// MPower Testdata - Device ground truth
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Ground-truth physics of a synthetic device.
//!
//! The thermal and power parameters reuse the library's own parameter types,
//! so a fit on generated data can be compared field by field with the truth.

use mpower::power::PowerRow;
use mpower::thermal::{OneStateParams, TwoStateParams};
use mpower::{PowerModelParams, ThermalParams};
use serde::{Deserialize, Serialize};

/// Ground truth of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTruth {
    /// Thermal dynamics.
    pub thermal: ThermalParams,
    /// Additive power model, including the effective capacity.
    pub power: PowerModelParams,
    /// Internal resistance; adds an I²R loss the power model does not know.
    pub r_int_ohm: f64,
    /// Open-circuit voltage at full charge.
    pub v_full: f64,
    /// Open-circuit voltage at empty.
    pub v_empty: f64,
    /// Weight of the fast node in the two-state leak temperature.
    pub leak_temp_mix: f64,
}

impl DeviceTruth {
    /// Single-node device: only the processor temperature is reported.
    pub fn one_state() -> Self {
        Self {
            thermal: ThermalParams::OneState(OneStateParams {
                a_per_s: -0.02,
                b_c_per_j: 0.1,
                t_amb_c: 25.0,
            }),
            ..Self::default()
        }
    }

    /// Loss-free variant: no internal resistance.
    pub fn ideal(mut self) -> Self {
        self.r_int_ohm = 0.0;
        self
    }

    /// Open-circuit voltage at SOC fraction `soc`.
    pub fn ocv(&self, soc: f64) -> f64 {
        self.v_empty + (self.v_full - self.v_empty) * soc.clamp(0.0, 1.0)
    }

    /// Terminal voltage and I²R loss (mW) for a model power draw.
    ///
    /// The current is the model draw over the open-circuit voltage.
    pub fn terminal(&self, soc: f64, model_mw: f64) -> (f64, f64) {
        let ocv = self.ocv(soc);
        let current_a = model_mw.max(0.0) / 1000.0 / ocv;
        let loss_mw = self.r_int_ohm * current_a * current_a * 1000.0;
        (ocv - self.r_int_ohm * current_a, loss_mw)
    }

    /// Model power (mW) without the resistive loss.
    pub fn model_power(&self, row: &PowerRow) -> f64 {
        self.power.predict(row)
    }

    /// Leak temperature from the node temperatures.
    pub fn leak_temp(&self, cpu_c: f64, batt_c: Option<f64>) -> f64 {
        match batt_c {
            Some(b) => {
                let w = self.leak_temp_mix.clamp(0.0, 1.0);
                w * cpu_c + (1.0 - w) * b
            }
            None => cpu_c,
        }
    }

    pub fn ambient_c(&self) -> f64 {
        self.thermal.ambient_c()
    }
}

impl Default for DeviceTruth {
    /// Two-node device with realistic phone-scale constants.
    fn default() -> Self {
        Self {
            thermal: ThermalParams::TwoState(TwoStateParams {
                a_cpu_per_s: -0.05,
                b_cpu_c_per_j: 0.25,
                a_batt_per_s: -0.004,
                b_couple_per_s: 0.002,
                t_amb_c: 25.0,
            }),
            power: PowerModelParams {
                p_base_mw: 350.0,
                k_screen: 1.1,
                k_cpu: 1.0,
                k_leak_mw: 40.0,
                leak_gamma_per_c: std::f64::consts::LN_2 / 10.0,
                leak_tref_c: 40.0,
                k_gps_off_mw: -120.0,
                k_cellular_off_mw: -80.0,
                c_eff_mah: 4000.0,
            },
            r_int_ohm: 0.12,
            v_full: 4.35,
            v_empty: 3.4,
            leak_temp_mix: 0.7,
        }
    }
}
