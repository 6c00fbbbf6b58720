//! Conversion of raw sensor counts to temperatures.
//!
//! The radiometric chain follows the [Thermimage R library]
//! (`raw2temp`), the same model FLIR tooling uses:
//!
//! 1. the reflected apparent temperature is turned into the raw
//!    count a black body at that temperature would produce;
//! 2. the reflected share `(1 - e)` of that count is removed from
//!    the measured count and the remainder scaled by `1 / e`;
//! 3. the object count is inverted through the Planck curve.
//!
//! The atmosphere is accounted for by the selected
//! [`AtmosphereModel`]. The default, [`AtmosphereModel::Additive`],
//! keeps steps 1-3 as they are and adds a small offset linear in air
//! temperature, transmission and humidity. [`AtmosphereModel::Thermimage`]
//! instead folds the attenuation over the object distance (and an
//! optional IR window) into step 2 as an affine map of the raw
//! count. With a transmission of one either way reduces exactly to
//! steps 1-3.
//!
//! [Thermimage R library]: //github.com/gtatters/Thermimage/blob/master/R/raw2temp.R
use ndarray::{Array2, ArrayView2, Zip};
use serde_derive::*;
use tracing::debug;

use crate::{
    error::{Error, Result},
    raw::IntensityMatrix,
    roi::Mask,
};

const CELSIUS_OFFSET: f64 = 273.15;

/// Camera specific constants relating raw counts to radiance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanckConstants {
    pub r1: f64,
    pub r2: f64,
    pub b: f64,
    pub f: f64,
    pub o: f64,
}

impl Default for PlanckConstants {
    fn default() -> Self {
        PlanckConstants {
            r1: 21106.77,
            r2: 0.012545258,
            b: 1501.0,
            f: 1.0,
            o: -7340.0,
        }
    }
}

impl PlanckConstants {
    // raw = PR1/(PR2*(exp(PB/(temp+273.15))-PF))-PO
    pub fn temp_to_raw(&self, temp: f64) -> f64 {
        self.r1 / (self.r2 * ((self.b / (temp + CELSIUS_OFFSET)).exp() - self.f)) - self.o
    }

    /// Inverse of [`temp_to_raw`](Self::temp_to_raw). Returns `NaN`
    /// where the curve is undefined for `raw`.
    pub fn raw_to_temp(&self, raw: f64) -> f64 {
        let arg = self.r1 / (self.r2 * (raw + self.o)) + self.f;
        if !arg.is_finite() || arg <= 0. {
            return f64::NAN;
        }
        let temp = self.b / arg.ln() - CELSIUS_OFFSET;
        if temp.is_finite() {
            temp
        } else {
            f64::NAN
        }
    }
}

/// Transmission assumed when none is given.
pub const DEFAULT_ATMOSPHERIC_TRANSMISSION: f64 = 0.95;

/// How the atmosphere between object and camera is accounted for.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum AtmosphereModel {
    /// Offset in °C added to the Planck result:
    /// `temperature * (T_atm - 20) + transmission * (1 - tau) + humidity * (RH - 50)`.
    /// Distance does not enter.
    Additive {
        temperature: f64,
        transmission: f64,
        humidity: f64,
    },
    /// Two-band water vapour model from Minkina and Dudzik,
    /// attenuating over the object distance.
    Thermimage {
        alpha_1: f64,
        alpha_2: f64,
        beta_1: f64,
        beta_2: f64,
        x: f64,
    },
    /// No correction at all.
    Ignored,
}

impl Default for AtmosphereModel {
    fn default() -> Self {
        AtmosphereModel::Additive {
            temperature: 0.0005,
            transmission: 0.002,
            humidity: 0.00002,
        }
    }
}

impl AtmosphereModel {
    /// Thermimage model with the constants of common FLIR cameras.
    pub fn thermimage() -> Self {
        AtmosphereModel::Thermimage {
            alpha_1: 0.006569,
            alpha_2: 0.01262,
            beta_1: -0.002276,
            beta_2: -0.00667,
            x: 1.9,
        }
    }
}

/// Placement of the IR image over the visible one.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Alignment {
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl Default for Alignment {
    fn default() -> Self {
        Alignment {
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }
}

/// Parameters to compute temperatures from raw sensor values.
///
/// Typically pre-filled from the capture metadata and then edited
/// by the user. Temperatures are in °C, distance in metres and
/// humidity in percent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationParameters {
    pub emissivity: f64,
    pub object_distance: f64,
    pub reflected_apparent_temperature: f64,
    pub atmospheric_temperature: f64,
    pub relative_humidity: f64,

    pub ir_window_temperature: f64,
    pub ir_window_transmission: f64,

    /// Assumed transmission of the atmosphere. Feeds the additive
    /// correction; with the Thermimage model it replaces the
    /// transmission derived from distance and humidity.
    pub atmospheric_transmission: Option<f64>,
    pub atmosphere: AtmosphereModel,

    pub planck: PlanckConstants,
    pub alignment: Alignment,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        CalibrationParameters {
            emissivity: 0.95,
            object_distance: 1.0,
            reflected_apparent_temperature: 20.0,
            atmospheric_temperature: 20.0,
            relative_humidity: 50.0,
            ir_window_temperature: 20.0,
            ir_window_transmission: 1.0,
            atmospheric_transmission: Some(DEFAULT_ATMOSPHERIC_TRANSMISSION),
            atmosphere: AtmosphereModel::default(),
            planck: PlanckConstants::default(),
            alignment: Alignment::default(),
        }
    }
}

/// Which emissivity a computation uses.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CalibrationScope {
    /// The emissivity of the calibration itself.
    Global,
    /// A per-ROI emissivity replacing the global one.
    RoiLocal { emissivity: f64 },
}

impl CalibrationScope {
    pub fn from_override(emissivity: Option<f64>) -> Self {
        match emissivity {
            Some(emissivity) => CalibrationScope::RoiLocal { emissivity },
            None => CalibrationScope::Global,
        }
    }
}

fn check(ok: bool, what: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidCalibration(what()))
    }
}

pub(crate) fn validate_emissivity(emissivity: f64) -> Result<()> {
    check(emissivity > 0. && emissivity <= 1., || {
        format!("emissivity must be in (0, 1], got {}", emissivity)
    })
}

fn is_temperature(t: f64) -> bool {
    t.is_finite() && t > -CELSIUS_OFFSET
}

impl CalibrationParameters {
    /// Rejects non-physical values. Called whenever parameters are
    /// set, and once per engine call; never per sample.
    pub fn validate(&self) -> Result<()> {
        validate_emissivity(self.emissivity)?;
        check(
            self.object_distance.is_finite() && self.object_distance >= 0.,
            || format!("object distance must be >= 0, got {}", self.object_distance),
        )?;
        check(
            self.relative_humidity >= 0. && self.relative_humidity <= 100.,
            || format!("relative humidity must be in [0, 100], got {}", self.relative_humidity),
        )?;
        for (name, t) in [
            ("reflected apparent temperature", self.reflected_apparent_temperature),
            ("atmospheric temperature", self.atmospheric_temperature),
            ("IR window temperature", self.ir_window_temperature),
        ] {
            check(is_temperature(t), || format!("{} out of range: {}", name, t))?;
        }
        check(
            self.ir_window_transmission > 0. && self.ir_window_transmission <= 1.,
            || {
                format!(
                    "IR window transmission must be in (0, 1], got {}",
                    self.ir_window_transmission
                )
            },
        )?;
        if let Some(tau) = self.atmospheric_transmission {
            check(tau > 0. && tau <= 1., || {
                format!("atmospheric transmission must be in (0, 1], got {}", tau)
            })?;
        }
        let p = &self.planck;
        check(
            [p.r1, p.r2, p.b].iter().all(|v| v.is_finite() && *v != 0.)
                && p.f.is_finite()
                && p.o.is_finite(),
            || format!("Planck constants must be finite with R1, R2, B non-zero: {:?}", p),
        )?;
        check(
            self.alignment.scale.is_finite() && self.alignment.scale > 0.,
            || format!("alignment scale must be > 0, got {}", self.alignment.scale),
        )?;
        Ok(())
    }

    /// Copies the user-editable environment of `other`, keeping this
    /// camera's Planck constants and alignment.
    pub fn with_environment_of(&self, other: &CalibrationParameters) -> CalibrationParameters {
        CalibrationParameters {
            planck: self.planck,
            alignment: self.alignment,
            ..other.clone()
        }
    }

    fn scoped_emissivity(&self, scope: CalibrationScope) -> Result<f64> {
        match scope {
            CalibrationScope::Global => Ok(self.emissivity),
            CalibrationScope::RoiLocal { emissivity } => {
                validate_emissivity(emissivity)?;
                Ok(emissivity)
            }
        }
    }

    /// Transmission attenuating the signal over half the object
    /// distance; the window is assumed to sit midway. Always one
    /// unless the Thermimage model is selected.
    pub fn atmospheric_transmission(&self) -> f64 {
        let (alpha_1, alpha_2, beta_1, beta_2, x) = match self.atmosphere {
            AtmosphereModel::Thermimage {
                alpha_1,
                alpha_2,
                beta_1,
                beta_2,
                x,
            } => (alpha_1, alpha_2, beta_1, beta_2, x),
            AtmosphereModel::Additive { .. } | AtmosphereModel::Ignored => return 1.,
        };
        if let Some(tau) = self.atmospheric_transmission {
            return tau;
        }

        // h2o<-(RH/100)*exp(1.5587+0.06939*(ATemp)-0.00027816*(ATemp)^2+0.00000068455*(ATemp)^3)
        const ATMOSPHERIC_SERIES: [f64; 4] = [1.5587, 0.06939, -0.00027816, 0.00000068455];
        let h2o = (self.relative_humidity / 100.)
            * power_series_at(&ATMOSPHERIC_SERIES, self.atmospheric_temperature).exp();
        let h2o_sqrt = h2o.sqrt();

        // tau1<-ATX*exp(-sqrt(OD/2)*(ATA1+ATB1*sqrt(h2o)))
        //   +(1-ATX)*exp(-sqrt(OD/2)*(ATA2+ATB2*sqrt(h2o)))
        let dist_factor = (self.object_distance / 2.).sqrt();
        x * (-dist_factor * (alpha_1 + beta_1 * h2o_sqrt)).exp()
            + (1. - x) * (-dist_factor * (alpha_2 + beta_2 * h2o_sqrt)).exp()
    }

    /// Offset in °C added after the Planck inversion. Zero unless
    /// the additive model is selected.
    pub fn atmospheric_offset(&self) -> f64 {
        match self.atmosphere {
            AtmosphereModel::Additive {
                temperature,
                transmission,
                humidity,
            } => {
                let tau = self
                    .atmospheric_transmission
                    .unwrap_or(DEFAULT_ATMOSPHERIC_TRANSMISSION);
                temperature * (self.atmospheric_temperature - 20.)
                    + transmission * (1. - tau)
                    + humidity * (self.relative_humidity - 50.)
            }
            AtmosphereModel::Thermimage { .. } | AtmosphereModel::Ignored => 0.,
        }
    }

    /// Affine map from measured raw count to the raw count of the
    /// object alone.
    fn raw_transform(&self, emissivity: f64) -> impl Fn(f64) -> f64 + Send + Sync {
        let planck = self.planck;
        let tau = self.atmospheric_transmission();
        let irt = self.ir_window_transmission;

        //   emiss.wind<-1-IRT
        //   refl.wind<-0 # anti-reflective coating on window
        let emiss_wind = 1. - irt;
        let refl_wind = 0.;

        //   raw.refl1.attn<-(1-E)/E*raw.refl1
        let refl = planck.temp_to_raw(self.reflected_apparent_temperature);
        let refl1_attn = (1. - emissivity) / emissivity * refl;

        //   raw.atm1.attn<-(1-tau1)/E/tau1*raw.atm1
        let atm = planck.temp_to_raw(self.atmospheric_temperature);
        let atm1_attn = (1. - tau) / tau / emissivity * atm;

        //   raw.wind.attn<-emiss.wind/E/tau1/IRT*raw.wind
        let wind = planck.temp_to_raw(self.ir_window_temperature);
        let wind_attn = emiss_wind / emissivity / tau / irt * wind;

        //   raw.refl2.attn<-refl.wind/E/tau1/IRT*raw.refl2
        let refl2_attn = refl_wind / emissivity / tau / irt * refl;

        //   raw.atm2.attn<-(1-tau2)/E/tau1/IRT/tau2*raw.atm2
        let atm2_attn = (1. - tau) / emissivity / tau / irt / tau * atm;

        let coeffs = [
            -atm1_attn - atm2_attn - wind_attn - refl1_attn - refl2_attn,
            1. / emissivity / tau / irt / tau,
        ];

        move |raw| power_series_at(&coeffs, raw)
    }

    /// Per-sample conversion from raw count to °C for `scope`.
    pub fn temperature_transform(
        &self,
        scope: CalibrationScope,
    ) -> Result<impl Fn(f64) -> f64 + Send + Sync> {
        self.validate()?;
        let emissivity = self.scoped_emissivity(scope)?;
        let planck = self.planck;
        let t = self.raw_transform(emissivity);
        let offset = self.atmospheric_offset();
        Ok(move |raw| planck.raw_to_temp(t(raw)) + offset)
    }

    pub fn raw_to_temp(&self, scope: CalibrationScope, raw: f64) -> Result<f64> {
        Ok(self.temperature_transform(scope)?(raw))
    }
}

#[inline]
fn power_series_at(coeffs: &[f64], x: f64) -> f64 {
    let mut pow = 1.;
    let mut sum = 0.;
    for coeff in coeffs.iter() {
        sum += pow * coeff;
        pow *= x;
    }
    sum
}

/// Grid of temperatures in °C derived from an [`IntensityMatrix`].
///
/// Samples outside the Planck curve's domain are `NaN`.
#[derive(Clone, Debug, PartialEq)]
pub struct TemperatureMatrix {
    values: Array2<f64>,
}

impl TemperatureMatrix {
    pub fn width(&self) -> usize {
        self.values.ncols()
    }

    pub fn height(&self) -> usize {
        self.values.nrows()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn get(&self, x: usize, y: usize) -> Option<f64> {
        self.values.get((y, x)).copied()
    }

    /// Minimum and maximum over the finite values, `None` if there
    /// are none.
    pub fn range(&self) -> Option<(f64, f64)> {
        self.values
            .iter()
            .copied()
            .filter(|t| t.is_finite())
            .fold(None, |acc, t| match acc {
                None => Some((t, t)),
                Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
            })
    }
}

/// Converts every sample of `intensity`.
pub fn temperature_matrix(
    intensity: &IntensityMatrix,
    calibration: &CalibrationParameters,
) -> Result<TemperatureMatrix> {
    let t = calibration.temperature_transform(CalibrationScope::Global)?;
    debug!(
        width = intensity.width(),
        height = intensity.height(),
        "computing temperature matrix"
    );
    let values = Zip::from(intensity.view()).par_map_collect(|&raw| t(raw as f64));
    Ok(TemperatureMatrix { values })
}

/// Converts only the member pixels of `mask`, in the mask's pixel
/// order. Used for ROI-local emissivity.
pub fn masked_temperatures(
    intensity: &IntensityMatrix,
    calibration: &CalibrationParameters,
    scope: CalibrationScope,
    mask: &Mask,
) -> Result<Vec<f64>> {
    let t = calibration.temperature_transform(scope)?;
    Ok(mask
        .pixels()
        .filter_map(|(x, y)| intensity.get(x, y))
        .map(|raw| t(raw as f64))
        .collect())
}

/// Temperature of one pixel, `None` outside the matrix.
pub fn temperature_at(
    intensity: &IntensityMatrix,
    calibration: &CalibrationParameters,
    scope: CalibrationScope,
    x: usize,
    y: usize,
) -> Result<Option<f64>> {
    let t = calibration.temperature_transform(scope)?;
    Ok(intensity.get(x, y).map(|raw| t(raw as f64)))
}
