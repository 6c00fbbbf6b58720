//! Reduction of ROI temperatures to summary statistics.
use serde_derive::*;

use super::Mask;
use crate::temperature::TemperatureMatrix;

/// Summary of the defined temperatures of a region, in °C.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation.
    pub std_dev: f64,
}

/// Statistics of one ROI against one temperature matrix.
///
/// `summary` is `None` when the region has no pixel with a defined
/// temperature: an empty or degenerate ROI, or one lying entirely
/// where the calibration is undefined.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoiStatistics {
    pub pixel_count: usize,
    /// Member pixels with a finite temperature.
    pub valid_count: usize,
    pub summary: Option<Summary>,
}

impl RoiStatistics {
    pub fn no_data(pixel_count: usize) -> Self {
        RoiStatistics {
            pixel_count,
            valid_count: 0,
            summary: None,
        }
    }

    /// Reduces the temperatures of `pixel_count` member pixels.
    /// Non-finite values are excluded from the summary.
    pub fn from_values<I>(pixel_count: usize, values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return Self::no_data(pixel_count);
        }
        values.sort_by(f64::total_cmp);

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        RoiStatistics {
            pixel_count,
            valid_count: values.len(),
            summary: Some(Summary {
                min: values[0],
                max: values[values.len() - 1],
                mean,
                median: median_of_sorted(&values).unwrap_or(f64::NAN),
                std_dev: variance.sqrt(),
            }),
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.summary.map(|s| s.min)
    }

    pub fn max(&self) -> Option<f64> {
        self.summary.map(|s| s.max)
    }

    pub fn mean(&self) -> Option<f64> {
        self.summary.map(|s| s.mean)
    }

    pub fn median(&self) -> Option<f64> {
        self.summary.map(|s| s.median)
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.summary.map(|s| s.std_dev)
    }
}

/// Middle value of an ascending slice; the mean of the two central
/// values for even lengths.
pub fn median_of_sorted(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.),
    }
}

/// Statistics of `temperatures` over the pixels of `mask`.
pub fn roi_statistics(temperatures: &TemperatureMatrix, mask: &Mask) -> RoiStatistics {
    RoiStatistics::from_values(
        mask.pixel_count(),
        mask.pixels().filter_map(|(x, y)| temperatures.get(x, y)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        raw::IntensityMatrix,
        roi::{rasterize, Point, RoiGeometry},
        temperature::{temperature_matrix, CalibrationParameters},
    };
    use anyhow::Result;

    #[test]
    fn median_even_and_odd() {
        assert_eq!(median_of_sorted(&[10.0, 20.0, 30.0, 40.0]), Some(25.0));
        assert_eq!(median_of_sorted(&[10.0, 20.0, 30.0]), Some(20.0));
        assert_eq!(median_of_sorted(&[]), None);

        let stats = RoiStatistics::from_values(4, vec![40.0, 10.0, 30.0, 20.0]);
        assert_eq!(stats.median(), Some(25.0));
        assert_eq!(stats.mean(), Some(25.0));
        assert_eq!(stats.min(), Some(10.0));
        assert_eq!(stats.max(), Some(40.0));
    }

    #[test]
    fn std_dev_is_population() {
        let stats = RoiStatistics::from_values(4, vec![2.0, 4.0, 4.0, 6.0]);
        assert_eq!(stats.std_dev(), Some(2.0_f64.sqrt()));
    }

    #[test]
    fn empty_region_has_no_data() {
        let stats = RoiStatistics::from_values(0, Vec::new());
        assert_eq!(stats, RoiStatistics::no_data(0));
        assert_eq!(stats.mean(), None);
    }

    #[test]
    fn nan_is_excluded_not_averaged() {
        let stats = RoiStatistics::from_values(3, vec![f64::NAN, 1.0, 3.0]);
        assert_eq!(stats.pixel_count, 3);
        assert_eq!(stats.valid_count, 2);
        assert_eq!(stats.mean(), Some(2.0));

        let all_nan = RoiStatistics::from_values(2, vec![f64::NAN, f64::NAN]);
        assert_eq!(all_nan.summary, None);
        assert_eq!(all_nan.pixel_count, 2);
    }

    #[test]
    fn full_rectangle_matches_whole_matrix() -> Result<()> {
        let samples = (0..48u16).map(|i| 15000 + 97 * i).collect();
        let intensity = IntensityMatrix::from_shape_vec(8, 6, samples)?;
        let temps = temperature_matrix(&intensity, &CalibrationParameters::default())?;

        let whole = RoiStatistics::from_values(48, temps.view().iter().copied());
        let mask = rasterize(
            &RoiGeometry::Rectangle {
                a: Point::new(0., 0.),
                b: Point::new(7., 5.),
            },
            8,
            6,
        );
        assert_eq!(roi_statistics(&temps, &mask), whole);
        assert_eq!(roi_statistics(&temps, &Mask::full(8, 6)), whole);
        Ok(())
    }
}
