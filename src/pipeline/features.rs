//! Feature extraction
//!
//! Pure function of a window's pressure series. Vector order is fixed:
//! `[max, min, difference, average, variance, trend_slope, cavity_id]`.
//! The slope is rounded to 6 decimals, every other value to 3. `SixD` mode drops
//! `cavity_id` for models trained without it.

use serde::{Deserialize, Serialize};

use crate::acquisition::CycleWindow;
use crate::error::FeatureError;
use crate::link::ChannelId;

/// Feature vector layout expected by the model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureMode {
    /// All seven features
    #[default]
    #[serde(rename = "7d")]
    SevenD,
    /// Without the cavity id
    #[serde(rename = "6d")]
    SixD,
}

impl FeatureMode {
    /// Vector length
    pub fn len(self) -> usize {
        match self {
            FeatureMode::SevenD => 7,
            FeatureMode::SixD => 6,
        }
    }

    /// Feature names in vector order
    pub fn names(self) -> &'static [&'static str] {
        const NAMES: [&str; 7] = [
            "max",
            "min",
            "difference",
            "average",
            "variance",
            "trend_slope",
            "cavity_id",
        ];
        &NAMES[..self.len()]
    }
}

/// Summary statistics of one cycle's pressure series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Features {
    /// Highest pressure
    pub max: f64,
    /// Lowest pressure
    pub min: f64,
    /// `max - min`
    pub difference: f64,
    /// Mean pressure
    pub average: f64,
    /// Population variance
    pub variance: f64,
    /// Least-squares slope per sample
    pub trend_slope: f64,
    /// Channel number as a feature
    pub cavity_id: f64,
}

impl Features {
    /// Ordered model input for `mode`
    pub fn to_vector(&self, mode: FeatureMode) -> Vec<f64> {
        let all = [
            self.max,
            self.min,
            self.difference,
            self.average,
            self.variance,
            self.trend_slope,
            self.cavity_id,
        ];
        all[..mode.len()].to_vec()
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Compute features for a window
pub fn extract(window: &CycleWindow) -> Result<Features, FeatureError> {
    let pressures: Vec<f64> = window.pressures().collect();
    extract_series(&pressures, window.channel())
}

/// Compute features for a raw pressure series
pub fn extract_series(pressures: &[f64], cavity: ChannelId) -> Result<Features, FeatureError> {
    if pressures.len() < 2 {
        return Err(FeatureError::TooFewSamples(pressures.len()));
    }
    if pressures.iter().any(|p| !p.is_finite()) {
        return Err(FeatureError::NonFinite);
    }

    let n = pressures.len() as f64;
    let max = pressures.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = pressures.iter().copied().fold(f64::INFINITY, f64::min);
    let average = pressures.iter().sum::<f64>() / n;
    let variance = pressures.iter().map(|p| (p - average).powi(2)).sum::<f64>() / n;

    // Least-squares slope against the sample index
    let x_mean = (n - 1.0) / 2.0;
    let (sxy, sxx) = pressures
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(sxy, sxx), (i, p)| {
            let dx = i as f64 - x_mean;
            (sxy + dx * (p - average), sxx + dx * dx)
        });
    let trend_slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };

    Ok(Features {
        max: round_to(max, 3),
        min: round_to(min, 3),
        difference: round_to(max - min, 3),
        average: round_to(average, 3),
        variance: round_to(variance, 3),
        trend_slope: round_to(trend_slope, 6),
        cavity_id: f64::from(cavity),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_decay() {
        let series: Vec<f64> = (0..10).map(|i| 650.0 - 0.5 * i as f64).collect();
        let f = extract_series(&series, 4).unwrap();
        assert_eq!(f.max, 650.0);
        assert_eq!(f.min, 645.5);
        assert_eq!(f.difference, 4.5);
        assert_eq!(f.average, 647.75);
        assert_eq!(f.variance, 2.063);
        assert_eq!(f.trend_slope, -0.5);
        assert_eq!(f.cavity_id, 4.0);
    }

    #[test]
    fn test_constant_series_has_zero_spread() {
        let f = extract_series(&[700.0; 5], 0).unwrap();
        assert_eq!(f.variance, 0.0);
        assert_eq!(f.trend_slope, 0.0);
        assert_eq!(f.difference, 0.0);
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert_eq!(extract_series(&[1.0], 0), Err(FeatureError::TooFewSamples(1)));
        assert_eq!(
            extract_series(&[1.0, f64::INFINITY], 0),
            Err(FeatureError::NonFinite)
        );
    }

    #[test]
    fn test_vector_modes() {
        let f = extract_series(&[3.0, 1.0], 9).unwrap();
        assert_eq!(f.to_vector(FeatureMode::SevenD).len(), 7);
        assert_eq!(f.to_vector(FeatureMode::SevenD)[6], 9.0);
        assert_eq!(f.to_vector(FeatureMode::SixD), vec![3.0, 1.0, 2.0, 2.0, 1.0, -2.0]);
        assert_eq!(FeatureMode::SixD.names().last(), Some(&"trend_slope"));
    }
}
