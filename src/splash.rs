//! Splash Policies
//!
//! A write to a consolidated coordinate is not stored; it is redistributed
//! onto the weighted base cells of the coordinate. Three policies:
//!
//! - **Equal**: with `n = sum(w_i)`, each base cell receives `X / n * w_i`.
//! - **Proportional**: every base cell is scaled by `X / oldSum`, preserving
//!   the relative distribution; requires a non-zero current sum.
//! - **Add**: each base cell receives `+delta * w_i / n`.
//!
//! Splash size is policed by three cell-count limits: under `allow` the
//! splash runs silently, above `warn` it logs, above `reject` it fails.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::ident::{IdentifierType, Key};

/// Splash policy selected per write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplashMode {
    /// reject writes to consolidated coordinates
    Disabled,
    /// distribute the value across base cells by weight share
    Equal,
    /// rescale the existing distribution to hit the new total
    Proportional,
    /// distribute a delta across base cells by weight share
    Add,
}

/// The three tunable cell-count limits, `allow < warn < reject`.
#[derive(Debug, Clone, Copy)]
pub struct SplashLimits {
    pub allow: f64,
    pub warn: f64,
    pub reject: f64,
}

/// Compute the base-cell writes for a splash.
///
/// `base` is the weighted base expansion of the consolidated key; `current`
/// reads the present stored value of a base cell.
pub fn splash_edits(
    mode: SplashMode,
    value: f64,
    base: &[(Key, f64)],
    current: impl Fn(&[IdentifierType]) -> f64,
    limits: &SplashLimits,
) -> Result<Vec<(Key, f64)>> {
    let cells = base.len() as f64;
    if cells > limits.reject {
        return Err(EngineError::SplashRejected(format!(
            "{cells} base cells exceed the reject limit {}",
            limits.reject
        )));
    }
    if cells > limits.warn {
        warn!(cells, "large splash");
    } else if cells > limits.allow {
        debug!(cells, "splash above the silent limit");
    }

    let weight_sum: f64 = base.iter().map(|(_, w)| w).sum();
    match mode {
        SplashMode::Disabled => Err(EngineError::SplashRejected(
            "write to a consolidated coordinate with splashing disabled".to_string(),
        )),
        SplashMode::Equal => {
            if weight_sum == 0.0 {
                return Err(EngineError::SplashRejected(
                    "consolidation weights sum to zero".to_string(),
                ));
            }
            Ok(base
                .iter()
                .map(|(key, w)| (key.clone(), value / weight_sum * w))
                .collect())
        }
        SplashMode::Proportional => {
            let old_sum: f64 = base.iter().map(|(key, w)| current(key) * w).sum();
            if old_sum == 0.0 {
                return Err(EngineError::SplashRejected(
                    "proportional splash requires a non-zero current sum".to_string(),
                ));
            }
            let factor = value / old_sum;
            Ok(base
                .iter()
                .map(|(key, _)| (key.clone(), current(key) * factor))
                .collect())
        }
        SplashMode::Add => {
            if weight_sum == 0.0 {
                return Err(EngineError::SplashRejected(
                    "consolidation weights sum to zero".to_string(),
                ));
            }
            Ok(base
                .iter()
                .map(|(key, w)| (key.clone(), current(key) + value * w / weight_sum))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn limits() -> SplashLimits {
        SplashLimits {
            allow: 1000.0,
            warn: 10_000.0,
            reject: 100_000.0,
        }
    }

    fn unit_base(n: u32) -> Vec<(Key, f64)> {
        (0..n).map(|i| (vec![i], 1.0)).collect()
    }

    #[test]
    fn test_equal_splash() {
        let edits = splash_edits(SplashMode::Equal, 9.0, &unit_base(3), |_| 0.0, &limits()).unwrap();
        assert_eq!(
            edits,
            vec![(vec![0], 3.0), (vec![1], 3.0), (vec![2], 3.0)]
        );
    }

    #[test]
    fn test_equal_splash_weighted_share() {
        let base = vec![(vec![0], 2.0), (vec![1], 1.0)];
        let edits = splash_edits(SplashMode::Equal, 9.0, &base, |_| 0.0, &limits()).unwrap();
        // n = 3; cells receive X/n * w
        assert_eq!(edits, vec![(vec![0], 6.0), (vec![1], 3.0)]);
    }

    #[test]
    fn test_proportional_preserves_distribution() {
        let values: HashMap<Vec<u32>, f64> = [(vec![0], 1.0), (vec![1], 3.0)].into_iter().collect();
        let base = unit_base(2);
        let edits = splash_edits(
            SplashMode::Proportional,
            8.0,
            &base,
            |k| values.get(k).copied().unwrap_or(0.0),
            &limits(),
        )
        .unwrap();
        assert_eq!(edits, vec![(vec![0], 2.0), (vec![1], 6.0)]);
    }

    #[test]
    fn test_proportional_requires_nonzero_sum() {
        let result = splash_edits(SplashMode::Proportional, 8.0, &unit_base(2), |_| 0.0, &limits());
        assert!(matches!(result, Err(EngineError::SplashRejected(_))));
    }

    #[test]
    fn test_additive_delta_share() {
        let values: HashMap<Vec<u32>, f64> = [(vec![0], 1.0), (vec![1], 2.0)].into_iter().collect();
        let edits = splash_edits(
            SplashMode::Add,
            4.0,
            &unit_base(2),
            |k| values.get(k).copied().unwrap_or(0.0),
            &limits(),
        )
        .unwrap();
        assert_eq!(edits, vec![(vec![0], 3.0), (vec![1], 4.0)]);
    }

    #[test]
    fn test_disabled_rejects() {
        let result = splash_edits(SplashMode::Disabled, 1.0, &unit_base(1), |_| 0.0, &limits());
        assert!(matches!(result, Err(EngineError::SplashRejected(_))));
    }

    #[test]
    fn test_reject_limit() {
        let tight = SplashLimits {
            allow: 1.0,
            warn: 2.0,
            reject: 3.0,
        };
        let result = splash_edits(SplashMode::Equal, 1.0, &unit_base(5), |_| 0.0, &tight);
        assert!(matches!(result, Err(EngineError::SplashRejected(_))));
    }
}
