//! # Quality Scoring
//!
//! Weighted 0-100 scores computed from named checks. A score maps to a
//! letter grade and a pass/warn/fail status against configurable
//! thresholds. Squads gate progression and report through these.

use crate::error::QualityError;
use serde::{Deserialize, Serialize};

/// One named, weighted measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCheck {
    pub name: String,
    pub score: f64,
    pub weight: f64,
    pub max: f64,
}

impl QualityCheck {
    pub fn new(name: impl Into<String>, score: f64, weight: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            score,
            weight,
            max,
        }
    }

    /// A check whose maximum equals its weight, the usual shape.
    pub fn weighted(name: impl Into<String>, score: f64, weight: f64) -> Self {
        Self::new(name, score, weight, weight)
    }

    fn validate(&self) -> Result<(), QualityError> {
        let finite = self.score.is_finite() && self.max.is_finite() && self.weight.is_finite();
        if !finite || self.max <= 0.0 || self.weight < 0.0 || self.score < 0.0 || self.score > self.max
        {
            return Err(QualityError::InvalidCheck {
                name: self.name.clone(),
                score: self.score,
                max: self.max,
                weight: self.weight,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(overall: u32) -> Self {
        match overall {
            90.. => Grade::A,
            80..=89 => Grade::B,
            70..=79 => Grade::C,
            60..=69 => Grade::D,
            _ => Grade::F,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityStatus {
    Pass,
    Warn,
    Fail,
}

impl QualityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityStatus::Pass => "pass",
            QualityStatus::Warn => "warn",
            QualityStatus::Fail => "fail",
        }
    }
}

/// Status cut-offs. `warn` never exceeds `pass` once sanitized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub pass: u32,
    pub warn: u32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self { pass: 85, warn: 70 }
    }
}

impl QualityThresholds {
    pub fn new(pass: u32, warn: u32) -> Self {
        Self { pass, warn }.sanitized()
    }

    pub fn sanitized(self) -> Self {
        let pass = self.pass.min(100);
        Self {
            pass,
            warn: self.warn.min(pass),
        }
    }

    pub fn status(&self, overall: u32) -> QualityStatus {
        if overall >= self.pass {
            QualityStatus::Pass
        } else if overall >= self.warn {
            QualityStatus::Warn
        } else {
            QualityStatus::Fail
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub overall: u32,
    pub grade: Grade,
    pub status: QualityStatus,
    pub checks: Vec<QualityCheck>,
    #[serde(default)]
    pub risks: Vec<String>,
}

impl QualityScore {
    pub fn passed(&self) -> bool {
        self.status == QualityStatus::Pass
    }

    pub fn check(&self, name: &str) -> Option<&QualityCheck> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Compute the weighted score for a set of checks.
///
/// `overall = round(100 * sum(score / max * weight) / sum(weight))`, with
/// halves rounded up.
pub fn score(
    checks: Vec<QualityCheck>,
    thresholds: QualityThresholds,
    risks: Vec<String>,
) -> Result<QualityScore, QualityError> {
    for check in &checks {
        check.validate()?;
    }

    let total_weight: f64 = checks.iter().map(|c| c.weight).sum();
    if total_weight <= 0.0 {
        return Err(QualityError::ZeroWeight);
    }

    let weighted: f64 = checks.iter().map(|c| c.score / c.max * c.weight).sum();
    let overall = ((100.0 * weighted / total_weight) + 0.5).floor().clamp(0.0, 100.0) as u32;

    Ok(QualityScore {
        overall,
        grade: Grade::from_score(overall),
        status: thresholds.sanitized().status(overall),
        checks,
        risks,
    })
}

/// Full marks while within the rework budget, minus `penalty` per excess
/// iteration, floored at zero.
pub fn rework_control(iterations: u32, max_iterations: u32, penalty: u32, weight: f64) -> QualityCheck {
    let excess = iterations.saturating_sub(max_iterations) as f64;
    let value = (weight - excess * penalty as f64).max(0.0);
    QualityCheck::weighted("rework_control", value, weight)
}

/// Pass rate scaled to the weight. No signal counts as full marks.
pub fn pass_rate(name: &str, passed: u32, total: u32, weight: f64) -> QualityCheck {
    if total == 0 {
        return QualityCheck::weighted(name, weight, weight);
    }
    let rate = (passed.min(total) as f64) / (total as f64);
    QualityCheck::weighted(name, (rate * weight).round(), weight)
}

/// Issue density: full marks less 5 per critical and 2 per major finding.
pub fn issue_density(name: &str, critical: usize, major: usize, weight: f64) -> QualityCheck {
    let value = (weight - 5.0 * critical as f64 - 2.0 * major as f64).max(0.0);
    QualityCheck::weighted(name, value, weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(values: &[(f64, f64)]) -> Vec<QualityCheck> {
        values
            .iter()
            .enumerate()
            .map(|(i, (score, weight))| QualityCheck::weighted(format!("c{i}"), *score, *weight))
            .collect()
    }

    #[test]
    fn test_perfect_and_empty_scores() {
        let full = score(checks(&[(25.0, 25.0), (15.0, 15.0)]), QualityThresholds::default(), vec![])
            .unwrap();
        assert_eq!(full.overall, 100);
        assert_eq!(full.grade, Grade::A);
        assert_eq!(full.status, QualityStatus::Pass);

        let zero = score(checks(&[(0.0, 25.0), (0.0, 15.0)]), QualityThresholds::default(), vec![])
            .unwrap();
        assert_eq!(zero.overall, 0);
        assert_eq!(zero.grade, Grade::F);
        assert_eq!(zero.status, QualityStatus::Fail);
    }

    #[test]
    fn test_weighted_rounding() {
        // (17/25*25 + 15/15*15) / 40 = 0.8 -> 80
        let s = score(checks(&[(17.0, 25.0), (15.0, 15.0)]), QualityThresholds::default(), vec![])
            .unwrap();
        assert_eq!(s.overall, 80);
        assert_eq!(s.grade, Grade::B);
        assert_eq!(s.status, QualityStatus::Warn);

        // 1/8 of 100 = 12.5 rounds up
        let half = score(
            vec![QualityCheck::new("half", 1.0, 1.0, 8.0)],
            QualityThresholds::default(),
            vec![],
        )
        .unwrap();
        assert_eq!(half.overall, 13);
    }

    #[test]
    fn test_overall_stays_in_bounds() {
        for a in 0..=10 {
            for b in 0..=10 {
                let s = score(
                    vec![
                        QualityCheck::new("a", a as f64, 3.0, 10.0),
                        QualityCheck::new("b", b as f64, 0.0, 10.0),
                        QualityCheck::new("c", 5.0, 7.0, 10.0),
                    ],
                    QualityThresholds::default(),
                    vec![],
                )
                .unwrap();
                assert!(s.overall <= 100);
            }
        }
    }

    #[test]
    fn test_grade_is_monotonic() {
        let mut previous = Grade::F;
        for overall in 0..=100 {
            let grade = Grade::from_score(overall);
            assert!(grade <= previous, "grade regressed at {overall}");
            previous = grade;
        }
        assert_eq!(Grade::from_score(90), Grade::A);
        assert_eq!(Grade::from_score(89), Grade::B);
        assert_eq!(Grade::from_score(60), Grade::D);
        assert_eq!(Grade::from_score(59), Grade::F);
    }

    #[test]
    fn test_zero_weight_rejected() {
        let err = score(checks(&[(0.0, 0.0)]), QualityThresholds::default(), vec![]).unwrap_err();
        assert_eq!(err, QualityError::ZeroWeight);
        let err = score(vec![], QualityThresholds::default(), vec![]).unwrap_err();
        assert_eq!(err, QualityError::ZeroWeight);
    }

    #[test]
    fn test_out_of_range_check_rejected() {
        let over = vec![QualityCheck::new("over", 11.0, 1.0, 10.0)];
        assert!(matches!(
            score(over, QualityThresholds::default(), vec![]),
            Err(QualityError::InvalidCheck { .. })
        ));
        let negative = vec![QualityCheck::new("neg", -1.0, 1.0, 10.0)];
        assert!(score(negative, QualityThresholds::default(), vec![]).is_err());
        let no_max = vec![QualityCheck::new("nomax", 0.0, 1.0, 0.0)];
        assert!(score(no_max, QualityThresholds::default(), vec![]).is_err());
    }

    #[test]
    fn test_thresholds_are_configurable() {
        for (pass, warn, overall, expected) in [
            (85, 70, 85, QualityStatus::Pass),
            (85, 70, 84, QualityStatus::Warn),
            (85, 70, 69, QualityStatus::Fail),
            (95, 90, 92, QualityStatus::Warn),
            (60, 40, 61, QualityStatus::Pass),
            (50, 80, 60, QualityStatus::Pass),
        ] {
            assert_eq!(QualityThresholds::new(pass, warn).status(overall), expected);
        }
    }

    #[test]
    fn test_rework_control_penalty() {
        assert_eq!(rework_control(2, 3, 5, 15.0).score, 15.0);
        assert_eq!(rework_control(4, 3, 5, 15.0).score, 10.0);
        assert_eq!(rework_control(9, 3, 5, 15.0).score, 0.0);
        assert_eq!(rework_control(4, 3, 10, 15.0).score, 5.0);
    }

    #[test]
    fn test_pass_rate_and_density() {
        assert_eq!(pass_rate("test_coverage", 0, 0, 20.0).score, 20.0);
        assert_eq!(pass_rate("test_coverage", 3, 4, 20.0).score, 15.0);
        assert_eq!(issue_density("critic_flow", 0, 0, 20.0).score, 20.0);
        assert_eq!(issue_density("critic_flow", 1, 2, 20.0).score, 11.0);
        assert_eq!(issue_density("critic_flow", 5, 0, 20.0).score, 0.0);
    }
}
