use serde::Serialize;
use serde_json::json;

/// Grades live on the institutional 0-5 scale; arbitrary max scores are
/// normalized onto it before weighting.
pub const GRADE_SCALE_MAX: f64 = 5.0;
pub const PASS_GRADE: f64 = 3.0;

/// Absolute tolerance for the activity percentage-sum invariant.
pub const PERCENT_TOLERANCE: f64 = 0.01;

/// 2-decimal rounding used for every reported grade.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One activity as seen by the grade engine. `score` stays None until the
/// student submits a mark for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityGrade {
    pub name: String,
    pub percentage: f64,
    pub score: Option<f64>,
    pub max_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioProjections {
    pub pessimistic: f64,
    pub realistic: f64,
    pub optimistic: f64,
}

/// Every derived field of a grade record, computed in one place from the full
/// activity set so create/update/remove paths cannot drift apart.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed_percentage: f64,
    pub remaining_percentage: f64,
    pub current_weighted_grade: f64,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_grade: Option<f64>,
    pub projected_grade: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_grade_for_target: Option<f64>,
    pub scenarios: ScenarioProjections,
}

pub fn percentage_sum(percentages: &[f64]) -> f64 {
    percentages.iter().sum()
}

/// Percentage-sum invariant: every saved plan's activities sum to 100 within
/// PERCENT_TOLERANCE. The error reports the computed sum so callers can fix
/// the discrepancy.
pub fn check_percentage_sum(percentages: &[f64]) -> Result<(), CalcError> {
    let sum = percentage_sum(percentages);
    if (sum - 100.0).abs() > PERCENT_TOLERANCE {
        return Err(CalcError::new(
            "validation_failed",
            format!("activity percentages must sum to 100, got {}", round2(sum)),
        )
        .with_details(json!({ "computedSum": round2(sum) })));
    }
    Ok(())
}

/// Shape validation for a single activity definition.
pub fn check_activity(name: &str, percentage: f64, max_score: f64) -> Result<(), CalcError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CalcError::new(
            "validation_failed",
            "activity name must not be empty",
        ));
    }
    if trimmed.chars().count() > 100 {
        return Err(CalcError::new(
            "validation_failed",
            "activity name must be at most 100 characters",
        ));
    }
    if !(0.0..=100.0).contains(&percentage) {
        return Err(CalcError::new(
            "validation_failed",
            format!("activity percentage must be in [0, 100], got {}", percentage),
        ));
    }
    if max_score <= 0.0 {
        return Err(CalcError::new(
            "validation_failed",
            format!("maxScore must be positive, got {}", max_score),
        ));
    }
    Ok(())
}

pub fn check_score(score: f64, max_score: f64) -> Result<(), CalcError> {
    if score < 0.0 || score > max_score {
        return Err(CalcError::new(
            "validation_failed",
            format!("score must be in [0, {}], got {}", max_score, score),
        )
        .with_details(json!({ "min": 0.0, "max": max_score, "score": score })));
    }
    Ok(())
}

pub fn check_target_grade(target: f64) -> Result<(), CalcError> {
    if !(0.0..=GRADE_SCALE_MAX).contains(&target) {
        return Err(CalcError::new(
            "validation_failed",
            format!("targetGrade must be in [0, {}], got {}", GRADE_SCALE_MAX, target),
        ));
    }
    Ok(())
}

fn clamp_grade(x: f64) -> f64 {
    x.clamp(0.0, GRADE_SCALE_MAX)
}

/// Normalized 0-5 grade of one scored activity.
fn normalized(score: f64, max_score: f64) -> f64 {
    if max_score > 0.0 {
        GRADE_SCALE_MAX * score / max_score
    } else {
        0.0
    }
}

pub fn compute_progress(activities: &[ActivityGrade], target_grade: Option<f64>) -> Progress {
    let mut completed = 0.0_f64;
    let mut earned = 0.0_f64;
    let mut scored_sum = 0.0_f64;
    let mut scored_count = 0_usize;

    for a in activities {
        let Some(score) = a.score else {
            continue;
        };
        let grade = normalized(score, a.max_score);
        completed += a.percentage;
        earned += grade * (a.percentage / 100.0);
        scored_sum += grade;
        scored_count += 1;
    }

    let completed = completed.min(100.0);
    let remaining = 100.0 - completed;
    let earned = clamp_grade(earned);
    let current = round2(earned);
    let is_complete = completed >= 100.0;
    let final_grade = if is_complete { Some(current) } else { None };

    let projected = match target_grade {
        Some(t) if !is_complete && remaining > 0.0 => t,
        _ => current,
    };

    let required = match target_grade {
        Some(target) if !is_complete && remaining > 0.0 => {
            let current_points = current * (completed / 100.0) * GRADE_SCALE_MAX;
            let raw =
                ((target * GRADE_SCALE_MAX - current_points) / (remaining / 100.0)) / GRADE_SCALE_MAX;
            Some(round2(clamp_grade(raw)))
        }
        _ => None,
    };

    // The realistic scenario continues at the current per-activity average; with
    // nothing scored yet it falls back to the 3.0 midpoint.
    let current_average = if scored_count > 0 {
        scored_sum / scored_count as f64
    } else {
        PASS_GRADE
    };
    let scenario = |hypothetical: f64| round2(clamp_grade(earned + hypothetical * (remaining / 100.0)));
    let scenarios = ScenarioProjections {
        pessimistic: scenario(PASS_GRADE),
        realistic: scenario(current_average),
        optimistic: scenario(GRADE_SCALE_MAX),
    };

    Progress {
        completed_percentage: completed,
        remaining_percentage: remaining,
        current_weighted_grade: current,
        is_complete,
        final_grade,
        projected_grade: projected,
        required_grade_for_target: required,
        scenarios,
    }
}

/// Status implied by the computed progress. The manual `withdrawn` state is
/// handled by the caller and never produced here.
pub fn derived_status(progress: &Progress) -> &'static str {
    if !progress.is_complete {
        return "in_progress";
    }
    match progress.final_grade {
        Some(g) if g >= PASS_GRADE => "passed",
        _ => "failed",
    }
}
