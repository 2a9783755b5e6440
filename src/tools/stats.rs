//! Statistics over small numeric series supplied by the model.
//!
//! Series arrive either as comma-separated strings (`"1,2,3"`) or as JSON
//! arrays of numbers. Results are keyed `Feature_1`, `Feature_2`, ... in the
//! order the comparison series were given.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::Tool;

const DEFAULT_QUANTILES: [f64; 3] = [0.25, 0.5, 0.75];

/// Parse a series from a comma-separated string or a JSON number array.
fn parse_series(value: &Value, what: &str) -> anyhow::Result<Vec<f64>> {
    match value {
        Value::String(s) => s
            .split(',')
            .map(|item| {
                let item = item.trim();
                item.parse::<f64>().map_err(|_| {
                    anyhow::anyhow!("could not convert '{}' in {} to a number", item, what)
                })
            })
            .collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_f64()
                    .or_else(|| item.as_str().and_then(|s| s.trim().parse().ok()))
                    .ok_or_else(|| anyhow::anyhow!("non-numeric value {} in {}", item, what))
            })
            .collect(),
        Value::Null => Err(anyhow::anyhow!("Missing '{}' argument", what)),
        other => Err(anyhow::anyhow!(
            "{} must be a comma-separated string, got {}",
            what,
            other
        )),
    }
}

/// Parse the base series plus the list of comparison series, checking lengths.
fn parse_inputs(args: &Value) -> anyhow::Result<(Vec<f64>, Vec<Vec<f64>>)> {
    let base = parse_series(&args["base_feature"], "base_feature")?;
    let features = match &args["features"] {
        Value::Array(items) if !items.is_empty() => items,
        Value::Array(_) => return Err(anyhow::anyhow!("features cannot be empty")),
        Value::Null => return Err(anyhow::anyhow!("Missing 'features' argument")),
        _ => return Err(anyhow::anyhow!("features must be a list of series")),
    };

    let mut parsed = Vec::with_capacity(features.len());
    for (idx, feature) in features.iter().enumerate() {
        let series = parse_series(feature, &format!("feature {}", idx))?;
        if series.len() != base.len() {
            return Err(anyhow::anyhow!(
                "Feature at index {} does not have the same number of elements as the base feature.",
                idx
            ));
        }
        parsed.push(series);
    }
    Ok((base, parsed))
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Pearson correlation. `None` when either series is constant or too short.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let (mx, my) = (mean(x), mean(y));
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (a, b) in x.iter().zip(y) {
        let (dx, dy) = (a - mx, b - my);
        cov += dx * dy;
        vx += dx * dx;
        vy += dy * dy;
    }
    if vx == 0.0 || vy == 0.0 {
        return None;
    }
    Some((cov / (vx.sqrt() * vy.sqrt())).clamp(-1.0, 1.0))
}

fn check_loss(residual: f64, tau: f64) -> f64 {
    if residual >= 0.0 {
        tau * residual
    } else {
        (tau - 1.0) * residual
    }
}

/// Best intercept for a fixed slope and the resulting total check loss.
///
/// The minimizing intercept is the `tau`-quantile of the residuals.
fn profile_loss(x: &[f64], y: &[f64], slope: f64, tau: f64) -> (f64, f64) {
    let mut residuals: Vec<f64> = x.iter().zip(y).map(|(a, b)| b - slope * a).collect();
    residuals.sort_by(f64::total_cmp);
    let n = residuals.len();
    let rank = ((tau * n as f64).ceil() as usize).clamp(1, n);
    let intercept = residuals[rank - 1];
    let loss = residuals
        .iter()
        .map(|r| check_loss(r - intercept, tau))
        .sum();
    (intercept, loss)
}

/// Range that contains every pairwise slope of the data.
///
/// Any pairwise slope is a weighted average of slopes between neighbouring
/// distinct `x` values, so scanning neighbours is enough.
fn slope_bounds(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let mut points: Vec<(f64, f64)> = x.iter().copied().zip(y.iter().copied()).collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    // (x, min y, max y) per distinct x
    let mut groups: Vec<(f64, f64, f64)> = Vec::new();
    for (px, py) in points {
        match groups.last_mut() {
            Some(last) if last.0 == px => {
                last.1 = last.1.min(py);
                last.2 = last.2.max(py);
            }
            _ => groups.push((px, py, py)),
        }
    }
    if groups.len() < 2 {
        return None;
    }

    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for pair in groups.windows(2) {
        let (left, right) = (pair[0], pair[1]);
        let dx = right.0 - left.0;
        lo = lo.min((right.1 - left.2) / dx);
        hi = hi.max((right.2 - left.1) / dx);
    }
    Some((lo, hi))
}

/// Fit `y = intercept + slope * x` minimizing the check loss at quantile `tau`.
///
/// The loss profiled over the intercept is convex in the slope, so a
/// golden-section search over the pairwise-slope range finds the optimum.
/// Returns `[intercept, slope]`.
pub fn quantile_regression(x: &[f64], y: &[f64], tau: f64) -> [f64; 2] {
    let Some((mut lo, mut hi)) = slope_bounds(x, y) else {
        let (intercept, _) = profile_loss(x, y, 0.0, tau);
        return [intercept, 0.0];
    };

    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let mut c = hi - ratio * (hi - lo);
    let mut d = lo + ratio * (hi - lo);
    let mut fc = profile_loss(x, y, c, tau).1;
    let mut fd = profile_loss(x, y, d, tau).1;
    for _ in 0..200 {
        if (hi - lo).abs() <= 1e-12 * (1.0 + lo.abs().max(hi.abs())) {
            break;
        }
        if fc <= fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - ratio * (hi - lo);
            fc = profile_loss(x, y, c, tau).1;
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + ratio * (hi - lo);
            fd = profile_loss(x, y, d, tau).1;
        }
    }

    let slope = (lo + hi) / 2.0;
    let (intercept, _) = profile_loss(x, y, slope, tau);
    [intercept, slope]
}

fn number_or_null(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn series_schema(description: &str) -> Value {
    json!({
        "type": "string",
        "description": description
    })
}

/// Pearson correlation of a base series against several others.
pub struct PearsonMultiple;

#[async_trait]
impl Tool for PearsonMultiple {
    fn name(&self) -> &str {
        "calculate_pearson_multiple"
    }

    fn description(&self) -> &str {
        "Calculate the Pearson correlation coefficient between a base series and each of several other series. Series are comma-separated numbers of equal length. Returns {\"Feature_1\": r, ...}; r is null for a constant series."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "base_feature": series_schema("Comma-separated numbers, e.g. '512.3,498.1,530.0'"),
                "features": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Comma-separated number series to correlate with the base feature"
                }
            },
            "required": ["base_feature", "features"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let (base, features) = parse_inputs(&args)?;

        let mut results = Map::new();
        for (idx, feature) in features.iter().enumerate() {
            let r = pearson(&base, feature).map_or(Value::Null, number_or_null);
            results.insert(format!("Feature_{}", idx + 1), r);
        }
        Ok(Value::Object(results).to_string())
    }
}

/// Quantile regression of a base series on several others.
pub struct QuantileRegressionMultiple;

#[async_trait]
impl Tool for QuantileRegressionMultiple {
    fn name(&self) -> &str {
        "calculate_quantile_regression_multiple"
    }

    fn description(&self) -> &str {
        "Fit base = intercept + slope * feature by quantile regression for each feature and each quantile (default 0.25, 0.5, 0.75). Returns {\"Feature_1\": {\"0.5\": [intercept, slope], ...}, ...}."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "base_feature": series_schema("Comma-separated numbers for the dependent series"),
                "features": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Comma-separated number series used as predictors"
                },
                "quantiles": {
                    "type": "array",
                    "items": {"type": "number"},
                    "description": "Quantiles in [0, 1] (default [0.25, 0.5, 0.75])"
                }
            },
            "required": ["base_feature", "features"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let quantiles = match &args["quantiles"] {
            Value::Null => DEFAULT_QUANTILES.to_vec(),
            value => parse_series(value, "quantiles")?,
        };
        if quantiles.is_empty() {
            return Err(anyhow::anyhow!("quantiles cannot be empty"));
        }
        if let Some(q) = quantiles.iter().find(|q| !(0.0..=1.0).contains(*q)) {
            return Err(anyhow::anyhow!(
                "Quantiles must be within the range [0, 1], got {}",
                q
            ));
        }

        let (base, features) = parse_inputs(&args)?;
        if base.is_empty() {
            return Err(anyhow::anyhow!("base_feature cannot be empty"));
        }

        let mut results = Map::new();
        for (idx, feature) in features.iter().enumerate() {
            let mut per_quantile = Map::new();
            for &tau in &quantiles {
                let [intercept, slope] = quantile_regression(feature, &base, tau);
                per_quantile.insert(
                    tau.to_string(),
                    json!([number_or_null(intercept), number_or_null(slope)]),
                );
            }
            results.insert(format!("Feature_{}", idx + 1), Value::Object(per_quantile));
        }
        Ok(Value::Object(results).to_string())
    }
}
