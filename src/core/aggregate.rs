//! Price range and deviation scoring
//!
//! Pure functions turning raw pricing recommendations into a recommended
//! range and a deviation of the declared price from that range. No I/O.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::traits::MaterialMap;
use crate::types::{AuditOutcome, ItemStatus, LineItem, MaterialId, Recommendation};

/// Range sentinel when no valid price survives filtering
pub const NO_DATA: &str = "no-data";

const RANGE_SEPARATOR: char = '～';
const DEFAULT_TAX_RATE: f64 = 13.0;

fn parse_amount(raw: Option<&str>) -> Option<f64> {
    raw?.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Compute the recommended price range for one material's recommendations.
///
/// Prefers the untaxed amount when present and non-zero, otherwise derives
/// it from the taxed amount using the recommendation's tax rate (13% when
/// the rate is absent or zero). The unit-conversion weight `w` is applied
/// before filtering out non-positive prices.
pub fn compute_range(recommendations: &[Recommendation]) -> String {
    let mut prices = Vec::new();
    for rec in recommendations {
        let base = match parse_amount(rec.tax_exclude_amount.as_deref()).filter(|v| *v != 0.0) {
            Some(untaxed) => untaxed,
            None => {
                let Some(taxed) =
                    parse_amount(rec.tax_include_amount.as_deref()).filter(|v| *v != 0.0)
                else {
                    continue;
                };
                let mut rate = parse_amount(rec.tax_rate.as_deref()).unwrap_or(0.0);
                if rate == 0.0 {
                    rate = DEFAULT_TAX_RATE;
                }
                taxed / (1.0 + rate / 100.0)
            }
        };
        let weight = parse_amount(rec.w.as_deref())
            .filter(|v| *v != 0.0)
            .unwrap_or(1.0);
        let price = base * weight;
        if price.is_finite() && price > 0.0 {
            prices.push(price);
        }
    }

    if prices.is_empty() {
        return NO_DATA.to_string();
    }
    let min = prices.iter().copied().fold(f64::INFINITY, f64::min);
    let max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    format!("{min:.2}{RANGE_SEPARATOR}{max:.2}")
}

/// Deviation of the declared market price from a computed range.
///
/// Returns the signed percentage label (two decimals) and the unrounded
/// value; both empty/zero when the price sits inside the range or the
/// range carries no data.
pub fn compute_deviation(market_price: f64, range: &str) -> (String, f64) {
    let Some((min, max)) = parse_range(range) else {
        return (String::new(), 0.0);
    };
    if market_price < min {
        let value = (min - market_price) / min * 100.0;
        (format!("-{value:.2}%"), value)
    } else if market_price > max {
        let value = (market_price - max) / max * 100.0;
        (format!("+{value:.2}%"), value)
    } else {
        (String::new(), 0.0)
    }
}

fn parse_range(range: &str) -> Option<(f64, f64)> {
    let (min_raw, max_raw) = range.split_once(RANGE_SEPARATOR)?;
    let min = min_raw.parse::<f64>().ok()?;
    let max = max_raw.parse::<f64>().ok()?;
    Some((min, max))
}

/// Placeholder outcome carrying no price data
pub fn placeholder_outcome(
    material_id: MaterialId,
    item: LineItem,
    status: ItemStatus,
) -> AuditOutcome {
    AuditOutcome {
        material_id,
        item,
        price_range: NO_DATA.to_string(),
        deviation: String::new(),
        deviation_value: 0.0,
        status,
        recommendations: Vec::new(),
    }
}

/// Score an upstream response for the representatives that were sent.
///
/// Recommendations are grouped by their correlation identity; every
/// expected representative yields exactly one outcome. Representatives the
/// service returned nothing for complete with `no-data` rather than
/// failing, since the service simply found no match. Recommendations
/// correlating to unknown identities are logged and dropped.
pub fn score_representatives(
    recommendations: Vec<Recommendation>,
    expected: &[MaterialId],
    materials: &MaterialMap,
) -> Vec<AuditOutcome> {
    let mut grouped: HashMap<String, Vec<Recommendation>> = HashMap::new();
    for rec in recommendations {
        grouped
            .entry(rec.correlation_id.clone())
            .or_default()
            .push(rec);
    }

    let mut outcomes = Vec::with_capacity(expected.len());
    for id in expected {
        let Some(item) = materials.get(id) else {
            warn!(material = %id, "expected identity missing from material set");
            continue;
        };
        match grouped.remove(id.as_str()) {
            Some(recs) => {
                let price_range = compute_range(&recs);
                let (deviation, deviation_value) =
                    compute_deviation(item.market_price, &price_range);
                outcomes.push(AuditOutcome {
                    material_id: id.clone(),
                    item: item.clone(),
                    price_range,
                    deviation,
                    deviation_value,
                    status: ItemStatus::Complete,
                    recommendations: recs,
                });
            }
            None => {
                debug!(material = %id, "no recommendations returned, recording empty result");
                outcomes.push(placeholder_outcome(
                    id.clone(),
                    item.clone(),
                    ItemStatus::Complete,
                ));
            }
        }
    }

    if !grouped.is_empty() {
        warn!(
            unmatched = grouped.len(),
            "recommendations referenced unknown material identities"
        );
    }
    outcomes
}
