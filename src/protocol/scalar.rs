//! Textual rendering of scalar values for per-field device topics

use super::record::Value;

/// Doubles at or above this magnitude use scientific notation
const SCIENTIFIC_ABOVE: f64 = 1e7;
/// Doubles below this magnitude use scientific notation
const SCIENTIFIC_BELOW: f64 = 1e-4;
/// Significant digits for scientific rendering, as C `%g`
const SIGNIFICANT_DIGITS: usize = 6;

/// Render a scalar value as a publish payload.
///
/// Returns `None` for arrays and nested records, which are split into
/// sub-topics by the router instead.
pub fn scalar_payload(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Double(d) => Some(format_double(*d)),
        Value::Array(_) | Value::Record(_) => None,
    }
}

/// Render a double the way device payloads expect it.
///
/// Values in the "human" range get five decimals with trailing zeros
/// trimmed (one fractional digit is always kept). Very large or very small
/// magnitudes fall back to `%g`-style scientific notation.
pub fn format_double(value: f64) -> String {
    if !value.is_finite() {
        return non_finite(value);
    }

    let magnitude = value.abs();
    if magnitude >= SCIENTIFIC_ABOVE || magnitude < SCIENTIFIC_BELOW {
        return format_general(value);
    }

    let mut text = format!("{value:.5}");
    while text.ends_with('0') && !text.ends_with(".0") {
        text.pop();
    }
    text
}

fn non_finite(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_sign_negative() {
        "-inf".to_string()
    } else {
        "inf".to_string()
    }
}

/// C `%g` with the default precision of six significant digits
fn format_general(value: f64) -> String {
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // Rounding to the significant digits first gives the exponent %g decides on
    let rounded = format!("{:.*e}", SIGNIFICANT_DIGITS - 1, value);
    let (mantissa, exponent) = rounded.split_once('e').unwrap_or((rounded.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent >= -4 && exponent < SIGNIFICANT_DIGITS as i32 {
        let decimals = (SIGNIFICANT_DIGITS as i32 - 1 - exponent).max(0) as usize;
        return trim_fraction(format!("{value:.decimals$}"));
    }

    let mantissa = trim_fraction(mantissa.to_string());
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exponent.abs())
}

fn trim_fraction(mut text: String) -> String {
    if text.contains('.') {
        while text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
    }
    text
}
