use rust_decimal::Decimal;
use std::str::FromStr;

const CURRENCY_MARKS: [&str; 6] = ["$", "€", "£", "USD", "EUR", "GBP"];

/// Parses a price as written by any of the supported sources.
///
/// Currency marks and whitespace are dropped. When both `,` and `.` occur the
/// last one is the decimal separator; a lone comma is a decimal separator while
/// repeated commas or repeated dots group thousands. Anything unparseable or
/// negative is `0`.
pub fn normalize(raw: Option<&str>) -> Decimal {
    let Some(raw) = raw else {
        return Decimal::ZERO;
    };
    let mut s: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    for mark in CURRENCY_MARKS {
        s = s.replace(mark, "");
    }
    let s = match (s.rfind(','), s.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (Some(_), None) if s.matches(',').count() == 1 => s.replace(',', "."),
        (Some(_), None) => s.replace(',', ""),
        (None, Some(_)) if s.matches('.').count() > 1 => s.replace('.', ""),
        _ => s,
    };
    match Decimal::from_str(&s) {
        Ok(d) if !d.is_sign_negative() => d,
        Ok(_) => Decimal::ZERO,
        Err(_) => Decimal::ZERO,
    }
}

/// Same as [`normalize`] for JSON values, which API responses mix freely
/// between strings and numbers.
pub fn normalize_value(value: &serde_json::Value) -> Decimal {
    match value {
        serde_json::Value::String(s) => normalize(Some(s)),
        serde_json::Value::Number(n) => normalize(Some(&n.to_string())),
        _ => Decimal::ZERO,
    }
}
