//! # Record Normalizer
//! The one place untyped upstream records become [`NormalizedEntity`] values.
//!
//! Pure and deterministic: no clock, no I/O. A record that cannot yield every
//! required field is skipped with a [`SkipReason`]; optional fields are copied
//! only when the source actually carries a usable value.

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;

use crate::collect::dedup::identity_key;
use crate::collect::error::SkipReason;
use crate::collect::types::{NormalizedEntity, RawRecord, SaleRecord};

/// Prefix for site-relative listing URLs.
pub const LISTING_ORIGIN: &str = "https://www.redfin.com";

/// Label for property-type codes outside the lookup table.
pub const UNKNOWN_PROPERTY_TYPE: &str = "Unknown";

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%b %d, %Y", "%B %d, %Y"];

/// Smaller values are not epoch millis (1e11 ms is early 1973).
const MIN_EPOCH_MILLIS: i64 = 100_000_000_000;

/// Upstream numeric property-type code to its canonical label.
pub fn property_type_label(code: i64) -> &'static str {
    match code {
        1 => "Single Family Residential",
        2 => "Condo/Co-op",
        3 => "Townhouse",
        4 => "Multi-Family",
        5 => "Land",
        6 => "Other",
        _ => UNKNOWN_PROPERTY_TYPE,
    }
}

/// Decode HTML entities, drop tags, collapse whitespace, trim.
pub fn clean_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out.trim().to_string()
}

pub fn normalize(raw: &RawRecord) -> Result<NormalizedEntity, SkipReason> {
    // Required fields first; any miss drops the whole record.
    let property_id = identity_key(raw).ok_or(SkipReason::MissingPropertyId)?;
    let address = text_field(raw, &["streetLine", "streetAddress", "address"])
        .ok_or(SkipReason::MissingAddress)?;
    let city = text_field(raw, &["city"]).ok_or(SkipReason::MissingCity)?;
    let state = text_field(raw, &["state"]).ok_or(SkipReason::MissingState)?;
    let zip_code =
        text_field(raw, &["zip", "zipCode", "postalCode"]).ok_or(SkipReason::MissingZipCode)?;
    let sale_date = field(raw, &["soldDate", "saleDate", "lastSoldDate"])
        .and_then(parse_date)
        .ok_or(SkipReason::MissingSaleDate)?;
    let final_sale_price = sale_price(raw).ok_or(SkipReason::MissingSalePrice)?;

    let sale_date = format_date(sale_date);
    let sales_history = sales_history(raw, &sale_date, final_sale_price);

    let (latitude, longitude) = coordinates(raw);

    Ok(NormalizedEntity {
        property_id,
        address,
        city,
        state,
        zip_code,
        sales_history,
        sale_date,
        final_sale_price,
        bedrooms: field(raw, &["beds", "bedrooms"]).and_then(positive_count),
        bathrooms: field(raw, &["baths", "bathrooms"]).and_then(positive_f64),
        full_bathrooms: field(raw, &["fullBaths"]).and_then(positive_count),
        half_bathrooms: field(raw, &["partialBaths", "halfBaths"]).and_then(positive_count),
        stories: field(raw, &["stories"]).and_then(positive_count),
        sqft: field(raw, &["sqFt", "sqft"]).and_then(positive_size),
        lot_size_sqft: field(raw, &["lotSize", "lotSizeSqft"]).and_then(positive_size),
        year_built: field(raw, &["yearBuilt"]).and_then(year),
        latitude,
        longitude,
        days_on_market: field(raw, &["dom", "daysOnMarket"]).and_then(non_negative_count),
        mls_number: text_field(raw, &["mlsId", "mlsNumber"]),
        property_type: field(raw, &["propertyType"]).map(property_type),
        listing_url: text_field(raw, &["url"]).map(|u| {
            if u.starts_with('/') {
                format!("{LISTING_ORIGIN}{u}")
            } else {
                u
            }
        }),
    })
}

/* ----------------------------
Field access
---------------------------- */

/// Unwrap `{ "value": x }` wrappers the listing API uses for most fields.
fn unwrap_value(v: &Value) -> &Value {
    match v {
        Value::Object(o) => o.get("value").unwrap_or(v),
        _ => v,
    }
}

/// First present, non-null value among `keys`.
fn field<'a>(raw: &'a RawRecord, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| raw.get(*k))
        .map(unwrap_value)
        .find(|v| !v.is_null())
}

fn text_field(raw: &RawRecord, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| raw.get(*k))
        .map(unwrap_value)
        .find_map(as_text)
}

fn as_text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => clean_text(s),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn as_f64(v: &Value) -> Option<f64> {
    let f = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    };
    f.filter(|f| f.is_finite())
}

/* ----------------------------
Dates
---------------------------- */

fn parse_date(v: &Value) -> Option<NaiveDate> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(date_from_millis),
        Value::String(s) => parse_date_str(s.trim()),
        _ => None,
    }
}

fn date_from_millis(ms: i64) -> Option<NaiveDate> {
    if ms < MIN_EPOCH_MILLIS {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

fn parse_date_str(s: &str) -> Option<NaiveDate> {
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        if s.len() == 8 {
            return NaiveDate::parse_from_str(s, "%Y%m%d").ok();
        }
        return s.parse::<i64>().ok().and_then(date_from_millis);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    // Naive timestamps such as "2024-03-05T10:00:00": keep the calendar part.
    s.get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
}

fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/* ----------------------------
Money
---------------------------- */

/// Whole currency units. Accepts numbers and formatted strings like "$1,250,000".
fn parse_money(v: &Value) -> Option<f64> {
    let amount = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let digits: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            digits.parse::<f64>().ok()
        }
        _ => None,
    }?;
    (amount.is_finite() && amount > 0.0).then_some(amount)
}

fn sale_price(raw: &RawRecord) -> Option<f64> {
    field(raw, &["price", "soldPrice", "lastSoldPrice"])
        .and_then(parse_money)
        .or_else(|| {
            field(raw, &["priceCents", "soldPriceCents"])
                .and_then(parse_money)
                .map(|cents| cents / 100.0)
        })
}

/// Upstream history when usable, always including the sale itself, newest first.
fn sales_history(raw: &RawRecord, sale_date: &str, sale_price: f64) -> Vec<SaleRecord> {
    let mut out: Vec<SaleRecord> = match raw.get("salesHistory") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|it| {
                let obj = it.as_object()?;
                let date = field(obj, &["date", "soldDate", "eventDate"]).and_then(parse_date)?;
                let price = field(obj, &["price", "soldPrice", "value"]).and_then(parse_money)?;
                Some(SaleRecord {
                    date: format_date(date),
                    price,
                })
            })
            .collect(),
        _ => Vec::new(),
    };

    if !out.iter().any(|s| s.date == sale_date) {
        out.push(SaleRecord {
            date: sale_date.to_string(),
            price: sale_price,
        });
    }

    out.sort_by(|a, b| b.date.cmp(&a.date));
    out.dedup_by(|a, b| a.date == b.date && a.price == b.price);
    out
}

/* ----------------------------
Optional attributes
---------------------------- */

fn positive_count(v: &Value) -> Option<u32> {
    as_f64(v)
        .filter(|f| *f > 0.0 && f.fract() == 0.0 && *f <= u32::MAX as f64)
        .map(|f| f as u32)
}

fn non_negative_count(v: &Value) -> Option<u32> {
    as_f64(v)
        .filter(|f| *f >= 0.0 && *f <= u32::MAX as f64)
        .map(|f| f.round() as u32)
}

fn positive_f64(v: &Value) -> Option<f64> {
    as_f64(v).filter(|f| *f > 0.0)
}

fn positive_size(v: &Value) -> Option<u64> {
    as_f64(v).filter(|f| *f > 0.0).map(|f| f.round() as u64)
}

fn year(v: &Value) -> Option<i32> {
    as_f64(v)
        .filter(|f| f.fract() == 0.0 && (1600.0..=2100.0).contains(f))
        .map(|f| f as i32)
}

fn coordinates(raw: &RawRecord) -> (Option<f64>, Option<f64>) {
    let from_obj = |obj: &serde_json::Map<String, Value>| {
        (
            obj.get("latitude").and_then(as_f64),
            obj.get("longitude").and_then(as_f64),
        )
    };
    let (lat, lon) = match raw.get("latLong").map(unwrap_value) {
        Some(Value::Object(o)) => from_obj(o),
        _ => from_obj(raw),
    };
    (
        lat.filter(|v| (-90.0..=90.0).contains(v)),
        lon.filter(|v| (-180.0..=180.0).contains(v)),
    )
}

fn property_type(v: &Value) -> String {
    let code = match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    code.map(property_type_label)
        .unwrap_or(UNKNOWN_PROPERTY_TYPE)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> RawRecord {
        v.as_object().cloned().unwrap()
    }

    fn sold_home() -> Value {
        json!({
            "propertyId": 1234567,
            "streetLine": {"value": "12  Elm&nbsp;St"},
            "city": "Beverly Hills",
            "state": "CA",
            "zip": "90210",
            "soldDate": 1_709_596_800_000i64,
            "price": {"value": 2_450_000},
            "beds": 4,
            "baths": 3.5,
            "sqFt": {"value": 3100},
            "yearBuilt": {"value": 1962},
            "latLong": {"value": {"latitude": 34.07, "longitude": -118.40}},
            "dom": {"value": 0},
            "mlsId": {"value": "SR24012345"},
            "propertyType": 2,
            "url": "/CA/Beverly-Hills/12-Elm-St-90210/home/1234567"
        })
    }

    #[test]
    fn maps_complete_record() {
        let e = normalize(&rec(sold_home())).unwrap();
        assert_eq!(e.property_id, "1234567");
        assert_eq!(e.address, "12 Elm St");
        assert_eq!(e.zip_code, "90210");
        assert_eq!(e.sale_date, "2024-03-05");
        assert_eq!(e.final_sale_price, 2_450_000.0);
        assert_eq!(e.sales_history.len(), 1);
        assert_eq!(e.sales_history[0].date, "2024-03-05");
        assert_eq!(e.bedrooms, Some(4));
        assert_eq!(e.bathrooms, Some(3.5));
        assert_eq!(e.sqft, Some(3100));
        assert_eq!(e.year_built, Some(1962));
        assert_eq!(e.latitude, Some(34.07));
        assert_eq!(e.longitude, Some(-118.40));
        assert_eq!(e.days_on_market, Some(0));
        assert_eq!(e.mls_number.as_deref(), Some("SR24012345"));
        assert_eq!(e.property_type.as_deref(), Some("Condo/Co-op"));
        assert!(e
            .listing_url
            .as_deref()
            .unwrap()
            .starts_with("https://www.redfin.com/CA/"));
    }

    #[test]
    fn missing_zip_is_skipped() {
        let mut v = sold_home();
        v.as_object_mut().unwrap().remove("zip");
        assert_eq!(normalize(&rec(v)), Err(SkipReason::MissingZipCode));
    }

    #[test]
    fn unsold_home_without_date_is_skipped() {
        let mut v = sold_home();
        v.as_object_mut().unwrap().remove("soldDate");
        assert_eq!(normalize(&rec(v)), Err(SkipReason::MissingSaleDate));
    }

    #[test]
    fn zero_price_is_not_a_price() {
        let mut v = sold_home();
        v["price"] = json!(0);
        assert_eq!(normalize(&rec(v)), Err(SkipReason::MissingSalePrice));
    }

    #[test]
    fn date_encodings_agree() {
        for raw in [
            json!(1_709_596_800_000i64),
            json!("1709596800000"),
            json!("2024-03-05"),
            json!("2024-03-05T00:00:00Z"),
            json!("03/05/2024"),
            json!("Mar 5, 2024"),
            json!("March 5, 2024"),
            json!("2024-03-05T08:30:00"),
            json!("20240305"),
        ] {
            assert_eq!(
                parse_date(&raw).map(format_date).as_deref(),
                Some("2024-03-05"),
                "input {raw}"
            );
        }
        assert_eq!(parse_date(&json!("not a date")), None);
        assert_eq!(parse_date(&json!(0)), None);
        assert_eq!(parse_date(&json!("20241399")), None);
        assert_eq!(parse_date(&json!("1234567")), None);
        assert_eq!(parse_date(&json!(20_240_305)), None);
    }

    #[test]
    fn money_encodings_agree() {
        let mut v = sold_home();
        v["price"] = json!("$2,450,000");
        assert_eq!(normalize(&rec(v.clone())).unwrap().final_sale_price, 2_450_000.0);

        v.as_object_mut().unwrap().remove("price");
        v["priceCents"] = json!(245_000_000);
        assert_eq!(normalize(&rec(v)).unwrap().final_sale_price, 2_450_000.0);
    }

    #[test]
    fn unknown_property_type_passes_through_as_unknown() {
        let mut v = sold_home();
        v["propertyType"] = json!(13);
        assert_eq!(
            normalize(&rec(v.clone())).unwrap().property_type.as_deref(),
            Some(UNKNOWN_PROPERTY_TYPE)
        );
        v.as_object_mut().unwrap().remove("propertyType");
        assert_eq!(normalize(&rec(v)).unwrap().property_type, None);
    }

    #[test]
    fn absent_optionals_stay_absent() {
        let v = json!({
            "propertyId": "abc",
            "streetLine": "1 Main St",
            "city": "New York",
            "state": "NY",
            "zip": "10001",
            "soldDate": "2023-11-01",
            "price": 900000,
            "beds": 0,
            "sqFt": {"value": null}
        });
        let e = normalize(&rec(v)).unwrap();
        assert_eq!(e.bedrooms, None);
        assert_eq!(e.sqft, None);
        assert_eq!(e.latitude, None);
        assert_eq!(e.property_type, None);
        let out = serde_json::to_value(&e).unwrap();
        assert!(out.get("bedrooms").is_none());
        assert!(out.get("zipCode").is_some());
    }

    #[test]
    fn upstream_history_is_merged_newest_first() {
        let mut v = sold_home();
        v["salesHistory"] = json!([
            {"date": "2015-06-01", "price": "$1,100,000"},
            {"date": "garbage", "price": 5},
            {"date": 1_709_596_800_000i64, "price": 2_450_000}
        ]);
        let e = normalize(&rec(v)).unwrap();
        let dates: Vec<_> = e.sales_history.iter().map(|s| s.date.as_str()).collect();
        assert_eq!(dates, vec!["2024-03-05", "2015-06-01"]);
    }

    #[test]
    fn clean_text_collapses_whitespace_and_entities() {
        assert_eq!(clean_text("  5th&nbsp;&amp; <b>Main</b>\n Ave "), "5th & Main Ave");
    }
}
