use std::cmp::Ordering;

use crate::firestore::model::ResourcePath;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Cross-type ordering of Firestore values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null,
    Boolean,
    Number,
    Timestamp,
    ServerTimestamp,
    String,
    Bytes,
    Reference,
    GeoPoint,
    Array,
    Map,
}

pub fn type_order(value: &FirestoreValue) -> TypeOrder {
    match value.kind() {
        // Sentinels are stripped before values are stored; ordering them is
        // only defined so comparisons stay total.
        ValueKind::Null | ValueKind::Sentinel(_) => TypeOrder::Null,
        ValueKind::Boolean(_) => TypeOrder::Boolean,
        ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
        ValueKind::Timestamp(_) => TypeOrder::Timestamp,
        ValueKind::ServerTimestamp(_) => TypeOrder::ServerTimestamp,
        ValueKind::String(_) => TypeOrder::String,
        ValueKind::Bytes(_) => TypeOrder::Bytes,
        ValueKind::Reference(_) => TypeOrder::Reference,
        ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
        ValueKind::Array(_) => TypeOrder::Array,
        ValueKind::Map(_) => TypeOrder::Map,
    }
}

/// Total order used by query ordering, range filters and index entries.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_mixed(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_mixed(*r, *l).reverse(),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::ServerTimestamp(l), ValueKind::ServerTimestamp(r)) => {
            l.local_write_time.cmp(&r.local_write_time)
        }
        (ValueKind::String(l), ValueKind::String(r)) => l.as_bytes().cmp(r.as_bytes()),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => {
            compare_doubles(l.latitude(), r.latitude())
                .then_with(|| compare_doubles(l.longitude(), r.longitude()))
        }
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (lv, rv) in l.values().iter().zip(r.values().iter()) {
                match compare_values(lv, rv) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            l.values().len().cmp(&r.values().len())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => compare_maps(l, r),
        _ => Ordering::Equal,
    }
}

// NaN sorts before every other number and equals itself.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    // f64 cannot represent every i64; fall back to exact comparison once the
    // double is known to lie within the integer range.
    if double < -9.223_372_036_854_776e18 {
        return Ordering::Greater;
    }
    if double >= 9.223_372_036_854_776e18 {
        return Ordering::Less;
    }
    let truncated = double.trunc() as i64;
    match integer.cmp(&truncated) {
        Ordering::Equal => {
            let fraction = double - double.trunc();
            if fraction > 0.0 {
                Ordering::Less
            } else if fraction < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    match (ResourcePath::from_string(left), ResourcePath::from_string(right)) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.cmp(right),
    }
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_iter = left.fields().iter();
    let mut right_iter = right.fields().iter();
    loop {
        match (left_iter.next(), right_iter.next()) {
            (Some((lk, lv)), Some((rk, rv))) => {
                let ordering = lk
                    .as_bytes()
                    .cmp(rk.as_bytes())
                    .then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{GeoPoint, Timestamp};
    use crate::firestore::value::BytesValue;
    use std::collections::BTreeMap;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-1),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::pending_server_timestamp(Timestamp::new(0, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_bytes(BytesValue::new(vec![0])),
            FirestoreValue::from_reference("projects/p/databases/d/documents/c/a"),
            FirestoreValue::from_geo_point(GeoPoint::new(0.0, 0.0).unwrap()),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for window in ordered.windows(2) {
            assert_eq!(
                compare_values(&window[0], &window[1]),
                Ordering::Less,
                "{:?} < {:?}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn integers_and_doubles_compare_by_value() {
        let one = FirestoreValue::from_integer(1);
        let one_point_zero = FirestoreValue::from_double(1.0);
        let one_point_five = FirestoreValue::from_double(1.5);
        assert_eq!(compare_values(&one, &one_point_zero), Ordering::Equal);
        assert_eq!(compare_values(&one, &one_point_five), Ordering::Less);
        assert_eq!(compare_values(&one_point_five, &one), Ordering::Greater);
    }

    #[test]
    fn geo_points_compare_by_latitude_then_longitude() {
        let point = |latitude, longitude| {
            FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude).unwrap())
        };
        let ordered = [
            point(-10.0, 50.0),
            point(0.0, -20.0),
            point(0.0, 30.0),
            point(45.0, -180.0),
        ];
        for window in ordered.windows(2) {
            assert_eq!(compare_values(&window[0], &window[1]), Ordering::Less);
            assert_eq!(compare_values(&window[1], &window[0]), Ordering::Greater);
        }

        assert_eq!(compare_values(&point(12.5, 7.0), &point(12.5, 7.0)), Ordering::Equal);
        assert_eq!(point(12.5, 7.0), point(12.5, 7.0));
        assert_ne!(point(12.5, 7.0), point(7.0, 12.5));

        // Any geo point sorts after references and before arrays.
        let reference = FirestoreValue::from_reference("projects/p/databases/d/documents/c/z");
        let array = FirestoreValue::from_array(vec![FirestoreValue::null()]);
        assert_eq!(compare_values(&reference, &point(-90.0, -180.0)), Ordering::Less);
        assert_eq!(compare_values(&point(90.0, 180.0), &array), Ordering::Less);
    }

    #[test]
    fn arrays_compare_lexicographically() {
        let short = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]);
        let long = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(0),
        ]);
        let bigger = FirestoreValue::from_array(vec![FirestoreValue::from_integer(2)]);
        assert_eq!(compare_values(&short, &long), Ordering::Less);
        assert_eq!(compare_values(&long, &bigger), Ordering::Less);
    }
}
