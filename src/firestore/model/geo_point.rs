use crate::firestore::error::{invalid_argument, FirestoreResult};

/// A latitude/longitude pair stored as a document field. Ordered by
/// latitude, then longitude.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> FirestoreResult<Self> {
        // Range checks also reject NaN.
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(invalid_argument(format!(
                "Latitude must be a number between -90 and 90, but was: {latitude}"
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(invalid_argument(format!(
                "Longitude must be a number between -180 and 180, but was: {longitude}"
            )));
        }
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[test]
    fn accepts_boundary_coordinates() {
        let point = GeoPoint::new(-90.0, 180.0).unwrap();
        assert_eq!(point.latitude(), -90.0);
        assert_eq!(point.longitude(), 180.0);
    }

    #[test]
    fn rejects_out_of_range_and_nan() {
        for (latitude, longitude) in [(90.5, 0.0), (0.0, -180.5), (f64::NAN, 0.0), (0.0, f64::NAN)] {
            let err = GeoPoint::new(latitude, longitude).unwrap_err();
            assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        }
    }
}
