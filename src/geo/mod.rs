use crate::models::driver::GeoPoint;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_M * central_angle
}

pub fn is_valid(point: &GeoPoint) -> bool {
    point.lat.is_finite()
        && point.lng.is_finite()
        && (-90.0..=90.0).contains(&point.lat)
        && (-180.0..=180.0).contains(&point.lng)
}

#[cfg(test)]
mod tests {
    use super::{haversine_m, is_valid};
    use crate::models::driver::GeoPoint;

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 12.9716,
            lng: 77.5946,
        };
        assert!(haversine_m(&p, &p) < 1e-6);
    }

    #[test]
    fn mg_road_to_indiranagar_is_a_few_km() {
        let mg_road = GeoPoint {
            lat: 12.9756,
            lng: 77.6050,
        };
        let indiranagar = GeoPoint {
            lat: 12.9784,
            lng: 77.6408,
        };
        let distance = haversine_m(&mg_road, &indiranagar);
        assert!((distance - 3_900.0).abs() < 200.0);
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(!is_valid(&GeoPoint { lat: 91.0, lng: 0.0 }));
        assert!(!is_valid(&GeoPoint {
            lat: f64::NAN,
            lng: 0.0
        }));
        assert!(is_valid(&GeoPoint { lat: 0.0, lng: 0.0 }));
    }
}
