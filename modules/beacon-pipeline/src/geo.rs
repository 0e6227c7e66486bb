//! Nearest-responder matching. Pure, no I/O.

use beacon_common::{haversine_km, GeoPoint, StationMatch, StationRecord};

/// Match a point against the station registry.
///
/// Prefers the nearest station whose jurisdiction radius contains the point;
/// a station with no configured radius is always eligible. When no
/// jurisdiction contains the point, falls back to the globally nearest
/// station. Returns `None` only for an empty registry (stations without
/// coordinates are skipped).
pub fn nearest_station(point: GeoPoint, stations: &[StationRecord]) -> Option<StationMatch> {
    let mut nearest_within: Option<StationMatch> = None;
    let mut nearest_any: Option<StationMatch> = None;

    for station in stations {
        let Some(station_location) = station.location else {
            continue;
        };
        let distance_km = haversine_km(point, station_location);
        let candidate = StationMatch {
            station_id: station.id.clone(),
            contact_channel: station.contact_channel.clone(),
            distance_km,
        };

        if nearest_any
            .as_ref()
            .is_none_or(|best| distance_km < best.distance_km)
        {
            nearest_any = Some(candidate.clone());
        }

        let inside = station
            .jurisdiction_radius_km
            .is_none_or(|radius| distance_km <= radius);
        if inside
            && nearest_within
                .as_ref()
                .is_none_or(|best| distance_km < best.distance_km)
        {
            nearest_within = Some(candidate);
        }
    }

    nearest_within.or(nearest_any)
}
