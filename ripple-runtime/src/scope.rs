//! Target scopes: which locations one evaluation covers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use ripple_core::{Coordinates, LocationNode, LocationSnapshot};

use crate::EngineError;

/// Subset of the snapshot evaluated as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetScope {
    /// Every location in the snapshot
    All,
    /// Locations of one brand
    Brand { id: String },
    /// Locations of one category
    Category { id: String },
    /// Locations within `radius_km` of a point
    Region {
        center: Coordinates,
        radius_km: f64,
    },
    /// A location and its neighbours within `radius_km`
    Location { id: String, radius_km: f64 },
}

impl TargetScope {
    pub fn brand(id: &str) -> Self {
        TargetScope::Brand { id: id.to_string() }
    }

    pub fn category(id: &str) -> Self {
        TargetScope::Category { id: id.to_string() }
    }

    pub fn region(center: Coordinates, radius_km: f64) -> Self {
        TargetScope::Region { center, radius_km }
    }

    pub fn location(id: &str, radius_km: f64) -> Self {
        TargetScope::Location {
            id: id.to_string(),
            radius_km,
        }
    }

    /// Entity id analytic sources are queried with
    pub fn entity_id(&self) -> String {
        match self {
            TargetScope::All => "all".to_string(),
            TargetScope::Brand { id } => format!("brand:{id}"),
            TargetScope::Category { id } => format!("category:{id}"),
            TargetScope::Region { center, radius_km } => {
                format!("region:{:.4},{:.4}:{}", center.lat, center.lon, radius_km)
            }
            TargetScope::Location { id, .. } => format!("location:{id}"),
        }
    }

    /// Snapshot nodes this scope covers
    pub fn select<'a>(&self, snapshot: &'a LocationSnapshot) -> Vec<&'a LocationNode> {
        let nodes = snapshot.nodes().iter();
        match self {
            TargetScope::All => nodes.collect(),
            TargetScope::Brand { id } => nodes.filter(|n| &n.brand == id).collect(),
            TargetScope::Category { id } => nodes.filter(|n| &n.category == id).collect(),
            TargetScope::Region { center, radius_km } => nodes
                .filter(|n| center.distance_km(&n.coordinates) <= *radius_km)
                .collect(),
            TargetScope::Location { id, radius_km } => match snapshot.get(id) {
                Some(origin) => nodes
                    .filter(|n| {
                        n.id == origin.id
                            || origin.coordinates.distance_km(&n.coordinates) <= *radius_km
                    })
                    .collect(),
                None => Vec::new(),
            },
        }
    }
}

impl fmt::Display for TargetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entity_id())
    }
}

/// Parses `all`, `brand:<id>`, `category:<id>`, `location:<id>[:<km>]`
/// and `region:<lat>,<lon>:<km>`
impl FromStr for TargetScope {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| EngineError::InvalidScope(format!("{s}: {reason}"));
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(TargetScope::All);
        }

        let (kind, rest) = s.split_once(':').ok_or_else(|| invalid("expected <kind>:<id>"))?;
        if rest.is_empty() {
            return Err(invalid("missing id"));
        }

        match kind {
            "brand" => Ok(TargetScope::brand(rest)),
            "category" => Ok(TargetScope::category(rest)),
            "location" => match rest.rsplit_once(':') {
                Some((id, km)) => {
                    let radius_km = parse_radius(km).ok_or_else(|| invalid("bad radius"))?;
                    Ok(TargetScope::location(id, radius_km))
                }
                None => Ok(TargetScope::location(rest, DEFAULT_LOCATION_RADIUS_KM)),
            },
            "region" => {
                let (center, km) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| invalid("expected region:<lat>,<lon>:<km>"))?;
                let (lat, lon) = center
                    .split_once(',')
                    .ok_or_else(|| invalid("expected <lat>,<lon>"))?;
                let lat: f64 = lat.trim().parse().map_err(|_| invalid("bad latitude"))?;
                let lon: f64 = lon.trim().parse().map_err(|_| invalid("bad longitude"))?;
                let center = Coordinates::new(lat, lon);
                if !center.is_valid() {
                    return Err(invalid("coordinates out of range"));
                }
                let radius_km = parse_radius(km).ok_or_else(|| invalid("bad radius"))?;
                Ok(TargetScope::region(center, radius_km))
            }
            other => Err(invalid(&format!("unknown scope kind '{other}'"))),
        }
    }
}

/// Neighbourhood radius when `location:<id>` gives none
pub const DEFAULT_LOCATION_RADIUS_KM: f64 = 5.0;

fn parse_radius(s: &str) -> Option<f64> {
    let km: f64 = s.trim().trim_end_matches("km").parse().ok()?;
    (km.is_finite() && km > 0.0).then_some(km)
}
