use std::f64::consts::SQRT_2;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CrawlError, Result};

/// Meters per degree of latitude, and of longitude at the equator.
pub const METERS_PER_DEGREE: f64 = 111_111.0;

/// Degrees added on every side of a geocoded viewport before gridding.
pub const DEFAULT_VIEWPORT_PADDING: f64 = 0.05;

/// Slack for the `<=` grid loop so float error never drops the last row.
const GRID_EPSILON: f64 = 1e-9;

/// A raw place payload. Opaque to the crawler apart from its id.
pub type RecordPayload = Map<String, Value>;

/// Field carrying the provider-assigned record id.
pub const RECORD_ID_FIELD: &str = "place_id";

pub fn record_id(record: &RecordPayload) -> Option<&str> {
    record
        .get(RECORD_ID_FIELD)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

// --- Geography ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Axis-aligned lat/lng rectangle. Does not wrap the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl Bounds {
    pub fn from_corners(south_west: GeoPoint, north_east: GeoPoint) -> Result<Self> {
        let bounds = Self {
            south: south_west.lat,
            west: south_west.lng,
            north: north_east.lat,
            east: north_east.lng,
        };
        if bounds.south > bounds.north || bounds.west > bounds.east {
            return Err(CrawlError::InvalidTile(format!(
                "south-west corner {south_west:?} is not below and left of {north_east:?}"
            )));
        }
        Ok(bounds)
    }

    pub fn padded(&self, margin: f64) -> Self {
        let margin = margin.max(0.0);
        Self {
            south: self.south - margin,
            west: self.west - margin,
            north: self.north + margin,
            east: self.east + margin,
        }
    }
}

// --- Tiles ---

/// Child order produced by [`Tile::subdivide`]. The deep dive pushes children
/// in this order onto a LIFO stack, so NE is explored first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quadrant {
    SouthWest,
    SouthEast,
    NorthWest,
    NorthEast,
}

impl Quadrant {
    pub const ORDER: [Quadrant; 4] = [
        Quadrant::SouthWest,
        Quadrant::SouthEast,
        Quadrant::NorthWest,
        Quadrant::NorthEast,
    ];

    fn signs(self) -> (f64, f64) {
        match self {
            Quadrant::SouthWest => (-1.0, -1.0),
            Quadrant::SouthEast => (-1.0, 1.0),
            Quadrant::NorthWest => (1.0, -1.0),
            Quadrant::NorthEast => (1.0, 1.0),
        }
    }
}

/// Square search tile: center plus side length in decimal degrees.
///
/// Immutable. `side_deg` is always finite and strictly positive; deserialization
/// goes through the same check as [`Tile::new`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TileFields")]
pub struct Tile {
    center_lat: f64,
    center_lng: f64,
    side_deg: f64,
}

#[derive(Deserialize)]
struct TileFields {
    center_lat: f64,
    center_lng: f64,
    side_deg: f64,
}

impl TryFrom<TileFields> for Tile {
    type Error = CrawlError;

    fn try_from(f: TileFields) -> Result<Self> {
        Tile::new(f.center_lat, f.center_lng, f.side_deg)
    }
}

impl Tile {
    pub fn new(center_lat: f64, center_lng: f64, side_deg: f64) -> Result<Self> {
        if !(side_deg.is_finite() && side_deg > 0.0) {
            return Err(CrawlError::InvalidTile(format!(
                "side must be finite and positive, got {side_deg}"
            )));
        }
        if !(center_lat.is_finite() && center_lng.is_finite()) {
            return Err(CrawlError::InvalidTile(format!(
                "center ({center_lat}, {center_lng}) is not finite"
            )));
        }
        Ok(Self {
            center_lat,
            center_lng,
            side_deg,
        })
    }

    pub fn lat(&self) -> f64 {
        self.center_lat
    }

    pub fn lng(&self) -> f64 {
        self.center_lng
    }

    pub fn side(&self) -> f64 {
        self.side_deg
    }

    pub fn key(&self) -> TileKey {
        TileKey::of(self)
    }

    /// Split into four half-size children, in [`Quadrant::ORDER`].
    pub fn subdivide(&self) -> [Tile; 4] {
        let side = self.side_deg / 2.0;
        let offset = self.side_deg / 4.0;
        Quadrant::ORDER.map(|q| {
            let (dlat, dlng) = q.signs();
            Tile {
                center_lat: self.center_lat + dlat * offset,
                center_lng: self.center_lng + dlng * offset,
                side_deg: side,
            }
        })
    }

    /// Radius in meters of the circle circumscribing this tile.
    ///
    /// Flat-earth approximation: the half-diagonal in degrees times the mean of
    /// the meridian and parallel lengths of a degree at the tile's latitude.
    pub fn search_radius_m(&self) -> f64 {
        let parallel = METERS_PER_DEGREE * self.center_lat.to_radians().cos();
        let meters_per_degree = (METERS_PER_DEGREE + parallel) / 2.0;
        self.side_deg * SQRT_2 / 2.0 * meters_per_degree
    }

    pub fn bounds(&self) -> Bounds {
        let half = self.side_deg / 2.0;
        Bounds {
            south: self.center_lat - half,
            west: self.center_lng - half,
            north: self.center_lat + half,
            east: self.center_lng + half,
        }
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.6}, {:.6}) side {:.6}",
            self.center_lat, self.center_lng, self.side_deg
        )
    }
}

/// Row-major grid of `step`-sized tiles over `area` padded by `padding`.
///
/// Rows run south to north and columns west to east. The loops use `<=`, so
/// the final row and column are kept even when they overshoot the edge.
pub fn generate_grid(area: &Bounds, step: f64, padding: f64) -> Result<Vec<Tile>> {
    if !(step.is_finite() && step > 0.0) {
        return Err(CrawlError::InvalidTile(format!(
            "grid step must be finite and positive, got {step}"
        )));
    }
    let padded = area.padded(padding);

    let mut tiles = Vec::new();
    for row in 0u64.. {
        let lat = padded.south + row as f64 * step;
        if lat > padded.north + GRID_EPSILON {
            break;
        }
        for col in 0u64.. {
            let lng = padded.west + col as f64 * step;
            if lng > padded.east + GRID_EPSILON {
                break;
            }
            tiles.push(Tile::new(lat, lng, step)?);
        }
    }
    Ok(tiles)
}

/// Set-membership key for a tile: each field at 6 decimal places.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileKey(String);

impl TileKey {
    pub fn of(tile: &Tile) -> Self {
        TileKey(format!(
            "{:.6},{:.6},{:.6}",
            canonical(tile.center_lat),
            canonical(tile.center_lng),
            canonical(tile.side_deg)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Round to 6 places and fold negative zero so `-0.0000001` keys like `0.0`.
fn canonical(value: f64) -> f64 {
    let rounded = (value * 1e6).round() / 1e6;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

// --- Crawl identity ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlPhaseKey {
    InitialScan,
    DeepDive,
}

/// Namespace for everything one crawl persists.
///
/// The initial scan checkpoints under `<slug>`, the deep dive under
/// `<slug>_deep_dive`, and records export to `<slug>_<place type>.csv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlIdentity {
    slug: String,
}

impl CrawlIdentity {
    pub fn new(area_name: &str) -> Result<Self> {
        let slug = slugify(area_name);
        if slug.is_empty() {
            return Err(CrawlError::Config(format!(
                "area name {area_name:?} has no usable characters"
            )));
        }
        Ok(Self { slug })
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn checkpoint_key(&self, phase: CrawlPhaseKey) -> String {
        match phase {
            CrawlPhaseKey::InitialScan => self.slug.clone(),
            CrawlPhaseKey::DeepDive => format!("{}_deep_dive", self.slug),
        }
    }

    pub fn export_file_name(&self, place_type: &str) -> String {
        let kind = slugify(place_type);
        if kind.is_empty() {
            format!("{}_places.csv", self.slug)
        } else {
            format!("{}_{kind}.csv", self.slug)
        }
    }
}

impl fmt::Display for CrawlIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.slug)
    }
}

/// Lower-case, with every run of non-alphanumerics collapsed to one `_`.
pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}
