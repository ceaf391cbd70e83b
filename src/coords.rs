//! Coordinate and target resolution
//!
//! Positions arrive as a degree pair, a free-text string (literal coordinates
//! or an object name) or an already resolved coordinate. Everything ends up as
//! an ICRS [`SkyCoord`] in degrees.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ProbeError, Result};
use crate::http::{HttpBackend, HttpRequest};

/// Default Sesame name resolver endpoint (plain-text output, all databases)
pub const SESAME_URL: &str = "https://cds.unistra.fr/cgi-bin/nph-sesame/-oI/A";

/// An ICRS position in degrees; RA normalised into [0, 360)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyCoord {
    ra: f64,
    dec: f64,
}

impl SkyCoord {
    pub fn new(ra: f64, dec: f64) -> Result<Self> {
        if !ra.is_finite() || !dec.is_finite() {
            return Err(ProbeError::InvalidCoordinateInput(format!(
                "non-finite coordinate ({}, {})",
                ra, dec
            )));
        }
        if !(-90.0..=90.0).contains(&dec) {
            return Err(ProbeError::InvalidCoordinateInput(format!(
                "declination {} outside [-90, 90]",
                dec
            )));
        }
        let ra = ra.rem_euclid(360.0);
        Ok(Self { ra, dec })
    }

    #[inline]
    pub fn ra(&self) -> f64 {
        self.ra
    }

    #[inline]
    pub fn dec(&self) -> f64 {
        self.dec
    }
}

impl fmt::Display for SkyCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.ra, self.dec)
    }
}

/// Unresolved position as found in a cone list
#[derive(Debug, Clone, PartialEq)]
pub enum PositionSpec {
    /// (ra, dec) in degrees, interpreted positionally
    Degrees { ra: f64, dec: f64 },
    /// Literal coordinate string or object name
    Text(String),
    Resolved(SkyCoord),
}

impl fmt::Display for PositionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSpec::Degrees { ra, dec } => write!(f, "({}, {})", ra, dec),
            PositionSpec::Text(text) => write!(f, "'{}'", text),
            PositionSpec::Resolved(coord) => write!(f, "{}", coord),
        }
    }
}

/// External name-resolution capability
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve_name(&self, name: &str) -> Result<SkyCoord>;
}

/// Resolves object names through the CDS Sesame service
pub struct SesameResolver {
    http: Arc<dyn HttpBackend>,
    base_url: String,
}

impl SesameResolver {
    pub fn new(http: Arc<dyn HttpBackend>) -> Self {
        Self::with_url(http, SESAME_URL)
    }

    pub fn with_url(http: Arc<dyn HttpBackend>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl NameResolver for SesameResolver {
    async fn resolve_name(&self, name: &str) -> Result<SkyCoord> {
        let encoded: String = url::form_urlencoded::byte_serialize(name.trim().as_bytes()).collect();
        let url = format!("{}?{}", self.base_url, encoded);

        let text = self
            .http
            .send(HttpRequest::get(url))
            .await?
            .error_for_status()?
            .text()
            .await?;

        // The %J line holds the J2000 position in decimal degrees.
        let coord = text
            .lines()
            .find_map(|line| {
                let rest = line.trim().strip_prefix("%J ")?;
                let mut parts = rest.split_whitespace();
                let ra = parts.next()?.parse::<f64>().ok()?;
                let dec = parts.next()?.parse::<f64>().ok()?;
                Some((ra, dec))
            })
            .ok_or_else(|| ProbeError::UnresolvableName(name.to_string()))?;

        debug!(name = name, ra = coord.0, dec = coord.1, "Resolved object name");
        SkyCoord::new(coord.0, coord.1)
    }
}

/// Turns position specs into coordinates.
///
/// Successful name lookups are cached for the life of the resolver; every
/// service of a run is queried at the same positions.
pub struct CoordinateResolver {
    names: Arc<dyn NameResolver>,
    cache: Mutex<HashMap<String, SkyCoord>>,
}

impl CoordinateResolver {
    pub fn new(names: Arc<dyn NameResolver>) -> Self {
        Self {
            names,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve_name(&self, name: &str) -> Result<SkyCoord> {
        let key = name.trim().to_string();
        if let Some(coord) = self.cache.lock().get(&key) {
            return Ok(*coord);
        }
        let coord = self.names.resolve_name(&key).await?;
        self.cache.lock().insert(key, coord);
        Ok(coord)
    }

    /// `None` means "no substitution" (replay and services-only runs).
    pub async fn resolve(&self, spec: Option<&PositionSpec>) -> Result<Option<SkyCoord>> {
        let spec = match spec {
            Some(spec) => spec,
            None => return Ok(None),
        };
        let coord = match spec {
            PositionSpec::Degrees { ra, dec } => SkyCoord::new(*ra, *dec)?,
            PositionSpec::Resolved(coord) => *coord,
            PositionSpec::Text(text) => match parse_literal(text) {
                Some(parsed) => parsed?,
                None => {
                    if text.trim().is_empty() {
                        return Err(ProbeError::InvalidCoordinateInput(
                            "empty position string".into(),
                        ));
                    }
                    self.resolve_name(text).await.map_err(|e| match e {
                        ProbeError::UnresolvableName(_) => e,
                        other => {
                            warn!(name = %text, error = %other, "Name resolution failed");
                            ProbeError::UnresolvableName(format!("{}: {}", text, other))
                        }
                    })?
                }
            },
        };
        Ok(Some(coord))
    }
}

/// Parse a literal coordinate string.
///
/// Returns `None` when the text does not look like coordinates at all, so the
/// caller can fall back to name resolution.
pub fn parse_literal(text: &str) -> Option<Result<SkyCoord>> {
    let cleaned = text.replace(',', " ");
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();

    match tokens.len() {
        2 => {
            if let (Some(ra), Some(dec)) = (parse_degrees(tokens[0]), parse_degrees(tokens[1])) {
                return Some(SkyCoord::new(ra, dec));
            }
            if is_sexagesimal(tokens[0]) && is_sexagesimal(tokens[1]) {
                let ra = parse_sexagesimal(tokens[0])?;
                let dec = parse_sexagesimal(tokens[1])?;
                return Some(check_sexagesimal(ra, dec));
            }
            None
        }
        6 => {
            let ra = parse_sexagesimal(&tokens[..3].join(":"))?;
            let dec = parse_sexagesimal(&tokens[3..].join(":"))?;
            Some(check_sexagesimal(ra, dec))
        }
        _ => None,
    }
}

fn check_sexagesimal(ra_hours: f64, dec: f64) -> Result<SkyCoord> {
    if !(0.0..24.0).contains(&ra_hours) {
        return Err(ProbeError::InvalidCoordinateInput(format!(
            "right ascension {}h outside [0, 24)",
            ra_hours
        )));
    }
    SkyCoord::new(ra_hours * 15.0, dec)
}

fn parse_degrees(token: &str) -> Option<f64> {
    let number = token
        .strip_suffix("deg")
        .or_else(|| token.strip_suffix('d'))
        .unwrap_or(token);
    number.parse::<f64>().ok()
}

fn is_sexagesimal(token: &str) -> bool {
    token.contains(':') || token.contains(['h', 'd', 'm', 's'])
}

/// Parse `AA:BB:CC.c` or `AAhBBmCC.cs` / `AAdBBmCC.cs` into a decimal value
/// in the unit of the leading component.
fn parse_sexagesimal(token: &str) -> Option<f64> {
    let negative = token.starts_with('-');
    let body = token.trim_start_matches(['+', '-']);
    let parts: Vec<&str> = body
        .split([':', 'h', 'd', 'm', 's'])
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let mut values = [0.0f64; 3];
    for (slot, part) in values.iter_mut().zip(parts.iter()) {
        *slot = part.parse::<f64>().ok()?;
        if *slot < 0.0 {
            return None;
        }
    }
    if values[1] >= 60.0 || values[2] >= 60.0 {
        return None;
    }

    let magnitude = values[0] + values[1] / 60.0 + values[2] / 3600.0;
    Some(if negative { -magnitude } else { magnitude })
}


#[cfg(test)]
mod tests {
    use super::testing::FixedNames;
    use super::*;
    use crate::http::testing::StubBackend;
    use crate::http::HttpResponse;

    fn resolver(names: FixedNames) -> CoordinateResolver {
        CoordinateResolver::new(Arc::new(names))
    }

    #[test]
    fn test_sky_coord_normalises_ra() {
        let c = SkyCoord::new(-10.0, 20.0).unwrap();
        assert!((c.ra() - 350.0).abs() < 1e-12);
        assert!(SkyCoord::new(10.0, 91.0).is_err());
        assert!(SkyCoord::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_parse_literal_degrees() {
        let c = parse_literal("10.68458 41.26917").unwrap().unwrap();
        assert!((c.ra() - 10.68458).abs() < 1e-9);
        assert!((c.dec() - 41.26917).abs() < 1e-9);

        let c = parse_literal("125.886d, 21.3377d").unwrap().unwrap();
        assert!((c.ra() - 125.886).abs() < 1e-9);

        assert!(parse_literal("10 95").unwrap().is_err());
    }

    #[test]
    fn test_parse_literal_sexagesimal() {
        let c = parse_literal("00:42:44.3 +41:16:09").unwrap().unwrap();
        assert!((c.ra() - 10.684583).abs() < 1e-5);
        assert!((c.dec() - 41.269167).abs() < 1e-5);

        let c = parse_literal("00h42m44.3s +41d16m09s").unwrap().unwrap();
        assert!((c.ra() - 10.684583).abs() < 1e-5);

        let c = parse_literal("12 30 00 -05 30 00").unwrap().unwrap();
        assert!((c.ra() - 187.5).abs() < 1e-9);
        assert!((c.dec() + 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_literal_names_fall_through() {
        assert!(parse_literal("M31").is_none());
        assert!(parse_literal("NGC 1068").is_none());
        assert!(parse_literal("Crab Nebula").is_none());
    }

    #[tokio::test]
    async fn test_resolve_variants() {
        let r = resolver(FixedNames::with("M31", 10.6847, 41.2687));

        assert_eq!(r.resolve(None).await.unwrap(), None);

        let c = r
            .resolve(Some(&PositionSpec::Degrees { ra: 1.0, dec: 2.0 }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((c.ra(), c.dec()), (1.0, 2.0));

        let c = r
            .resolve(Some(&PositionSpec::Text("M31".into())))
            .await
            .unwrap()
            .unwrap();
        assert!((c.ra() - 10.6847).abs() < 1e-9);

        let err = r
            .resolve(Some(&PositionSpec::Text("NoSuchThing".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::UnresolvableName(_)));

        let err = r
            .resolve(Some(&PositionSpec::Degrees { ra: 0.0, dec: -100.0 }))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidCoordinateInput(_)));
    }

    struct CountingNames(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl NameResolver for CountingNames {
        async fn resolve_name(&self, _name: &str) -> Result<SkyCoord> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            SkyCoord::new(202.47, 47.195)
        }
    }

    #[tokio::test]
    async fn test_names_resolved_once() {
        let names = Arc::new(CountingNames(Default::default()));
        let r = CoordinateResolver::new(names.clone());
        let m51 = PositionSpec::Text("M51".into());
        for _ in 0..3 {
            let c = r.resolve(Some(&m51)).await.unwrap().unwrap();
            assert_eq!(c.dec(), 47.195);
        }
        assert_eq!(names.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sesame_resolver() {
        let backend = Arc::new(StubBackend::new(|req, _| {
            if req.url.ends_with("?M31") {
                Ok(HttpResponse::from_bytes(
                    200,
                    req.url.clone(),
                    "# M31\n#=Sc=Simbad: 1\n%J 010.68470833 +41.26875000 = 00:42:44.33 +41:16:07.5\n",
                ))
            } else {
                Ok(HttpResponse::from_bytes(200, req.url.clone(), "#! *** Nothing found ***\n"))
            }
        }));
        let sesame = SesameResolver::with_url(backend.clone(), "http://sesame.test/A");

        let c = sesame.resolve_name("M31").await.unwrap();
        assert!((c.ra() - 10.68470833).abs() < 1e-9);
        assert!((c.dec() - 41.26875).abs() < 1e-9);

        let err = sesame.resolve_name("Nowhere").await.unwrap_err();
        assert!(matches!(err, ProbeError::UnresolvableName(_)));
        assert_eq!(backend.requests()[0].url, "http://sesame.test/A?M31");
    }
}
