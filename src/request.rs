//! Request builder: service descriptor + cone -> concrete request

use std::borrow::Cow;

use crate::coords::SkyCoord;
use crate::error::{ProbeError, Result};
use crate::models::{ServiceDescriptor, ServiceKind};
use crate::stats::QueryParams;

/// Chandra's TAP service takes its cone radius in arcminutes
pub const CHANDRA_TAP_PREFIX: &str = "http://cda.harvard.edu/csctap";

/// A freshly resolved position with its search radius in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConeTarget {
    pub coord: SkyCoord,
    pub radius: f64,
}

impl ConeTarget {
    pub fn new(coord: SkyCoord, radius: f64) -> Self {
        Self { coord, radius }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltRequest {
    pub kind: ServiceKind,
    pub access_url: String,
    pub params: QueryParams,
}

impl BuiltRequest {
    /// Whitespace-normalized ADQL, TAP only
    pub fn adql(&self) -> Option<&str> {
        self.params.adql.as_deref()
    }

    /// Outbound RA/DEC/SR query parameters for a plain cone search
    pub fn cone_query(&self) -> Vec<(String, String)> {
        [
            ("RA", self.params.ra),
            ("DEC", self.params.dec),
            ("SR", self.params.sr),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key.to_string(), v.to_string())))
        .collect()
    }
}

/// Build the request for one (service, position) pair.
///
/// With a `target` the position is fresh: templates are filled and the
/// Chandra radius correction applies. Without one, recorded RA/DEC/SR values
/// are used verbatim (replay) or the service is queried as-is.
pub fn build_request(service: &ServiceDescriptor, target: Option<&ConeTarget>) -> Result<BuiltRequest> {
    let access_url = match service.access_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => html_unescape(url),
        _ => return Err(ProbeError::MissingAccessUrl(service.base_name.clone())),
    };

    let template = match (service.kind, service.query_template.as_deref()) {
        (ServiceKind::Tap, Some(t)) if !t.trim().is_empty() => Some(t),
        (ServiceKind::Tap, _) => {
            return Err(ProbeError::MissingAdqlTemplate(service.base_name.clone()))
        }
        _ => None,
    };

    let (ra, dec, sr) = match target {
        Some(target) => {
            let radius = if access_url.starts_with(CHANDRA_TAP_PREFIX) {
                60.0 * target.radius
            } else {
                target.radius
            };
            (Some(target.coord.ra()), Some(target.coord.dec()), Some(radius))
        }
        None => match &service.recorded {
            Some(rec) => (rec.ra, rec.dec, rec.sr),
            None => (None, None, None),
        },
    };

    let mut params = QueryParams::cone(ra, dec, sr);
    let mut url = access_url;

    match service.kind {
        ServiceKind::PlainCone => {}
        ServiceKind::ExtendedCone => {
            let values: Vec<f64> = [ra, dec, sr].into_iter().flatten().collect();
            let args: &[f64] = if values.len() == 3 { &values } else { &[] };
            url = fill_template(&url, args)?;
        }
        ServiceKind::Tap => {
            let template = template.unwrap_or_default();
            let adql = match target {
                Some(_) => match (ra, dec, sr) {
                    (Some(ra), Some(dec), Some(sr)) => fill_template(template, &[ra, dec, sr])?,
                    _ => template.to_string(),
                },
                None => template.to_string(),
            };
            params.adql = Some(fix_white(&adql));
        }
    }

    Ok(BuiltRequest {
        kind: service.kind,
        access_url: url,
        params,
    })
}

/// Substitute `{}`, `{n}` and `{n:.Pf}` placeholders with decimal values.
/// `{{` and `}}` are literal braces. Any placeholder left unresolved is an error.
pub fn fill_template(template: &str, args: &[f64]) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars().peekable();
    let mut next_auto = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => {
                return Err(ProbeError::Config(format!(
                    "single '}}' in template: {}",
                    template
                )))
            }
            '{' => {
                let mut field = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    field.push(c);
                }
                if !closed {
                    return Err(ProbeError::Config(format!(
                        "unterminated placeholder in template: {}",
                        template
                    )));
                }

                let (index, spec) = match field.split_once(':') {
                    Some((index, spec)) => (index, Some(spec)),
                    None => (field.as_str(), None),
                };
                let index = if index.is_empty() {
                    next_auto += 1;
                    next_auto - 1
                } else {
                    index.parse::<usize>().map_err(|_| {
                        ProbeError::Config(format!("unsupported placeholder {{{}}}", field))
                    })?
                };
                let value = args.get(index).ok_or_else(|| {
                    ProbeError::Config(format!(
                        "unresolved placeholder {{{}}} in template: {}",
                        field, template
                    ))
                })?;

                match spec.map(precision) {
                    None => out.push_str(&value.to_string()),
                    Some(Some(p)) => out.push_str(&format!("{:.*}", p, value)),
                    Some(None) => {
                        return Err(ProbeError::Config(format!(
                            "unsupported format spec in {{{}}}",
                            field
                        )))
                    }
                }
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

// ".6f" -> 6
fn precision(spec: &str) -> Option<usize> {
    spec.strip_prefix('.')?.strip_suffix('f')?.parse().ok()
}

/// Collapse whitespace runs to single spaces and trim the ends
pub fn fix_white(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decode HTML character references in access URLs taken from registry listings.
/// Text that is not validly escaped, such as a bare `&` in a query string, is
/// returned as is.
pub fn html_unescape(s: &str) -> String {
    quick_xml::escape::unescape(s)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordedCone;

    fn target(ra: f64, dec: f64, radius: f64) -> ConeTarget {
        ConeTarget::new(SkyCoord::new(ra, dec).unwrap(), radius)
    }

    #[test]
    fn test_plain_cone() {
        let svc = ServiceDescriptor::new("HSC", ServiceKind::PlainCone, "http://h/scs?cat=x&amp;v=1");
        let req = build_request(&svc, Some(&target(10.5, -20.25, 0.1))).unwrap();
        assert_eq!(req.access_url, "http://h/scs?cat=x&v=1");
        assert_eq!(req.params.ra, Some(10.5));
        assert_eq!(req.params.dec, Some(-20.25));
        assert_eq!(req.params.sr, Some(0.1));
        assert_eq!(req.adql(), None);
        assert_eq!(
            req.cone_query(),
            vec![
                ("RA".to_string(), "10.5".to_string()),
                ("DEC".to_string(), "-20.25".to_string()),
                ("SR".to_string(), "0.1".to_string()),
            ]
        );
    }

    #[test]
    fn test_xcone_fills_url() {
        let svc = ServiceDescriptor::new(
            "Gaia",
            ServiceKind::ExtendedCone,
            "http://g/cone?POS=CIRCLE {} {} {}&FORMAT=votable",
        );
        let req = build_request(&svc, Some(&target(1.5, 2.5, 0.01))).unwrap();
        assert_eq!(req.access_url, "http://g/cone?POS=CIRCLE 1.5 2.5 0.01&FORMAT=votable");
        assert!(!req.access_url.contains('{'));

        // No position and nothing recorded: placeholders cannot be resolved
        assert!(build_request(&svc, None).is_err());
    }

    #[test]
    fn test_tap_template_and_whitespace() {
        let svc = ServiceDescriptor::new("2MASS", ServiceKind::Tap, "http://t/tap").with_query_template(
            "SELECT *\n   FROM twomass.data\n   WHERE 1=CONTAINS(POINT('ICRS', raj2000, dej2000),\n\tCIRCLE('ICRS', {}, {}, {}))",
        );
        let req = build_request(&svc, Some(&target(10.0, 20.0, 0.5))).unwrap();
        assert_eq!(
            req.adql().unwrap(),
            "SELECT * FROM twomass.data WHERE 1=CONTAINS(POINT('ICRS', raj2000, dej2000), CIRCLE('ICRS', 10, 20, 0.5))"
        );
        assert_eq!(req.access_url, "http://t/tap");
    }

    #[test]
    fn test_chandra_radius_correction() {
        let chandra = ServiceDescriptor::new("CSC", ServiceKind::Tap, "http://cda.harvard.edu/csctap")
            .with_query_template("SELECT * FROM m WHERE dbo.cone_distance(m.ra,m.dec,{},{})<={}");
        let req = build_request(&chandra, Some(&target(10.0, 20.0, 0.5))).unwrap();
        assert_eq!(req.params.sr, Some(30.0));
        assert!(req.adql().unwrap().ends_with("<=30"));

        let other = ServiceDescriptor::new("CSC", ServiceKind::PlainCone, "http://cda.harvard.edu/cscvo/coneSearch?");
        let req = build_request(&other, Some(&target(10.0, 20.0, 0.5))).unwrap();
        assert_eq!(req.params.sr, Some(0.5));
    }

    #[test]
    fn test_replay_uses_recorded_values() {
        let svc = ServiceDescriptor::new("CSC", ServiceKind::Tap, "http://cda.harvard.edu/csctap")
            .with_query_template("SELECT * FROM m WHERE dbo.cone_distance(m.ra,m.dec,1,2)<=30")
            .with_recorded(RecordedCone {
                ra: Some(1.0),
                dec: Some(2.0),
                sr: Some(30.0),
            });
        let req = build_request(&svc, None).unwrap();
        assert_eq!(req.params.sr, Some(30.0));
        assert_eq!(
            req.adql().unwrap(),
            "SELECT * FROM m WHERE dbo.cone_distance(m.ra,m.dec,1,2)<=30"
        );
    }

    #[test]
    fn test_missing_pieces() {
        let mut svc = ServiceDescriptor::new("X", ServiceKind::PlainCone, "");
        assert!(matches!(
            build_request(&svc, None),
            Err(ProbeError::MissingAccessUrl(_))
        ));
        svc.access_url = None;
        assert!(matches!(
            build_request(&svc, None),
            Err(ProbeError::MissingAccessUrl(_))
        ));

        let tap = ServiceDescriptor::new("T", ServiceKind::Tap, "http://t/tap");
        assert!(matches!(
            build_request(&tap, None),
            Err(ProbeError::MissingAdqlTemplate(_))
        ));
    }

    #[test]
    fn test_fill_template() {
        assert_eq!(fill_template("{} {} {}", &[1.0, 2.5, 3.0]).unwrap(), "1 2.5 3");
        assert_eq!(fill_template("{2},{0}", &[1.0, 2.0, 3.0]).unwrap(), "3,1");
        assert_eq!(fill_template("{0:.2f}", &[1.0]).unwrap(), "1.00");
        assert_eq!(fill_template("{{x}} {}", &[4.0]).unwrap(), "{x} 4");
        assert_eq!(fill_template("no placeholders", &[]).unwrap(), "no placeholders");
        assert!(fill_template("{} {}", &[1.0]).is_err());
        assert!(fill_template("{ra}", &[1.0]).is_err());
        assert!(fill_template("{", &[1.0]).is_err());
    }

    #[test]
    fn test_html_unescape() {
        assert_eq!(html_unescape("a&amp;b&lt;c&gt;&quot;&#39;&#x41;"), "a&b<c>\"'A");
        assert_eq!(html_unescape("x&y=1"), "x&y=1");
        assert_eq!(html_unescape("&bogus;"), "&bogus;");
        assert_eq!(html_unescape("http://h/scs?a=1&amp;b=&eacute;"), "http://h/scs?a=1&b=\u{e9}");
        assert_eq!(html_unescape("plain"), "plain");
    }
}
