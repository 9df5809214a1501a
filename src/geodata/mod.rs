//! Geo databases: IP -> country and domain -> list-code matchers

mod geoip;
mod geosite;

pub use geoip::GeoIpReader;
pub use geosite::{GeoSiteMatcher, GeoSiteReader};

use std::sync::Arc;

/// Bundle handed to the rule engine and the DNS fallback filter.
pub struct GeoData {
    pub geoip: Arc<GeoIpReader>,
    pub geosite: Arc<GeoSiteReader>,
}

impl GeoData {
    pub fn new(geoip_path: &str, geosite_path: &str) -> Self {
        GeoData {
            geoip: Arc::new(GeoIpReader::new(geoip_path)),
            geosite: Arc::new(GeoSiteReader::new(geosite_path)),
        }
    }
}

impl Default for GeoData {
    fn default() -> Self {
        Self::new("Country.mmdb", "geosite.dat")
    }
}
