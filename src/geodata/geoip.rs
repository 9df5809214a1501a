//! GeoIP lookup using a MaxMind database

use maxminddb::{geoip2, Reader};
use parking_lot::RwLock;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info, warn};

/// GeoIP database reader
pub struct GeoIpReader {
    reader: RwLock<Option<Reader<Vec<u8>>>>,
    path: String,
}

impl GeoIpReader {
    pub fn new(path: &str) -> Self {
        let reader = Self::load_database(path);
        if reader.is_some() {
            info!("Loaded GeoIP database from {}", path);
        } else {
            warn!(
                "GeoIP database not found at {}, GEOIP rules will not match",
                path
            );
        }

        GeoIpReader {
            reader: RwLock::new(reader),
            path: path.to_string(),
        }
    }

    fn load_database(path: &str) -> Option<Reader<Vec<u8>>> {
        if !Path::new(path).exists() {
            return None;
        }

        match Reader::open_readfile(path) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!("Failed to open GeoIP database: {}", e);
                None
            }
        }
    }

    pub fn reload(&self) -> bool {
        if let Some(new_reader) = Self::load_database(&self.path) {
            *self.reader.write() = Some(new_reader);
            info!("GeoIP database reloaded");
            true
        } else {
            false
        }
    }

    /// ISO country code for `ip`, uppercased
    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        let reader = self.reader.read();
        let reader = reader.as_ref()?;

        match reader.lookup::<geoip2::Country>(ip) {
            Ok(country) => {
                let code = country.country?.iso_code?;
                debug!("GeoIP lookup: {} -> {}", ip, code);
                Some(code.to_uppercase())
            }
            Err(e) => {
                debug!("GeoIP lookup failed for {}: {}", ip, e);
                None
            }
        }
    }

    pub fn matches(&self, ip: IpAddr, country_code: &str) -> bool {
        self.lookup(ip)
            .map(|code| code.eq_ignore_ascii_case(country_code))
            .unwrap_or(false)
    }

    pub fn is_loaded(&self) -> bool {
        self.reader.read().is_some()
    }
}

impl Default for GeoIpReader {
    fn default() -> Self {
        GeoIpReader::new("Country.mmdb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_database_is_tolerated() {
        let reader = GeoIpReader::new("nonexistent.mmdb");
        assert!(!reader.is_loaded());
        assert!(!reader.matches("8.8.8.8".parse().unwrap(), "US"));
    }
}
