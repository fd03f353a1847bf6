//! Country lookup against a MaxMind GeoLite2/GeoIP2 database.

use anyhow::{Context, Result};
use maxminddb::{geoip2, Mmap, Reader};
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct GeoIpService {
    reader: Arc<Reader<Mmap>>,
}

impl GeoIpService {
    /// Memory-map the `.mmdb` file at `path`
    pub fn open(path: &str) -> Result<Self> {
        let reader = unsafe { Reader::open_mmap(path) }
            .with_context(|| format!("Failed to open GeoIP database at {}", path))?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// ISO 3166 country code, when the database knows the address
    pub fn country(&self, ip: IpAddr) -> Option<String> {
        let result = self.reader.lookup(ip).ok()?;
        let country = result.decode::<geoip2::Country>().ok()??;
        country.country.iso_code.map(|code| code.to_string())
    }
}
