//! Hop enrichment: the external IP-info service first, the local GeoIP
//! databases as fallback, "Unknown" as the floor.

use super::parse::{GeoPoint, HopRecord};
use crate::config::LocatorConfig;
use log::{debug, warn};
use maxminddb::geoip2;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GeoResolver {
    client: reqwest::Client,
    ipinfo_url: String,
    city: Option<maxminddb::Reader<Vec<u8>>>,
    asn: Option<maxminddb::Reader<Vec<u8>>>,
}

/// ip-api.com style response; unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default, rename = "regionName")]
    region_name: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default, rename = "as")]
    asn: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    timezone: Option<String>,
}

impl GeoResolver {
    pub fn new(config: &LocatorConfig) -> Self {
        let city = maxminddb::Reader::open_readfile(&config.geoip_city_db)
            .map_err(|err| {
                warn!(
                    "[locator] city database {} unavailable: {err}",
                    config.geoip_city_db.display()
                );
                err
            })
            .ok();
        let asn = maxminddb::Reader::open_readfile(&config.geoip_asn_db)
            .map_err(|err| {
                warn!(
                    "[locator] ASN database {} unavailable: {err}",
                    config.geoip_asn_db.display()
                );
                err
            })
            .ok();
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            ipinfo_url: config.ipinfo_url.clone(),
            city,
            asn,
        }
    }

    /// Fill the location columns of a hop in place. Private addresses skip
    /// the external service; every failure falls through to the next source.
    pub async fn enrich(&self, record: &mut HopRecord) {
        let Some(ip_text) = record.ip.clone() else {
            return;
        };
        let Ok(ip) = ip_text.parse::<IpAddr>() else {
            return;
        };

        if !is_private(ip) {
            if let Some(()) = self.enrich_from_service(&ip_text, record).await {
                return;
            }
        }
        self.enrich_from_local(ip, record);
    }

    async fn enrich_from_service(&self, ip: &str, record: &mut HopRecord) -> Option<()> {
        let url = format!("{}{}", self.ipinfo_url, ip);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!("[locator] ip-info call failed for {ip}: {err}");
                return None;
            }
        };
        let info: IpInfoResponse = response.json().await.ok()?;
        if info.status.as_deref() == Some("fail") {
            return None;
        }

        let mut location_parts = Vec::new();
        for part in [&info.country, &info.region_name, &info.city] {
            if let Some(p) = part {
                if !p.is_empty() {
                    location_parts.push(p.clone());
                }
            }
        }
        if !location_parts.is_empty() {
            record.location = location_parts.join(", ");
        }
        if let Some(asn) = info.asn {
            record.asn = asn;
        }
        if let Some(isp) = info.isp {
            record.isp = isp;
        }
        if let (Some(lat), Some(lon)) = (info.lat, info.lon) {
            record.geo = Some(GeoPoint {
                lat,
                lon,
                radius: None,
                tz: info.timezone.unwrap_or_default(),
            });
        }
        Some(())
    }

    fn enrich_from_local(&self, ip: IpAddr, record: &mut HopRecord) {
        if let Some(reader) = &self.city {
            if let Ok(city) = reader.lookup::<geoip2::City>(ip) {
                let mut parts = Vec::new();
                if let Some(country) = city
                    .country
                    .as_ref()
                    .and_then(|c| c.names.as_ref())
                    .and_then(|n| n.get("en"))
                {
                    parts.push((*country).to_string());
                }
                if let Some(name) = city
                    .city
                    .as_ref()
                    .and_then(|c| c.names.as_ref())
                    .and_then(|n| n.get("en"))
                {
                    parts.push((*name).to_string());
                }
                if !parts.is_empty() {
                    record.location = parts.join(", ");
                }
                if let Some(loc) = city.location.as_ref() {
                    if let (Some(lat), Some(lon)) = (loc.latitude, loc.longitude) {
                        record.geo = Some(GeoPoint {
                            lat,
                            lon,
                            radius: loc.accuracy_radius,
                            tz: loc.time_zone.unwrap_or_default().to_string(),
                        });
                    }
                }
            }
        }
        if let Some(reader) = &self.asn {
            if let Ok(asn) = reader.lookup::<geoip2::Asn>(ip) {
                if let Some(number) = asn.autonomous_system_number {
                    record.asn = format!("AS{number}");
                }
                if let Some(org) = asn.autonomous_system_organization {
                    record.isp = org.to_string();
                }
            }
        }
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_skip_the_service() {
        assert!(is_private("192.168.1.1".parse().unwrap()));
        assert!(is_private("10.0.0.1".parse().unwrap()));
        assert!(is_private("127.0.0.1".parse().unwrap()));
        assert!(is_private("fd00::1".parse().unwrap()));
        assert!(!is_private("1.1.1.1".parse().unwrap()));
        assert!(!is_private("2606:4700:4700::1111".parse().unwrap()));
    }

    #[test]
    fn service_response_parses_ip_api_shape() {
        let raw = r#"{
            "status": "success", "country": "Australia", "regionName": "QLD",
            "city": "Brisbane", "as": "AS13335 Cloudflare", "isp": "Cloudflare",
            "lat": -27.47, "lon": 153.02, "timezone": "Australia/Brisbane"
        }"#;
        let info: IpInfoResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(info.country.as_deref(), Some("Australia"));
        assert_eq!(info.asn.as_deref(), Some("AS13335 Cloudflare"));
        assert_eq!(info.lat, Some(-27.47));
    }
}
