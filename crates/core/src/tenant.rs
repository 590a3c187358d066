//! Tenant identity and its transport encoding.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::TenantId;

pub const TENANT_ID_HEADER: &str = "TENANT_ID";
pub const REGION_HEADER: &str = "REGION";
pub const MAJOR_VERSION_HEADER: &str = "MAJOR_VERSION";
pub const MINOR_VERSION_HEADER: &str = "MINOR_VERSION";

/// Read-only view over a header collection (bus message headers, HTTP headers).
pub trait HeaderLookup {
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderLookup for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl HeaderLookup for BTreeMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl HeaderLookup for [(String, String)] {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A tenant: `(id, region, major_version, minor_version)`.
///
/// Two tenants are equal only if all four fields match. Values are immutable once
/// built; registries and stores key on the whole tuple in memory and on `id` in
/// Redis and Postgres.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    id: TenantId,
    region: String,
    major_version: u16,
    minor_version: u16,
}

impl Tenant {
    pub fn new(
        id: TenantId,
        region: impl Into<String>,
        major_version: u16,
        minor_version: u16,
    ) -> CoreResult<Self> {
        let region = region.into();
        if region.trim().is_empty() {
            return Err(CoreError::BadTenantHeaders("region must not be empty".into()));
        }
        Ok(Self {
            id,
            region,
            major_version,
            minor_version,
        })
    }

    pub fn id(&self) -> TenantId {
        self.id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn major_version(&self) -> u16 {
        self.major_version
    }

    pub fn minor_version(&self) -> u16 {
        self.minor_version
    }

    /// Parse a tenant from transport headers.
    pub fn from_headers<H: HeaderLookup + ?Sized>(headers: &H) -> CoreResult<Self> {
        let id = required(headers, TENANT_ID_HEADER)?
            .parse::<TenantId>()
            .map_err(|e| CoreError::BadTenantHeaders(e.to_string()))?;
        let region = required(headers, REGION_HEADER)?;
        let major_version = version(headers, MAJOR_VERSION_HEADER)?;
        let minor_version = version(headers, MINOR_VERSION_HEADER)?;
        Tenant::new(id, region, major_version, minor_version)
    }

    /// Headers that reproduce this tenant on the receiving side.
    pub fn to_headers(&self) -> [(&'static str, String); 4] {
        [
            (TENANT_ID_HEADER, self.id.to_string()),
            (REGION_HEADER, self.region.clone()),
            (MAJOR_VERSION_HEADER, self.major_version.to_string()),
            (MINOR_VERSION_HEADER, self.minor_version.to_string()),
        ]
    }
}

impl core::fmt::Display for Tenant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} {} {}.{}",
            self.id, self.region, self.major_version, self.minor_version
        )
    }
}

fn required<'a, H: HeaderLookup + ?Sized>(headers: &'a H, name: &str) -> CoreResult<&'a str> {
    match headers.header(name).map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(CoreError::BadTenantHeaders(format!("missing {name}"))),
    }
}

fn version<H: HeaderLookup + ?Sized>(headers: &H, name: &str) -> CoreResult<u16> {
    required(headers, name)?
        .parse::<u16>()
        .map_err(|e| CoreError::BadTenantHeaders(format!("{name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const ID: &str = "083839c6-c47c-42a6-9585-76492795d123";

    #[test]
    fn parses_complete_headers() {
        let h = headers(&[
            (TENANT_ID_HEADER, ID),
            (REGION_HEADER, "GMS"),
            (MAJOR_VERSION_HEADER, "83"),
            (MINOR_VERSION_HEADER, "1"),
        ]);
        let tenant = Tenant::from_headers(&h).unwrap();
        assert_eq!(tenant.id().to_string(), ID);
        assert_eq!(tenant.region(), "GMS");
        assert_eq!((tenant.major_version(), tenant.minor_version()), (83, 1));
    }

    #[test]
    fn missing_or_malformed_fields_are_rejected() {
        let cases = [
            headers(&[(REGION_HEADER, "GMS"), (MAJOR_VERSION_HEADER, "83"), (MINOR_VERSION_HEADER, "1")]),
            headers(&[(TENANT_ID_HEADER, "nope"), (REGION_HEADER, "GMS"), (MAJOR_VERSION_HEADER, "83"), (MINOR_VERSION_HEADER, "1")]),
            headers(&[(TENANT_ID_HEADER, ID), (REGION_HEADER, " "), (MAJOR_VERSION_HEADER, "83"), (MINOR_VERSION_HEADER, "1")]),
            headers(&[(TENANT_ID_HEADER, ID), (REGION_HEADER, "GMS"), (MAJOR_VERSION_HEADER, "70000"), (MINOR_VERSION_HEADER, "1")]),
            headers(&[(TENANT_ID_HEADER, ID), (REGION_HEADER, "GMS"), (MAJOR_VERSION_HEADER, "83")]),
        ];
        for h in cases {
            let err = Tenant::from_headers(&h).unwrap_err();
            assert!(matches!(err, CoreError::BadTenantHeaders(_)), "{h:?}");
        }
    }

    #[test]
    fn headers_round_trip() {
        let tenant = Tenant::new(TenantId::new(), "JMS", 185, 1).unwrap();
        let pairs: Vec<(String, String)> = tenant
            .to_headers()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(Tenant::from_headers(pairs.as_slice()).unwrap(), tenant);
    }

    #[test]
    fn equality_covers_all_four_fields() {
        let id = TenantId::new();
        let a = Tenant::new(id, "GMS", 83, 1).unwrap();
        assert_eq!(a, Tenant::new(id, "GMS", 83, 1).unwrap());
        assert_ne!(a, Tenant::new(id, "GMS", 83, 2).unwrap());
        assert_ne!(a, Tenant::new(id, "GMS", 87, 1).unwrap());
        assert_ne!(a, Tenant::new(id, "EMS", 83, 1).unwrap());
    }
}
