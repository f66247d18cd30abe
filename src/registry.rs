//! npm registry access and response normalization.
//!
//! `RegistryClient` performs the raw fetches; `to_summary` / `to_versions` /
//! `to_details` are pure functions over the decoded record, each taking the
//! source URL explicitly so one fetch can be normalized several ways.
//! `fetch_downloads` is the only place partial failure is tolerated rather
//! than surfaced.

use std::sync::OnceLock;
use std::time::Duration;

use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GatewayError;

const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org";
const DEFAULT_DOWNLOADS_URL: &str = "https://api.npmjs.org/downloads/point";

/// Reported as `sourceUrl` on download stats; the per-period request URLs
/// all live under this base.
pub const DOWNLOADS_SOURCE_URL: &str = "https://api.npmjs.org/downloads/";

/// Sentinel when a record has no `latest` dist-tag.
pub const LATEST_UNAVAILABLE: &str = "N/A";

/// Base URLs for the registry and downloads endpoints. Injected rather than
/// hard-coded so tests can point the client at a local stub.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub registry_url: String,
    pub downloads_url: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_url: std::env::var("NPMLENS_REGISTRY_URL")
                .unwrap_or_else(|_| DEFAULT_REGISTRY_URL.to_string()),
            downloads_url: std::env::var("NPMLENS_DOWNLOADS_URL")
                .unwrap_or_else(|_| DEFAULT_DOWNLOADS_URL.to_string()),
        }
    }
}

/// Download-count period accepted by the downloads endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Period {
    LastDay,
    LastWeek,
    LastMonth,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Period::LastDay => "last-day",
            Period::LastWeek => "last-week",
            Period::LastMonth => "last-month",
        }
    }
}

/// Raw registry record, decoded tolerantly: every field the registry may or
/// may not ship is optional, and fields with more than one upstream shape
/// (license, repository, maintainers) stay as `Value` until normalization.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PackageRecord {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "dist-tags")]
    pub dist_tags: Map<String, Value>,
    /// Version string (or internal marker like "created") to publish time.
    pub time: Map<String, Value>,
    pub license: Option<Value>,
    pub homepage: Option<String>,
    pub repository: Option<Value>,
    pub maintainers: Option<Value>,
    pub keywords: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DownloadPoint {
    downloads: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSummary {
    pub name: String,
    pub latest_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_date_latest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    pub source_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintainerInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageDetails {
    #[serde(flatten)]
    pub summary: PackageSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintainers: Option<Vec<MaintainerInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVersions {
    /// Filtered semver string to publish time, in registry iteration order.
    pub versions: Map<String, Value>,
    pub source_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStats {
    /// Only periods that were requested and resolved are present; a failed
    /// period is omitted rather than reported as zero.
    pub downloads: Map<String, Value>,
    pub package: String,
    pub source_url: String,
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    config: RegistryConfig,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .user_agent("npmlens (npm metadata gateway)")
            .build()
            .map_err(|e| GatewayError::RequestSetup {
                message: e.to_string(),
            })?;
        Ok(Self { config, http })
    }

    /// Registry record URL for a package. Names are percent-encoded because
    /// scoped names (`@scope/name`) contain `/`.
    pub fn record_url(&self, name: &str) -> String {
        format!(
            "{}/{}",
            self.config.registry_url.trim_end_matches('/'),
            urlencoding::encode(name)
        )
    }

    pub async fn fetch_package_record(&self, name: &str) -> Result<PackageRecord, GatewayError> {
        let url = self.record_url(name);
        info!("GET {url}");
        let resp = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound {
                name: name.to_string(),
            });
        }
        if !status.is_success() {
            debug!("GET {url} -> HTTP {status}");
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
            });
        }
        resp.json::<PackageRecord>()
            .await
            .map_err(|e| GatewayError::Malformed {
                origin: "registry",
                message: e.to_string(),
            })
    }

    /// Single-period download count. Failures of any kind are expected to be
    /// tolerated by the aggregator, so they are logged and mapped to `None`
    /// instead of propagating.
    pub async fn fetch_download_count(&self, period: Period, name: &str) -> Option<u64> {
        let url = format!(
            "{}/{}/{}",
            self.config.downloads_url.trim_end_matches('/'),
            period.as_str(),
            urlencoding::encode(name)
        );
        info!("GET {url}");
        let resp = match self.http.get(&url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                debug!("downloads fetch failed for {}: {err}", period.as_str());
                return None;
            }
        };
        if !resp.status().is_success() {
            debug!(
                "downloads fetch for {} -> HTTP {}",
                period.as_str(),
                resp.status()
            );
            return None;
        }
        match resp.json::<DownloadPoint>().await {
            Ok(point) => point.downloads,
            Err(err) => {
                debug!("downloads decode failed for {}: {err}", period.as_str());
                None
            }
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_builder() {
        GatewayError::RequestSetup {
            message: err.to_string(),
        }
    } else {
        GatewayError::NoResponse {
            message: err.to_string(),
        }
    }
}

/// Fetch download counts for the requested period, or all three when none is
/// given. All fetches run concurrently and every one settles before the
/// result is assembled; a slow or failing period never aborts the others,
/// and a fetch where every period failed still succeeds with an empty map.
pub async fn fetch_downloads(
    client: &RegistryClient,
    name: &str,
    period: Option<Period>,
) -> DownloadStats {
    let fetch = |p: Period| {
        let wanted = period.is_none() || period == Some(p);
        async move {
            if !wanted {
                return None;
            }
            client.fetch_download_count(p, name).await
        }
    };

    let (day, week, month) = tokio::join!(
        fetch(Period::LastDay),
        fetch(Period::LastWeek),
        fetch(Period::LastMonth),
    );

    let mut downloads = Map::new();
    for (p, count) in [
        (Period::LastDay, day),
        (Period::LastWeek, week),
        (Period::LastMonth, month),
    ] {
        if let Some(count) = count {
            downloads.insert(p.as_str().to_string(), Value::from(count));
        }
    }

    DownloadStats {
        downloads,
        package: name.to_string(),
        source_url: DOWNLOADS_SOURCE_URL.to_string(),
    }
}

/// Keys in the `time` map that are real versions, as opposed to markers like
/// "created"/"modified".
fn semver_key() -> &'static Regex {
    static SEMVER_KEY: OnceLock<Regex> = OnceLock::new();
    SEMVER_KEY.get_or_init(|| {
        Regex::new(r"^\d+\.\d+\.\d+([-.].*)?$").expect("semver key pattern is valid")
    })
}

pub fn to_summary(record: &PackageRecord, source_url: &str) -> PackageSummary {
    let latest = record
        .dist_tags
        .get("latest")
        .and_then(Value::as_str)
        .map(str::to_string);
    let publish_date_latest = latest
        .as_deref()
        .and_then(|v| record.time.get(v))
        .and_then(Value::as_str)
        .map(str::to_string);

    PackageSummary {
        name: record.name.clone().unwrap_or_default(),
        latest_version: latest.unwrap_or_else(|| LATEST_UNAVAILABLE.to_string()),
        description: record.description.clone(),
        publish_date_latest,
        license: normalize_license(record.license.as_ref()),
        homepage: record.homepage.clone(),
        repository_url: normalize_repository_url(record.repository.as_ref()),
        source_url: source_url.to_string(),
    }
}

pub fn to_versions(record: &PackageRecord, source_url: &str) -> PackageVersions {
    let mut versions = Map::new();
    for (key, published) in &record.time {
        if semver_key().is_match(key) {
            versions.insert(key.clone(), published.clone());
        }
    }
    PackageVersions {
        versions,
        source_url: source_url.to_string(),
    }
}

pub fn to_details(record: &PackageRecord, source_url: &str) -> PackageDetails {
    PackageDetails {
        summary: to_summary(record, source_url),
        maintainers: maintainer_projection(record.maintainers.as_ref()),
        keywords: keyword_list(record.keywords.as_ref()),
    }
}

/// String license passes through; object license contributes its `type`
/// field; anything else is absent. Never invents a value.
fn normalize_license(license: Option<&Value>) -> Option<String> {
    match license {
        Some(Value::String(spdx)) => Some(spdx.clone()),
        Some(Value::Object(obj)) => obj
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Strips the literal `git+` prefix and `.git` suffix from the repository
/// URL, when a repository descriptor with a URL is present.
fn normalize_repository_url(repository: Option<&Value>) -> Option<String> {
    let url = repository?.get("url")?.as_str()?;
    let url = url.strip_prefix("git+").unwrap_or(url);
    let url = url.strip_suffix(".git").unwrap_or(url);
    Some(url.to_string())
}

fn maintainer_projection(maintainers: Option<&Value>) -> Option<Vec<MaintainerInfo>> {
    let list = maintainers?.as_array()?;
    let projected: Vec<MaintainerInfo> = list
        .iter()
        .filter_map(|entry| {
            let obj = entry.as_object()?;
            Some(MaintainerInfo {
                name: obj.get("name").and_then(Value::as_str).map(str::to_string),
                email: obj
                    .get("email")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect();
    if projected.is_empty() {
        None
    } else {
        Some(projected)
    }
}

fn keyword_list(keywords: Option<&Value>) -> Option<Vec<String>> {
    let list = keywords?.as_array()?;
    let words: Vec<String> = list
        .iter()
        .filter_map(|k| k.as_str().map(str::to_string))
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words)
    }
}
