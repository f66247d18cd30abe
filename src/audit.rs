//! Local `npm audit` and `npm audit fix --dry-run` execution.
//!
//! Both operations require `package-lock.json` in the target directory and
//! normalize npm's own JSON output into compact result shapes. npm exits
//! non-zero when vulnerabilities are found while still printing a full JSON
//! report, so exit status alone is not an error signal here: only an empty
//! stdout marks real invocation failure.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::GatewayError;

pub const LOCKFILE: &str = "package-lock.json";

const NPM_TIMEOUT: Duration = Duration::from_secs(300);
const RAW_EXCERPT_CHARS: usize = 300;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeveritySummary {
    pub info: u64,
    pub low: u64,
    pub moderate: u64,
    pub high: u64,
    pub critical: u64,
    /// Sum of the severity buckets above.
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityEntry {
    pub package: String,
    pub version: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisory_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResult {
    pub run_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npm_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_report_version: Option<u64>,
    pub summary: SeveritySummary,
    pub vulnerabilities: Vec<VulnerabilityEntry>,
    /// Full parsed report, retained for passthrough and debugging.
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixCounts {
    pub added: u64,
    pub removed: u64,
    pub changed: u64,
    pub audited: u64,
    pub funding: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAction {
    pub action: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_major: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixSimulationResult {
    pub run_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npm_version: Option<String>,
    pub counts: FixCounts,
    pub actions: Vec<FixAction>,
    pub raw: Value,
}

/// Run `npm audit --json` in the project directory and normalize the report.
pub async fn run_audit(project: &Path) -> Result<AuditResult, GatewayError> {
    ensure_lockfile(project)?;
    let stdout = run_npm(project, &["audit", "--json"]).await?;
    let report: Value = serde_json::from_str(&stdout).map_err(|e| GatewayError::Malformed {
        origin: "npm audit",
        message: format!("{e}; output began: {}", excerpt(&stdout)),
    })?;
    Ok(normalize_audit_report(report, npm_version().await))
}

/// Run `npm audit fix --dry-run --json` and normalize the proposed changes.
pub async fn simulate_fix(project: &Path) -> Result<FixSimulationResult, GatewayError> {
    ensure_lockfile(project)?;
    let stdout = run_npm(project, &["audit", "fix", "--dry-run", "--json"]).await?;
    let report = parse_json_with_preamble(&stdout, "npm audit fix")?;
    Ok(normalize_fix_report(report, npm_version().await))
}

fn ensure_lockfile(project: &Path) -> Result<(), GatewayError> {
    if project.join(LOCKFILE).is_file() {
        Ok(())
    } else {
        Err(GatewayError::MissingLockfile {
            dir: project.display().to_string(),
        })
    }
}

async fn run_npm(project: &Path, args: &[&str]) -> Result<String, GatewayError> {
    let command_line = format!("npm {}", args.join(" "));
    debug!("running `{command_line}` in {}", project.display());

    let child = Command::new("npm")
        .args(args)
        .current_dir(project)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| GatewayError::Subprocess {
            command: command_line.clone(),
            message: format!("spawn failed: {e}"),
        })?;

    let out = timeout(NPM_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| GatewayError::Subprocess {
            command: command_line.clone(),
            message: format!("timed out after {}s", NPM_TIMEOUT.as_secs()),
        })?
        .map_err(|e| GatewayError::Subprocess {
            command: command_line.clone(),
            message: format!("wait failed: {e}"),
        })?;

    let stdout = String::from_utf8_lossy(&out.stdout).to_string();
    if !out.status.success() && stdout.trim().is_empty() {
        // Non-zero with output is npm reporting findings; non-zero with no
        // output is a real invocation failure.
        let stderr = String::from_utf8_lossy(&out.stderr);
        debug!("`{command_line}` stderr: {stderr}");
        return Err(GatewayError::Subprocess {
            command: command_line,
            message: format!("{} with no output: {}", out.status, excerpt(&stderr)),
        });
    }
    Ok(stdout)
}

/// Best-effort `npm --version` capture; absent rather than fatal when npm
/// cannot report one.
async fn npm_version() -> Option<String> {
    let out = timeout(
        Duration::from_secs(10),
        Command::new("npm").arg("--version").output(),
    )
    .await
    .ok()?
    .ok()?;
    if !out.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

/// `npm audit fix` may print progress or warning text before the JSON
/// payload begins. Parse one value greedily from the first `{` and ignore
/// trailing bytes.
fn parse_json_with_preamble(output: &str, origin: &'static str) -> Result<Value, GatewayError> {
    let start = output.find('{').ok_or_else(|| GatewayError::Malformed {
        origin,
        message: format!("no JSON object in output: {}", excerpt(output)),
    })?;
    let mut de = serde_json::Deserializer::from_str(&output[start..]);
    Value::deserialize(&mut de).map_err(|e| GatewayError::Malformed {
        origin,
        message: format!("{e}; output began: {}", excerpt(output)),
    })
}

fn normalize_audit_report(report: Value, npm_version: Option<String>) -> AuditResult {
    let meta = report.get("metadata").and_then(|m| m.get("vulnerabilities"));
    let bucket = |key: &str| meta.and_then(|m| m.get(key)).and_then(Value::as_u64).unwrap_or(0);

    let info = bucket("info");
    let low = bucket("low");
    let moderate = bucket("moderate");
    let high = bucket("high");
    let critical = bucket("critical");
    let summary = SeveritySummary {
        info,
        low,
        moderate,
        high,
        critical,
        total: info + low + moderate + high + critical,
    };

    let mut vulnerabilities = Vec::new();
    if let Some(map) = report.get("vulnerabilities").and_then(Value::as_object) {
        for (package, vuln) in map {
            let severity = vuln
                .get("severity")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let version = vuln
                .get("installedVersion")
                .and_then(Value::as_str)
                .or_else(|| vuln.get("range").and_then(Value::as_str))
                .unwrap_or("unknown")
                .to_string();
            let advisory_url = vuln
                .get("via")
                .and_then(Value::as_array)
                .and_then(|via| {
                    via.iter()
                        .find_map(|entry| entry.get("url").and_then(Value::as_str))
                })
                .map(str::to_string);
            vulnerabilities.push(VulnerabilityEntry {
                package: package.clone(),
                version,
                severity,
                advisory_url,
            });
        }
    }

    AuditResult {
        run_at: Utc::now().to_rfc3339(),
        npm_version,
        audit_report_version: report.get("auditReportVersion").and_then(Value::as_u64),
        summary,
        vulnerabilities,
        raw: report,
    }
}

fn normalize_fix_report(report: Value, npm_version: Option<String>) -> FixSimulationResult {
    let count = |key: &str| report.get(key).and_then(Value::as_u64).unwrap_or(0);
    let counts = FixCounts {
        added: count("added"),
        removed: count("removed"),
        changed: count("changed"),
        audited: count("audited"),
        funding: count("funding"),
    };

    let mut actions = Vec::new();
    if let Some(list) = report.get("actions").and_then(Value::as_array) {
        for entry in list {
            // Field-by-field extraction: a malformed field leaves that field
            // absent instead of aborting the whole action list.
            let field = |key: &str| entry.get(key).and_then(Value::as_str).map(str::to_string);
            actions.push(FixAction {
                action: field("action")
                    .unwrap_or_else(|| "unknown".to_string())
                    .to_lowercase(),
                name: field("name").or_else(|| field("module")).unwrap_or_default(),
                version: field("target").or_else(|| field("version")),
                previous_version: field("previousVersion").or_else(|| field("current")),
                is_major: entry.get("isMajor").and_then(Value::as_bool),
                path: field("path"),
            });
        }
    }

    FixSimulationResult {
        run_at: Utc::now().to_rfc3339(),
        npm_version,
        counts,
        actions,
        raw: report,
    }
}

/// Bounded fragment of raw output for error messages, so diagnosis stays
/// possible without unbounded log growth.
fn excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() <= RAW_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut end = RAW_EXCERPT_CHARS;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn audit_fails_before_spawning_when_lockfile_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_audit(dir.path()).await.unwrap_err();
        match &err {
            GatewayError::MissingLockfile { dir: reported } => {
                assert!(reported.contains(dir.path().file_name().unwrap().to_str().unwrap()));
            }
            other => panic!("expected MissingLockfile, got {other:?}"),
        }
        assert_eq!(err.code(), "PRECONDITION_FAILED");
        assert!(err.to_string().contains(LOCKFILE));
    }

    #[tokio::test]
    async fn fix_simulation_has_the_same_lockfile_precondition() {
        let dir = tempfile::tempdir().unwrap();
        let err = simulate_fix(dir.path()).await.unwrap_err();
        assert_eq!(err.code(), "PRECONDITION_FAILED");
    }

    #[test]
    fn preamble_before_json_payload_is_skipped() {
        let output = "npm WARN using --force\nup to date in 1s\n{\"added\": 1, \"audited\": 42}\ntrailing noise";
        let value = parse_json_with_preamble(output, "npm audit fix").unwrap();
        assert_eq!(value["added"], 1);
        assert_eq!(value["audited"], 42);
    }

    #[test]
    fn output_without_any_json_object_is_malformed() {
        let err = parse_json_with_preamble("no json here at all", "npm audit fix").unwrap_err();
        assert_eq!(err.code(), "MALFORMED_OUTPUT");
        assert!(err.to_string().contains("no json here at all"));
    }

    #[test]
    fn broken_json_after_first_brace_is_malformed() {
        let err = parse_json_with_preamble("warning\n{\"added\": ", "npm audit fix").unwrap_err();
        assert_eq!(err.code(), "MALFORMED_OUTPUT");
    }

    #[test]
    fn malformed_excerpt_is_bounded() {
        let noise = "x".repeat(5_000);
        let err = parse_json_with_preamble(&noise, "npm audit fix").unwrap_err();
        assert!(err.to_string().len() < 500);
    }

    #[test]
    fn audit_summary_sums_severity_buckets() {
        let report = json!({
            "auditReportVersion": 2,
            "metadata": {
                "vulnerabilities": {
                    "info": 1, "low": 2, "moderate": 0, "high": 3, "critical": 1,
                    "total": 7
                }
            },
            "vulnerabilities": {}
        });
        let result = normalize_audit_report(report, Some("10.2.0".to_string()));
        assert_eq!(result.summary.total, 7);
        assert_eq!(result.summary.high, 3);
        assert_eq!(result.audit_report_version, Some(2));
        assert_eq!(result.npm_version.as_deref(), Some("10.2.0"));
    }

    #[test]
    fn audit_vulnerabilities_are_flattened_with_defaults() {
        let report = json!({
            "vulnerabilities": {
                "lodash": {
                    "severity": "high",
                    "range": "<4.17.21",
                    "via": [
                        "lodash",
                        { "url": "https://github.com/advisories/GHSA-xxxx" }
                    ]
                },
                "minimist": {
                    "installedVersion": "1.2.0",
                    "via": []
                }
            }
        });
        let result = normalize_audit_report(report, None);
        assert_eq!(result.vulnerabilities.len(), 2);

        let lodash = result
            .vulnerabilities
            .iter()
            .find(|v| v.package == "lodash")
            .unwrap();
        assert_eq!(lodash.severity, "high");
        assert_eq!(lodash.version, "<4.17.21");
        assert_eq!(
            lodash.advisory_url.as_deref(),
            Some("https://github.com/advisories/GHSA-xxxx")
        );

        let minimist = result
            .vulnerabilities
            .iter()
            .find(|v| v.package == "minimist")
            .unwrap();
        assert_eq!(minimist.severity, "unknown");
        assert_eq!(minimist.version, "1.2.0");
        assert!(minimist.advisory_url.is_none());
    }

    #[test]
    fn audit_raw_report_is_retained() {
        let report = json!({ "vulnerabilities": {}, "custom": "marker" });
        let result = normalize_audit_report(report, None);
        assert_eq!(result.raw["custom"], "marker");
    }

    #[test]
    fn fix_actions_are_mapped_defensively() {
        let report = json!({
            "added": 2,
            "removed": 1,
            "changed": 3,
            "audited": 120,
            "funding": 14,
            "actions": [
                {
                    "action": "Update",
                    "module": "lodash",
                    "target": "4.17.21",
                    "current": "4.17.11",
                    "isMajor": false,
                    "path": "app > lodash"
                },
                {
                    "name": "left-pad",
                    "isMajor": "not-a-bool"
                }
            ]
        });
        let result = normalize_fix_report(report, None);
        assert_eq!(result.counts.added, 2);
        assert_eq!(result.counts.audited, 120);

        assert_eq!(result.actions.len(), 2);
        let first = &result.actions[0];
        assert_eq!(first.action, "update");
        assert_eq!(first.name, "lodash");
        assert_eq!(first.version.as_deref(), Some("4.17.21"));
        assert_eq!(first.previous_version.as_deref(), Some("4.17.11"));
        assert_eq!(first.is_major, Some(false));
        assert_eq!(first.path.as_deref(), Some("app > lodash"));

        let second = &result.actions[1];
        assert_eq!(second.action, "unknown");
        assert_eq!(second.name, "left-pad");
        assert!(second.version.is_none());
        assert!(second.is_major.is_none());
    }

    #[test]
    fn fix_counts_default_to_zero_when_absent() {
        let result = normalize_fix_report(json!({}), None);
        assert_eq!(result.counts.added, 0);
        assert_eq!(result.counts.funding, 0);
        assert!(result.actions.is_empty());
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let raw = "é".repeat(400);
        let cut = excerpt(&raw);
        assert!(cut.len() <= RAW_EXCERPT_CHARS + 3);
        assert!(cut.ends_with("..."));
    }
}
