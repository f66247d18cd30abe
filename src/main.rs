//! `npmlens`: npm metadata gateway.
//!
//! Answers package questions against the public npm registry (summary,
//! versions, downloads, details) and runs local `npm audit` /
//! `npm audit fix --dry-run` normalizations. Served two ways: an MCP stdio
//! server for editor/agent integration, and a CLI with one subcommand per
//! tool.

mod audit;
mod error;
mod registry;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;

use rmcp::{
    handler::server::router::tool::ToolRouter as RmcpToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::registry::{
    fetch_downloads, to_details, to_summary, to_versions, Period, RegistryClient, RegistryConfig,
};

#[derive(Parser, Debug)]
#[command(name = "npmlens")]
#[command(about = "npm metadata gateway: registry lookups and local audit tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a package summary (latest version, license, repository).
    Summary(PackageArgs),
    /// List published versions with their publish dates.
    Versions(PackageArgs),
    /// Fetch download counts for one period, or all three.
    Downloads(DownloadsArgs),
    /// Fetch package details (summary plus maintainers and keywords).
    Details(PackageArgs),
    /// Run `npm audit` against a local project and normalize the report.
    Audit(ProjectArgs),
    /// Run `npm audit fix --dry-run` and report the proposed actions.
    SimulateFix(ProjectArgs),
    /// Serve as an MCP stdio server.
    McpStdio,
}

#[derive(clap::Args, Debug)]
struct PackageArgs {
    /// npm package name (scoped names like @scope/name are fine).
    package_name: String,
}

#[derive(clap::Args, Debug)]
struct DownloadsArgs {
    /// npm package name (scoped names like @scope/name are fine).
    package_name: String,
    /// Restrict to a single period; all three when omitted.
    #[arg(long, value_enum)]
    period: Option<Period>,
}

#[derive(clap::Args, Debug)]
struct ProjectArgs {
    /// Project directory containing package-lock.json.
    project_path: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));
    let cli = Cli::parse();

    let (command_name, result): (&str, Result<Value>) = match cli.command {
        Command::Summary(args) => ("summary", run_summary(&args)),
        Command::Versions(args) => ("versions", run_versions(&args)),
        Command::Downloads(args) => ("downloads", run_downloads(&args)),
        Command::Details(args) => ("details", run_details(&args)),
        Command::Audit(args) => ("audit", run_audit_cli(&args)),
        Command::SimulateFix(args) => ("simulate-fix", run_simulate_fix_cli(&args)),
        Command::McpStdio => return run_mcp_stdio(),
    };

    let payload = serde_json::json!({
        "schema_version": 1,
        "ok": true,
        "command": command_name,
        "result": result?,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn block_on<F: Future<Output = Result<Value>>>(fut: F) -> Result<Value> {
    tokio::runtime::Runtime::new()
        .context("failed to build tokio runtime")?
        .block_on(fut)
}

fn non_empty<'a>(value: &'a str, field: &str) -> Result<&'a str, GatewayError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::Validation {
            message: format!("{field} must be a non-empty string"),
        });
    }
    Ok(trimmed)
}

fn non_empty_path<'a>(path: &'a std::path::Path, field: &str) -> Result<&'a std::path::Path, GatewayError> {
    if path.as_os_str().is_empty() {
        return Err(GatewayError::Validation {
            message: format!("{field} must be a non-empty path"),
        });
    }
    Ok(path)
}

fn run_summary(args: &PackageArgs) -> Result<Value> {
    let name = non_empty(&args.package_name, "packageName")?;
    block_on(async {
        let client = RegistryClient::new(RegistryConfig::default())?;
        let url = client.record_url(name);
        let record = client.fetch_package_record(name).await?;
        Ok(serde_json::to_value(to_summary(&record, &url))?)
    })
}

fn run_versions(args: &PackageArgs) -> Result<Value> {
    let name = non_empty(&args.package_name, "packageName")?;
    block_on(async {
        let client = RegistryClient::new(RegistryConfig::default())?;
        let url = client.record_url(name);
        let record = client.fetch_package_record(name).await?;
        Ok(serde_json::to_value(to_versions(&record, &url))?)
    })
}

fn run_downloads(args: &DownloadsArgs) -> Result<Value> {
    let name = non_empty(&args.package_name, "packageName")?;
    let period = args.period;
    block_on(async {
        let client = RegistryClient::new(RegistryConfig::default())?;
        let stats = fetch_downloads(&client, name, period).await;
        Ok(serde_json::to_value(stats)?)
    })
}

fn run_details(args: &PackageArgs) -> Result<Value> {
    let name = non_empty(&args.package_name, "packageName")?;
    block_on(async {
        let client = RegistryClient::new(RegistryConfig::default())?;
        let url = client.record_url(name);
        let record = client.fetch_package_record(name).await?;
        Ok(serde_json::to_value(to_details(&record, &url))?)
    })
}

fn run_audit_cli(args: &ProjectArgs) -> Result<Value> {
    let project = non_empty_path(&args.project_path, "projectPath")?;
    block_on(async { Ok(serde_json::to_value(audit::run_audit(project).await?)?) })
}

fn run_simulate_fix_cli(args: &ProjectArgs) -> Result<Value> {
    let project = non_empty_path(&args.project_path, "projectPath")?;
    block_on(async { Ok(serde_json::to_value(audit::simulate_fix(project).await?)?) })
}

fn run_mcp_stdio() -> Result<()> {
    // IMPORTANT: stdout is reserved for MCP JSON-RPC frames.
    // If you need diagnostics, use stderr.
    let rt = tokio::runtime::Runtime::new().context("failed to build tokio runtime")?;
    rt.block_on(async {
        let client = RegistryClient::new(RegistryConfig::default())?;
        let service = NpmlensStdioMcp::new(client);
        let running = service
            .serve(stdio())
            .await
            .context("failed to start stdio MCP server")?;
        let _ = running
            .waiting()
            .await
            .context("stdio MCP server task join failed")?;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

// --- MCP stdio server ---
//
// - keep stdout clean (transport)
// - return JSON payloads as Content::text
// - keep the tool surface small and stable

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct PackageToolArgs {
    /// npm package name (scoped names like @scope/name are fine).
    package_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct DownloadsToolArgs {
    /// npm package name (scoped names like @scope/name are fine).
    package_name: String,
    /// One of: last-day, last-week, last-month. All three when omitted.
    #[serde(default)]
    period: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct ProjectToolArgs {
    /// Project directory containing package-lock.json.
    project_path: String,
}

#[derive(Clone)]
struct NpmlensStdioMcp {
    tool_router: RmcpToolRouter<Self>,
    client: RegistryClient,
}

fn mcp_ok(tool: &str, result: Value) -> Result<CallToolResult, McpError> {
    let payload = serde_json::json!({
        "schema_version": 1,
        "ok": true,
        "tool": tool,
        "result": result,
    });
    Ok(CallToolResult::success(vec![Content::text(
        payload.to_string(),
    )]))
}

/// The caller-visible message stays short; kind code and status ride along
/// as structured error data for programmatic branching.
fn mcp_err(err: GatewayError) -> McpError {
    let data = serde_json::json!({
        "code": err.code(),
        "status": err.status(),
    });
    match err {
        GatewayError::Validation { .. } => McpError::invalid_params(err.to_string(), Some(data)),
        _ => McpError::internal_error(err.to_string(), Some(data)),
    }
}

fn to_result_value<T: serde::Serialize>(value: T) -> Result<Value, McpError> {
    serde_json::to_value(value)
        .map_err(|e| McpError::internal_error(format!("failed to encode result: {e}"), None))
}

#[tool_router]
impl NpmlensStdioMcp {
    fn new(client: RegistryClient) -> Self {
        Self {
            tool_router: Self::tool_router(),
            client,
        }
    }

    #[tool(
        description = "Get a summary of an npm package: latest version, description, license, homepage, repository"
    )]
    async fn get_npm_package_summary(
        &self,
        params: Parameters<PackageToolArgs>,
    ) -> Result<CallToolResult, McpError> {
        let name = non_empty(&params.0.package_name, "packageName").map_err(mcp_err)?;
        let url = self.client.record_url(name);
        let record = self
            .client
            .fetch_package_record(name)
            .await
            .map_err(mcp_err)?;
        mcp_ok(
            "get_npm_package_summary",
            to_result_value(to_summary(&record, &url))?,
        )
    }

    #[tool(description = "List published versions of an npm package with their publish dates")]
    async fn get_npm_package_versions(
        &self,
        params: Parameters<PackageToolArgs>,
    ) -> Result<CallToolResult, McpError> {
        let name = non_empty(&params.0.package_name, "packageName").map_err(mcp_err)?;
        let url = self.client.record_url(name);
        let record = self
            .client
            .fetch_package_record(name)
            .await
            .map_err(mcp_err)?;
        mcp_ok(
            "get_npm_package_versions",
            to_result_value(to_versions(&record, &url))?,
        )
    }

    #[tool(
        description = "Get download counts for an npm package (last-day, last-week, last-month; failed periods are omitted)"
    )]
    async fn get_npm_package_downloads(
        &self,
        params: Parameters<DownloadsToolArgs>,
    ) -> Result<CallToolResult, McpError> {
        let name = non_empty(&params.0.package_name, "packageName").map_err(mcp_err)?;
        let period = match params.0.period.as_deref() {
            None => None,
            Some("last-day") => Some(Period::LastDay),
            Some("last-week") => Some(Period::LastWeek),
            Some("last-month") => Some(Period::LastMonth),
            Some(other) => {
                return Err(McpError::invalid_params(
                    format!("period must be one of: last-day, last-week, last-month (got {other})"),
                    None,
                ));
            }
        };
        let stats = fetch_downloads(&self.client, name, period).await;
        mcp_ok("get_npm_package_downloads", to_result_value(stats)?)
    }

    #[tool(
        description = "Get npm package details: summary plus maintainers and keywords when present"
    )]
    async fn get_npm_package_details(
        &self,
        params: Parameters<PackageToolArgs>,
    ) -> Result<CallToolResult, McpError> {
        let name = non_empty(&params.0.package_name, "packageName").map_err(mcp_err)?;
        let url = self.client.record_url(name);
        let record = self
            .client
            .fetch_package_record(name)
            .await
            .map_err(mcp_err)?;
        mcp_ok(
            "get_npm_package_details",
            to_result_value(to_details(&record, &url))?,
        )
    }

    #[tool(
        description = "Run `npm audit --json` in a local project (requires package-lock.json) and normalize the report"
    )]
    async fn npm_audit(
        &self,
        params: Parameters<ProjectToolArgs>,
    ) -> Result<CallToolResult, McpError> {
        let project = non_empty(&params.0.project_path, "projectPath").map_err(mcp_err)?;
        let result = audit::run_audit(std::path::Path::new(project))
            .await
            .map_err(mcp_err)?;
        mcp_ok("npm_audit", to_result_value(result)?)
    }

    #[tool(
        description = "Run `npm audit fix --dry-run --json` in a local project and report the proposed actions without applying them"
    )]
    async fn simulate_npm_audit_fix(
        &self,
        params: Parameters<ProjectToolArgs>,
    ) -> Result<CallToolResult, McpError> {
        let project = non_empty(&params.0.project_path, "projectPath").map_err(mcp_err)?;
        let result = audit::simulate_fix(std::path::Path::new(project))
            .await
            .map_err(mcp_err)?;
        mcp_ok("simulate_npm_audit_fix", to_result_value(result)?)
    }
}

#[tool_handler]
impl rmcp::ServerHandler for NpmlensStdioMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Tools for querying the public npm registry (package summary, versions, \
                 downloads, details) and for running local `npm audit` / \
                 `npm audit fix --dry-run` against a project directory."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
