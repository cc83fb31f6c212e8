//! SAP OData MCP Server
//!
//! Entry point for the MCP server binary.
//! Implements MCP protocol over stdio using JSON-RPC 2.0.

use anyhow::Context;
use futures::StreamExt;
use sap_odata_mcp::auth::CredentialResolver;
use sap_odata_mcp::catalog::ServiceCatalog;
use sap_odata_mcp::config::Config;
use sap_odata_mcp::connector::SapConnector;
use sap_odata_mcp::mcp::{JsonRpcRequest, JsonRpcResponse, SapMcpServer, PARSE_ERROR};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging to stderr (MCP uses stdout for protocol)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting SAP OData MCP Server...");

    // Load configuration
    let config = Config::load_default().context("Failed to load configuration")?;
    let settings = config.to_settings(std::env::vars());
    let runtime = config.to_runtime(std::env::vars());

    let resolver = match CredentialResolver::with_gcp(settings.clone(), runtime.secrets.clone()) {
        Ok(resolver) => resolver,
        Err(e) => {
            tracing::warn!("Secret Manager unavailable, using local settings only: {}", e);
            CredentialResolver::new(settings, runtime.secrets.clone())
        }
    };
    let resolver = Arc::new(resolver);

    // Missing credentials are reported per call, not at startup
    match resolver.resolve(false).await {
        Ok(credentials) => tracing::info!(
            "Configured for SAP Gateway {} (client {})",
            credentials.host,
            credentials.client
        ),
        Err(e) => tracing::warn!("SAP credentials not resolved yet: {}", e),
    }

    let catalog = ServiceCatalog::discover(runtime.catalog_path.as_deref())
        .context("Failed to load service catalog")?;
    tracing::info!(
        "Loaded {} services from {}",
        catalog.len(),
        catalog
            .source()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    );

    let connector = Arc::new(SapConnector::new(resolver, catalog, runtime));
    let server = SapMcpServer::new(connector.clone());

    tracing::info!("MCP Server ready, listening on stdio...");

    let result = run_stdio_loop(&server).await;
    connector.shutdown().await;
    result
}

async fn run_stdio_loop(server: &SapMcpServer) -> anyhow::Result<()> {
    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next().await {
        let line = line.context("Failed to read from stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        tracing::debug!("Received: {}", line);

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let error_response =
                    JsonRpcResponse::error(None, PARSE_ERROR, &format!("Parse error: {}", e));
                send_response(&mut stdout, &error_response).await?;
                continue;
            }
        };

        if let Some(response) = server.handle_request(request).await {
            send_response(&mut stdout, &response).await?;
        }
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}

async fn send_response(
    stdout: &mut tokio::io::Stdout,
    response: &JsonRpcResponse,
) -> anyhow::Result<()> {
    let mut json = serde_json::to_string(response)?;
    tracing::debug!("Sending: {}", json);
    json.push('\n');
    stdout.write_all(json.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
