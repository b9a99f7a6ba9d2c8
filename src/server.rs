//! Wires config, route table, reconfiguration controller, and watcher
//! into a running HTTP server. Grounded on `serve.rs`'s `HttpEndpoint`
//! (bind, `axum::serve` with graceful shutdown via a `CancellationToken`)
//! and `run_hub`'s overall startup/shutdown sequencing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::get;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::AuthConfig;
use crate::cli::Cli;
use crate::config::{self, Config, ServerSpec};
use crate::lifecycle;
use crate::proxy::{self, GatewayState};
use crate::reconcile::ReconcileController;
use crate::route_table::RouteTable;
use crate::watcher::ConfigWatcher;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(cli: Cli) -> Result<()> {
    cli.validate().map_err(|reason| anyhow::anyhow!(reason))?;

    let initial_config = match (&cli.config, &cli.command) {
        (Some(path), _) => config::load(path).context("failed to load config")?,
        (None, Some(command)) => single_server_config(command)?,
        (None, None) => unreachable!("validated above"),
    };

    let auth = cli.api_key.clone().map(|api_key| Arc::new(AuthConfig { api_key }));

    let table = Arc::new(RouteTable::new());
    let controller = Arc::new(ReconcileController::new(
        table.clone(),
        initial_config,
        cli.path_prefix.clone(),
        HANDSHAKE_TIMEOUT,
        auth,
    ));
    controller
        .mount_initial()
        .await
        .context("failed to start configured servers")?;

    let shutdown = CancellationToken::new();

    let _watcher = if cli.hot_reload {
        match &cli.config {
            Some(path) => Some(start_hot_reload(path.clone(), controller.clone())?),
            None => {
                tracing::warn!("--hot-reload has no effect in single-server (--command) mode");
                None
            }
        }
    } else {
        None
    };

    if cli.tls_cert.is_some() || cli.tls_key.is_some() {
        tracing::warn!(
            "--tls-cert/--tls-key are accepted but not terminated by mcp-hub itself; \
             put a TLS-terminating reverse proxy in front of it"
        );
    }

    let app = build_router(table.clone(), &cli);
    let bind_addr = format!("{}:{}", cli.host, cli.port)
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address '{}:{}'", cli.host, cli.port))?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let local_addr = listener.local_addr().context("failed to resolve local address")?;
    tracing::info!(addr = %local_addr, "mcp-hub listening");

    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        if let Err(error) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            server_shutdown.cancelled().await;
        })
        .await
        {
            tracing::warn!(error = %error, "HTTP server stopped with error");
        }
    });

    lifecycle::wait_for_shutdown_signal(shutdown).await;
    if let Err(error) = server_task.await {
        tracing::debug!(error = %error, "HTTP server task join failed");
    }
    lifecycle::drain_route_table(&table).await;

    Ok(())
}

fn build_router(
    table: Arc<RouteTable>,
    cli: &Cli,
) -> Router<()> {
    let state = Arc::new(GatewayState { table });

    let mut router = Router::new()
        .route("/health", get(health))
        .fallback(proxy::handle)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if !cli.cors_allow_origin.is_empty() {
        let origins: Vec<HeaderValue> = cli
            .cors_allow_origin
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        router = router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(tower_http::cors::Any),
        );
    }

    router
}

async fn health() -> (StatusCode, axum::Json<serde_json::Value>) {
    (
        StatusCode::OK,
        axum::Json(json!({"status": "healthy", "service": "mcp-hub"})),
    )
}

fn single_server_config(command: &[String]) -> Result<Config> {
    let (program, args) = command
        .split_first()
        .context("--command requires at least one argument")?;

    let mut servers = std::collections::HashMap::new();
    servers.insert(
        "default".to_string(),
        ServerSpec {
            command: program.clone(),
            args: args.to_vec(),
            env: std::collections::HashMap::new(),
        },
    );
    Ok(Config { servers })
}

fn start_hot_reload(
    config_path: std::path::PathBuf,
    controller: Arc<ReconcileController>,
) -> Result<ConfigWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Config>(8);
    tokio::spawn(async move {
        while let Some(config) = rx.recv().await {
            if let Err(error) = controller.apply(config).await {
                tracing::warn!(error = %error, "failed to apply reloaded config");
            } else {
                tracing::info!("applied reloaded config");
            }
        }
    });
    ConfigWatcher::start(config_path, tx).context("failed to start config watcher")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::ConnectInfo;
    use axum::http::Request;
    use clap::Parser;
    use std::collections::HashMap;
    use tower::util::ServiceExt;

    fn stub_script(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("stub.sh");
        std::fs::write(
            &path,
            r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"stub","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*) ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echoes","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
  esac
done
"#,
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    async fn test_app(
        temp: &std::path::Path,
        api_key: Option<&str>,
    ) -> (Router<()>, Arc<RouteTable>) {
        let script = stub_script(temp);
        let mut servers = HashMap::new();
        servers.insert(
            "test".to_string(),
            ServerSpec {
                command: "sh".to_string(),
                args: vec![script.to_string_lossy().into_owned()],
                env: HashMap::new(),
            },
        );

        let table = Arc::new(RouteTable::new());
        let auth = api_key.map(|key| {
            Arc::new(AuthConfig {
                api_key: key.to_string(),
            })
        });
        let controller = ReconcileController::new(
            table.clone(),
            Config { servers },
            "/".to_string(),
            Duration::from_secs(5),
            auth,
        );
        controller.mount_initial().await.expect("stub servers start");

        let cli = Cli::parse_from(["mcp-hub", "--command", "unused"]);
        (build_router(table.clone(), &cli), table)
    }

    fn rpc_request(path: &str, body: serde_json::Value) -> Request<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9999))));
        request
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_healthy() {
        let temp = tempfile::tempdir().unwrap();
        let (app, _table) = test_app(temp.path(), None).await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "mcp-hub");
    }

    #[tokio::test]
    async fn session_gate_enforces_initialize_before_tools_list() {
        let temp = tempfile::tempdir().unwrap();
        let (app, _table) = test_app(temp.path(), None).await;

        let gated = app
            .clone()
            .oneshot(rpc_request(
                "/test/mcp",
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
            ))
            .await
            .unwrap();
        let gated_body = json_body(gated).await;
        assert_eq!(gated_body["error"]["code"], -32000);

        let initialized = app
            .clone()
            .oneshot(rpc_request(
                "/test/mcp",
                json!({"jsonrpc": "2.0", "id": 2, "method": "initialize"}),
            ))
            .await
            .unwrap();
        let initialized_body = json_body(initialized).await;
        let session_id = initialized_body["result"]["sessionId"]
            .as_str()
            .unwrap()
            .to_string();

        let mut request = rpc_request(
            "/test/mcp",
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}),
        );
        request
            .headers_mut()
            .insert("x-session-id", session_id.parse().unwrap());
        let listed = app.clone().oneshot(request).await.unwrap();
        let listed_body = json_body(listed).await;
        assert!(listed_body["result"]["tools"].is_array());
    }

    #[tokio::test]
    async fn anonymous_sessions_are_stable_across_requests() {
        let temp = tempfile::tempdir().unwrap();
        let (app, _table) = test_app(temp.path(), None).await;

        let init = app
            .clone()
            .oneshot(rpc_request(
                "/test/mcp",
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(init).await["result"]["sessionId"].is_string(), true);

        let listed = app
            .clone()
            .oneshot(rpc_request(
                "/test/mcp",
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            ))
            .await
            .unwrap();
        let listed_body = json_body(listed).await;
        assert!(
            listed_body["result"]["tools"].is_array(),
            "same (client ip, user agent) pair with no explicit session id must land \
             on the same anonymous HttpSession, which was initialized by the prior request"
        );
    }

    #[tokio::test]
    async fn auth_matrix_over_http() {
        let temp = tempfile::tempdir().unwrap();
        let (app, _table) = test_app(temp.path(), Some("mykey")).await;

        let no_auth = rpc_request(
            "/test/mcp",
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
        );
        let response = app.clone().oneshot(no_auth).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut good_bearer = rpc_request(
            "/test/mcp",
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
        );
        good_bearer
            .headers_mut()
            .insert("authorization", "Bearer mykey".parse().unwrap());
        let response = app.clone().oneshot(good_bearer).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut bad_bearer = rpc_request(
            "/test/mcp",
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
        );
        bad_bearer
            .headers_mut()
            .insert("authorization", "Bearer wrong".parse().unwrap());
        let response = app.clone().oneshot(bad_bearer).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_route_is_404() {
        let temp = tempfile::tempdir().unwrap();
        let (app, _table) = test_app(temp.path(), None).await;
        let response = app
            .oneshot(rpc_request(
                "/nowhere/mcp",
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
