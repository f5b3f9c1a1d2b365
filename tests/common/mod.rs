use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tenant_router::api::{app, AppState};
use tenant_router::config::{AppConfig, Environment};

/// Postgres used by the integration tests; they skip when it is unset.
/// The role needs CREATEDB.
pub fn database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok().filter(|url| !url.is_empty())
}

pub struct TestServer {
    pub base_url: String,
    pub state: AppState,
    pub config: AppConfig,
}

impl TestServer {
    /// Serve the full app in-process against `database_url`
    pub async fn start(database_url: &str) -> Result<Self> {
        let mut config = AppConfig::preset(Environment::Development)
            .with_overrides(|key| (key == "DATABASE_URL").then(|| database_url.to_string()));

        // Provision tenant databases on the same server with the same role
        let server = config.registry.coordinates()?;
        config.admin.host = server.host;
        config.admin.port = server.port;
        config.admin.user = server.user;
        config.admin.password = server.password;
        config.api.enable_request_logging = false;

        let state = AppState::from_config(&config).await?;

        // Pick an unused port for isolation
        let port = portpicker::pick_unused_port().context("failed to pick free port")?;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
        let router = app(state.clone(), &config.api);
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let server = Self {
            base_url: format!("http://127.0.0.1:{}", port),
            state,
            config,
        };
        server.wait_ready(Duration::from_secs(10)).await?;
        Ok(server)
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let client = reqwest::Client::new();
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(resp) = client.get(self.url("/health")).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("server did not become ready on {} within {:?}", self.base_url, timeout)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Tenant creation body pointing at the test server's Postgres
    pub fn create_body(&self, name: &str, admin_email: Option<&str>) -> Result<Value> {
        let server = self.config.registry.coordinates()?;
        let mut body = json!({
            "name": name,
            "database": {
                "host": server.host,
                "port": server.port,
                "user": server.user,
                "password": server.password
            },
            "pool_options": { "max": 3 }
        });
        if let Some(email) = admin_email {
            body["admin_user"] = json!({ "email": email, "password": "secret1" });
        }
        Ok(body)
    }

    /// Create a tenant over HTTP and return its id
    pub async fn create_tenant(&self, name: &str) -> Result<String> {
        let res = reqwest::Client::new()
            .post(self.url("/api/root/tenant"))
            .json(&self.create_body(name, None)?)
            .send()
            .await?;
        anyhow::ensure!(res.status().as_u16() == 201, "create failed: {}", res.status());

        let body: Value = res.json().await?;
        body["data"]["id"]
            .as_str()
            .map(str::to_string)
            .context("created tenant has no id")
    }
}
