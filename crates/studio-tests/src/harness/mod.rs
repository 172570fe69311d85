pub mod gateway;

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use studio_core::{StudioContext, StudioOptions};
use studio_gateway::{ConnectOptions, GatewayClient};

/// Connect a real client to `gateway` and wrap it in a context.
pub async fn connect(gateway: &gateway::TestGateway) -> Result<StudioContext<GatewayClient>> {
    connect_with(gateway, None, StudioOptions::default()).await
}

pub async fn connect_with(
    gateway: &gateway::TestGateway,
    token: Option<&str>,
    options: StudioOptions,
) -> Result<StudioContext<GatewayClient>> {
    let client = GatewayClient::new();
    client
        .connect(
            ConnectOptions::new(gateway.url().parse()?)
                .with_token(token.map(str::to_string))
                .with_call_timeout(Duration::from_secs(2)),
        )
        .await?;
    Ok(StudioContext::new(client).with_options(options))
}

/// Poll `check` until it returns true, or give up after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("studio_core=debug,studio_gateway=debug,studio_tests=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
