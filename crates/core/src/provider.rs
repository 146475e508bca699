use std::time::Duration;

use alloy_provider::{ConnectionConfig, DynProvider, Provider, ProviderBuilder};
use alloy_transport::{TransportError, TransportErrorKind};
use url::Url;

const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect policy handed to the pubsub transport before it gives up and
/// reports the backend as gone.
#[derive(Debug, Clone, Copy)]
pub struct StreamTransport {
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for StreamTransport {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_interval: Duration::from_secs(3),
        }
    }
}

pub fn http_provider(url: &Url) -> Result<DynProvider, TransportError> {
    let client = reqwest::Client::builder()
        .connect_timeout(RPC_CONNECT_TIMEOUT)
        .build()
        .map_err(TransportErrorKind::custom)?;
    Ok(ProviderBuilder::new()
        .connect_reqwest(client, url.clone())
        .erased())
}

/// Builds the provider behind a streaming connection. `ws`/`wss` endpoints get
/// a pubsub transport, anything else is polled over http.
pub async fn connect_stream_provider(
    url: &Url,
    transport: StreamTransport,
) -> Result<DynProvider, TransportError> {
    match url.scheme() {
        "ws" | "wss" => {
            let config = ConnectionConfig::new()
                .with_max_retries(transport.max_retries)
                .with_retry_interval(transport.retry_interval);
            ProviderBuilder::new()
                .connect_with_config(url.as_str(), config)
                .await
                .map(Provider::erased)
        }
        _ => http_provider(url),
    }
}
