use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use alloy::network::TransactionBuilder;
use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest;
use alloy::sol_types::SolCall;
use alloy_provider::DynProvider;
use alloy_transport::TransportError;
use rand::prelude::IndexedRandom;
use tracing::debug;
use url::Url;

use crate::provider::http_provider;

#[derive(Debug, thiserror::Error)]
pub enum ChainReadError {
    #[error("provider build error for {url}: {source}")]
    ProviderBuild {
        url: Url,
        #[source]
        source: TransportError,
    },
    #[error("no healthy rpc available")]
    NoHealthyRpc,
    #[error("rpc error from {url}: {source}")]
    Rpc {
        url: Url,
        #[source]
        source: TransportError,
    },
    #[error("decode {method} return: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: alloy::sol_types::Error,
    },
}

#[derive(Clone)]
pub(crate) struct ProviderHandle {
    index: usize,
    url: Url,
    provider: DynProvider,
}

struct ProviderEntry {
    url: Url,
    provider: DynProvider,
}

/// Request/response endpoints used for contract reads. A provider that fails
/// sits out for `cooldown` before it is picked again.
pub struct RpcPool {
    providers: Vec<ProviderEntry>,
    cooldown: Duration,
    cooldowns: Mutex<HashMap<usize, Instant>>,
}

impl RpcPool {
    pub fn new(urls: Vec<Url>, cooldown: Duration) -> Result<Self, ChainReadError> {
        let providers = urls
            .into_iter()
            .map(|url| {
                let provider = http_provider(&url).map_err(|source| {
                    ChainReadError::ProviderBuild {
                        url: url.clone(),
                        source,
                    }
                })?;
                Ok(ProviderEntry { url, provider })
            })
            .collect::<Result<Vec<_>, ChainReadError>>()?;
        Ok(Self {
            providers,
            cooldown,
            cooldowns: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    #[must_use]
    pub(crate) fn random_provider(&self) -> Option<ProviderHandle> {
        if self.providers.is_empty() {
            return None;
        }

        let now = Instant::now();
        let mut cooldowns = self
            .cooldowns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cooldowns.retain(|_, until| *until > now);

        let available: Vec<usize> = (0..self.providers.len())
            .filter(|index| !cooldowns.contains_key(index))
            .collect();
        let index = *available.choose(&mut rand::rng())?;
        Some(self.handle(index))
    }

    pub(crate) fn mark_bad_provider(&self, handle: &ProviderHandle) {
        let until = Instant::now() + self.cooldown;
        let mut cooldowns = self
            .cooldowns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cooldowns.insert(handle.index, until);
    }

    /// Executes a view call against current chain state.
    pub async fn read_contract_state<C: SolCall>(
        &self,
        contract: Address,
        call: &C,
    ) -> Result<C::Return, ChainReadError> {
        let rpc = self.random_provider().ok_or(ChainReadError::NoHealthyRpc)?;
        let request = TransactionRequest::default()
            .with_to(contract)
            .with_input(call.abi_encode());
        match rpc.provider.call(request).await {
            Ok(data) => C::abi_decode_returns(&data).map_err(|source| ChainReadError::Decode {
                method: C::SIGNATURE,
                source,
            }),
            Err(source) => {
                debug!(rpc = rpc.url.as_str(), method = C::SIGNATURE, "contract read failed");
                self.mark_bad_provider(&rpc);
                Err(ChainReadError::Rpc {
                    url: rpc.url,
                    source,
                })
            }
        }
    }

    fn handle(&self, index: usize) -> ProviderHandle {
        let entry = &self.providers[index];
        ProviderHandle {
            index,
            url: entry.url.clone(),
            provider: entry.provider.clone(),
        }
    }
}
