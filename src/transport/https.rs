use crate::base::neterror::NetError;
use crate::http::exchange::{ExchangeClient, ExchangeConfig};
use crate::socket::cache::WriteBack;
use crate::socket::connectjob::{Dial, SystemDialer};
use bytes::Bytes;
use std::sync::Arc;
use url::Url;

/// DNS-over-HTTPS (RFC 8484, POST).
///
/// Does not go through the connection cache; the exchange client keeps its
/// own pool of HTTP connections obtained from the same kind of dialer.
#[derive(Clone)]
pub struct HttpsTransport {
    url: Url,
    client: Arc<ExchangeClient>,
    write_back: WriteBack,
}

impl std::fmt::Debug for HttpsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsTransport")
            .field("url", &self.url.as_str())
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl HttpsTransport {
    pub fn new(
        url: Url,
        write_back: WriteBack,
        dialer: Arc<dyn Dial>,
        config: ExchangeConfig,
    ) -> Self {
        let client = Arc::new(ExchangeClient::new(dialer, config));
        Self {
            url,
            client,
            write_back,
        }
    }

    pub fn local(url: Url, write_back: WriteBack) -> Self {
        Self::new(url, write_back, Arc::new(SystemDialer::new()), ExchangeConfig::default())
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn client(&self) -> &ExchangeClient {
        &self.client
    }

    pub async fn exchange_raw(&self, packed: Bytes) -> Result<Bytes, NetError> {
        self.client.exchange(&self.url, packed).await
    }

    /// Exchange and hand the reply to the write-back.
    pub async fn write_raw(&self, packed: &[u8]) -> Result<(), NetError> {
        let reply = self.exchange_raw(Bytes::copy_from_slice(packed)).await?;
        (self.write_back)(reply);
        Ok(())
    }
}
