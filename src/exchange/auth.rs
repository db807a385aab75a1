use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::BotError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct ExchangeAuth {
    pub api_key: String,
    api_secret: String,
    pub passphrase: String,
}

impl std::fmt::Debug for ExchangeAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeAuth")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl ExchangeAuth {
    pub fn new(api_key: String, api_secret: String, passphrase: String) -> Self {
        Self {
            api_key,
            api_secret,
            passphrase,
        }
    }

    /// Build the HMAC-SHA256 request signature.
    ///
    /// message = `{timestamp}{METHOD}{path}{body}` where `path` already
    /// carries `?query` when there is one. The secret is used as raw bytes.
    pub fn sign(
        &self,
        timestamp: &str,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<String, BotError> {
        let message = format!("{timestamp}{}{path}{body}", method.to_uppercase());

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| BotError::Auth(format!("unusable api secret: {e}")))?;

        mac.update(message.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}
