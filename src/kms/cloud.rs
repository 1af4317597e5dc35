use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::KmsProvider;
use crate::error::{Error, Result};

pub const KIND: &str = "awskms";

const DEFAULT_ENDPOINT: &str = "https://kms.us-east-1.amazonaws.com";

/// `awskms.<version>`: data keys are wrapped by an AWS KMS key (or any
/// endpoint speaking the same JSON protocol, e.g. LocalStack).
pub struct CloudKmsProvider {
    key_id: String,
    endpoint: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WrapRequest<'a> {
    key_id: &'a str,
    plaintext: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WrapResponse {
    ciphertext_blob: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UnwrapRequest<'a> {
    key_id: &'a str,
    ciphertext_blob: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UnwrapResponse {
    plaintext: String,
}

impl CloudKmsProvider {
    pub fn new(key_id: String, endpoint: Option<String>) -> Self {
        Self { key_id, endpoint }
    }

    fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT)
    }

    fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        target: &str,
        body: &Req,
    ) -> anyhow::Result<Resp> {
        Ok(ureq::post(self.endpoint())
            .set("X-Amz-Target", target)
            .set("Content-Type", "application/x-amz-json-1.1")
            .send_json(serde_json::to_value(body)?)?
            .into_json()?)
    }

    fn wrap(&self, dek: &[u8]) -> anyhow::Result<Vec<u8>> {
        let resp: WrapResponse = self.call(
            "TrentService.Encrypt",
            &WrapRequest {
                key_id: &self.key_id,
                plaintext: STANDARD.encode(dek),
            },
        )?;
        Ok(STANDARD.decode(resp.ciphertext_blob)?)
    }

    fn unwrap_dek(&self, wrapped: &[u8]) -> anyhow::Result<Vec<u8>> {
        let resp: UnwrapResponse = self.call(
            "TrentService.Decrypt",
            &UnwrapRequest {
                key_id: &self.key_id,
                ciphertext_blob: STANDARD.encode(wrapped),
            },
        )?;
        Ok(STANDARD.decode(resp.plaintext)?)
    }
}

impl KmsProvider for CloudKmsProvider {
    fn encrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        self.wrap(blob).map_err(Error::Provider)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        self.unwrap_dek(blob).map_err(Error::Provider)
    }
}
