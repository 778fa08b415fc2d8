//! Object handed to every engine so it can ask who it is running for.

use async_trait::async_trait;
use engine_rpc::{RpcError, RpcSocket, RpcStub};
use serde_json::{Value, json};
use strum::VariantNames;
use strum_macros::{EnumString, VariantNames};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, VariantNames)]
#[strum(serialize_all = "camelCase")]
enum Method {
    GetDeveloperKey,
    GetLocale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThingpediaClient {
    developer_key: Option<String>,
    locale: String,
}

impl ThingpediaClient {
    pub fn new(developer_key: Option<String>, locale: Option<String>) -> Self {
        Self { developer_key, locale: locale.unwrap_or_else(|| "en-US".to_string()) }
    }
}

#[async_trait]
impl RpcStub for ThingpediaClient {
    fn methods(&self) -> &'static [&'static str] {
        Method::VARIANTS
    }

    async fn invoke(&self, _: &RpcSocket, method: &str, _: Vec<Value>) -> Result<Value, RpcError> {
        let method: Method = method
            .parse()
            .map_err(|_| RpcError::InvalidArguments(format!("unknown method {method}")))?;
        Ok(match method {
            Method::GetDeveloperKey => json!(self.developer_key),
            Method::GetLocale => json!(self.locale),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn answers_with_the_tenant_settings() {
        let (socket, _frames) = RpcSocket::new();
        let client = Arc::new(ThingpediaClient::new(Some("dev-key".into()), None));
        assert_eq!(client.methods(), &["getDeveloperKey", "getLocale"]);
        let key = client.invoke(&socket, "getDeveloperKey", vec![]).await.unwrap();
        assert_eq!(key, json!("dev-key"));
        let locale = client.invoke(&socket, "getLocale", vec![]).await.unwrap();
        assert_eq!(locale, json!("en-US"));
        assert!(ThingpediaClient::new(None, None).invoke(&socket, "getDeveloperKey", vec![]).await.unwrap().is_null());
    }
}
