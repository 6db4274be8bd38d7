//! WireMock-based Miniserver HTTP bootstrap mocking
//!
//! Serves the three bootstrap endpoints the way a Miniserver does, including
//! the single-quoted apiKey value and the certificate-wrapped public key.

use base64::{engine::general_purpose, Engine as _};
use openssl::rsa::Rsa;
use serde_json::{json, Value};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

/// `Basic base64("admin:secret")`
pub const BASIC_AUTH: &str = "Basic YWRtaW46c2VjcmV0";

/// Mock Miniserver HTTP endpoints for bootstrap tests
pub struct MockLoxoneServer {
    pub server: MockServer,
    pub base_url: String,
}

impl MockLoxoneServer {
    /// Start a server without any endpoints mounted
    pub async fn start_empty() -> Self {
        let server = MockServer::start().await;
        let base_url = server.uri();
        Self { server, base_url }
    }

    /// Start a server answering every bootstrap request
    pub async fn start() -> Self {
        let mock = Self::start_empty().await;
        mock.mock_api_key("12.0.2.24", 0).await;
        mock.mock_public_key().await;
        mock.mock_structure_file().await;
        mock
    }

    /// `jdev/cfg/apiKey` with the Miniserver's single-quoted value
    pub async fn mock_api_key(&self, version: &str, https_status: u8) {
        Mock::given(method("GET"))
            .and(path("/jdev/cfg/apiKey"))
            .and(header("authorization", BASIC_AUTH))
            .respond_with(ResponseTemplate::new(200).set_body_json(api_key_body(
                version,
                https_status,
            )))
            .mount(&self.server)
            .await;
    }

    /// `jdev/sys/getPublicKey` with a freshly generated key
    pub async fn mock_public_key(&self) {
        let key = Rsa::generate(2048).unwrap();
        let der = key.public_key_to_der().unwrap();
        let certificate = format!(
            "-----BEGIN CERTIFICATE-----{}-----END CERTIFICATE-----",
            general_purpose::STANDARD.encode(der)
        );

        Mock::given(method("GET"))
            .and(path("/jdev/sys/getPublicKey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "LL": {
                    "control": "dev/sys/getPublicKey",
                    "value": certificate,
                    "Code": "200"
                }
            })))
            .mount(&self.server)
            .await;
    }

    /// `data/LoxAPP3.json`
    pub async fn mock_structure_file(&self) {
        Mock::given(method("GET"))
            .and(path("/data/LoxAPP3.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(structure_file()))
            .mount(&self.server)
            .await;
    }

    /// Answer `path` with a bare HTTP status `times` times
    pub async fn mock_status(&self, route: &str, status: u16, times: u64) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .up_to_n_times(times)
            .expect(times)
            .mount(&self.server)
            .await;
    }
}

pub fn api_key_body(version: &str, https_status: u8) -> Value {
    json!({
        "LL": {
            "control": "dev/cfg/apiKey",
            "value": format!(
                "{{'snr': '50:4F:94:10:B8:4A', 'version':'{version}', 'key':'3231', 'isInTrust': 0, 'local':true, 'httpsStatus':{https_status}}}"
            ),
            "Code": "200"
        }
    })
}

pub fn structure_file() -> Value {
    json!({
        "lastModified": "2024-01-01 12:00:00",
        "msInfo": {
            "serialNr": "50:4F:94:10:B8:4A",
            "msName": "Test Miniserver",
            "projectName": "Test Project"
        },
        "rooms": {
            "0cd8c06b-855703-ffff-ffff000000000000": { "name": "Living Room" }
        },
        "controls": {
            "0cd8c06b-855703-ffff-ffff000000000010": {
                "name": "Living Room Light",
                "type": "LightController",
                "room": "0cd8c06b-855703-ffff-ffff000000000000"
            }
        }
    })
}
