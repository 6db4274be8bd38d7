//! Command strings understood by the Miniserver

use crate::error::{LoxoneError, Result};
use std::fmt;

/// HTTP path of the reachability probe
pub const API_KEY_PATH: &str = "jdev/cfg/apiKey";
/// HTTP path of the server certificate
pub const PUBLIC_KEY_PATH: &str = "jdev/sys/getPublicKey";
/// HTTP path of the structure file
pub const STRUCTURE_FILE_PATH: &str = "data/LoxAPP3.json";
/// Websocket endpoint
pub const WEBSOCKET_PATH: &str = "ws/rfc6455";
/// Websocket subprotocol
pub const WEBSOCKET_PROTOCOL: &str = "remotecontrol";

pub const KEEPALIVE: &str = "keepalive";
pub const GET_KEY: &str = "jdev/sys/getkey";
pub const ENABLE_BIN_STATUS_UPDATE: &str = "jdev/sps/enablebinstatusupdate";
pub const ENCRYPTED_PREFIX: &str = "jdev/sys/enc/";

/// Replies to these `jdev/sys/...` commands are consumed by the client
const PLUMBING_COMMANDS: &[&str] = &[
    "keyexchange",
    "getkey",
    "getkey2",
    "getjwt",
    "gettoken",
    "refreshjwt",
    "refreshtoken",
    "getvisusalt",
    "enc",
];

/// Token commands differ between firmware generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenApi {
    /// `getjwt` / `refreshjwt`, firmware 10.2 and later
    #[default]
    Jwt,
    /// `gettoken` / `refreshtoken`
    Legacy,
}

impl TokenApi {
    /// Select by firmware version
    pub fn for_version(version: &FirmwareVersion) -> Self {
        if *version >= FirmwareVersion::new(10, 2) {
            TokenApi::Jwt
        } else {
            TokenApi::Legacy
        }
    }
}

/// Major/minor firmware version from the apiKey probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
}

impl FirmwareVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn parse(version: &str) -> Result<Self> {
        let mut parts = version.trim().split('.');
        let mut next = |name: &str| -> Result<u32> {
            parts
                .next()
                .unwrap_or("0")
                .parse()
                .map_err(|_| LoxoneError::protocol(format!("Invalid firmware {name} in '{version}'")))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        Ok(Self { major, minor })
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub fn key_exchange(session_key: &str) -> String {
    format!("jdev/sys/keyexchange/{session_key}")
}

pub fn encrypted(payload: &str) -> String {
    format!("{ENCRYPTED_PREFIX}{payload}")
}

pub fn get_key2(user: &str) -> String {
    format!("jdev/sys/getkey2/{user}")
}

pub fn get_visu_salt(user: &str) -> String {
    format!("jdev/sys/getvisusalt/{user}")
}

/// `jdev/sys/getjwt/<hash>/<user>/<permission>/<uuid>/<name>` or the legacy `gettoken`
pub fn acquire_token(
    api: TokenApi,
    hash: &str,
    user: &str,
    permission: u8,
    client_uuid: &str,
    client_name: &str,
) -> String {
    let verb = match api {
        TokenApi::Jwt => "getjwt",
        TokenApi::Legacy => "gettoken",
    };
    format!("jdev/sys/{verb}/{hash}/{user}/{permission}/{client_uuid}/{client_name}")
}

pub fn refresh_token(api: TokenApi, hash: &str, user: &str) -> String {
    let verb = match api {
        TokenApi::Jwt => "refreshjwt",
        TokenApi::Legacy => "refreshtoken",
    };
    format!("jdev/sys/{verb}/{hash}/{user}")
}

pub fn auth_with_token(hash: &str, user: &str) -> String {
    format!("authwithtoken/{hash}/{user}")
}

pub fn check_token(hash: &str, user: &str) -> String {
    format!("jdev/sys/checktoken/{hash}/{user}")
}

pub fn kill_token(token: &str, user: &str) -> String {
    format!("jdev/sys/killtoken/{token}/{user}")
}

/// `jdev/sps/io/<uuid>/<value>`
pub fn device_command(uuid: &str, value: &str) -> String {
    format!("jdev/sps/io/{uuid}/{value}")
}

/// `jdev/sps/ios/<visual hash>/<uuid>/<value>`
pub fn secured_device_command(visual_hash: &str, uuid: &str, value: &str) -> String {
    format!("jdev/sps/ios/{visual_hash}/{uuid}/{value}")
}

/// Whether a reply control belongs to handshake or token traffic
pub fn is_plumbing(control: &str) -> bool {
    let control = control.trim_start_matches('/');
    if control.starts_with("authwithtoken/") {
        return true;
    }
    let Some(rest) = control
        .strip_prefix("jdev/sys/")
        .or_else(|| control.strip_prefix("dev/sys/"))
    else {
        return false;
    };
    let verb = rest.split('/').next().unwrap_or_default();
    PLUMBING_COMMANDS.contains(&verb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("12.0.2.24", TokenApi::Jwt)]
    #[case("10.2", TokenApi::Jwt)]
    #[case("10.1.12.5", TokenApi::Legacy)]
    #[case("9.3", TokenApi::Legacy)]
    fn test_token_api_selection(#[case] version: &str, #[case] expected: TokenApi) {
        let version = FirmwareVersion::parse(version).unwrap();
        assert_eq!(TokenApi::for_version(&version), expected);
    }

    #[test]
    fn test_firmware_version_parse() {
        assert_eq!(FirmwareVersion::parse("11").unwrap(), FirmwareVersion::new(11, 0));
        assert!(FirmwareVersion::parse("abc").is_err());
        assert_eq!(FirmwareVersion::new(12, 1).to_string(), "12.1");
    }

    #[test]
    fn test_token_commands() {
        assert_eq!(
            acquire_token(TokenApi::Jwt, "h", "admin", 2, "uuid", "client"),
            "jdev/sys/getjwt/h/admin/2/uuid/client"
        );
        assert_eq!(
            acquire_token(TokenApi::Legacy, "h", "admin", 4, "uuid", "client"),
            "jdev/sys/gettoken/h/admin/4/uuid/client"
        );
        assert_eq!(
            refresh_token(TokenApi::Legacy, "h", "admin"),
            "jdev/sys/refreshtoken/h/admin"
        );
        assert_eq!(auth_with_token("h", "admin"), "authwithtoken/h/admin");
    }

    #[rstest]
    #[case("jdev/sys/getkey2/admin", true)]
    #[case("/jdev/sys/getkey", true)]
    #[case("dev/sys/getjwt/abc/admin/2/u/n", true)]
    #[case("authwithtoken/abc/admin", true)]
    #[case("jdev/sys/enc/abcd", true)]
    #[case("jdev/sys/keyexchange/abcd", true)]
    #[case("jdev/sys/checktoken/abc/admin", false)]
    #[case("jdev/sps/io/uuid/on", false)]
    #[case("keepalive", false)]
    #[case("jdev/sps/enablebinstatusupdate", false)]
    fn test_is_plumbing(#[case] control: &str, #[case] expected: bool) {
        assert_eq!(is_plumbing(control), expected);
    }
}
