//! Token acquisition, use, refresh and revocation over a [`CommandChannel`]

use super::token::Token;
use crate::client::CommandChannel;
use crate::config::{credentials::LoxoneCredentials, ClientConfig, ProtocolConfig};
use crate::crypto::{hash, HashAlg};
use crate::error::{LoxoneError, Result};
use crate::protocol::commands::{self, TokenApi};
use crate::protocol::TextMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll interval while waiting for the server to hand out a new key
const KEY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle of the session token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    NoToken,
    Acquiring,
    Valid,
    Refreshing,
    Invalid,
}

/// Result of one refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// The server kept handing out the previous key; try again sooner
    Deferred,
}

/// One-time key material from `getkey2` or `getvisusalt`
struct KeySalt {
    key: String,
    salt: String,
    hash_alg: HashAlg,
}

impl KeySalt {
    fn from_reply(reply: &TextMessage) -> Result<Self> {
        let hash_alg = HashAlg::from_field(reply.field("hashAlg").and_then(|v| v.as_str()))?;
        Ok(Self {
            key: reply.str_field("key")?.to_string(),
            salt: reply.str_field("salt")?.to_string(),
            hash_alg,
        })
    }
}

/// Drives the token lifecycle of one session.
///
/// The current token is published on a shared `watch` channel so the client
/// facade can hand it to the host application for persistence.
pub struct TokenManager {
    channel: Arc<dyn CommandChannel>,
    credentials: LoxoneCredentials,
    client_uuid: String,
    client_name: String,
    permission: u8,
    api: TokenApi,
    protocol: ProtocolConfig,
    token: Arc<watch::Sender<Option<Token>>>,
    state: TokenState,
    last_key: Option<String>,
}

impl TokenManager {
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        credentials: LoxoneCredentials,
        config: &ClientConfig,
        api: TokenApi,
        token: Arc<watch::Sender<Option<Token>>>,
    ) -> Self {
        let state = if token.borrow().is_some() {
            TokenState::Valid
        } else {
            TokenState::NoToken
        };
        Self {
            channel,
            credentials,
            client_uuid: config.client_uuid.clone(),
            client_name: config.client_name.clone(),
            permission: config.permission,
            api,
            protocol: config.protocol.clone(),
            token,
            state,
            last_key: None,
        }
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn token(&self) -> Option<Token> {
        self.token.borrow().clone()
    }

    fn user(&self) -> &str {
        &self.credentials.username
    }

    fn current_token(&self) -> Result<Token> {
        self.token()
            .ok_or_else(|| LoxoneError::authentication("No token available"))
    }

    fn publish(&mut self, token: Token) {
        self.token.send_replace(Some(token));
        self.state = TokenState::Valid;
    }

    /// Discard the token; the next authentication acquires a new one
    pub fn invalidate(&mut self) {
        self.token.send_replace(None);
        self.state = TokenState::Invalid;
    }

    /// Authenticate the connection, reusing a stored token when possible.
    ///
    /// A token the server rejects is discarded and a fresh one is acquired;
    /// the rejected token is never offered again.
    pub async fn authenticate(&mut self) -> Result<()> {
        if let Some(token) = self.token() {
            let remaining = token.seconds_to_expire().unwrap_or(0);
            if remaining < self.protocol.min_token_lifetime.as_secs() as i64 {
                info!(remaining, "Stored token is about to expire, acquiring a new one");
                self.invalidate();
            } else {
                match self.use_token().await {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_auth_error() => {
                        warn!("Stored token rejected, acquiring a new one");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.acquire().await
    }

    /// Request a new token with username and password
    pub async fn acquire(&mut self) -> Result<()> {
        self.state = TokenState::Acquiring;
        debug!(user = %self.user(), "Acquiring token");

        let key_salt = self.get_key2().await?;
        let hash = hash::credential_hash(
            key_salt.hash_alg,
            &key_salt.key,
            &self.credentials.username,
            &self.credentials.password,
            &key_salt.salt,
        )?;

        let command = commands::acquire_token(
            self.api,
            &hash,
            self.user(),
            self.permission,
            &self.client_uuid,
            &self.client_name,
        );
        let reply = match self.request_ok(&command, true).await {
            Ok(reply) => reply,
            Err(e) => {
                self.state = TokenState::Invalid;
                return Err(e);
            }
        };

        let token = Token::new(
            reply.str_field("token")?,
            reply.u64_field("validUntil")?,
            key_salt.hash_alg,
            reply.str_field("key")?,
        )
        .map_err(|e| LoxoneError::protocol(format!("Unusable token reply: {e}")))?;

        info!(
            expires_at = %token.expires_at(),
            hash_alg = %token.hash_alg(),
            "Token acquired"
        );
        self.last_key = Some(key_salt.key);
        self.publish(token);
        Ok(())
    }

    /// Authenticate with the stored token.
    ///
    /// A 401 invalidates the token and fails with an authentication error.
    pub async fn use_token(&mut self) -> Result<()> {
        let token = self.current_token()?;
        let key_salt = self.get_key2().await?;
        let hash = hash::token_hash(key_salt.hash_alg, &key_salt.key, token.token())?;

        let reply = match self
            .request_ok(&commands::auth_with_token(&hash, self.user()), true)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_auth_error() {
                    self.invalidate();
                }
                return Err(e);
            }
        };

        let valid_until = reply.u64_field("validUntil").unwrap_or(0);
        debug!(valid_until, "Authenticated with stored token");
        self.last_key = Some(key_salt.key);
        self.publish(
            token
                .with_hash_alg(key_salt.hash_alg)
                .with_valid_until(valid_until),
        );
        Ok(())
    }

    /// Delay until the next refresh: half the remaining lifetime, capped
    pub fn refresh_delay(&self) -> Duration {
        let remaining = self
            .token()
            .and_then(|token| token.seconds_to_expire().ok())
            .unwrap_or(0);
        if remaining <= 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(remaining as u64 / 2).min(self.protocol.max_refresh_delay)
    }

    /// Refresh the token in place
    pub async fn refresh(&mut self) -> Result<RefreshOutcome> {
        let token = self.current_token()?;
        self.state = TokenState::Refreshing;

        let Some(key) = self.confirm_new_key().await? else {
            warn!("Miniserver did not hand out a new key, deferring token refresh");
            self.state = TokenState::Valid;
            return Ok(RefreshOutcome::Deferred);
        };

        let hash = hash::token_hash(token.hash_alg(), &key, token.token())?;
        let command = commands::refresh_token(self.api, &hash, self.user());
        let reply = match self.request_ok(&command, true).await {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_auth_error() {
                    self.invalidate();
                } else {
                    self.state = TokenState::Valid;
                }
                return Err(e);
            }
        };

        let new_token = reply.field("token").and_then(|v| v.as_str());
        let refreshed = token
            .refreshed(new_token, reply.u64_field("validUntil")?)
            .map_err(|e| LoxoneError::protocol(format!("Unusable refresh reply: {e}")))?;

        info!(expires_at = %refreshed.expires_at(), "Token refreshed");
        self.last_key = Some(key);
        self.publish(refreshed);
        Ok(RefreshOutcome::Refreshed)
    }

    /// Poll `getkey` until the key differs from the last one used
    async fn confirm_new_key(&self) -> Result<Option<String>> {
        let poll = async {
            loop {
                let key = self.request_ok(commands::GET_KEY, false).await?.value_string();
                if key.is_empty() {
                    return Err(LoxoneError::protocol("getkey reply carries no key"));
                }
                if self.last_key.as_deref() != Some(key.as_str()) {
                    return Ok(key);
                }
                tokio::time::sleep(KEY_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(self.protocol.key_confirm_timeout, poll).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Refresh on schedule until cancelled.
    ///
    /// Returns an error only when the token was rejected, which ends the session.
    pub async fn run_refresh_loop(mut self, cancel: CancellationToken) -> Result<()> {
        let mut deferred = false;
        loop {
            let mut delay = self.refresh_delay();
            if deferred {
                delay = delay
                    .min(self.protocol.refresh_retry_delay)
                    .max(Duration::from_secs(1));
            }
            debug!(delay_secs = delay.as_secs(), "Next token refresh scheduled");

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            deferred = match self.refresh().await {
                Ok(RefreshOutcome::Refreshed) => false,
                Ok(RefreshOutcome::Deferred) => true,
                Err(e) if e.is_auth_error() => {
                    warn!("Token rejected during refresh: {e}");
                    return Err(e);
                }
                Err(e) => {
                    warn!("Token refresh failed: {e}");
                    true
                }
            };
        }
    }

    /// Verify the token without renewing it
    pub async fn check_token(&self) -> Result<TextMessage> {
        let token = self.current_token()?;
        let key_salt = self.get_key2().await?;
        let hash = hash::token_hash(key_salt.hash_alg, &key_salt.key, token.token())?;
        self.request_ok(&commands::check_token(&hash, self.user()), true)
            .await
    }

    /// Revoke the token on the server and forget it
    pub async fn kill_token(&mut self) -> Result<()> {
        let token = self.current_token()?;
        self.request_ok(&commands::kill_token(token.token(), self.user()), true)
            .await?;
        info!("Token revoked");
        self.invalidate();
        Ok(())
    }

    /// Send `jdev/sps/ios/<hash>/<uuid>/<value>` authorized by the visualization password
    pub async fn send_secured_command(
        &self,
        uuid: &str,
        value: &str,
        visual_password: &str,
    ) -> Result<TextMessage> {
        let reply = self
            .request_ok(&commands::get_visu_salt(self.user()), true)
            .await?;
        let key_salt = KeySalt::from_reply(&reply)?;
        let hash = hash::visual_hash(
            key_salt.hash_alg,
            &key_salt.key,
            visual_password,
            &key_salt.salt,
        )?;
        self.request_ok(&commands::secured_device_command(&hash, uuid, value), false)
            .await
    }

    async fn get_key2(&self) -> Result<KeySalt> {
        let reply = self
            .request_ok(&commands::get_key2(self.user()), true)
            .await?;
        KeySalt::from_reply(&reply)
    }

    /// Send and require code 200; 401 becomes an authentication error
    async fn request_ok(&self, command: &str, encrypted: bool) -> Result<TextMessage> {
        let reply = self
            .channel
            .request(command, encrypted)
            .await?;
        match reply.code {
            200 => Ok(reply),
            401 => Err(LoxoneError::authentication(format!(
                "Miniserver rejected {} (401)",
                crate::logging::sanitize_command(command)
            ))),
            _ => reply.into_result(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::LOXONE_EPOCH_UNIX;
    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&str) -> TextMessage + Send + Sync>;

    /// Answers each command through `handler` and records what was sent
    struct ScriptedChannel {
        handler: Handler,
        sent: Mutex<Vec<(String, bool)>>,
    }

    impl ScriptedChannel {
        fn new(handler: impl Fn(&str) -> TextMessage + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn verbs(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(command, _)| {
                    let command = command.trim_start_matches("jdev/sys/");
                    command.split('/').next().unwrap_or_default().to_string()
                })
                .collect()
        }
    }

    #[async_trait]
    impl CommandChannel for ScriptedChannel {
        async fn request(&self, command: &str, encrypted: bool) -> Result<TextMessage> {
            self.sent
                .lock()
                .unwrap()
                .push((command.to_string(), encrypted));
            Ok((self.handler)(command))
        }
    }

    fn reply(command: &str, code: i32, value: serde_json::Value) -> TextMessage {
        TextMessage::new(command, code, value)
    }

    fn valid_until_in(secs: i64) -> u64 {
        (Utc::now().timestamp() - LOXONE_EPOCH_UNIX + secs) as u64
    }

    fn key_salt_reply(command: &str) -> TextMessage {
        reply(
            command,
            200,
            json!({"key": hex::encode("one-time-key"), "salt": "73616c74", "hashAlg": "SHA256"}),
        )
    }

    fn manager(channel: Arc<ScriptedChannel>, token: Option<Token>) -> TokenManager {
        let mut config = ClientConfig::default();
        config.protocol.key_confirm_timeout = Duration::from_secs(2);
        TokenManager::new(
            channel,
            LoxoneCredentials::new("admin", "secret"),
            &config,
            TokenApi::Jwt,
            Arc::new(watch::channel(token).0),
        )
    }

    fn stored_token() -> Token {
        Token::new("stored-jwt", valid_until_in(10 * 86_400), HashAlg::Sha1, "00ff").unwrap()
    }

    #[tokio::test]
    async fn test_acquire_stores_token() {
        let valid_until = valid_until_in(86_400);
        let channel = ScriptedChannel::new(move |command| {
            if command.starts_with("jdev/sys/getkey2/") {
                key_salt_reply(command)
            } else {
                reply(
                    command,
                    200,
                    json!({"token": "fresh", "validUntil": valid_until, "key": "beef", "tokenRights": 2}),
                )
            }
        });
        let mut manager = manager(channel.clone(), None);
        assert_eq!(manager.state(), TokenState::NoToken);

        manager.authenticate().await.unwrap();

        let token = manager.token().unwrap();
        assert_eq!(token.token(), "fresh");
        assert_eq!(token.key(), "beef");
        assert_eq!(token.hash_alg(), HashAlg::Sha256);
        assert_eq!(manager.state(), TokenState::Valid);
        assert_eq!(channel.verbs(), vec!["getkey2", "getjwt"]);

        let sent = channel.sent.lock().unwrap();
        assert!(sent.iter().all(|(_, encrypted)| *encrypted));
        assert!(sent[1].0.contains("/admin/2/"));
    }

    #[tokio::test]
    async fn test_rejected_token_is_discarded_and_reacquired() {
        let valid_until = valid_until_in(86_400);
        let channel = ScriptedChannel::new(move |command| {
            if command.starts_with("jdev/sys/getkey2/") {
                key_salt_reply(command)
            } else if command.starts_with("authwithtoken/") {
                reply(command, 401, json!(""))
            } else {
                reply(
                    command,
                    200,
                    json!({"token": "fresh", "validUntil": valid_until, "key": "beef"}),
                )
            }
        });
        let mut manager = manager(channel.clone(), Some(stored_token()));

        manager.authenticate().await.unwrap();

        assert_eq!(
            channel.verbs(),
            vec!["getkey2", "authwithtoken", "getkey2", "getjwt"]
        );
        assert_eq!(manager.token().unwrap().token(), "fresh");
    }

    #[tokio::test]
    async fn test_stored_token_authenticates() {
        let channel = ScriptedChannel::new(|command| {
            if command.starts_with("jdev/sys/getkey2/") {
                key_salt_reply(command)
            } else {
                reply(command, 200, json!({"validUntil": 999_999_999u64, "tokenRights": 2}))
            }
        });
        let mut manager = manager(channel.clone(), Some(stored_token()));

        manager.authenticate().await.unwrap();

        assert_eq!(channel.verbs(), vec!["getkey2", "authwithtoken"]);
        let token = manager.token().unwrap();
        assert_eq!(token.token(), "stored-jwt");
        assert_eq!(token.valid_until(), 999_999_999);
    }

    #[tokio::test]
    async fn test_wrong_password_is_auth_error() {
        let channel = ScriptedChannel::new(|command| {
            if command.starts_with("jdev/sys/getkey2/") {
                key_salt_reply(command)
            } else {
                reply(command, 401, json!(""))
            }
        });
        let mut manager = manager(channel, None);

        let err = manager.authenticate().await.unwrap_err();
        assert!(err.is_auth_error());
        assert!(manager.token().is_none());
    }

    #[tokio::test]
    async fn test_missing_salt_is_protocol_error() {
        let channel = ScriptedChannel::new(|command| reply(command, 200, json!({"key": "00"})));
        let mut manager = manager(channel, None);
        assert!(matches!(
            manager.acquire().await,
            Err(LoxoneError::Protocol(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_waits_for_new_key() {
        let valid_until = valid_until_in(7 * 86_400);
        let getkey_calls = Arc::new(Mutex::new(0));
        let calls = getkey_calls.clone();
        let channel = ScriptedChannel::new(move |command| {
            if command == commands::GET_KEY {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                let key = if *calls < 3 { "aa" } else { "bb" };
                reply(command, 200, json!(key))
            } else {
                reply(command, 200, json!({"token": "renewed", "validUntil": valid_until}))
            }
        });
        let mut manager = manager(channel.clone(), Some(stored_token()));
        manager.last_key = Some("aa".to_string());

        assert_eq!(manager.refresh().await.unwrap(), RefreshOutcome::Refreshed);
        assert_eq!(*getkey_calls.lock().unwrap(), 3);

        let token = manager.token().unwrap();
        assert_eq!(token.token(), "renewed");
        assert_eq!(token.valid_until(), valid_until);
        assert_eq!(token.key(), "00ff");
        assert_eq!(channel.verbs().last().unwrap(), "refreshjwt");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_defers_when_key_never_changes() {
        let channel = ScriptedChannel::new(|command| reply(command, 200, json!("aa")));
        let mut manager = manager(channel.clone(), Some(stored_token()));
        manager.last_key = Some("aa".to_string());

        assert_eq!(manager.refresh().await.unwrap(), RefreshOutcome::Deferred);
        assert!(!channel.verbs().contains(&"refreshjwt".to_string()));
        assert_eq!(manager.state(), TokenState::Valid);
    }

    #[tokio::test]
    async fn test_refresh_401_invalidates() {
        let channel = ScriptedChannel::new(|command| {
            if command == commands::GET_KEY {
                reply(command, 200, json!("cc"))
            } else {
                reply(command, 401, json!(""))
            }
        });
        let mut manager = manager(channel, Some(stored_token()));

        let err = manager.refresh().await.unwrap_err();
        assert!(err.is_auth_error());
        assert!(manager.token().is_none());
        assert_eq!(manager.state(), TokenState::Invalid);
    }

    #[test]
    fn test_refresh_delay_is_half_lifetime_capped() {
        let channel = ScriptedChannel::new(|command| reply(command, 200, json!("")));

        let short = Token::new("t", valid_until_in(7200), HashAlg::Sha1, "00").unwrap();
        let delay = manager(channel.clone(), Some(short)).refresh_delay();
        assert!(delay <= Duration::from_secs(3600) && delay >= Duration::from_secs(3590));

        let long = Token::new("t", valid_until_in(30 * 86_400), HashAlg::Sha1, "00").unwrap();
        assert_eq!(
            manager(channel.clone(), Some(long)).refresh_delay(),
            Duration::from_secs(86_400)
        );
        assert_eq!(manager(channel, None).refresh_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_secured_command_uses_visual_hash() {
        let channel = ScriptedChannel::new(|command| {
            if command.starts_with("jdev/sys/getvisusalt/") {
                key_salt_reply(command)
            } else {
                reply(command, 200, json!("1"))
            }
        });
        let manager = manager(channel.clone(), Some(stored_token()));

        manager
            .send_secured_command("0f1e-uuid", "On", "1234")
            .await
            .unwrap();

        // HMAC-SHA256("one-time-key", UPPER(SHA256("1234:73616c74")))
        let expected_hash = "05ffaaf45e5cd3ba2be11cabf913a07149894732be43198f9504234216c09a0b";
        let sent = channel.sent.lock().unwrap();
        assert_eq!(
            sent[1],
            (format!("jdev/sps/ios/{expected_hash}/0f1e-uuid/On"), false)
        );
    }

    #[tokio::test]
    async fn test_kill_token_forgets_token() {
        let channel = ScriptedChannel::new(|command| reply(command, 200, json!("")));
        let mut manager = manager(channel.clone(), Some(stored_token()));

        manager.kill_token().await.unwrap();
        assert!(manager.token().is_none());
        assert_eq!(
            channel.sent.lock().unwrap()[0].0,
            "jdev/sys/killtoken/stored-jwt/admin"
        );
    }
}
