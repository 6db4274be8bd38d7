//! In-memory Miniserver speaking the real protocol
//!
//! Implements both [`Bootstrap`] and [`Connector`], so a client can run the
//! complete connect sequence against it: the RSA key exchange is decrypted
//! with a generated key pair, encrypted commands are opened with the session
//! key, and credential and token hashes are verified before replies are sent.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use loxone_ws::auth::loxone_epoch;
use loxone_ws::client::bootstrap::{ApiKeyInfo, Bootstrap};
use loxone_ws::client::dispatcher::strip_salt_prefix;
use loxone_ws::client::transport::{Connector, FrameSink, FrameSource};
use loxone_ws::crypto::{hash, HashAlg, SessionKeys};
use loxone_ws::error::{LoxoneError, Result};
use loxone_ws::protocol::message::encode_value_states;
use loxone_ws::protocol::{Frame, MessageHeader, MessageType, TextMessage};
use openssl::pkey::Private;
use openssl::rsa::{Padding, Rsa};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

pub const USER: &str = "admin";
pub const PASSWORD: &str = "secret";
pub const VISU_PASSWORD: &str = "visu-1234";
pub const LIGHT_UUID: &str = "0f8b5c2a-0123-1c4a-ffff-403fb0c34b9e";
/// Commands for this UUID are answered with code 404
pub const UNKNOWN_UUID: &str = "0f8b5c2a-0123-1c4a-ffff-000000000000";
pub const FIRMWARE: &str = "12.0.2.24";

const TOKEN_LIFETIME_SECS: i64 = 3 * 24 * 60 * 60;

#[derive(Debug, Default)]
struct Behavior {
    reject_tokens: bool,
    ignore_keepalive: bool,
    fail_connects: usize,
    public_key: Option<String>,
}

enum Control {
    Drop,
    OutOfService,
    Push(Vec<(String, f64)>),
}

struct Shared {
    rsa: Rsa<Private>,
    certificate: String,
    behavior: Mutex<Behavior>,
    /// (connection number, decrypted command)
    commands: Mutex<Vec<(usize, String)>>,
    issued: Mutex<Vec<String>>,
    controls: Mutex<Vec<mpsc::UnboundedSender<Control>>>,
    connections: AtomicUsize,
    counter: AtomicU64,
}

/// Handle to the fake; clones share state
#[derive(Clone)]
pub struct FakeMiniserver {
    shared: Arc<Shared>,
}

impl Default for FakeMiniserver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMiniserver {
    pub fn new() -> Self {
        let rsa = Rsa::generate(2048).unwrap();
        let der = rsa.public_key_to_der().unwrap();
        let certificate = format!(
            "-----BEGIN CERTIFICATE-----{}-----END CERTIFICATE-----",
            general_purpose::STANDARD.encode(der)
        );
        Self {
            shared: Arc::new(Shared {
                rsa,
                certificate,
                behavior: Mutex::new(Behavior::default()),
                commands: Mutex::new(Vec::new()),
                issued: Mutex::new(Vec::new()),
                controls: Mutex::new(Vec::new()),
                connections: AtomicUsize::new(0),
                counter: AtomicU64::new(0),
            }),
        }
    }

    /// Websocket connections accepted so far
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// All commands received, decrypted
    pub fn commands(&self) -> Vec<String> {
        self.shared
            .commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Command verbs received on connection `number` (1-based)
    pub fn verbs_on(&self, number: usize) -> Vec<String> {
        self.shared
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(connection, _)| *connection == number)
            .map(|(_, command)| verb(command))
            .filter(|verb| verb != "keepalive")
            .collect()
    }

    pub fn reject_tokens(&self, reject: bool) {
        self.shared.behavior.lock().unwrap().reject_tokens = reject;
    }

    pub fn ignore_keepalive(&self, ignore: bool) {
        self.shared.behavior.lock().unwrap().ignore_keepalive = ignore;
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.shared.behavior.lock().unwrap().fail_connects = count;
    }

    /// Serve `certificate` from `getPublicKey` instead of the real key
    pub fn serve_public_key(&self, certificate: &str) {
        self.shared.behavior.lock().unwrap().public_key = Some(certificate.to_string());
    }

    pub fn issued_tokens(&self) -> Vec<String> {
        self.shared.issued.lock().unwrap().clone()
    }

    /// Drop the current websocket without a close frame
    pub fn drop_connection(&self) {
        self.control(Control::Drop);
    }

    /// Announce a restart and drop the connection
    pub fn send_out_of_service(&self) {
        self.control(Control::OutOfService);
    }

    pub fn push_value_state(&self, uuid: &str, value: f64) {
        self.control(Control::Push(vec![(uuid.to_string(), value)]));
    }

    fn control(&self, control: Control) {
        if let Some(tx) = self.shared.controls.lock().unwrap().last() {
            let _ = tx.send(control);
        }
    }
}

/// `keyexchange`, `getkey2`, `authwithtoken`, `io`, ...
pub fn verb(command: &str) -> String {
    let parts: Vec<&str> = command.split('/').collect();
    match parts.as_slice() {
        ["jdev", _, verb, ..] => verb.to_string(),
        [first, ..] => first.to_string(),
        [] => String::new(),
    }
}

fn loxone_now() -> i64 {
    (Utc::now() - loxone_epoch()).num_seconds()
}

#[async_trait]
impl Bootstrap for FakeMiniserver {
    async fn api_key(&self) -> Result<ApiKeyInfo> {
        ApiKeyInfo::parse(&format!(
            "{{'snr': '50:4F:94:10:B8:4A', 'version':'{FIRMWARE}', 'key':'', 'httpsStatus':0, 'local':true}}"
        ))
    }

    async fn public_key(&self) -> Result<String> {
        let served = self.shared.behavior.lock().unwrap().public_key.clone();
        Ok(served.unwrap_or_else(|| self.shared.certificate.clone()))
    }

    async fn structure_file(&self) -> Result<Value> {
        Ok(json!({
            "lastModified": "2024-01-01 12:00:00",
            "msInfo": { "serialNr": "50:4F:94:10:B8:4A", "msName": "Fake Miniserver" },
            "controls": {
                "0f8b5c2a-0123-1c4a-ffff403fb0c34b9e": { "name": "Light", "type": "Switch" }
            }
        }))
    }

    async fn base_url(&self) -> Url {
        Url::parse("http://fake-miniserver.local").unwrap()
    }
}

#[async_trait]
impl Connector for FakeMiniserver {
    async fn connect(&self, url: &Url) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        assert_eq!(url.path(), "/ws/rfc6455");
        {
            let mut behavior = self.shared.behavior.lock().unwrap();
            if behavior.fail_connects > 0 {
                behavior.fail_connects -= 1;
                return Err(LoxoneError::connection("Connection refused"));
            }
        }

        let number = self.shared.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.shared.controls.lock().unwrap().push(control_tx);

        let connection = Connection {
            shared: self.shared.clone(),
            number,
            tx: server_tx,
            keys: None,
            key2: None,
            key: None,
            visu: None,
        };
        tokio::spawn(connection.run(server_rx, control_rx));

        Ok((
            Box::new(FakeSink {
                tx: Some(client_tx),
            }),
            Box::new(FakeSource { rx: client_rx }),
        ))
    }
}

struct FakeSink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

#[async_trait]
impl FrameSink for FakeSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| LoxoneError::connection("Sink closed"))?
            .send(frame)
            .map_err(|_| LoxoneError::connection("Connection reset by fake Miniserver"))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct FakeSource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSource for FakeSource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Server side of one websocket
struct Connection {
    shared: Arc<Shared>,
    number: usize,
    tx: mpsc::UnboundedSender<Frame>,
    keys: Option<SessionKeys>,
    /// `(key, salt)` handed out by the last `getkey2`
    key2: Option<(String, String)>,
    /// Key handed out by the last `getkey`
    key: Option<String>,
    visu: Option<(String, String)>,
}

impl Connection {
    async fn run(
        mut self,
        mut incoming: mpsc::UnboundedReceiver<Frame>,
        mut controls: mpsc::UnboundedReceiver<Control>,
    ) {
        loop {
            tokio::select! {
                frame = incoming.recv() => match frame {
                    Some(Frame::Text(wire)) => self.handle(wire),
                    Some(_) => {}
                    None => break,
                },
                control = controls.recv() => match control {
                    Some(Control::Drop) | None => break,
                    Some(Control::OutOfService) => {
                        self.header(MessageType::OutOfService, 0);
                        break;
                    }
                    Some(Control::Push(states)) => self.push_states(&states),
                },
            }
        }
    }

    fn header(&self, message_type: MessageType, length: usize) {
        let header = MessageHeader::new(message_type, length as u32).encode();
        let _ = self.tx.send(Frame::Binary(header.to_vec()));
    }

    fn reply(&self, control: &str, code: i32, value: Value) {
        let body = TextMessage::new(control, code, value).to_ll_json();
        self.header(MessageType::Text, body.len());
        let _ = self.tx.send(Frame::Text(body));
    }

    fn push_states(&self, states: &[(String, f64)]) {
        let body =
            encode_value_states(states.iter().map(|(uuid, value)| (uuid.as_str(), *value)))
                .unwrap();
        self.header(MessageType::ValueStates, body.len());
        let _ = self.tx.send(Frame::Binary(body));
    }

    fn next_hex(&self, label: &str) -> String {
        let n = self.shared.counter.fetch_add(1, Ordering::SeqCst);
        hex::encode(format!("{label}-{n}"))
    }

    fn record(&self, command: &str) {
        self.shared
            .commands
            .lock()
            .unwrap()
            .push((self.number, command.to_string()));
    }

    fn handle(&mut self, wire: String) {
        if let Some(session_key) = wire.strip_prefix("jdev/sys/keyexchange/") {
            self.record(&wire);
            let code = match self.exchange_keys(session_key) {
                Some(keys) => {
                    self.keys = Some(keys);
                    200
                }
                None => 400,
            };
            self.reply(&wire, code, json!(session_key));
            return;
        }

        if wire.starts_with("jdev/sys/enc/") {
            let plaintext = self.keys.as_ref().and_then(|keys| keys.open(&wire).ok());
            match plaintext {
                Some(plaintext) => {
                    let command = strip_salt_prefix(&plaintext).to_string();
                    self.respond(&wire, &command);
                }
                None => self.reply(&wire, 400, json!("cannot decrypt")),
            }
            return;
        }

        self.respond(&wire, &wire);
    }

    fn exchange_keys(&self, session_key: &str) -> Option<SessionKeys> {
        let encrypted = general_purpose::STANDARD.decode(session_key).ok()?;
        let mut payload = vec![0u8; self.shared.rsa.size() as usize];
        let len = self
            .shared
            .rsa
            .private_decrypt(&encrypted, &mut payload, Padding::PKCS1)
            .ok()?;
        payload.truncate(len);
        SessionKeys::from_exchange_payload(std::str::from_utf8(&payload).ok()?).ok()
    }

    fn issue_token(&self) -> String {
        let token = format!("token-{}", self.shared.counter.fetch_add(1, Ordering::SeqCst));
        self.shared.issued.lock().unwrap().push(token.clone());
        token
    }

    fn matching_token(&self, key: &str, hash_hex: &str) -> Option<String> {
        self.shared
            .issued
            .lock()
            .unwrap()
            .iter()
            .find(|token| {
                hash::token_hash(HashAlg::Sha256, key, token).ok().as_deref() == Some(hash_hex)
            })
            .cloned()
    }

    fn respond(&mut self, control: &str, command: &str) {
        self.record(command);
        let parts: Vec<&str> = command.split('/').collect();
        match parts.as_slice() {
            ["keepalive"] => {
                if !self.shared.behavior.lock().unwrap().ignore_keepalive {
                    self.header(MessageType::Keepalive, 0);
                }
            }
            ["jdev", "sys", "getkey2", user] => {
                if *user != USER {
                    return self.reply(control, 404, json!("unknown user"));
                }
                let key_salt = (self.next_hex("key2"), self.next_hex("salt"));
                self.reply(
                    control,
                    200,
                    json!({ "key": key_salt.0, "salt": key_salt.1, "hashAlg": "SHA256" }),
                );
                self.key2 = Some(key_salt);
            }
            ["jdev", "sys", "getjwt" | "gettoken", hash_hex, user, ..] => {
                let Some((key, salt)) = self.key2.take() else {
                    return self.reply(control, 400, json!("no key"));
                };
                let expected =
                    hash::credential_hash(HashAlg::Sha256, &key, user, PASSWORD, &salt).unwrap();
                if expected != *hash_hex {
                    return self.reply(control, 401, json!("wrong credentials"));
                }
                let token = self.issue_token();
                self.reply(
                    control,
                    200,
                    json!({
                        "token": token,
                        "key": self.next_hex("token-key"),
                        "validUntil": loxone_now() + TOKEN_LIFETIME_SECS,
                        "tokenRights": 2,
                        "unsecurePass": false
                    }),
                );
            }
            ["authwithtoken", hash_hex, _user] => {
                let Some((key, _)) = self.key2.take() else {
                    return self.reply(control, 400, json!("no key"));
                };
                let rejected = self.shared.behavior.lock().unwrap().reject_tokens;
                if rejected || self.matching_token(&key, hash_hex).is_none() {
                    return self.reply(control, 401, json!("invalid token"));
                }
                self.reply(
                    control,
                    200,
                    json!({ "validUntil": loxone_now() + TOKEN_LIFETIME_SECS, "tokenRights": 2 }),
                );
            }
            ["jdev", "sys", "getkey"] => {
                let key = self.next_hex("key");
                self.key = Some(key.clone());
                // the Miniserver drops the leading `j` in this echo
                self.reply("dev/sys/getkey", 200, json!(key));
            }
            ["jdev", "sys", "refreshjwt" | "refreshtoken", hash_hex, _user] => {
                let Some(key) = self.key.take() else {
                    return self.reply(control, 400, json!("no key"));
                };
                if self.matching_token(&key, hash_hex).is_none() {
                    return self.reply(control, 401, json!("invalid token"));
                }
                let token = self.issue_token();
                self.reply(
                    control,
                    200,
                    json!({ "token": token, "validUntil": loxone_now() + TOKEN_LIFETIME_SECS }),
                );
            }
            ["jdev", "sys", "checktoken", hash_hex, _user] => {
                let Some((key, _)) = self.key2.take() else {
                    return self.reply(control, 400, json!("no key"));
                };
                match self.matching_token(&key, hash_hex) {
                    Some(_) => self.reply(
                        control,
                        200,
                        json!({ "validUntil": loxone_now() + TOKEN_LIFETIME_SECS, "tokenRights": 2 }),
                    ),
                    None => self.reply(control, 401, json!("invalid token")),
                }
            }
            ["jdev", "sys", "killtoken", token, _user] => {
                self.shared
                    .issued
                    .lock()
                    .unwrap()
                    .retain(|issued| issued != token);
                self.reply(control, 200, json!(""));
            }
            ["jdev", "sys", "getvisusalt", _user] => {
                let key_salt = (self.next_hex("visu-key"), self.next_hex("visu-salt"));
                self.reply(
                    control,
                    200,
                    json!({ "key": key_salt.0, "salt": key_salt.1, "hashAlg": "SHA256" }),
                );
                self.visu = Some(key_salt);
            }
            ["jdev", "sps", "ios", hash_hex, _uuid, value] => {
                let Some((key, salt)) = self.visu.take() else {
                    return self.reply(control, 400, json!("no visu salt"));
                };
                let expected =
                    hash::visual_hash(HashAlg::Sha256, &key, VISU_PASSWORD, &salt).unwrap();
                if expected == *hash_hex {
                    self.reply(control, 200, json!(value));
                } else {
                    self.reply(control, 401, json!("wrong visualization password"));
                }
            }
            ["jdev", "sps", "enablebinstatusupdate"] => {
                self.reply(control, 200, json!("1"));
                self.push_states(&[(LIGHT_UUID.to_string(), 1.0)]);
            }
            ["jdev", "sps", "io", uuid, value] => {
                if *uuid == UNKNOWN_UUID {
                    self.reply(control, 404, json!("unknown control"));
                } else {
                    self.reply(control, 200, json!(value));
                }
            }
            _ => self.reply(control, 200, json!("")),
        }
    }
}
