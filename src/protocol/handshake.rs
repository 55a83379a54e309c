//! Mutually authenticated ECDH handshake.
//!
//! The state lives in two per-connection structures, [`ClientHandshake`] and
//! [`ServerHandshake`], that are advanced by the engines as the reserved
//! handshake events round-trip. Nothing here touches the network: each step
//! consumes the peer's values and produces the next request arguments or reply.
//!
//! ```text
//! client                                   server
//!   INIT [pk_c | empty]          ->   record pk_c, reply hello {.., pk_s}
//!   CONFIRM [h, sig_c(h)]        ->   verify sig_c, recompute h, reply {h, sig_s(h)}
//!   verify sig_s, h == own       |    install KDF(shared)
//!   GENERATE_KEY [H(r)]          ->   t = H(clientId || H(r)), install KDF(t), reply t
//!   install KDF(t)
//!   FINISH                       ->   mark encrypted
//! ```
//!
//! Any verification failure is returned as `ProtocolError::HandshakeError`,
//! which both engines treat as fatal: the connection is closed, nothing is sent.

use std::collections::BTreeMap;

use zeroize::Zeroizing;

use crate::core::value::{Map, Value};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{
    self, derive_password_key, KeyPair, PublicKey, SessionKey, SharedSecret, HASH_SIZE,
};
use crate::utils::id;

use tracing::{debug, instrument, warn};

const HELLO_NAME: &str = "name";
const HELLO_ADDRESS: &str = "address";
const HELLO_NAMESPACES: &str = "namespaces";
const HELLO_USE_CRYPTO: &str = "useCrypto";
const HELLO_PUBLIC_KEY: &str = "serverPublicKey";
const CONFIRM_HASH: &str = "hash";
const CONFIRM_SIGNATURE: &str = "signature";

fn handshake_error(msg: &str) -> ProtocolError {
    ProtocolError::HandshakeError(msg.to_string())
}

/// Where a connection is in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Unauthenticated,
    KeyExchange,
    Confirmed,
    /// Finished without encryption
    Connected,
    /// Finished with a session key installed
    Secured,
    Failed,
}

impl HandshakeState {
    pub fn is_established(self) -> bool {
        matches!(self, HandshakeState::Connected | HandshakeState::Secured)
    }
}

/// Client view of the connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub name: String,
    pub address: String,
    /// Namespace name to its method names, as advertised by the server
    pub namespaces: BTreeMap<String, Vec<String>>,
    /// Whether the server negotiates encryption
    pub use_crypto: bool,
    pub state: HandshakeState,
}

/// Server identity returned by `HANDSHAKE_INIT`
#[derive(Debug, Clone, PartialEq)]
pub struct ServerHello {
    pub name: String,
    pub address: String,
    pub namespaces: BTreeMap<String, Vec<String>>,
    pub use_crypto: bool,
    pub public_key: Option<Vec<u8>>,
}

impl ServerHello {
    pub fn to_value(&self) -> Value {
        let namespaces: Map = self
            .namespaces
            .iter()
            .map(|(ns, methods)| {
                let methods = methods.iter().map(|m| Value::from(m.as_str())).collect();
                (ns.clone(), Value::List(methods))
            })
            .collect();

        let mut map = Map::new();
        map.insert(HELLO_NAME.into(), Value::from(self.name.as_str()));
        map.insert(HELLO_ADDRESS.into(), Value::from(self.address.as_str()));
        map.insert(HELLO_NAMESPACES.into(), Value::Map(namespaces));
        map.insert(HELLO_USE_CRYPTO.into(), Value::Bool(self.use_crypto));
        map.insert(
            HELLO_PUBLIC_KEY.into(),
            self.public_key.clone().map(Value::Bytes).unwrap_or_default(),
        );
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let malformed = || handshake_error(constants::ERR_MALFORMED_REPLY);
        let map = value.as_map().ok_or_else(malformed)?;

        let text = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(malformed)
        };

        let mut namespaces = BTreeMap::new();
        if let Some(advertised) = map.get(HELLO_NAMESPACES).and_then(Value::as_map) {
            for (ns, methods) in advertised {
                let methods = methods
                    .as_list()
                    .ok_or_else(malformed)?
                    .iter()
                    .map(|m| m.as_str().map(str::to_string).ok_or_else(malformed))
                    .collect::<Result<Vec<_>>>()?;
                namespaces.insert(ns.clone(), methods);
            }
        }

        Ok(Self {
            name: text(HELLO_NAME)?,
            address: text(HELLO_ADDRESS)?,
            namespaces,
            use_crypto: map
                .get(HELLO_USE_CRYPTO)
                .and_then(Value::as_bool)
                .unwrap_or(false),
            public_key: map
                .get(HELLO_PUBLIC_KEY)
                .and_then(Value::as_bytes)
                .filter(|b| !b.is_empty())
                .map(<[u8]>::to_vec),
        })
    }
}

/// What the client sends after reading the server hello
#[derive(Debug, Clone, PartialEq)]
pub enum ClientStep {
    /// Plaintext connection, go straight to `HANDSHAKE_FINISH`
    Finish,
    /// Arguments for `HANDSHAKE_CONFIRM`
    Confirm(Vec<Value>),
}

/// Client half of the handshake
pub struct ClientHandshake {
    keys: Option<KeyPair>,
    server_public: Option<PublicKey>,
    shared: Option<SharedSecret>,
    shared_hash: Option<[u8; HASH_SIZE]>,
    state: HandshakeState,
}

impl ClientHandshake {
    /// Start a handshake; a key pair is generated only when crypto is wanted
    pub fn new(use_crypto: bool) -> Self {
        Self {
            keys: use_crypto.then(KeyPair::generate),
            server_public: None,
            shared: None,
            shared_hash: None,
            state: HandshakeState::Unauthenticated,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Arguments for `HANDSHAKE_INIT`: our public key, or empty bytes
    pub fn init_args(&self) -> Vec<Value> {
        let key = self
            .keys
            .as_ref()
            .map(|k| k.public_key().to_bytes().to_vec())
            .unwrap_or_default();
        vec![Value::Bytes(key)]
    }

    /// Process the server hello.
    ///
    /// # Errors
    /// `HandshakeError` if we require crypto and the server does not offer it,
    /// or its public key is malformed.
    #[instrument(skip(self, hello), fields(server = %hello.name))]
    pub fn accept_hello(&mut self, hello: &ServerHello) -> Result<ClientStep> {
        let Some(keys) = self.keys.as_ref() else {
            self.state = HandshakeState::KeyExchange;
            return Ok(ClientStep::Finish);
        };

        let server_key = match (&hello.public_key, hello.use_crypto) {
            (Some(key), true) => key,
            _ => {
                self.state = HandshakeState::Failed;
                return Err(handshake_error(constants::ERR_CRYPTO_REQUIRED));
            }
        };

        let server_public = PublicKey::from_bytes(server_key)?;
        let shared = keys.diffie_hellman(&server_public);
        let digest = crypto::hash(shared.as_bytes());
        let signature = keys.sign(&digest);

        self.server_public = Some(server_public);
        self.shared = Some(shared);
        self.shared_hash = Some(digest);
        self.state = HandshakeState::KeyExchange;

        debug!("Client derived shared secret, sending confirmation");
        Ok(ClientStep::Confirm(vec![
            Value::Bytes(digest.to_vec()),
            Value::Bytes(signature.to_vec()),
        ]))
    }

    /// Verify the server's `HANDSHAKE_CONFIRM` reply and return the
    /// intermediate key.
    #[instrument(skip_all)]
    pub fn verify_confirm(&mut self, reply: &Value) -> Result<SessionKey> {
        let result = self.verify_confirm_inner(reply);
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    fn verify_confirm_inner(&mut self, reply: &Value) -> Result<SessionKey> {
        let malformed = || handshake_error(constants::ERR_MALFORMED_REPLY);
        let map = reply.as_map().ok_or_else(malformed)?;
        let hash = map
            .get(CONFIRM_HASH)
            .and_then(Value::as_bytes)
            .ok_or_else(malformed)?;
        let signature = map
            .get(CONFIRM_SIGNATURE)
            .and_then(Value::as_bytes)
            .ok_or_else(malformed)?;

        let server_public = self
            .server_public
            .as_ref()
            .ok_or_else(|| handshake_error(constants::ERR_SERVER_KEY_NOT_FOUND))?;

        if !server_public.verify(hash, signature) {
            warn!("{}", constants::ERR_SERVER_SIGNATURE);
            return Err(handshake_error(constants::ERR_SERVER_SIGNATURE));
        }

        if self.shared_hash.as_ref().map(|h| h.as_slice()) != Some(hash) {
            warn!("{}", constants::ERR_HASH_MISMATCH);
            return Err(handshake_error(constants::ERR_HASH_MISMATCH));
        }

        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| handshake_error(constants::ERR_INTERMEDIATE_NOT_FOUND))?;

        self.state = HandshakeState::Confirmed;
        derive_password_key(shared.as_bytes())
    }

    /// Arguments for `HANDSHAKE_GENERATE_KEY`: a hashed fresh nonce
    pub fn generate_key_args(&self) -> Vec<Value> {
        vec![Value::Bytes(crypto::hash(&id::random_nonce()).to_vec())]
    }

    /// Derive the session key from the server's `HANDSHAKE_GENERATE_KEY` reply
    pub fn accept_true_secret(&mut self, reply: &Value) -> Result<SessionKey> {
        if self.state != HandshakeState::Confirmed {
            return Err(handshake_error(constants::ERR_INTERMEDIATE_NOT_FOUND));
        }
        let secret = reply
            .as_bytes()
            .filter(|b| b.len() == HASH_SIZE)
            .ok_or_else(|| handshake_error(constants::ERR_MALFORMED_REPLY))?;
        derive_password_key(secret)
    }

    /// Record that `HANDSHAKE_FINISH` was acknowledged
    pub fn finish(&mut self) -> HandshakeState {
        self.state = if self.keys.is_some() {
            HandshakeState::Secured
        } else {
            HandshakeState::Connected
        };
        self.state
    }
}

/// Server half of the handshake, one per connected client
#[derive(Default)]
pub struct ServerHandshake {
    ecdh_key: Option<KeyPair>,
    client_public_key: Option<PublicKey>,
    secret: Option<SharedSecret>,
    temp_secret: Option<SessionKey>,
    true_secret: Option<Zeroizing<[u8; HASH_SIZE]>>,
    encrypted: bool,
    state: HandshakeState,
}

impl ServerHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether the handshake finished with a session key and has not failed since
    pub fn is_encrypted(&self) -> bool {
        self.encrypted && self.state == HandshakeState::Secured
    }

    /// Any failed step leaves the handshake `Failed`
    fn settle<T>(&mut self, outcome: Result<T>) -> Result<T> {
        if outcome.is_err() {
            self.state = HandshakeState::Failed;
        }
        outcome
    }

    fn expect_state(&self, expected: HandshakeState) -> Result<()> {
        if self.state != expected {
            warn!(state = ?self.state, expected = ?expected, "{}", constants::ERR_STEP_OUT_OF_ORDER);
            return Err(handshake_error(constants::ERR_STEP_OUT_OF_ORDER));
        }
        Ok(())
    }

    /// Handle `HANDSHAKE_INIT`, returning our public key when crypto is on.
    ///
    /// # Errors
    /// `HandshakeError` if crypto is required and the client sent no key, or
    /// if the connection already started a handshake.
    #[instrument(skip(self, client_key), fields(key_len = client_key.len()))]
    pub fn init(&mut self, use_crypto: bool, client_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let outcome = self.try_init(use_crypto, client_key);
        self.settle(outcome)
    }

    fn try_init(&mut self, use_crypto: bool, client_key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.expect_state(HandshakeState::Unauthenticated)?;
        if !use_crypto {
            self.state = HandshakeState::KeyExchange;
            return Ok(None);
        }

        if client_key.is_empty() {
            return Err(handshake_error(constants::ERR_CRYPTO_REQUIRED));
        }

        let client_public = PublicKey::from_bytes(client_key)?;
        let pair = KeyPair::generate();
        let public = pair.public_key().to_bytes().to_vec();

        self.client_public_key = Some(client_public);
        self.ecdh_key = Some(pair);
        self.state = HandshakeState::KeyExchange;

        debug!("Server recorded client public key");
        Ok(Some(public))
    }

    /// Handle `HANDSHAKE_CONFIRM`: returns the reply value and the
    /// intermediate key to install.
    #[instrument(skip_all)]
    pub fn confirm(&mut self, hash: &[u8], signature: &[u8]) -> Result<(Value, SessionKey)> {
        let outcome = self.try_confirm(hash, signature);
        self.settle(outcome)
    }

    fn try_confirm(&mut self, hash: &[u8], signature: &[u8]) -> Result<(Value, SessionKey)> {
        self.expect_state(HandshakeState::KeyExchange)?;
        let client_public = self
            .client_public_key
            .as_ref()
            .ok_or_else(|| handshake_error(constants::ERR_CLIENT_PUBLIC_NOT_FOUND))?;

        if !client_public.verify(hash, signature) {
            warn!("{}", constants::ERR_CLIENT_SIGNATURE);
            return Err(handshake_error(constants::ERR_CLIENT_SIGNATURE));
        }

        let pair = self
            .ecdh_key
            .as_ref()
            .ok_or_else(|| handshake_error(constants::ERR_SERVER_KEY_NOT_FOUND))?;
        let shared = pair.diffie_hellman(client_public);
        let digest = crypto::hash(shared.as_bytes());

        if digest.as_slice() != hash {
            warn!("{}", constants::ERR_HASH_MISMATCH);
            return Err(handshake_error(constants::ERR_HASH_MISMATCH));
        }

        let signature = pair.sign(&digest);
        let temp = derive_password_key(shared.as_bytes())?;

        self.secret = Some(shared);
        self.temp_secret = Some(temp.clone());
        self.state = HandshakeState::Confirmed;

        let mut reply = Map::new();
        reply.insert(CONFIRM_HASH.into(), Value::Bytes(digest.to_vec()));
        reply.insert(CONFIRM_SIGNATURE.into(), Value::Bytes(signature.to_vec()));
        Ok((Value::Map(reply), temp))
    }

    /// Handle `HANDSHAKE_GENERATE_KEY`: derive the final secret from the
    /// connection id and the client nonce. Returns the secret (sent back to
    /// the client) and the session key to install. Runs once per connection.
    #[instrument(skip(self, nonce))]
    pub fn generate_key(
        &mut self,
        client_id: &str,
        nonce: &[u8],
    ) -> Result<(Vec<u8>, SessionKey)> {
        let outcome = self.try_generate_key(client_id, nonce);
        self.settle(outcome)
    }

    fn try_generate_key(&mut self, client_id: &str, nonce: &[u8]) -> Result<(Vec<u8>, SessionKey)> {
        if self.temp_secret.is_none() {
            return Err(handshake_error(constants::ERR_INTERMEDIATE_NOT_FOUND));
        }
        self.expect_state(HandshakeState::Confirmed)?;
        if self.true_secret.is_some() {
            warn!("{}", constants::ERR_STEP_OUT_OF_ORDER);
            return Err(handshake_error(constants::ERR_STEP_OUT_OF_ORDER));
        }
        if nonce.is_empty() {
            return Err(handshake_error(constants::ERR_MALFORMED_REPLY));
        }

        let mut material = Zeroizing::new(Vec::with_capacity(client_id.len() + nonce.len()));
        material.extend_from_slice(client_id.as_bytes());
        material.extend_from_slice(nonce);
        let true_secret = Zeroizing::new(crypto::hash(&material));

        let session = derive_password_key(true_secret.as_slice())?;
        let reply = true_secret.to_vec();
        self.true_secret = Some(true_secret);
        Ok((reply, session))
    }

    /// Handle `HANDSHAKE_FINISH`, returning whether the connection is encrypted.
    ///
    /// # Errors
    /// `HandshakeError` if crypto is required but no session key was derived,
    /// or if the handshake is not at its last step.
    pub fn finish(&mut self, use_crypto: bool) -> Result<bool> {
        let outcome = self.try_finish(use_crypto);
        self.settle(outcome)
    }

    fn try_finish(&mut self, use_crypto: bool) -> Result<bool> {
        if use_crypto && self.true_secret.is_none() {
            return Err(handshake_error(constants::ERR_SESSION_NOT_FOUND));
        }
        self.expect_state(if use_crypto {
            HandshakeState::Confirmed
        } else {
            HandshakeState::KeyExchange
        })?;

        self.encrypted = use_crypto;
        self.state = if use_crypto {
            HandshakeState::Secured
        } else {
            HandshakeState::Connected
        };
        Ok(self.encrypted)
    }
}
