//! SCRAM server (RFC 5802) for SCRAM-SHA1, SCRAM-SHA256 and SCRAM-SHA512.
//!
//! A [`ScramServer`] handles exactly one exchange:
//!
//! ```text
//!   client-first  ──start()──>  server-first      (AUTH_CONTINUE)
//!                 set_password()
//!   client-final  ──step()───>  server-final      (SUCCESS)
//! ```
//!
//! Any failure, and any successful `step`, consumes the server; it cannot be
//! reused for a second attempt.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distr::Alphanumeric;
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Iteration count handed to every client.
pub const ITERATION_COUNT: u32 = 4096;

const SERVER_NONCE_LEN: usize = 24;
const SALT_LEN: usize = 16;
const MIN_CLIENT_NONCE_LEN: usize = 4;

/// Hash function backing a SCRAM mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScramHash {
    Sha1,
    Sha256,
    Sha512,
}

impl ScramHash {
    /// Maps a SASL mechanism name to its hash.
    pub fn from_mechanism(name: &str) -> Option<Self> {
        match name {
            "SCRAM-SHA1" => Some(ScramHash::Sha1),
            "SCRAM-SHA256" => Some(ScramHash::Sha256),
            "SCRAM-SHA512" => Some(ScramHash::Sha512),
            _ => None,
        }
    }

    pub fn mechanism(self) -> &'static str {
        match self {
            ScramHash::Sha1 => "SCRAM-SHA1",
            ScramHash::Sha256 => "SCRAM-SHA256",
            ScramHash::Sha512 => "SCRAM-SHA512",
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, ScramError> {
        match self {
            ScramHash::Sha1 => mac::<Hmac<Sha1>>(key, data),
            ScramHash::Sha256 => mac::<Hmac<Sha256>>(key, data),
            ScramHash::Sha512 => mac::<Hmac<Sha512>>(key, data),
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramHash::Sha1 => Sha1::digest(data).to_vec(),
            ScramHash::Sha256 => Sha256::digest(data).to_vec(),
            ScramHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// The SCRAM `Hi` function: PBKDF2 with HMAC over this hash.
    pub fn hi(self, password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>, ScramError> {
        match self {
            ScramHash::Sha1 => hi::<Hmac<Sha1>>(password, salt, iterations),
            ScramHash::Sha256 => hi::<Hmac<Sha256>>(password, salt, iterations),
            ScramHash::Sha512 => hi::<Hmac<Sha512>>(password, salt, iterations),
        }
    }
}

fn mac<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ScramError> {
    let mac = <M as Mac>::new_from_slice(key).map_err(|_| ScramError::InvalidKeyLength)?;
    Ok(mac.chain_update(data).finalize().into_bytes().to_vec())
}

fn hi<M: Mac + hmac::digest::KeyInit + Clone>(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<Vec<u8>, ScramError> {
    let keyed = <M as Mac>::new_from_slice(password).map_err(|_| ScramError::InvalidKeyLength)?;

    // U1 = HMAC(password, salt || INT(1))
    let mut u = keyed
        .clone()
        .chain_update(salt)
        .chain_update(1u32.to_be_bytes())
        .finalize()
        .into_bytes()
        .to_vec();
    let mut result = u.clone();

    for _ in 1..iterations {
        u = keyed.clone().chain_update(&u).finalize().into_bytes().to_vec();
        xor_in_place(&mut result, &u);
    }

    Ok(result)
}

fn xor_in_place(acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a ^= b;
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Errors produced by a SCRAM exchange. All of them are authentication
/// failures from the client's point of view.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("malformed client-first message: {0}")]
    MalformedClientFirst(&'static str),

    #[error("malformed client-final message: {0}")]
    MalformedClientFinal(&'static str),

    #[error("channel binding is not supported")]
    ChannelBindingUnsupported,

    #[error("channel binding does not match the client-first message")]
    ChannelBindingMismatch,

    #[error("nonce does not match the exchange")]
    NonceMismatch,

    #[error("client proof is invalid")]
    InvalidProof,

    #[error("password was not set before the final step")]
    PasswordNotSet,

    #[error("exchange already started")]
    AlreadyStarted,

    #[error("exchange not started")]
    NotStarted,

    #[error("exchange already finished")]
    Consumed,

    #[error("invalid HMAC key length")]
    InvalidKeyLength,
}

/// Data captured by `start` and needed by `step`.
#[derive(Debug)]
struct Exchange {
    gs2_header: String,
    client_first_bare: String,
    server_first: String,
    combined_nonce: String,
    salted_password: Option<Vec<u8>>,
}

#[derive(Debug)]
enum State {
    Initial,
    Started(Box<Exchange>),
    Finished,
}

/// Server side of a single SCRAM exchange.
#[derive(Debug)]
pub struct ScramServer {
    hash: ScramHash,
    server_nonce: String,
    salt: Vec<u8>,
    state: State,
}

impl ScramServer {
    /// Creates an exchange with a random server nonce and salt.
    pub fn new(hash: ScramHash) -> Self {
        let mut rng = rand::rng();
        let server_nonce: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(SERVER_NONCE_LEN)
            .map(char::from)
            .collect();
        let mut salt = vec![0u8; SALT_LEN];
        rng.fill(&mut salt[..]);

        Self::with_nonce_and_salt(hash, server_nonce, salt)
    }

    /// Creates an exchange with a fixed server nonce and salt.
    pub fn with_nonce_and_salt(
        hash: ScramHash,
        server_nonce: impl Into<String>,
        salt: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            hash,
            server_nonce: server_nonce.into(),
            salt: salt.into(),
            state: State::Initial,
        }
    }

    pub fn hash(&self) -> ScramHash {
        self.hash
    }

    /// True once the exchange can no longer be used.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished)
    }

    /// Processes the client-first message.
    ///
    /// Returns the authenticating username and the server-first message.
    pub fn start(&mut self, client_first: &str) -> Result<(String, String), ScramError> {
        match self.state {
            State::Initial => {}
            State::Started(_) => {
                self.state = State::Finished;
                return Err(ScramError::AlreadyStarted);
            }
            State::Finished => return Err(ScramError::Consumed),
        }
        self.state = State::Finished;

        let parts: Vec<&str> = client_first.split(',').collect();
        if parts.len() != 4 {
            return Err(ScramError::MalformedClientFirst("expected four fields"));
        }

        match parts[0] {
            "n" => {}
            "y" => return Err(ScramError::ChannelBindingUnsupported),
            p if p.starts_with("p=") => return Err(ScramError::ChannelBindingUnsupported),
            _ => return Err(ScramError::MalformedClientFirst("invalid gs2 flag")),
        }

        let username = parts[2]
            .strip_prefix("n=")
            .ok_or(ScramError::MalformedClientFirst("missing username"))?;
        let username = decode_saslname(username)?;

        let client_nonce = parts[3]
            .strip_prefix("r=")
            .ok_or(ScramError::MalformedClientFirst("missing nonce"))?;
        if client_nonce.len() < MIN_CLIENT_NONCE_LEN {
            return Err(ScramError::MalformedClientFirst("nonce too short"));
        }

        let combined_nonce = format!("{}{}", client_nonce, self.server_nonce);
        let server_first = format!(
            "r={},s={},i={}",
            combined_nonce,
            BASE64.encode(&self.salt),
            ITERATION_COUNT
        );

        self.state = State::Started(Box::new(Exchange {
            gs2_header: format!("{},{},", parts[0], parts[1]),
            client_first_bare: format!("{},{}", parts[2], parts[3]),
            server_first: server_first.clone(),
            combined_nonce,
            salted_password: None,
        }));

        Ok((username, server_first))
    }

    /// Derives the salted password for the exchange.
    pub fn set_password(&mut self, password: &str) -> Result<(), ScramError> {
        let exchange = match &mut self.state {
            State::Started(exchange) => exchange,
            State::Initial => return Err(ScramError::NotStarted),
            State::Finished => return Err(ScramError::Consumed),
        };

        exchange.salted_password = Some(self.hash.hi(
            password.as_bytes(),
            &self.salt,
            ITERATION_COUNT,
        )?);
        Ok(())
    }

    /// Verifies the client-final message and returns the server-final message.
    pub fn step(&mut self, client_final: &str) -> Result<String, ScramError> {
        match self.state {
            State::Started(_) => {}
            State::Initial => return Err(ScramError::NotStarted),
            State::Finished => return Err(ScramError::Consumed),
        }
        let State::Started(exchange) = std::mem::replace(&mut self.state, State::Finished) else {
            return Err(ScramError::Consumed);
        };
        let salted_password = exchange
            .salted_password
            .as_deref()
            .ok_or(ScramError::PasswordNotSet)?;

        let parts: Vec<&str> = client_final.split(',').collect();
        if parts.len() != 3 {
            return Err(ScramError::MalformedClientFinal("expected three fields"));
        }

        let channel_binding = parts[0]
            .strip_prefix("c=")
            .ok_or(ScramError::MalformedClientFinal("missing channel binding"))?;
        let channel_binding = BASE64
            .decode(channel_binding)
            .map_err(|_| ScramError::MalformedClientFinal("channel binding is not base64"))?;
        if channel_binding != exchange.gs2_header.as_bytes() {
            return Err(ScramError::ChannelBindingMismatch);
        }

        let nonce = parts[1]
            .strip_prefix("r=")
            .ok_or(ScramError::MalformedClientFinal("missing nonce"))?;
        if nonce != exchange.combined_nonce {
            return Err(ScramError::NonceMismatch);
        }

        let proof = parts[2]
            .strip_prefix("p=")
            .ok_or(ScramError::MalformedClientFinal("missing proof"))?;

        let client_final_without_proof = format!("{},{}", parts[0], parts[1]);
        let auth_message = format!(
            "{},{},{}",
            exchange.client_first_bare, exchange.server_first, client_final_without_proof
        );

        let client_key = self.hash.hmac(salted_password, b"Client Key")?;
        let stored_key = self.hash.digest(&client_key);
        let client_signature = self.hash.hmac(&stored_key, auth_message.as_bytes())?;
        let mut expected_proof = client_key;
        xor_in_place(&mut expected_proof, &client_signature);

        if !constant_time_eq(BASE64.encode(&expected_proof).as_bytes(), proof.as_bytes()) {
            return Err(ScramError::InvalidProof);
        }

        let server_key = self.hash.hmac(salted_password, b"Server Key")?;
        let server_signature = self.hash.hmac(&server_key, auth_message.as_bytes())?;

        Ok(format!("v={}", BASE64.encode(server_signature)))
    }
}

/// Decodes a SCRAM `saslname`, where `=2C` stands for `,` and `=3D` for `=`.
fn decode_saslname(name: &str) -> Result<String, ScramError> {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('=') {
        out.push_str(&rest[..pos]);
        let escape = rest.get(pos..pos + 3);
        match escape {
            Some("=2C") => out.push(','),
            Some("=3D") => out.push('='),
            _ => return Err(ScramError::MalformedClientFirst("invalid username escape")),
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);

    if out.is_empty() {
        return Err(ScramError::MalformedClientFirst("empty username"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8] = b"saltSALTsalt";
    const CLIENT_FIRST: &str = "n,,n=user,r=clientNONCE";
    const SERVER_FIRST: &str = "r=clientNONCEserverNONCE,s=c2FsdFNBTFRzYWx0,i=4096";

    fn started(hash: ScramHash) -> ScramServer {
        let mut server = ScramServer::with_nonce_and_salt(hash, "serverNONCE", SALT);
        let (user, server_first) = server.start(CLIENT_FIRST).unwrap();
        assert_eq!(user, "user");
        assert_eq!(server_first, SERVER_FIRST);
        server.set_password("pencil").unwrap();
        server
    }

    fn client_final(proof: &str) -> String {
        format!("c=biws,r=clientNONCEserverNONCE,p={}", proof)
    }

    #[test]
    fn test_scram_sha1_exchange() {
        let mut server = started(ScramHash::Sha1);
        let server_final = server
            .step(&client_final("I4oktcY7BOL0Agn0NlWRXlRP1mg="))
            .unwrap();
        assert_eq!(server_final, "v=oKPvB1bE/9ydptJ+kohMgL+NdM0=");
        assert!(server.is_finished());
    }

    #[test]
    fn test_scram_sha256_exchange() {
        let mut server = started(ScramHash::Sha256);
        let server_final = server
            .step(&client_final("ItXnHvCDW7VGij6H+4rv2o93HvkLwrQaLkfVjeSMfrc="))
            .unwrap();
        assert_eq!(server_final, "v=P61v8wxOu6B9J7Uij+Sk4zewSK1e6en6f5rCFO4OUNE=");
    }

    #[test]
    fn test_scram_sha512_exchange() {
        let mut server = started(ScramHash::Sha512);
        let server_final = server
            .step(&client_final(
                "34wMEWVO5TJYXrP98S6KmffFBp9Q1JkjAZPeI4AbE/WMhAG0PbHTocC1vWrzV/FbPhO7owIade2tYoD7xDix5A==",
            ))
            .unwrap();
        assert_eq!(
            server_final,
            "v=K5J6UGWkvwZJYv6XT1VR6PpUWgea8Kzpo8Zu4ko69jOipPAvrDuvgXHrZ2b61obGzGsGGKcJFZz+fu+JQH0Chw=="
        );
    }

    #[test]
    fn test_step_twice_fails() {
        let mut server = started(ScramHash::Sha1);
        let message = client_final("I4oktcY7BOL0Agn0NlWRXlRP1mg=");
        assert!(server.step(&message).is_ok());
        assert_eq!(server.step(&message), Err(ScramError::Consumed));
    }

    #[test]
    fn test_wrong_proof() {
        let mut server = started(ScramHash::Sha1);
        let result = server.step(&client_final("AAAAAAAAAAAAAAAAAAAAAAAAAAA="));
        assert_eq!(result, Err(ScramError::InvalidProof));
        assert!(server.is_finished());

        // a correct proof after a failure is still rejected
        let result = server.step(&client_final("I4oktcY7BOL0Agn0NlWRXlRP1mg="));
        assert_eq!(result, Err(ScramError::Consumed));
    }

    #[test]
    fn test_wrong_password() {
        let mut server = ScramServer::with_nonce_and_salt(ScramHash::Sha1, "serverNONCE", SALT);
        server.start(CLIENT_FIRST).unwrap();
        server.set_password("not-pencil").unwrap();
        assert_eq!(
            server.step(&client_final("I4oktcY7BOL0Agn0NlWRXlRP1mg=")),
            Err(ScramError::InvalidProof)
        );
    }

    #[test]
    fn test_nonce_mismatch() {
        let mut server = started(ScramHash::Sha1);
        let result = server.step("c=biws,r=clientNONCEotherNONCE,p=I4oktcY7BOL0Agn0NlWRXlRP1mg=");
        assert_eq!(result, Err(ScramError::NonceMismatch));
    }

    #[test]
    fn test_channel_binding_mismatch() {
        let mut server = started(ScramHash::Sha1);
        // "y,," instead of "n,,"
        let result = server.step("c=eSws,r=clientNONCEserverNONCE,p=I4oktcY7BOL0Agn0NlWRXlRP1mg=");
        assert_eq!(result, Err(ScramError::ChannelBindingMismatch));
    }

    #[test]
    fn test_malformed_client_final() {
        let mut server = started(ScramHash::Sha1);
        assert!(matches!(
            server.step("c=biws,r=clientNONCEserverNONCE"),
            Err(ScramError::MalformedClientFinal(_))
        ));
    }

    #[test]
    fn test_malformed_client_first() {
        let cases = [
            "n,,n=user",
            "x,,n=user,r=clientNONCE",
            "n,,u=user,r=clientNONCE",
            "n,,n=user,r=a",
            "n,,n=user,x=clientNONCE",
            "n,,n=us=er,r=clientNONCE",
            "n,,n=,r=clientNONCE",
        ];
        for case in cases {
            let mut server = ScramServer::new(ScramHash::Sha256);
            assert!(
                matches!(server.start(case), Err(ScramError::MalformedClientFirst(_))),
                "{case}"
            );
            assert!(server.is_finished());
        }
    }

    #[test]
    fn test_channel_binding_unsupported() {
        let mut server = ScramServer::new(ScramHash::Sha1);
        assert_eq!(
            server.start("p=tls-unique,,n=user,r=clientNONCE"),
            Err(ScramError::ChannelBindingUnsupported)
        );
    }

    #[test]
    fn test_start_twice_fails() {
        let mut server = ScramServer::new(ScramHash::Sha1);
        server.start(CLIENT_FIRST).unwrap();
        assert_eq!(server.start(CLIENT_FIRST), Err(ScramError::AlreadyStarted));
        assert!(server.is_finished());
    }

    #[test]
    fn test_step_without_password() {
        let mut server = ScramServer::with_nonce_and_salt(ScramHash::Sha1, "serverNONCE", SALT);
        server.start(CLIENT_FIRST).unwrap();
        assert_eq!(
            server.step(&client_final("I4oktcY7BOL0Agn0NlWRXlRP1mg=")),
            Err(ScramError::PasswordNotSet)
        );
    }

    #[test]
    fn test_step_before_start() {
        let mut server = ScramServer::new(ScramHash::Sha1);
        assert_eq!(server.step("c=biws,r=x,p=y"), Err(ScramError::NotStarted));
        assert_eq!(server.set_password("pencil"), Err(ScramError::NotStarted));

        // The engine is still usable after the early step
        assert!(server.start(CLIENT_FIRST).is_ok());
    }

    #[test]
    fn test_short_client_nonce_rejected() {
        let mut server = ScramServer::new(ScramHash::Sha1);
        assert_eq!(
            server.start("n,,n=user,r=ab"),
            Err(ScramError::MalformedClientFirst("nonce too short"))
        );

        let mut server = ScramServer::new(ScramHash::Sha1);
        assert!(server.start("n,,n=user,r=abcd").is_ok());
    }

    #[test]
    fn test_random_nonce_is_appended() {
        let mut server = ScramServer::new(ScramHash::Sha512);
        let (_, server_first) = server.start(CLIENT_FIRST).unwrap();
        let nonce = server_first
            .strip_prefix("r=clientNONCE")
            .and_then(|rest| rest.split(',').next())
            .unwrap();
        assert_eq!(nonce.len(), SERVER_NONCE_LEN);
        assert!(server_first.ends_with(",i=4096"));
    }

    #[test]
    fn test_username_escapes() {
        let mut server = ScramServer::new(ScramHash::Sha1);
        let (user, _) = server.start("n,,n=a=2Cb=3Dc,r=clientNONCE").unwrap();
        assert_eq!(user, "a,b=c");
    }

    #[test]
    fn test_hi_matches_rfc6070() {
        // PBKDF2-HMAC-SHA1 test vector, c = 4096
        let derived = ScramHash::Sha1.hi(b"password", b"salt", 4096).unwrap();
        assert_eq!(
            derived,
            vec![
                0x4b, 0x00, 0x79, 0x01, 0xb7, 0x65, 0x48, 0x9a, 0xbe, 0xad, 0x49, 0xd9, 0x26,
                0xf7, 0x21, 0xd0, 0x65, 0xa4, 0x29, 0xc1
            ]
        );
    }

    #[test]
    fn test_mechanism_names() {
        for hash in [ScramHash::Sha1, ScramHash::Sha256, ScramHash::Sha512] {
            assert_eq!(ScramHash::from_mechanism(hash.mechanism()), Some(hash));
        }
        assert_eq!(ScramHash::from_mechanism("SCRAM-SHA-256"), None);
    }
}
