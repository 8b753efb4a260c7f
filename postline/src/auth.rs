//! Startup and authentication.
//!
//! The startup message is answered by a chain of authentication requests.
//! Supported are cleartext password, salted MD5 and SASL `SCRAM-SHA-256`.
//! Once authenticated, the server reports session parameters and backend key
//! data, then the first `ReadyForQuery`.
use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::Rng;
use sha2::Sha256;

use crate::{
    Result,
    common::{log_debug, verbose},
    connection::Config,
    postgres::{
        BackendMessage, ProtocolError,
        backend::Authentication,
        frontend::{PasswordMessage, SaslInitialResponse, SaslResponse, Startup},
    },
    stream::PgStream,
    transport::PgTransport,
};

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
const NONCE_LEN: usize = 24;

/// Authentication failure on the client side.
pub enum AuthError {
    /// The server asked for a password and none is configured.
    MissingPassword,
    /// The requested method or every offered SASL mechanism is unsupported.
    Unsupported(String),
    /// The SASL exchange is malformed or the server could not prove the password.
    Sasl(&'static str),
}

impl std::error::Error for AuthError { }

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPassword => f.write_str("server requested a password but none is configured"),
            Self::Unsupported(method) => write!(f, "unsupported authentication method: {method}"),
            Self::Sasl(reason) => write!(f, "SASL authentication failed: {reason}"),
        }
    }
}

impl fmt::Debug for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Run startup until the first `ReadyForQuery`.
pub(crate) async fn startup<T: PgTransport>(stream: &mut PgStream<T>, config: &Config) -> Result<()> {
    verbose!(user = %config.user, database = %config.dbname, "startup");

    let params = config.startup_params();
    let params = params.iter().map(|(k, v)| (*k, v.as_str())).collect::<Vec<_>>();

    stream.send_startup(Startup {
        user: &config.user,
        database: Some(&config.dbname),
        params: &params,
    });
    stream.flush().await?;

    authenticate(stream, config).await?;

    // parameter status and backend key data are consumed by the stream
    match stream.recv().await? {
        BackendMessage::ReadyForQuery(_) => Ok(()),
        BackendMessage::ErrorResponse(err) => Err(err.error.into()),
        other => Err(ProtocolError::unexpected_phase(other.msgtype(), "startup").into()),
    }
}

async fn authenticate<T: PgTransport>(stream: &mut PgStream<T>, config: &Config) -> Result<()> {
    let mut scram = None::<ScramSha256>;

    loop {
        let auth = match stream.recv().await? {
            BackendMessage::Authentication(auth) => auth,
            BackendMessage::ErrorResponse(err) => return Err(err.error.into()),
            other => {
                return Err(ProtocolError::unexpected_phase(other.msgtype(), "authentication").into());
            }
        };

        match auth {
            Authentication::Ok => return Ok(()),
            Authentication::CleartextPassword => {
                stream.send(PasswordMessage { password: password(config)? });
            }
            Authentication::MD5Password { salt } => {
                let hashed = md5_password(&config.user, password(config)?, salt);
                stream.send(PasswordMessage { password: &hashed });
            }
            Authentication::SASL { .. } => {
                if !auth.sasl_mechanisms().any(|m| m == SCRAM_SHA_256.as_bytes()) {
                    let offered = auth
                        .sasl_mechanisms()
                        .map(String::from_utf8_lossy)
                        .collect::<Vec<_>>()
                        .join(", ");
                    return Err(AuthError::Unsupported(format!("SASL mechanisms [{offered}]")).into());
                }
                // the server uses the user name from the startup message
                let client = ScramSha256::new("", password(config)?);
                stream.send(SaslInitialResponse {
                    mechanism: SCRAM_SHA_256,
                    data: client.client_first().as_bytes(),
                });
                scram = Some(client);
            }
            Authentication::SASLContinue { data } => {
                let Some(client) = scram.as_mut() else {
                    return Err(ProtocolError::unexpected_phase(Authentication::MSGTYPE, "SASL").into());
                };
                let response = client.server_first(&data)?;
                stream.send(SaslResponse { data: response.as_bytes() });
            }
            Authentication::SASLFinal { data } => {
                let Some(client) = scram.take() else {
                    return Err(ProtocolError::unexpected_phase(Authentication::MSGTYPE, "SASL").into());
                };
                client.server_final(&data)?;
                continue;
            }
            Authentication::Unsupported { code } => {
                let method = match code {
                    2 => "KerberosV5",
                    7 | 8 => "GSSAPI",
                    9 => "SSPI",
                    _ => "unknown",
                };
                log_debug!("server requested {method} authentication");
                return Err(AuthError::Unsupported(method.into()).into());
            }
        }

        stream.flush().await?;
    }
}

fn password(config: &Config) -> Result<&str, AuthError> {
    match config.pass.is_empty() {
        true => Err(AuthError::MissingPassword),
        false => Ok(&config.pass),
    }
}

fn hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0xf) as usize] as char);
    }
    out
}

/// `"md5" + md5(md5(password + user) + salt)`, both rounds hex encoded.
pub(crate) fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let inner = hex(&md5.finalize_reset());

    md5.update(inner.as_bytes());
    md5.update(salt);
    format!("md5{}", hex(&md5.finalize()))
}

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], data: &[u8]) -> Result<HmacSha256, AuthError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| AuthError::Sasl("invalid hmac key"))?;
    mac.update(data);
    Ok(mac)
}

/// PBKDF2 with HMAC-SHA-256, a single block is the full key.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32], AuthError> {
    let mut u: [u8; 32] = {
        let mut mac = hmac(password, salt)?;
        mac.update(&1u32.to_be_bytes());
        mac.finalize().into_bytes().into()
    };
    let mut hi = u;

    for _ in 1..iterations {
        u = hmac(password, &u)?.finalize().into_bytes().into();
        for (hi, u) in hi.iter_mut().zip(u) {
            *hi ^= u;
        }
    }

    Ok(hi)
}

/// Client side of `SCRAM-SHA-256` (RFC 5802, RFC 7677), without channel binding.
pub(crate) struct ScramSha256 {
    password: Vec<u8>,
    nonce: String,
    client_first_bare: String,
    /// Set after the server-first message.
    verifier: Option<ServerVerifier>,
}

struct ServerVerifier {
    server_key: [u8; 32],
    auth_message: String,
}

impl ScramSha256 {
    pub(crate) fn new(user: &str, password: &str) -> Self {
        let mut rng = rand::rng();
        let nonce = (0..NONCE_LEN)
            .map(|_| {
                // printable, excluding ','
                let mut c = rng.random_range(0x21u8..0x7f);
                if c == b',' {
                    c = b'~';
                }
                c as char
            })
            .collect::<String>();
        Self::with_nonce(user, password, nonce)
    }

    fn with_nonce(user: &str, password: &str, nonce: String) -> Self {
        // SASLprep, falling back to the raw bytes like the server does
        let password = match stringprep::saslprep(password) {
            Ok(prepared) => prepared.into_owned().into_bytes(),
            Err(_) => password.as_bytes().to_vec(),
        };
        let user = user.replace('=', "=3D").replace(',', "=2C");
        let client_first_bare = format!("n={user},r={nonce}");
        Self { password, nonce, client_first_bare, verifier: None }
    }

    /// `gs2-header` without channel binding, followed by the bare message.
    pub(crate) fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Consume server-first, returns client-final.
    pub(crate) fn server_first(&mut self, data: &[u8]) -> Result<String, AuthError> {
        let server_first = std::str::from_utf8(data).map_err(|_| AuthError::Sasl("server-first is not utf8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_at_checked(2) {
                Some(("r=", value)) => nonce = Some(value),
                Some(("s=", value)) => salt = Some(value),
                Some(("i=", value)) => iterations = Some(value),
                _ => {}
            }
        }

        let (Some(nonce), Some(salt), Some(iterations)) = (nonce, salt, iterations) else {
            return Err(AuthError::Sasl("server-first is missing an attribute"));
        };
        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(AuthError::Sasl("server nonce does not extend client nonce"));
        }
        let salt = STANDARD.decode(salt).map_err(|_| AuthError::Sasl("salt is not base64"))?;
        let iterations = match iterations.parse::<u32>() {
            Ok(n) if n > 0 => n,
            _ => return Err(AuthError::Sasl("invalid iteration count")),
        };

        let salted_password = hi(&self.password, &salt, iterations)?;
        let client_key = hmac(&salted_password, b"Client Key")?.finalize().into_bytes();
        let stored_key = Sha256::digest(client_key);

        // base64 of the "n,," gs2 header
        let client_final_without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!(
            "{},{server_first},{client_final_without_proof}",
            self.client_first_bare,
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?.finalize().into_bytes();
        let proof = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect::<Vec<u8>>();

        let server_key = hmac(&salted_password, b"Server Key")?.finalize().into_bytes().into();
        self.verifier = Some(ServerVerifier { server_key, auth_message });

        Ok(format!("{client_final_without_proof},p={}", STANDARD.encode(proof)))
    }

    /// Verify the server signature in server-final.
    pub(crate) fn server_final(&self, data: &[u8]) -> Result<(), AuthError> {
        let Some(verifier) = &self.verifier else {
            return Err(AuthError::Sasl("server-final before server-first"));
        };
        let server_final = std::str::from_utf8(data).map_err(|_| AuthError::Sasl("server-final is not utf8"))?;

        if server_final.starts_with("e=") {
            return Err(AuthError::Sasl("server rejected the exchange"));
        }
        let Some(signature) = server_final.split(',').find_map(|attr| attr.strip_prefix("v=")) else {
            return Err(AuthError::Sasl("server-final has no verifier"));
        };
        let signature = STANDARD.decode(signature).map_err(|_| AuthError::Sasl("verifier is not base64"))?;

        hmac(&verifier.server_key, verifier.auth_message.as_bytes())?
            .verify_slice(&signature)
            .map_err(|_| AuthError::Sasl("server signature mismatch"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5() {
        assert_eq!(
            md5_password("postgres", "secret", [1, 2, 3, 4]),
            "md5bb41a296aab6baccb36ff243a562abff",
        );
    }

    // RFC 7677 section 3
    #[test]
    fn scram_sha_256() {
        let mut scram = ScramSha256::with_nonce("user", "pencil", "rOprNGfwEbeRWgbNEkqO".into());
        assert_eq!(scram.client_first(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let client_final = scram
            .server_first(b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap();
        assert_eq!(
            client_final,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=",
        );

        scram.server_final(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=").unwrap();
        assert!(scram.server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").is_err());
        assert!(scram.server_final(b"e=invalid-proof").is_err());
    }

    #[test]
    fn scram_rejects_foreign_nonce() {
        let mut scram = ScramSha256::with_nonce("", "pencil", "abc".into());
        assert!(scram.server_first(b"r=xyz123,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096").is_err());
        assert!(scram.server_first(b"r=abc,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096").is_err());
    }

    #[test]
    fn scram_nonce_is_printable() {
        let scram = ScramSha256::new("", "pencil");
        assert_eq!(scram.nonce.len(), NONCE_LEN);
        assert!(scram.nonce.bytes().all(|b| b.is_ascii_graphic() && b != b','));
        assert!(scram.client_first().starts_with("n,,n=,r="));
    }
}
