//! JWS signing of schema 1 manifests (ES256), in the "pretty signature" form
//! registries expect: the signatures block is spliced into the formatted
//! manifest just before its closing brace.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{SecondsFormat, Utc};
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use p256::SecretKey;
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest as _, Sha256};

use super::Manifest;
use crate::digest::Digest;
use crate::error::{PushError, Result};

const INDENT: &[u8] = b"   ";
const FORMAT_TAIL: &[u8] = b"\n}";

/// Something that can produce ES256 signatures and describe its public key.
pub trait ManifestSigner {
    fn algorithm(&self) -> &'static str;

    /// Public key as a JWK object.
    fn public_jwk(&self) -> Result<Value>;

    fn sign(&self, signing_input: &[u8]) -> Result<Vec<u8>>;
}

/// An ECDSA P-256 private key.
pub struct EcdsaKey {
    secret: SecretKey,
    key: SigningKey,
}

impl EcdsaKey {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut rand::rngs::OsRng))
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        let secret = SecretKey::from_pkcs8_pem(pem)
            .map_err(|e| PushError::Sign(format!("invalid PKCS#8 key: {e}")))?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let key = SigningKey::from(&secret);
        Self { secret, key }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| PushError::io(path, e))?;
        Self::from_pem(&pem)
    }

    pub fn to_pem(&self) -> Result<String> {
        self.secret
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| PushError::Sign(format!("failed to encode key: {e}")))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key().clone()
    }

    /// libtrust-style key id: base32 of the truncated SPKI fingerprint,
    /// grouped by four characters.
    pub fn key_id(&self) -> Result<String> {
        key_id(&self.verifying_key())
    }
}

impl ManifestSigner for EcdsaKey {
    fn algorithm(&self) -> &'static str {
        "ES256"
    }

    fn public_jwk(&self) -> Result<Value> {
        let point = self.verifying_key().to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(PushError::Sign("public key is the identity point".to_string()));
        };
        Ok(json!({
            "crv": "P-256",
            "kid": self.key_id()?,
            "kty": "EC",
            "x": URL_SAFE_NO_PAD.encode(x),
            "y": URL_SAFE_NO_PAD.encode(y),
        }))
    }

    fn sign(&self, signing_input: &[u8]) -> Result<Vec<u8>> {
        let signature: Signature = self
            .key
            .try_sign(signing_input)
            .map_err(|e| PushError::Sign(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}

/// A manifest after signing. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedManifest {
    pub name: String,
    pub tag: String,
    pub manifest: Manifest,
    /// Digest of `payload`; the manifest's public identity.
    pub digest: Digest,
    /// Formatted manifest without signatures.
    pub payload: Vec<u8>,
    /// What gets published: `payload` with the signatures block spliced in.
    pub bytes: Vec<u8>,
}

pub fn sign_manifest(manifest: &Manifest, signer: &dyn ManifestSigner) -> Result<SignedManifest> {
    let payload = to_pretty_json(manifest).map_err(|e| PushError::Sign(e.to_string()))?;
    if !payload.ends_with(FORMAT_TAIL) {
        return Err(PushError::Sign("unexpected manifest formatting".to_string()));
    }
    let format_length = payload.len() - FORMAT_TAIL.len();

    let protected = json!({
        "formatLength": format_length,
        "formatTail": URL_SAFE_NO_PAD.encode(FORMAT_TAIL),
        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    let protected = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&protected).map_err(|e| PushError::Sign(e.to_string()))?,
    );
    let signing_input = format!("{protected}.{}", URL_SAFE_NO_PAD.encode(&payload));
    let signature = signer.sign(signing_input.as_bytes())?;

    let signatures = json!([{
        "header": {
            "jwk": signer.public_jwk()?,
            "alg": signer.algorithm(),
        },
        "signature": URL_SAFE_NO_PAD.encode(signature),
        "protected": protected,
    }]);
    let block = to_pretty_json(&signatures).map_err(|e| PushError::Sign(e.to_string()))?;
    let block = String::from_utf8_lossy(&block).replace('\n', "\n   ");

    let mut bytes = Vec::with_capacity(payload.len() + block.len() + 32);
    bytes.extend_from_slice(&payload[..format_length]);
    bytes.extend_from_slice(b",\n   \"signatures\": ");
    bytes.extend_from_slice(block.as_bytes());
    bytes.extend_from_slice(FORMAT_TAIL);

    let digest = Digest::from_bytes(&payload);
    tracing::debug!(name = %manifest.name, tag = %manifest.tag, digest = %digest, "Signed manifest");

    Ok(SignedManifest {
        name: manifest.name.clone(),
        tag: manifest.tag.clone(),
        manifest: manifest.clone(),
        digest,
        payload,
        bytes,
    })
}

/// Check the first signature of a published manifest and recover it.
pub fn verify(bytes: &[u8]) -> Result<SignedManifest> {
    let fail = PushError::Verify;

    let doc: Value = serde_json::from_slice(bytes).map_err(|e| fail(e.to_string()))?;
    let sig = doc["signatures"]
        .get(0)
        .ok_or_else(|| fail("no signatures".to_string()))?;

    let protected_b64 = sig["protected"]
        .as_str()
        .ok_or_else(|| fail("missing protected header".to_string()))?;
    let protected: Value = serde_json::from_slice(&decode(protected_b64)?)
        .map_err(|e| fail(format!("protected header: {e}")))?;
    let format_length = protected["formatLength"]
        .as_u64()
        .ok_or_else(|| fail("missing formatLength".to_string()))? as usize;
    let format_tail = decode(
        protected["formatTail"]
            .as_str()
            .ok_or_else(|| fail("missing formatTail".to_string()))?,
    )?;
    if format_length > bytes.len() {
        return Err(fail("formatLength beyond document".to_string()));
    }

    let mut payload = bytes[..format_length].to_vec();
    payload.extend_from_slice(&format_tail);

    let jwk = &sig["header"]["jwk"];
    let coordinate = |name: &str| -> Result<Vec<u8>> {
        let raw = decode(
            jwk[name]
                .as_str()
                .ok_or_else(|| fail(format!("jwk missing {name}")))?,
        )?;
        if raw.len() != 32 {
            return Err(fail(format!("jwk {name} has {} bytes", raw.len())));
        }
        Ok(raw)
    };
    let mut sec1 = vec![0x04];
    sec1.extend(coordinate("x")?);
    sec1.extend(coordinate("y")?);
    let verifying_key =
        VerifyingKey::from_sec1_bytes(&sec1).map_err(|e| fail(format!("public key: {e}")))?;

    let signature = Signature::from_slice(&decode(
        sig["signature"]
            .as_str()
            .ok_or_else(|| fail("missing signature".to_string()))?,
    )?)
    .map_err(|e| fail(format!("signature: {e}")))?;

    let signing_input = format!("{protected_b64}.{}", URL_SAFE_NO_PAD.encode(&payload));
    verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| fail("signature does not match".to_string()))?;

    let manifest: Manifest =
        serde_json::from_slice(&payload).map_err(|e| fail(format!("payload: {e}")))?;
    Ok(SignedManifest {
        name: manifest.name.clone(),
        tag: manifest.tag.clone(),
        digest: Digest::from_bytes(&payload),
        manifest,
        payload,
        bytes: bytes.to_vec(),
    })
}

fn decode(b64: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(b64)
        .map_err(|e| PushError::Verify(format!("base64: {e}")))
}

/// JSON with three-space indentation, the layout schema 1 signatures cover.
fn to_pretty_json<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(INDENT);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser)?;
    Ok(out)
}

fn key_id(key: &VerifyingKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| PushError::Sign(format!("failed to encode public key: {e}")))?;
    let hash = Sha256::digest(der.as_bytes());
    let encoded = base32(&hash[..30]);
    let groups: Vec<&str> = encoded
        .as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect();
    Ok(groups.join(":"))
}

/// RFC 4648 base32, no padding.
fn base32(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    for &byte in data {
        buffer = (buffer << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}
