//! Loading certificates and keys, and building the TLS contexts connections use.

use crate::error::TlsError;

use std::{
    fs::{self, File},
    io::BufReader,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use pkcs8::{
    der::{asn1::ObjectIdentifier, Encode},
    AlgorithmIdentifierRef, PrivateKeyInfo,
};
use ring::signature::{self as ring_sig, KeyPair};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    server::{AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient},
    Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName,
};
use rustls_pemfile::Item;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";
const EC_KEY_LABEL: &str = "EC PRIVATE KEY";

const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
static SEC1_CURVES: [(ObjectIdentifier, &ring_sig::EcdsaSigningAlgorithm); 2] = [
    (ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7"), &ring_sig::ECDSA_P256_SHA256_ASN1_SIGNING),
    (ObjectIdentifier::new_unwrap("1.3.132.0.34"), &ring_sig::ECDSA_P384_SHA384_ASN1_SIGNING),
];

/// A certificate chain and the private key belonging to its first certificate.
#[derive(Clone, Debug)]
pub struct Identity {
    pub cert_chain: Vec<Certificate>,
    pub key: PrivateKey,
}

/// Where the passphrase for an encrypted key in `key_file` is kept: the same
/// name with its extension replaced by (or extended with) `.pass`.
pub fn passphrase_file(key_file: &Path) -> PathBuf {
    key_file.with_extension("pass")
}

/// Read the passphrase for `key_file`. A missing passphrase file yields an empty
/// passphrase. The file contents and the passphrase are wiped when dropped.
pub fn read_passphrase(key_file: &Path) -> Zeroizing<String> {
    let pass_file = passphrase_file(key_file);
    match fs::read_to_string(&pass_file) {
        Ok(content) => {
            let content = Zeroizing::new(content);
            Zeroizing::new(content.lines().next().unwrap_or("").to_string())
        }
        Err(e) => {
            tracing::warn!(file = ?pass_file, error = %e, "Cannot open certificate password file");
            Zeroizing::new(String::new())
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|e| TlsError::Io(path.to_path_buf(), e))
}

/// Load all PEM certificates from `path`.
pub fn load_certificates(path: &Path) -> Result<Vec<Certificate>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Io(path.to_path_buf(), e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|e| TlsError::Io(path.to_path_buf(), e))?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn pem_block<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);

    let start = text.find(&begin)?;
    let stop = text[start..].find(&end)? + start + end.len();
    Some(&text[start..stop])
}

fn decrypt_key(path: &Path, block: &str) -> Result<PrivateKey, TlsError> {
    let decrypt_error = |e: String| TlsError::Decrypt(path.to_path_buf(), e);

    let (_, der) = pkcs8::der::pem::decode_vec(block.as_bytes()).map_err(|e| decrypt_error(e.to_string()))?;
    let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(der.as_slice())
        .map_err(|e| decrypt_error(e.to_string()))?;

    let passphrase = read_passphrase(path);
    let document = encrypted
        .decrypt(passphrase.as_bytes())
        .map_err(|e| decrypt_error(e.to_string()))?;

    Ok(PrivateKey(document.as_bytes().to_vec()))
}

/// Rewrap a SEC1 `EC PRIVATE KEY` as PKCS#8, trying each supported curve until
/// ring accepts the result.
fn sec1_to_pkcs8(path: &Path, block: &str) -> Result<PrivateKey, TlsError> {
    let bad_key = |e: String| TlsError::BadKey(path.to_path_buf(), e);

    let (_, sec1) = pkcs8::der::pem::decode_vec(block.as_bytes()).map_err(|e| bad_key(e.to_string()))?;
    let sec1 = Zeroizing::new(sec1);

    for (curve, alg) in SEC1_CURVES.iter() {
        let info = PrivateKeyInfo {
            algorithm: AlgorithmIdentifierRef {
                oid: EC_PUBLIC_KEY,
                parameters: Some(curve.into()),
            },
            private_key: &sec1,
            public_key: None,
        };
        let der = Zeroizing::new(info.to_der().map_err(|e| bad_key(e.to_string()))?);

        if ring_sig::EcdsaKeyPair::from_pkcs8(*alg, &der).is_ok() {
            return Ok(PrivateKey(der.to_vec()));
        }
    }

    Err(bad_key("unsupported EC curve".to_string()))
}

/// Load a private key from `path`. Unencrypted RSA and PKCS#8 keys are used
/// directly and SEC1 EC keys are converted to PKCS#8; an encrypted PKCS#8 key
/// is decrypted with the passphrase from the sibling `.pass` file.
pub fn load_private_key(path: &Path) -> Result<PrivateKey, TlsError> {
    let content = read_file(path)?;
    let mut reader = BufReader::new(content.as_slice());

    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::Io(path.to_path_buf(), e))? {
            Some(Item::RSAKey(key)) | Some(Item::PKCS8Key(key)) => return Ok(PrivateKey(key)),
            Some(_) => continue,
            None => break,
        }
    }

    let text = String::from_utf8_lossy(&content);
    if let Some(block) = pem_block(&text, EC_KEY_LABEL) {
        return sec1_to_pkcs8(path, block);
    }
    match pem_block(&text, ENCRYPTED_KEY_LABEL) {
        Some(block) => decrypt_key(path, block),
        None => Err(TlsError::NoPrivateKey(path.to_path_buf())),
    }
}

/// The raw public key for a private key, where it can be worked out.
fn public_key_of(key: &PrivateKey) -> Option<Vec<u8>> {
    let der = key.0.as_slice();

    if let Ok(pair) = ring_sig::RsaKeyPair::from_pkcs8(der).or_else(|_| ring_sig::RsaKeyPair::from_der(der)) {
        return Some(pair.public_key().as_ref().to_vec());
    }
    for alg in [&ring_sig::ECDSA_P256_SHA256_ASN1_SIGNING, &ring_sig::ECDSA_P384_SHA384_ASN1_SIGNING] {
        if let Ok(pair) = ring_sig::EcdsaKeyPair::from_pkcs8(alg, der) {
            return Some(pair.public_key().as_ref().to_vec());
        }
    }
    if let Ok(pair) = ring_sig::Ed25519KeyPair::from_pkcs8_maybe_unchecked(der) {
        return Some(pair.public_key().as_ref().to_vec());
    }
    None
}

/// Check that `key` is the private half of the public key in `cert`.
pub fn check_key_matches(cert: &Certificate, key: &PrivateKey, cert_file: &Path) -> Result<(), TlsError> {
    let (_, parsed) = X509Certificate::from_der(&cert.0).map_err(|e| TlsError::BadCertificate(e.to_string()))?;

    match public_key_of(key) {
        Some(public) if public.as_slice() == parsed.public_key().subject_public_key.data => Ok(()),
        Some(_) => Err(TlsError::KeyMismatch(cert_file.to_path_buf())),
        None => {
            tracing::debug!(file = ?cert_file, "Cannot derive public key; skipping key match check");
            Ok(())
        }
    }
}

/// Load a certificate and its private key. Without a separate key file the key
/// is expected in the certificate file itself.
pub fn load_identity(cert_file: &Path, key_file: Option<&Path>) -> Result<Identity, TlsError> {
    let cert_chain = load_certificates(cert_file)?;
    let key = load_private_key(key_file.unwrap_or(cert_file))?;

    check_key_matches(&cert_chain[0], &key, cert_file)?;

    Ok(Identity { cert_chain, key })
}

/// Load a bundle of trusted root CA certificates.
pub fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let certs = load_certificates(path)?;
    let der: Vec<Vec<u8>> = certs.into_iter().map(|c| c.0).collect();

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(&der);
    tracing::debug!(?path, added, ignored, "Loaded root CA certificates");

    if added == 0 {
        return Err(TlsError::NoRootCertificates(path.to_path_buf()));
    }
    Ok(roots)
}

/// Build the process-wide server context.
///
/// With a root CA bundle, clients are asked for a certificate which is
/// verified against it; `require_client_cert` makes presenting one mandatory.
/// An unreadable bundle is logged and client verification left off.
pub fn server_config(
    identity: Identity,
    root_ca: Option<&Path>,
    require_client_cert: bool,
) -> Result<Arc<ServerConfig>, TlsError> {
    let builder = ServerConfig::builder().with_safe_defaults();

    let roots = root_ca.and_then(|path| match load_root_store(path) {
        Ok(roots) => Some(roots),
        Err(e) => {
            tracing::warn!(error = %e, "Cannot open root CA file");
            None
        }
    });

    let builder = match roots {
        Some(roots) => {
            tracing::info!("Enabled client certificate verification");
            let verifier = if require_client_cert {
                AllowAnyAuthenticatedClient::new(roots)
            } else {
                AllowAnyAnonymousOrAuthenticatedClient::new(roots)
            };
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(builder.with_single_cert(identity.cert_chain, identity.key)?))
}

/// Outbound connections report on whatever certificate the server presents,
/// rather than refusing to talk to it.
struct AcceptAnyServerCertVerifier;

impl ServerCertVerifier for AcceptAnyServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if X509Certificate::from_der(&end_entity.0).is_err() {
            Err(rustls::Error::InvalidCertificateEncoding)
        } else {
            Ok(ServerCertVerified::assertion())
        }
    }
}

/// Build a context for one outbound connection, optionally presenting a client
/// certificate. `send_sni` controls whether the server name is sent.
pub fn client_config(identity: Option<Identity>, send_sni: bool) -> Result<Arc<ClientConfig>, TlsError> {
    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCertVerifier));

    let mut config = match identity {
        Some(identity) => builder.with_single_cert(identity.cert_chain, identity.key)?,
        None => builder.with_no_client_auth(),
    };
    config.enable_sni = send_sni;

    Ok(Arc::new(config))
}

/// The name to present and expect for an outbound TLS connection.
pub fn server_name(name: &str) -> Result<ServerName, TlsError> {
    ServerName::try_from(name).map_err(|_| TlsError::InvalidServerName(name.to_string()))
}

/// Stands in for a server name when connecting by address alone. Never sent.
const UNNAMED_SERVER: &str = "unnamed.invalid";

/// The server name for a connection to `peer`, and whether to send it.
///
/// Without an explicit name the peer's address is used if it can serve as
/// one; otherwise a placeholder is used and SNI is switched off.
pub fn server_name_for(name: Option<&str>, peer: IpAddr) -> Result<(ServerName, bool), TlsError> {
    match name {
        Some(name) => Ok((server_name(name)?, true)),
        None => match server_name(&peer.to_string()) {
            Ok(name) => Ok((name, false)),
            Err(_) => Ok((server_name(UNNAMED_SERVER)?, false)),
        },
    }
}
