//! Building rustls configurations from [`TlsSettings`].

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::WantsClientCert;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, ConfigBuilder, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};

use crate::config::TlsSettings;
use crate::error::WeftError;

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Map a protocol name to the versions it enables.
pub fn protocol_versions(name: &str) -> Result<&'static [&'static SupportedProtocolVersion], WeftError> {
    static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
    static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
    match name.to_ascii_uppercase().as_str() {
        "TLS" | "" => Ok(rustls::ALL_VERSIONS),
        "TLSV1.2" => Ok(TLS12_ONLY),
        "TLSV1.3" => Ok(TLS13_ONLY),
        _ => Err(WeftError::Config(format!("unsupported tls protocol: {name}"))),
    }
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, WeftError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(WeftError::Config(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, WeftError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| WeftError::Config(format!("no private key in {}", path.display())))
}

/// Server configuration from `settings.cert_path` / `settings.key_path`.
/// With `settings.ca_path` set, clients must present a certificate
/// issued by one of those roots.
pub fn server_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>, WeftError> {
    let (Some(cert), Some(key)) = (&settings.cert_path, &settings.key_path) else {
        return Err(WeftError::Config("tls server needs cert_path and key_path".into()));
    };
    let (certs, key) = (load_certs(cert)?, load_private_key(key)?);
    match &settings.ca_path {
        Some(ca) => mutual_server_config(&settings.protocol, certs, key, load_certs(ca)?),
        None => server_config_from(&settings.protocol, certs, key),
    }
}

pub fn server_config_from(
    protocol: &str,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, WeftError> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(protocol_versions(protocol)?)?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// A server that rejects clients without a certificate chaining to
/// `client_roots`.
pub fn mutual_server_config(
    protocol: &str,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Vec<CertificateDer<'static>>,
) -> Result<Arc<ServerConfig>, WeftError> {
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(client_roots)?), provider())
        .build()
        .map_err(|e| WeftError::Config(format!("client verifier: {e}")))?;
    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(protocol_versions(protocol)?)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Client configuration: trust everything with `trust_peer`, otherwise
/// the roots in `ca_path`. Presents `cert_path` / `key_path` when both
/// are set.
pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>, WeftError> {
    let versions = protocol_versions(&settings.protocol)?;
    let builder = if settings.trust_peer {
        ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(versions)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustPeerVerifier))
    } else {
        let Some(ca) = &settings.ca_path else {
            return Err(WeftError::Config("tls client needs ca_path or trust_peer".into()));
        };
        ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(versions)?
            .with_root_certificates(root_store(load_certs(ca)?)?)
    };
    let identity = match (&settings.cert_path, &settings.key_path) {
        (Some(cert), Some(key)) => Some((load_certs(cert)?, load_private_key(key)?)),
        _ => None,
    };
    with_identity(builder, identity)
}

pub fn client_config_with_roots(
    protocol: &str,
    roots: Vec<CertificateDer<'static>>,
) -> Result<Arc<ClientConfig>, WeftError> {
    client_config_from(protocol, roots, None)
}

/// A client that presents `certs` when the server asks for one.
pub fn client_config_with_identity(
    protocol: &str,
    roots: Vec<CertificateDer<'static>>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ClientConfig>, WeftError> {
    client_config_from(protocol, roots, Some((certs, key)))
}

type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn client_config_from(
    protocol: &str,
    roots: Vec<CertificateDer<'static>>,
    identity: Option<Identity>,
) -> Result<Arc<ClientConfig>, WeftError> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(protocol_versions(protocol)?)?
        .with_root_certificates(root_store(roots)?);
    with_identity(builder, identity)
}

fn with_identity(
    builder: ConfigBuilder<ClientConfig, WantsClientCert>,
    identity: Option<Identity>,
) -> Result<Arc<ClientConfig>, WeftError> {
    let config = match identity {
        Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

fn root_store(roots: Vec<CertificateDer<'static>>) -> Result<RootCertStore, WeftError> {
    let mut store = RootCertStore::empty();
    for cert in roots {
        store.add(cert)?;
    }
    Ok(store)
}

pub fn server_name(name: &str) -> Result<ServerName<'static>, WeftError> {
    ServerName::try_from(name.to_string())
        .map_err(|_| WeftError::Config(format!("invalid tls server name: {name}")))
}

// ── Trust-peer verifier ──────────────────────────────────────────

/// Accepts any server certificate. Only for links where both ends are
/// operated together.
#[derive(Debug)]
struct TrustPeerVerifier;

impl ServerCertVerifier for TrustPeerVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
