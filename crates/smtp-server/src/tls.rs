use crate::error::CertificateError;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, RsaKeySize, PKCS_RSA_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

const CERT_VALIDITY_DAYS: i64 = 365;
const CERT_SUBJECT: &str = "localhost";

/// Builds the STARTTLS acceptor, generating a self-signed pair first if either
/// PEM file is missing.
pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, CertificateError> {
    if cert_path.exists() && key_path.exists() {
        info!("Loading TLS certificate from {}", cert_path.display());
    } else {
        generate_self_signed(cert_path, key_path)?;
    }

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Writes a fresh `CN=localhost` certificate valid for a year, plus its
/// 4096-bit RSA key. Generating the key takes a noticeable moment.
pub fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<(), CertificateError> {
    let mut params = CertificateParams::new(vec![CERT_SUBJECT.to_string()])?;
    let mut subject = DistinguishedName::new();
    subject.push(DnType::CommonName, CERT_SUBJECT);
    params.distinguished_name = subject;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_4096)?;
    let cert = params.self_signed(&key_pair)?;

    for path in [cert_path, key_path] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| CertificateError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
    }
    write_pem(cert_path, &cert.pem())?;
    write_pem(key_path, &key_pair.serialize_pem())?;

    info!("Generated self-signed certificate at {}", cert_path.display());
    Ok(())
}

fn write_pem(path: &Path, pem: &str) -> Result<(), CertificateError> {
    fs::write(path, pem).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn open(path: &Path) -> Result<BufReader<File>, CertificateError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CertificateError::Io {
            path: path.to_path_buf(),
            source,
        })
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertificateError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(CertificateError::MissingCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CertificateError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CertificateError::MissingKey(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_missing_pair_then_reuses_it() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("nested/cert.pem");
        let key = dir.path().join("nested/key.pem");

        load_or_generate(&cert, &key).unwrap();
        assert!(cert.exists());
        assert!(key.exists());

        let first = fs::read_to_string(&cert).unwrap();
        load_or_generate(&cert, &key).unwrap();
        assert_eq!(fs::read_to_string(&cert).unwrap(), first);
    }

    #[test]
    fn generated_key_is_rsa_4096() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        generate_self_signed(&cert, &key).unwrap();

        let key_pair = KeyPair::from_pem(&fs::read_to_string(&key).unwrap()).unwrap();
        assert_eq!(key_pair.algorithm(), &PKCS_RSA_SHA256);
        // PKCS#8 DER of a 4096-bit RSA key is ~2.3 KiB; 2048-bit is ~1.2 KiB.
        assert!(key_pair.serialized_der().len() > 2000);
        assert!(!load_certs(&cert).unwrap().is_empty());
    }

    #[test]
    fn regenerates_when_key_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        fs::write(&cert, "stale").unwrap();

        load_or_generate(&cert, &key).unwrap();
        assert!(fs::read_to_string(&cert).unwrap().contains("BEGIN CERTIFICATE"));
        assert!(key.exists());
    }

    #[test]
    fn garbage_certificate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        fs::write(&cert, "not a certificate").unwrap();
        fs::write(&key, "not a key").unwrap();

        let result = load_or_generate(&cert, &key);
        assert!(matches!(result, Err(CertificateError::MissingCertificate(_))));
    }
}
