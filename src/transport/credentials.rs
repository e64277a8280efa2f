//! TLS credential materialization
//!
//! The secure transport needs a certificate, but peers never validate it;
//! encryption is the point, identity is not. A self-signed certificate and
//! key are written into the OS temp directory on first use and reloaded on
//! later runs, so every process on a host presents the same credential.
//!
//! The pair is loaded once per process and shared by every session.

use std::fs;
use std::path::PathBuf;

use once_cell::sync::OnceCell;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

const CERT_FILE: &str = "koisyn-cert.pem";
const KEY_FILE: &str = "koisyn-key.pem";

/// Certificate chain and private key presented by the listener side.
pub struct Credentials {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

static CREDENTIALS: OnceCell<Credentials> = OnceCell::new();

#[cfg(target_os = "android")]
fn temp_directory() -> PathBuf {
    // Android has no world-writable temp dir; mirror the convention of
    // keeping transient app data under /sdcard.
    PathBuf::from("/sdcard/tmp")
}

#[cfg(not(target_os = "android"))]
fn temp_directory() -> PathBuf {
    std::env::temp_dir()
}

/// Loads the process-wide credentials, generating and persisting them first
/// if the temp directory holds no usable pair.
pub fn load() -> crate::Result<&'static Credentials> {
    CREDENTIALS.get_or_try_init(|| {
        let dir = temp_directory();
        fs::create_dir_all(&dir)?;
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);

        if !(cert_path.exists() && key_path.exists()) {
            let generated = rcgen::generate_simple_self_signed(vec!["koisyn".into()])?;
            fs::write(&cert_path, generated.cert.pem())?;
            fs::write(&key_path, generated.key_pair.serialize_pem())?;
            tracing::info!("wrote transport credentials to {}", dir.display());
        }

        let cert_pem = fs::read(&cert_path)?;
        let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("failed to parse {}: {e}", cert_path.display()))?;
        if cert_chain.is_empty() {
            return Err(format!("no certificate in {}", cert_path.display()).into());
        }

        let key_pem = fs::read(&key_path)?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| format!("failed to parse {}: {e}", key_path.display()))?
            .ok_or_else(|| format!("no private key in {}", key_path.display()))?;

        Ok(Credentials { cert_chain, key })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_creates_and_reloads_the_same_pair() {
        let first = load().expect("credential materialization");
        assert!(!first.cert_chain.is_empty());

        // second call must hit the cache and hand back the same instance
        let second = load().unwrap();
        assert!(std::ptr::eq(first, second));

        // the files exist on disk for the next process
        let dir = temp_directory();
        assert!(dir.join(CERT_FILE).exists());
        assert!(dir.join(KEY_FILE).exists());
    }
}
