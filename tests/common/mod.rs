//! Shared helpers for integration tests.

#![allow(dead_code)]

use logmesh::TlsFiles;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use std::path::Path;
use std::time::Duration;

/// Poll `check` every `tick` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, tick: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(tick).await;
    }
}

/// Convergence window used by cluster tests.
pub async fn converges(check: impl FnMut() -> bool) -> bool {
    eventually(Duration::from_secs(3), Duration::from_millis(250), check).await
}

/// A throwaway CA that issues certificates into a directory.
pub struct TestPki {
    ca_cert: Certificate,
    ca_key: KeyPair,
    dir: std::path::PathBuf,
}

impl TestPki {
    pub fn new(dir: &Path) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "logmesh test ca");
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = params.self_signed(&ca_key).unwrap();
        std::fs::write(dir.join("ca.pem"), ca_cert.pem()).unwrap();

        Self {
            ca_cert,
            ca_key,
            dir: dir.to_path_buf(),
        }
    }

    /// Issue a certificate for `common_name`, valid for localhost.
    pub fn issue(&self, common_name: &str) -> TlsFiles {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        let cert_file = self.dir.join(format!("{}.pem", common_name));
        let key_file = self.dir.join(format!("{}-key.pem", common_name));
        std::fs::write(&cert_file, cert.pem()).unwrap();
        std::fs::write(&key_file, key.serialize_pem()).unwrap();

        TlsFiles {
            cert_file: Some(cert_file),
            key_file: Some(key_file),
            ca_file: Some(self.dir.join("ca.pem")),
            server_name: "localhost".to_string(),
        }
    }
}

/// Write an ACL model and a policy granting `rules` (`subject, action`).
pub fn write_acl(dir: &Path, rules: &[(&str, &str)]) -> (std::path::PathBuf, std::path::PathBuf) {
    let model = dir.join("model.conf");
    std::fs::write(
        &model,
        "[request_definition]\nr = sub, obj, act\n\n[policy_definition]\np = sub, obj, act\n",
    )
    .unwrap();

    let policy = dir.join("policy.csv");
    let lines: Vec<String> = rules
        .iter()
        .map(|(subject, action)| format!("p, {}, *, {}", subject, action))
        .collect();
    std::fs::write(&policy, lines.join("\n")).unwrap();

    (model, policy)
}
