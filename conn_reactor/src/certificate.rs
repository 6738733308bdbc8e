use chrono::{DateTime, TimeZone, Utc};
use sha1::{Digest, Sha1};
use std::fmt::Write;
use x509_parser::prelude::*;

/// What a peer's certificate says about it, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    pub subject: String,
    pub issuer: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    /// Hex-encoded SHA-1 digest of the DER certificate
    pub fingerprint: String,
    pub full_text: String,
}

fn to_utc(time: &ASN1Time) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(time.timestamp(), 0).single()
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map_or_else(|| "(invalid)".to_string(), |t| t.format("%b %e %H:%M:%S %Y GMT").to_string())
}

impl PeerCertificate {
    /// Decode a DER certificate. Returns `None` if it doesn't parse.
    pub fn from_der(der: &[u8]) -> Option<Self> {
        let (_, cert) = X509Certificate::from_der(der).ok()?;

        let subject = cert.subject().to_string();
        let issuer = cert.issuer().to_string();
        let not_before = to_utc(&cert.validity().not_before);
        let not_after = to_utc(&cert.validity().not_after);

        let mut hasher = Sha1::new();
        hasher.update(der);
        let fingerprint = hex::encode(hasher.finalize());

        let full_text = describe(&cert, not_before, not_after, &fingerprint);

        Some(Self {
            subject,
            issuer,
            not_before,
            not_after,
            fingerprint,
            full_text,
        })
    }

    /// Is `now` inside the certificate's validity period?
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match (self.not_before, self.not_after) {
            (Some(start), Some(end)) => start <= now && now <= end,
            _ => false,
        }
    }
}

fn describe(
    cert: &X509Certificate<'_>,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
    fingerprint: &str,
) -> String {
    let mut text = String::new();

    // Writing to a String can't fail
    let _ = writeln!(text, "Certificate:");
    let _ = writeln!(text, "    Data:");
    let _ = writeln!(text, "        Version: {}", cert.version().0 + 1);
    let _ = writeln!(text, "        Serial Number: {}", cert.raw_serial_as_string());
    let _ = writeln!(text, "        Signature Algorithm: {}", cert.signature_algorithm.algorithm);
    let _ = writeln!(text, "        Issuer: {}", cert.issuer());
    let _ = writeln!(text, "        Validity");
    let _ = writeln!(text, "            Not Before: {}", format_time(not_before));
    let _ = writeln!(text, "            Not After : {}", format_time(not_after));
    let _ = writeln!(text, "        Subject: {}", cert.subject());
    let _ = writeln!(text, "        Subject Public Key Info:");
    let _ = writeln!(text, "            Public Key Algorithm: {}", cert.public_key().algorithm.algorithm);

    let extensions = cert.extensions();
    if !extensions.is_empty() {
        let _ = writeln!(text, "        X509v3 extensions:");
        for ext in extensions {
            let _ = writeln!(
                text,
                "            {}{}",
                ext.oid,
                if ext.critical { " (critical)" } else { "" }
            );
        }
    }
    let _ = writeln!(text, "    SHA1 Fingerprint: {}", fingerprint);

    text
}
