//! Shared, read-only interception state.

use bytes::Bytes;

use crate::ca::CertificateAuthority;
use crate::error::ConfigError;
use crate::placeholder::PlaceholderAsset;

/// Everything a connection needs that is fixed at startup: the root
/// authority and the placeholder image.
///
/// Built once and shared behind an `Arc`.
#[derive(Debug)]
pub struct InterceptContext {
    authority: CertificateAuthority,
    placeholder: PlaceholderAsset,
}

impl InterceptContext {
    pub fn new(authority: CertificateAuthority, placeholder: PlaceholderAsset) -> Self {
        Self {
            authority,
            placeholder,
        }
    }

    /// Loads the context from raw PEM and image bytes.
    pub fn load(
        cert_pem: &[u8],
        key_pem: &[u8],
        placeholder: impl Into<Bytes>,
    ) -> Result<Self, ConfigError> {
        let authority = CertificateAuthority::load(cert_pem, key_pem)?;
        let placeholder = PlaceholderAsset::from_bytes(placeholder)?;
        Ok(Self::new(authority, placeholder))
    }

    pub fn authority(&self) -> &CertificateAuthority {
        &self.authority
    }

    pub fn placeholder(&self) -> &PlaceholderAsset {
        &self.placeholder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholder::tests::TINY_PNG;

    #[test]
    fn load_validates_every_input() {
        let root = CertificateAuthority::generate("Test CA").unwrap();

        let context =
            InterceptContext::load(root.cert_pem.as_bytes(), root.key_pem.as_bytes(), TINY_PNG)
                .unwrap();
        assert_eq!(context.placeholder().len(), TINY_PNG.len());
        assert!(context.authority().root_pem().contains("BEGIN CERTIFICATE"));

        let err = InterceptContext::load(root.cert_pem.as_bytes(), root.key_pem.as_bytes(), &b"nope"[..])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPlaceholder(_)));

        let err = InterceptContext::load(b"", root.key_pem.as_bytes(), TINY_PNG).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCertificate(_)));
    }
}
