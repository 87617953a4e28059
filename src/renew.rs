use time::OffsetDateTime;

use crate::{
    cert::{self, CertificateResource},
    Client, Error, Result,
};

impl Client {
    /// Requests a new certificate for the domains of an issued one.
    ///
    /// When `resource` kept its CSR, the CSR is submitted again unchanged. Otherwise the domains
    /// are read from the certificate (common name first) and the stored private key, if any, is
    /// reused.
    pub async fn renew_certificate(
        &self,
        resource: &CertificateResource,
        bundle: bool,
        must_staple: bool,
    ) -> Result<CertificateResource> {
        let chain = cert::parse_pem_bundle(&resource.certificate)?;
        let leaf = chain
            .first()
            .ok_or_else(|| Error::protocol("no certificate to renew"))?;

        if cert::is_ca(leaf)? {
            return Err(Error::protocol(format!(
                "[{}] certificate bundle starts with a CA certificate",
                resource.domain
            )));
        }

        let hours_left = (cert::not_after(leaf)? - OffsetDateTime::now_utc()).whole_hours();
        log::info!(
            "[{}] acme: Trying renewal with {hours_left} hours remaining",
            resource.domain
        );

        if let Some(csr_pem) = &resource.csr {
            let csr_der = cert::csr_from_pem(csr_pem)?;
            return self.obtain_certificate_for_csr(&csr_der, bundle).await;
        }

        let domains = cert::certificate_domains(leaf)?;

        let key = resource
            .private_key
            .as_deref()
            .map(|pem| cert::private_key_from_pem(pem))
            .transpose()?;

        self.obtain_certificate(&domains, bundle, key, must_staple)
            .await
    }
}
