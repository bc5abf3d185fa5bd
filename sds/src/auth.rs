// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! SPIFFE stream authentication.
//!
//! The peer's verified certificate must carry a URI SAN of the form
//! `spiffe://<trust-domain>/ns/<ns>/dc/<dc>/svc/<svc>`, and the resulting
//! identity must be a gateway the read store knows. Failures log the
//! detail and return a deliberately vague `Unauthenticated` to the wire.

use std::fmt;

use consul::types::canonical_namespace;
use consul::GatewayId;
use tonic::Status;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::store::GatewayRegistry;

/// A parsed SPIFFE workload path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpiffePath {
    pub trust_domain: String,
    pub namespace: String,
    pub datacenter: String,
    pub service: String,
}

impl SpiffePath {
    /// Parse `spiffe://<trust-domain>/ns/<ns>/dc/<dc>/svc/<svc>`. The
    /// namespace is canonicalized (`default` becomes empty); any other
    /// shape is rejected.
    pub fn parse(uri: &str) -> Option<SpiffePath> {
        let rest = uri.strip_prefix("spiffe://")?;
        let (trust_domain, path) = rest.split_once('/')?;
        if trust_domain.is_empty() {
            return None;
        }
        let tokens: Vec<&str> = path.split('/').collect();
        match tokens.as_slice() {
            ["ns", namespace, "dc", datacenter, "svc", service]
                if !datacenter.is_empty() && !service.is_empty() =>
            {
                Some(SpiffePath {
                    trust_domain: trust_domain.to_owned(),
                    namespace: canonical_namespace(namespace).to_owned(),
                    datacenter: (*datacenter).to_owned(),
                    service: (*service).to_owned(),
                })
            }
            _ => None,
        }
    }

    pub fn gateway_id(&self) -> GatewayId {
        GatewayId::new(self.namespace.clone(), self.service.clone())
    }
}

impl fmt::Display for SpiffePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let namespace = match self.namespace.as_str() {
            "" => "default",
            ns => ns,
        };
        write!(
            f,
            "spiffe://{}/ns/{}/dc/{}/svc/{}",
            self.trust_domain, namespace, self.datacenter, self.service
        )
    }
}

/// URI SANs of a DER-encoded certificate.
pub fn certificate_uris(der: &[u8]) -> Result<Vec<String>, String> {
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der)
        .map_err(|err| format!("malformed peer certificate: {err}"))?;
    let mut uris = Vec::new();
    for extension in cert.extensions() {
        if let x509_parser::extensions::ParsedExtension::SubjectAlternativeName(san) =
            extension.parsed_extension()
        {
            for name in &san.general_names {
                if let GeneralName::URI(uri) = name {
                    uris.push((*uri).to_owned());
                }
            }
        }
    }
    Ok(uris)
}

/// Admit a stream: find a SPIFFE URI among the peer's verified certificate
/// SANs and resolve it to a known gateway.
pub fn authorize(
    store: &dyn GatewayRegistry,
    peer_certificates: &[Vec<u8>],
) -> Result<GatewayId, Status> {
    fn check(
        store: &dyn GatewayRegistry,
        peer_certificates: &[Vec<u8>],
    ) -> Result<GatewayId, String> {
        let der = peer_certificates
            .first()
            .ok_or("no peer certificate presented")?;
        let uris = certificate_uris(der)?;
        let path = uris
            .iter()
            .find_map(|uri| SpiffePath::parse(uri))
            .ok_or_else(|| format!("no valid SPIFFE URI among SANs {uris:?}"))?;
        let gateway = path.gateway_id();
        if !store.has_gateway(&gateway) {
            return Err(format!("unknown gateway {gateway}"));
        }
        Ok(gateway)
    }

    check(store, peer_certificates).map_err(|err| {
        log::error!("sds_auth_failure: {err}");
        Status::unauthenticated("unable to authorize connection")
    })
}

#[cfg(test)]
mod tests {
    use consul::GatewayId;

    use crate::store::MemoryGatewayRegistry;

    use super::{authorize, SpiffePath};

    #[test]
    fn parse_accepts_the_six_token_form_only() {
        let path =
            SpiffePath::parse("spiffe://trust.consul/ns/team1/dc/dc1/svc/gateway").unwrap();
        assert_eq!(path.trust_domain, "trust.consul");
        assert_eq!(path.namespace, "team1");
        assert_eq!(path.datacenter, "dc1");
        assert_eq!(path.service, "gateway");

        for invalid in [
            "spiffe://trust.consul/ns/team1/dc/dc1",
            "spiffe://trust.consul/ns/team1/dc/dc1/svc/",
            "spiffe://trust.consul/svc/gateway/dc/dc1/ns/team1",
            "spiffe:///ns/a/dc/b/svc/c",
            "https://trust.consul/ns/a/dc/b/svc/c",
            "spiffe://trust.consul/ns/a/dc/b/svc/c/extra",
            "",
        ] {
            assert!(SpiffePath::parse(invalid).is_none(), "accepted {invalid:?}");
        }
    }

    #[test]
    fn parse_canonicalizes_default_namespace() {
        let path = SpiffePath::parse("spiffe://trust/ns/default/dc/dc1/svc/gw").unwrap();
        assert_eq!(path.namespace, "");
        assert_eq!(path.gateway_id(), GatewayId::new("", "gw"));
    }

    /// parse → format → parse is the identity after canonicalizing
    /// `default` and the empty namespace.
    #[test]
    fn format_round_trips() {
        for uri in [
            "spiffe://trust/ns/default/dc/dc1/svc/gw",
            "spiffe://trust/ns/team1/dc/dc1/svc/gw",
        ] {
            let path = SpiffePath::parse(uri).unwrap();
            let formatted = path.to_string();
            let reparsed = SpiffePath::parse(&formatted).unwrap();
            assert_eq!(path, reparsed);
            assert_eq!(path.gateway_id(), reparsed.gateway_id());
        }
    }

    #[test]
    fn authorize_requires_known_gateway() {
        let store = MemoryGatewayRegistry::new();
        let certified = {
            let mut params = rcgen::CertificateParams::default();
            params.subject_alt_names.push(rcgen::SanType::URI(
                rcgen::Ia5String::try_from(
                    "spiffe://trust/ns/default/dc/testing/svc/client".to_owned(),
                )
                .unwrap(),
            ));
            let key = rcgen::KeyPair::generate().unwrap();
            params.self_signed(&key).unwrap()
        };
        let der = certified.der().to_vec();

        // Unknown gateway: rejected.
        let status = authorize(&store, &[der.clone()]).unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);

        // Known gateway: admitted with the canonical identity.
        store.add_gateway(GatewayId::new("", "client"));
        let gateway = authorize(&store, &[der]).unwrap();
        assert_eq!(gateway, GatewayId::new("default", "client"));

        // No certificate at all: rejected.
        assert!(authorize(&store, &[]).is_err());
    }
}
