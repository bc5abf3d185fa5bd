// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! HTTP implementation of the control-plane client traits.
//!
//! Reads that support blocking queries carry `index`/`wait` parameters and
//! report the raft index from the `X-Consul-Index` response header.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::{
    AclClient, AgentClient, Client, ConfigEntryClient, ConnectCaClient, DiscoveryChainClient,
};
use crate::error::Error;
use crate::types::{
    AclToken, AgentService, CaRoot, CaRootSet, CheckStatus, DiscoveryChain, IntentionAction,
    IntentionSource, LeafCert, QueryMeta, QueryOptions, ServiceIntentionsEntry, ServiceName,
    ServiceRegistration, SERVICE_INTENTIONS_KIND,
};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Connection settings for the control plane.
#[derive(Clone, Debug, Deserialize)]
pub struct HttpConfig {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    /// PEM bundle to trust for the control plane's own certificate.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
}

pub struct HttpClient {
    base_url: String,
    #[allow(dead_code)]
    namespace: Option<String>,
    partition: Option<String>,
    http: reqwest::Client,
    token: ArcSwap<String>,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self, Error> {
        let scheme = if config.tls { "https" } else { "http" };
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(ca_file).map_err(|err| {
                Error::InvalidInput(format!("unable to read CA file {}: {err}", ca_file.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|err| Error::InvalidInput(format!("invalid CA certificate: {err}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|err| Error::transport("client setup", err))?;
        Ok(HttpClient {
            base_url: format!("{scheme}://{}:{}", config.address, config.port),
            namespace: config.namespace.clone(),
            partition: config.partition.clone(),
            http,
            token: ArcSwap::from_pointee(String::new()),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{path}", self.base_url));
        let token = self.token.load();
        if !token.is_empty() {
            req = req.header(TOKEN_HEADER, token.as_str());
        }
        req
    }

    fn apply_query_options(
        mut req: reqwest::RequestBuilder,
        options: &QueryOptions,
    ) -> reqwest::RequestBuilder {
        if options.min_index > 0 {
            req = req.query(&[("index", options.min_index.to_string())]);
            if let Some(wait) = options.wait {
                req = req.query(&[("wait", format!("{}s", wait.as_secs()))]);
            }
        }
        if let Some(ns) = &options.namespace {
            req = req.query(&[("ns", ns.as_str())]);
        }
        if let Some(partition) = &options.partition {
            req = req.query(&[("partition", partition.as_str())]);
        }
        req
    }

    fn namespace_query(&self, namespace: &str) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if !namespace.is_empty() {
            query.push(("ns", namespace.to_owned()));
        }
        if let Some(partition) = &self.partition {
            query.push(("partition", partition.clone()));
        }
        query
    }

    async fn send(
        &self,
        operation: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<(reqwest::Response, QueryMeta), Error> {
        let response = req
            .send()
            .await
            .map_err(|err| Error::transport(operation, err))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::from_status(operation, status.as_u16(), message));
        }
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        Ok((response, QueryMeta { index }))
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<T, Error> {
        response
            .json()
            .await
            .map_err(|err| Error::transport(operation, format!("decoding response: {err}")))
    }
}

impl Client for HttpClient {
    fn set_token(&self, token: &str) {
        self.token.store(std::sync::Arc::new(token.to_owned()));
    }
}

// ---------------------------------------------------------------------------------------
// Wire representations
// ---------------------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LoginRequest<'a> {
    auth_method: &'a str,
    bearer_token: &'a str,
    meta: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoginResponse {
    #[serde(rename = "AccessorID")]
    accessor_id: String,
    #[serde(rename = "SecretID")]
    secret_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckWire {
    #[serde(rename = "CheckID")]
    check_id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "TCP")]
    tcp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deregister_critical_service_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "TTL")]
    ttl: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterWire<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    partition: Option<&'a str>,
    kind: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    meta: &'a HashMap<String, String>,
    checks: Vec<CheckWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceWire {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckUpdateWire<'a> {
    status: CheckStatus,
    output: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CaRootWire {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    root_cert: String,
    #[serde(default)]
    active: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CaRootsWire {
    #[serde(rename = "ActiveRootID")]
    active_root_id: String,
    #[serde(default)]
    trust_domain: String,
    #[serde(default)]
    roots: Vec<CaRootWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LeafCertWire {
    serial_number: String,
    #[serde(rename = "CertPEM")]
    cert_pem: String,
    #[serde(rename = "PrivateKeyPEM")]
    private_key_pem: String,
    valid_after: String,
    valid_before: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiscoveryTargetWire {
    service: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiscoveryChainInnerWire {
    service_name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    targets: HashMap<String, DiscoveryTargetWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiscoveryChainWire {
    chain: DiscoveryChainInnerWire,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IntentionSourceWire {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    action: IntentionAction,
    #[serde(default)]
    description: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceIntentionsWire {
    kind: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default)]
    sources: Vec<IntentionSourceWire>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    meta: HashMap<String, String>,
    #[serde(default, skip_serializing)]
    modify_index: u64,
}

/// RFC 3339 timestamps as Consul renders them, without pulling in a full
/// datetime stack: seconds precision is all the rotation logic needs.
fn parse_rfc3339(value: &str, operation: &str) -> Result<SystemTime, Error> {
    let date_and_rest = value.split_once('T').ok_or_else(|| {
        Error::transport(operation, format!("malformed timestamp {value:?}"))
    })?;
    let mut date_parts = date_and_rest.0.splitn(3, '-');
    let (year, month, day) = match (date_parts.next(), date_parts.next(), date_parts.next()) {
        (Some(y), Some(m), Some(d)) => (
            y.parse::<i64>(),
            m.parse::<u32>(),
            d.parse::<u32>(),
        ),
        _ => {
            return Err(Error::transport(
                operation,
                format!("malformed timestamp {value:?}"),
            ))
        }
    };
    let time_str: String = date_and_rest
        .1
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ':')
        .collect();
    let mut time_parts = time_str.splitn(3, ':');
    let (hour, minute, second) = match (time_parts.next(), time_parts.next(), time_parts.next()) {
        (Some(h), Some(m), Some(s)) => (h.parse::<u64>(), m.parse::<u64>(), s.parse::<u64>()),
        _ => {
            return Err(Error::transport(
                operation,
                format!("malformed timestamp {value:?}"),
            ))
        }
    };
    match (year, month, day, hour, minute, second) {
        (Ok(year), Ok(month), Ok(day), Ok(hour), Ok(minute), Ok(second))
            if (1970..=9999).contains(&year) && (1..=12).contains(&month) && (1..=31).contains(&day) =>
        {
            let days = days_from_epoch(year, month, day);
            let secs = days * 86_400 + hour * 3_600 + minute * 60 + second;
            Ok(UNIX_EPOCH + Duration::from_secs(secs))
        }
        _ => Err(Error::transport(
            operation,
            format!("malformed timestamp {value:?}"),
        )),
    }
}

fn days_from_epoch(year: i64, month: u32, day: u32) -> u64 {
    const CUMULATIVE_DAYS: [u64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
    let leap_years_before = |y: i64| (y - 1) / 4 - (y - 1) / 100 + (y - 1) / 400;
    let is_leap = year % 4 == 0 && (year % 100 != 0 || year % 400 == 0);
    let mut days = (year - 1970) as u64 * 365
        + (leap_years_before(year) - leap_years_before(1970)) as u64
        + CUMULATIVE_DAYS[(month - 1) as usize]
        + (day - 1) as u64;
    if is_leap && month > 2 {
        days += 1;
    }
    days
}

// ---------------------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------------------

#[async_trait]
impl AclClient for HttpClient {
    async fn login(
        &self,
        auth_method: &str,
        namespace: Option<&str>,
        bearer_token: &str,
        meta: &HashMap<String, String>,
    ) -> Result<AclToken, Error> {
        const OPERATION: &str = "acl login";
        let mut req = self.request(reqwest::Method::POST, "/v1/acl/login");
        if let Some(ns) = namespace {
            if !ns.is_empty() {
                req = req.query(&[("ns", ns)]);
            }
        }
        let req = req.json(&LoginRequest {
            auth_method,
            bearer_token,
            meta,
        });
        let (response, _) = self.send(OPERATION, req).await?;
        let body: LoginResponse = Self::decode(OPERATION, response).await?;
        Ok(AclToken {
            accessor_id: body.accessor_id,
            secret_id: body.secret_id,
        })
    }
}

fn duration_to_consul(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}

#[async_trait]
impl AgentClient for HttpClient {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<(), Error> {
        const OPERATION: &str = "register service";
        let mut checks = Vec::new();
        if let Some(tcp) = &registration.tcp_check {
            checks.push(CheckWire {
                check_id: tcp.check_id.clone(),
                name: tcp.name.clone(),
                tcp: Some(tcp.tcp.clone()),
                interval: Some(duration_to_consul(tcp.interval)),
                deregister_critical_service_after: tcp
                    .deregister_critical_after
                    .map(duration_to_consul),
                ttl: None,
            });
        }
        if let Some(ttl) = &registration.ttl_check {
            checks.push(CheckWire {
                check_id: ttl.check_id.clone(),
                name: ttl.name.clone(),
                tcp: None,
                interval: None,
                deregister_critical_service_after: None,
                ttl: Some(duration_to_consul(ttl.ttl)),
            });
        }
        let wire = RegisterWire {
            id: &registration.id,
            name: &registration.name,
            namespace: registration.namespace.as_deref().filter(|ns| !ns.is_empty()),
            partition: registration.partition.as_deref(),
            kind: &registration.kind,
            address: &registration.address,
            port: registration.port,
            tags: &registration.tags,
            meta: &registration.meta,
            checks,
        };
        let req = self
            .request(reqwest::Method::PUT, "/v1/agent/service/register")
            .json(&wire);
        self.send(OPERATION, req).await.map(|_| ())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<(), Error> {
        let req = self.request(
            reqwest::Method::PUT,
            &format!("/v1/agent/service/deregister/{service_id}"),
        );
        self.send("deregister service", req).await.map(|_| ())
    }

    async fn service(&self, service_id: &str) -> Result<AgentService, Error> {
        const OPERATION: &str = "read service";
        let req = self.request(
            reqwest::Method::GET,
            &format!("/v1/agent/service/{service_id}"),
        );
        let (response, _) = self.send(OPERATION, req).await?;
        let body: AgentServiceWire = Self::decode(OPERATION, response).await?;
        Ok(AgentService {
            id: body.id,
            name: body.service,
            namespace: body.namespace,
            address: body.address,
            port: body.port,
        })
    }

    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: CheckStatus,
    ) -> Result<(), Error> {
        let req = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/agent/check/update/{check_id}"),
            )
            .json(&CheckUpdateWire { status, output });
        self.send("update ttl check", req).await.map(|_| ())
    }
}

#[async_trait]
impl ConnectCaClient for HttpClient {
    async fn ca_roots(&self, options: &QueryOptions) -> Result<(CaRootSet, QueryMeta), Error> {
        const OPERATION: &str = "read ca roots";
        let req = self.request(reqwest::Method::GET, "/v1/agent/connect/ca/roots");
        let req = Self::apply_query_options(req, options);
        let (response, meta) = self.send(OPERATION, req).await?;
        let body: CaRootsWire = Self::decode(OPERATION, response).await?;
        let trust_domain = body.trust_domain;
        let roots = body
            .roots
            .into_iter()
            .map(|root| CaRoot {
                id: root.id,
                name: root.name,
                pem_cert: root.root_cert,
                active: root.active,
                trust_domain: trust_domain.clone(),
            })
            .collect();
        Ok((
            CaRootSet {
                active_root_id: body.active_root_id,
                roots,
            },
            meta,
        ))
    }

    async fn leaf_cert(
        &self,
        service: &str,
        options: &QueryOptions,
    ) -> Result<(LeafCert, QueryMeta), Error> {
        const OPERATION: &str = "read leaf cert";
        let req = self.request(
            reqwest::Method::GET,
            &format!("/v1/agent/connect/ca/leaf/{service}"),
        );
        let req = Self::apply_query_options(req, options);
        let (response, meta) = self.send(OPERATION, req).await?;
        let body: LeafCertWire = Self::decode(OPERATION, response).await?;
        Ok((
            LeafCert {
                pem_cert: body.cert_pem,
                pem_key: body.private_key_pem,
                not_before: parse_rfc3339(&body.valid_after, OPERATION)?,
                not_after: parse_rfc3339(&body.valid_before, OPERATION)?,
                serial: body.serial_number,
            },
            meta,
        ))
    }
}

#[async_trait]
impl DiscoveryChainClient for HttpClient {
    async fn discovery_chain(
        &self,
        service: &ServiceName,
        options: &QueryOptions,
    ) -> Result<(DiscoveryChain, QueryMeta), Error> {
        const OPERATION: &str = "read discovery chain";
        let req = self.request(
            reqwest::Method::GET,
            &format!("/v1/discovery-chain/{}", service.name),
        );
        let mut options = options.clone();
        if options.namespace.is_none() && !service.canonical_namespace().is_empty() {
            options.namespace = Some(service.canonical_namespace().to_owned());
        }
        let req = Self::apply_query_options(req, &options);
        let (response, meta) = self.send(OPERATION, req).await?;
        let body: DiscoveryChainWire = Self::decode(OPERATION, response).await?;
        let mut targets: Vec<ServiceName> = body
            .chain
            .targets
            .into_values()
            .map(|target| ServiceName::new(target.namespace, target.service))
            .collect();
        targets.sort();
        targets.dedup();
        Ok((
            DiscoveryChain {
                service_name: body.chain.service_name,
                namespace: body.chain.namespace,
                targets,
            },
            meta,
        ))
    }
}

#[async_trait]
impl ConfigEntryClient for HttpClient {
    async fn get_service_intentions(
        &self,
        service: &ServiceName,
    ) -> Result<(ServiceIntentionsEntry, QueryMeta), Error> {
        const OPERATION: &str = "read service-intentions";
        let req = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/config/{SERVICE_INTENTIONS_KIND}/{}", service.name),
            )
            .query(&self.namespace_query(service.canonical_namespace()));
        let (response, _) = self.send(OPERATION, req).await?;
        let body: ServiceIntentionsWire = Self::decode(OPERATION, response).await?;
        let modify_index = body.modify_index;
        Ok((
            ServiceIntentionsEntry {
                name: body.name,
                namespace: body.namespace,
                sources: body
                    .sources
                    .into_iter()
                    .map(|source| IntentionSource {
                        name: source.name,
                        namespace: source.namespace.unwrap_or_default(),
                        action: source.action,
                        description: source.description,
                    })
                    .collect(),
                meta: body.meta,
            },
            // The entry's own modify index is what CAS writes key on.
            QueryMeta {
                index: modify_index,
            },
        ))
    }

    async fn put_service_intentions_cas(
        &self,
        entry: &ServiceIntentionsEntry,
        index: u64,
    ) -> Result<bool, Error> {
        const OPERATION: &str = "write service-intentions";
        let wire = ServiceIntentionsWire {
            kind: SERVICE_INTENTIONS_KIND.to_owned(),
            name: entry.name.clone(),
            namespace: entry.namespace.clone().filter(|ns| !ns.is_empty()),
            sources: entry
                .sources
                .iter()
                .map(|source| IntentionSourceWire {
                    name: source.name.clone(),
                    namespace: match source.namespace.as_str() {
                        "" => None,
                        ns => Some(ns.to_owned()),
                    },
                    action: source.action,
                    description: source.description.clone(),
                })
                .collect(),
            meta: entry.meta.clone(),
            modify_index: 0,
        };
        let req = self
            .request(reqwest::Method::PUT, "/v1/config")
            .query(&[("cas", index.to_string())])
            .json(&wire);
        let (response, _) = self.send(OPERATION, req).await?;
        Self::decode(OPERATION, response).await
    }

    async fn delete_service_intentions(&self, service: &ServiceName) -> Result<(), Error> {
        let req = self
            .request(
                reqwest::Method::DELETE,
                &format!("/v1/config/{SERVICE_INTENTIONS_KIND}/{}", service.name),
            )
            .query(&self.namespace_query(service.canonical_namespace()));
        self.send("delete service-intentions", req).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::parse_rfc3339;

    #[test]
    fn parses_consul_timestamps() {
        let epoch = parse_rfc3339("1970-01-01T00:00:00Z", "test").unwrap();
        assert_eq!(epoch, UNIX_EPOCH);

        // 2023-03-01T12:30:45Z
        let t = parse_rfc3339("2023-03-01T12:30:45.123Z", "test").unwrap();
        let expected = UNIX_EPOCH + Duration::from_secs(1_677_673_845);
        assert_eq!(t, expected);

        assert!(parse_rfc3339("not-a-timestamp", "test").is_err());
        assert!(parse_rfc3339("2023-13-01T00:00:00Z", "test").is_err());
    }
}
