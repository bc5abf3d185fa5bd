// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;

use consul::http::HttpConfig;
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct GatewayConfig {
    /// Service name this gateway registers as.
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct AuthConfig {
    /// ACL auth method to log in against.
    pub method: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// File holding the service-account bearer token.
    pub bearer_token_path: PathBuf,
}

#[derive(Deserialize, Debug)]
pub struct SdsConfig {
    #[serde(default = "default_sds_address")]
    pub address: String,
    #[serde(default = "default_sds_port")]
    pub port: u16,
}

impl Default for SdsConfig {
    fn default() -> Self {
        SdsConfig {
            address: default_sds_address(),
            port: default_sds_port(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct EnvoyConfig {
    #[serde(default = "default_envoy_binary")]
    pub binary_path: PathBuf,
    pub bootstrap_path: PathBuf,
    /// Control-plane xDS endpoint for the proxy's ADS connection.
    pub xds_address: String,
    #[serde(default = "default_xds_port")]
    pub xds_port: u16,
    #[serde(default = "default_admin_address")]
    pub admin_address: String,
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    #[serde(default = "default_ready_port")]
    pub ready_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit one JSON object per line instead of human-readable lines.
    #[serde(default)]
    pub json: bool,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// Control-plane connection.
    pub consul: HttpConfig,

    pub gateway: GatewayConfig,

    pub auth: AuthConfig,

    /// Writable directory for certificates and SDS resource files.
    pub certs_directory: PathBuf,

    #[serde(default)]
    pub sds: SdsConfig,

    pub envoy: EnvoyConfig,

    /// Listeners the gateway exposes, one named port each.
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Upstreams whose discovery chains drive intention reconciliation.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Secret names this gateway is allowed to fetch over SDS.
    #[serde(default)]
    pub secrets: Vec<String>,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Deserialize, Debug)]
pub struct ListenerConfig {
    pub name: String,
    #[serde(default = "default_listener_address")]
    pub address: String,
    pub port: u16,
}

fn default_listener_address() -> String {
    "0.0.0.0".to_owned()
}

#[derive(Deserialize, Debug)]
pub struct UpstreamConfig {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl Config {
    pub fn from_str(raw_config: &str) -> Result<Config, String> {
        serde_yaml::from_str(raw_config).map_err(|e| format!("config parse error: {e}"))
    }
}

fn default_sds_address() -> String {
    "localhost".to_owned()
}

fn default_sds_port() -> u16 {
    9090
}

fn default_envoy_binary() -> PathBuf {
    PathBuf::from("envoy")
}

fn default_xds_port() -> u16 {
    8502
}

fn default_admin_address() -> String {
    "127.0.0.1".to_owned()
}

fn default_admin_port() -> u16 {
    19000
}

fn default_ready_port() -> u16 {
    19001
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> String {
    "text".to_owned()
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let raw = "
consul:
  address: consul.service.consul
  port: 8501
  tls: true
gateway:
  name: api-gateway
  namespace: team1
auth:
  method: gateway-auth
  bearer_token_path: /var/run/secrets/token
certs_directory: /certs
envoy:
  bootstrap_path: /certs/bootstrap.json
  xds_address: consul.service.consul
upstreams:
  - name: billing
    namespace: team2
secrets:
  - file:///certs/site
";
        let config = Config::from_str(raw).unwrap();
        assert_eq!(config.consul.port, 8501);
        assert!(config.consul.tls);
        assert_eq!(config.gateway.name, "api-gateway");
        assert_eq!(config.sds.port, 9090);
        assert_eq!(config.envoy.xds_port, 8502);
        assert_eq!(config.envoy.admin_port, 19000);
        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.upstreams[0].namespace, "team2");
        assert_eq!(config.secrets, vec!["file:///certs/site".to_owned()]);
        assert!(!config.log.json);
    }

    #[test]
    fn rejects_malformed_config() {
        assert!(Config::from_str("gateway: [not, a, map]").is_err());
    }
}
